//! Pure reconnection decisions and connection state tracking

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another connection attempt should be made
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::Established => ConnectionState::Connected,
            ConnectionEvent::Lost(reason) => ConnectionState::Disconnected(reason),
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Snapshot of session health for logging
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();
        HealthMetrics {
            uptime: connect_time.map(|t| now.duration_since(t)),
            time_since_last_message: last_message_time.map(|t| now.duration_since(t)),
            reconnect_count,
        }
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "Connection lost");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "Connection attempt failed");
            }
            _ => {
                info!("Connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Events that move [`ConnectionState`]
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established,
    Lost(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    pub reconnect_count: u32,
}
