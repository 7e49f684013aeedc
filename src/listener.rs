//! Long-running listener: persistence, token policy and reconnection
//!
//! The listener owns one [`FbnsClient`] for its whole life and reconnects it
//! with the configured backoff whenever the transport drops. Credentials
//! are written to the session file as soon as CONNACK delivers them, ahead
//! of registration, so a crash mid-handshake never loses them.

use crate::client::{ClientError, EventHandlers, FbnsClient, RunOutcome};
use crate::config::FbnsConfig;
use crate::error::{sanitize_for_log, FbnsError, FbnsResult};
use crate::protocol::connect::ConnectOptions;
use crate::protocol::notification::PushNotification;
use crate::session::{SessionState, SessionStore, TokenPolicy};
use crate::transport::mqtt::{HealthMonitor, MqttClient, ReconnectConfig, ReconnectionDecision};
use crate::transport::Transport;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

/// Upper bound keeping the refresh window inside chrono's range
const MAX_REFRESH_HOURS: i64 = 24 * 365 * 100;

/// What the listener hands to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Push(PushNotification),
    /// A token the application should forward to its backend
    NewToken(String),
}

/// State shared with the client's handler closures
#[derive(Debug, Default)]
struct Shared {
    session: SessionState,
    last_message: Option<Instant>,
    authenticated: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Listener<T: Transport = MqttClient> {
    config: FbnsConfig,
    transport: T,
    store: SessionStore,
    policy: TokenPolicy,
    reconnect: ReconnectConfig,
}

impl Listener<MqttClient> {
    pub fn new(config: FbnsConfig) -> FbnsResult<Self> {
        config.validate()?;
        let transport = MqttClient::new(&config.server)?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: Transport> Listener<T> {
    pub fn with_transport(config: FbnsConfig, transport: T) -> Self {
        let store = SessionStore::new(&config.session.state_file);
        let hours = i64::try_from(config.session.token_refresh_hours)
            .unwrap_or(MAX_REFRESH_HOURS)
            .min(MAX_REFRESH_HOURS);
        let policy = TokenPolicy::new(chrono::Duration::hours(hours));
        let reconnect = config.reconnect_config();
        Self {
            config,
            transport,
            store,
            policy,
            reconnect,
        }
    }

    /// Run until shutdown, a fatal handshake error, or reconnect exhaustion
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        sink: mpsc::UnboundedSender<ListenerEvent>,
    ) -> FbnsResult<()> {
        let session = self.store.load()?;
        let auth = session.auth_or_default();
        if session.auth.is_some() {
            info!(user_id = auth.user_id(), "Loaded persisted credentials");
        }
        let shared = Arc::new(Mutex::new(Shared {
            session,
            ..Default::default()
        }));

        let options = ConnectOptions {
            clean_session: self.config.server.clean_session,
            keepalive_secs: self.config.server.keepalive_secs,
        };
        let handlers = build_handlers(Arc::clone(&shared), self.store.clone(), self.policy, sink);
        let mut client = FbnsClient::new(self.transport, self.config.client.clone(), auth, options)
            .with_handlers(handlers);

        let mut attempts = 0u32;
        let mut reconnect_count = 0u32;

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested before connect");
                return Ok(());
            }

            lock(&shared).authenticated = false;
            let connected_at = Instant::now();
            let span = crate::handshake_span!(attempt = attempts);

            match connect_and_run(&mut client, shutdown.clone()).instrument(span).await {
                Ok(RunOutcome::Shutdown) => {
                    info!("Listener stopped");
                    return Ok(());
                }
                Ok(RunOutcome::Disconnected(reason)) => {
                    warn!(reason = %sanitize_for_log(&reason), "Disconnected from push server");
                }
                Err(e) if e.is_permanent() => {
                    error!(error = %sanitize_for_log(&e.to_string()), "Fatal handshake error");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(error = %sanitize_for_log(&e.to_string()), "Connection attempt failed");
                }
            }

            let (authenticated, last_message) = {
                let shared = lock(&shared);
                (shared.authenticated, shared.last_message)
            };
            let metrics =
                HealthMonitor::calculate_health_metrics(Some(connected_at), last_message, reconnect_count);
            info!(
                uptime_ms = metrics.uptime.map_or(0, |d| d.as_millis() as u64),
                since_last_message_ms = metrics.time_since_last_message.map(|d| d.as_millis() as u64),
                reconnects = metrics.reconnect_count,
                "Connection ended"
            );
            if authenticated {
                // a connection that got as far as CONNACK starts a fresh backoff cycle
                attempts = 0;
            }

            let shutdown_requested = *shutdown.borrow();
            match HealthMonitor::should_attempt_reconnection(attempts, &self.reconnect, shutdown_requested) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    attempts = attempt;
                    reconnect_count += 1;
                    let max_display = self
                        .reconnect
                        .max_attempts
                        .map_or("unlimited".to_string(), |max| max.to_string());
                    info!(attempt, max = %max_display, delay_ms, "Reconnecting");
                    if !interruptible_sleep(&mut shutdown, delay_ms).await {
                        return Ok(());
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, not reconnecting");
                    return Ok(());
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!(attempts, "Giving up on reconnection");
                    return Err(FbnsError::ReconnectExhausted { attempts });
                }
            }
        }
    }
}

async fn connect_and_run<T: Transport>(
    client: &mut FbnsClient<T>,
    shutdown: watch::Receiver<bool>,
) -> Result<RunOutcome, ClientError> {
    client.connect().await?;
    client.run(shutdown).await
}

fn build_handlers(
    shared: Arc<Mutex<Shared>>,
    store: SessionStore,
    policy: TokenPolicy,
    sink: mpsc::UnboundedSender<ListenerEvent>,
) -> EventHandlers {
    let auth_shared = Arc::clone(&shared);
    let auth_store = store.clone();
    let token_shared = Arc::clone(&shared);
    let push_shared = shared;
    let token_sink = sink.clone();
    let push_sink = sink;

    EventHandlers::new()
        .on_auth_updated(move |auth| {
            let mut shared = lock(&auth_shared);
            shared.authenticated = true;
            shared.last_message = Some(Instant::now());
            shared.session.record_auth(auth.clone(), Utc::now());
            if let Err(e) = auth_store.save(&shared.session) {
                error!(error = %e, "Failed to persist credentials");
            }
        })
        .on_token_issued(move |token| {
            let mut shared = lock(&token_shared);
            shared.last_message = Some(Instant::now());
            let now = Utc::now();
            if !policy.should_register(&shared.session, token, now) {
                debug!("Token unchanged and recently reported");
                return;
            }
            shared.session.record_token(token, now);
            if let Err(e) = store.save(&shared.session) {
                error!(error = %e, "Failed to persist token");
            }
            if token_sink.send(ListenerEvent::NewToken(token.to_string())).is_err() {
                debug!("Token receiver dropped");
            }
        })
        .on_push_received(move |push| {
            lock(&push_shared).last_message = Some(Instant::now());
            if push_sink.send(ListenerEvent::Push(push.clone())).is_err() {
                debug!("Push receiver dropped");
            }
        })
}

/// Sleep unless shutdown is signalled first. Returns false on shutdown.
async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
                info!("Shutdown signal received during reconnection delay");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectSection;
    use crate::protocol::compression::compress;
    use crate::testing::MockTransport;
    use crate::transport::TransportEvent;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_attempts: u32) -> FbnsConfig {
        let mut config = FbnsConfig::default();
        config.session.state_file = dir.path().join("session.json");
        config.reconnect = ReconnectSection {
            max_attempts: Some(max_attempts),
            backoff_ms: vec![1],
            sustained_delay_ms: 1,
        };
        config
    }

    fn connack(json: &[u8]) -> TransportEvent {
        let mut body = vec![0x00, 0x00];
        body.extend_from_slice(json);
        TransportEvent::ConnAck {
            body: Bytes::from(body),
        }
    }

    fn message(topic: &str, json: &[u8]) -> TransportEvent {
        TransportEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::from(compress(json).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut rx, 5).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move { interruptible_sleep(&mut rx, 60_000).await });
        tx.send(true).unwrap();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_listener_persists_and_emits_then_gives_up() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.push_event(connack(br#"{"ck":5,"cs":"pw","ds":"s","di":"d"}"#));
        transport.push_event(message("80", br#"{"token":"TOKEN"}"#));
        transport.push_event(message("76", br#"{"nid":"n1"}"#));
        let listener = Listener::with_transport(config(&dir, 2), transport.clone());
        let (_tx, rx) = watch::channel(false);
        let (sink, mut events) = mpsc::unbounded_channel();

        // Act: script ends, every reconnect sees an immediate disconnect
        let result = listener.run(rx, sink).await;

        // Assert
        assert!(matches!(result, Err(FbnsError::ReconnectExhausted { attempts: 2 })));
        assert_eq!(events.recv().await, Some(ListenerEvent::NewToken("TOKEN".to_string())));
        match events.recv().await {
            Some(ListenerEvent::Push(push)) => assert_eq!(push.notification_id.as_deref(), Some("n1")),
            other => panic!("expected push, got {other:?}"),
        }
        assert_eq!(transport.connect_count(), 3);

        let saved = SessionStore::new(dir.path().join("session.json")).load().unwrap();
        assert_eq!(saved.auth.unwrap().user_id(), 5);
        assert_eq!(saved.token.as_deref(), Some("TOKEN"));
    }

    #[tokio::test]
    async fn test_fatal_connack_stops_listener() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.push_event(TransportEvent::ConnAck {
            body: Bytes::from_static(&[0x00, 0x05]),
        });
        let listener = Listener::with_transport(config(&dir, 5), transport.clone());
        let (_tx, rx) = watch::channel(false);
        let (sink, _events) = mpsc::unbounded_channel();

        let err = listener.run(rx, sink).await.unwrap_err();

        assert!(err.to_string().contains("Not authorized"));
        assert_eq!(transport.connect_count(), 1);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new().hold_open();
        transport.push_event(connack(br#"{"ck":1}"#));
        let listener = Listener::with_transport(config(&dir, 5), transport.clone());
        let (tx, rx) = watch::channel(false);
        let (sink, _events) = mpsc::unbounded_channel();

        let handle = tokio::spawn(listener.run(rx, sink));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert!(!transport.is_connected());
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_recent_token_not_reported_twice() {
        // Arrange: session already holds the same token
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        let mut state = SessionState::default();
        state.record_token("TOKEN", Utc::now());
        store.save(&state).unwrap();

        let transport = MockTransport::new();
        transport.push_event(connack(br#"{"ck":1}"#));
        transport.push_event(message("80", br#"{"token":"TOKEN"}"#));
        let listener = Listener::with_transport(config(&dir, 1), transport);
        let (_tx, rx) = watch::channel(false);
        let (sink, mut events) = mpsc::unbounded_channel();

        // Act
        let _ = listener.run(rx, sink).await;

        // Assert
        assert!(events.try_recv().is_err());
    }
}
