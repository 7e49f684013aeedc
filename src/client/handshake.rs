//! Connection handshake as a pure state machine
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingConnAck -> Authenticated -> Registering -> Ready
//! ```
//!
//! [`Handshake`] never touches a socket. It consumes [`TransportEvent`]s and
//! returns the ordered [`HandshakeAction`]s the driver must carry out, which
//! keeps the sequencing rules testable without a network.

use super::dispatcher::{Dispatch, MessageDispatcher};
use crate::protocol::auth::AuthContext;
use crate::protocol::connack::{ConnAck, ConnectReturnCode};
use crate::protocol::connect::{self, ConnectOptions, EncodeError};
use crate::protocol::notification::PushNotification;
use crate::protocol::profile::ClientProfile;
use crate::protocol::registration::{RegistrationError, RegistrationRequest, RegistrationResponse};
use crate::protocol::topics::TopicId;
use crate::transport::TransportEvent;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    Connecting,
    AwaitingConnAck,
    Authenticated,
    Registering,
    Ready,
}

impl HandshakeState {
    /// Credentials have been received on this connection
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated | Self::Registering | Self::Ready)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Work the driver performs, in order
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeAction {
    /// New credentials from CONNACK; persist before anything else
    AuthUpdated(AuthContext),
    /// Publish with QoS 1
    Publish { topic: TopicId, payload: Vec<u8> },
    TokenIssued(String),
    Push(PushNotification),
    /// A message that could not be used; the session continues
    Dropped { topic: String, reason: String },
    Disconnected(String),
}

/// Fatal handshake failures; the state is reset to `Disconnected`
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Connack returncode: {code}")]
    ConnectionRefused { code: ConnectReturnCode },

    #[error("Malformed CONNACK: {0}")]
    MalformedConnAck(String),

    #[error("FBNS Register error message: {0}")]
    RegistrationRejected(String),

    #[error("Malformed registration response: {0}")]
    MalformedRegistration(String),

    #[error("Cannot {operation} in state {state}")]
    InvalidState {
        state: HandshakeState,
        operation: &'static str,
    },

    #[error("A registration request is already outstanding")]
    RegistrationInProgress,

    #[error("Failed to encode CONNECT: {0}")]
    Encode(#[from] EncodeError),

    #[error("Failed to encode registration request: {0}")]
    RegistrationEncode(#[source] RegistrationError),
}

impl HandshakeError {
    /// Connection refusals and rejected registrations will not succeed on retry
    pub fn is_permanent(&self) -> bool {
        !matches!(
            self,
            HandshakeError::MalformedConnAck(_)
                | HandshakeError::MalformedRegistration(_)
                | HandshakeError::ConnectionRefused {
                    code: ConnectReturnCode::ServerUnavailable
                }
        )
    }
}

/// Sequencing of one logical connection
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    profile: ClientProfile,
    registration_outstanding: bool,
}

impl Handshake {
    pub fn new(profile: ClientProfile) -> Self {
        Self {
            state: HandshakeState::Disconnected,
            profile,
            registration_outstanding: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    pub fn profile(&self) -> &ClientProfile {
        &self.profile
    }

    /// Forget the connection; any outstanding registration is abandoned
    pub fn reset(&mut self) {
        self.state = HandshakeState::Disconnected;
        self.registration_outstanding = false;
    }

    pub fn begin_connect(&mut self) -> Result<(), HandshakeError> {
        self.expect(HandshakeState::Disconnected, "begin connect")?;
        self.state = HandshakeState::Connecting;
        Ok(())
    }

    /// Socket is open: produce the CONNECT frame to send
    pub fn transport_connected(
        &mut self,
        auth: &AuthContext,
        options: &ConnectOptions,
    ) -> Result<Vec<u8>, HandshakeError> {
        self.transport_connected_with_session(auth, options, connect::current_session_id())
    }

    pub fn transport_connected_with_session(
        &mut self,
        auth: &AuthContext,
        options: &ConnectOptions,
        session_id: i64,
    ) -> Result<Vec<u8>, HandshakeError> {
        self.expect(HandshakeState::Connecting, "send CONNECT")?;
        let payload = connect::encode_auth_payload(auth, &self.profile, session_id)?;
        let frame = connect::build_connect_frame(&payload, options)?;
        debug!(
            client_id = auth.client_id(),
            session_id,
            bytes = frame.len(),
            "CONNECT built"
        );
        self.state = HandshakeState::AwaitingConnAck;
        Ok(frame)
    }

    /// Ask for a delivery token. Only one request may be outstanding.
    pub fn request_registration(&mut self) -> Result<HandshakeAction, HandshakeError> {
        if self.registration_outstanding {
            return Err(HandshakeError::RegistrationInProgress);
        }
        if !matches!(self.state, HandshakeState::Authenticated | HandshakeState::Ready) {
            return Err(HandshakeError::InvalidState {
                state: self.state,
                operation: "request registration",
            });
        }

        let payload = RegistrationRequest::from_profile(&self.profile)
            .encode()
            .map_err(HandshakeError::RegistrationEncode)?;
        self.registration_outstanding = true;
        self.state = HandshakeState::Registering;
        Ok(HandshakeAction::Publish {
            topic: TopicId::RegistrationRequest,
            payload,
        })
    }

    /// Advance on one transport event. A returned error is fatal for the
    /// connection and leaves the state `Disconnected`.
    pub fn handle(&mut self, event: TransportEvent) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let result = match event {
            TransportEvent::ConnAck { body } => self.on_connack(&body),
            TransportEvent::Message { topic, payload } => self.on_message(topic, &payload),
            TransportEvent::Disconnected { reason } => {
                self.reset();
                Ok(vec![HandshakeAction::Disconnected(reason)])
            }
        };
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn on_connack(&mut self, body: &[u8]) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.state != HandshakeState::AwaitingConnAck {
            warn!(state = %self.state, "Unexpected CONNACK");
            return Ok(vec![HandshakeAction::Dropped {
                topic: "CONNACK".to_string(),
                reason: format!("unexpected in state {}", self.state),
            }]);
        }

        let connack = ConnAck::parse(body).ok_or_else(|| {
            HandshakeError::MalformedConnAck("Unexpected connack packet without payload".to_string())
        })?;
        if connack.return_code != ConnectReturnCode::Accepted {
            return Err(HandshakeError::ConnectionRefused {
                code: connack.return_code,
            });
        }
        let auth = connack
            .auth()
            .map_err(|e| HandshakeError::MalformedConnAck(e.to_string()))?;

        info!(user_id = auth.user_id(), "Authenticated");
        self.state = HandshakeState::Authenticated;
        let registration = self.request_registration()?;
        Ok(vec![HandshakeAction::AuthUpdated(auth), registration])
    }

    fn on_message(&mut self, topic: String, payload: &[u8]) -> Result<Vec<HandshakeAction>, HandshakeError> {
        match MessageDispatcher::route(&topic) {
            None => {
                debug!(topic = %topic, bytes = payload.len(), "Ignoring message on unknown topic");
                Ok(Vec::new())
            }
            Some(TopicId::RegistrationResponse) => self.on_registration_response(topic, payload),
            Some(_) => Ok(vec![self.on_push(topic, payload)]),
        }
    }

    fn on_push(&mut self, topic: String, payload: &[u8]) -> HandshakeAction {
        if !self.state.is_authenticated() {
            return HandshakeAction::Dropped {
                topic,
                reason: format!("push received in state {}", self.state),
            };
        }
        match MessageDispatcher::dispatch(&topic, payload) {
            Ok(Dispatch::Push(push)) => HandshakeAction::Push(push),
            Ok(other) => HandshakeAction::Dropped {
                topic,
                reason: format!("unexpected dispatch {other:?}"),
            },
            Err(e) => HandshakeAction::Dropped {
                topic,
                reason: e.to_string(),
            },
        }
    }

    fn on_registration_response(
        &mut self,
        topic: String,
        payload: &[u8],
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.state != HandshakeState::Registering {
            warn!(state = %self.state, "Registration response without outstanding request");
            return Ok(vec![HandshakeAction::Dropped {
                topic,
                reason: format!("registration response in state {}", self.state),
            }]);
        }

        match MessageDispatcher::dispatch(&topic, payload) {
            Ok(Dispatch::RegistrationResponse(RegistrationResponse::Token(token))) => {
                debug!("Delivery token issued");
                self.registration_outstanding = false;
                self.state = HandshakeState::Ready;
                Ok(vec![HandshakeAction::TokenIssued(token)])
            }
            Ok(Dispatch::RegistrationResponse(RegistrationResponse::Error(error))) => {
                Err(HandshakeError::RegistrationRejected(error))
            }
            Ok(other) => Err(HandshakeError::MalformedRegistration(format!("{other:?}"))),
            Err(e) => Err(HandshakeError::MalformedRegistration(e.to_string())),
        }
    }

    fn expect(&self, state: HandshakeState, operation: &'static str) -> Result<(), HandshakeError> {
        if self.state == state {
            Ok(())
        } else {
            Err(HandshakeError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }
}
