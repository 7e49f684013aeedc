//! Push client: drives a [`Transport`] through the [`Handshake`]
//!
//! The handshake decides, the driver performs. Every inbound event is fed
//! to the state machine and the resulting actions are carried out in
//! order, so credentials are always handed to the application before the
//! registration request goes out and before any token is reported.

pub mod dispatcher;
pub mod handlers;
pub mod handshake;

pub use dispatcher::{Dispatch, DispatchError, MessageDispatcher};
pub use handlers::EventHandlers;
pub use handshake::{Handshake, HandshakeAction, HandshakeError, HandshakeState};

use crate::protocol::auth::AuthContext;
use crate::protocol::connect::ConnectOptions;
use crate::protocol::profile::ClientProfile;
use crate::transport::{QoS, Transport};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl ClientError {
    fn transport<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        ClientError::Transport(Box::new(error))
    }

    /// Whether reconnecting could help
    pub fn is_permanent(&self) -> bool {
        match self {
            ClientError::Transport(_) => false,
            ClientError::Handshake(e) => e.is_permanent(),
        }
    }
}

/// Result of handling one inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Disconnected(String),
}

/// Why [`FbnsClient::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    Disconnected(String),
}

pub struct FbnsClient<T: Transport> {
    transport: T,
    handshake: Handshake,
    handlers: EventHandlers,
    auth: AuthContext,
    options: ConnectOptions,
}

impl<T: Transport> FbnsClient<T> {
    /// `auth` may be empty for a first connection; the server then issues
    /// fresh credentials in CONNACK.
    pub fn new(transport: T, profile: ClientProfile, auth: AuthContext, options: ConnectOptions) -> Self {
        Self {
            transport,
            handshake: Handshake::new(profile),
            handlers: EventHandlers::default(),
            auth,
            options,
        }
    }

    pub fn with_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Open the transport and send CONNECT. Completion is signalled later
    /// through the auth and token handlers.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.handshake.state() != HandshakeState::Disconnected {
            self.handshake.reset();
        }
        self.handshake.begin_connect()?;

        if let Err(e) = self.transport.connect().await {
            self.handshake.reset();
            return Err(ClientError::transport(e));
        }

        let frame = match self.handshake.transport_connected(&self.auth, &self.options) {
            Ok(frame) => frame,
            Err(e) => {
                self.abort().await;
                return Err(e.into());
            }
        };
        debug!(client_id = self.auth.client_id(), "Sending CONNECT");
        if let Err(e) = self.transport.send_frame(frame).await {
            self.handshake.reset();
            return Err(ClientError::transport(e));
        }
        Ok(())
    }

    /// Request a fresh delivery token on the live connection
    pub async fn register(&mut self) -> Result<(), ClientError> {
        let action = self.handshake.request_registration()?;
        self.apply(action).await.map(|_| ())
    }

    /// Wait for one inbound event and act on it
    pub async fn poll(&mut self) -> Result<Progress, ClientError> {
        let event = self.transport.next_event().await.map_err(ClientError::transport)?;

        let actions = match self.handshake.handle(event) {
            Ok(actions) => actions,
            Err(e) => {
                self.abort().await;
                return Err(e.into());
            }
        };

        let mut progress = Progress::Continue;
        for action in actions {
            if let Progress::Disconnected(reason) = self.apply(action).await? {
                progress = Progress::Disconnected(reason);
            }
        }
        Ok(progress)
    }

    /// Poll until the connection drops or shutdown is signalled
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunOutcome, ClientError> {
        loop {
            if *shutdown.borrow() {
                self.disconnect().await?;
                return Ok(RunOutcome::Shutdown);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, disconnecting");
                        self.disconnect().await?;
                        return Ok(RunOutcome::Shutdown);
                    }
                }
                progress = self.poll() => {
                    if let Progress::Disconnected(reason) = progress? {
                        return Ok(RunOutcome::Disconnected(reason));
                    }
                }
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.handshake.reset();
        self.transport.disconnect().await.map_err(ClientError::transport)
    }

    async fn apply(&mut self, action: HandshakeAction) -> Result<Progress, ClientError> {
        match action {
            HandshakeAction::AuthUpdated(auth) => {
                self.auth = auth;
                self.handlers.auth_updated(&self.auth);
            }
            HandshakeAction::Publish { topic, payload } => {
                debug!(topic = %topic, bytes = payload.len(), "Publishing");
                self.transport
                    .publish(topic.as_str(), payload, QoS::AtLeastOnce)
                    .await
                    .map_err(ClientError::transport)?;
            }
            HandshakeAction::TokenIssued(token) => {
                info!("Registration complete");
                self.handlers.token_issued(&token);
            }
            HandshakeAction::Push(push) => {
                debug!(
                    notification_id = push.notification_id.as_deref().unwrap_or(""),
                    "Push received"
                );
                self.handlers.push_received(&push);
            }
            HandshakeAction::Dropped { topic, reason } => {
                warn!(topic = %topic, reason = %reason, "Dropped inbound message");
            }
            HandshakeAction::Disconnected(reason) => {
                info!(reason = %reason, "Connection closed");
                return Ok(Progress::Disconnected(reason));
            }
        }
        Ok(Progress::Continue)
    }

    /// Tear down after a fatal handshake error
    async fn abort(&mut self) {
        self.handshake.reset();
        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "Disconnect after handshake failure also failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compression::compress;
    use crate::protocol::connect::ConnectHeader;
    use crate::protocol::notification::PushNotification;
    use crate::testing::MockTransport;
    use crate::transport::TransportEvent;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn connack(return_code: u8, json: &[u8]) -> TransportEvent {
        let mut body = vec![0x00, return_code];
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

    fn client(transport: MockTransport, log: Arc<Mutex<Vec<String>>>) -> FbnsClient<MockTransport> {
        let auth_log = Arc::clone(&log);
        let token_log = Arc::clone(&log);
        let push_log = Arc::clone(&log);
        FbnsClient::new(
            transport,
            ClientProfile::default(),
            AuthContext::default(),
            ConnectOptions::default(),
        )
        .with_handlers(
            EventHandlers::new()
                .on_auth_updated(move |a| auth_log.lock().unwrap().push(format!("auth:{}", a.user_id())))
                .on_token_issued(move |t| token_log.lock().unwrap().push(format!("token:{t}")))
                .on_push_received(move |p: &PushNotification| {
                    push_log
                        .lock()
                        .unwrap()
                        .push(format!("push:{}", p.notification_id.clone().unwrap_or_default()))
                }),
        )
    }

    #[tokio::test]
    async fn test_full_handshake_order() {
        // Arrange
        let transport = MockTransport::new();
        transport.push_event(connack(0, br#"{"ck":42,"cs":"pw","di":"device-0123456789abcdef"}"#));
        transport.push_event(message("80", br#"{"token":"TOKEN"}"#));
        transport.push_event(message("76", br#"{"nid":"n1"}"#));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut client = client(transport.clone(), Arc::clone(&log));

        // Act
        client.connect().await.unwrap();
        for _ in 0..3 {
            assert_eq!(client.poll().await.unwrap(), Progress::Continue);
        }

        // Assert
        assert_eq!(*log.lock().unwrap(), vec!["auth:42", "token:TOKEN", "push:n1"]);
        assert_eq!(client.state(), HandshakeState::Ready);
        assert_eq!(client.auth().user_id(), 42);

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        let (header, _) = ConnectHeader::parse(&frames[0]).unwrap();
        assert_eq!(header.protocol_name, "MQTToT");

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "79");
    }

    #[tokio::test]
    async fn test_refused_connack_stops_without_registration() {
        let transport = MockTransport::new();
        transport.push_event(connack(5, b""));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut client = client(transport.clone(), Arc::clone(&log));

        client.connect().await.unwrap();
        let err = client.poll().await.unwrap_err();

        assert!(err.to_string().contains("Not authorized"));
        assert!(err.is_permanent());
        assert!(transport.published().is_empty());
        assert!(log.lock().unwrap().is_empty());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_client_disconnected() {
        let transport = MockTransport::failing_connect();
        let mut client = client(transport, Arc::new(Mutex::new(Vec::new())));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(!err.is_permanent());
        assert_eq!(client.state(), HandshakeState::Disconnected);
    }

    #[tokio::test]
    async fn test_run_returns_on_disconnect() {
        let transport = MockTransport::new();
        transport.push_event(connack(0, br#"{"ck":1}"#));
        let mut client = client(transport, Arc::new(Mutex::new(Vec::new())));
        let (_tx, rx) = watch::channel(false);

        client.connect().await.unwrap();
        let outcome = client.run(rx).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Disconnected(_)));
        assert_eq!(client.state(), HandshakeState::Disconnected);
    }

    #[tokio::test]
    async fn test_run_honours_shutdown() {
        let transport = MockTransport::new().hold_open();
        let mut client = client(transport.clone(), Arc::new(Mutex::new(Vec::new())));
        let (tx, rx) = watch::channel(false);

        client.connect().await.unwrap();
        let handle = tokio::spawn(async move { client.run(rx).await });
        tx.send(true).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Shutdown);
        assert!(!transport.is_connected());
    }
}
