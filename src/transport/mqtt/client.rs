//! Socket I/O for the MQTT transport
//!
//! Owns the TCP or TLS stream, splits inbound bytes into frames, answers the
//! acknowledgements MQTT requires and keeps the connection alive with
//! PINGREQ. Protocol decisions (what CONNECT to send, what a CONNACK means)
//! are made by the caller.

use super::codec::{
    self, encode_puback, encode_pubcomp, encode_pubrec, read_packet, Inbound, QoS,
};
use super::connection::{configure_endpoint, BrokerEndpoint, ConnectionState, TransportError};
use super::health_monitor::{ConnectionEvent, HealthMonitor};
use crate::config::ServerSection;
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace, warn, Instrument};

/// Largest inbound frame accepted
pub const MAX_INBOUND_FRAME: usize = 4 * 1024 * 1024;

enum AsyncStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

enum ReadOutcome {
    Read(std::io::Result<usize>),
    KeepaliveDue,
}

/// MQTT transport over TCP or TLS
pub struct MqttClient {
    endpoint: BrokerEndpoint,
    stream: Option<AsyncStream>,
    read_buf: BytesMut,
    state: ConnectionState,
    next_packet_id: u16,
    last_write: Instant,
    ping_outstanding: bool,
    tls_connector: Option<TlsConnector>,
}

impl MqttClient {
    pub fn new(config: &ServerSection) -> Result<Self, TransportError> {
        Ok(Self::with_endpoint(configure_endpoint(config)?))
    }

    pub fn with_endpoint(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            read_buf: BytesMut::with_capacity(8 * 1024),
            state: ConnectionState::Disconnected("Not connected".to_string()),
            next_packet_id: 0,
            last_write: Instant::now(),
            ping_outstanding: false,
            tls_connector: None,
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    fn allocate_packet_id(&mut self) -> u16 {
        // zero is not a valid packet identifier
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }

    fn tls_connector(&mut self) -> TlsConnector {
        self.tls_connector
            .get_or_insert_with(|| TlsConnector::from(Arc::new(build_tls_config())))
            .clone()
    }

    async fn open_stream(&mut self) -> Result<AsyncStream, TransportError> {
        let address = self.endpoint.address();
        let timeout = self.endpoint.connect_timeout;

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                address: address.clone(),
            })??;
        tcp.set_nodelay(true)?;

        if !self.endpoint.tls {
            return Ok(AsyncStream::Plain(tcp));
        }

        let server_name = ServerName::try_from(self.endpoint.host.clone())
            .map_err(|_| TransportError::Tls(format!("Invalid server name: {}", self.endpoint.host)))?;
        let connector = self.tls_connector();
        let tls = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::ConnectTimeout { address })?
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(AsyncStream::Tls(Box::new(tls)))
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(TransportError::NotConnected {
                    state: self.state.clone(),
                })
            }
        };
        stream.write_all(bytes).await?;
        stream.flush().await?;
        self.last_write = Instant::now();
        Ok(())
    }

    fn mark_disconnected(&mut self, reason: impl Into<String>) -> TransportEvent {
        let reason = reason.into();
        let next = HealthMonitor::determine_next_state(ConnectionEvent::Lost(reason.clone()));
        HealthMonitor::log_state_transition(&self.state, &next);
        self.state = next;
        self.stream = None;
        self.read_buf.clear();
        self.ping_outstanding = false;
        TransportEvent::Disconnected { reason }
    }

    /// React to one inbound packet; `None` means nothing to surface
    async fn handle_packet(&mut self, packet: Inbound) -> Result<Option<TransportEvent>, TransportError> {
        match packet {
            Inbound::ConnAck { body } => Ok(Some(TransportEvent::ConnAck { body })),
            Inbound::Publish(publish) => {
                match publish.qos {
                    QoS::AtLeastOnce => self.write_all(&encode_puback(publish.pkid)?).await?,
                    QoS::ExactlyOnce => self.write_all(&encode_pubrec(publish.pkid)?).await?,
                    QoS::AtMostOnce => {}
                }
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "PUBLISH received");
                Ok(Some(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                }))
            }
            Inbound::PubRel(pubrel) => {
                self.write_all(&encode_pubcomp(pubrel.pkid)?).await?;
                Ok(None)
            }
            Inbound::PubAck(puback) => {
                debug!(packet_id = puback.pkid, "PUBACK received");
                Ok(None)
            }
            Inbound::PingResp => {
                self.ping_outstanding = false;
                trace!("PINGRESP received");
                Ok(None)
            }
            Inbound::Disconnect => Ok(Some(self.mark_disconnected("Server sent DISCONNECT"))),
            other => {
                debug!(packet = ?other, "Ignoring unexpected packet");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = TransportError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.state = ConnectionState::Connecting;
        info!(
            address = %self.endpoint.address(),
            tls = self.endpoint.tls,
            "Opening connection"
        );

        let span = crate::mqtt_span!(op = "connect", address = %self.endpoint.address());
        let stream = match self.open_stream().instrument(span).await {
            Ok(stream) => stream,
            Err(e) => {
                self.mark_disconnected(e.to_string());
                return Err(e);
            }
        };

        self.stream = Some(stream);
        self.read_buf.clear();
        self.ping_outstanding = false;
        self.last_write = Instant::now();
        let next = HealthMonitor::determine_next_state(ConnectionEvent::Established);
        HealthMonitor::log_state_transition(&self.state, &next);
        self.state = next;
        Ok(())
    }

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), Self::Error> {
        self.write_all(&frame).await
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), Self::Error> {
        if !HealthMonitor::can_publish(&self.state) {
            return Err(TransportError::NotConnected {
                state: self.state.clone(),
            });
        }
        let packet_id = if qos == QoS::AtMostOnce {
            0
        } else {
            self.allocate_packet_id()
        };
        let packet = codec::encode_publish(topic, &payload, qos, packet_id)?;
        debug!(topic, packet_id, bytes = payload.len(), "Publishing");
        self.write_all(&packet).await
    }

    async fn next_event(&mut self) -> Result<TransportEvent, Self::Error> {
        loop {
            match read_packet(&mut self.read_buf, MAX_INBOUND_FRAME) {
                Ok(Some(packet)) => {
                    if let Some(event) = self.handle_packet(packet).await? {
                        return Ok(event);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.mark_disconnected(e.to_string());
                    return Err(e.into());
                }
            }

            let deadline = tokio::time::Instant::from_std(self.last_write + self.endpoint.keepalive);
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => {
                    return Err(TransportError::NotConnected {
                        state: self.state.clone(),
                    })
                }
            };
            let read_buf = &mut self.read_buf;

            let outcome = tokio::select! {
                read = stream.read_buf(read_buf) => ReadOutcome::Read(read),
                _ = tokio::time::sleep_until(deadline) => ReadOutcome::KeepaliveDue,
            };

            match outcome {
                ReadOutcome::Read(Ok(0)) => {
                    return Ok(self.mark_disconnected("Connection closed by server"));
                }
                ReadOutcome::Read(Ok(_)) => {}
                ReadOutcome::Read(Err(e)) => return Ok(self.mark_disconnected(e.to_string())),
                ReadOutcome::KeepaliveDue if self.ping_outstanding => {
                    warn!("No PINGRESP within keepalive interval");
                    return Ok(self.mark_disconnected("Keepalive timeout"));
                }
                ReadOutcome::KeepaliveDue => {
                    trace!("Sending PINGREQ");
                    self.write_all(&codec::encode_pingreq()?).await?;
                    self.ping_outstanding = true;
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        if let Some(mut stream) = self.stream.take() {
            match codec::encode_disconnect() {
                Ok(frame) => {
                    if let Err(e) = stream.write_all(&frame).await {
                        debug!(error = %e, "Failed to send DISCONNECT");
                    }
                }
                Err(e) => debug!(error = %e, "Failed to encode DISCONNECT"),
            }
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Socket shutdown failed");
            }
            info!("Disconnected from broker");
        }
        self.read_buf.clear();
        self.state = ConnectionState::Disconnected("Client disconnect".to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some() && HealthMonitor::can_publish(&self.state)
    }
}

/// rustls client configuration trusting the webpki root set
fn build_tls_config() -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn local_endpoint(port: u16, keepalive: Duration) -> BrokerEndpoint {
        BrokerEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
            connect_timeout: Duration::from_secs(5),
            keepalive,
        }
    }

    async fn local_broker() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_connack_publish_and_eof() {
        // Arrange: broker answers CONNACK, delivers one QoS 1 publish, then closes
        let (listener, port) = local_broker().await;
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut connect = [0u8; 2];
            socket.read_exact(&mut connect).await.unwrap();
            socket
                .write_all(&[0x20, 0x04, 0x00, 0x00, b'{', b'}'])
                .await
                .unwrap();
            let publish = codec::encode_publish("76", b"data", QoS::AtLeastOnce, 5).unwrap();
            socket.write_all(&publish).await.unwrap();
            let mut ack = [0u8; 4];
            socket.read_exact(&mut ack).await.unwrap();
            (connect, ack)
        });

        let mut client = MqttClient::with_endpoint(local_endpoint(port, Duration::from_secs(60)));

        // Act
        client.connect().await.unwrap();
        assert!(client.is_connected());
        client.send_frame(vec![0x10, 0x00]).await.unwrap();
        let first = client.next_event().await.unwrap();
        let second = client.next_event().await.unwrap();
        let (connect, ack) = broker.await.unwrap();
        let third = client.next_event().await.unwrap();

        // Assert
        assert_eq!(connect, [0x10, 0x00]);
        assert_eq!(
            first,
            TransportEvent::ConnAck {
                body: bytes::Bytes::from_static(&[0x00, 0x00, b'{', b'}'])
            }
        );
        assert_eq!(
            second,
            TransportEvent::Message {
                topic: "76".to_string(),
                payload: bytes::Bytes::from_static(b"data"),
            }
        );
        assert_eq!(&ack[..], &encode_puback(5).unwrap()[..]);
        assert!(matches!(third, TransportEvent::Disconnected { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_keepalive_sends_pingreq() {
        let (listener, port) = local_broker().await;
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut ping = [0u8; 2];
            socket.read_exact(&mut ping).await.unwrap();
            socket.write_all(&[0xD0, 0x00]).await.unwrap();
            ping
        });

        let mut client = MqttClient::with_endpoint(local_endpoint(port, Duration::from_millis(50)));
        client.connect().await.unwrap();

        let event = client.next_event().await.unwrap();
        assert_eq!(&broker.await.unwrap()[..], &codec::encode_pingreq().unwrap()[..]);
        assert!(matches!(event, TransportEvent::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_keepalive_timeout_without_pingresp() {
        let (listener, port) = local_broker().await;
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut ping = [0u8; 2];
            socket.read_exact(&mut ping).await.unwrap();
            // hold the socket open without answering
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(socket);
        });

        let mut client = MqttClient::with_endpoint(local_endpoint(port, Duration::from_millis(30)));
        client.connect().await.unwrap();

        let event = client.next_event().await.unwrap();
        assert_eq!(
            event,
            TransportEvent::Disconnected {
                reason: "Keepalive timeout".to_string()
            }
        );
        broker.abort();
    }

    #[tokio::test]
    async fn test_publish_fails_without_connection() {
        let mut client = MqttClient::with_endpoint(local_endpoint(1, Duration::from_secs(60)));
        let result = client.publish("79", b"x".to_vec(), QoS::AtLeastOnce).await;
        assert!(matches!(result, Err(TransportError::NotConnected { .. })));
        assert!(matches!(
            client.next_event().await,
            Err(TransportError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let mut client = MqttClient::with_endpoint(local_endpoint(1, Duration::from_secs(60)));
        assert!(client.disconnect().await.is_ok());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, port) = local_broker().await;
        drop(listener);

        let mut client = MqttClient::with_endpoint(local_endpoint(port, Duration::from_secs(60)));
        assert!(client.connect().await.is_err());
        assert!(matches!(
            client.connection_state(),
            ConnectionState::Disconnected(_)
        ));
    }

    #[test]
    fn test_packet_ids_skip_zero() {
        let mut client = MqttClient::with_endpoint(local_endpoint(1, Duration::from_secs(60)));
        client.next_packet_id = u16::MAX;
        assert_eq!(client.allocate_packet_id(), 1);
        assert_eq!(client.allocate_packet_id(), 2);
    }
}
