//! Socket abstraction used by the engine.
//!
//! The engine talks to an open socket through a [`Connection`]: a pair of
//! channels carrying outgoing frames and inbound [`TransportEvent`]s. A
//! [`Connector`] opens connections. [`WebSocketConnector`] is the production
//! implementation on top of `tokio-tungstenite`; tests plug in their own
//! connector and drive the far end through a [`ConnectionPeer`].

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{Error, Result};
use crate::logging::targets;

/// Type alias for a connected WebSocket stream.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a socket closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// The close status code.
    pub code: u16,
    /// Human-readable reason, possibly empty.
    pub reason: String,
}

impl CloseReason {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The peer sent a close frame without a status code.
    pub const NO_STATUS: u16 = 1005;
    /// The connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;

    /// Create a close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure (1000).
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    /// Abnormal closure (1006).
    pub fn abnormal() -> Self {
        Self::new(Self::ABNORMAL, "")
    }

    /// Whether this is a deliberate, clean close.
    pub fn is_normal(&self) -> bool {
        self.code == Self::NORMAL
    }
}

/// Event reported by an open socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Message(String),
    /// The socket reported an error. A `Closed` event follows.
    Error(String),
    /// The socket closed. Nothing follows.
    Closed(CloseReason),
}

/// Frame queued for the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    /// A text frame.
    Text(String),
    /// Close the socket with the given reason.
    Close(CloseReason),
}

/// Engine side of an open socket.
#[derive(Debug)]
pub struct Connection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// Create a connection and the handle that drives its far end.
    pub fn pair() -> (Connection, ConnectionPeer) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        (
            Connection {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
            },
            ConnectionPeer {
                outgoing: outgoing_rx,
                incoming: incoming_tx,
            },
        )
    }

    /// Queue a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.outgoing
            .send(Outgoing::Text(text.into()))
            .map_err(|_| Error::Connection("Not connected".into()))
    }

    /// Ask the socket to close.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.outgoing.send(Outgoing::Close(reason));
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the far end is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.incoming.recv().await
    }
}

/// Far end of a [`Connection`].
///
/// Owned by the task that pumps a real socket, or by a test acting as the
/// server.
#[derive(Debug)]
pub struct ConnectionPeer {
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionPeer {
    /// Wait for the next frame queued by the engine.
    ///
    /// Returns `None` once the engine dropped the connection.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.outgoing.recv().await
    }

    /// Take a queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Outgoing> {
        self.outgoing.try_recv().ok()
    }

    /// Deliver a text frame to the engine.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.emit(TransportEvent::Message(text.into()))
    }

    /// Report a socket error to the engine.
    pub fn send_error(&self, message: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(message.into()))
    }

    /// Report that the socket closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.emit(TransportEvent::Closed(reason))
    }

    /// Whether the engine still holds the connection.
    pub fn is_connected(&self) -> bool {
        !self.incoming.is_closed()
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.incoming.send(event).is_ok()
    }
}

/// Opens socket connections.
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `url`.
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Connection>>;
}

/// [`Connector`] for real WebSocket servers.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    headers: HashMap<String, String>,
}

impl WebSocketConnector {
    /// Create a connector.
    pub fn new(connect_timeout: Duration, headers: HashMap<String, String>) -> Self {
        Self {
            connect_timeout,
            headers,
        }
    }

    /// Build the WebSocket request with custom headers.
    fn build_request(
        url: &Url,
        headers: &HashMap<String, String>,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = url.as_str().into_client_request()?;

        let request_headers = request.headers_mut();
        for (name, value) in headers {
            let header_name = http::header::HeaderName::try_from(name.as_str())
                .map_err(|e| Error::Connection(format!("Invalid header name: {e}")))?;
            let header_value = http::header::HeaderValue::try_from(value.as_str())
                .map_err(|e| Error::Connection(format!("Invalid header value: {e}")))?;
            request_headers.insert(header_name, header_value);
        }

        Ok(request)
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Connection>> {
        let connect_timeout = self.connect_timeout;
        let headers = self.headers.clone();

        async move {
            let request = Self::build_request(&url, &headers)?;
            let (ws_stream, _response) =
                tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
                    .await
                    .map_err(|_| Error::Connection("Connection timed out".into()))??;

            tracing::debug!(target: targets::TRANSPORT, host = url.host_str(), "WebSocket opened");

            let (connection, peer) = Connection::pair();
            tokio::spawn(pump(ws_stream, peer));
            Ok(connection)
        }
        .boxed()
    }
}

/// Move frames between a socket and its [`ConnectionPeer`] until either side
/// goes away.
async fn pump(ws_stream: WsStream, mut peer: ConnectionPeer) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = peer.recv() => {
                match outgoing {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            peer.send_error(e.to_string());
                            peer.close(CloseReason::abnormal());
                            return;
                        }
                    }
                    Some(Outgoing::Close(reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(reason.code),
                            reason: reason.reason.into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        tracing::debug!(target: targets::TRANSPORT, "WebSocket closed locally");
                        return;
                    }
                    None => {
                        // Connection dropped by the engine.
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }

            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        peer.send_text(text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            peer.send_text(text);
                        }
                        Err(_) => {
                            tracing::debug!(target: targets::TRANSPORT, len = data.len(), "Dropping non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = match frame {
                            Some(frame) => CloseReason::new(u16::from(frame.code), frame.reason.as_str()),
                            None => CloseReason::new(CloseReason::NO_STATUS, ""),
                        };
                        tracing::debug!(target: targets::TRANSPORT, code = reason.code, "WebSocket closed by server");
                        peer.close(reason);
                        return;
                    }
                    Some(Ok(_)) => {
                        // Control frames are answered by tungstenite.
                    }
                    Some(Err(e)) => {
                        peer.send_error(e.to_string());
                        peer.close(CloseReason::abnormal());
                        return;
                    }
                    None => {
                        peer.close(CloseReason::abnormal());
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_carries_frames_both_ways() {
        let (mut connection, mut peer) = Connection::pair();

        connection.send_text("{\"type\":\"ping\"}").unwrap();
        connection.close(CloseReason::normal());
        assert_eq!(
            peer.recv().await,
            Some(Outgoing::Text("{\"type\":\"ping\"}".into()))
        );
        assert_eq!(peer.recv().await, Some(Outgoing::Close(CloseReason::normal())));

        assert!(peer.send_text("{\"type\":\"pong\"}"));
        assert!(peer.close(CloseReason::abnormal()));
        assert_eq!(
            connection.recv().await,
            Some(TransportEvent::Message("{\"type\":\"pong\"}".into()))
        );
        assert_eq!(
            connection.recv().await,
            Some(TransportEvent::Closed(CloseReason::abnormal()))
        );
    }

    #[tokio::test]
    async fn test_dropped_ends_are_observable() {
        let (mut connection, peer) = Connection::pair();
        drop(peer);
        assert!(connection.send_text("x").is_err());
        assert_eq!(connection.recv().await, None);

        let (connection, mut peer) = Connection::pair();
        assert!(peer.is_connected());
        drop(connection);
        assert!(!peer.is_connected());
        assert!(!peer.send_text("x"));
        assert_eq!(peer.recv().await, None);
    }

    #[test]
    fn test_close_reason() {
        assert!(CloseReason::normal().is_normal());
        assert!(!CloseReason::abnormal().is_normal());
        assert_eq!(CloseReason::abnormal().code, 1006);
    }

    #[test]
    fn test_build_request_with_headers() {
        let url = Url::parse("wss://api.qminder.com:443/graphql/subscription?rest-api-key=k").unwrap();
        let mut headers = HashMap::new();
        headers.insert("X-Client".to_string(), "tests".to_string());

        let request = WebSocketConnector::build_request(&url, &headers).unwrap();
        assert_eq!(request.headers()["X-Client"], "tests");
        assert_eq!(request.uri().path(), "/graphql/subscription");

        headers.insert("bad header".to_string(), "x".to_string());
        assert!(WebSocketConnector::build_request(&url, &headers).is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let connector = WebSocketConnector::new(Duration::from_secs(2), HashMap::new());
        let url = Url::parse("ws://127.0.0.1:1/graphql/subscription").unwrap();
        assert!(connector.connect(url).await.is_err());
    }
}
