//! WebSocket transport over `tokio-tungstenite`.
//!
//! Each [`WsTransport::open`] call connects, splits the stream, and spawns a
//! writer task and a reader task bridged to the [`Connection`] channels.
//! Non-text frames are ignored; the reader never inspects frame contents.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Connection, Transport, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// WebSocket transport to the chat server's `/ws` endpoint.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
    capacity: usize,
}

impl WsTransport {
    /// Create a transport for `url` (`ws://` or `wss://`).
    pub fn new(url: impl Into<String>, connect_timeout: Duration, capacity: usize) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            capacity: capacity.max(1),
        }
    }

    /// The socket URL this transport connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    /// Connect to the server and spawn the frame pump tasks.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the connect exceeds the timeout.
    /// - [`TransportError::Unreachable`] if the server refuses the connection.
    /// - [`TransportError::Io`] for TLS, HTTP upgrade and other failures.
    async fn open(&self) -> Result<Connection, TransportError> {
        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %self.url, "WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %self.url, error = %e, "WebSocket connect failed");
                    map_ws_connect_error(&self.url, e)
                })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        let (in_tx, in_rx) = mpsc::channel(self.capacity);

        tokio::spawn(writer_loop(ws_sender, out_rx));
        tokio::spawn(reader_loop(ws_reader, in_tx));

        tracing::debug!(url = %self.url, "WebSocket connected");
        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Forwards outbound frames to the socket until the channel or socket closes.
///
/// Sends a close frame once the owner drops its sender.
async fn writer_loop(mut ws_sender: WsSender, mut rx: mpsc::Receiver<String>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = ws_sender.send(Message::Text(frame.into())).await {
            tracing::warn!(error = %e, "WebSocket write failed");
            return;
        }
    }
    let _ = ws_sender.close().await;
    tracing::debug!("WebSocket writer task exiting");
}

/// Pushes inbound text frames into `tx` until the socket closes.
///
/// Dropping `tx` on exit is what tells the session the connection is gone.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<String>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(text.as_str().to_owned()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(Message::Binary(data)) => {
                tracing::debug!(len = data.len(), "ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket read error");
                break;
            }
        }
    }
    tracing::debug!("WebSocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "socket upgrade rejected: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "socket connection error: {other}"
        ))),
    }
}
