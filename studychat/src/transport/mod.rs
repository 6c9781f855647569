//! Transport layer for the `StudyChat` socket connection.
//!
//! The [`Transport`] trait opens one raw text-frame connection. The
//! [`session`] supervisor sits on top of it: it authenticates, decodes
//! frames into typed [`ServerEvent`]s, publishes the [`ConnectionState`],
//! and reconnects with backoff after unexpected disconnects.
//!
//! Concrete implementations:
//! - [`ws::WsTransport`]: WebSocket connection to the chat server
//! - [`ChannelTransport`]: in-process channel pairs for tests

pub mod session;
pub mod ws;

use std::fmt;

use studychat_proto::event::ServerEvent;
use studychat_proto::ids::UserId;
use tokio::sync::mpsc;

pub use session::{SessionConfig, SessionHandle, spawn_session};

/// Connection state of the transport session.
///
/// Only the session supervisor changes it; everyone else observes it through
/// [`SessionHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Socket open and authenticated.
    Connected,
    /// Not connected and not trying (initial, after auth rejection or shutdown).
    Disconnected,
    /// Connection lost; waiting for or running a reconnect attempt.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket is not currently connected.
    #[error("not connected")]
    NotConnected,

    /// The connection was closed by the peer or dropped.
    #[error("connection closed")]
    ConnectionClosed,

    /// Opening the socket or the auth handshake timed out.
    #[error("transport operation timed out")]
    Timeout,

    /// The server rejected the auth token. Terminal.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The outbound queue is full.
    #[error("outbound queue full")]
    Backpressure,

    /// A frame could not be encoded or the handshake reply was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O or WebSocket error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether a reconnect attempt may succeed after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthRejected(_))
    }
}

/// Events the session supervisor reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// The socket is open and authenticated as `user_id`.
    Connected {
        /// User the token belongs to.
        user_id: UserId,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt runs, in milliseconds.
        delay_ms: u64,
    },
    /// The auth token was rejected. The session stops.
    AuthRejected {
        /// Reason given by the server.
        reason: String,
    },
    /// The configured attempt limit was reached. The session stops.
    ReconnectFailed,
    /// A decoded inbound event.
    Server(ServerEvent),
}

/// One open text-frame connection.
///
/// The transport's reader and writer tasks sit behind the two channels:
/// frames pushed into `outbound` are written to the socket, frames read from
/// the socket arrive on `inbound`. `inbound` yielding `None` means the
/// connection is gone.
#[derive(Debug)]
pub struct Connection {
    /// Frames to write.
    pub outbound: mpsc::Sender<String>,
    /// Frames read.
    pub inbound: mpsc::Receiver<String>,
}

/// Opens raw socket connections for the session supervisor.
///
/// Called once per connection attempt; the supervisor performs the auth
/// handshake over the returned [`Connection`].
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection.
    fn open(&self) -> impl std::future::Future<Output = Result<Connection, TransportError>> + Send;
}

/// Server side of one [`ChannelTransport`] connection.
#[derive(Debug)]
pub struct ChannelPeer {
    /// Frames the client wrote.
    pub from_client: mpsc::Receiver<String>,
    /// Frames to deliver to the client. Dropping it closes the connection.
    pub to_client: mpsc::Sender<String>,
}

/// In-process transport whose connections are plain channel pairs.
///
/// Each [`Transport::open`] call hands the far end of a fresh pair to the
/// `accept` receiver returned by [`ChannelTransport::new`]. With no accept
/// receiver left, opening fails with [`TransportError::Unreachable`].
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    accept: mpsc::Sender<ChannelPeer>,
    capacity: usize,
}

impl ChannelTransport {
    /// Create a transport and the receiver on which new connections appear.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChannelPeer>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                accept: tx,
                capacity: capacity.max(1),
            },
            rx,
        )
    }
}

impl Transport for ChannelTransport {
    async fn open(&self) -> Result<Connection, TransportError> {
        let (client_tx, from_client) = mpsc::channel(self.capacity);
        let (to_client, client_rx) = mpsc::channel(self.capacity);
        self.accept
            .send(ChannelPeer {
                from_client,
                to_client,
            })
            .await
            .map_err(|_| TransportError::Unreachable("channel transport closed".to_string()))?;
        Ok(Connection {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}
