//! Hub core: shared state, connection registry, broadcast and server
//! startup.
//!
//! Each authenticated socket gets a [`ConnId`] and an unbounded outbound
//! channel drained by its writer task. A user may hold several connections
//! (one per device); presence is online while at least one is open.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message as WsMessage;
use studychat_proto::codec;
use studychat_proto::event::ServerEvent;
use studychat_proto::ids::{RoomId, UserId};
use tokio::sync::{RwLock, mpsc};

use crate::config::HubConfig;
use crate::store::{RoomStore, UploadStore};

/// Identifier of one socket connection.
pub type ConnId = u64;

#[derive(Debug)]
struct Peer {
    user_id: UserId,
    sender: mpsc::UnboundedSender<WsMessage>,
    rooms: HashSet<RoomId>,
}

/// Shared hub state.
#[derive(Debug)]
pub struct HubState {
    tokens: HashMap<String, UserId>,
    allowed_rooms: HashSet<RoomId>,
    connections: RwLock<HashMap<ConnId, Peer>>,
    next_conn: AtomicU64,
    /// Room logs and read watermarks.
    pub rooms: RoomStore,
    /// Upload assembly.
    pub uploads: UploadStore,
}

impl HubState {
    /// Creates hub state from a resolved configuration.
    #[must_use]
    pub fn new(config: &HubConfig) -> Self {
        Self {
            tokens: config.tokens.clone(),
            allowed_rooms: config.rooms.iter().cloned().collect(),
            connections: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            rooms: RoomStore::new(),
            uploads: UploadStore::new(config.max_file_size),
        }
    }

    /// The user a bearer token authenticates.
    #[must_use]
    pub fn authenticate(&self, token: &str) -> Option<&UserId> {
        self.tokens.get(token)
    }

    /// Whether `room` may be joined.
    #[must_use]
    pub fn room_allowed(&self, room: &RoomId) -> bool {
        self.allowed_rooms.is_empty() || self.allowed_rooms.contains(room)
    }

    /// Register a connection. Returns its id and whether it is the user's
    /// first open connection.
    pub async fn register(
        &self,
        user_id: &UserId,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) -> (ConnId, bool) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.connections.write().await;
        let first = !conns.values().any(|p| &p.user_id == user_id);
        conns.insert(
            conn_id,
            Peer {
                user_id: user_id.clone(),
                sender,
                rooms: HashSet::new(),
            },
        );
        (conn_id, first)
    }

    /// Remove a connection. Returns whether it was the user's last one.
    pub async fn unregister(&self, conn_id: ConnId) -> bool {
        let mut conns = self.connections.write().await;
        let Some(peer) = conns.remove(&conn_id) else {
            return false;
        };
        !conns.values().any(|p| p.user_id == peer.user_id)
    }

    /// Subscribe a connection to `room`. Returns the room's participants.
    pub async fn join(&self, conn_id: ConnId, room: &RoomId) -> Vec<UserId> {
        self.rooms.ensure_room(room).await;
        let mut conns = self.connections.write().await;
        if let Some(peer) = conns.get_mut(&conn_id) {
            peer.rooms.insert(room.clone());
        }
        let mut participants: Vec<UserId> = conns
            .values()
            .filter(|p| p.rooms.contains(room))
            .map(|p| p.user_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        participants.sort();
        participants
    }

    /// Unsubscribe a connection from `room`.
    pub async fn leave(&self, conn_id: ConnId, room: &RoomId) {
        if let Some(peer) = self.connections.write().await.get_mut(&conn_id) {
            peer.rooms.remove(room);
        }
    }

    /// Whether the connection is subscribed to `room`.
    pub async fn is_member(&self, conn_id: ConnId, room: &RoomId) -> bool {
        self.connections
            .read()
            .await
            .get(&conn_id)
            .is_some_and(|p| p.rooms.contains(room))
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send `event` to every connection subscribed to `room`, skipping those
    /// of `except`.
    pub async fn broadcast_room(&self, room: &RoomId, event: &ServerEvent, except: Option<&UserId>) {
        let Some(frame) = encode(event) else {
            return;
        };
        let conns = self.connections.read().await;
        let mut sent = 0usize;
        for peer in conns.values() {
            if !peer.rooms.contains(room) || except.is_some_and(|u| &peer.user_id == u) {
                continue;
            }
            if peer.sender.send(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        drop(conns);
        tracing::debug!(room_id = %room, event = event.name(), sent, "broadcast");
    }

    /// Send `event` to every connection except those of `except`.
    pub async fn broadcast_all(&self, event: &ServerEvent, except: &UserId) {
        let Some(frame) = encode(event) else {
            return;
        };
        let conns = self.connections.read().await;
        for peer in conns.values().filter(|p| &p.user_id != except) {
            let _ = peer.sender.send(frame.clone());
        }
    }

    /// Send a Close frame to every connection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn_id, peer) in conns.iter() {
            tracing::info!(conn_id, user_id = %peer.user_id, "closing connection");
            let _ = peer.sender.send(WsMessage::Close(None));
        }
    }
}

/// Encode a server event as a text frame.
pub(crate) fn encode(event: &ServerEvent) -> Option<WsMessage> {
    match codec::encode(event) {
        Ok(text) => Some(WsMessage::Text(text.into())),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode server event");
            None
        }
    }
}

/// Starts the hub with state built from `config`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server(
    config: &HubConfig,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(&config.bind_addr, Arc::new(HubState::new(config))).await
}

/// Starts the hub on `addr` with pre-built state and returns the bound
/// address and the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<HubState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = crate::rest::router(state.uploads.max_file_size())
        .route("/ws", axum::routing::get(crate::socket::ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "hub server error");
        }
    });

    Ok((bound_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> HubState {
        HubState::new(&HubConfig::default().with_token("t", "alice"))
    }

    #[tokio::test]
    async fn presence_follows_first_and_last_connection() {
        let state = state();
        let alice = UserId::new("alice");
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let (c1, first) = state.register(&alice, tx1).await;
        assert!(first);
        let (c2, first) = state.register(&alice, tx2).await;
        assert!(!first);

        assert!(!state.unregister(c1).await);
        assert!(state.unregister(c2).await);
        assert_eq!(state.connection_count().await, 0);
    }

    #[tokio::test]
    async fn room_broadcast_skips_excluded_user_and_non_members() {
        let state = state();
        let room = RoomId::new("math");
        let (alice, bob, carol) = (UserId::new("alice"), UserId::new("bob"), UserId::new("carol"));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        let (a, _) = state.register(&alice, tx_a).await;
        let (b, _) = state.register(&bob, tx_b).await;
        state.register(&carol, tx_c).await;
        state.join(a, &room).await;
        let participants = state.join(b, &room).await;
        assert_eq!(participants, vec![alice.clone(), bob.clone()]);

        let typing = ServerEvent::Typing {
            room_id: room.clone(),
            user_id: alice.clone(),
        };
        state.broadcast_room(&room, &typing, Some(&alice)).await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn room_allow_list() {
        let open = state();
        assert!(open.room_allowed(&RoomId::new("anything")));

        let mut config = HubConfig::default();
        config.rooms = vec![RoomId::new("math")];
        let closed = HubState::new(&config);
        assert!(closed.room_allowed(&RoomId::new("math")));
        assert!(!closed.room_allowed(&RoomId::new("art")));
    }

    #[test]
    fn token_lookup() {
        let state = state();
        assert_eq!(state.authenticate("t"), Some(&UserId::new("alice")));
        assert_eq!(state.authenticate("nope"), None);
    }
}
