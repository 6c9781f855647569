#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for socket loss, reconnection and auth rejection.
//!
//! ## Disconnect simulation
//!
//! The client's WebSocket goes through a TCP proxy while its REST calls go
//! straight to the hub. Killing the proxy aborts every proxied connection,
//! so the client sees the socket drop; a new proxy on the same port lets the
//! reconnect loop succeed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use studychat::api::HttpChatApi;
use studychat::chat::{ChatClient, ChatEvent, ChatHandle, DeliveryState};
use studychat::config::ClientConfig;
use studychat::transport::ConnectionState;
use studychat::transport::ws::WsTransport;
use studychat_hub::config::HubConfig;
use studychat_hub::hub::{HubState, start_server_with_state};
use studychat_proto::ids::RoomId;
use tokio::sync::broadcast;
use url::Url;

// =============================================================================
// TCP Proxy helper
// =============================================================================

struct TcpProxy {
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend: SocketAddr) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(backend).await
                    else {
                        return;
                    };
                    let _ =
                        tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream).await;
                });
                tracked.lock().push(conn_handle);
            }
        });

        Self {
            accept_handle,
            conn_handles,
        }
    }

    /// Sever every proxied connection and stop accepting.
    fn kill(self) {
        self.accept_handle.abort();
        for h in self.conn_handles.lock().iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_hub() -> SocketAddr {
    let config = HubConfig::default()
        .with_token("alice-token", "alice")
        .with_token("bob-token", "bob");
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::new(HubState::new(&config)))
        .await
        .unwrap();
    addr
}

fn client_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.cache.enabled = false;
    config.reconnect.initial_delay = Duration::from_millis(100);
    config.reconnect.max_delay = Duration::from_millis(300);
    config.reconnect.jitter = 0.0;
    config
}

/// Start a client whose REST calls go to `api_addr` and whose socket goes to
/// `socket_addr`.
fn spawn_client(api_addr: SocketAddr, socket_addr: SocketAddr, token: &str) -> ChatHandle {
    let api = HttpChatApi::new(
        Url::parse(&format!("http://{api_addr}")).unwrap(),
        token,
        Duration::from_secs(5),
    )
    .unwrap();
    let transport = WsTransport::new(format!("ws://{socket_addr}/ws"), Duration::from_secs(2), 64);
    ChatClient::start(api, transport, token.to_string(), client_config())
}

async fn wait_state(handle: &ChatHandle, expected: ConnectionState) {
    let mut state = handle.connection();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("never reached {expected}"))
        .unwrap();
}

async fn wait_for(
    events: &mut broadcast::Receiver<ChatEvent>,
    mut pred: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn message_sent_offline_is_delivered_once_after_reconnect() {
    let hub = start_hub().await;
    let port = find_free_port().await;
    let proxy_addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let proxy = TcpProxy::new(port, hub).await;
    let room = RoomId::new("math");

    let alice = spawn_client(hub, proxy_addr, "alice-token");
    wait_state(&alice, ConnectionState::Connected).await;
    alice.join_room(&room).await.unwrap();
    let bob = spawn_client(hub, hub, "bob-token");
    wait_state(&bob, ConnectionState::Connected).await;
    bob.join_room(&room).await.unwrap();
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    proxy.kill();
    wait_state(&alice, ConnectionState::Reconnecting).await;

    let local_id = alice.send_message(&room, "hi").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let offline = alice.snapshot(&room).await.unwrap();
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].state, DeliveryState::Pending);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let _proxy = TcpProxy::new(port, hub).await;
    wait_state(&alice, ConnectionState::Connected).await;

    let confirmed = wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::MessageConfirmed { local_id: l, .. } if *l == local_id)
    })
    .await;
    assert!(matches!(confirmed, ChatEvent::MessageConfirmed { .. }));
    let received = wait_for(&mut bob_events, |e| matches!(e, ChatEvent::MessageReceived { .. })).await;
    assert!(matches!(received, ChatEvent::MessageReceived { message } if message.content == "hi"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let alice_view = alice.snapshot(&room).await.unwrap();
    assert_eq!(alice_view.len(), 1);
    assert_eq!(alice_view[0].state, DeliveryState::Confirmed);
    let bob_view = bob.snapshot(&room).await.unwrap();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].message.content, "hi");
}

#[tokio::test]
async fn rooms_are_rejoined_after_reconnect() {
    let hub = start_hub().await;
    let port = find_free_port().await;
    let proxy_addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let proxy = TcpProxy::new(port, hub).await;
    let room = RoomId::new("math");

    let alice = spawn_client(hub, proxy_addr, "alice-token");
    wait_state(&alice, ConnectionState::Connected).await;
    alice.join_room(&room).await.unwrap();
    let bob = spawn_client(hub, hub, "bob-token");
    wait_state(&bob, ConnectionState::Connected).await;
    bob.join_room(&room).await.unwrap();
    let mut alice_events = alice.subscribe();

    proxy.kill();
    wait_state(&alice, ConnectionState::Reconnecting).await;
    let reconnecting = wait_for(&mut alice_events, |e| matches!(e, ChatEvent::Reconnecting { .. })).await;
    assert!(matches!(reconnecting, ChatEvent::Reconnecting { attempt } if attempt >= 1));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let _proxy = TcpProxy::new(port, hub).await;
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::RoomJoined { room_id, .. } if *room_id == room)
    })
    .await;
    assert_eq!(alice.joined_rooms().await.unwrap(), vec![room.clone()]);

    bob.send_message(&room, "welcome back").await.unwrap();
    let received = wait_for(&mut alice_events, |e| matches!(e, ChatEvent::MessageReceived { .. })).await;
    assert!(
        matches!(received, ChatEvent::MessageReceived { message } if message.content == "welcome back")
    );
}

#[tokio::test]
async fn rejected_token_stops_the_session() {
    let hub = start_hub().await;
    let handle = spawn_client(hub, hub, "forged-token");
    let mut events = handle.subscribe();

    let rejected = wait_for(&mut events, |e| matches!(e, ChatEvent::AuthRejected { .. })).await;
    assert!(matches!(rejected, ChatEvent::AuthRejected { .. }));
    wait_state(&handle, ConnectionState::Disconnected).await;
}
