#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for typing indicators and online presence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use studychat::api::HttpChatApi;
use studychat::chat::{ChatClient, ChatEvent, ChatHandle};
use studychat::config::ClientConfig;
use studychat::transport::ConnectionState;
use studychat::transport::ws::WsTransport;
use studychat_hub::config::HubConfig;
use studychat_hub::hub::{HubState, start_server_with_state};
use studychat_proto::ids::{RoomId, UserId};
use studychat_proto::presence::PresenceStatus;
use tokio::sync::broadcast;
use url::Url;

async fn start_hub() -> SocketAddr {
    let config = HubConfig::default()
        .with_token("alice-token", "alice")
        .with_token("bob-token", "bob");
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::new(HubState::new(&config)))
        .await
        .unwrap();
    addr
}

async fn start_client(addr: SocketAddr, token: &str, typing_idle: Duration) -> ChatHandle {
    let mut config = ClientConfig::default();
    config.cache.enabled = false;
    config.presence.typing_idle = typing_idle;
    let api = HttpChatApi::new(
        Url::parse(&format!("http://{addr}")).unwrap(),
        token,
        Duration::from_secs(5),
    )
    .unwrap();
    let transport = WsTransport::new(format!("ws://{addr}/ws"), Duration::from_secs(5), 64);
    let handle = ChatClient::start(api, transport, token.to_string(), config);
    let mut state = handle.connection();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("client did not connect")
    .unwrap();
    handle
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

fn typing_is(users: &[&str]) -> impl Fn(&ChatEvent) -> bool {
    let expected: Vec<UserId> = users.iter().map(|u| UserId::new(*u)).collect();
    move |e| matches!(e, ChatEvent::TypingChanged { users, .. } if *users == expected)
}

async fn pair(addr: SocketAddr, room: &RoomId, typing_idle: Duration) -> (ChatHandle, ChatHandle) {
    let alice = start_client(addr, "alice-token", typing_idle).await;
    let bob = start_client(addr, "bob-token", typing_idle).await;
    alice.join_room(room).await.unwrap();
    bob.join_room(room).await.unwrap();
    (alice, bob)
}

#[tokio::test]
async fn typing_and_stop_reach_other_member() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let (alice, bob) = pair(addr, &room, Duration::from_secs(10)).await;
    let mut events = bob.subscribe();

    alice.typing(&room).await;
    wait_for(&mut events, typing_is(&["alice"])).await;
    assert_eq!(bob.typing_in(&room).await.unwrap(), vec![UserId::new("alice")]);

    alice.stop_typing(&room).await;
    wait_for(&mut events, typing_is(&[])).await;
    assert!(bob.typing_in(&room).await.unwrap().is_empty());
}

#[tokio::test]
async fn idle_typist_sends_trailing_stop() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let (alice, bob) = pair(addr, &room, Duration::from_millis(300)).await;
    let mut events = bob.subscribe();

    alice.typing(&room).await;
    wait_for(&mut events, typing_is(&["alice"])).await;
    wait_for(&mut events, typing_is(&[])).await;
}

#[tokio::test]
async fn message_from_typist_clears_indicator() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let (alice, bob) = pair(addr, &room, Duration::from_secs(10)).await;
    let mut events = bob.subscribe();

    alice.typing(&room).await;
    wait_for(&mut events, typing_is(&["alice"])).await;

    alice.send_message(&room, "done typing").await.unwrap();
    wait_for(&mut events, typing_is(&[])).await;
}

#[tokio::test]
async fn presence_follows_connections() {
    let addr = start_hub().await;
    let alice = start_client(addr, "alice-token", Duration::from_secs(2)).await;
    let mut events = alice.subscribe();
    let bob_id = UserId::new("bob");

    let bob = start_client(addr, "bob-token", Duration::from_secs(2)).await;
    wait_for(&mut events, |e| {
        *e == ChatEvent::PresenceChanged {
            user_id: UserId::new("bob"),
            status: PresenceStatus::Online,
        }
    })
    .await;
    assert!(alice.is_online(&bob_id).await.unwrap());

    bob.shutdown().await;
    wait_for(&mut events, |e| {
        *e == ChatEvent::PresenceChanged {
            user_id: UserId::new("bob"),
            status: PresenceStatus::Offline,
        }
    })
    .await;
    assert!(!alice.is_online(&bob_id).await.unwrap());
}
