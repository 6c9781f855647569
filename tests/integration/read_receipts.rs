#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for read state and read receipts.
//!
//! Receipts are coalesced on the client, stored as a monotonic watermark on
//! the hub, and fanned out to every member including the reader's other
//! devices.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use studychat::api::{ChatApi, HttpChatApi};
use studychat::chat::{ChatClient, ChatEvent, ChatHandle, ReadState};
use studychat::config::ClientConfig;
use studychat::transport::ConnectionState;
use studychat::transport::ws::WsTransport;
use studychat_hub::config::HubConfig;
use studychat_hub::hub::{HubState, start_server_with_state};
use studychat_proto::ids::{RoomId, UserId};
use studychat_proto::message::{Message, Position};
use studychat_proto::rest::HistoryQuery;
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

fn api(addr: SocketAddr, token: &str) -> HttpChatApi {
    HttpChatApi::new(
        Url::parse(&format!("http://{addr}")).unwrap(),
        token,
        Duration::from_secs(5),
    )
    .unwrap()
}

async fn start_client(addr: SocketAddr, token: &str, room: &RoomId) -> ChatHandle {
    let mut config = ClientConfig::default();
    config.cache.enabled = false;
    config.reads.coalesce = Duration::from_millis(100);
    let transport = WsTransport::new(format!("ws://{addr}/ws"), Duration::from_secs(5), 64);
    let handle = ChatClient::start(api(addr, token), transport, token.to_string(), config);
    let mut state = handle.connection();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("client did not connect")
    .unwrap();
    handle.join_room(room).await.unwrap();
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

async fn next_message(events: &mut broadcast::Receiver<ChatEvent>) -> Message {
    match wait_for(events, |e| matches!(e, ChatEvent::MessageReceived { .. })).await {
        ChatEvent::MessageReceived { message } => message,
        _ => unreachable!(),
    }
}

fn read_state_is(expected: ReadState) -> impl Fn(&ChatEvent) -> bool {
    move |e| matches!(e, ChatEvent::ReadStateChanged { state, .. } if *state == expected)
}

#[tokio::test]
async fn delivered_then_read_and_receipt_reaches_sender() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let alice = start_client(addr, "alice-token", &room).await;
    let bob = start_client(addr, "bob-token", &room).await;
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    bob.send_message(&room, "read me").await.unwrap();
    let message = next_message(&mut alice_events).await;
    let position = message.position().unwrap();
    assert_eq!(alice.read_state(&room).await.unwrap(), ReadState::Delivered);

    alice.mark_read(&room, None).await.unwrap();
    assert_eq!(alice.read_state(&room).await.unwrap(), ReadState::Read(position));

    let read_by = wait_for(&mut bob_events, |e| matches!(e, ChatEvent::ReadBy { .. })).await;
    assert_eq!(
        read_by,
        ChatEvent::ReadBy {
            room_id: room.clone(),
            user_id: UserId::new("alice"),
            up_to: position,
        }
    );
    let timeline = bob.snapshot(&room).await.unwrap();
    assert!(timeline[0].message.read_by.contains(&UserId::new("alice")));
}

#[tokio::test]
async fn new_message_after_read_moves_back_to_delivered() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let alice = start_client(addr, "alice-token", &room).await;
    let bob = start_client(addr, "bob-token", &room).await;
    let mut alice_events = alice.subscribe();

    bob.send_message(&room, "first").await.unwrap();
    next_message(&mut alice_events).await;
    alice.mark_read(&room, None).await.unwrap();

    bob.send_message(&room, "second").await.unwrap();
    next_message(&mut alice_events).await;
    assert_eq!(alice.read_state(&room).await.unwrap(), ReadState::Delivered);
}

#[tokio::test]
async fn two_devices_converge_on_the_later_read() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let phone = start_client(addr, "alice-token", &room).await;
    let laptop = start_client(addr, "alice-token", &room).await;
    let bob = start_client(addr, "bob-token", &room).await;
    let mut phone_events = phone.subscribe();
    let mut laptop_events = laptop.subscribe();

    bob.send_message(&room, "m1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.send_message(&room, "m2").await.unwrap();

    let mut positions: Vec<Position> = Vec::new();
    for _ in 0..2 {
        positions.push(next_message(&mut phone_events).await.position().unwrap());
        next_message(&mut laptop_events).await;
    }
    positions.sort();
    let (t1, t2) = (positions[0], positions[1]);

    // Phone reads up to m1, laptop later reads up to m2.
    phone.mark_read(&room, Some(t1)).await.unwrap();
    wait_for(&mut laptop_events, read_state_is(ReadState::Read(t1))).await;
    laptop.mark_read(&room, Some(t2)).await.unwrap();
    wait_for(&mut phone_events, read_state_is(ReadState::Read(t2))).await;

    // A stale read on the phone does not move anything back.
    phone.mark_read(&room, Some(t1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(phone.read_state(&room).await.unwrap(), ReadState::Read(t2));
    assert_eq!(laptop.read_state(&room).await.unwrap(), ReadState::Read(t2));

    let page = api(addr, "bob-token")
        .history(&room, HistoryQuery::default())
        .await
        .unwrap();
    let alice = UserId::new("alice");
    assert!(page.messages.iter().all(|m| m.read_by.contains(&alice)));
}
