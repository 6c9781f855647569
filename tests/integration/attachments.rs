#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for chunked attachment uploads through the hub's
//! multipart endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use studychat::ChatError;
use studychat::api::HttpChatApi;
use studychat::chat::{ChatClient, ChatEvent, ChatHandle, DeliveryState, OutgoingFile, UploadStatus};
use studychat::config::ClientConfig;
use studychat::transport::ConnectionState;
use studychat::transport::ws::WsTransport;
use studychat_hub::config::HubConfig;
use studychat_hub::hub::{HubState, start_server_with_state};
use studychat_proto::ids::RoomId;
use studychat_proto::message::{MessageKind, ValidationError};
use tokio::sync::broadcast;
use url::Url;

async fn start_hub(max_file_size: usize) -> SocketAddr {
    let mut config = HubConfig::default()
        .with_token("alice-token", "alice")
        .with_token("bob-token", "bob");
    config.max_file_size = max_file_size;
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::new(HubState::new(&config)))
        .await
        .unwrap();
    addr
}

async fn start_client(addr: SocketAddr, token: &str, room: &RoomId) -> ChatHandle {
    let mut config = ClientConfig::default();
    config.cache.enabled = false;
    config.upload.chunk_size = 4;
    config.upload.max_file_size = 64;
    config.upload.backoff_base = Duration::from_millis(10);
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

fn file(mime_type: &str, bytes: &[u8]) -> OutgoingFile {
    OutgoingFile {
        file_name: "notes.pdf".to_string(),
        mime_type: mime_type.to_string(),
        bytes: bytes.to_vec(),
    }
}

#[tokio::test]
async fn upload_completes_and_file_message_is_delivered() {
    let addr = start_hub(1024).await;
    let room = RoomId::new("math");
    let alice = start_client(addr, "alice-token", &room).await;
    let bob = start_client(addr, "bob-token", &room).await;
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let content = b"limits and continuity";
    let attachment_id = alice
        .upload(&room, file("application/pdf", content))
        .await
        .unwrap();

    let placeholder = alice.snapshot(&room).await.unwrap();
    assert_eq!(placeholder.len(), 1);
    assert_eq!(placeholder[0].state, DeliveryState::Pending);
    assert_eq!(placeholder[0].message.kind, MessageKind::File);

    let ChatEvent::UploadComplete { url, .. } =
        wait_for(&mut alice_events, |e| matches!(e, ChatEvent::UploadComplete { .. })).await
    else {
        unreachable!()
    };

    let ChatEvent::MessageReceived { message } =
        wait_for(&mut bob_events, |e| matches!(e, ChatEvent::MessageReceived { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(message.kind, MessageKind::File);
    assert_eq!(message.content, url);

    let attachment = alice.attachment(attachment_id).await.unwrap().unwrap();
    assert_eq!(attachment.status, UploadStatus::Complete);
    assert_eq!(attachment.acked_chunks(), attachment.chunk_count());

    let downloaded = reqwest::get(format!("http://{addr}{url}"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(downloaded.as_ref(), content);
}

#[tokio::test]
async fn disallowed_files_are_rejected_locally() {
    let addr = start_hub(1024).await;
    let room = RoomId::new("math");
    let alice = start_client(addr, "alice-token", &room).await;

    let err = alice.upload(&room, file("text/html", b"<p>")).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::UnsupportedMime(_))));

    let err = alice
        .upload(&room, file("application/pdf", &[0; 65]))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::FileTooLarge { .. })));

    let err = alice.upload(&room, file("application/pdf", b"")).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::EmptyFile)));

    assert!(alice.snapshot(&room).await.unwrap().is_empty());
}

#[tokio::test]
async fn hub_rejection_fails_upload_and_placeholder() {
    // The hub caps files at 8 bytes; the third 4-byte chunk overflows it.
    let addr = start_hub(8).await;
    let room = RoomId::new("math");
    let alice = start_client(addr, "alice-token", &room).await;
    let mut events = alice.subscribe();

    let attachment_id = alice
        .upload(&room, file("application/pdf", b"0123456789ab"))
        .await
        .unwrap();

    wait_for(&mut events, |e| matches!(e, ChatEvent::UploadFailed { .. })).await;
    let attachment = alice.attachment(attachment_id).await.unwrap().unwrap();
    assert!(matches!(attachment.status, UploadStatus::Failed(_)));

    let timeline = alice.snapshot(&room).await.unwrap();
    assert!(matches!(timeline[0].state, DeliveryState::Failed(_)));
}
