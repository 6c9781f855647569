//! Property-based tests for the socket codec and message ordering.
//!
//! 1. Any inbound `ServerEvent` survives encode → decode.
//! 2. Arbitrary text frames never panic the decoder.
//! 3. `Position` ordering agrees with `(created_at, message_id)` tuple order.
//! 4. Text validation agrees with the byte-size cap.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;

use proptest::prelude::*;
use studychat_proto::codec;
use studychat_proto::event::ServerEvent;
use studychat_proto::ids::{LocalId, MessageId, RoomId, Timestamp, UserId};
use studychat_proto::message::{
    MAX_MESSAGE_SIZE, Message, MessageKind, Position, ValidationError, validate_text,
};
use studychat_proto::presence::PresenceStatus;
use uuid::Uuid;

fn arb_user() -> impl Strategy<Value = UserId> {
    "[a-z]{1,12}".prop_map(UserId::new)
}

fn arb_room() -> impl Strategy<Value = RoomId> {
    "[a-z0-9-]{1,16}".prop_map(RoomId::new)
}

fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Text),
        Just(MessageKind::Image),
        Just(MessageKind::File),
        Just(MessageKind::Video),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        proptest::option::of(any::<u64>()),
        arb_room(),
        arb_user(),
        ".{0,256}",
        arb_kind(),
        any::<u64>(),
        prop::collection::btree_set(arb_user(), 0..4),
        proptest::option::of(any::<u128>()),
    )
        .prop_map(
            |(id, room_id, sender_id, content, kind, at, read_by, local)| Message {
                message_id: id.map(MessageId::new),
                room_id,
                sender_id,
                content,
                kind,
                created_at: Timestamp::from_millis(at),
                read_by: read_by.into_iter().collect::<BTreeSet<_>>(),
                local_id: local.map(|n| LocalId::from_uuid(Uuid::from_u128(n))),
            },
        )
}

fn arb_server_event() -> impl Strategy<Value = ServerEvent> {
    prop_oneof![
        arb_user().prop_map(|user_id| ServerEvent::AuthOk { user_id }),
        (arb_room(), any::<u64>(), prop::collection::vec(arb_user(), 0..5)).prop_map(
            |(room_id, ack, participants)| ServerEvent::Joined {
                room_id,
                ack,
                participants,
            }
        ),
        arb_message().prop_map(ServerEvent::Message),
        (arb_room(), arb_user())
            .prop_map(|(room_id, user_id)| ServerEvent::Typing { room_id, user_id }),
        (arb_room(), arb_user(), any::<u64>(), any::<u64>()).prop_map(
            |(room_id, user_id, id, at)| ServerEvent::Read {
                room_id,
                user_id,
                message_id: MessageId::new(id),
                created_at: Timestamp::from_millis(at),
            }
        ),
        arb_user().prop_map(|user_id| ServerEvent::StatusChange {
            user_id,
            status: PresenceStatus::Away,
        }),
    ]
}

proptest! {
    #[test]
    fn server_events_survive_the_codec(event in arb_server_event()) {
        let frame = codec::encode(&event).unwrap();
        let back: ServerEvent = codec::decode(&frame).unwrap();
        prop_assert_eq!(event, back);
    }

    #[test]
    fn decoder_never_panics_on_arbitrary_text(frame in ".{0,512}") {
        let _ = codec::decode::<ServerEvent>(&frame);
    }

    #[test]
    fn position_order_matches_tuple_order(
        a in (any::<u64>(), any::<u64>()),
        b in (any::<u64>(), any::<u64>()),
    ) {
        let pa = Position { created_at: Timestamp::from_millis(a.0), message_id: MessageId::new(a.1) };
        let pb = Position { created_at: Timestamp::from_millis(b.0), message_id: MessageId::new(b.1) };
        prop_assert_eq!(pa.cmp(&pb), a.cmp(&b));
    }

    #[test]
    fn validation_agrees_with_size_cap(len in 0usize..(MAX_MESSAGE_SIZE + 64)) {
        let text = "x".repeat(len);
        match validate_text(&text) {
            Ok(()) => prop_assert!(len > 0 && len <= MAX_MESSAGE_SIZE),
            Err(ValidationError::Empty) => prop_assert_eq!(len, 0),
            Err(ValidationError::TooLarge { size, .. }) => prop_assert_eq!(size, len),
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }
}
