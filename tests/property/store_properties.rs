//! Property-based tests for the client-side timeline and read tracking.
//!
//! 1. However often and in whatever order messages arrive, each id is stored
//!    once and the timeline stays in `(created_at, message_id)` order.
//! 2. Echoes of optimistic sends confirm them in place instead of adding
//!    copies.
//! 3. The read watermark only ever moves forward, whichever device the read
//!    came from.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use proptest::prelude::*;
use studychat::chat::read::ReadTracker;
use studychat::chat::store::MessageStore;
use studychat::chat::{DeliveryState, ReadState};
use studychat_proto::ids::{MessageId, RoomId, Timestamp, UserId};
use studychat_proto::message::{Message, MessageKind, Position};
use tokio::time::Instant;

fn message(room: &RoomId, id: u64, at: u64) -> Message {
    Message {
        message_id: Some(MessageId::new(id)),
        room_id: room.clone(),
        sender_id: UserId::new("bob"),
        content: format!("m{id}"),
        kind: MessageKind::Text,
        created_at: Timestamp::from_millis(at),
        read_by: BTreeSet::new(),
        local_id: None,
    }
}

/// Creation times for up to 20 messages; a narrow range forces ties.
fn arb_times() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..20, 1..20)
}

fn arb_position() -> impl Strategy<Value = Position> {
    (0u64..100, 1u64..100).prop_map(|(at, id)| Position {
        created_at: Timestamp::from_millis(at),
        message_id: MessageId::new(id),
    })
}

proptest! {
    #[test]
    fn repeated_delivery_never_duplicates(
        times in arb_times(),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 1..60),
        split in any::<prop::sample::Index>(),
    ) {
        let room = RoomId::new("math");
        let all: Vec<Message> = times
            .iter()
            .enumerate()
            .map(|(i, at)| message(&room, i as u64 + 1, *at))
            .collect();
        let arrivals: Vec<Message> = picks.iter().map(|p| all[p.index(all.len())].clone()).collect();

        // Part arrives live, the rest (plus repeats) through a history page.
        let cut = split.index(arrivals.len() + 1);
        let mut store = MessageStore::new();
        for m in &arrivals[..cut] {
            store.receive(m.clone());
        }
        store.merge_history(&room, arrivals[cut..].to_vec());
        store.merge_history(&room, arrivals.clone());

        let snapshot = store.snapshot(&room);
        let expected: HashSet<MessageId> = arrivals.iter().filter_map(|m| m.message_id).collect();
        let ids: Vec<MessageId> = snapshot.iter().filter_map(|s| s.message.message_id).collect();
        prop_assert_eq!(ids.len(), expected.len());
        prop_assert_eq!(ids.iter().copied().collect::<HashSet<_>>(), expected);

        let positions: Vec<Position> = snapshot.iter().filter_map(|s| s.message.position()).collect();
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn echoes_confirm_pending_in_place(
        count in 1usize..10,
        echo_order in any::<u64>(),
        repeats in 1usize..3,
    ) {
        let room = RoomId::new("math");
        let alice = UserId::new("alice");
        let mut store = MessageStore::new();
        let locals: Vec<_> = (0..count)
            .map(|i| {
                store.insert_pending(&room, &alice, &format!("p{i}"), MessageKind::Text, Timestamp::from_millis(i as u64))
            })
            .collect();

        let mut echoes: Vec<Message> = locals
            .iter()
            .enumerate()
            .map(|(i, local)| {
                let mut m = message(&room, i as u64 + 1, i as u64);
                m.sender_id = alice.clone();
                m.content = format!("p{i}");
                m.local_id = Some(*local);
                m
            })
            .collect();
        let len = echoes.len();
        for i in (1..len).rev() {
            let j = usize::try_from(echo_order.wrapping_mul(i as u64 + 7) % (i as u64 + 1)).unwrap();
            echoes.swap(i, j);
        }
        for _ in 0..repeats {
            for echo in &echoes {
                store.receive(echo.clone());
            }
        }

        let snapshot = store.snapshot(&room);
        prop_assert_eq!(snapshot.len(), count);
        prop_assert!(snapshot.iter().all(|s| s.state == DeliveryState::Confirmed));
        let contents: Vec<String> = snapshot.iter().map(|s| s.message.content.clone()).collect();
        let expected: Vec<String> = (0..count).map(|i| format!("p{i}")).collect();
        prop_assert_eq!(contents, expected);
    }

    #[test]
    fn read_watermark_is_monotonic(
        reads in prop::collection::vec((arb_position(), any::<bool>()), 1..40),
    ) {
        let room = RoomId::new("math");
        let mut tracker = ReadTracker::new(Duration::from_millis(500));
        let now = Instant::now();
        let mut highest: Option<Position> = None;

        for (position, remote) in reads {
            if remote {
                tracker.apply_remote_read(&room, position);
            } else {
                tracker.mark_read(&room, position, now);
            }
            highest = Some(highest.map_or(position, |h| h.max(position)));
            prop_assert_eq!(tracker.watermark(&room), highest);
        }

        let top = highest.unwrap();
        prop_assert_eq!(tracker.state(&room), ReadState::Read(top));
        // A queued receipt never points past the watermark.
        for receipt in tracker.flush_due(now + Duration::from_secs(1)) {
            prop_assert!(receipt.up_to <= top);
        }
    }
}
