//! Per-room ordered message store.
//!
//! Merges REST history pages, live `chat:message` events and optimistic
//! local sends into one de-duplicated timeline per room, ordered by
//! `(created_at, message_id)`. Pending messages (no server id yet) sort
//! after confirmed messages with the same timestamp, in insertion order.
//!
//! Each stored message carries a [`DeliveryState`]:
//!
//! ```text
//! Pending ──confirm──▶ Confirmed
//!    │  ▲
//!  fail retry
//!    ▼  │
//!   Failed
//! ```

use std::collections::{HashMap, HashSet};

use studychat_proto::ids::{LocalId, MessageId, RoomId, Timestamp, UserId};
use studychat_proto::message::{Message, MessageKind, Position};

/// Delivery state of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sent optimistically, no server id yet.
    Pending,
    /// The server assigned an id.
    Confirmed,
    /// Sending gave up; only an explicit retry moves it back to pending.
    Failed(String),
}

/// A message plus its local bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// The message as currently known.
    pub message: Message,
    /// Delivery state.
    pub state: DeliveryState,
    /// Send attempts made for a pending message.
    pub attempts: u32,
    seq: u64,
}

impl StoredMessage {
    /// Whether the server has assigned an id.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.state == DeliveryState::Confirmed
    }

    fn sort_key(&self) -> (Timestamp, u8, u64) {
        match (self.message.message_id, &self.state) {
            (Some(id), DeliveryState::Confirmed) => (self.message.created_at, 0, id.get()),
            _ => (self.message.created_at, 1, self.seq),
        }
    }
}

/// Result of [`MessageStore::confirm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The pending entry became confirmed.
    Confirmed,
    /// The entry was already confirmed; nothing changed.
    AlreadyConfirmed,
    /// No entry with that local id.
    Unknown,
}

/// Result of [`MessageStore::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A new message was added.
    Inserted,
    /// The message confirmed the pending entry with this local id.
    Confirmed(LocalId),
    /// Already stored.
    Duplicate,
    /// The message has no server id and cannot be stored.
    Ignored,
}

#[derive(Debug, Default)]
struct Timeline {
    entries: Vec<StoredMessage>,
    ids: HashSet<MessageId>,
}

impl Timeline {
    fn position_of_local(&self, local_id: LocalId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.local_id == Some(local_id))
    }

    fn insert_sorted(&mut self, entry: StoredMessage) {
        let key = entry.sort_key();
        let at = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(at, entry);
    }

    /// Re-seat the entry at `idx` if its key no longer fits its neighbours.
    fn reseat(&mut self, idx: usize) {
        let key = self.entries[idx].sort_key();
        let before_ok = idx == 0 || self.entries[idx - 1].sort_key() <= key;
        let after_ok = idx + 1 >= self.entries.len() || key <= self.entries[idx + 1].sort_key();
        if before_ok && after_ok {
            return;
        }
        tracing::debug!(created_at = %self.entries[idx].message.created_at, "confirmed message moved to keep order");
        let entry = self.entries.remove(idx);
        self.insert_sorted(entry);
    }
}

/// Ordered, de-duplicated message timelines keyed by room.
#[derive(Debug, Default)]
pub struct MessageStore {
    rooms: HashMap<RoomId, Timeline>,
    next_seq: u64,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Append an optimistic pending message and return its local id.
    pub fn insert_pending(
        &mut self,
        room: &RoomId,
        sender: &UserId,
        content: &str,
        kind: MessageKind,
        now: Timestamp,
    ) -> LocalId {
        let local_id = LocalId::new();
        let seq = self.next_seq();
        let message = Message {
            message_id: None,
            room_id: room.clone(),
            sender_id: sender.clone(),
            content: content.to_string(),
            kind,
            created_at: now,
            read_by: std::collections::BTreeSet::new(),
            local_id: Some(local_id),
        };
        self.rooms.entry(room.clone()).or_default().insert_sorted(StoredMessage {
            message,
            state: DeliveryState::Pending,
            attempts: 0,
            seq,
        });
        tracing::debug!(room_id = %room, local_id = %local_id, "pending message inserted");
        local_id
    }

    /// Replace the pending entry `local_id` with the confirmed `server`
    /// message, keeping its place in the timeline.
    ///
    /// Happens at most once per entry; repeating it is a no-op.
    pub fn confirm(&mut self, room: &RoomId, local_id: LocalId, server: &Message) -> ConfirmOutcome {
        let Some(timeline) = self.rooms.get_mut(room) else {
            return ConfirmOutcome::Unknown;
        };
        let Some(idx) = timeline.position_of_local(local_id) else {
            return ConfirmOutcome::Unknown;
        };
        if timeline.entries[idx].is_confirmed() {
            return ConfirmOutcome::AlreadyConfirmed;
        }
        let Some(message_id) = server.message_id else {
            tracing::warn!(room_id = %room, local_id = %local_id, "confirmation without message id");
            return ConfirmOutcome::Unknown;
        };

        if timeline.ids.contains(&message_id) {
            // The same message already arrived without its local id.
            timeline.entries.remove(idx);
            tracing::debug!(room_id = %room, message_id = %message_id, "dropped pending twin of stored message");
            return ConfirmOutcome::Confirmed;
        }

        let entry = &mut timeline.entries[idx];
        let mut message = server.clone();
        message.local_id = Some(local_id);
        message.read_by.extend(entry.message.read_by.iter().cloned());
        entry.message = message;
        entry.state = DeliveryState::Confirmed;
        timeline.ids.insert(message_id);
        timeline.reseat(idx);
        tracing::debug!(room_id = %room, local_id = %local_id, message_id = %message_id, "message confirmed");
        ConfirmOutcome::Confirmed
    }

    /// Merge a live message.
    ///
    /// Appends unseen ids, confirms a pending entry whose local id matches,
    /// and ignores anything already stored.
    pub fn receive(&mut self, message: Message) -> ReceiveOutcome {
        let Some(message_id) = message.message_id else {
            tracing::warn!(room_id = %message.room_id, "ignoring message without id");
            return ReceiveOutcome::Ignored;
        };
        let room = message.room_id.clone();
        if self
            .rooms
            .get(&room)
            .is_some_and(|t| t.ids.contains(&message_id))
        {
            return ReceiveOutcome::Duplicate;
        }

        if let Some(local_id) = message.local_id {
            match self.confirm(&room, local_id, &message) {
                ConfirmOutcome::Confirmed => return ReceiveOutcome::Confirmed(local_id),
                ConfirmOutcome::AlreadyConfirmed => return ReceiveOutcome::Duplicate,
                ConfirmOutcome::Unknown => {}
            }
        }

        let seq = self.next_seq();
        let timeline = self.rooms.entry(room).or_default();
        timeline.ids.insert(message_id);
        timeline.insert_sorted(StoredMessage {
            message,
            state: DeliveryState::Confirmed,
            attempts: 0,
            seq,
        });
        ReceiveOutcome::Inserted
    }

    /// Merge a REST history page. Returns the local ids it confirmed and
    /// how many messages were newly inserted.
    pub fn merge_history(&mut self, room: &RoomId, page: Vec<Message>) -> (Vec<LocalId>, usize) {
        let mut confirmed = Vec::new();
        let mut inserted = 0;
        for mut message in page {
            if message.room_id != *room {
                tracing::warn!(room_id = %room, other = %message.room_id, "history message for another room");
                message.room_id = room.clone();
            }
            match self.receive(message) {
                ReceiveOutcome::Inserted => inserted += 1,
                ReceiveOutcome::Confirmed(local_id) => confirmed.push(local_id),
                ReceiveOutcome::Duplicate | ReceiveOutcome::Ignored => {}
            }
        }
        (confirmed, inserted)
    }

    /// Mark a pending message failed. Returns whether it was pending.
    pub fn mark_failed(&mut self, room: &RoomId, local_id: LocalId, reason: &str) -> bool {
        let Some(entry) = self.entry_mut(room, local_id) else {
            return false;
        };
        if entry.state != DeliveryState::Pending {
            return false;
        }
        entry.state = DeliveryState::Failed(reason.to_string());
        tracing::warn!(room_id = %room, local_id = %local_id, reason, "message failed");
        true
    }

    /// Move a failed message back to pending and return it for resending.
    pub fn retry(&mut self, room: &RoomId, local_id: LocalId) -> Option<Message> {
        let entry = self.entry_mut(room, local_id)?;
        if !matches!(entry.state, DeliveryState::Failed(_)) {
            return None;
        }
        entry.state = DeliveryState::Pending;
        entry.attempts = 0;
        Some(entry.message.clone())
    }

    /// Count one send attempt and return the new total.
    pub fn record_attempt(&mut self, room: &RoomId, local_id: LocalId) -> u32 {
        self.entry_mut(room, local_id).map_or(0, |entry| {
            entry.attempts += 1;
            entry.attempts
        })
    }

    /// Replace the content of a pending message (an upload placeholder
    /// receiving its file URL).
    pub fn update_content(&mut self, room: &RoomId, local_id: LocalId, content: &str) -> bool {
        match self.entry_mut(room, local_id) {
            Some(entry) if !entry.is_confirmed() => {
                entry.message.content = content.to_string();
                true
            }
            _ => false,
        }
    }

    /// The stored entry for `local_id`.
    #[must_use]
    pub fn get(&self, room: &RoomId, local_id: LocalId) -> Option<&StoredMessage> {
        let timeline = self.rooms.get(room)?;
        timeline
            .position_of_local(local_id)
            .map(|idx| &timeline.entries[idx])
    }

    fn entry_mut(&mut self, room: &RoomId, local_id: LocalId) -> Option<&mut StoredMessage> {
        let timeline = self.rooms.get_mut(room)?;
        let idx = timeline.position_of_local(local_id)?;
        timeline.entries.get_mut(idx)
    }

    /// Pending messages across all rooms, oldest first within each room.
    #[must_use]
    pub fn pending(&self) -> Vec<Message> {
        let mut rooms: Vec<&RoomId> = self.rooms.keys().collect();
        rooms.sort();
        rooms
            .into_iter()
            .flat_map(|room| self.rooms[room].entries.iter())
            .filter(|e| e.state == DeliveryState::Pending)
            .map(|e| e.message.clone())
            .collect()
    }

    /// The visible timeline of `room`.
    #[must_use]
    pub fn snapshot(&self, room: &RoomId) -> Vec<StoredMessage> {
        self.rooms
            .get(room)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }

    /// Confirmed messages of `room`, in order.
    #[must_use]
    pub fn confirmed_messages(&self, room: &RoomId) -> Vec<Message> {
        self.rooms
            .get(room)
            .map(|t| {
                t.entries
                    .iter()
                    .filter(|e| e.is_confirmed())
                    .map(|e| e.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `room` has no messages at all.
    #[must_use]
    pub fn is_empty(&self, room: &RoomId) -> bool {
        self.rooms.get(room).is_none_or(|t| t.entries.is_empty())
    }

    /// Id of the oldest confirmed message, the cursor for older history.
    #[must_use]
    pub fn oldest_id(&self, room: &RoomId) -> Option<MessageId> {
        self.rooms
            .get(room)?
            .entries
            .iter()
            .filter(|e| e.is_confirmed())
            .find_map(|e| e.message.message_id)
    }

    /// Position of the newest confirmed message.
    #[must_use]
    pub fn latest_position(&self, room: &RoomId) -> Option<Position> {
        self.rooms
            .get(room)?
            .entries
            .iter()
            .rev()
            .filter(|e| e.is_confirmed())
            .find_map(|e| e.message.position())
    }

    /// Add `user` to `read_by` of every confirmed message at or before
    /// `up_to`. Returns how many messages changed.
    pub fn apply_read(&mut self, room: &RoomId, user: &UserId, up_to: Position) -> usize {
        let Some(timeline) = self.rooms.get_mut(room) else {
            return 0;
        };
        let mut changed = 0;
        for entry in &mut timeline.entries {
            let covered = entry.message.position().is_some_and(|p| p <= up_to);
            if covered && entry.message.read_by.insert(user.clone()) {
                changed += 1;
            }
        }
        changed
    }

    /// Drop everything stored for `room`.
    pub fn clear_room(&mut self, room: &RoomId) {
        self.rooms.remove(room);
    }
}
