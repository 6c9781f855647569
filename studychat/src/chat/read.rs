//! Delivery and read tracking per room.
//!
//! Each room moves `Unread → Delivered → Read(position)` and never moves
//! backwards on its own; [`ReadTracker::reset`] is the one explicit
//! regression. The chat client calls it when another user's message newer
//! than the watermark arrives live: that message is the external reset, and
//! the room then shows `Delivered` again. Nothing else moves a room back.
//! The read watermark itself only ever advances, whether it comes from a
//! local read or from the same user reading on another device.
//!
//! Local reads are coalesced: rapid consecutive reads in one room produce a
//! single "read up to X" receipt once the coalesce window has passed.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use studychat_proto::ids::RoomId;
use studychat_proto::message::Position;
use tokio::time::Instant;

/// Read state of one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadState {
    /// Nothing delivered since the last read.
    #[default]
    Unread,
    /// Messages from others were delivered live but not read.
    Delivered,
    /// Read up to this position.
    Read(Position),
}

impl ReadState {
    const fn rank(self) -> u8 {
        match self {
            Self::Unread => 0,
            Self::Delivered => 1,
            Self::Read(_) => 2,
        }
    }
}

impl fmt::Display for ReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unread => write!(f, "unread"),
            Self::Delivered => write!(f, "delivered"),
            Self::Read(pos) => write!(f, "read up to {pos}"),
        }
    }
}

/// An upstream read receipt to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    /// Room read.
    pub room_id: RoomId,
    /// Read watermark.
    pub up_to: Position,
}

#[derive(Debug, Default)]
struct RoomRead {
    state: ReadState,
    watermark: Option<Position>,
    pending: Option<(Position, Instant)>,
}

/// Tracks read state and schedules coalesced receipts.
#[derive(Debug)]
pub struct ReadTracker {
    rooms: HashMap<RoomId, RoomRead>,
    coalesce: Duration,
}

impl ReadTracker {
    /// Create a tracker with the given coalesce window.
    #[must_use]
    pub fn new(coalesce: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            coalesce,
        }
    }

    /// Current state of `room`.
    #[must_use]
    pub fn state(&self, room: &RoomId) -> ReadState {
        self.rooms.get(room).map(|r| r.state).unwrap_or_default()
    }

    /// Highest position ever read in `room`.
    #[must_use]
    pub fn watermark(&self, room: &RoomId) -> Option<Position> {
        self.rooms.get(room).and_then(|r| r.watermark)
    }

    /// A message from someone else arrived live. Returns whether the state
    /// changed.
    pub fn mark_delivered(&mut self, room: &RoomId) -> bool {
        let entry = self.rooms.entry(room.clone()).or_default();
        if entry.state.rank() >= ReadState::Delivered.rank() {
            return false;
        }
        entry.state = ReadState::Delivered;
        true
    }

    /// The local user read `room` up to `position`.
    ///
    /// Advances the watermark (never backwards) and schedules a receipt.
    /// The first read in a window fixes when the receipt goes out; later
    /// reads in the same window only raise its position. Returns whether
    /// the watermark advanced.
    pub fn mark_read(&mut self, room: &RoomId, position: Position, now: Instant) -> bool {
        let entry = self.rooms.entry(room.clone()).or_default();
        if entry.watermark.is_some_and(|w| position <= w) {
            if let Some(w) = entry.watermark {
                entry.state = ReadState::Read(w);
            }
            return false;
        }
        entry.watermark = Some(position);
        entry.state = ReadState::Read(position);
        entry.pending = Some(match entry.pending {
            Some((pending, deadline)) => (pending.max(position), deadline),
            None => (position, now + self.coalesce),
        });
        tracing::trace!(room_id = %room, position = %position, "read watermark advanced");
        true
    }

    /// A read by the same user on another device. Later reads win; an
    /// earlier one is ignored. A scheduled local receipt that the remote
    /// read already covers is dropped.
    pub fn apply_remote_read(&mut self, room: &RoomId, position: Position) -> bool {
        let entry = self.rooms.entry(room.clone()).or_default();
        if entry.pending.is_some_and(|(pending, _)| pending <= position) {
            entry.pending = None;
        }
        if entry.watermark.is_some_and(|w| position <= w) {
            return false;
        }
        entry.watermark = Some(position);
        entry.state = ReadState::Read(position);
        true
    }

    /// Explicitly move `room` back to `Unread`. The watermark is kept.
    pub fn reset(&mut self, room: &RoomId) {
        if let Some(entry) = self.rooms.get_mut(room) {
            entry.state = ReadState::Unread;
        }
    }

    /// Receipts whose coalesce window has elapsed.
    pub fn flush_due(&mut self, now: Instant) -> Vec<ReadReceipt> {
        let mut due: Vec<ReadReceipt> = self
            .rooms
            .iter_mut()
            .filter_map(|(room, entry)| match entry.pending {
                Some((position, deadline)) if deadline <= now => {
                    entry.pending = None;
                    Some(ReadReceipt {
                        room_id: room.clone(),
                        up_to: position,
                    })
                }
                _ => None,
            })
            .collect();
        due.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        due
    }

    /// Schedule a receipt again after sending it failed. A newer receipt
    /// already scheduled wins.
    pub fn reschedule(&mut self, room: &RoomId, position: Position, now: Instant) {
        let entry = self.rooms.entry(room.clone()).or_default();
        entry.pending = Some(match entry.pending {
            Some((pending, deadline)) => (pending.max(position), deadline),
            None => (position, now + self.coalesce),
        });
    }

    /// Take the scheduled receipt for `room` regardless of its deadline.
    pub fn flush_room(&mut self, room: &RoomId) -> Option<Position> {
        self.rooms
            .get_mut(room)
            .and_then(|entry| entry.pending.take())
            .map(|(position, _)| position)
    }

    /// Forget `room`.
    pub fn forget(&mut self, room: &RoomId) {
        self.rooms.remove(room);
    }
}
