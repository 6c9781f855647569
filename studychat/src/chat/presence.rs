//! Presence and typing indicators.
//!
//! [`PresenceTracker`] holds what other users are doing: online status from
//! `statusChange` and per-room typing entries from `chat:typing` /
//! `chat:stopTyping`. Typing entries expire after a fixed window without a
//! refresh, so a lost `chat:stopTyping` never leaves a user typing forever.
//!
//! [`TypingThrottle`] is the outbound side: it turns local keystrokes into
//! at most one `chat:typing` per interval and a trailing `chat:stopTyping`
//! once input goes idle.

use std::collections::HashMap;
use std::time::Duration;

use studychat_proto::event::ClientEvent;
use studychat_proto::ids::{RoomId, UserId};
use studychat_proto::presence::PresenceStatus;
use tokio::time::Instant;

/// Online status and typing state of other users.
#[derive(Debug)]
pub struct PresenceTracker {
    self_id: Option<UserId>,
    typing: HashMap<RoomId, HashMap<UserId, Instant>>,
    status: HashMap<UserId, PresenceStatus>,
    window: Duration,
}

impl PresenceTracker {
    /// Create a tracker whose typing entries live for `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            self_id: None,
            typing: HashMap::new(),
            status: HashMap::new(),
            window,
        }
    }

    /// Set the local user, whose own typing events are ignored.
    pub fn set_self(&mut self, user: UserId) {
        self.typing.values_mut().for_each(|users| {
            users.remove(&user);
        });
        self.self_id = Some(user);
    }

    fn is_self(&self, user: &UserId) -> bool {
        self.self_id.as_ref() == Some(user)
    }

    /// Record `chat:typing`. Returns whether the visible typing set changed.
    pub fn on_typing(&mut self, room: &RoomId, user: &UserId, now: Instant) -> bool {
        if self.is_self(user) {
            return false;
        }
        let expires_at = now + self.window;
        self.typing
            .entry(room.clone())
            .or_default()
            .insert(user.clone(), expires_at)
            .is_none_or(|previous| previous <= now)
    }

    /// Record `chat:stopTyping`. Returns whether the visible typing set changed.
    pub fn on_stop_typing(&mut self, room: &RoomId, user: &UserId, now: Instant) -> bool {
        let Some(users) = self.typing.get_mut(room) else {
            return false;
        };
        let changed = users.remove(user).is_some_and(|expires_at| expires_at > now);
        if users.is_empty() {
            self.typing.remove(room);
        }
        changed
    }

    /// Record `statusChange`.
    ///
    /// Going offline also clears the user's typing entries; the rooms whose
    /// typing set changed are returned.
    pub fn on_status(&mut self, user: &UserId, status: PresenceStatus) -> Vec<RoomId> {
        self.status.insert(user.clone(), status);
        if status.is_online() {
            return Vec::new();
        }
        let mut changed = Vec::new();
        self.typing.retain(|room, users| {
            if users.remove(user).is_some() {
                changed.push(room.clone());
            }
            !users.is_empty()
        });
        changed.sort();
        changed
    }

    /// Users typing in `room` as of `now`, sorted.
    #[must_use]
    pub fn typing_in(&self, room: &RoomId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .typing
            .get(room)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Whether `user` is online (or away) according to the last status seen.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.status(user).is_online()
    }

    /// Last known status of `user`; [`PresenceStatus::Offline`] if never seen.
    #[must_use]
    pub fn status(&self, user: &UserId) -> PresenceStatus {
        self.status.get(user).copied().unwrap_or_default()
    }

    /// Drop expired typing entries. Returns the rooms whose set changed.
    pub fn expire(&mut self, now: Instant) -> Vec<RoomId> {
        let mut changed = Vec::new();
        self.typing.retain(|room, users| {
            let before = users.len();
            users.retain(|_, expires_at| *expires_at > now);
            if users.len() != before {
                changed.push(room.clone());
            }
            !users.is_empty()
        });
        changed.sort();
        changed
    }

    /// Forget typing state for a room that was left.
    pub fn clear_room(&mut self, room: &RoomId) {
        self.typing.remove(room);
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalTyping {
    last_sent: Instant,
    last_keystroke: Instant,
}

/// Rate-limits the local user's outbound typing events.
#[derive(Debug)]
pub struct TypingThrottle {
    interval: Duration,
    idle: Duration,
    active: HashMap<RoomId, LocalTyping>,
}

impl TypingThrottle {
    /// Emit `chat:typing` at most once per `interval`; stop after `idle`.
    #[must_use]
    pub fn new(interval: Duration, idle: Duration) -> Self {
        Self {
            interval,
            idle,
            active: HashMap::new(),
        }
    }

    /// A keystroke in `room`. Returns the `chat:typing` to emit, if due.
    pub fn keystroke(&mut self, room: &RoomId, now: Instant) -> Option<ClientEvent> {
        match self.active.get_mut(room) {
            Some(state) => {
                state.last_keystroke = now;
                if now.duration_since(state.last_sent) < self.interval {
                    return None;
                }
                state.last_sent = now;
            }
            None => {
                self.active.insert(
                    room.clone(),
                    LocalTyping {
                        last_sent: now,
                        last_keystroke: now,
                    },
                );
            }
        }
        Some(ClientEvent::Typing {
            room_id: room.clone(),
        })
    }

    /// Trailing `chat:stopTyping` for every room idle for the idle window.
    pub fn tick(&mut self, now: Instant) -> Vec<ClientEvent> {
        let mut idle: Vec<RoomId> = self
            .active
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_keystroke) >= self.idle)
            .map(|(room, _)| room.clone())
            .collect();
        idle.sort();
        idle.into_iter()
            .filter_map(|room| self.stop(&room))
            .collect()
    }

    /// Stop typing in `room` now (message sent or room left).
    pub fn stop(&mut self, room: &RoomId) -> Option<ClientEvent> {
        self.active.remove(room).map(|_| ClientEvent::StopTyping {
            room_id: room.clone(),
        })
    }

    /// Whether the local user is currently marked typing in `room`.
    #[must_use]
    pub fn is_typing(&self, room: &RoomId) -> bool {
        self.active.contains_key(room)
    }
}
