//! Room registry: which rooms this session has joined.
//!
//! The registry is plain state driven by the client event loop. Every
//! operation returns a [`RoomEffects`] describing the socket events to emit
//! and the outcomes to publish; the loop performs them. Waiters are
//! `oneshot` senders that resolve when the operation they asked for
//! completes.
//!
//! # Serialization
//!
//! Join and leave for the same room are serialized through a per-room
//! queue. At most one join is in flight per room; a second `join` while one
//! is in flight shares it, and a `leave` issued meanwhile runs after the
//! join resolves.
//!
//! # Reconnects
//!
//! The registry counts connection losses. Each in-flight join remembers the
//! connection its frame went out on, and each joined room the connection its
//! acknowledgement arrived on. [`RoomRegistry::rejoin_all`] only re-sends
//! what belongs to an older connection or never left the client.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use studychat_proto::event::ClientEvent;
use studychat_proto::ids::{RoomId, Timestamp, UserId};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Why a room operation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// No `chat:joined` arrived within the join timeout.
    #[error("join timed out")]
    Timeout,

    /// The hub answered `chat:joinError`.
    #[error("join rejected: {0}")]
    Rejected(String),

    /// The session was torn down before the operation completed.
    #[error("session closed")]
    Closed,
}

/// Resolves when a queued room operation completes.
pub type RoomWaiter = oneshot::Sender<Result<(), RoomError>>;

/// A joined room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Room identifier.
    pub room_id: RoomId,
    /// Participants reported by the latest join acknowledgement.
    pub participant_ids: HashSet<UserId>,
    /// When the room was first joined in this session.
    pub joined_at: Timestamp,
    /// Connection the latest acknowledgement arrived on.
    pub link: u64,
}

/// What the caller must do after a registry operation.
#[derive(Debug, Default)]
pub struct RoomEffects {
    /// Socket events to emit, in order.
    pub emit: Vec<ClientEvent>,
    /// Rooms whose join (or rejoin) was acknowledged, with participants.
    pub joined: Vec<(RoomId, Vec<UserId>)>,
    /// Joins that failed.
    pub failed: Vec<(RoomId, RoomError)>,
    /// Rooms removed by a leave.
    pub left: Vec<RoomId>,
}

impl RoomEffects {
    /// Whether there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.emit.is_empty() && self.joined.is_empty() && self.failed.is_empty() && self.left.is_empty()
    }
}

#[derive(Debug)]
struct InFlightJoin {
    ack: u64,
    deadline: Instant,
    waiters: Vec<RoomWaiter>,
    /// Re-join after reconnect of a room that is already joined.
    rejoin: bool,
    /// Connection the join frame was written to; `None` if it was not sent.
    sent_on: Option<u64>,
}

#[derive(Debug)]
enum QueuedOp {
    Join(Vec<RoomWaiter>),
    Leave(Vec<RoomWaiter>),
}

#[derive(Debug, Default)]
struct RoomOps {
    in_flight: Option<InFlightJoin>,
    queued: VecDeque<QueuedOp>,
}

impl RoomOps {
    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queued.is_empty()
    }
}

/// Tracks joined rooms and serializes join/leave per room.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    ops: HashMap<RoomId, RoomOps>,
    next_ack: u64,
    link: u64,
    join_timeout: Duration,
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(join_timeout: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            ops: HashMap::new(),
            next_ack: 1,
            link: 0,
            join_timeout,
        }
    }

    /// Whether `room` is joined.
    #[must_use]
    pub fn is_joined(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// The joined room, if any.
    #[must_use]
    pub fn room(&self, room: &RoomId) -> Option<&Room> {
        self.rooms.get(room)
    }

    /// All joined room ids, sorted.
    #[must_use]
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Whether a join for `room` is awaiting its acknowledgement.
    #[must_use]
    pub fn is_joining(&self, room: &RoomId) -> bool {
        self.ops.get(room).is_some_and(|ops| ops.in_flight.is_some())
    }

    /// Join `room`.
    ///
    /// Resolves `waiter` immediately if the room is already joined and no
    /// operation is pending; shares an in-flight join; otherwise queues.
    pub fn join(&mut self, room: &RoomId, waiter: Option<RoomWaiter>, now: Instant) -> RoomEffects {
        let mut effects = RoomEffects::default();
        let ops = self.ops.entry(room.clone()).or_default();

        if ops.queued.is_empty() {
            let in_flight_rejoin = ops.in_flight.as_ref().map(|j| j.rejoin);
            match in_flight_rejoin {
                Some(false) => {
                    tracing::debug!(room_id = %room, "sharing in-flight join");
                    if let Some(join) = ops.in_flight.as_mut() {
                        join.waiters.extend(waiter);
                    }
                    return effects;
                }
                _ if self.rooms.contains_key(room) => {
                    resolve(waiter, Ok(()));
                    self.prune(room);
                    return effects;
                }
                Some(true) => {}
                None => {
                    self.start_join(room, waiter.into_iter().collect(), false, now, &mut effects);
                    return effects;
                }
            }
        }

        let ops = self.ops.entry(room.clone()).or_default();
        match ops.queued.back_mut() {
            Some(QueuedOp::Join(waiters)) => waiters.extend(waiter),
            _ => ops.queued.push_back(QueuedOp::Join(waiter.into_iter().collect())),
        }
        effects
    }

    /// Leave `room`.
    ///
    /// Local state is removed whether or not the hub acknowledges. If a join
    /// is in flight the leave runs once it resolves.
    pub fn leave(&mut self, room: &RoomId, waiter: Option<RoomWaiter>, now: Instant) -> RoomEffects {
        let mut effects = RoomEffects::default();
        let ops = self.ops.entry(room.clone()).or_default();
        if ops.is_idle() {
            self.leave_now(room, waiter.into_iter().collect(), &mut effects);
            self.prune(room);
        } else {
            match ops.queued.back_mut() {
                Some(QueuedOp::Leave(waiters)) => waiters.extend(waiter),
                _ => ops.queued.push_back(QueuedOp::Leave(waiter.into_iter().collect())),
            }
            self.drain(room, now, &mut effects);
        }
        effects
    }

    /// Handle `chat:joined`. Stale or unsolicited acks are ignored.
    pub fn on_joined(
        &mut self,
        room: &RoomId,
        ack: u64,
        participants: Vec<UserId>,
        now: Instant,
    ) -> RoomEffects {
        let mut effects = RoomEffects::default();
        let Some(join) = self.take_in_flight(room, ack) else {
            tracing::debug!(room_id = %room, ack, "ignoring unmatched join ack");
            return effects;
        };

        let participant_ids: HashSet<UserId> = participants.iter().cloned().collect();
        let link = self.link;
        self.rooms
            .entry(room.clone())
            .and_modify(|r| {
                r.participant_ids.clone_from(&participant_ids);
                r.link = link;
            })
            .or_insert_with(|| Room {
                room_id: room.clone(),
                participant_ids,
                joined_at: Timestamp::now(),
                link,
            });
        tracing::info!(room_id = %room, rejoin = join.rejoin, "room joined");
        for waiter in join.waiters {
            resolve(Some(waiter), Ok(()));
        }
        effects.joined.push((room.clone(), participants));
        self.drain(room, now, &mut effects);
        effects
    }

    /// Handle `chat:joinError`.
    pub fn on_join_error(
        &mut self,
        room: &RoomId,
        ack: u64,
        reason: &str,
        now: Instant,
    ) -> RoomEffects {
        let mut effects = RoomEffects::default();
        let Some(join) = self.take_in_flight(room, ack) else {
            tracing::debug!(room_id = %room, ack, "ignoring unmatched join error");
            return effects;
        };
        tracing::warn!(room_id = %room, reason, "join rejected");
        if self.rooms.remove(room).is_some() {
            effects.left.push(room.clone());
        }
        let error = RoomError::Rejected(reason.to_string());
        for waiter in join.waiters {
            resolve(Some(waiter), Err(error.clone()));
        }
        effects.failed.push((room.clone(), error));
        self.drain(room, now, &mut effects);
        effects
    }

    /// Fail every join whose deadline has passed.
    ///
    /// A timed-out first join leaves the room unjoined. A timed-out rejoin
    /// keeps the room and only logs.
    pub fn expire(&mut self, now: Instant) -> RoomEffects {
        let mut effects = RoomEffects::default();
        let expired: Vec<RoomId> = self
            .ops
            .iter()
            .filter(|(_, ops)| ops.in_flight.as_ref().is_some_and(|j| j.deadline <= now))
            .map(|(room, _)| room.clone())
            .collect();

        for room in expired {
            let Some(join) = self.ops.get_mut(&room).and_then(|ops| ops.in_flight.take()) else {
                continue;
            };
            if join.rejoin {
                tracing::warn!(room_id = %room, "rejoin timed out, keeping room");
            } else {
                tracing::warn!(room_id = %room, "join timed out");
                for waiter in join.waiters {
                    resolve(Some(waiter), Err(RoomError::Timeout));
                }
                effects.failed.push((room.clone(), RoomError::Timeout));
            }
            self.drain(&room, now, &mut effects);
        }
        effects
    }

    /// Record that the socket went away. Everything sent or acknowledged
    /// before this belongs to a dead connection.
    pub fn connection_lost(&mut self) {
        self.link = self.link.wrapping_add(1);
        tracing::debug!(link = self.link, "room registry saw connection loss");
    }

    /// Record that the frame for join `ack` could not be written.
    pub fn join_not_sent(&mut self, room: &RoomId, ack: u64) {
        if let Some(join) = self
            .ops
            .get_mut(room)
            .and_then(|ops| ops.in_flight.as_mut())
            .filter(|j| j.ack == ack)
        {
            join.sent_on = None;
        }
    }

    /// Re-emit joins once the socket is connected.
    ///
    /// In-flight joins that were never written, or were written to a lost
    /// connection, are re-sent with a new ack and deadline. Joined rooms
    /// acknowledged on a lost connection get a fresh rejoin. Joins already
    /// sent on the live connection are left alone.
    pub fn rejoin_all(&mut self, now: Instant) -> RoomEffects {
        let mut effects = RoomEffects::default();
        let link = self.link;

        let in_flight: Vec<RoomId> = self
            .ops
            .iter()
            .filter(|(_, ops)| ops.in_flight.is_some())
            .map(|(room, _)| room.clone())
            .collect();
        for room in &in_flight {
            let stale = self
                .ops
                .get(room)
                .and_then(|ops| ops.in_flight.as_ref())
                .is_some_and(|j| j.sent_on != Some(link));
            if !stale {
                continue;
            }
            let ack = self.allocate_ack();
            let deadline = now + self.join_timeout;
            if let Some(join) = self.ops.get_mut(room).and_then(|ops| ops.in_flight.as_mut()) {
                join.ack = ack;
                join.deadline = deadline;
                join.sent_on = Some(link);
                effects.emit.push(ClientEvent::Join {
                    room_id: room.clone(),
                    ack,
                });
            }
        }

        let stale_rooms: Vec<RoomId> = self
            .joined_rooms()
            .into_iter()
            .filter(|room| !in_flight.contains(room))
            .filter(|room| self.rooms.get(room).is_some_and(|r| r.link != link))
            .collect();
        for room in stale_rooms {
            self.start_join(&room, Vec::new(), true, now, &mut effects);
        }
        if !effects.emit.is_empty() {
            tracing::info!(rooms = effects.emit.len(), "re-joining rooms after reconnect");
        }
        effects
    }

    /// Drop all state and fail every waiter with [`RoomError::Closed`].
    pub fn close(&mut self) {
        for (_, ops) in self.ops.drain() {
            if let Some(join) = ops.in_flight {
                for waiter in join.waiters {
                    resolve(Some(waiter), Err(RoomError::Closed));
                }
            }
            for op in ops.queued {
                let (QueuedOp::Join(waiters) | QueuedOp::Leave(waiters)) = op;
                for waiter in waiters {
                    resolve(Some(waiter), Err(RoomError::Closed));
                }
            }
        }
        self.rooms.clear();
    }

    fn allocate_ack(&mut self) -> u64 {
        let ack = self.next_ack;
        self.next_ack = self.next_ack.wrapping_add(1).max(1);
        ack
    }

    fn start_join(
        &mut self,
        room: &RoomId,
        waiters: Vec<RoomWaiter>,
        rejoin: bool,
        now: Instant,
        effects: &mut RoomEffects,
    ) {
        let ack = self.allocate_ack();
        let ops = self.ops.entry(room.clone()).or_default();
        ops.in_flight = Some(InFlightJoin {
            ack,
            deadline: now + self.join_timeout,
            waiters,
            rejoin,
            sent_on: Some(self.link),
        });
        tracing::debug!(room_id = %room, ack, rejoin, "join sent");
        effects.emit.push(ClientEvent::Join {
            room_id: room.clone(),
            ack,
        });
    }

    fn leave_now(&mut self, room: &RoomId, waiters: Vec<RoomWaiter>, effects: &mut RoomEffects) {
        if self.rooms.remove(room).is_some() {
            tracing::info!(room_id = %room, "room left");
            effects.emit.push(ClientEvent::Leave {
                room_id: room.clone(),
            });
            effects.left.push(room.clone());
        }
        for waiter in waiters {
            resolve(Some(waiter), Ok(()));
        }
    }

    fn take_in_flight(&mut self, room: &RoomId, ack: u64) -> Option<InFlightJoin> {
        let ops = self.ops.get_mut(room)?;
        if ops.in_flight.as_ref().is_some_and(|j| j.ack == ack) {
            ops.in_flight.take()
        } else {
            None
        }
    }

    /// Run queued operations until one has to wait for the hub.
    fn drain(&mut self, room: &RoomId, now: Instant, effects: &mut RoomEffects) {
        loop {
            let Some(ops) = self.ops.get_mut(room) else {
                return;
            };
            if ops.in_flight.is_some() {
                return;
            }
            let Some(op) = ops.queued.pop_front() else {
                break;
            };
            match op {
                QueuedOp::Join(waiters) => {
                    if self.rooms.contains_key(room) {
                        for waiter in waiters {
                            resolve(Some(waiter), Ok(()));
                        }
                    } else {
                        self.start_join(room, waiters, false, now, effects);
                    }
                }
                QueuedOp::Leave(waiters) => self.leave_now(room, waiters, effects),
            }
        }
        self.prune(room);
    }

    fn prune(&mut self, room: &RoomId) {
        if self.ops.get(room).is_some_and(RoomOps::is_idle) {
            self.ops.remove(room);
        }
    }
}

fn resolve(waiter: Option<RoomWaiter>, result: Result<(), RoomError>) {
    if let Some(waiter) = waiter {
        let _ = waiter.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::new(id)
    }

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Duration::from_secs(10))
    }

    fn join_ack(effects: &RoomEffects) -> u64 {
        match effects.emit.as_slice() {
            [ClientEvent::Join { ack, .. }] => *ack,
            other => panic!("expected one join, got {other:?}"),
        }
    }

    #[test]
    fn join_emits_and_ack_marks_joined() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        let effects = reg.join(&room("math"), Some(tx), now);
        let ack = join_ack(&effects);
        assert!(!reg.is_joined(&room("math")));
        assert!(reg.is_joining(&room("math")));

        let effects = reg.on_joined(&room("math"), ack, vec![UserId::new("amy")], now);
        assert_eq!(effects.joined.len(), 1);
        assert!(reg.is_joined(&room("math")));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert!(
            reg.room(&room("math"))
                .unwrap()
                .participant_ids
                .contains(&UserId::new("amy"))
        );
    }

    #[test]
    fn join_when_already_joined_is_immediate_noop() {
        let mut reg = registry();
        let now = Instant::now();
        let ack = join_ack(&reg.join(&room("r"), None, now));
        reg.on_joined(&room("r"), ack, vec![], now);

        let (tx, mut rx) = oneshot::channel();
        let effects = reg.join(&room("r"), Some(tx), now);
        assert!(effects.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn concurrent_joins_share_one_request() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let ack = join_ack(&reg.join(&room("r"), Some(tx1), now));
        let second = reg.join(&room("r"), Some(tx2), now);
        assert!(second.emit.is_empty());

        reg.on_joined(&room("r"), ack, vec![], now);
        assert_eq!(rx1.try_recv().unwrap(), Ok(()));
        assert_eq!(rx2.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn join_times_out_and_room_stays_unjoined() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        reg.join(&room("r"), Some(tx), now);

        assert!(reg.expire(now + Duration::from_secs(9)).is_empty());
        let effects = reg.expire(now + Duration::from_secs(10));
        assert_eq!(effects.failed, vec![(room("r"), RoomError::Timeout)]);
        assert_eq!(rx.try_recv().unwrap(), Err(RoomError::Timeout));
        assert!(!reg.is_joined(&room("r")));
        assert!(!reg.is_joining(&room("r")));
    }

    #[test]
    fn join_error_rejects() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        let ack = join_ack(&reg.join(&room("r"), Some(tx), now));
        let effects = reg.on_join_error(&room("r"), ack, "no such room", now);
        assert_eq!(effects.failed.len(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RoomError::Rejected("no such room".into()))
        );
        assert!(!reg.is_joined(&room("r")));
    }

    #[test]
    fn leave_during_join_runs_after_join_resolves() {
        let mut reg = registry();
        let now = Instant::now();
        let ack = join_ack(&reg.join(&room("r"), None, now));

        let (tx, mut rx) = oneshot::channel();
        let effects = reg.leave(&room("r"), Some(tx), now);
        assert!(effects.emit.is_empty(), "leave must wait for the join");
        assert!(rx.try_recv().is_err());

        let effects = reg.on_joined(&room("r"), ack, vec![], now);
        assert_eq!(effects.joined.len(), 1);
        assert_eq!(
            effects.emit,
            vec![ClientEvent::Leave {
                room_id: room("r")
            }]
        );
        assert_eq!(effects.left, vec![room("r")]);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert!(!reg.is_joined(&room("r")));
    }

    #[test]
    fn join_after_queued_leave_starts_a_new_join() {
        let mut reg = registry();
        let now = Instant::now();
        let first = join_ack(&reg.join(&room("r"), None, now));
        reg.leave(&room("r"), None, now);
        reg.join(&room("r"), None, now);

        let effects = reg.on_joined(&room("r"), first, vec![], now);
        assert_eq!(effects.emit.len(), 2);
        assert!(matches!(effects.emit[0], ClientEvent::Leave { .. }));
        let ClientEvent::Join { ack: second, .. } = effects.emit[1] else {
            panic!("expected a second join");
        };
        assert_ne!(first, second);
        assert!(reg.is_joining(&room("r")));
    }

    #[test]
    fn leave_removes_state_without_ack() {
        let mut reg = registry();
        let now = Instant::now();
        let ack = join_ack(&reg.join(&room("r"), None, now));
        reg.on_joined(&room("r"), ack, vec![], now);
        let effects = reg.leave(&room("r"), None, now);
        assert_eq!(effects.left, vec![room("r")]);
        assert!(!reg.is_joined(&room("r")));
        assert!(reg.joined_rooms().is_empty());
    }

    #[test]
    fn stale_ack_is_ignored() {
        let mut reg = registry();
        let now = Instant::now();
        let ack = join_ack(&reg.join(&room("r"), None, now));
        assert!(reg.on_joined(&room("r"), ack + 100, vec![], now).is_empty());
        assert!(!reg.is_joined(&room("r")));
    }

    #[test]
    fn rejoin_all_reemits_and_timeout_keeps_room() {
        let mut reg = registry();
        let now = Instant::now();
        let ack = join_ack(&reg.join(&room("a"), None, now));
        reg.on_joined(&room("a"), ack, vec![], now);
        assert!(reg.rejoin_all(now).is_empty(), "room is live on this connection");

        reg.connection_lost();
        let effects = reg.rejoin_all(now);
        let rejoin_ack = join_ack(&effects);
        assert_ne!(rejoin_ack, ack);

        let effects = reg.expire(now + Duration::from_secs(10));
        assert!(effects.failed.is_empty());
        assert!(reg.is_joined(&room("a")));
    }

    #[test]
    fn rejoin_all_resends_in_flight_join_with_new_ack() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        let first = join_ack(&reg.join(&room("b"), Some(tx), now));
        reg.connection_lost();

        let later = now + Duration::from_secs(5);
        let second = join_ack(&reg.rejoin_all(later));
        assert_ne!(first, second);
        assert!(reg.on_joined(&room("b"), first, vec![], later).is_empty());
        // Deadline was pushed out by the resend.
        assert!(reg.expire(now + Duration::from_secs(12)).is_empty());

        reg.on_joined(&room("b"), second, vec![], later);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn join_sent_on_live_connection_is_not_resent() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        let ack = join_ack(&reg.join(&room("math"), Some(tx), now));

        assert!(reg.rejoin_all(now).is_empty());
        reg.on_joined(&room("math"), ack, vec![], now);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn unsent_join_is_resent_on_connect() {
        let mut reg = registry();
        let now = Instant::now();
        let first = join_ack(&reg.join(&room("math"), None, now));
        reg.join_not_sent(&room("math"), first);

        let second = join_ack(&reg.rejoin_all(now));
        assert_ne!(first, second);
        assert!(reg.rejoin_all(now).is_empty());
    }

    #[test]
    fn close_fails_waiters() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        reg.join(&room("r"), Some(tx), now);
        reg.close();
        assert_eq!(rx.try_recv().unwrap(), Err(RoomError::Closed));
    }
}
