//! Socket event surface.
//!
//! Every WebSocket text frame is a JSON object `{"event": <name>, "data":
//! <payload>}`. [`ClientEvent`] covers what the client emits, [`ServerEvent`]
//! what the hub pushes. Payload fields are camelCase.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, RoomId, Timestamp, UserId};
use crate::message::{Message, Position};
use crate::presence::PresenceStatus;

/// Events emitted by the client over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// First frame after the socket opens. The hub answers with
    /// [`ServerEvent::AuthOk`] or [`ServerEvent::AuthError`].
    #[serde(rename = "auth")]
    Auth {
        /// Bearer token issued at login.
        token: String,
    },
    /// Subscribe to a room. Answered by `chat:joined` or `chat:joinError`
    /// carrying the same `ack`.
    #[serde(rename = "chat:join")]
    Join {
        /// Room to join.
        room_id: RoomId,
        /// Correlation number for the acknowledgement.
        ack: u64,
    },
    /// Unsubscribe from a room. Not acknowledged.
    #[serde(rename = "chat:leave")]
    Leave {
        /// Room to leave.
        room_id: RoomId,
    },
    /// The local user is typing in a room.
    #[serde(rename = "chat:typing")]
    Typing {
        /// Room being typed in.
        room_id: RoomId,
    },
    /// The local user stopped typing in a room.
    #[serde(rename = "chat:stopTyping")]
    StopTyping {
        /// Room the user stopped typing in.
        room_id: RoomId,
    },
}

impl ClientEvent {
    /// The wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Join { .. } => "chat:join",
            Self::Leave { .. } => "chat:leave",
            Self::Typing { .. } => "chat:typing",
            Self::StopTyping { .. } => "chat:stopTyping",
        }
    }
}

/// Events pushed by the hub over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Authentication accepted.
    #[serde(rename = "auth:ok")]
    AuthOk {
        /// The authenticated user.
        user_id: UserId,
    },
    /// Authentication rejected. The hub closes the socket afterwards.
    #[serde(rename = "auth:error")]
    AuthError {
        /// Why the token was rejected.
        reason: String,
    },
    /// Join acknowledgement.
    #[serde(rename = "chat:joined")]
    Joined {
        /// Joined room.
        room_id: RoomId,
        /// Correlation number from the `chat:join`.
        ack: u64,
        /// Current room participants.
        #[serde(default)]
        participants: Vec<UserId>,
    },
    /// Join refused by the hub.
    #[serde(rename = "chat:joinError")]
    JoinError {
        /// Room that could not be joined.
        room_id: RoomId,
        /// Correlation number from the `chat:join`.
        ack: u64,
        /// Why the join was refused.
        reason: String,
    },
    /// A new message in a joined room.
    #[serde(rename = "chat:message")]
    Message(Message),
    /// Another user is typing.
    #[serde(rename = "chat:typing")]
    Typing {
        /// Room being typed in.
        room_id: RoomId,
        /// Who is typing.
        user_id: UserId,
    },
    /// Another user stopped typing.
    #[serde(rename = "chat:stopTyping")]
    StopTyping {
        /// Room the user stopped typing in.
        room_id: RoomId,
        /// Who stopped typing.
        user_id: UserId,
    },
    /// A user read a room up to a message.
    #[serde(rename = "chat:read")]
    Read {
        /// Room that was read.
        room_id: RoomId,
        /// Who read it.
        user_id: UserId,
        /// Last message read.
        message_id: MessageId,
        /// Creation time of the last message read.
        created_at: Timestamp,
    },
    /// A user's presence changed.
    #[serde(rename = "statusChange")]
    StatusChange {
        /// Whose presence changed.
        user_id: UserId,
        /// New status.
        status: PresenceStatus,
    },
    /// Hub-side error not tied to a specific request.
    #[serde(rename = "error")]
    Error {
        /// Human-readable description.
        reason: String,
    },
}

impl ServerEvent {
    /// The wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AuthOk { .. } => "auth:ok",
            Self::AuthError { .. } => "auth:error",
            Self::Joined { .. } => "chat:joined",
            Self::JoinError { .. } => "chat:joinError",
            Self::Message(_) => "chat:message",
            Self::Typing { .. } => "chat:typing",
            Self::StopTyping { .. } => "chat:stopTyping",
            Self::Read { .. } => "chat:read",
            Self::StatusChange { .. } => "statusChange",
            Self::Error { .. } => "error",
        }
    }

    /// Returns the read watermark carried by a `chat:read` event.
    #[must_use]
    pub const fn read_position(&self) -> Option<Position> {
        match self {
            Self::Read {
                message_id,
                created_at,
                ..
            } => Some(Position {
                created_at: *created_at,
                message_id: *message_id,
            }),
            _ => None,
        }
    }
}
