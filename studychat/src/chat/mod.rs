//! Chat core for `StudyChat`.
//!
//! The state components are plain structs owned by one event-loop task:
//!
//! - [`room::RoomRegistry`]: joined rooms, serialized join/leave
//! - [`presence::PresenceTracker`] / [`presence::TypingThrottle`]: typing and online state
//! - [`store::MessageStore`]: ordered, de-duplicated timelines
//! - [`read::ReadTracker`]: monotonic read state and coalesced receipts
//! - [`upload::Uploader`]: chunked attachment uploads
//!
//! [`client::ChatClient`] spawns that loop next to the transport session and
//! hands back a [`ChatHandle`]; everything the UI sees arrives as
//! [`ChatEvent`]s.
//!
//! ```text
//! UI ── ChatHandle ──▶ event loop ◀── SessionEvent ── transport session
//!  ▲                     │    ▲
//!  └──── ChatEvent ──────┘    └── task results ── REST calls, uploads
//! ```

pub mod client;
pub mod presence;
pub mod read;
pub mod room;
pub mod store;
pub mod upload;

use studychat_proto::ids::{AttachmentId, LocalId, MessageId, RoomId, UserId};
use studychat_proto::message::{Message, Position};
use studychat_proto::presence::PresenceStatus;

use crate::transport::ConnectionState;

pub use client::{ChatClient, ChatHandle, HistoryLoad, Subscription};
pub use read::ReadState;
pub use store::{DeliveryState, StoredMessage};
pub use upload::{OutgoingFile, UploadStatus};

/// Everything the chat core tells its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The socket connection state changed.
    ConnectionChanged(ConnectionState),
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The reconnect attempt limit was reached.
    ReconnectFailed,
    /// The token was rejected; the session has stopped.
    AuthRejected {
        /// Reason given by the hub.
        reason: String,
    },

    /// A join (or rejoin after reconnect) was acknowledged.
    RoomJoined {
        /// Room joined.
        room_id: RoomId,
        /// Participants reported by the hub.
        participants: Vec<UserId>,
    },
    /// A join failed.
    JoinFailed {
        /// Room.
        room_id: RoomId,
        /// Timeout or the hub's reason.
        reason: String,
    },
    /// The room was left.
    RoomLeft {
        /// Room.
        room_id: RoomId,
    },

    /// The timeline of a room changed; re-render from `snapshot`.
    TimelineChanged {
        /// Room.
        room_id: RoomId,
    },
    /// A new message arrived live.
    MessageReceived {
        /// The message.
        message: Message,
    },
    /// A pending message was confirmed.
    MessageConfirmed {
        /// Room.
        room_id: RoomId,
        /// Local id of the pending entry.
        local_id: LocalId,
        /// Server-assigned id.
        message_id: MessageId,
    },
    /// A pending message failed.
    MessageFailed {
        /// Room.
        room_id: RoomId,
        /// Local id of the entry.
        local_id: LocalId,
        /// Why.
        reason: String,
    },

    /// The set of users typing in a room changed.
    TypingChanged {
        /// Room.
        room_id: RoomId,
        /// Users currently typing, sorted.
        users: Vec<UserId>,
    },
    /// A user's online status changed.
    PresenceChanged {
        /// User.
        user_id: UserId,
        /// New status.
        status: PresenceStatus,
    },
    /// The local read state of a room changed.
    ReadStateChanged {
        /// Room.
        room_id: RoomId,
        /// New state.
        state: ReadState,
    },
    /// A participant read a room up to a position.
    ReadBy {
        /// Room.
        room_id: RoomId,
        /// Reader.
        user_id: UserId,
        /// Read watermark.
        up_to: Position,
    },

    /// Upload progress after a chunk was stored.
    UploadProgress {
        /// Attachment.
        attachment_id: AttachmentId,
        /// Room.
        room_id: RoomId,
        /// Fraction done, `0.0..=1.0`.
        progress: f32,
    },
    /// All chunks stored; the file message is being posted.
    UploadComplete {
        /// Attachment.
        attachment_id: AttachmentId,
        /// Room.
        room_id: RoomId,
        /// Stored file URL.
        url: String,
    },
    /// An upload failed; `retry_upload` resumes it.
    UploadFailed {
        /// Attachment.
        attachment_id: AttachmentId,
        /// Room.
        room_id: RoomId,
        /// Why.
        reason: String,
    },

    /// A history page was merged.
    HistoryLoaded {
        /// Room.
        room_id: RoomId,
        /// Messages that were new to the store.
        inserted: usize,
        /// Whether older pages exist.
        has_more: bool,
    },
    /// The hub reported an error event.
    ServerError {
        /// Error text.
        reason: String,
    },
}
