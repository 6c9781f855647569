//! Request and response bodies of the REST collaborator API.
//!
//! Routes (all bearer-token authenticated):
//!
//! | Method | Path                                  | Body / query        | Response               |
//! |--------|---------------------------------------|---------------------|------------------------|
//! | GET    | `/rooms`                              |                     | `Vec<RoomSummary>`     |
//! | GET    | `/rooms/{id}`                         |                     | `RoomSummary`          |
//! | GET    | `/rooms/{id}/messages`                | [`HistoryQuery`]    | [`HistoryPage`]        |
//! | POST   | `/rooms/{id}/messages`                | [`PostMessage`]     | `Message`              |
//! | POST   | `/rooms/{id}/files`                   | multipart chunk     | [`UploadChunkReceipt`] |
//! | PUT    | `/rooms/{id}/messages/{mid}/read`     |                     | [`ReadAck`]            |
//! | GET    | `/rooms/{id}/messages/search`         | [`SearchQuery`]     | `Vec<Message>`         |

use serde::{Deserialize, Serialize};

use crate::ids::{LocalId, MessageId, RoomId, Timestamp, UserId};
use crate::message::{Message, MessageKind};

/// Multipart field names of a file chunk upload.
pub mod upload_fields {
    /// Attachment id shared by every chunk of one file.
    pub const UPLOAD_ID: &str = "upload_id";
    /// Zero-based chunk index.
    pub const CHUNK_INDEX: &str = "chunk_index";
    /// Total number of chunks.
    pub const CHUNK_COUNT: &str = "chunk_count";
    /// Original file name.
    pub const FILE_NAME: &str = "file_name";
    /// MIME type of the whole file.
    pub const MIME_TYPE: &str = "mime_type";
    /// The chunk bytes.
    pub const CHUNK: &str = "chunk";
}

/// Summary of a room visible to the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    /// Room identifier.
    pub room_id: RoomId,
    /// Display name.
    pub name: String,
    /// Room members.
    #[serde(default)]
    pub participants: Vec<UserId>,
    /// Most recent message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

/// Query string of the history endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Only return messages older than this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
    /// Maximum number of messages to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// One page of room history, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Messages in ascending `(created_at, message_id)` order.
    pub messages: Vec<Message>,
    /// Whether older messages exist before this page.
    #[serde(default)]
    pub has_more: bool,
}

/// Body of `POST /rooms/{id}/messages`.
///
/// `local_id` is echoed back on the stored message and on the live
/// `chat:message` broadcast so the sender can confirm its pending copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessage {
    /// Text, or the stored file URL for attachments.
    pub content: String,
    /// Message kind.
    #[serde(default)]
    pub kind: MessageKind,
    /// Correlation id of the optimistic send.
    pub local_id: LocalId,
    /// Client-side creation time; kept by the server when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
}

/// Query string of the search endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Case-insensitive substring to look for.
    pub keyword: String,
}

/// Response of a read receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAck {
    /// Message the room was read up to.
    pub message_id: MessageId,
    /// Its creation time.
    pub created_at: Timestamp,
}

/// Response to one uploaded file chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkReceipt {
    /// Attachment id the chunk belongs to.
    pub upload_id: String,
    /// Number of distinct chunks received so far.
    pub received: usize,
    /// Total number of chunks announced by the client.
    pub chunk_count: usize,
    /// Whether every chunk has arrived.
    pub complete: bool,
    /// URL of the stored file once complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable description.
    pub error: String,
}
