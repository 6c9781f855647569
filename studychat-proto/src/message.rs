//! Chat message wire types and local validation.
//!
//! A [`Message`] is what the REST history endpoint returns and what the hub
//! pushes as `chat:message`. Field names are camelCase on the wire to match
//! the API.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{LocalId, MessageId, RoomId, Timestamp, UserId};

/// Maximum allowed text content size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// An image attachment; content is the stored file URL.
    Image,
    /// A document attachment; content is the stored file URL.
    File,
    /// A video attachment; content is the stored file URL.
    Video,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::File => write!(f, "file"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// A chat message as exchanged with the API and the socket hub.
///
/// `message_id` is `None` only for a local optimistic send that the server
/// has not confirmed yet; such messages carry a `local_id` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id, unique per room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Room the message belongs to.
    pub room_id: RoomId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Text, or the file URL for attachment kinds.
    pub content: String,
    /// Message kind.
    #[serde(default)]
    pub kind: MessageKind,
    /// Creation time in milliseconds since the UNIX epoch.
    pub created_at: Timestamp,
    /// Users that have read this message.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub read_by: BTreeSet<UserId>,
    /// Correlation id of the optimistic send that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
}

impl Message {
    /// Returns the position of a confirmed message in its room's total order.
    ///
    /// `None` while the message is still pending.
    #[must_use]
    pub fn position(&self) -> Option<Position> {
        self.message_id.map(|message_id| Position {
            created_at: self.created_at,
            message_id,
        })
    }
}

/// A point in a room's total order: `(created_at, message_id)`.
///
/// Field order matters: the derived `Ord` compares `created_at` first and
/// breaks ties by `message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Creation time of the message at this position.
    pub created_at: Timestamp,
    /// Id of the message at this position.
    pub message_id: MessageId,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.message_id, self.created_at)
    }
}

/// Error returned when user input fails local validation.
///
/// Validation errors are raised before anything is sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty or whitespace.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// File MIME type is not on the allow-list.
    #[error("unsupported file type: {0}")]
    UnsupportedMime(String),
    /// File exceeds the upload size cap.
    #[error("file too large ({size} bytes, max {max} bytes)")]
    FileTooLarge {
        /// Actual file size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// File has no content.
    #[error("file is empty")]
    EmptyFile,
}

/// Validates text content for sending.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] if the text is blank, or
/// [`ValidationError::TooLarge`] if it exceeds [`MAX_MESSAGE_SIZE`].
pub fn validate_text(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(id: Option<u64>, at: u64) -> Message {
        Message {
            message_id: id.map(MessageId::new),
            room_id: RoomId::new("r1"),
            sender_id: UserId::new("alice"),
            content: "hi".into(),
            kind: MessageKind::Text,
            created_at: Timestamp::from_millis(at),
            read_by: BTreeSet::new(),
            local_id: None,
        }
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(make_message(Some(3), 10)).unwrap();
        assert_eq!(json["messageId"], 3);
        assert_eq!(json["roomId"], "r1");
        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["createdAt"], 10);
        assert_eq!(json["kind"], "text");
        assert!(json.get("localId").is_none());
        assert!(json.get("readBy").is_none());
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{"roomId":"r1","senderId":"bob","content":"x","createdAt":5}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.message_id, None);
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(msg.read_by.is_empty());
    }

    #[test]
    fn position_is_none_while_pending() {
        assert!(make_message(None, 1).position().is_none());
        assert_eq!(
            make_message(Some(4), 1).position(),
            Some(Position {
                created_at: Timestamp::from_millis(1),
                message_id: MessageId::new(4),
            })
        );
    }

    #[test]
    fn position_orders_by_time_then_id() {
        let a = make_message(Some(9), 100).position().unwrap();
        let b = make_message(Some(2), 200).position().unwrap();
        let c = make_message(Some(3), 200).position().unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn validate_empty_text_returns_error() {
        assert_eq!(validate_text(""), Err(ValidationError::Empty));
        assert_eq!(validate_text("   \n"), Err(ValidationError::Empty));
    }

    #[test]
    fn validate_exactly_at_size_limit_ok() {
        assert!(validate_text(&"a".repeat(MAX_MESSAGE_SIZE)).is_ok());
    }

    #[test]
    fn validate_one_byte_over_limit_returns_error() {
        let result = validate_text(&"a".repeat(MAX_MESSAGE_SIZE + 1));
        assert_eq!(
            result,
            Err(ValidationError::TooLarge {
                size: MAX_MESSAGE_SIZE + 1,
                max: MAX_MESSAGE_SIZE,
            })
        );
    }
}
