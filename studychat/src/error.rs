//! Errors surfaced by the chat core to its callers.

use studychat_proto::ids::{AttachmentId, RoomId};
use studychat_proto::message::ValidationError;

use crate::api::ApiError;
use crate::cache::CacheError;
use crate::chat::room::RoomError;
use crate::chat::upload::UploadError;
use crate::config::ConfigError;
use crate::transport::TransportError;

/// Error returned by [`ChatHandle`](crate::chat::ChatHandle) operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The token was rejected. Terminal; the user has to log in again.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A transient network problem. Retried.
    #[error("network error: {0}")]
    Network(String),

    /// No join acknowledgement within the timeout.
    #[error("joining room {room} timed out")]
    JoinTimeout {
        /// Room that could not be joined.
        room: RoomId,
    },

    /// The hub refused the join.
    #[error("joining room {room} was rejected: {reason}")]
    JoinRejected {
        /// Room that could not be joined.
        room: RoomId,
        /// Reason given by the hub.
        reason: String,
    },

    /// An attachment could not be uploaded. Retryable per attachment.
    #[error("upload {attachment_id} failed: {reason}")]
    UploadFailure {
        /// Attachment that failed.
        attachment_id: AttachmentId,
        /// What went wrong.
        reason: String,
    },

    /// Input rejected locally; nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The operation needs a joined room.
    #[error("room {0} is not joined")]
    NotJoined(RoomId),

    /// Message, attachment or room not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The client was shut down or the request was cancelled.
    #[error("chat client closed")]
    Closed,

    /// REST failure that is neither an auth rejection nor transient.
    #[error(transparent)]
    Api(ApiError),

    /// Upload bookkeeping failure.
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Local cache failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ChatError {
    /// Whether the same operation may succeed later without user action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::JoinTimeout { .. } | Self::UploadFailure { .. } => true,
            Self::Api(e) => e.is_retryable(),
            Self::Upload(e) => matches!(e, UploadError::ChunkFailed { .. }),
            _ => false,
        }
    }

    /// Build the error for a failed upload of `attachment_id`.
    ///
    /// Local rejections stay [`ChatError::Validation`]; chunk failures
    /// become [`ChatError::UploadFailure`].
    #[must_use]
    pub fn from_upload(attachment_id: AttachmentId, error: UploadError) -> Self {
        match error {
            UploadError::Validation(e) => Self::Validation(e),
            UploadError::ChunkFailed { .. } | UploadError::MissingUrl => Self::UploadFailure {
                attachment_id,
                reason: error.to_string(),
            },
            other => Self::Upload(other),
        }
    }

    /// Build the error for a failed room operation on `room`.
    #[must_use]
    pub fn from_room(room: &RoomId, error: RoomError) -> Self {
        match error {
            RoomError::Timeout => Self::JoinTimeout { room: room.clone() },
            RoomError::Rejected(reason) => Self::JoinRejected {
                room: room.clone(),
                reason,
            },
            RoomError::Closed => Self::Closed,
        }
    }
}

impl From<ApiError> for ChatError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unauthorized(reason) => Self::Auth(reason),
            e if e.is_retryable() => Self::Network(e.to_string()),
            e => Self::Api(e),
        }
    }
}

impl From<TransportError> for ChatError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::AuthRejected(reason) => Self::Auth(reason),
            e => Self::Network(e.to_string()),
        }
    }
}
