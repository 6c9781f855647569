//! File attachment rules shared by the client and the hub.
//!
//! The storage collaborator accepts uploads under a size cap and from an
//! allow-listed set of MIME types. The client checks the same rules before
//! sending anything.

use crate::message::{MessageKind, ValidationError};

/// Default upload size cap (10 MB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// MIME types the storage collaborator accepts.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "application/pdf",
    "application/msword",
    "video/mp4",
];

/// Maps an allowed MIME type to the message kind that displays it.
///
/// Returns `None` for types outside [`ALLOWED_MIME_TYPES`].
#[must_use]
pub fn kind_for_mime(mime_type: &str) -> Option<MessageKind> {
    let mime = mime_type.trim().to_ascii_lowercase();
    if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
        return None;
    }
    if mime.starts_with("image/") {
        Some(MessageKind::Image)
    } else if mime.starts_with("video/") {
        Some(MessageKind::Video)
    } else {
        Some(MessageKind::File)
    }
}

/// Validates a file against the MIME allow-list and size cap.
///
/// Returns the message kind for the placeholder message on success.
///
/// # Errors
///
/// Returns [`ValidationError::UnsupportedMime`], [`ValidationError::EmptyFile`]
/// or [`ValidationError::FileTooLarge`].
pub fn validate_file(
    mime_type: &str,
    size: usize,
    max_size: usize,
) -> Result<MessageKind, ValidationError> {
    let kind = kind_for_mime(mime_type)
        .ok_or_else(|| ValidationError::UnsupportedMime(mime_type.to_string()))?;
    if size == 0 {
        return Err(ValidationError::EmptyFile);
    }
    if size > max_size {
        return Err(ValidationError::FileTooLarge {
            size,
            max: max_size,
        });
    }
    Ok(kind)
}
