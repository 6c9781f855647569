//! JSON text-frame codec for the socket event surface.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Largest text frame either side accepts (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Maximum accepted size in bytes.
        max: usize,
    },
}

/// Encodes an event into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized,
/// or `CodecError::FrameTooLarge` if the encoded frame exceeds the limit.
pub fn encode<T: Serialize>(event: &T) -> Result<String, CodecError> {
    let frame = serde_json::to_string(event)?;
    check_size(frame.len())?;
    Ok(frame)
}

/// Decodes an event from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` for oversized frames, or
/// `CodecError::Serialization` if the frame is not a known event.
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, CodecError> {
    check_size(frame.len())?;
    Ok(serde_json::from_str(frame)?)
}

const fn check_size(size: usize) -> Result<(), CodecError> {
    if size > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}
