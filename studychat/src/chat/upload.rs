//! Chunked attachment uploads.
//!
//! [`Uploader`] keeps one [`Attachment`] record per file: which placeholder
//! message it belongs to, how many chunks the storage collaborator has
//! acknowledged, and its [`UploadStatus`]. The network side runs in
//! [`run_upload`], spawned per attempt, which reports [`UploadUpdate`]s
//! back to the client event loop.
//!
//! A failed upload resumes from the first chunk that was not acknowledged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use studychat_proto::attachment;
use studychat_proto::ids::{AttachmentId, LocalId, RoomId};
use studychat_proto::message::{MessageKind, ValidationError};
use tokio::sync::mpsc;

use crate::api::{ChatApi, ChunkUpload};
use crate::config::UploadConfig;

/// A file the user wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    /// File name shown to other participants.
    pub file_name: String,
    /// MIME type; must be on the allow-list.
    pub mime_type: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// Progress of one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    /// Registered, no chunk sent yet.
    Pending,
    /// Chunks are being sent.
    Uploading,
    /// Every chunk was stored; the file URL is known.
    Complete,
    /// Gave up; `retry_upload` resumes it.
    Failed(String),
}

/// Errors from the uploader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// The file was rejected locally and never sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No attachment with this id.
    #[error("unknown attachment {0}")]
    UnknownAttachment(AttachmentId),

    /// Only a failed upload can be retried.
    #[error("attachment {0} has not failed")]
    NotFailed(AttachmentId),

    /// A chunk could not be stored.
    #[error("chunk {index} failed after {attempts} attempt(s): {reason}")]
    ChunkFailed {
        /// Zero-based chunk index.
        index: usize,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        reason: String,
    },

    /// All chunks were stored but no file URL came back.
    #[error("upload finished without a file URL")]
    MissingUrl,
}

/// One attachment being uploaded.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Attachment identifier, also the upload id sent with each chunk.
    pub attachment_id: AttachmentId,
    /// Room the file is sent to.
    pub room_id: RoomId,
    /// Local id of the placeholder message.
    pub local_id: LocalId,
    /// File name.
    pub file_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Message kind derived from the MIME type.
    pub kind: MessageKind,
    /// Fraction of chunks acknowledged, `0.0..=1.0`.
    pub progress: f32,
    /// Current status.
    pub status: UploadStatus,
    /// Stored file URL once complete.
    pub url: Option<String>,
    data: Arc<[u8]>,
    chunk_count: usize,
    acked: usize,
}

impl Attachment {
    /// Chunks the file is split into.
    #[must_use]
    pub const fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Chunks acknowledged so far.
    #[must_use]
    pub const fn acked_chunks(&self) -> usize {
        self.acked
    }
}

/// Work order for [`run_upload`].
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Attachment to upload.
    pub attachment_id: AttachmentId,
    /// Target room.
    pub room_id: RoomId,
    /// File name.
    pub file_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Whole file.
    pub data: Arc<[u8]>,
    /// Chunk size in bytes.
    pub chunk_size: usize,
    /// Total chunks.
    pub chunk_count: usize,
    /// First chunk to send.
    pub first_chunk: usize,
}

impl UploadJob {
    fn chunk(&self, index: usize) -> &[u8] {
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        self.data.get(start..end).unwrap_or_default()
    }
}

/// Reported by [`run_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadUpdate {
    /// Chunk `index` was stored.
    ChunkStored {
        /// Attachment.
        attachment_id: AttachmentId,
        /// Zero-based chunk index.
        index: usize,
    },
    /// The upload ended.
    Finished {
        /// Attachment.
        attachment_id: AttachmentId,
        /// File URL or the reason it failed.
        result: Result<String, UploadError>,
    },
}

/// Attachment records, owned by the client event loop.
#[derive(Debug)]
pub struct Uploader {
    attachments: HashMap<AttachmentId, Attachment>,
    config: UploadConfig,
}

impl Uploader {
    /// Create an uploader with the given limits.
    #[must_use]
    pub fn new(config: UploadConfig) -> Self {
        Self {
            attachments: HashMap::new(),
            config,
        }
    }

    /// Upload limits in effect.
    #[must_use]
    pub const fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Check the MIME type and size. Returns the message kind for the file.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Validation`] for a disallowed type, an empty
    /// file, or a file over the size cap.
    pub fn validate(&self, file: &OutgoingFile) -> Result<MessageKind, UploadError> {
        Ok(attachment::validate_file(
            &file.mime_type,
            file.bytes.len(),
            self.config.max_file_size,
        )?)
    }

    /// Record a validated file for the placeholder `local_id`.
    pub fn register(
        &mut self,
        room: &RoomId,
        local_id: LocalId,
        file: OutgoingFile,
        kind: MessageKind,
    ) -> AttachmentId {
        let attachment_id = AttachmentId::new();
        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = file.bytes.len().div_ceil(chunk_size).max(1);
        self.attachments.insert(
            attachment_id,
            Attachment {
                attachment_id,
                room_id: room.clone(),
                local_id,
                file_name: file.file_name,
                mime_type: file.mime_type,
                kind,
                progress: 0.0,
                status: UploadStatus::Pending,
                url: None,
                data: Arc::from(file.bytes),
                chunk_count,
                acked: 0,
            },
        );
        tracing::debug!(attachment_id = %attachment_id, room_id = %room, chunk_count, "attachment registered");
        attachment_id
    }

    /// Mark the attachment uploading and build the job for it.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::UnknownAttachment`] for an unknown id.
    pub fn start(&mut self, attachment_id: AttachmentId) -> Result<UploadJob, UploadError> {
        let chunk_size = self.config.chunk_size.max(1);
        let attachment = self
            .attachments
            .get_mut(&attachment_id)
            .ok_or(UploadError::UnknownAttachment(attachment_id))?;
        attachment.status = UploadStatus::Uploading;
        Ok(UploadJob {
            attachment_id,
            room_id: attachment.room_id.clone(),
            file_name: attachment.file_name.clone(),
            mime_type: attachment.mime_type.clone(),
            data: Arc::clone(&attachment.data),
            chunk_size,
            chunk_count: attachment.chunk_count,
            first_chunk: attachment.acked,
        })
    }

    /// Resume a failed upload from its first unacknowledged chunk.
    ///
    /// # Errors
    ///
    /// - [`UploadError::UnknownAttachment`] for an unknown id.
    /// - [`UploadError::NotFailed`] unless the upload is `Failed`.
    pub fn retry(&mut self, attachment_id: AttachmentId) -> Result<UploadJob, UploadError> {
        let attachment = self
            .attachments
            .get(&attachment_id)
            .ok_or(UploadError::UnknownAttachment(attachment_id))?;
        if !matches!(attachment.status, UploadStatus::Failed(_)) {
            return Err(UploadError::NotFailed(attachment_id));
        }
        tracing::info!(attachment_id = %attachment_id, from_chunk = attachment.acked, "retrying upload");
        self.start(attachment_id)
    }

    /// Chunk `index` was stored. Returns the new progress.
    pub fn on_chunk_stored(&mut self, attachment_id: AttachmentId, index: usize) -> Option<f32> {
        let attachment = self.attachments.get_mut(&attachment_id)?;
        attachment.acked = attachment.acked.max(index + 1).min(attachment.chunk_count);
        #[allow(clippy::cast_precision_loss)]
        let progress = attachment.acked as f32 / attachment.chunk_count as f32;
        attachment.progress = progress;
        Some(progress)
    }

    /// The upload finished with `url`. Returns the attachment.
    pub fn on_complete(&mut self, attachment_id: AttachmentId, url: String) -> Option<&Attachment> {
        let attachment = self.attachments.get_mut(&attachment_id)?;
        attachment.status = UploadStatus::Complete;
        attachment.progress = 1.0;
        attachment.acked = attachment.chunk_count;
        attachment.url = Some(url);
        Some(attachment)
    }

    /// The upload failed. Returns the attachment.
    pub fn on_failed(&mut self, attachment_id: AttachmentId, reason: &str) -> Option<&Attachment> {
        let attachment = self.attachments.get_mut(&attachment_id)?;
        attachment.status = UploadStatus::Failed(reason.to_string());
        Some(attachment)
    }

    /// The attachment record.
    #[must_use]
    pub fn get(&self, attachment_id: AttachmentId) -> Option<&Attachment> {
        self.attachments.get(&attachment_id)
    }

    /// The attachment whose placeholder is `local_id`.
    #[must_use]
    pub fn for_local(&self, local_id: LocalId) -> Option<&Attachment> {
        self.attachments.values().find(|a| a.local_id == local_id)
    }

    /// Whether the placeholder `local_id` is still waiting for its file.
    #[must_use]
    pub fn blocks_send(&self, local_id: LocalId) -> bool {
        self.for_local(local_id)
            .is_some_and(|a| a.status != UploadStatus::Complete)
    }

    /// Forget attachments of a room.
    pub fn clear_room(&mut self, room: &RoomId) {
        self.attachments.retain(|_, a| a.room_id != *room);
    }
}

/// Upload every remaining chunk of `job`, reporting progress on `updates`.
///
/// Each chunk gets `config.chunk_timeout` per attempt and up to
/// `config.max_attempts` attempts, waiting `backoff_base * 2^(n-1)` between
/// them. Non-retryable API errors (413, 415, auth) fail at once.
pub async fn run_upload<A, T>(
    api: Arc<A>,
    job: UploadJob,
    config: UploadConfig,
    updates: mpsc::UnboundedSender<T>,
) where
    A: ChatApi,
    T: From<UploadUpdate> + Send + 'static,
{
    let attachment_id = job.attachment_id;
    let result = upload_chunks(&*api, &job, &config, &updates).await;
    if let Err(e) = &result {
        tracing::warn!(attachment_id = %attachment_id, error = %e, "upload failed");
    }
    let _ = updates.send(T::from(UploadUpdate::Finished {
        attachment_id,
        result,
    }));
}

async fn upload_chunks<A: ChatApi, T: From<UploadUpdate>>(
    api: &A,
    job: &UploadJob,
    config: &UploadConfig,
    updates: &mpsc::UnboundedSender<T>,
) -> Result<String, UploadError> {
    let max_attempts = config.max_attempts.max(1);
    let mut url = None;

    for index in job.first_chunk..job.chunk_count {
        let mut attempt = 0;
        let receipt = loop {
            attempt += 1;
            let chunk = ChunkUpload {
                upload_id: job.attachment_id,
                chunk_index: index,
                chunk_count: job.chunk_count,
                file_name: job.file_name.clone(),
                mime_type: job.mime_type.clone(),
                bytes: job.chunk(index).to_vec(),
            };
            let reason = match tokio::time::timeout(
                config.chunk_timeout,
                api.upload_chunk(&job.room_id, chunk),
            )
            .await
            {
                Ok(Ok(receipt)) => break receipt,
                Ok(Err(e)) if !e.is_retryable() => {
                    return Err(UploadError::ChunkFailed {
                        index,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "chunk upload timed out".to_string(),
            };
            if attempt >= max_attempts {
                return Err(UploadError::ChunkFailed {
                    index,
                    attempts: attempt,
                    reason,
                });
            }
            let delay = backoff(config.backoff_base, attempt);
            tracing::debug!(index, attempt, delay_ms = delay.as_millis(), reason = %reason, "retrying chunk");
            tokio::time::sleep(delay).await;
        };

        let _ = updates.send(T::from(UploadUpdate::ChunkStored {
            attachment_id: job.attachment_id,
            index,
        }));
        if receipt.url.is_some() {
            url = receipt.url;
        }
    }

    url.ok_or(UploadError::MissingUrl)
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1_u32 << attempt.saturating_sub(1).min(16))
}
