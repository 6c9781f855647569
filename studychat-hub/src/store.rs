//! In-memory room logs and upload assembly for the hub.
//!
//! [`RoomStore`] keeps each room's messages in `(created_at, message_id)`
//! order together with every user's read watermark. [`UploadStore`]
//! collects file chunks until the last one arrives and then keeps the
//! assembled file.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use studychat_proto::attachment;
use studychat_proto::ids::{LocalId, MessageId, RoomId, Timestamp, UserId};
use studychat_proto::message::{Message, Position};
use studychat_proto::rest::{HistoryPage, PostMessage, RoomSummary, UploadChunkReceipt};
use tokio::sync::RwLock;

/// Default history page size when the client gives no limit.
pub const DEFAULT_PAGE_SIZE: usize = 30;

#[derive(Debug, Default)]
struct RoomLog {
    messages: Vec<Message>,
    by_local: HashMap<(UserId, LocalId), MessageId>,
    reads: HashMap<UserId, Position>,
}

impl RoomLog {
    fn insert(&mut self, message: Message) {
        let key = message.position();
        let idx = self.messages.partition_point(|m| m.position() <= key);
        self.messages.insert(idx, message);
    }
}

#[derive(Debug, Default)]
struct Rooms {
    next_id: u64,
    logs: HashMap<RoomId, RoomLog>,
}

/// Per-room message logs.
#[derive(Debug, Default)]
pub struct RoomStore {
    inner: RwLock<Rooms>,
}

impl RoomStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `room` exists.
    pub async fn ensure_room(&self, room: &RoomId) {
        self.inner.write().await.logs.entry(room.clone()).or_default();
    }

    /// Whether `room` has been created.
    pub async fn has_room(&self, room: &RoomId) -> bool {
        self.inner.read().await.logs.contains_key(room)
    }

    /// Store a posted message and return it with its new id.
    ///
    /// Posting the same `local_id` twice from the same sender returns the
    /// stored message instead of creating a second one. The client's
    /// `created_at` is kept when given. The `bool` is `true` for a new
    /// message.
    pub async fn append(&self, room: &RoomId, sender: &UserId, body: &PostMessage) -> (Message, bool) {
        let mut rooms = self.inner.write().await;
        let Rooms { next_id, logs } = &mut *rooms;
        let log = logs.entry(room.clone()).or_default();

        let key = (sender.clone(), body.local_id);
        if let Some(existing) = log.by_local.get(&key).copied() {
            if let Some(message) = log.messages.iter().find(|m| m.message_id == Some(existing)) {
                tracing::debug!(room_id = %room, message_id = %existing, "duplicate post");
                return (message.clone(), false);
            }
        }

        *next_id += 1;
        let message_id = MessageId::new(*next_id);
        let message = Message {
            message_id: Some(message_id),
            room_id: room.clone(),
            sender_id: sender.clone(),
            content: body.content.clone(),
            kind: body.kind,
            created_at: body.created_at.unwrap_or_else(Timestamp::now),
            read_by: BTreeSet::new(),
            local_id: Some(body.local_id),
        };
        log.by_local.insert(key, message_id);
        log.insert(message.clone());
        (message, true)
    }

    /// A page of messages older than `before`, oldest first.
    pub async fn history(
        &self,
        room: &RoomId,
        before: Option<MessageId>,
        limit: Option<usize>,
    ) -> HistoryPage {
        let rooms = self.inner.read().await;
        let Some(log) = rooms.logs.get(room) else {
            return HistoryPage::default();
        };
        let end = match before {
            Some(id) => log
                .messages
                .iter()
                .position(|m| m.message_id == Some(id))
                .unwrap_or(log.messages.len()),
            None => log.messages.len(),
        };
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let start = end.saturating_sub(limit);
        HistoryPage {
            messages: log.messages[start..end].to_vec(),
            has_more: start > 0,
        }
    }

    /// Messages whose content contains `keyword`, ignoring case.
    pub async fn search(&self, room: &RoomId, keyword: &str) -> Vec<Message> {
        let needle = keyword.to_lowercase();
        let rooms = self.inner.read().await;
        rooms
            .logs
            .get(room)
            .map(|log| {
                log.messages
                    .iter()
                    .filter(|m| m.content.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record that `user` read `room` up to `message_id`.
    ///
    /// The watermark never moves back: reading an older message leaves the
    /// later one in place. Returns the effective watermark, or `None` if the
    /// message does not exist.
    pub async fn mark_read(
        &self,
        room: &RoomId,
        user: &UserId,
        message_id: MessageId,
    ) -> Option<Position> {
        let mut rooms = self.inner.write().await;
        let log = rooms.logs.get_mut(room)?;
        let requested = log
            .messages
            .iter()
            .find(|m| m.message_id == Some(message_id))
            .and_then(Message::position)?;

        let watermark = log
            .reads
            .get(user)
            .map_or(requested, |current| (*current).max(requested));
        log.reads.insert(user.clone(), watermark);
        for message in &mut log.messages {
            if message.position().is_some_and(|p| p <= watermark) {
                message.read_by.insert(user.clone());
            }
        }
        Some(watermark)
    }

    /// Summaries of every room, sorted by id.
    pub async fn summaries(&self) -> Vec<RoomSummary> {
        let rooms = self.inner.read().await;
        let mut out: Vec<RoomSummary> = rooms
            .logs
            .iter()
            .map(|(id, log)| summary(id, log))
            .collect();
        out.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        out
    }

    /// Summary of one room.
    pub async fn summary(&self, room: &RoomId) -> Option<RoomSummary> {
        let rooms = self.inner.read().await;
        rooms.logs.get(room).map(|log| summary(room, log))
    }
}

fn summary(room: &RoomId, log: &RoomLog) -> RoomSummary {
    let participants: BTreeSet<UserId> = log.messages.iter().map(|m| m.sender_id.clone()).collect();
    RoomSummary {
        room_id: room.clone(),
        name: room.to_string(),
        participants: participants.into_iter().collect(),
        last_message: log.messages.last().cloned(),
    }
}

/// Why a chunk was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadRejection {
    /// MIME type is not on the allow-list.
    #[error("unsupported file type: {0}")]
    UnsupportedMime(String),
    /// The file outgrew the size cap.
    #[error("file too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Bytes received so far.
        size: usize,
        /// Cap.
        max: usize,
    },
    /// Malformed chunk metadata.
    #[error("bad chunk: {0}")]
    BadChunk(String),
}

/// One chunk as received from the multipart form.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Attachment id.
    pub upload_id: String,
    /// Zero-based index.
    pub index: usize,
    /// Total chunk count.
    pub count: usize,
    /// File name.
    pub file_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Chunk bytes.
    pub bytes: Vec<u8>,
}

/// A fully assembled file.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// File name.
    pub file_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Content.
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Assembly {
    count: usize,
    file_name: String,
    mime_type: String,
    chunks: BTreeMap<usize, Vec<u8>>,
}

impl Assembly {
    fn size(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Default)]
struct Uploads {
    partial: HashMap<String, Assembly>,
    files: HashMap<String, StoredFile>,
}

/// Chunked upload assembly.
#[derive(Debug)]
pub struct UploadStore {
    inner: RwLock<Uploads>,
    max_file_size: usize,
}

impl UploadStore {
    /// Creates a store enforcing `max_file_size`.
    #[must_use]
    pub fn new(max_file_size: usize) -> Self {
        Self {
            inner: RwLock::new(Uploads::default()),
            max_file_size,
        }
    }

    /// The upload size cap.
    #[must_use]
    pub const fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Accept one chunk. Re-sending a chunk replaces it, so retries are
    /// harmless. The last missing chunk completes the file.
    ///
    /// # Errors
    ///
    /// Returns an [`UploadRejection`] for a disallowed type, a file over the
    /// cap, or inconsistent chunk metadata. A rejected upload is discarded.
    pub async fn put_chunk(&self, chunk: Chunk) -> Result<UploadChunkReceipt, UploadRejection> {
        if attachment::kind_for_mime(&chunk.mime_type).is_none() {
            return Err(UploadRejection::UnsupportedMime(chunk.mime_type));
        }
        if chunk.count == 0 || chunk.index >= chunk.count {
            return Err(UploadRejection::BadChunk(format!(
                "chunk {} of {}",
                chunk.index, chunk.count
            )));
        }

        let mut uploads = self.inner.write().await;
        if let Some(file) = uploads.files.get(&chunk.upload_id) {
            return Ok(UploadChunkReceipt {
                upload_id: chunk.upload_id.clone(),
                received: chunk.count,
                chunk_count: chunk.count,
                complete: true,
                url: Some(file_url(&chunk.upload_id, &file.file_name)),
            });
        }

        let assembly = uploads
            .partial
            .entry(chunk.upload_id.clone())
            .or_insert_with(|| Assembly {
                count: chunk.count,
                file_name: chunk.file_name.clone(),
                mime_type: chunk.mime_type.clone(),
                chunks: BTreeMap::new(),
            });
        if assembly.count != chunk.count {
            let count = assembly.count;
            uploads.partial.remove(&chunk.upload_id);
            return Err(UploadRejection::BadChunk(format!(
                "chunk count changed from {count} to {}",
                chunk.count
            )));
        }
        assembly.chunks.insert(chunk.index, chunk.bytes);

        let size = assembly.size();
        if size > self.max_file_size {
            uploads.partial.remove(&chunk.upload_id);
            return Err(UploadRejection::TooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let received = assembly.chunks.len();
        if received < assembly.count {
            return Ok(UploadChunkReceipt {
                upload_id: chunk.upload_id,
                received,
                chunk_count: chunk.count,
                complete: false,
                url: None,
            });
        }

        let Some(done) = uploads.partial.remove(&chunk.upload_id) else {
            return Err(UploadRejection::BadChunk("upload vanished".to_string()));
        };
        let url = file_url(&chunk.upload_id, &done.file_name);
        tracing::info!(upload_id = %chunk.upload_id, size, "upload assembled");
        uploads.files.insert(
            chunk.upload_id.clone(),
            StoredFile {
                file_name: done.file_name,
                mime_type: done.mime_type,
                bytes: done.chunks.into_values().flatten().collect(),
            },
        );
        Ok(UploadChunkReceipt {
            upload_id: chunk.upload_id,
            received,
            chunk_count: chunk.count,
            complete: true,
            url: Some(url),
        })
    }

    /// An assembled file.
    pub async fn file(&self, upload_id: &str) -> Option<StoredFile> {
        self.inner.read().await.files.get(upload_id).cloned()
    }
}

/// Download path of an assembled file.
#[must_use]
pub fn file_url(upload_id: &str, file_name: &str) -> String {
    format!("/files/{upload_id}/{file_name}")
}
