//! REST collaborator client.
//!
//! [`ChatApi`] is the seam the chat core talks to for history, sends, read
//! receipts, uploads and search; [`HttpChatApi`] implements it over
//! `reqwest` with bearer-token authentication.

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use studychat_proto::ids::{AttachmentId, MessageId, RoomId};
use studychat_proto::message::Message;
use studychat_proto::rest::{
    ErrorBody, HistoryPage, HistoryQuery, PostMessage, ReadAck, RoomSummary, SearchQuery,
    UploadChunkReceipt, upload_fields,
};
use url::Url;

/// Errors returned by REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Token missing, expired or not allowed (401/403).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Room or message does not exist (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// The storage collaborator refused the file size (413).
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// The storage collaborator refused the MIME type (415).
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Any other non-success status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error text from the body, or the canonical reason.
        message: String,
    },

    /// Connection, timeout or body decoding failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The base URL cannot carry path segments.
    #[error("invalid API base URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Map a non-success status and its error text to an `ApiError`.
    #[must_use]
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(message),
            404 => Self::NotFound(message),
            413 => Self::PayloadTooLarge(message),
            415 => Self::UnsupportedMediaType(message),
            _ => Self::Status { status, message },
        }
    }

    /// Whether repeating the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

/// One chunk of a file upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpload {
    /// Attachment the chunk belongs to.
    pub upload_id: AttachmentId,
    /// Zero-based chunk index.
    pub chunk_index: usize,
    /// Total chunks of the file.
    pub chunk_count: usize,
    /// Original file name.
    pub file_name: String,
    /// MIME type of the file.
    pub mime_type: String,
    /// Chunk bytes.
    pub bytes: Vec<u8>,
}

/// The REST operations the chat core depends on.
pub trait ChatApi: Send + Sync + 'static {
    /// `GET /rooms`
    fn list_rooms(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<RoomSummary>, ApiError>> + Send;

    /// `GET /rooms/{id}`
    fn get_room(
        &self,
        room: &RoomId,
    ) -> impl std::future::Future<Output = Result<RoomSummary, ApiError>> + Send;

    /// `GET /rooms/{id}/messages?before=&limit=`
    fn history(
        &self,
        room: &RoomId,
        query: HistoryQuery,
    ) -> impl std::future::Future<Output = Result<HistoryPage, ApiError>> + Send;

    /// `POST /rooms/{id}/messages`
    fn post_message(
        &self,
        room: &RoomId,
        body: &PostMessage,
    ) -> impl std::future::Future<Output = Result<Message, ApiError>> + Send;

    /// `POST /rooms/{id}/files` (multipart, one chunk)
    fn upload_chunk(
        &self,
        room: &RoomId,
        chunk: ChunkUpload,
    ) -> impl std::future::Future<Output = Result<UploadChunkReceipt, ApiError>> + Send;

    /// `PUT /rooms/{id}/messages/{mid}/read`
    fn mark_read(
        &self,
        room: &RoomId,
        message_id: MessageId,
    ) -> impl std::future::Future<Output = Result<ReadAck, ApiError>> + Send;

    /// `GET /rooms/{id}/messages/search?keyword=`
    fn search(
        &self,
        room: &RoomId,
        keyword: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, ApiError>> + Send;
}

impl<A: ChatApi> ChatApi for Arc<A> {
    async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ApiError> {
        (**self).list_rooms().await
    }

    async fn get_room(&self, room: &RoomId) -> Result<RoomSummary, ApiError> {
        (**self).get_room(room).await
    }

    async fn history(&self, room: &RoomId, query: HistoryQuery) -> Result<HistoryPage, ApiError> {
        (**self).history(room, query).await
    }

    async fn post_message(&self, room: &RoomId, body: &PostMessage) -> Result<Message, ApiError> {
        (**self).post_message(room, body).await
    }

    async fn upload_chunk(
        &self,
        room: &RoomId,
        chunk: ChunkUpload,
    ) -> Result<UploadChunkReceipt, ApiError> {
        (**self).upload_chunk(room, chunk).await
    }

    async fn mark_read(&self, room: &RoomId, message_id: MessageId) -> Result<ReadAck, ApiError> {
        (**self).mark_read(room, message_id).await
    }

    async fn search(&self, room: &RoomId, keyword: &str) -> Result<Vec<Message>, ApiError> {
        (**self).search(room, keyword).await
    }
}

/// [`ChatApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpChatApi {
    /// Create a client for `base` authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if `base` cannot carry a path, or
    /// [`ApiError::Request`] if the HTTP client cannot be built.
    pub fn new(base: Url, token: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base.to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            token: token.into(),
        })
    }

    /// The base URL requests are resolved against.
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Turn a non-success response into an [`ApiError`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let fallback = status.canonical_reason().unwrap_or("error").to_string();
    let message = response
        .json::<ErrorBody>()
        .await
        .map_or(fallback, |body| body.error);
    tracing::debug!(status = status.as_u16(), message = %message, "REST call failed");
    Err(ApiError::from_status(status.as_u16(), message))
}

impl ChatApi for HttpChatApi {
    async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ApiError> {
        let url = self.endpoint(&["rooms"])?;
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn get_room(&self, room: &RoomId) -> Result<RoomSummary, ApiError> {
        let url = self.endpoint(&["rooms", room.as_str()])?;
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn history(&self, room: &RoomId, query: HistoryQuery) -> Result<HistoryPage, ApiError> {
        let url = self.endpoint(&["rooms", room.as_str(), "messages"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn post_message(&self, room: &RoomId, body: &PostMessage) -> Result<Message, ApiError> {
        let url = self.endpoint(&["rooms", room.as_str(), "messages"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn upload_chunk(
        &self,
        room: &RoomId,
        chunk: ChunkUpload,
    ) -> Result<UploadChunkReceipt, ApiError> {
        let url = self.endpoint(&["rooms", room.as_str(), "files"])?;
        let part = Part::bytes(chunk.bytes)
            .file_name(chunk.file_name.clone())
            .mime_str(&chunk.mime_type)?;
        let form = Form::new()
            .text(upload_fields::UPLOAD_ID, chunk.upload_id.to_string())
            .text(upload_fields::CHUNK_INDEX, chunk.chunk_index.to_string())
            .text(upload_fields::CHUNK_COUNT, chunk.chunk_count.to_string())
            .text(upload_fields::FILE_NAME, chunk.file_name)
            .text(upload_fields::MIME_TYPE, chunk.mime_type)
            .part(upload_fields::CHUNK, part);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn mark_read(&self, room: &RoomId, message_id: MessageId) -> Result<ReadAck, ApiError> {
        let mid = message_id.to_string();
        let url = self.endpoint(&["rooms", room.as_str(), "messages", &mid, "read"])?;
        let response = self.http.put(url).bearer_auth(&self.token).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn search(&self, room: &RoomId, keyword: &str) -> Result<Vec<Message>, ApiError> {
        let url = self.endpoint(&["rooms", room.as_str(), "messages", "search"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(&SearchQuery {
                keyword: keyword.to_string(),
            })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}
