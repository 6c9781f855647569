//! REST collaborator API.
//!
//! Every route requires `Authorization: Bearer <token>`. Errors are returned
//! as [`ErrorBody`] JSON with the matching status code.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use studychat_proto::event::ServerEvent;
use studychat_proto::ids::{MessageId, RoomId, UserId};
use studychat_proto::message::{self, Message, MessageKind};
use studychat_proto::rest::{
    ErrorBody, HistoryPage, HistoryQuery, PostMessage, ReadAck, RoomSummary, SearchQuery,
    UploadChunkReceipt, upload_fields,
};

use crate::hub::HubState;
use crate::store::{Chunk, UploadRejection};

/// Multipart overhead allowed on top of the file size cap.
const FORM_OVERHEAD: usize = 64 * 1024;

/// Errors returned by REST handlers.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Missing or unknown bearer token.
    #[error("unauthorized")]
    Unauthorized,
    /// Unknown room, message or file.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Request body over the size limit.
    #[error("request body too large")]
    BodyTooLarge,
    /// Upload refused.
    #[error(transparent)]
    Upload(#[from] UploadRejection),
}

impl HubError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Upload(UploadRejection::BadChunk(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::BodyTooLarge | Self::Upload(UploadRejection::TooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::Upload(UploadRejection::UnsupportedMime(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!(status = status.as_u16(), error = %self, "request failed");
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// The user authenticated by the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<Arc<HubState>> for AuthUser {
    type Rejection = HubError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<HubState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(HubError::Unauthorized)?;
        state
            .authenticate(token.trim())
            .cloned()
            .map(Self)
            .ok_or(HubError::Unauthorized)
    }
}

/// Build the REST routes. Uploads accept bodies up to `max_file_size`
/// plus form overhead; the exact cap is enforced per file.
pub fn router(max_file_size: usize) -> Router<Arc<HubState>> {
    Router::new()
        .route("/rooms", get(list_rooms))
        .route("/rooms/{id}", get(get_room))
        .route("/rooms/{id}/messages", get(history).post(post_message))
        .route("/rooms/{id}/messages/search", get(search))
        .route("/rooms/{id}/messages/{mid}/read", put(mark_read))
        .route(
            "/rooms/{id}/files",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_file_size + FORM_OVERHEAD)),
        )
        .route("/files/{upload_id}/{name}", get(download))
}

async fn known_room(state: &HubState, room: &RoomId) -> Result<(), HubError> {
    if state.room_allowed(room) {
        state.rooms.ensure_room(room).await;
        Ok(())
    } else {
        Err(HubError::NotFound(format!("room {room}")))
    }
}

async fn list_rooms(State(state): State<Arc<HubState>>, _user: AuthUser) -> Json<Vec<RoomSummary>> {
    Json(state.rooms.summaries().await)
}

async fn get_room(
    State(state): State<Arc<HubState>>,
    _user: AuthUser,
    Path(room): Path<RoomId>,
) -> Result<Json<RoomSummary>, HubError> {
    state
        .rooms
        .summary(&room)
        .await
        .map(Json)
        .ok_or_else(|| HubError::NotFound(format!("room {room}")))
}

async fn history(
    State(state): State<Arc<HubState>>,
    _user: AuthUser,
    Path(room): Path<RoomId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, HubError> {
    known_room(&state, &room).await?;
    Ok(Json(state.rooms.history(&room, query.before, query.limit).await))
}

async fn post_message(
    State(state): State<Arc<HubState>>,
    AuthUser(user): AuthUser,
    Path(room): Path<RoomId>,
    Json(body): Json<PostMessage>,
) -> Result<Json<Message>, HubError> {
    known_room(&state, &room).await?;
    if body.kind == MessageKind::Text {
        message::validate_text(&body.content).map_err(|e| HubError::BadRequest(e.to_string()))?;
    } else if body.content.trim().is_empty() {
        return Err(HubError::BadRequest("file message without url".to_string()));
    }

    let (stored, created) = state.rooms.append(&room, &user, &body).await;
    if created {
        tracing::info!(room_id = %room, user_id = %user, message_id = ?stored.message_id, "message stored");
        state
            .broadcast_room(&room, &ServerEvent::Message(stored.clone()), None)
            .await;
    }
    Ok(Json(stored))
}

async fn search(
    State(state): State<Arc<HubState>>,
    _user: AuthUser,
    Path(room): Path<RoomId>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Message>>, HubError> {
    known_room(&state, &room).await?;
    Ok(Json(state.rooms.search(&room, &query.keyword).await))
}

async fn mark_read(
    State(state): State<Arc<HubState>>,
    AuthUser(user): AuthUser,
    Path((room, message_id)): Path<(RoomId, MessageId)>,
) -> Result<Json<ReadAck>, HubError> {
    let position = state
        .rooms
        .mark_read(&room, &user, message_id)
        .await
        .ok_or_else(|| HubError::NotFound(format!("message {message_id}")))?;
    tracing::debug!(room_id = %room, user_id = %user, up_to = %position, "read");
    let event = ServerEvent::Read {
        room_id: room.clone(),
        user_id: user,
        message_id: position.message_id,
        created_at: position.created_at,
    };
    state.broadcast_room(&room, &event, None).await;
    Ok(Json(ReadAck {
        message_id: position.message_id,
        created_at: position.created_at,
    }))
}

async fn upload_chunk(
    State(state): State<Arc<HubState>>,
    _user: AuthUser,
    Path(room): Path<RoomId>,
    mut multipart: Multipart,
) -> Result<Json<UploadChunkReceipt>, HubError> {
    known_room(&state, &room).await?;

    let mut fields = ChunkFields::default();
    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == upload_fields::CHUNK {
            fields.bytes = Some(field.bytes().await.map_err(form_error)?.to_vec());
        } else {
            let value = field.text().await.map_err(form_error)?;
            fields.set(&name, value);
        }
    }
    let chunk = fields.into_chunk()?;
    tracing::debug!(room_id = %room, upload_id = %chunk.upload_id, index = chunk.index, "chunk received");
    Ok(Json(state.uploads.put_chunk(chunk).await?))
}

async fn download(
    State(state): State<Arc<HubState>>,
    Path((upload_id, _name)): Path<(String, String)>,
) -> Result<Response, HubError> {
    let file = state
        .uploads
        .file(&upload_id)
        .await
        .ok_or_else(|| HubError::NotFound(format!("file {upload_id}")))?;
    Ok(([(header::CONTENT_TYPE, file.mime_type)], file.bytes).into_response())
}

fn form_error(e: axum::extract::multipart::MultipartError) -> HubError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        HubError::BodyTooLarge
    } else {
        HubError::BadRequest(e.body_text())
    }
}

#[derive(Debug, Default)]
struct ChunkFields {
    upload_id: Option<String>,
    index: Option<String>,
    count: Option<String>,
    file_name: Option<String>,
    mime_type: Option<String>,
    bytes: Option<Vec<u8>>,
}

impl ChunkFields {
    fn set(&mut self, name: &str, value: String) {
        match name {
            upload_fields::UPLOAD_ID => self.upload_id = Some(value),
            upload_fields::CHUNK_INDEX => self.index = Some(value),
            upload_fields::CHUNK_COUNT => self.count = Some(value),
            upload_fields::FILE_NAME => self.file_name = Some(value),
            upload_fields::MIME_TYPE => self.mime_type = Some(value),
            other => tracing::debug!(field = other, "ignoring form field"),
        }
    }

    fn into_chunk(self) -> Result<Chunk, HubError> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T, HubError> {
            value.ok_or_else(|| HubError::BadRequest(format!("missing field {name}")))
        }
        fn number(value: Option<String>, name: &str) -> Result<usize, HubError> {
            required(value, name)?
                .parse()
                .map_err(|_| HubError::BadRequest(format!("field {name} is not a number")))
        }

        Ok(Chunk {
            upload_id: required(self.upload_id, upload_fields::UPLOAD_ID)?,
            index: number(self.index, upload_fields::CHUNK_INDEX)?,
            count: number(self.count, upload_fields::CHUNK_COUNT)?,
            file_name: required(self.file_name, upload_fields::FILE_NAME)?,
            mime_type: required(self.mime_type, upload_fields::MIME_TYPE)?,
            bytes: required(self.bytes, upload_fields::CHUNK)?,
        })
    }
}
