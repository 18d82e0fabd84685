//! HTTP endpoints next to the WebSocket: history, rooms, presence, health.

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parley_core::{ChatError, CreateRoom, MessagePage, PageQuery, PresenceSnapshot, RoomFilter};
use parley_protocol::{RoomId, RoomMessage, TopicRoom, User, UserId, PROTOCOL_VERSION};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::handlers::AppState;
use crate::metrics;

/// A [`ChatError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

/// HTTP status for an engine error.
#[must_use]
pub fn status_for(err: &ChatError) -> StatusCode {
    match err {
        ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
        ChatError::InvalidPayload(_) | ChatError::EmptyPayload | ChatError::InvalidRecipient => {
            StatusCode::BAD_REQUEST
        }
        ChatError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ChatError::NotAMember(_) => StatusCode::FORBIDDEN,
        ChatError::RoomFull(_) => StatusCode::CONFLICT,
        ChatError::RoomExpired(_) => StatusCode::GONE,
        ChatError::RoomNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_error(self.0.code());
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));
        (status_for(&self.0), body).into_response()
    }
}

/// Token from an `Authorization: Bearer` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// The authenticated caller of an HTTP request.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ApiError(ChatError::Unauthorized))?;
        Ok(Self(state.engine.authenticate(&token).await?))
    }
}

/// HTTP routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/chat/conversations/:user_id/messages",
            get(conversation_messages),
        )
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/:id", get(get_room))
        .route("/api/rooms/:id/messages", get(room_messages))
        .route("/api/presence/:user_id", get(presence))
}

/// Health check handler.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
    }))
}

/// A page of the caller's conversation with `user_id`.
pub async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(counterpart): Path<u64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let page = state
        .engine
        .direct()
        .list_page(user.id, UserId(counterpart), query)
        .await?;
    Ok(Json(page))
}

pub async fn list_rooms(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Query(filter): Query<RoomFilter>,
) -> Result<Json<Vec<TopicRoom>>, ApiError> {
    Ok(Json(state.engine.rooms().list(&filter).await?))
}

pub async fn create_room(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(request): Json<CreateRoom>,
) -> Result<(StatusCode, Json<TopicRoom>), ApiError> {
    let room = state.engine.rooms().create(user.id, request).await?;
    debug!(room = room.id, user = %user.id, "Room created over HTTP");
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn get_room(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Path(id): Path<RoomId>,
) -> Result<Json<TopicRoom>, ApiError> {
    Ok(Json(state.engine.rooms().get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

/// Backfill for a room, oldest first.
pub async fn room_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Path(id): Path<RoomId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<RoomMessage>>, ApiError> {
    Ok(Json(state.engine.rooms().history(id, query.limit).await?))
}

pub async fn presence(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Path(user_id): Path<u64>,
) -> Json<PresenceSnapshot> {
    Json(state.engine.presence().snapshot(UserId(user_id)))
}
