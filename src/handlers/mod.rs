// src/handlers/mod.rs
pub mod bi;
pub mod chat;
pub mod router;
pub mod status;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;

use crate::bi::BiError;
use crate::router::DispatchError;
use crate::services::ChatError;

pub const SESSION_NOT_FOUND: &str = "会话不存在";

/// Every route under `/api`.
pub fn api_routes() -> Router {
    Router::new()
        .merge(chat::chat_routes())
        .merge(bi::bi_routes())
        .merge(router::router_routes())
        .merge(status::status_routes())
}

/// Error returned by the HTTP handlers; the body is always `{"detail": ...}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Unprocessable(String),
    /// A failed chat turn, reported as an error message from `system`.
    ChatFailed(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    /// Mapping for the chat-turn endpoints.
    pub fn from_chat_turn(err: ChatError) -> Self {
        match err {
            ChatError::SessionNotFound(_) => ApiError::NotFound,
            ChatError::InvalidParam(msg) => ApiError::Unprocessable(msg),
            other => ApiError::ChatFailed(other.to_string()),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::SessionNotFound(_) => ApiError::NotFound,
            ChatError::InvalidParam(msg) => ApiError::Unprocessable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<BiError> for ApiError {
    fn from(err: BiError) -> Self {
        match err {
            BiError::NotConfigured(what) => ApiError::ServiceUnavailable(format!("{} is not configured", what)),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

/// Unwraps a JSON body, reporting malformed or mistyped bodies as 422.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::Unprocessable(e.body_text()))
}

/// Body of a failed chat turn.
pub fn chat_error_detail(message: &str) -> serde_json::Value {
    json!({
        "type": "error",
        "content": format!("Error: {}", message),
        "source": "system",
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, json!(SESSION_NOT_FOUND)),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, json!(msg)),
            ApiError::ChatFailed(msg) => {
                tracing::error!("Chat turn failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, chat_error_detail(&msg))
            }
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, json!(msg)),
            ApiError::Internal(msg) => {
                tracing::error!("Request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, json!(msg))
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
