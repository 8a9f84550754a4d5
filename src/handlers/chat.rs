// src/handlers/chat.rs
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Extension, Path, Query,
    },
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{chat_error_detail, json_body, ApiError};
use crate::models::{ChatMessage, SessionSummary, TextMessage};
use crate::services::chat::{DEFAULT_HISTORY_LIMIT, DEFAULT_LIST_LIMIT};
use crate::services::{ChatError, ChatStreamEvent};
use crate::AppState;

pub fn chat_routes() -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/history", get(get_history))
        .route("/api/sessions/:id/chat", post(chat))
        .route("/api/sessions/:id/chat/stream", post(chat_stream))
        .route("/api/history", get(legacy_history))
        .route("/api/chat", post(legacy_chat))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    name: Option<String>,
}

fn session_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    path.map(|Path(id)| id).map_err(|e| ApiError::Unprocessable(e.body_text()))
}

fn page(query: Result<Query<PageParams>, QueryRejection>) -> Result<PageParams, ApiError> {
    query.map(|Query(p)| p).map_err(|e| ApiError::Unprocessable(e.body_text()))
}

async fn list_sessions(
    query: Result<Query<PageParams>, QueryRejection>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let params = page(query)?;
    let sessions = state
        .chat
        .list_sessions(params.limit.unwrap_or(DEFAULT_LIST_LIMIT), params.offset.unwrap_or(0))
        .await?;
    Ok(Json(sessions))
}

async fn create_session(
    Extension(state): Extension<Arc<AppState>>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Json<SessionSummary>, ApiError> {
    let name = body.and_then(|Json(req)| req.name);
    Ok(Json(state.chat.create_session(name.as_deref()).await?))
}

async fn get_session(
    path: Result<Path<Uuid>, PathRejection>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<SessionSummary>, ApiError> {
    let id = session_id(path)?;
    Ok(Json(state.chat.get_session(id).await?))
}

async fn delete_session(
    path: Result<Path<Uuid>, PathRejection>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let id = session_id(path)?;
    state.chat.delete_session(id).await?;
    Ok(Json(json!({ "success": true, "message": "会话已删除" })))
}

async fn get_history(
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<PageParams>, QueryRejection>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let id = session_id(path)?;
    let params = page(query)?;
    let messages = state
        .chat
        .history(
            id,
            params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            params.offset.unwrap_or(0),
            None,
        )
        .await?;
    Ok(Json(messages))
}

async fn chat(
    path: Result<Path<Uuid>, PathRejection>,
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<TextMessage>, JsonRejection>,
) -> Result<Json<TextMessage>, ApiError> {
    let id = session_id(path)?;
    let message = json_body(body)?;

    // cancels the model call if the client goes away
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    let reply = state
        .chat
        .chat(id, message, token)
        .await
        .map_err(ApiError::from_chat_turn)?;
    Ok(Json(reply))
}

fn stream_event(item: Result<ChatStreamEvent, ChatError>) -> Event {
    let event = match item {
        Ok(ChatStreamEvent::Chunk(text)) => Event::default().event("chunk").json_data(json!({ "content": text })),
        Ok(ChatStreamEvent::Message(message)) => Event::default().event("message").json_data(&message),
        Err(err) => {
            tracing::error!("Streamed chat turn failed: {}", err);
            Event::default().event("error").json_data(chat_error_detail(&err.to_string()))
        }
    };
    event.unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Server-sent events: `chunk` events while the reply is generated, then a
/// single `message` event with the stored reply.
async fn chat_stream(
    path: Result<Path<Uuid>, PathRejection>,
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<TextMessage>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = session_id(path)?;
    let message = json_body(body)?;

    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();

    let mut events = state
        .chat
        .chat_stream(id, message, token)
        .await
        .map_err(ApiError::from_chat_turn)?;

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(item) = events.next().await {
            yield Ok::<_, Infallible>(stream_event(item));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn legacy_history(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.chat.latest_history().await?))
}

async fn legacy_chat(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<TextMessage>, JsonRejection>,
) -> Result<Json<TextMessage>, ApiError> {
    let message = json_body(body)?;
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    let reply = state
        .chat
        .legacy_chat(message, token)
        .await
        .map_err(ApiError::from_chat_turn)?;
    Ok(Json(reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{app, send, state_with};
    use crate::llm_client::testing::ScriptedModel;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let app = app(state_with(None));

        let (status, created) = send(&app, "POST", "/api/sessions", Some(json!({"name": "季度分析"}))).await;
        assert_eq!(status, 200);
        assert_eq!(created["name"], "季度分析");
        assert_eq!(created["message_count"], 0);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, fetched) = send(&app, "GET", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, 200);
        assert_eq!(fetched["id"], id.as_str());

        let (status, list) = send(&app, "GET", "/api/sessions", None).await;
        assert_eq!(status, 200);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "DELETE", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({"success": true, "message": "会话已删除"}));

        let (status, body) = send(&app, "GET", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, 404);
        assert_eq!(body, json!({"detail": "会话不存在"}));
    }

    #[tokio::test]
    async fn test_create_session_without_body_uses_default_name() {
        let app = app(state_with(None));
        let (status, created) = send(&app, "POST", "/api/sessions", None).await;
        assert_eq!(status, 200);
        assert_eq!(created["name"], "新会话");
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_unprocessable() {
        let app = app(state_with(None));

        let (status, _) = send(&app, "GET", "/api/sessions?limit=0", None).await;
        assert_eq!(status, 422);
        let (status, _) = send(&app, "GET", "/api/sessions?limit=101", None).await;
        assert_eq!(status, 422);
        let (status, _) = send(&app, "GET", "/api/sessions?offset=abc", None).await;
        assert_eq!(status, 422);
        let (status, _) = send(&app, "GET", "/api/sessions/not-a-uuid", None).await;
        assert_eq!(status, 422);

        let uri = format!("/api/sessions/{}/chat", Uuid::new_v4());
        let (status, body) = send(&app, "POST", &uri, Some(json!({"source": "user"}))).await;
        assert_eq!(status, 422);
        assert!(body["detail"].as_str().unwrap().contains("content"));

        let (status, body) = send(&app, "POST", "/api/chat", Some(json!(["not", "an", "object"]))).await;
        assert_eq!(status, 422);
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_chat_persists_and_names_session() {
        let model = Arc::new(ScriptedModel::new(vec!["你好！有什么可以帮你？"]));
        let app = app(state_with(Some(model)));

        let (_, created) = send(&app, "POST", "/api/sessions", None).await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, reply) = send(
            &app,
            "POST",
            &format!("/api/sessions/{}/chat", id),
            Some(json!({"content": "你好", "source": "user"})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(reply["content"], "你好！有什么可以帮你？");
        assert_eq!(reply["source"], "assistant");
        assert_eq!(reply["type"], "TextMessage");

        let (_, history) = send(&app, "GET", &format!("/api/sessions/{}/history", id), None).await;
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["source"], "user");
        assert_eq!(history[1]["source"], "assistant");

        let (_, session) = send(&app, "GET", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(session["name"], "你好");
        assert_eq!(session["message_count"], 2);
    }

    #[tokio::test]
    async fn test_chat_errors() {
        let app_without_model = app(state_with(None));
        let (_, created) = send(&app_without_model, "POST", "/api/sessions", None).await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app_without_model,
            "POST",
            &format!("/api/sessions/{}/chat", id),
            Some(json!({"content": "hi"})),
        )
        .await;
        assert_eq!(status, 500);
        assert_eq!(body["detail"]["type"], "error");
        assert_eq!(body["detail"]["source"], "system");
        assert!(body["detail"]["content"].as_str().unwrap().starts_with("Error: "));

        let (status, body) = send(
            &app_without_model,
            "POST",
            &format!("/api/sessions/{}/chat", Uuid::new_v4()),
            Some(json!({"content": "hi"})),
        )
        .await;
        assert_eq!(status, 404);
        assert_eq!(body["detail"], "会话不存在");
    }

    #[tokio::test]
    async fn test_chat_stream_emits_chunks_then_message() {
        let model = Arc::new(ScriptedModel::new(vec!["流式回复"]));
        let app = app(state_with(Some(model)));
        let (_, created) = send(&app, "POST", "/api/sessions", None).await;
        let id = created["id"].as_str().unwrap().to_string();

        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/sessions/{}/chat/stream", id))
            .header("content-type", "application/json")
            .body(Body::from(json!({"content": "讲个故事"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        let chunk_at = body.find("event: chunk").unwrap();
        let message_at = body.find("event: message").unwrap();
        assert!(chunk_at < message_at);
        assert!(body.contains("流式回复"));

        let (_, history) = send(&app, "GET", &format!("/api/sessions/{}/history", id), None).await;
        assert_eq!(history.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_legacy_endpoints_use_latest_session() {
        let model = Arc::new(ScriptedModel::always("好的"));
        let app = app(state_with(Some(model)));

        let (status, history) = send(&app, "GET", "/api/history", None).await;
        assert_eq!(status, 200);
        assert_eq!(history, json!([]));

        let (status, reply) = send(&app, "POST", "/api/chat", Some(json!({"content": "第一条"}))).await;
        assert_eq!(status, 200);
        assert_eq!(reply["content"], "好的");
        send(&app, "POST", "/api/chat", Some(json!({"content": "第二条"}))).await;

        let (_, sessions) = send(&app, "GET", "/api/sessions", None).await;
        assert_eq!(sessions.as_array().unwrap().len(), 1);

        let (_, history) = send(&app, "GET", "/api/history", None).await;
        assert_eq!(history.as_array().unwrap().len(), 4);
    }
}
