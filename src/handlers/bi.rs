// src/handlers/bi.rs
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::{json_body, ApiError};
use crate::bi::documents::SyncReport;
use crate::bi::orchestrator::HistoryEntry;
use crate::bi::{BiError, BiResponse, BiSessions};
use crate::AppState;

pub fn bi_routes() -> Router {
    Router::new()
        .route("/api/bi/query", post(bi_query))
        .route("/api/bi/conversations/:conversation_id", get(conversation_history))
        .route("/api/bi/documents/refresh", post(refresh_documents))
}

#[derive(Debug, Deserialize)]
struct BiQueryRequest {
    query: String,
    conversation_id: Option<String>,
}

fn sessions(state: &AppState) -> Result<&BiSessions, ApiError> {
    state.bi.as_ref().ok_or_else(|| BiError::NotConfigured("BI pipeline (set OPENAI_API_KEY)").into())
}

async fn bi_query(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<BiQueryRequest>, JsonRejection>,
) -> Result<Json<BiResponse>, ApiError> {
    let request = json_body(body)?;
    if request.query.trim().is_empty() {
        return Err(ApiError::Unprocessable("query must not be empty".to_string()));
    }
    let conversation_id = request.conversation_id.filter(|id| !id.trim().is_empty());

    let response = sessions(&state)?.process(conversation_id, &request.query).await?;
    Ok(Json(response))
}

async fn conversation_history(
    Path(conversation_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    sessions(&state)?
        .history(&conversation_id)
        .await
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn refresh_documents(Extension(state): Extension<Arc<AppState>>) -> Result<Json<SyncReport>, ApiError> {
    let targets = sessions(&state)?
        .targets()
        .ok_or(BiError::NotConfigured("BI_DOCS_DIR"))?;
    let report = targets.refresh_documents().await?;
    tracing::info!(
        "Document refresh: {} added, {} updated, {} removed",
        report.added.len(),
        report.updated.len(),
        report.removed.len()
    );
    Ok(Json(report))
}
