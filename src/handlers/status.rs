// src/handlers/status.rs
use std::sync::Arc;

use axum::{extract::Extension, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

pub fn status_routes() -> Router {
    Router::new().route("/api/status", get(api_status))
}

fn configured(flag: bool) -> &'static str {
    if flag {
        "configured"
    } else {
        "not_configured"
    }
}

async fn api_status(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let database = match &state.db_pool {
        Some(pool) => match sqlx::query("SELECT 1").fetch_one(pool).await {
            Ok(_) => "healthy",
            Err(_) => "unhealthy",
        },
        None => "in_memory",
    };

    let documents = state
        .bi
        .as_ref()
        .and_then(|bi| bi.targets())
        .is_some();

    Json(json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "database": database,
            "llm": configured(state.model_name.is_some()),
            "bi_pipeline": configured(state.bi.is_some()),
            "target_extractor": configured(documents),
        },
        "model": state.model_name,
        "router": {
            "agents": state
                .dispatcher
                .router()
                .config()
                .agents
                .iter()
                .map(|a| a.code.as_str())
                .collect::<Vec<_>>(),
        },
        "endpoints": {
            "sessions": "/api/sessions",
            "legacy_chat": "/api/chat",
            "bi": "/api/bi/query",
            "route": "/api/route",
            "dispatch": "/api/dispatch",
            "status": "/api/status",
        }
    }))
}
