// src/handlers/router.rs
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{json_body, ApiError};
use crate::router::DispatchOutcome;
use crate::AppState;

pub fn router_routes() -> Router {
    Router::new()
        .route("/api/route", post(route_input))
        .route("/api/dispatch", post(dispatch))
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    input: String,
}

#[derive(Debug, Deserialize)]
struct DispatchRequest {
    input: String,
    intent: Option<String>,
    #[serde(default)]
    params: Value,
}

async fn route_input(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<RouteRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = json_body(body)?;
    let agent = state.dispatcher.router().route(&request.input);
    tracing::debug!("Routed {:?} to {}", request.input, agent);
    Ok(Json(json!({ "agent": agent })))
}

async fn dispatch(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<Json<DispatchOutcome>, ApiError> {
    let request = json_body(body)?;
    let outcome = state
        .dispatcher
        .dispatch(&request.input, request.intent.as_deref(), &request.params)
        .await?;
    Ok(Json(outcome))
}
