// lib.rs - Chat sessions, BI query orchestration and agent routing
pub mod agent;
pub mod bi;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod flow;
pub mod handlers;
pub mod llm_client;
pub mod middleware;
pub mod models;
pub mod router;
pub mod services;
pub mod store;

use bi::BiSessions;
use router::Dispatcher;
use services::ChatService;

/// Shared by every handler through `Extension<Arc<AppState>>`.
pub struct AppState {
    pub chat: ChatService,
    /// Present when a chat model is configured.
    pub bi: Option<BiSessions>,
    pub dispatcher: Dispatcher,
    /// `None` when running on the in-memory store.
    pub db_pool: Option<sqlx::PgPool>,
    pub model_name: Option<String>,
}
