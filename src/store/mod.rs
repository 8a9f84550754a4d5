// src/store/mod.rs
//! Persistence for chat sessions and their messages.
//!
//! `PgChatStore` is the production backend; `MemoryChatStore` backs local runs
//! without `DATABASE_URL` and the test suite.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ChatMessage, ChatSession, NewMessage, SessionSummary};

pub mod memory;
pub mod postgres;

pub use memory::MemoryChatStore;
pub use postgres::PgChatStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Session {0} does not exist")]
    SessionNotFound(Uuid),
}

/// Session order shared by every backend: latest `updated_at` first, ties
/// broken by descending id (`ORDER BY updated_at DESC, id DESC`).
pub fn most_recent_first(a: &ChatSession, b: &ChatSession) -> Ordering {
    b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id))
}

/// Paging and filtering for `ChatStore::get_messages`.
#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub limit: i64,
    pub offset: i64,
    pub source: Option<String>,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
            source: None,
        }
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, name: &str, agent_state: Value) -> Result<ChatSession, StoreError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>, StoreError>;

    /// First session in `most_recent_first` order, if any.
    async fn get_latest_session(&self) -> Result<Option<ChatSession>, StoreError>;

    /// Sessions in `most_recent_first` order.
    async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<SessionSummary>, StoreError>;

    /// Overwrites the agent state and bumps `updated_at`. Returns false when the session is gone.
    async fn update_agent_state(&self, id: Uuid, agent_state: Value) -> Result<bool, StoreError>;

    async fn rename_session(&self, id: Uuid, name: &str) -> Result<bool, StoreError>;

    /// Deletes the session and all of its messages.
    async fn delete_session(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Fails with `SessionNotFound` when the owning session does not exist.
    async fn append_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Messages in creation order.
    async fn get_messages(&self, session_id: Uuid, query: MessageQuery) -> Result<Vec<ChatMessage>, StoreError>;

    async fn count_messages(&self, session_id: Uuid) -> Result<i64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn session(id: u128, second: u32) -> ChatSession {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, second).unwrap();
        ChatSession {
            id: Uuid::from_u128(id),
            name: "s".to_string(),
            created_at: at,
            updated_at: at,
            agent_state: json!({}),
        }
    }

    #[test]
    fn test_most_recent_first_breaks_ties_by_id() {
        let mut sessions = vec![session(1, 5), session(3, 5), session(2, 9), session(4, 1)];
        sessions.sort_by(most_recent_first);
        let ids: Vec<u128> = sessions.iter().map(|s| s.id.as_u128()).collect();
        assert_eq!(ids, vec![2, 3, 1, 4]);
    }
}
