// src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ChatStore, MessageQuery, StoreError};
use crate::models::{ChatMessage, ChatSession, NewMessage, SessionSummary};

type SessionRow = (Uuid, String, DateTime<Utc>, DateTime<Utc>, Option<Json<Value>>);

type MessageRow = (
    Uuid,
    Uuid,
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
    Option<Json<Value>>,
    Json<Value>,
);

const SESSION_COLUMNS: &str = "id, name, created_at, updated_at, agent_state";
const MESSAGE_COLUMNS: &str =
    "id, session_id, source, content, type, thought, created_at, models_usage, metadata";

fn session_from_row(row: SessionRow) -> ChatSession {
    let (id, name, created_at, updated_at, agent_state) = row;
    ChatSession {
        id,
        name,
        created_at,
        updated_at,
        agent_state: agent_state.map(|json| json.0).unwrap_or(Value::Null),
    }
}

fn message_from_row(row: MessageRow) -> ChatMessage {
    let (id, session_id, source, content, message_type, thought, created_at, models_usage, metadata) = row;
    ChatMessage {
        id,
        session_id,
        source,
        content,
        message_type,
        thought,
        created_at,
        models_usage: models_usage.map(|json| json.0),
        metadata: metadata.0,
    }
}

/// Postgres-backed store over the `chat_sessions` / `chat_messages` tables.
#[derive(Clone)]
pub struct PgChatStore {
    db_pool: PgPool,
}

impl PgChatStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db_pool
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_session(&self, name: &str, agent_state: Value) -> Result<ChatSession, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "INSERT INTO chat_sessions (id, name, created_at, updated_at, agent_state)
             VALUES ($1, $2, NOW(), NOW(), $3)
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(Json(agent_state))
        .fetch_one(&self.db_pool)
        .await?;

        tracing::debug!("Created chat session {}", row.0);
        Ok(session_from_row(row))
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM chat_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row.map(session_from_row))
    }

    async fn get_latest_session(&self) -> Result<Option<ChatSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM chat_sessions ORDER BY updated_at DESC, id DESC LIMIT 1",
            SESSION_COLUMNS
        ))
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row.map(session_from_row))
    }

    async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<SessionSummary>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, String, DateTime<Utc>, DateTime<Utc>, i64)>(
            "SELECT s.id, s.name, s.created_at, s.updated_at,
                    (SELECT COUNT(*) FROM chat_messages m WHERE m.session_id = s.id) AS message_count
             FROM chat_sessions s
             ORDER BY s.updated_at DESC, s.id DESC
             LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, created_at, updated_at, message_count)| SessionSummary {
                id,
                name,
                created_at,
                updated_at,
                message_count,
            })
            .collect())
    }

    async fn update_agent_state(&self, id: Uuid, agent_state: Value) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET agent_state = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(agent_state))
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn rename_session(&self, id: Uuid, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE chat_sessions SET name = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(name)
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&self, id: Uuid) -> Result<bool, StoreError> {
        // chat_messages rows go with it through ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        tracing::debug!(
            "Saving message to DB - session: {}, source: {}, content_len: {}",
            message.session_id,
            message.source,
            message.content.len()
        );

        let result = sqlx::query_as::<_, MessageRow>(&format!(
            "INSERT INTO chat_messages
             (id, session_id, source, content, type, thought, created_at, models_usage, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7, $8)
             RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(message.session_id)
        .bind(&message.source)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(&message.thought)
        .bind(message.models_usage.clone().map(Json))
        .bind(Json(message.metadata.clone()))
        .fetch_one(&self.db_pool)
        .await;

        match result {
            Ok(row) => Ok(message_from_row(row)),
            Err(sqlx::Error::Database(db_err)) if db_err.is_foreign_key_violation() => {
                Err(StoreError::SessionNotFound(message.session_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_messages(&self, session_id: Uuid, query: MessageQuery) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {} FROM chat_messages
             WHERE session_id = $1 AND ($2::TEXT IS NULL OR source = $2)
             ORDER BY created_at ASC, seq ASC
             LIMIT $3 OFFSET $4",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .bind(&query.source)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows.into_iter().map(message_from_row).collect())
    }

    async fn count_messages(&self, session_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM chat_messages WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(&self.db_pool)
            .await?;

        Ok(row.0)
    }
}
