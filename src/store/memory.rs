// src/store/memory.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{most_recent_first, ChatStore, MessageQuery, StoreError};
use crate::models::{ChatMessage, ChatSession, NewMessage, SessionSummary};

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, ChatSession>,
    messages: Vec<ChatMessage>,
    last_stamp: Option<DateTime<Utc>>,
}

impl Inner {
    /// Strictly increasing timestamps, so later writes always sort first.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn count_for(&self, session_id: Uuid) -> i64 {
        self.messages.iter().filter(|m| m.session_id == session_id).count() as i64
    }

    fn sorted_sessions(&self) -> Vec<&ChatSession> {
        let mut sessions: Vec<&ChatSession> = self.sessions.values().collect();
        sessions.sort_by(|a, b| most_recent_first(a, b));
        sessions
    }
}

/// Process-local store with the same semantics as the Postgres backend.
#[derive(Default)]
pub struct MemoryChatStore {
    inner: RwLock<Inner>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_session(&self, name: &str, agent_state: Value) -> Result<ChatSession, StoreError> {
        let mut inner = self.inner.write().await;
        let now = inner.stamp();
        let session = ChatSession {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            agent_state,
        };
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(&id).cloned())
    }

    async fn get_latest_session(&self) -> Result<Option<ChatSession>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sorted_sessions().first().map(|session| (*session).clone()))
    }

    async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<SessionSummary>, StoreError> {
        let inner = self.inner.read().await;
        let summaries = inner
            .sorted_sessions()
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|session| SessionSummary::from_session(session, inner.count_for(session.id)))
            .collect();
        Ok(summaries)
    }

    async fn update_agent_state(&self, id: Uuid, agent_state: Value) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let now = inner.stamp();
        match inner.sessions.get_mut(&id) {
            Some(session) => {
                session.agent_state = agent_state;
                session.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn rename_session(&self, id: Uuid, name: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let now = inner.stamp();
        match inner.sessions.get_mut(&id) {
            Some(session) => {
                session.name = name.to_string();
                session.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.remove(&id).is_none() {
            return Ok(false);
        }
        inner.messages.retain(|m| m.session_id != id);
        Ok(true)
    }

    async fn append_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(&message.session_id) {
            return Err(StoreError::SessionNotFound(message.session_id));
        }
        let stored = ChatMessage {
            id: Uuid::new_v4(),
            session_id: message.session_id,
            source: message.source,
            content: message.content,
            message_type: message.message_type,
            thought: message.thought,
            created_at: inner.stamp(),
            models_usage: message.models_usage,
            metadata: message.metadata,
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn get_messages(&self, session_id: Uuid, query: MessageQuery) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.inner.read().await;
        let messages = inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .filter(|m| query.source.as_deref().map_or(true, |s| m.source == s))
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(messages)
    }

    async fn count_messages(&self, session_id: Uuid) -> Result<i64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.count_for(session_id))
    }
}
