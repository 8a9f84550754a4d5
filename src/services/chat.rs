// src/services/chat.rs
//! Session and message services plus the chat turn itself: persist the user
//! message, run the agent from its stored state, persist state and reply.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::assistant::{AGENT_STATE_TYPE, AGENT_STATE_VERSION};
use crate::agent::{AgentError, AgentEvent, AgentFactory};
use crate::models::{
    session_name_from_content, ChatMessage, ChatSession, NewMessage, SessionSummary, TextMessage, DEFAULT_SESSION_NAME,
};
use crate::store::{ChatStore, MessageQuery, StoreError};

pub const DEFAULT_LIST_LIMIT: i64 = 10;
pub const MAX_LIST_LIMIT: i64 = 100;
pub const DEFAULT_HISTORY_LIMIT: i64 = 100;
pub const MAX_HISTORY_LIMIT: i64 = 1000;
/// Width of the `chat_sessions.name` column.
pub const MAX_SESSION_NAME_CHARS: usize = 100;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Session {0} not found")]
    SessionNotFound(Uuid),
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
    #[error("No chat model configured (set OPENAI_API_KEY)")]
    ModelNotConfigured,
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(id) => ChatError::SessionNotFound(id),
            other => ChatError::Store(other),
        }
    }
}

/// Events of a streamed chat turn.
#[derive(Debug, Clone)]
pub enum ChatStreamEvent {
    Chunk(String),
    Message(TextMessage),
}

/// Fills in `type`, `version` and `llm_context` on a freshly saved agent
/// state. Keys present in `new` win, then keys of the previous state, then
/// the defaults.
pub fn normalize_agent_state(previous: Option<&Value>, new: Value) -> Value {
    let mut state = match new {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let previous = previous.and_then(Value::as_object);

    for (key, default) in [("type", json!(AGENT_STATE_TYPE)), ("version", json!(AGENT_STATE_VERSION))] {
        if !state.contains_key(key) {
            let value = previous.and_then(|p| p.get(key)).cloned().unwrap_or(default);
            state.insert(key.to_string(), value);
        }
    }
    if !state.contains_key("llm_context") {
        state.insert("llm_context".to_string(), json!({ "messages": [] }));
    }
    Value::Object(state)
}

pub fn default_agent_state() -> Value {
    normalize_agent_state(None, json!({}))
}

fn check_range(name: &str, value: i64, min: i64, max: Option<i64>) -> Result<(), ChatError> {
    let too_big = max.map_or(false, |max| value > max);
    if value < min || too_big {
        let bound = match max {
            Some(max) => format!("between {} and {}", min, max),
            None => format!("at least {}", min),
        };
        return Err(ChatError::InvalidParam(format!("{} must be {}, got {}", name, bound, value)));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    agents: Option<AgentFactory>,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, agents: Option<AgentFactory>) -> Self {
        Self { store, agents }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    fn agents(&self) -> Result<&AgentFactory, ChatError> {
        self.agents.as_ref().ok_or(ChatError::ModelNotConfigured)
    }

    async fn summary(&self, session: &ChatSession) -> Result<SessionSummary, ChatError> {
        let count = self.store.count_messages(session.id).await?;
        Ok(SessionSummary::from_session(session, count))
    }

    pub async fn create_session(&self, name: Option<&str>) -> Result<SessionSummary, ChatError> {
        let name: String = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_SESSION_NAME)
            .chars()
            .take(MAX_SESSION_NAME_CHARS)
            .collect();
        let session = self.store.create_session(&name, default_agent_state()).await?;
        tracing::info!("Created chat session {} ({})", session.id, session.name);
        Ok(SessionSummary::from_session(&session, 0))
    }

    pub async fn get_session(&self, id: Uuid) -> Result<SessionSummary, ChatError> {
        let session = self.store.get_session(id).await?.ok_or(ChatError::SessionNotFound(id))?;
        self.summary(&session).await
    }

    pub async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<SessionSummary>, ChatError> {
        check_range("limit", limit, 1, Some(MAX_LIST_LIMIT))?;
        check_range("offset", offset, 0, None)?;
        Ok(self.store.list_sessions(limit, offset).await?)
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<(), ChatError> {
        if !self.store.delete_session(id).await? {
            return Err(ChatError::SessionNotFound(id));
        }
        tracing::info!("Deleted chat session {}", id);
        Ok(())
    }

    pub async fn history(
        &self,
        id: Uuid,
        limit: i64,
        offset: i64,
        source: Option<String>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        check_range("limit", limit, 1, Some(MAX_HISTORY_LIMIT))?;
        check_range("offset", offset, 0, None)?;
        if self.store.get_session(id).await?.is_none() {
            return Err(ChatError::SessionNotFound(id));
        }
        Ok(self.store.get_messages(id, MessageQuery { limit, offset, source }).await?)
    }

    /// Appends a message; the session's first user message also names it.
    async fn record_message(&self, session_id: Uuid, message: &TextMessage) -> Result<ChatMessage, ChatError> {
        let stored = self
            .store
            .append_message(NewMessage::from_text_message(session_id, message))
            .await?;

        if stored.source == "user" && self.store.count_messages(session_id).await? == 1 {
            let name = session_name_from_content(&stored.content);
            self.store.rename_session(session_id, &name).await?;
            tracing::debug!("Session {} named {:?}", session_id, name);
        }
        Ok(stored)
    }

    pub async fn chat(
        &self,
        session_id: Uuid,
        message: TextMessage,
        cancellation: CancellationToken,
    ) -> Result<TextMessage, ChatError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(ChatError::SessionNotFound(session_id))?;
        let agents = self.agents()?;

        self.record_message(session_id, &message).await?;

        let mut agent = agents.from_state(&session.agent_state)?;
        let reply = agent.on_messages(&[message], &cancellation).await?;

        let state = normalize_agent_state(Some(&session.agent_state), agent.save_state());
        self.store.update_agent_state(session_id, state).await?;
        self.record_message(session_id, &reply).await?;

        Ok(reply)
    }

    /// Like `chat`, but yields the reply text as it is generated. The final
    /// event is the complete reply, emitted after state and reply are stored.
    pub async fn chat_stream(
        &self,
        session_id: Uuid,
        message: TextMessage,
        cancellation: CancellationToken,
    ) -> Result<BoxStream<'static, Result<ChatStreamEvent, ChatError>>, ChatError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(ChatError::SessionNotFound(session_id))?;
        let agents = self.agents()?;

        self.record_message(session_id, &message).await?;

        let agent = agents.from_state(&session.agent_state)?;
        let mut events = agent.on_messages_stream(vec![message], cancellation);
        let service = self.clone();
        let previous = session.agent_state;

        let stream = async_stream::try_stream! {
            while let Some(event) = events.next().await {
                match event? {
                    AgentEvent::Chunk(text) => yield ChatStreamEvent::Chunk(text),
                    AgentEvent::Completed { message, state } => {
                        let state = normalize_agent_state(Some(&previous), state);
                        service.store.update_agent_state(session_id, state).await?;
                        service.record_message(session_id, &message).await?;
                        yield ChatStreamEvent::Message(message);
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    /// Messages of the most recently updated session, or none.
    pub async fn latest_history(&self) -> Result<Vec<ChatMessage>, ChatError> {
        match self.store.get_latest_session().await? {
            Some(session) => Ok(self.store.get_messages(session.id, MessageQuery::default()).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Chat against the most recently updated session, creating one first
    /// when the store is empty.
    pub async fn legacy_chat(
        &self,
        message: TextMessage,
        cancellation: CancellationToken,
    ) -> Result<TextMessage, ChatError> {
        self.agents()?;
        let session_id = match self.store.get_latest_session().await? {
            Some(session) => session.id,
            None => self.create_session(None).await?.id,
        };
        self.chat(session_id, message, cancellation).await
    }
}
