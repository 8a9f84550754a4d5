// src/models/chat.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const DEFAULT_SESSION_NAME: &str = "新会话";
pub const TEXT_MESSAGE_TYPE: &str = "TextMessage";

/// A persisted conversation thread together with the agent's serialized state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agent_state: Value,
}

/// Wire form of a session as returned by the session endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

impl SessionSummary {
    pub fn from_session(session: &ChatSession, message_count: i64) -> Self {
        Self {
            id: session.id,
            name: session.name.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            message_count,
        }
    }
}

/// Token accounting reported by the model for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A stored message. Append-only: rows are never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub source: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thought: Option<String>,
    pub created_at: DateTime<Utc>,
    pub models_usage: Option<Value>,
    pub metadata: Value,
}

/// Insert payload for `ChatStore::append_message`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: Uuid,
    pub source: String,
    pub content: String,
    pub message_type: String,
    pub thought: Option<String>,
    pub models_usage: Option<Value>,
    pub metadata: Value,
}

impl NewMessage {
    pub fn from_text_message(session_id: Uuid, message: &TextMessage) -> Self {
        Self {
            session_id,
            source: message.source.clone(),
            content: message.content.clone(),
            message_type: message.message_type.clone(),
            thought: message.thought.clone(),
            models_usage: message
                .models_usage
                .and_then(|usage| serde_json::to_value(usage).ok()),
            metadata: Value::Object(message.metadata.clone()),
        }
    }
}

/// Chat turn payload exchanged with clients and with the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextMessage {
    #[serde(default = "default_source")]
    pub source: String,
    pub content: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub models_usage: Option<RequestUsage>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thought: Option<String>,
}

impl TextMessage {
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            message_type: default_message_type(),
            models_usage: None,
            metadata: Map::new(),
            thought: None,
        }
    }
}

fn default_source() -> String {
    "user".to_string()
}

fn default_message_type() -> String {
    TEXT_MESSAGE_TYPE.to_string()
}

/// Session name derived from the first user message: at most 20 characters,
/// with `...` appended when the content was cut.
pub fn session_name_from_content(content: &str) -> String {
    if content.chars().count() > 20 {
        let head: String = content.chars().take(20).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_defaults() {
        let message: TextMessage = serde_json::from_str(r#"{"content": "你好"}"#).unwrap();
        assert_eq!(message.source, "user");
        assert_eq!(message.message_type, "TextMessage");
        assert!(message.metadata.is_empty());
        assert!(message.models_usage.is_none());
    }

    #[test]
    fn test_thought_omitted_when_absent() {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            source: "assistant".to_string(),
            content: "hi".to_string(),
            message_type: TEXT_MESSAGE_TYPE.to_string(),
            thought: None,
            created_at: Utc::now(),
            models_usage: None,
            metadata: Value::Object(Map::new()),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("thought").is_none());
        assert_eq!(json["type"], "TextMessage");
    }

    #[test]
    fn test_session_name_truncation() {
        assert_eq!(session_name_from_content("短消息"), "短消息");
        let long = "一二三四五六七八九十一二三四五六七八九十多出来";
        assert_eq!(session_name_from_content(long), "一二三四五六七八九十一二三四五六七八九十...");
        let exact: String = "a".repeat(20);
        assert_eq!(session_name_from_content(&exact), exact);
    }
}
