// src/agent/assistant.rs
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::AgentError;
use crate::llm_client::{ChatModel, ChatRequest, ChatTurn, StreamChunk};
use crate::models::{RequestUsage, TextMessage};

pub const AGENT_STATE_TYPE: &str = "AssistantAgentState";
pub const AGENT_STATE_VERSION: &str = "1.0.0";

/// Entry of the model context, serialized the same way inside saved state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContextMessage {
    SystemMessage {
        content: String,
    },
    UserMessage {
        content: String,
        source: String,
    },
    AssistantMessage {
        content: String,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
}

impl ContextMessage {
    fn to_turn(&self) -> ChatTurn {
        match self {
            ContextMessage::SystemMessage { content } => ChatTurn::system(content.clone()),
            ContextMessage::UserMessage { content, .. } => ChatTurn::user(content.clone()),
            ContextMessage::AssistantMessage { content, .. } => ChatTurn::assistant(content.clone()),
        }
    }
}

/// Output of `AssistantAgent::on_messages_stream`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Chunk(String),
    Completed { message: TextMessage, state: Value },
}

pub struct AssistantAgent {
    name: String,
    model: Arc<dyn ChatModel>,
    system_message: Option<String>,
    llm_context: Vec<ContextMessage>,
}

impl AssistantAgent {
    pub fn new(name: String, model: Arc<dyn ChatModel>, system_message: Option<String>) -> Self {
        Self {
            name,
            model,
            system_message,
            llm_context: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &[ContextMessage] {
        &self.llm_context
    }

    fn push_inbound(&mut self, messages: &[TextMessage]) {
        for message in messages {
            self.llm_context.push(ContextMessage::UserMessage {
                content: message.content.clone(),
                source: message.source.clone(),
            });
        }
    }

    fn build_request(&self) -> ChatRequest {
        let mut turns = Vec::with_capacity(self.llm_context.len() + 1);
        if let Some(system) = &self.system_message {
            turns.push(ChatTurn::system(system.clone()));
        }
        turns.extend(self.llm_context.iter().map(ContextMessage::to_turn));
        ChatRequest::new(turns)
    }

    fn record_reply(&mut self, content: String, thought: Option<String>, usage: Option<RequestUsage>) -> TextMessage {
        self.llm_context.push(ContextMessage::AssistantMessage {
            content: content.clone(),
            source: self.name.clone(),
            thought: thought.clone(),
        });

        let mut reply = TextMessage::new(self.name.clone(), content);
        reply.models_usage = usage;
        reply.thought = thought;
        reply
    }

    /// Adds the inbound messages to the context and returns the model's reply.
    pub async fn on_messages(
        &mut self,
        messages: &[TextMessage],
        cancellation: &CancellationToken,
    ) -> Result<TextMessage, AgentError> {
        self.push_inbound(messages);
        let request = self.build_request();

        let completion = tokio::select! {
            _ = cancellation.cancelled() => return Err(AgentError::Cancelled),
            result = self.model.complete(&request) => result?,
        };

        tracing::debug!(
            "Agent {} replied with {} chars (model {})",
            self.name,
            completion.content.len(),
            self.model.model_name()
        );

        Ok(self.record_reply(completion.content, completion.thought, completion.usage))
    }

    /// Streaming variant of `on_messages`. Consumes the agent; the final
    /// `Completed` event carries the reply and the updated saved state.
    pub fn on_messages_stream(
        mut self,
        messages: Vec<TextMessage>,
        cancellation: CancellationToken,
    ) -> BoxStream<'static, Result<AgentEvent, AgentError>> {
        self.push_inbound(&messages);

        let stream = async_stream::try_stream! {
            let request = self.build_request();
            let model = self.model.clone();

            let mut chunks = tokio::select! {
                _ = cancellation.cancelled() => Err(AgentError::Cancelled),
                result = model.complete_stream(&request) => result.map_err(AgentError::from),
            }?;

            let mut content = String::new();
            let mut thought = String::new();
            let mut usage = None;

            loop {
                let next = tokio::select! {
                    _ = cancellation.cancelled() => Err(AgentError::Cancelled),
                    chunk = chunks.next() => Ok(chunk),
                }?;
                let Some(chunk) = next else { break };

                match chunk.map_err(AgentError::from)? {
                    StreamChunk::Delta(text) => {
                        content.push_str(&text);
                        yield AgentEvent::Chunk(text);
                    }
                    StreamChunk::Thought(text) => thought.push_str(&text),
                    StreamChunk::Usage(reported) => usage = Some(reported),
                }
            }

            let thought = if thought.is_empty() { None } else { Some(thought) };
            let message = self.record_reply(content, thought, usage);
            let state = self.save_state();
            yield AgentEvent::Completed { message, state };
        };

        stream.boxed()
    }

    pub fn save_state(&self) -> Value {
        json!({
            "type": AGENT_STATE_TYPE,
            "version": AGENT_STATE_VERSION,
            "llm_context": { "messages": self.llm_context },
        })
    }

    /// Replaces the context with the one in `state`. A state without
    /// `llm_context` yields an empty context.
    pub fn load_state(&mut self, state: &Value) -> Result<(), AgentError> {
        let messages = match state.get("llm_context").and_then(|ctx| ctx.get("messages")) {
            None | Some(Value::Null) => Vec::new(),
            Some(messages) => serde_json::from_value::<Vec<ContextMessage>>(messages.clone())
                .map_err(|e| AgentError::State(e.to_string()))?,
        };
        self.llm_context = messages;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::testing::ScriptedModel;
    use crate::llm_client::{Completion, LlmError};

    fn agent(model: ScriptedModel) -> AssistantAgent {
        AssistantAgent::new(
            "assistant".to_string(),
            Arc::new(model),
            Some("You are a helpful assistant.".to_string()),
        )
    }

    #[tokio::test]
    async fn test_on_messages_accumulates_context() {
        let mut agent = agent(ScriptedModel::new(vec!["first", "second"]));
        let token = CancellationToken::new();

        let reply = agent.on_messages(&[TextMessage::new("user", "hello")], &token).await.unwrap();
        assert_eq!(reply.source, "assistant");
        assert_eq!(reply.content, "first");
        assert_eq!(reply.models_usage.unwrap().prompt_tokens, 10);

        agent.on_messages(&[TextMessage::new("user", "again")], &token).await.unwrap();
        assert_eq!(agent.context().len(), 4);
        assert_eq!(
            agent.context()[3],
            ContextMessage::AssistantMessage {
                content: "second".to_string(),
                source: "assistant".to_string(),
                thought: None
            }
        );
    }

    #[tokio::test]
    async fn test_request_includes_system_message_and_history() {
        let model = Arc::new(ScriptedModel::new(vec!["a", "b"]));
        let mut agent = AssistantAgent::new("assistant".into(), model.clone(), Some("sys".into()));
        let token = CancellationToken::new();
        agent.on_messages(&[TextMessage::new("user", "one")], &token).await.unwrap();
        agent.on_messages(&[TextMessage::new("user", "two")], &token).await.unwrap();

        let last = model.requests().pop().unwrap();
        let roles: Vec<&str> = last.messages.iter().map(|t| t.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_call() {
        let mut agent = agent(ScriptedModel::always("never"));
        let token = CancellationToken::new();
        token.cancel();
        let err = agent.on_messages(&[TextMessage::new("user", "hi")], &token).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_model_error_propagates() {
        let mut agent = agent(ScriptedModel::with_results(vec![Err(LlmError::Api {
            status: 401,
            body: "bad key".into(),
        })]));
        let err = agent
            .on_messages(&[TextMessage::new("user", "hi")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Model(LlmError::Api { status: 401, .. })));
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let mut agent = agent(ScriptedModel::with_results(vec![Ok(Completion {
            content: "answer".into(),
            thought: Some("thinking".into()),
            usage: None,
        })]));
        let reply = agent
            .on_messages(&[TextMessage::new("user", "q")], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.thought.as_deref(), Some("thinking"));

        let state = agent.save_state();
        assert_eq!(state["type"], "AssistantAgentState");
        assert_eq!(state["version"], "1.0.0");
        assert_eq!(state["llm_context"]["messages"][0]["type"], "UserMessage");
        assert_eq!(state["llm_context"]["messages"][1]["thought"], "thinking");

        let mut restored = AssistantAgent::new("assistant".into(), Arc::new(ScriptedModel::always("x")), None);
        restored.load_state(&state).unwrap();
        assert_eq!(restored.context(), agent.context());
    }

    #[tokio::test]
    async fn test_load_state_edge_cases() {
        let mut agent = agent(ScriptedModel::always("x"));
        agent.load_state(&json!({"type": "AssistantAgentState"})).unwrap();
        assert!(agent.context().is_empty());

        let err = agent
            .load_state(&json!({"llm_context": {"messages": [{"type": "Bogus"}]}}))
            .unwrap_err();
        assert!(matches!(err, AgentError::State(_)));
    }

    #[tokio::test]
    async fn test_stream_yields_chunks_then_completion() {
        let agent = agent(ScriptedModel::new(vec!["streamed reply"]));
        let events: Vec<AgentEvent> = agent
            .on_messages_stream(vec![TextMessage::new("user", "hi")], CancellationToken::new())
            .map(|event| event.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AgentEvent::Chunk(text) if text == "streamed reply"));
        match &events[1] {
            AgentEvent::Completed { message, state } => {
                assert_eq!(message.content, "streamed reply");
                assert_eq!(state["llm_context"]["messages"].as_array().unwrap().len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
