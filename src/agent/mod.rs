// src/agent/mod.rs
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::llm_client::{ChatModel, ChatRequest, ChatTurn, LlmError};

pub mod assistant;

pub use assistant::{AgentEvent, AssistantAgent, ContextMessage};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Model call failed: {0}")]
    Model(#[from] LlmError),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Invalid agent state: {0}")]
    State(String),
}

/// Builds assistant agents that share one model client and system message.
#[derive(Clone)]
pub struct AgentFactory {
    model: Arc<dyn ChatModel>,
    name: String,
    system_message: Option<String>,
}

impl AgentFactory {
    pub fn new(model: Arc<dyn ChatModel>, system_message: Option<String>) -> Self {
        Self {
            model,
            name: "assistant".to_string(),
            system_message,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn model(&self) -> Arc<dyn ChatModel> {
        self.model.clone()
    }

    pub fn create(&self) -> AssistantAgent {
        AssistantAgent::new(self.name.clone(), self.model.clone(), self.system_message.clone())
    }

    /// Fresh agent with its context restored from a saved state blob.
    pub fn from_state(&self, state: &Value) -> Result<AssistantAgent, AgentError> {
        let mut agent = self.create();
        agent.load_state(state)?;
        Ok(agent)
    }
}

/// One-shot prompt with no retained context. Returns the raw reply text.
pub async fn ask(model: &dyn ChatModel, system: &str, prompt: &str) -> Result<String, AgentError> {
    let mut messages = Vec::with_capacity(2);
    if !system.is_empty() {
        messages.push(ChatTurn::system(system));
    }
    messages.push(ChatTurn::user(prompt));

    let completion = model.complete(&ChatRequest::new(messages)).await?;
    Ok(completion.content)
}
