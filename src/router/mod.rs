// src/router/mod.rs
// Keyword routing of free-text requests to domain agents
pub mod dispatch;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dispatch::{DispatchError, DispatchOutcome, Dispatcher, IntentHandler, WorkOrderAgent};

pub const DEFAULT_ROUTE: &str = "default";

#[derive(Error, Debug)]
pub enum RouterConfigError {
    #[error("Failed to read router config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid router config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Agent '{0}' has no keywords")]
    EmptyKeywords(String),

    #[error("Agent '{0}' is configured twice")]
    DuplicateAgent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRoute {
    pub code: String,
    pub keywords: Vec<String>,
}

impl AgentRoute {
    fn new(code: &str, keywords: &[&str]) -> Self {
        Self {
            code: code.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Ordered agent routes; earlier entries win when several match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    pub agents: Vec<AgentRoute>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            agents: vec![
                AgentRoute::new("GM", &["总经理", "GM", "决策", "数据分析"]),
                AgentRoute::new("AC", &["精算", "预算", "盈利", "AC"]),
                AgentRoute::new("CT", &["合同", "CT", "法律", "比对"]),
                AgentRoute::new("WO", &["工单", "报修", "投诉", "WO"]),
            ],
        }
    }
}

impl RouterConfig {
    pub fn from_toml(text: &str) -> Result<Self, RouterConfigError> {
        let config: RouterConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, RouterConfigError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<(), RouterConfigError> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.code.as_str()) {
                return Err(RouterConfigError::DuplicateAgent(agent.code.clone()));
            }
            if agent.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(RouterConfigError::EmptyKeywords(agent.code.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SemanticRouter {
    config: RouterConfig,
}

impl SemanticRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Code of the first agent with a keyword contained in `input`, or
    /// [`DEFAULT_ROUTE`].
    pub fn route(&self, input: &str) -> &str {
        self.config
            .agents
            .iter()
            .find(|agent| {
                agent
                    .keywords
                    .iter()
                    .any(|kw| !kw.is_empty() && input.contains(kw.as_str()))
            })
            .map(|agent| agent.code.as_str())
            .unwrap_or(DEFAULT_ROUTE)
    }
}

impl Default for SemanticRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes() {
        let router = SemanticRouter::default();
        assert_eq!(router.route("我家水管漏水，需要报修"), "WO");
        assert_eq!(router.route("帮我比对一下这两份合同"), "CT");
        assert_eq!(router.route("明年的预算怎么安排"), "AC");
        assert_eq!(router.route("今天天气不错"), DEFAULT_ROUTE);
    }

    #[test]
    fn test_first_configured_agent_wins() {
        let router = SemanticRouter::default();
        // matches both GM (数据分析) and AC (预算); GM comes first
        assert_eq!(router.route("做一份预算的数据分析"), "GM");
    }

    #[test]
    fn test_from_toml_keeps_order() {
        let config = RouterConfig::from_toml(
            r#"
[[agents]]
code = "WO"
keywords = ["报修"]

[[agents]]
code = "FIN"
keywords = ["报修费用", "账单"]
"#,
        )
        .unwrap();
        let router = SemanticRouter::new(config);
        assert_eq!(router.route("报修费用是多少"), "WO");
        assert_eq!(router.route("上个月的账单"), "FIN");
    }

    #[test]
    fn test_invalid_configs() {
        let duplicate = "[[agents]]\ncode = \"A\"\nkeywords = [\"x\"]\n[[agents]]\ncode = \"A\"\nkeywords = [\"y\"]\n";
        assert!(matches!(
            RouterConfig::from_toml(duplicate),
            Err(RouterConfigError::DuplicateAgent(code)) if code == "A"
        ));

        let empty = "[[agents]]\ncode = \"A\"\nkeywords = []\n";
        assert!(matches!(RouterConfig::from_toml(empty), Err(RouterConfigError::EmptyKeywords(_))));

        assert!(matches!(RouterConfig::from_toml("agents = 3"), Err(RouterConfigError::Parse(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.toml");
        tokio::fs::write(&path, "[[agents]]\ncode = \"CT\"\nkeywords = [\"合同\"]\n").await.unwrap();

        let config = RouterConfig::load(&path).await.unwrap();
        assert_eq!(config.agents, vec![AgentRoute::new("CT", &["合同"])]);
        assert!(RouterConfig::load(&dir.path().join("missing.toml")).await.is_err());
    }
}
