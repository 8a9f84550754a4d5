// src/router/dispatch.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::SemanticRouter;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Handler for agent '{0}' is already registered")]
    DuplicateHandler(String),

    #[error("Handler '{code}' failed: {message}")]
    Handler { code: String, message: String },
}

/// A domain agent that serves the intents routed to its code.
#[async_trait]
pub trait IntentHandler: Send + Sync {
    fn code(&self) -> &str;

    async fn handle_intent(&self, intent: &str, params: &Value) -> Result<String, DispatchError>;
}

fn param<'a>(params: &'a Value, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Work orders: `WO-01` submits, `WO-02` queries progress.
pub struct WorkOrderAgent;

impl WorkOrderAgent {
    pub const SUBMIT: &'static str = "WO-01";
    pub const QUERY: &'static str = "WO-02";

    fn submit_work_order(&self, params: &Value) -> String {
        format!("已受理工单：{}", param(params, "content"))
    }

    fn query_work_order(&self, params: &Value) -> String {
        format!("工单进度：{} 正在处理中", param(params, "order_id"))
    }
}

#[async_trait]
impl IntentHandler for WorkOrderAgent {
    fn code(&self) -> &str {
        "WO"
    }

    async fn handle_intent(&self, intent: &str, params: &Value) -> Result<String, DispatchError> {
        Ok(match intent {
            Self::SUBMIT => self.submit_work_order(params),
            Self::QUERY => self.query_work_order(params),
            _ => "未知工单意图".to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatchOutcome {
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// `None` when no handler is registered for the routed agent.
    pub reply: Option<String>,
}

/// Routes the input, then hands the intent to the agent's registered handler.
pub struct Dispatcher {
    router: SemanticRouter,
    handlers: HashMap<String, Arc<dyn IntentHandler>>,
}

impl Dispatcher {
    pub fn new(router: SemanticRouter) -> Self {
        Self {
            router,
            handlers: HashMap::new(),
        }
    }

    /// Router plus every built-in handler.
    pub fn with_builtin_handlers(router: SemanticRouter) -> Self {
        let mut dispatcher = Self::new(router);
        dispatcher.handlers.insert("WO".to_string(), Arc::new(WorkOrderAgent));
        dispatcher
    }

    pub fn register(&mut self, handler: Arc<dyn IntentHandler>) -> Result<(), DispatchError> {
        let code = handler.code().to_string();
        if self.handlers.contains_key(&code) {
            return Err(DispatchError::DuplicateHandler(code));
        }
        tracing::debug!("Registered intent handler {}", code);
        self.handlers.insert(code, handler);
        Ok(())
    }

    pub fn router(&self) -> &SemanticRouter {
        &self.router
    }

    pub async fn dispatch(&self, input: &str, intent: Option<&str>, params: &Value) -> Result<DispatchOutcome, DispatchError> {
        let agent = self.router.route(input).to_string();

        let Some(handler) = self.handlers.get(&agent) else {
            tracing::info!("No handler registered for routed agent {}", agent);
            return Ok(DispatchOutcome {
                agent,
                intent: intent.map(str::to_string),
                reply: None,
            });
        };

        let reply = handler.handle_intent(intent.unwrap_or(""), params).await?;
        tracing::info!("Dispatched to {} (intent {:?})", agent, intent);

        Ok(DispatchOutcome {
            agent,
            intent: intent.map(str::to_string),
            reply: Some(reply),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_work_order_intents() {
        let agent = WorkOrderAgent;
        assert_eq!(
            agent.handle_intent("WO-01", &json!({"content": "水管漏水"})).await.unwrap(),
            "已受理工单：水管漏水"
        );
        assert_eq!(
            agent.handle_intent("WO-02", &json!({"order_id": "12345"})).await.unwrap(),
            "工单进度：12345 正在处理中"
        );
        assert_eq!(agent.handle_intent("WO-99", &json!({})).await.unwrap(), "未知工单意图");
        assert_eq!(agent.handle_intent("WO-01", &json!({})).await.unwrap(), "已受理工单：");
    }

    struct EchoAgent;

    #[async_trait]
    impl IntentHandler for EchoAgent {
        fn code(&self) -> &str {
            "CT"
        }

        async fn handle_intent(&self, intent: &str, _params: &Value) -> Result<String, DispatchError> {
            Ok(format!("CT handled {}", intent))
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_registered_handler() {
        let mut dispatcher = Dispatcher::with_builtin_handlers(SemanticRouter::default());
        dispatcher.register(Arc::new(EchoAgent)).unwrap();

        let outcome = dispatcher
            .dispatch("报修：水管漏水", Some("WO-01"), &json!({"content": "水管漏水"}))
            .await
            .unwrap();
        assert_eq!(outcome.agent, "WO");
        assert_eq!(outcome.reply.as_deref(), Some("已受理工单：水管漏水"));

        let outcome = dispatcher.dispatch("合同比对", Some("CT-01"), &json!({})).await.unwrap();
        assert_eq!(outcome.reply.as_deref(), Some("CT handled CT-01"));
    }

    #[tokio::test]
    async fn test_dispatch_without_handler() {
        let dispatcher = Dispatcher::with_builtin_handlers(SemanticRouter::default());
        let outcome = dispatcher.dispatch("今天天气不错", None, &json!({})).await.unwrap();
        assert_eq!(outcome.agent, "default");
        assert!(outcome.reply.is_none());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut dispatcher = Dispatcher::with_builtin_handlers(SemanticRouter::default());
        assert!(matches!(
            dispatcher.register(Arc::new(WorkOrderAgent)),
            Err(DispatchError::DuplicateHandler(code)) if code == "WO"
        ));
    }
}
