// src/bi/intent.rs
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BiError;
use crate::agent::ask;
use crate::llm_client::ChatModel;

pub const BI_QUERY_INTENT: &str = "bi_query";

const INTENT_SYSTEM_MESSAGE: &str = r#"你是一个专业的意图识别智能体，负责分析用户查询的意图。

你需要判断用户查询是否属于 BI 查询，并识别查询中的关键信息：
1. 项目名称
2. 时间字符串
3. 指标名称

如果信息不完整，你需要指出缺失的信息。

输出格式：
```json
{
    "intent": "bi_query" 或 "other",
    "complete": true 或 false,
    "missing_info": ["项目", "时间", "指标"] 中的一个或多个,
    "precinctName": "项目名称1,项目名称2,...",
    "current_date": "时间字符串",
    "targetName": "指标名称"
}
```
"#;

lazy_static! {
    static ref JSON_BLOCK: Regex = Regex::new(r"(?s)```json\n(.*?)\n```").unwrap();
}

/// Classification of one user query plus the slots found in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentResult {
    pub intent: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub missing_info: Vec<String>,
    #[serde(rename = "precinctName", default)]
    pub precinct_name: Option<String>,
    #[serde(default)]
    pub current_date: Option<String>,
    #[serde(rename = "targetName", default)]
    pub target_name: Option<String>,
}

impl IntentResult {
    /// Used when the model reply cannot be parsed: assume a BI query with
    /// every slot missing, so the collector asks for all of them.
    pub fn fallback() -> Self {
        Self {
            intent: BI_QUERY_INTENT.to_string(),
            complete: false,
            missing_info: vec!["项目".to_string(), "时间".to_string(), "指标".to_string()],
            precinct_name: None,
            current_date: None,
            target_name: None,
        }
    }

    pub fn is_bi_query(&self) -> bool {
        self.intent == BI_QUERY_INTENT
    }
}

/// Reads the first fenced ```json block of `reply`, or the whole reply.
pub fn parse_intent_reply(reply: &str) -> Option<IntentResult> {
    let json = match JSON_BLOCK.captures(reply).and_then(|c| c.get(1)) {
        Some(block) => block.as_str(),
        None => reply.trim(),
    };
    serde_json::from_str(json).ok()
}

pub struct IntentClassifier {
    model: Arc<dyn ChatModel>,
}

impl IntentClassifier {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    pub async fn analyze(&self, query: &str, context: &Value) -> Result<IntentResult, BiError> {
        let prompt = format!(
            "请分析以下用户查询的意图：\n\n查询：{}\n\n上下文：{}\n\n请判断这是否是一个 BI 查询，并提取关键信息。\n",
            query, context
        );

        let reply = ask(self.model.as_ref(), INTENT_SYSTEM_MESSAGE, &prompt).await?;
        Ok(parse_intent_reply(&reply).unwrap_or_else(|| {
            tracing::warn!("Unparseable intent reply, assuming incomplete BI query: {}", reply);
            IntentResult::fallback()
        }))
    }
}
