// src/bi/collector.rs
use std::sync::Arc;

use serde_json::Value;

use super::BiError;
use crate::agent::ask;
use crate::llm_client::ChatModel;

const COLLECTOR_SYSTEM_MESSAGE: &str = r#"你是一个专业的信息收集智能体，负责收集 BI 查询所需的完整信息。

当用户查询缺少必要信息时，你需要向用户提问，收集缺失的信息：
1. 如果缺少项目名称，询问用户想查询哪个项目的数据
2. 如果缺少时间字符串，询问用户想查询哪个时间段的数据
3. 如果缺少指标名称，询问用户想查询什么指标

你的提问应该简洁明了，对于缺失的信息可以询问多个。
"#;

/// Turns missing slots into a follow-up question for the user.
pub struct InfoCollector {
    model: Arc<dyn ChatModel>,
}

impl InfoCollector {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    pub async fn ask_missing(&self, query: &str, missing: &[String], collected: &Value) -> Result<String, BiError> {
        let prompt = format!(
            "用户查询：{}\n\n缺失信息：{}\n\n已收集的信息：{}\n\n请生成一个简洁明了的问题，向用户收集缺失信息。一次只询问一个信息。\n",
            query,
            missing.join(", "),
            collected
        );
        let reply = ask(self.model.as_ref(), COLLECTOR_SYSTEM_MESSAGE, &prompt).await?;
        Ok(reply.trim().to_string())
    }
}
