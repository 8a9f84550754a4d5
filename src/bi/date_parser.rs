// src/bi/date_parser.rs
use std::sync::Arc;

use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use regex::Regex;

use super::BiError;
use crate::agent::ask;
use crate::llm_client::ChatModel;

const DATE_SYSTEM_MESSAGE: &str = r#"你是一个高级语义分析和日期格式化专家，负责识别文本中的日期信息。

你的技能包括识别和计算相对时间表达，并将其转换为 `yyyy` 或 `yyyy-MM` 格式（年或年-月）。

你的目标是准确提取并格式化日期，只返回英文逗号`,`分隔的日期字符串。

示例:
- 文本："华东物业的2024年和2023年物业费收缴率分别是多少，展示为柱状图" -> 2023,2024
- 文本："我们需要上半年的财务报告。" -> 2025-01,2025-02,2025-03,2025-04,2025-05,2025-06
- 文本："会议定于本月20日。" -> 2025-04
- 文本："季度报告应该涵盖上个季度的数据。" -> 2024-10,2024-11,2024-12
- 文本："进五年" -> 2021,2022,2023,2024,2025

只返回日期字符串，不要包含任何其他解释或文本。
"#;

lazy_static! {
    static ref DATE_TOKEN: Regex = Regex::new(r"^\d{4}(-(0[1-9]|1[0-2]))?$").unwrap();
}

/// Splits a parser reply into its `yyyy` / `yyyy-MM` tokens, dropping anything else.
pub fn split_dates(reply: &str) -> Vec<String> {
    reply
        .split([',', '，'])
        .map(str::trim)
        .filter(|token| DATE_TOKEN.is_match(token))
        .map(str::to_string)
        .collect()
}

/// Resolves relative date expressions ("上个季度", "近五年") against the
/// current time.
pub struct DateParser {
    model: Arc<dyn ChatModel>,
}

impl DateParser {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Comma separated `yyyy` / `yyyy-MM` dates; the current year when the
    /// model finds nothing.
    pub async fn parse_date(&self, text: &str, now: Option<DateTime<Local>>) -> Result<String, BiError> {
        let now = now.unwrap_or_else(Local::now);
        let prompt = format!(
            "请从以下文本中提取日期信息并格式化：\n\n文本：\"{}\"\n\n当前系统时间：{}\n\n请只返回英文逗号`,`分隔的日期字符串，不要包含任何其他解释或文本。\n",
            text,
            now.format("%Y-%m-%d %H:%M:%S")
        );

        let reply = ask(self.model.as_ref(), DATE_SYSTEM_MESSAGE, &prompt).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Ok(now.format("%Y").to_string());
        }
        Ok(reply.to_string())
    }
}
