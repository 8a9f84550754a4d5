// src/bi/project_extractor.rs
use std::sync::Arc;

use super::BiError;
use crate::agent::ask;
use crate::llm_client::ChatModel;

const PROJECT_SYSTEM_MESSAGE: &str = r#"你是一个专业的项目名称提取专家，负责从文本中识别和提取项目名称。

你的任务是从用户输入的文本中提取出所有项目名称，并遵循以下规则：
1. 提取的项目名称不应包含"项目"字样
2. 遵循最小描述原则，提取最精简的项目名称
3. 能够识别常见的项目命名模式，如：
   - 地域前缀：华东、华南、华西、华北、华中
   - 方位词：东部、南区、西部、北区、中部
   - 城市简称：京、津、沪、渝、蓉、穗、汉等
   - 物业关键词：物业、小区、园区、广场、大厦、中心、花园、公寓等

只返回英文逗号分隔的项目名称列表，不要包含任何其他解释或文本。
如果没有找到项目名称，请返回空字符串。

示例：
- 输入："华东物业的2024年收缴率是多少" -> 华东
- 输入："华中物业和西南物业的去年的旧欠实收是多少" -> 华中,西南
- 输入："成都高新园区和天府新区的收入情况" -> 成都高新,天府新区
"#;

pub struct ProjectExtractor {
    model: Arc<dyn ChatModel>,
}

impl ProjectExtractor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Comma separated project names, or an empty string when there are none.
    pub async fn extract_projects(&self, text: &str) -> Result<String, BiError> {
        let prompt = format!(
            "请从以下文本中提取项目名称：\n\n文本：\"{}\"\n\n请只返回英文逗号分隔的项目名称列表，不要包含任何其他解释或文本。\n如果没有找到项目名称，请返回空字符串。\n",
            text
        );
        let reply = ask(self.model.as_ref(), PROJECT_SYSTEM_MESSAGE, &prompt).await?;
        Ok(reply.trim().to_string())
    }
}
