// src/bi/orchestrator.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::collector::InfoCollector;
use super::date_parser::{split_dates, DateParser};
use super::intent::{IntentClassifier, IntentResult};
use super::project_extractor::ProjectExtractor;
use super::target_extractor::TargetExtractor;
use super::BiError;
use crate::llm_client::ChatModel;

pub const NOT_BI_REPLY: &str = "抱歉，我只能回答 BI 相关的问题。";
pub const DEFAULT_FOLLOW_UP: &str = "请提供更多信息以完成查询。";
pub const DEFAULT_MAX_CONVERSATIONS: usize = 1000;
pub const DEFAULT_CONVERSATION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Query parameters handed to the downstream BI API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryParams {
    #[serde(rename = "precinctName")]
    pub precinct_name: Option<String>,
    pub current_date: Option<String>,
    #[serde(rename = "targetName")]
    pub target_name: String,
}

impl From<&IntentResult> for QueryParams {
    fn from(intent: &IntentResult) -> Self {
        Self {
            precinct_name: intent.precinct_name.clone(),
            current_date: intent.current_date.clone(),
            target_name: intent.target_name.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BiResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub conversation_id: String,
    pub is_bi_query: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_info: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collected_info: Option<QueryParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_params: Option<QueryParams>,
}

/// One multi-turn BI conversation: intent, then either a follow-up
/// question or the normalised query parameters.
pub struct BiOrchestrator {
    conversation_id: String,
    history: Vec<HistoryEntry>,
    intent: IntentClassifier,
    collector: InfoCollector,
    dates: DateParser,
    projects: ProjectExtractor,
    targets: Option<Arc<TargetExtractor>>,
}

impl BiOrchestrator {
    pub fn new(model: Arc<dyn ChatModel>, targets: Option<Arc<TargetExtractor>>, conversation_id: Option<String>) -> Self {
        Self {
            conversation_id: conversation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            history: Vec::new(),
            intent: IntentClassifier::new(model.clone()),
            collector: InfoCollector::new(model.clone()),
            dates: DateParser::new(model.clone()),
            projects: ProjectExtractor::new(model),
            targets,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn update_conversation_history(&mut self, role: &str, content: &str) {
        self.history.push(HistoryEntry {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn get_conversation_history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub async fn process_query(&mut self, query: &str) -> Result<BiResponse, BiError> {
        self.update_conversation_history("user", query);

        let context = json!({
            "conversation_id": self.conversation_id,
            "conversation_history": self.history,
            "current_time": Utc::now().to_rfc3339(),
        });
        let mut intent = self.intent.analyze(query, &context).await?;

        let projects = self.projects.extract_projects(query).await?;
        if !projects.is_empty() {
            intent.precinct_name = Some(projects);
        }

        if !intent.is_bi_query() {
            self.update_conversation_history("assistant", NOT_BI_REPLY);
            return Ok(BiResponse {
                response: Some(NOT_BI_REPLY.to_string()),
                conversation_id: self.conversation_id.clone(),
                is_bi_query: false,
                is_complete: None,
                missing_info: None,
                collected_info: None,
                extracted_params: None,
            });
        }

        let collected = QueryParams::from(&intent);

        if !intent.complete {
            let collected_json = serde_json::to_value(&collected)?;
            let question = self
                .collector
                .ask_missing(query, &intent.missing_info, &collected_json)
                .await?;
            let question = if question.is_empty() { DEFAULT_FOLLOW_UP.to_string() } else { question };
            self.update_conversation_history("assistant", &question);

            return Ok(BiResponse {
                response: Some(question),
                conversation_id: self.conversation_id.clone(),
                is_bi_query: true,
                is_complete: Some(false),
                missing_info: Some(intent.missing_info),
                collected_info: Some(collected),
                extracted_params: None,
            });
        }

        let params = self.normalize(query, collected).await?;
        self.update_conversation_history(
            "system",
            &format!("参数提取完成: {}", serde_json::to_string(&params)?),
        );
        tracing::info!("BI parameters extracted for conversation {}", self.conversation_id);

        Ok(BiResponse {
            response: None,
            conversation_id: self.conversation_id.clone(),
            is_bi_query: true,
            is_complete: Some(true),
            missing_info: None,
            collected_info: None,
            extracted_params: Some(params),
        })
    }

    /// Resolves the date expression to concrete periods and maps the metric
    /// onto its standard name.
    async fn normalize(&self, query: &str, mut params: QueryParams) -> Result<QueryParams, BiError> {
        let date_text = params
            .current_date
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(query)
            .to_string();
        let parsed = self.dates.parse_date(&date_text, None).await?;
        let periods = split_dates(&parsed);
        params.current_date = Some(if periods.is_empty() { parsed } else { periods.join(",") });

        if let Some(targets) = &self.targets {
            if !params.target_name.trim().is_empty() {
                params.target_name = targets
                    .extract_target(&params.target_name, targets.default_top_k(), false)
                    .await?;
            }
        }
        Ok(params)
    }
}

struct Conversation {
    orchestrator: Arc<Mutex<BiOrchestrator>>,
    last_used: Instant,
}

/// Orchestrators keyed by conversation id. Conversations idle for longer
/// than the TTL are dropped; at capacity the least recently used one goes.
pub struct BiSessions {
    model: Arc<dyn ChatModel>,
    targets: Option<Arc<TargetExtractor>>,
    sessions: Mutex<HashMap<String, Conversation>>,
    capacity: usize,
    idle_ttl: Duration,
}

impl BiSessions {
    pub fn new(model: Arc<dyn ChatModel>, targets: Option<Arc<TargetExtractor>>) -> Self {
        Self {
            model,
            targets,
            sessions: Mutex::new(HashMap::new()),
            capacity: DEFAULT_MAX_CONVERSATIONS,
            idle_ttl: DEFAULT_CONVERSATION_TTL,
        }
    }

    pub fn with_limits(mut self, capacity: usize, idle_ttl: Duration) -> Self {
        self.capacity = capacity.max(1);
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn targets(&self) -> Option<&Arc<TargetExtractor>> {
        self.targets.as_ref()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Continues the conversation `conversation_id`, or starts a new one.
    pub async fn process(&self, conversation_id: Option<String>, query: &str) -> Result<BiResponse, BiError> {
        self.process_at(conversation_id, query, Instant::now()).await
    }

    pub(crate) async fn process_at(
        &self,
        conversation_id: Option<String>,
        query: &str,
        now: Instant,
    ) -> Result<BiResponse, BiError> {
        let orchestrator = self.checkout(conversation_id, now).await;
        let mut orchestrator = orchestrator.lock().await;
        orchestrator.process_query(query).await
    }

    async fn checkout(&self, conversation_id: Option<String>, now: Instant) -> Arc<Mutex<BiOrchestrator>> {
        let mut sessions = self.sessions.lock().await;

        let idle_ttl = self.idle_ttl;
        let before = sessions.len();
        sessions.retain(|_, c| now.saturating_duration_since(c.last_used) < idle_ttl);
        if sessions.len() != before {
            tracing::debug!("Dropped {} idle BI conversations", before - sessions.len());
        }

        let id = conversation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if !sessions.contains_key(&id) && sessions.len() >= self.capacity {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, c)| c.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                tracing::debug!("BI conversation limit reached, dropping {}", oldest);
                sessions.remove(&oldest);
            }
        }

        let conversation = sessions.entry(id.clone()).or_insert_with(|| Conversation {
            orchestrator: Arc::new(Mutex::new(BiOrchestrator::new(
                self.model.clone(),
                self.targets.clone(),
                Some(id),
            ))),
            last_used: now,
        });
        conversation.last_used = now;
        conversation.orchestrator.clone()
    }

    pub async fn history(&self, conversation_id: &str) -> Option<Vec<HistoryEntry>> {
        let orchestrator = self
            .sessions
            .lock()
            .await
            .get(conversation_id)
            .map(|c| c.orchestrator.clone())?;
        let orchestrator = orchestrator.lock().await;
        Some(orchestrator.get_conversation_history().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::testing::ScriptedModel;

    const COMPLETE_INTENT: &str = "```json\n{\"intent\": \"bi_query\", \"complete\": true, \"missing_info\": [], \"precinctName\": \"华东物业\", \"current_date\": \"去年\", \"targetName\": \"收缴率\"}\n```";

    #[tokio::test]
    async fn test_non_bi_query() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"intent": "other", "complete": false, "missing_info": []}"#,
            "",
        ]));
        let mut orchestrator = BiOrchestrator::new(model, None, Some("conv-1".into()));

        let response = orchestrator.process_query("今天天气怎么样").await.unwrap();
        assert!(!response.is_bi_query);
        assert_eq!(response.response.as_deref(), Some(NOT_BI_REPLY));
        assert_eq!(response.conversation_id, "conv-1");

        let history = orchestrator.get_conversation_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, "assistant");
    }

    #[tokio::test]
    async fn test_incomplete_query_asks_follow_up() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"intent": "bi_query", "complete": false, "missing_info": ["时间"], "precinctName": null, "targetName": "收缴率"}"#,
            "华东",
            "",
        ]));
        let mut orchestrator = BiOrchestrator::new(model, None, None);

        let response = orchestrator.process_query("华东物业的收缴率").await.unwrap();
        assert_eq!(response.is_complete, Some(false));
        assert_eq!(response.response.as_deref(), Some(DEFAULT_FOLLOW_UP));
        assert_eq!(response.missing_info, Some(vec!["时间".to_string()]));

        let collected = response.collected_info.unwrap();
        // extracted project names override the intent's slot
        assert_eq!(collected.precinct_name.as_deref(), Some("华东"));
        assert_eq!(collected.target_name, "收缴率");
    }

    #[tokio::test]
    async fn test_complete_query_normalises_parameters() {
        let model = Arc::new(ScriptedModel::new(vec![COMPLETE_INTENT, "", "2023， 2024,明年"]));
        let mut orchestrator = BiOrchestrator::new(model.clone(), None, None);

        let response = orchestrator.process_query("华东物业去年的收缴率").await.unwrap();
        assert_eq!(response.is_complete, Some(true));
        assert!(response.response.is_none());

        let params = response.extracted_params.clone().unwrap();
        assert_eq!(params.precinct_name.as_deref(), Some("华东物业"));
        // only yyyy / yyyy-MM tokens survive
        assert_eq!(params.current_date.as_deref(), Some("2023,2024"));
        assert_eq!(params.target_name, "收缴率");

        // the date parser sees the intent's date expression
        assert!(model.requests()[2].messages[1].content.contains("文本：\"去年\""));

        let last = orchestrator.get_conversation_history().last().unwrap().clone();
        assert_eq!(last.role, "system");
        assert!(last.content.starts_with("参数提取完成: {"));
        assert!(last.content.contains("\"precinctName\":\"华东物业\""));

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("response").is_none());
        assert!(json.get("missing_info").is_none());
        assert_eq!(json["extracted_params"]["targetName"], "收缴率");
    }

    #[tokio::test]
    async fn test_sessions_keep_history_per_conversation() {
        let model = Arc::new(ScriptedModel::always("not json"));
        let sessions = BiSessions::new(model, None);

        let first = sessions.process(None, "收缴率").await.unwrap();
        sessions.process(Some(first.conversation_id.clone()), "华东").await.unwrap();
        sessions.process(Some("other".into()), "收缴率").await.unwrap();

        let history = sessions.history(&first.conversation_id).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].content, "华东");
        assert_eq!(sessions.history("other").await.unwrap().len(), 2);
        assert!(sessions.history("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_sessions_are_capped() {
        let sessions = BiSessions::new(Arc::new(ScriptedModel::always("not json")), None)
            .with_limits(3, Duration::from_secs(3600));
        let start = Instant::now();

        for i in 0..50u64 {
            sessions.process_at(None, "hi", start + Duration::from_millis(i)).await.unwrap();
        }
        assert_eq!(sessions.len().await, 3);

        sessions.process_at(Some("a".into()), "hi", start + Duration::from_secs(1)).await.unwrap();
        sessions.process_at(Some("b".into()), "hi", start + Duration::from_secs(2)).await.unwrap();
        sessions.process_at(Some("a".into()), "again", start + Duration::from_secs(3)).await.unwrap();
        sessions.process_at(Some("c".into()), "hi", start + Duration::from_secs(4)).await.unwrap();
        sessions.process_at(Some("d".into()), "hi", start + Duration::from_secs(5)).await.unwrap();

        // "b" was the least recently used
        assert_eq!(sessions.len().await, 3);
        assert!(sessions.history("b").await.is_none());
        assert_eq!(sessions.history("a").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let sessions = BiSessions::new(Arc::new(ScriptedModel::always("not json")), None)
            .with_limits(100, Duration::from_secs(60));
        let start = Instant::now();

        sessions.process_at(Some("old".into()), "hi", start).await.unwrap();
        sessions.process_at(Some("kept".into()), "hi", start + Duration::from_secs(30)).await.unwrap();
        sessions.process_at(Some("new".into()), "hi", start + Duration::from_secs(61)).await.unwrap();

        assert!(sessions.history("old").await.is_none());
        assert!(sessions.history("kept").await.is_some());
        assert_eq!(sessions.len().await, 2);
    }
}
