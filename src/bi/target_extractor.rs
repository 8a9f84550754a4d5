// src/bi/target_extractor.rs
use std::sync::Arc;

use tokio::sync::Mutex;

use super::cache::QueryCache;
use super::documents::{DocumentIndex, SyncReport};
use super::vector_store::{ScoredChunk, VectorStore};
use super::BiError;
use crate::agent::ask;
use crate::embeddings::Embedder;
use crate::llm_client::ChatModel;

const MAX_CONTEXT_CHARS: usize = 4000;
const TRUNCATED_MARKER: &str = "...(内容已截断)";

const TARGET_SYSTEM_MESSAGE: &str = r#"你是一个标准指标名称关键词识别器，可以对用户的输入进行校准，返回"标准指标"对应的名称。

根据检索到的语料知识库的上下文和用户的输入、找到最匹配的**标准名称**并且回复，你必须选择其中一个！

注意：
1. 只能返回检索到的"标准指标"名称后紧跟的指标名称
2. 禁止回复其他内容，不要给用户选择
"#;

fn target_prompt(context: &str, query: &str) -> String {
    format!(
        r#"检索到的上下文是：
{}

## 角色
你是一个标准指标名称关键词识别器，可以对用户的输入进行校准，返回"标准指标"对应的名称

## 能力
根据检索到的语料知识库的上下文和用户的输入，进行分析比较语义，找到最匹配的**标准名称**并且回复，你必须选择其中一个！

注意：
1. 只能返回检索到的"标准指标"名称后紧跟的指标名称！
2. 禁止回复其他内容，不要让用户进行选择

用户输入: "{}"
"#,
        context, query
    )
}

/// Groups retrieved chunks by source document (in order of first hit),
/// restores each document's chunk order and joins them into one prompt
/// context, cut at 4000 characters.
pub fn build_context(hits: &[ScoredChunk]) -> String {
    let mut groups: Vec<(&str, Vec<&ScoredChunk>)> = Vec::new();
    for hit in hits {
        match groups.iter_mut().find(|(source, _)| *source == hit.source) {
            Some((_, chunks)) => chunks.push(hit),
            None => groups.push((hit.source.as_str(), vec![hit])),
        }
    }

    let mut context = String::new();
    for (source, mut chunks) in groups {
        chunks.sort_by_key(|c| c.chunk_index);
        let body = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n\n");
        context.push_str(&format!("文档 {}:\n{}\n\n", source, body));

        if context.chars().count() > MAX_CONTEXT_CHARS {
            let mut cut: String = context.chars().take(MAX_CONTEXT_CHARS).collect();
            cut.push_str(TRUNCATED_MARKER);
            return cut;
        }
    }
    context
}

/// Maps free-form metric wording onto the standard metric names found in
/// the indexed documents.
pub struct TargetExtractor {
    model: Arc<dyn ChatModel>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    index: Option<Mutex<DocumentIndex>>,
    cache: Mutex<QueryCache>,
    default_top_k: usize,
}

impl TargetExtractor {
    pub fn new(
        model: Arc<dyn ChatModel>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        cache: QueryCache,
        default_top_k: usize,
    ) -> Self {
        Self {
            model,
            embedder,
            store,
            index: None,
            cache: Mutex::new(cache),
            default_top_k,
        }
    }

    pub fn with_documents(mut self, index: DocumentIndex) -> Self {
        self.index = Some(Mutex::new(index));
        self
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    pub async fn extract_target(&self, query: &str, top_k: usize, bypass_cache: bool) -> Result<String, BiError> {
        let normalized = QueryCache::normalize(query);

        if !bypass_cache {
            if let Some(hit) = self.cache.lock().await.get(&normalized) {
                tracing::debug!("Cache hit for query: {}", normalized);
                return Ok(hit);
            }
        }

        let vector = self.embedder.embed_one(&normalized).await?;
        let hits = self.store.query(&vector, top_k.max(1) * 2).await?;
        let context = build_context(&hits);
        tracing::debug!("Retrieved {} chunks ({} context chars) for {:?}", hits.len(), context.chars().count(), normalized);

        let reply = ask(self.model.as_ref(), TARGET_SYSTEM_MESSAGE, &target_prompt(&context, query)).await?;
        let target = reply.trim().to_string();

        self.cache.lock().await.insert(normalized, target.clone());
        Ok(target)
    }

    /// Re-syncs the document index; cached answers are dropped when anything changed.
    pub async fn refresh_documents(&self) -> Result<SyncReport, BiError> {
        let index = self.index.as_ref().ok_or(BiError::NotConfigured("BI_DOCS_DIR"))?;
        let report = index.lock().await.sync(self.store.as_ref(), self.embedder.as_ref()).await?;
        if report.has_changes() {
            self.clear_cache().await;
        }
        Ok(report)
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}
