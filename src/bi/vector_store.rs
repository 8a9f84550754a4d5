// src/bi/vector_store.rs
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::BiError;
use crate::embeddings::cosine_similarity;

pub const COLLECTION_NAME: &str = "target_docs";
const VECTORS_FILE: &str = "vectors.json";

/// One embedded document chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub source: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub id: String,
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), BiError>;

    /// Removes every chunk that came from `source`.
    async fn delete_source(&self, source: &str) -> Result<(), BiError>;

    /// Best matches first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, BiError>;

    async fn count(&self) -> Result<usize, BiError>;
}

/// Brute-force cosine search over chunks held in memory, optionally mirrored
/// to `<db_path>/vectors.json`.
pub struct LocalVectorStore {
    records: RwLock<Vec<VectorRecord>>,
    path: Option<PathBuf>,
}

impl LocalVectorStore {
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            path: None,
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self, BiError> {
        tokio::fs::create_dir_all(db_path).await?;
        let path = db_path.join(VECTORS_FILE);

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable vector file {}: {}", path.display(), e);
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!("Local vector store opened with {} chunks", records.len());
        Ok(Self {
            records: RwLock::new(records),
            path: Some(path),
        })
    }

    async fn persist(&self, records: &[VectorRecord]) -> Result<(), BiError> {
        if let Some(path) = &self.path {
            tokio::fs::write(path, serde_json::to_vec(records)?).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn upsert(&self, new_records: Vec<VectorRecord>) -> Result<(), BiError> {
        let mut records = self.records.write().await;
        for record in new_records {
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
        }
        self.persist(&records).await
    }

    async fn delete_source(&self, source: &str) -> Result<(), BiError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.source != source);
        if records.len() != before {
            self.persist(&records).await?;
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, BiError> {
        let records = self.records.read().await;
        let mut scored: Vec<ScoredChunk> = records
            .iter()
            .map(|r| ScoredChunk {
                id: r.id.clone(),
                source: r.source.clone(),
                chunk_index: r.chunk_index,
                text: r.text.clone(),
                score: cosine_similarity(vector, &r.vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn count(&self) -> Result<usize, BiError> {
        Ok(self.records.read().await.len())
    }
}

fn qdrant_error(e: impl std::fmt::Display) -> BiError {
    BiError::VectorStore(e.to_string())
}

/// Chunks stored in a Qdrant collection. Point ids are random UUIDs; the
/// chunk id travels in the payload.
#[derive(Clone)]
pub struct QdrantVectorStore {
    client: Qdrant,
    collection_name: String,
}

impl QdrantVectorStore {
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self, BiError> {
        let mut client_builder = Qdrant::from_url(url);
        if let Some(key) = api_key {
            client_builder = client_builder.api_key(key);
        }
        let client = client_builder.build().map_err(qdrant_error)?;

        Ok(Self {
            client,
            collection_name: COLLECTION_NAME.to_string(),
        })
    }

    /// Creates the collection and its `source` index; existing ones are kept.
    pub async fn ensure_collection(&self, dimensions: usize) -> Result<(), BiError> {
        tracing::info!("Ensuring Qdrant collection: {}", self.collection_name);

        let result = self
            .client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name)
                    .vectors_config(VectorParamsBuilder::new(dimensions as u64, Distance::Cosine)),
            )
            .await;

        match result {
            Ok(_) => tracing::info!("Created Qdrant collection: {}", self.collection_name),
            Err(e) if e.to_string().contains("already exists") => {
                tracing::debug!("Qdrant collection '{}' already exists", self.collection_name);
            }
            Err(e) => return Err(qdrant_error(e)),
        }

        let index = self
            .client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(&self.collection_name, "source", FieldType::Keyword)
                    .wait(true),
            )
            .await;
        if let Err(e) = index {
            if !e.to_string().contains("already exists") {
                tracing::warn!("Failed to create source index: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), BiError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut points = Vec::with_capacity(records.len());
        for record in records {
            let payload: Payload = json!({
                "chunk_id": record.id,
                "source": record.source,
                "chunk_index": record.chunk_index,
                "total_chunks": record.total_chunks,
                "text": record.text,
            })
            .try_into()
            .map_err(qdrant_error)?;
            points.push(PointStruct::new(Uuid::new_v4().to_string(), record.vector, payload));
        }

        let count = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(qdrant_error)?;

        tracing::debug!("Upserted {} chunks into {}", count, self.collection_name);
        Ok(())
    }

    async fn delete_source(&self, source: &str) -> Result<(), BiError> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(Filter::must([Condition::matches("source", source.to_string())]))
                    .wait(true),
            )
            .await
            .map_err(qdrant_error)?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, BiError> {
        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), top_k as u64).with_payload(true),
            )
            .await
            .map_err(qdrant_error)?;

        let chunks = search_result
            .result
            .into_iter()
            .map(|point| {
                let payload = point.payload;
                let text_field = |key: &str| {
                    payload
                        .get(key)
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_default()
                };
                ScoredChunk {
                    id: text_field("chunk_id"),
                    source: text_field("source"),
                    chunk_index: payload
                        .get("chunk_index")
                        .and_then(|v| v.as_integer())
                        .unwrap_or(0)
                        .max(0) as usize,
                    text: text_field("text"),
                    score: point.score,
                }
            })
            .collect();
        Ok(chunks)
    }

    async fn count(&self) -> Result<usize, BiError> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection_name).exact(true))
            .await
            .map_err(qdrant_error)?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, source: &str, index: usize, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            source: source.to_string(),
            chunk_index: index,
            total_chunks: 2,
            text: format!("{} chunk {}", source, index),
            vector,
        }
    }

    #[tokio::test]
    async fn test_query_orders_by_similarity() {
        let store = LocalVectorStore::in_memory();
        store
            .upsert(vec![
                record("a0", "a.md", 0, vec![1.0, 0.0]),
                record("b0", "b.md", 0, vec![0.0, 1.0]),
                record("a1", "a.md", 1, vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let hits = store.query(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a0");
        assert_eq!(hits[1].id, "a1");
    }

    #[tokio::test]
    async fn test_delete_source_and_upsert_replace() {
        let store = LocalVectorStore::in_memory();
        store
            .upsert(vec![record("a0", "a.md", 0, vec![1.0]), record("b0", "b.md", 0, vec![1.0])])
            .await
            .unwrap();
        store.upsert(vec![record("b0", "b.md", 0, vec![0.5])]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        store.delete_source("a.md").await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.query(&[1.0], 5).await.unwrap()[0].source, "b.md");
    }

    #[tokio::test]
    async fn test_persisted_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalVectorStore::open(dir.path()).await.unwrap();
            store.upsert(vec![record("a0", "a.md", 0, vec![1.0, 0.0])]).await.unwrap();
        }
        let reopened = LocalVectorStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }
}
