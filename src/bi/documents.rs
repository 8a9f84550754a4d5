// src/bi/documents.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::vector_store::{VectorRecord, VectorStore};
use super::BiError;
use crate::embeddings::Embedder;

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1000;
const MIN_CHUNK_CHARS: usize = 50;
const METADATA_FILE: &str = "doc_metadata.json";

lazy_static! {
    static ref BLANK_LINE: Regex = Regex::new(r"\n\s*\n").unwrap();
}

/// Splits a document on blank lines and packs paragraphs into chunks of
/// fewer than `max_chunk_size` characters. Chunks of 50 characters or less
/// carry too little meaning to retrieve and are dropped.
pub fn split_document(content: &str, max_chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for para in BLANK_LINE.split(content).map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = para.chars().count();
        if current_len + para_len < max_chunk_size {
            if !current.is_empty() {
                current.push_str("\n\n");
                current_len += 2;
            }
            current.push_str(para);
            current_len += para_len;
        } else {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            current.push_str(para);
            current_len = para_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks.retain(|chunk| chunk.chars().count() > MIN_CHUNK_CHARS);
    chunks
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id_prefix: String,
    pub hash: String,
    pub updated_at: DateTime<Utc>,
    pub chunks: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub chunks_written: usize,
}

impl SyncReport {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Tracks which markdown files of the docs directory are embedded, keyed by
/// file name, with a SHA-256 of their content to detect edits.
pub struct DocumentIndex {
    docs_dir: PathBuf,
    metadata_file: PathBuf,
    records: BTreeMap<String, DocumentRecord>,
}

impl DocumentIndex {
    pub async fn open(docs_dir: &Path, db_path: &Path) -> Result<Self, BiError> {
        tokio::fs::create_dir_all(db_path).await?;
        let metadata_file = db_path.join(METADATA_FILE);

        let records = match tokio::fs::read_to_string(&metadata_file).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Error loading document metadata, rebuilding: {}", e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            docs_dir: docs_dir.to_path_buf(),
            metadata_file,
            records,
        })
    }

    pub fn records(&self) -> &BTreeMap<String, DocumentRecord> {
        &self.records
    }

    async fn save(&self) -> Result<(), BiError> {
        let raw = serde_json::to_string_pretty(&self.records)?;
        tokio::fs::write(&self.metadata_file, raw).await?;
        Ok(())
    }

    /// Current `*.md` files with their content hashes.
    async fn scan(&self) -> Result<BTreeMap<String, String>, BiError> {
        let mut files = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.docs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    files.insert(name, hex::encode(Sha256::digest(&bytes)));
                }
                Err(e) => tracing::warn!("Error checking file {}: {}", name, e),
            }
        }
        Ok(files)
    }

    /// Brings `store` in line with the docs directory: chunks of removed and
    /// edited files are deleted, new and edited files are chunked, embedded
    /// and inserted. An empty store is rebuilt from scratch.
    pub async fn sync(&mut self, store: &dyn VectorStore, embedder: &dyn Embedder) -> Result<SyncReport, BiError> {
        if !self.records.is_empty() && store.count().await? == 0 {
            tracing::info!("Vector store is empty, re-indexing all documents");
            self.records.clear();
        }

        let current = self.scan().await?;
        let mut report = SyncReport::default();
        for (name, hash) in &current {
            match self.records.get(name) {
                None => report.added.push(name.clone()),
                Some(record) if &record.hash != hash => report.updated.push(name.clone()),
                Some(_) => {}
            }
        }
        report.removed = self
            .records
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();

        if !report.has_changes() {
            tracing::debug!("No document changes detected");
            return Ok(report);
        }
        tracing::info!(
            "Found changes: {} new, {} updated, {} removed",
            report.added.len(),
            report.updated.len(),
            report.removed.len()
        );

        for name in report.removed.iter().chain(report.updated.iter()) {
            store.delete_source(name).await?;
        }
        for name in &report.removed {
            self.records.remove(name);
        }

        let base_time = Utc::now().timestamp();
        let to_index: Vec<String> = report.added.iter().chain(report.updated.iter()).cloned().collect();
        for name in to_index {
            let content = match tokio::fs::read_to_string(self.docs_dir.join(&name)).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("Error processing {}: {}", name, e);
                    self.records.remove(&name);
                    continue;
                }
            };

            let chunks = split_document(&content, DEFAULT_MAX_CHUNK_SIZE);
            let chunk_count = chunks.len();
            let id_prefix = format!("doc_{}_{}", base_time, name);
            if !chunks.is_empty() {
                let vectors = embedder.embed(&chunks).await?;
                let records = chunks
                    .into_iter()
                    .zip(vectors)
                    .enumerate()
                    .map(|(i, (text, vector))| VectorRecord {
                        id: format!("{}_{}", id_prefix, i),
                        source: name.clone(),
                        chunk_index: i,
                        total_chunks: chunk_count,
                        text,
                        vector,
                    })
                    .collect::<Vec<_>>();
                report.chunks_written += records.len();
                store.upsert(records).await?;
            }

            self.records.insert(
                name.clone(),
                DocumentRecord {
                    id_prefix,
                    hash: current.get(&name).cloned().unwrap_or_default(),
                    updated_at: Utc::now(),
                    chunks: chunk_count,
                },
            );
        }

        self.save().await?;
        tracing::info!(
            "Indexed {} chunks, {} documents tracked",
            report.chunks_written,
            self.records.len()
        );
        Ok(report)
    }
}
