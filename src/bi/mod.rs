// src/bi/mod.rs
//! BI query pipeline: intent classification, slot collection and
//! normalisation of project names, dates and metric names.

use thiserror::Error;

use crate::agent::AgentError;
use crate::embeddings::EmbeddingError;

pub mod cache;
pub mod collector;
pub mod date_parser;
pub mod documents;
pub mod intent;
pub mod orchestrator;
pub mod project_extractor;
pub mod target_extractor;
pub mod vector_store;

pub use orchestrator::{BiOrchestrator, BiResponse, BiSessions};
pub use target_extractor::TargetExtractor;

#[derive(Error, Debug)]
pub enum BiError {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Vector store error: {0}")]
    VectorStore(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}
