pub mod store;

use async_trait::async_trait;
use log::debug;
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::error::Error as StdError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Failed to read vector store {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Vector store {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },

    #[error("Query embedding failed: {0}")]
    Embedding(Box<dyn StdError + Send + Sync>),

    #[error("Dimension mismatch: query has {query} dimensions, document {index} has {document}")]
    DimensionMismatch {
        index: usize,
        query: usize,
        document: usize,
    },

    #[error("Vector store returned no documents")]
    NoDocuments,
}

/// One hit from a similarity query; lives for a single turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub page_content: String,
    #[serde(default)]
    pub metadata: Value,
    /// 0 is the closest match.
    pub rank: usize,
    /// Distance or similarity, depending on the store's metric.
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Up to `k` documents ordered best first. Must not mutate the store.
    async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError>;
}

/// The single best match for `query`; there is no ungrounded fallback.
pub async fn retrieve_top_document(
    store: &dyn VectorStore,
    query: &str
) -> Result<RetrievedDocument, RetrievalError> {
    let mut hits = store.query(query, 1).await?;
    if hits.is_empty() {
        return Err(RetrievalError::NoDocuments);
    }
    let top = hits.swap_remove(0);
    debug!("Retrieved document (score {:.4}): {} chars", top.score, top.page_content.len());
    Ok(top)
}
