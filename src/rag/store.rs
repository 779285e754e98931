use async_trait::async_trait;
use clap::ValueEnum;
use log::{ debug, info };
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::cmp::Ordering;
use std::fs;
use std::path::{ Path, PathBuf };
use std::sync::Arc;

use crate::llm::embedding::EmbeddingClient;
use super::{ RetrievalError, RetrievedDocument, VectorStore };

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Euclidean distance, smaller is closer.
    #[default]
    L2,
    Cosine,
    Dot,
}

impl Metric {
    fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 =>
                a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt(),
            Metric::Dot => dot(a, b),
            Metric::Cosine => {
                let norm = dot(a, a).sqrt() * dot(b, b).sqrt();
                if norm == 0.0 { 0.0 } else { dot(a, b) / norm }
            }
        }
    }

    fn better(self, a: f32, b: f32) -> Ordering {
        match self {
            Metric::L2 => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            Metric::Cosine | Metric::Dot => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| x * y)
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub page_content: String,
    #[serde(default)]
    pub metadata: Value,
    pub embedding: Vec<f32>,
}

/// On-disk document collection with precomputed embeddings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentIndex {
    #[serde(default)]
    pub metric: Metric,
    /// Model the embeddings were produced with; informational.
    #[serde(default)]
    pub embedding_model: Option<String>,
    pub documents: Vec<StoredDocument>,
}

impl DocumentIndex {
    pub fn load(path: &Path) -> Result<Self, RetrievalError> {
        let bytes = fs::read(path).map_err(|source| RetrievalError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(path, &bytes)
    }

    /// Non-blocking variant of `load` for use inside the runtime.
    pub async fn reload(path: &Path) -> Result<Self, RetrievalError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| RetrievalError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(path, &bytes)
    }

    fn from_slice(path: &Path, bytes: &[u8]) -> Result<Self, RetrievalError> {
        serde_json::from_slice(bytes).map_err(|source| RetrievalError::Corrupt {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let mut scored = Vec::with_capacity(self.documents.len());
        for (index, doc) in self.documents.iter().enumerate() {
            if doc.embedding.len() != query.len() {
                return Err(RetrievalError::DimensionMismatch {
                    index,
                    query: query.len(),
                    document: doc.embedding.len(),
                });
            }
            scored.push((index, self.metric.score(query, &doc.embedding)));
        }
        // stable sort keeps file order among ties
        scored.sort_by(|a, b| self.metric.better(a.1, b.1));

        Ok(
            scored
                .into_iter()
                .take(k)
                .enumerate()
                .map(|(rank, (index, score))| {
                    let doc = &self.documents[index];
                    RetrievedDocument {
                        page_content: doc.page_content.clone(),
                        metadata: doc.metadata.clone(),
                        rank,
                        score,
                    }
                })
                .collect()
        )
    }
}

/// Store loaded once and queried from memory.
pub struct PersistedVectorStore {
    index: DocumentIndex,
    embedder: Arc<dyn EmbeddingClient>,
}

impl PersistedVectorStore {
    pub fn new(index: DocumentIndex, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { index, embedder }
    }

    pub fn load(path: &Path, embedder: Arc<dyn EmbeddingClient>) -> Result<Self, RetrievalError> {
        let index = DocumentIndex::load(path)?;
        info!(
            "Loaded vector store {} ({} documents, metric {:?}, embeddings from {})",
            path.display(),
            index.documents.len(),
            index.metric,
            index.embedding_model.as_deref().unwrap_or("unknown model")
        );
        Ok(Self::new(index, embedder))
    }
}

async fn embed_query(embedder: &dyn EmbeddingClient, text: &str) -> Result<Vec<f32>, RetrievalError> {
    embedder
        .embed(text).await
        .map(|r| r.embedding)
        .map_err(RetrievalError::Embedding)
}

#[async_trait]
impl VectorStore for PersistedVectorStore {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let embedding = embed_query(self.embedder.as_ref(), text).await?;
        self.index.nearest(&embedding, k)
    }
}

/// Re-reads the store file on every query, so external rewrites are picked up.
pub struct ReloadingVectorStore {
    path: PathBuf,
    embedder: Arc<dyn EmbeddingClient>,
}

impl ReloadingVectorStore {
    pub fn new(path: PathBuf, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { path, embedder }
    }
}

#[async_trait]
impl VectorStore for ReloadingVectorStore {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        debug!("Reloading vector store from {}", self.path.display());
        let index = DocumentIndex::reload(&self.path).await?;
        let embedding = embed_query(self.embedder.as_ref(), text).await?;
        index.nearest(&embedding, k)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LoadPolicy {
    /// Load at startup and reuse for every turn.
    Once,
    /// Read the file again for every query.
    #[default]
    PerTurn,
}

pub fn open_vector_store(
    path: &Path,
    embedder: Arc<dyn EmbeddingClient>,
    policy: LoadPolicy
) -> Result<Arc<dyn VectorStore>, RetrievalError> {
    match policy {
        LoadPolicy::Once => Ok(Arc::new(PersistedVectorStore::load(path, embedder)?)),
        LoadPolicy::PerTurn => {
            info!("Vector store {} will be reloaded for every query", path.display());
            Ok(Arc::new(ReloadingVectorStore::new(path.to_path_buf(), embedder)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::embedding::EmbeddingResponse;
    use std::error::Error as StdError;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl EmbeddingClient for FixedEmbedder {
        async fn embed(
            &self,
            _text: &str
        ) -> Result<EmbeddingResponse, Box<dyn StdError + Send + Sync>> {
            Ok(EmbeddingResponse { embedding: self.0.clone() })
        }
    }

    fn doc(text: &str, embedding: Vec<f32>) -> StoredDocument {
        StoredDocument { page_content: text.to_string(), metadata: Value::Null, embedding }
    }

    fn index(metric: Metric) -> DocumentIndex {
        DocumentIndex {
            metric,
            embedding_model: None,
            documents: vec![
                doc("far", vec![10.0, 0.0]),
                doc("near", vec![1.0, 0.1]),
                doc("long", vec![3.0, 0.0]),
            ],
        }
    }

    #[test]
    fn l2_ranks_by_distance() {
        let hits = index(Metric::L2).nearest(&[1.0, 0.0], 3).unwrap();
        let names: Vec<_> = hits.iter().map(|h| h.page_content.as_str()).collect();
        assert_eq!(names, vec!["near", "long", "far"]);
        assert_eq!(hits[0].rank, 0);
        assert_eq!(hits[2].rank, 2);
    }

    #[test]
    fn dot_prefers_magnitude_and_cosine_prefers_direction() {
        let dot = index(Metric::Dot).nearest(&[1.0, 0.0], 1).unwrap();
        assert_eq!(dot[0].page_content, "far");

        let cosine = index(Metric::Cosine).nearest(&[0.0, 1.0], 1).unwrap();
        assert_eq!(cosine[0].page_content, "near");
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let err = index(Metric::L2).nearest(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { query: 3, document: 2, .. }));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"\x80\x04pickle").unwrap();
        assert!(matches!(DocumentIndex::load(file.path()), Err(RetrievalError::Corrupt { .. })));
        assert!(
            matches!(
                DocumentIndex::load(Path::new("/nonexistent/vectorstore.json")),
                Err(RetrievalError::Io { .. })
            )
        );
    }

    fn write_store(path: &Path, text: &str) {
        let index = DocumentIndex {
            metric: Metric::L2,
            embedding_model: Some("test".into()),
            documents: vec![doc(text, vec![0.0, 0.0])],
        };
        fs::write(path, serde_json::to_vec(&index).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn per_turn_policy_sees_rewrites_and_once_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectorstore.json");
        write_store(&path, "v1");
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(FixedEmbedder(vec![0.0, 0.0]));

        let once = open_vector_store(&path, Arc::clone(&embedder), LoadPolicy::Once).unwrap();
        let per_turn = open_vector_store(&path, embedder, LoadPolicy::PerTurn).unwrap();
        assert_eq!(once.query("q", 1).await.unwrap()[0].page_content, "v1");
        assert_eq!(per_turn.query("q", 1).await.unwrap()[0].page_content, "v1");

        write_store(&path, "v2");
        assert_eq!(once.query("q", 1).await.unwrap()[0].page_content, "v1");
        assert_eq!(per_turn.query("q", 1).await.unwrap()[0].page_content, "v2");
    }

    #[tokio::test]
    async fn load_once_fails_at_open_when_file_missing() {
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(FixedEmbedder(vec![0.0]));
        let missing = Path::new("/nonexistent/vectorstore.json");
        assert!(open_vector_store(missing, Arc::clone(&embedder), LoadPolicy::Once).is_err());
        let per_turn = open_vector_store(missing, embedder, LoadPolicy::PerTurn).unwrap();
        assert!(matches!(per_turn.query("q", 1).await, Err(RetrievalError::Io { .. })));
    }

    #[tokio::test]
    async fn reload_reads_the_same_index_as_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectorstore.json");
        write_store(&path, "v1");
        let loaded = DocumentIndex::load(&path).unwrap();
        let reloaded = DocumentIndex::reload(&path).await.unwrap();
        assert_eq!(reloaded.documents.len(), 1);
        assert_eq!(reloaded.documents[0].page_content, loaded.documents[0].page_content);
        assert_eq!(reloaded.metric, loaded.metric);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn per_turn_reload_of_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectorstore.json");
        fs::write(&path, b"\x80\x04pickle").unwrap();
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(FixedEmbedder(vec![0.0]));
        let per_turn = open_vector_store(&path, embedder, LoadPolicy::PerTurn).unwrap();
        assert!(matches!(per_turn.query("q", 1).await, Err(RetrievalError::Corrupt { .. })));
    }
}
