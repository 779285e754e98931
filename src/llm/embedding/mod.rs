pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use std::error::Error as StdError;
use std::sync::Arc;

use super::{ LlmConfig, LlmType };
use self::ollama::OllamaEmbeddingClient;
use self::openai::OpenAIEmbeddingClient;

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// Turns query text into the vector space the document store was built in.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, Box<dyn StdError + Send + Sync>>;
}

pub fn new_client(
    config: &LlmConfig
) -> Result<Arc<dyn EmbeddingClient>, Box<dyn StdError + Send + Sync>> {
    let client: Arc<dyn EmbeddingClient> = match config.llm_type {
        LlmType::Ollama => {
            let specific_client = OllamaEmbeddingClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAIEmbeddingClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}
