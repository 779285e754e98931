use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use super::super::LlmConfig;
use super::{ EmbeddingClient, EmbeddingResponse };

pub struct OpenAIEmbeddingClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingList {
    data: Vec<EmbeddingData>,
}

impl OpenAIEmbeddingClient {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            http: HttpClient::new(),
            api_key,
            model: model.unwrap_or_else(|| "text-embedding-3-small".to_string()),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let api_key = config.api_key
            .clone()
            .ok_or_else(|| "OpenAI API key is required for OpenAIEmbeddingClient".to_string())?;

        Ok(Self::new(api_key, config.embedding_model.clone(), config.base_url.clone()))
    }
}

#[async_trait]
impl EmbeddingClient for OpenAIEmbeddingClient {
    async fn embed(
        &self,
        text: &str
    ) -> Result<EmbeddingResponse, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let req = EmbeddingRequest {
            model: &self.model,
            input: vec![text],
        };
        let resp = self.http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send().await?
            .error_for_status()?;
        let mut list = resp.json::<EmbeddingList>().await?;
        let embedding = list.data
            .pop()
            .map(|d| d.embedding)
            .ok_or_else(|| "OpenAI embedding generation returned no results".to_string())?;

        Ok(EmbeddingResponse { embedding })
    }
}
