pub mod beam;
pub mod device;
pub mod llama;

use async_trait::async_trait;
use futures::Stream;
use std::error::Error as StdError;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::prompt::RESPONSE_MARKER;

/// Cumulative decoded snapshots; each item is the whole output so far, not a delta.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, Box<dyn StdError + Send + Sync>>> + Send>>;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Decoded output has no '{}' marker", RESPONSE_MARKER)]
    MissingResponseMarker,

    #[error("Failed to read checkpoint file {path}: {source}")]
    Checkpoint {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid checkpoint config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("Unsupported device '{0}'")]
    UnsupportedDevice(String),

    #[error("Unsupported dtype '{0}'")]
    UnsupportedDtype(String),

    #[error("Prompt encodes to zero tokens")]
    EmptyPrompt,

    #[error("Generation worker stopped unexpectedly: {0}")]
    Worker(String),
}

/// Sampling settings for exactly one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    temperature: f64,
    top_p: f64,
    top_k: usize,
    num_beams: usize,
    stop: Option<String>,
    max_new_tokens: usize,
}

impl GenerationRequest {
    /// One-shot code generation settings.
    pub fn batch(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.1,
            top_p: 0.75,
            top_k: 40,
            num_beams: 2,
            stop: None,
            max_new_tokens: 1024,
        }
    }

    /// Interactive turn settings, halting at the conversation separator.
    pub fn chat(prompt: impl Into<String>, stop: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.7,
            top_p: 1.0,
            top_k: 0,
            num_beams: 1,
            stop: Some(stop.into()),
            max_new_tokens: 700,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn top_p(&self) -> f64 {
        self.top_p
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    pub fn stop(&self) -> Option<&str> {
        self.stop.as_deref()
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Blocks until the full sequence is produced; returns the decoded output including the prompt echo.
    async fn generate(
        &self,
        request: GenerationRequest
    ) -> Result<String, Box<dyn StdError + Send + Sync>>;

    async fn generate_stream(
        &self,
        request: GenerationRequest
    ) -> Result<TextStream, Box<dyn StdError + Send + Sync>>;
}

/// Text after the first `### Response:` marker, up to a second one if the model emitted it.
pub fn extract_response(decoded: &str) -> Result<String, GenerationError> {
    let mut sections = decoded.split(RESPONSE_MARKER);
    sections.next();
    sections
        .next()
        .map(|s| s.trim().to_string())
        .ok_or(GenerationError::MissingResponseMarker)
}

/// Runs a blocking producer on the blocking pool and exposes what it sends as a stream.
pub fn create_blocking_stream<F>(producer: F) -> TextStream
    where F: FnOnce(mpsc::Sender<Result<String, Box<dyn StdError + Send + Sync>>>) + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::task::spawn_blocking(move || {
        producer(tx);
    });

    Box::pin(ReceiverStream::new(rx))
}
