use clap::Parser;
use std::path::PathBuf;

use crate::rag::store::LoadPolicy;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Chat with a code-generation model grounded in API documentation", long_about = None)]
pub struct Args {
    // --- Model Args ---
    /// Folder holding the fine-tuned model; weights are read from <MODEL_FOLDER>/hf_checkpoint
    #[arg(long, env = "MODEL_FOLDER")]
    pub model_folder: PathBuf,

    /// Compute device (cpu, cuda, cuda:N, metal)
    #[arg(long, env = "DEVICE", default_value = "cuda")]
    pub device: String,

    /// Weight precision (f32, f16, bf16). Defaults to f16 on accelerators and f32 on cpu.
    #[arg(long, env = "DTYPE")]
    pub dtype: Option<String>,

    /// Path to a tokenizer.json or a hub repo id. Defaults to the checkpoint's tokenizer.json.
    #[arg(long, env = "TOKENIZER")]
    pub tokenizer: Option<String>,

    /// Seed for token sampling.
    #[arg(long, env = "SEED", default_value = "42")]
    pub seed: u64,

    /// Context window used to truncate long prompts.
    #[arg(long, env = "CONTEXT_LEN", default_value = "2048")]
    pub context_len: usize,

    /// Emit a streaming snapshot every N generated tokens.
    #[arg(long, env = "STREAM_INTERVAL", default_value = "2")]
    pub stream_interval: usize,

    // --- Chat Args ---
    /// Sampling temperature for interactive turns.
    #[arg(long, env = "TEMPERATURE", default_value = "0.7")]
    pub temperature: f64,

    /// Maximum tokens generated per interactive turn.
    #[arg(long, env = "MAX_NEW_TOKENS", default_value = "700")]
    pub max_new_tokens: usize,

    /// Conversation template JSON file. Defaults to the built-in vicuna_v1.2 template.
    #[arg(long, env = "CONV_TEMPLATE")]
    pub conv_template: Option<PathBuf>,

    /// Run a single batch inference for this instruction instead of the interactive chat.
    #[arg(long)]
    pub query: Option<String>,

    /// Log each rendered prompt and reply.
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    // --- Vector Store Args ---
    /// Serialized vector store of API documents.
    #[arg(long, env = "VECTOR_STORE", default_value = "assets/vectorstore.json")]
    pub vector_store: PathBuf,

    /// Load the vector store once at startup or again for every query.
    #[arg(long, env = "VECTOR_STORE_LOAD", value_enum, default_value = "per-turn")]
    pub vector_store_load: LoadPolicy,

    // --- Embedding LLM Provider Args ---
    /// Type of LLM provider for query embeddings (ollama, openai)
    #[arg(long, env = "EMBEDDING_LLM_TYPE", default_value = "ollama")]
    pub embedding_llm_type: String,

    /// Base URL for the Embedding LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "EMBEDDING_BASE_URL")] // No default, let adapters handle defaults if None
    pub embedding_base_url: Option<String>,

    /// API Key for the Embedding LLM provider (e.g., OpenAI)
    #[arg(long, env = "EMBEDDING_API_KEY", default_value = "")]
    pub embedding_api_key: String,

    /// Model name for text embedding; must match the model the vector store was built with
    #[arg(long, env = "EMBEDDING_MODEL")] // No default, rely on adapter defaults if None
    pub embedding_model: Option<String>,
}

impl Args {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.model_folder.join("hf_checkpoint")
    }
}
