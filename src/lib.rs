pub mod agent;
pub mod models;
pub mod console;
pub mod config;
pub mod llm;
pub mod cli;
pub mod rag;

use agent::{ ChatSettings, CodeAgent };
use cli::Args;
use config::template::load_template;
use console::ConsoleChatIo;
use llm::embedding::new_client as new_embedding_client;
use llm::generation::device::{ parse_dtype, DeviceSpec };
use llm::generation::llama::{ LlamaModel, LlamaOptions };
use llm::{ LlmConfig, LlmType };
use log::info;
use rag::store::open_vector_store;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Model Folder: {}", args.model_folder.display());
    info!("Device: {}", args.device);
    info!("Vector Store: {}", args.vector_store.display());
    info!("Vector Store Load: {:?}", args.vector_store_load);
    info!("Embedding LLM Type: {}", args.embedding_llm_type);
    info!("Mode: {}", if args.query.is_some() { "batch" } else { "chat" });
    info!("-------------------------");

    let device: DeviceSpec = args.device.parse()?;
    let dtype = args.dtype.as_deref().map(parse_dtype).transpose()?;
    let template = load_template(args.conv_template.as_deref())?;

    let embedding_config = LlmConfig {
        llm_type: args.embedding_llm_type
            .parse::<LlmType>()
            .map_err(|e| format!("Invalid embedding LLM type: {}", e))?,
        base_url: args.embedding_base_url.clone(),
        api_key: Some(args.embedding_api_key.clone()).filter(|k| !k.is_empty()),
        embedding_model: args.embedding_model.clone(),
    };
    let embedding_client = new_embedding_client(&embedding_config)?;
    info!(
        "Embedding client configured: Type={}, Model={:?}, BaseURL={:?}",
        args.embedding_llm_type,
        embedding_config.embedding_model.as_deref().unwrap_or("adapter default"),
        embedding_config.base_url.as_deref().unwrap_or("adapter default")
    );
    let vector_store = open_vector_store(
        &args.vector_store,
        embedding_client,
        args.vector_store_load
    )?;

    let options = LlamaOptions {
        device,
        dtype,
        tokenizer: args.tokenizer.clone(),
        seed: args.seed,
        context_len: args.context_len,
        stream_interval: args.stream_interval,
    };
    let checkpoint = args.checkpoint_dir();
    let model = tokio::task::spawn_blocking(move || LlamaModel::load(&checkpoint, &options)).await??;

    let settings = ChatSettings {
        temperature: args.temperature,
        max_new_tokens: args.max_new_tokens,
        debug: args.debug,
    };
    let agent = CodeAgent::new(Arc::new(model), vector_store, template, settings);

    match &args.query {
        Some(query) => {
            let answer = agent.batch_inference(query).await?;
            println!("{}", answer);
        }
        None => {
            let mut io = ConsoleChatIo::stdio();
            agent.chat_loop(&mut io).await?;
        }
    }

    Ok(())
}
