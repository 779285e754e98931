use async_trait::async_trait;
use candle_core::{ DType, Device, Tensor, D };
use candle_nn::VarBuilder;
use candle_transformers::generation::{ LogitsProcessor, Sampling };
use candle_transformers::models::llama::{ Cache, Config, Llama, LlamaConfig, LlamaEosToks };
use hf_hub::api::sync::Api;
use log::{ debug, info };
use std::collections::BTreeSet;
use std::error::Error as StdError;
use std::fs;
use std::path::{ Path, PathBuf };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use tokenizers::Tokenizer;

use super::beam::{ beam_search, BeamScorer };
use super::device::DeviceSpec;
use super::{ create_blocking_stream, GenerationError, GenerationRequest, LanguageModel, TextStream };

#[derive(Debug, Clone)]
pub struct LlamaOptions {
    pub device: DeviceSpec,
    pub dtype: Option<DType>,
    /// Local `tokenizer.json` or a hub repo id; defaults to the checkpoint's own file.
    pub tokenizer: Option<String>,
    pub seed: u64,
    pub context_len: usize,
    pub stream_interval: usize,
}

impl Default for LlamaOptions {
    fn default() -> Self {
        Self {
            device: DeviceSpec::Cuda(0),
            dtype: None,
            tokenizer: None,
            seed: 42,
            context_len: 2048,
            stream_interval: 2,
        }
    }
}

struct LlamaInner {
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos: Vec<u32>,
    context_len: usize,
    stream_interval: usize,
    seed: u64,
    requests: AtomicU64,
}

/// Llama-family causal LM loaded from a HuggingFace-format checkpoint directory.
#[derive(Clone)]
pub struct LlamaModel {
    inner: Arc<LlamaInner>,
}

fn read_file(path: &Path) -> Result<Vec<u8>, GenerationError> {
    fs::read(path).map_err(|source| GenerationError::Checkpoint {
        path: path.display().to_string(),
        source,
    })
}

fn safetensor_files(checkpoint: &Path) -> Result<Vec<PathBuf>, GenerationError> {
    let index_path = checkpoint.join("model.safetensors.index.json");
    if !index_path.exists() {
        return Ok(vec![checkpoint.join("model.safetensors")]);
    }
    let index: serde_json::Value = serde_json::from_slice(&read_file(&index_path)?)?;
    let shards: BTreeSet<String> = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .map(|m| {
            m.values()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if shards.is_empty() {
        return Err(GenerationError::Checkpoint {
            path: index_path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "weight_map is empty"),
        });
    }
    Ok(
        shards
            .into_iter()
            .map(|shard| checkpoint.join(shard))
            .collect()
    )
}

fn load_tokenizer(checkpoint: &Path, source: Option<&str>) -> Result<Tokenizer, GenerationError> {
    let path = match source {
        None => checkpoint.join("tokenizer.json"),
        Some(s) if Path::new(s).exists() => PathBuf::from(s),
        Some(repo_id) => {
            info!("Fetching tokenizer.json from hub repo: {}", repo_id);
            let api = Api::new().map_err(|e| GenerationError::Tokenizer(e.to_string()))?;
            api
                .model(repo_id.to_string())
                .get("tokenizer.json")
                .map_err(|e| GenerationError::Tokenizer(e.to_string()))?
        }
    };
    Tokenizer::from_file(&path).map_err(|e|
        GenerationError::Tokenizer(format!("{}: {}", path.display(), e))
    )
}

/// Byte offset of the last `stop` occurring at or after character `from_char`.
fn rfind_after(text: &str, stop: &str, from_char: usize) -> Option<usize> {
    let start = text
        .char_indices()
        .nth(from_char)
        .map(|(b, _)| b)?;
    text[start..].rfind(stop).map(|pos| start + pos)
}

fn sampling_for(request: &GenerationRequest) -> Sampling {
    let temperature = request.temperature();
    if temperature < 1e-4 {
        return Sampling::ArgMax;
    }
    let k = request.top_k();
    let p = request.top_p();
    match (k > 0, p < 1.0) {
        (true, true) => Sampling::TopKThenTopP { k, p, temperature },
        (true, false) => Sampling::TopK { k, temperature },
        (false, true) => Sampling::TopP { p, temperature },
        (false, false) => Sampling::All { temperature },
    }
}

impl LlamaModel {
    pub fn load(checkpoint: &Path, options: &LlamaOptions) -> Result<Self, GenerationError> {
        let device = options.device.to_device()?;
        let dtype = options.dtype.unwrap_or_else(|| options.device.default_dtype());
        info!("Loading checkpoint {} on {} ({:?})", checkpoint.display(), options.device, dtype);

        let llama_config: LlamaConfig = serde_json::from_slice(
            &read_file(&checkpoint.join("config.json"))?
        )?;
        let config = llama_config.into_config(false);
        let weights = safetensor_files(checkpoint)?;
        for file in &weights {
            if !file.exists() {
                return Err(GenerationError::Checkpoint {
                    path: file.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing weights"),
                });
            }
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)? };
        let model = Llama::load(vb, &config)?;
        let tokenizer = load_tokenizer(checkpoint, options.tokenizer.as_deref())?;

        let eos = match &config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => tokenizer.token_to_id("</s>").into_iter().collect(),
        };
        info!("Loaded {} weight file(s), eos tokens {:?}", weights.len(), eos);

        Ok(Self {
            inner: Arc::new(LlamaInner {
                model,
                config,
                tokenizer,
                device,
                dtype,
                eos,
                context_len: options.context_len,
                stream_interval: options.stream_interval.max(1),
                seed: options.seed,
                requests: AtomicU64::new(0),
            }),
        })
    }
}

impl LlamaInner {
    fn encode(&self, request: &GenerationRequest) -> Result<Vec<u32>, GenerationError> {
        let encoding = self.tokenizer
            .encode(request.prompt(), true)
            .map_err(|e| GenerationError::Tokenizer(e.to_string()))?;
        let mut tokens = encoding.get_ids().to_vec();
        let max_src_len = self.context_len.saturating_sub(request.max_new_tokens() + 8);
        if max_src_len > 0 && tokens.len() > max_src_len {
            debug!("Truncating prompt from {} to {} tokens", tokens.len(), max_src_len);
            tokens.drain(..tokens.len() - max_src_len);
        }
        if tokens.is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }
        Ok(tokens)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, GenerationError> {
        self.tokenizer.decode(tokens, true).map_err(|e| GenerationError::Tokenizer(e.to_string()))
    }

    fn new_cache(&self) -> Result<Cache, GenerationError> {
        Ok(Cache::new(true, self.dtype, &self.config, &self.device)?)
    }

    fn forward_last(
        &self,
        cache: &mut Cache,
        index_pos: usize,
        tokens: &[u32]
    ) -> Result<Tensor, GenerationError> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, index_pos, cache)?;
        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?)
    }

    /// Token-by-token sampling. `emit` receives each cumulative snapshot and
    /// returns false once nobody is listening.
    fn sample<F>(&self, request: &GenerationRequest, mut emit: F) -> Result<String, GenerationError>
        where F: FnMut(&str) -> bool
    {
        let mut tokens = self.encode(request)?;
        let prompt_chars = request.prompt().chars().count();
        let seed = self.seed.wrapping_add(self.requests.fetch_add(1, Ordering::Relaxed));
        let mut logits_processor = LogitsProcessor::from_sampling(seed, sampling_for(request));
        let mut cache = self.new_cache()?;
        let mut index_pos = 0;
        let mut output = self.decode(&tokens)?;
        let max_new_tokens = request.max_new_tokens();

        for step in 0..max_new_tokens {
            let context = if step == 0 { &tokens[..] } else { &tokens[tokens.len() - 1..] };
            let logits = self.forward_last(&mut cache, index_pos, context)?;
            index_pos += context.len();

            let next = logits_processor.sample(&logits)?;
            tokens.push(next);
            let mut stopped = self.eos.contains(&next);

            if step % self.stream_interval == 0 || step + 1 == max_new_tokens || stopped {
                output = self.decode(&tokens)?;
                if let Some(stop) = request.stop() {
                    if let Some(pos) = rfind_after(&output, stop, prompt_chars) {
                        output.truncate(pos);
                        stopped = true;
                    }
                }
                if !emit(&output) {
                    debug!("Snapshot receiver dropped, ending generation at step {}", step);
                    break;
                }
            }
            if stopped {
                break;
            }
        }
        Ok(output)
    }

    fn beam(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let prompt = self.encode(request)?;
        let cache = self.new_cache()?;
        let generated = beam_search(
            self,
            (cache, 0),
            &prompt,
            request.num_beams(),
            request.max_new_tokens(),
            &self.eos
        )?;
        let mut all = prompt;
        all.extend(generated);
        self.decode(&all)
    }

    fn generate_full(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        if request.num_beams() > 1 {
            self.beam(request)
        } else {
            self.sample(request, |_| true)
        }
    }
}

impl BeamScorer for LlamaInner {
    type State = (Cache, usize);

    fn next_log_probs(
        &self,
        state: &mut Self::State,
        tokens: &[u32]
    ) -> Result<Vec<f32>, GenerationError> {
        let (cache, index_pos) = state;
        let logits = self.forward_last(cache, *index_pos, tokens)?;
        *index_pos += tokens.len();
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok(log_probs.to_vec1::<f32>()?)
    }
}

#[async_trait]
impl LanguageModel for LlamaModel {
    async fn generate(
        &self,
        request: GenerationRequest
    ) -> Result<String, Box<dyn StdError + Send + Sync>> {
        let inner = Arc::clone(&self.inner);
        let output = tokio::task::spawn_blocking(move || inner.generate_full(&request)).await
            .map_err(|e| GenerationError::Worker(e.to_string()))??;
        Ok(output)
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest
    ) -> Result<TextStream, Box<dyn StdError + Send + Sync>> {
        let inner = Arc::clone(&self.inner);
        Ok(
            create_blocking_stream(move |tx| {
                let result = inner.sample(&request, |snapshot| {
                    tx.blocking_send(Ok(snapshot.to_string())).is_ok()
                });
                if let Err(e) = result {
                    let _ = tx.blocking_send(Err(Box::new(e) as _));
                }
            })
        )
    }
}
