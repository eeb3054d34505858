//! Base-plus-adapter engine for Apple silicon.
//!
//! The request's model path names a fine-tuned adapter directory, never a
//! full model: every invocation combines it with the fixed [`BASE_MODEL`]
//! checkpoint, fetched from the Hugging Face hub on first use. After
//! generation the adapter strips the text, cuts it at the earliest
//! sentinel, and strips the remainder; the engine itself receives no
//! stop list.
//!
//! Without the `metal` feature this module compiles a stub engine that
//! performs the same validation but simulates generation.

use std::path::{Path, PathBuf};

use tracing::info;
#[cfg(feature = "metal")]
use tracing::{debug, warn};

use crate::protocol::InferenceRequest;
use crate::stop;

use super::{expand_model_path, BackendError, Completion, CompletionBackend, GenerationRequest};

/// Base model every adapter is applied to.
pub const BASE_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";

/// Sentinels trimmed from finished completions.
pub const STOP_SEQUENCES: &[&str] =
    &["<|user|>", "<|end|>", "<|endoftext|>", "<|im_end|>", "\n\n"];

/// Sampler seed; decoding is greedy so this only seeds the processor.
#[cfg(feature = "metal")]
const SAMPLER_SEED: u64 = 299792458;

/// One-shot base-plus-adapter completion engine.
#[derive(Debug)]
pub struct MetalEngine {
    /// Resolved adapter directory.
    adapter_path: PathBuf,
}

impl MetalEngine {
    /// Validate the adapter directory and prepare an engine for it.
    ///
    /// The base model is fixed; only the adapter location varies per
    /// invocation. Loading happens on the completion call.
    pub fn open(adapter_path: &str) -> Result<Self, BackendError> {
        let path = expand_model_path(adapter_path);

        if !path.exists() {
            return Err(BackendError::ModelNotFound(path.display().to_string()));
        }
        if !path.is_dir() {
            return Err(BackendError::InvalidFormat(format!(
                "{} is not an adapter directory",
                path.display()
            )));
        }

        info!(
            base_model = BASE_MODEL,
            adapter = %path.display(),
            "Adapter directory validated"
        );

        Ok(Self { adapter_path: path })
    }

    /// Adapter directory the engine combines with the base model.
    pub fn adapter_path(&self) -> &Path {
        &self.adapter_path
    }
}

/// The sentinel list in the owned form the trim helpers take.
pub fn stop_strings() -> Vec<String> {
    STOP_SEQUENCES.iter().map(|s| s.to_string()).collect()
}

/// Strip raw engine output, cut it at the earliest sentinel, then strip
/// the remainder.
pub fn postprocess(raw: &str) -> String {
    stop::trim_completion(raw, &stop_strings())
}

/// Handle one parsed request end to end: validate the adapter directory,
/// generate against the fixed base model, trim and strip the result.
pub fn handle_request(request: &InferenceRequest) -> anyhow::Result<String> {
    let mut engine = MetalEngine::open(&request.model_path)?;

    // No engine-side stop list; sentinels are trimmed from the finished
    // text below.
    let generation = GenerationRequest {
        prompt: request.prompt.clone(),
        max_tokens: request.max_tokens,
        stop: Vec::new(),
    };

    let completion = engine.complete(&generation)?;

    info!(
        prompt_tokens = completion.prompt_tokens,
        completion_tokens = completion.completion_tokens,
        "Generation complete"
    );

    Ok(postprocess(&completion.text))
}

impl CompletionBackend for MetalEngine {
    fn complete(&mut self, request: &GenerationRequest) -> Result<Completion, BackendError> {
        #[cfg(feature = "metal")]
        {
            self.complete_metal(request)
        }

        #[cfg(not(feature = "metal"))]
        {
            self.complete_stub(request)
        }
    }
}

#[cfg(not(feature = "metal"))]
impl MetalEngine {
    /// Stub generation: raw placeholder text. Post-processing belongs to
    /// the adapter, not the engine, so nothing is trimmed here.
    fn complete_stub(&mut self, request: &GenerationRequest) -> Result<Completion, BackendError> {
        Ok(super::stub_completion(request))
    }
}

// ─── Real Engine (candle) ──────────────────────────────────────────────────

#[cfg(feature = "metal")]
impl MetalEngine {
    fn complete_metal(&mut self, request: &GenerationRequest) -> Result<Completion, BackendError> {
        let loaded = load_base_with_adapter(&self.adapter_path)
            .map_err(|e| BackendError::LoadFailed(format!("{e:#}")))?;
        generate(loaded, request)
            .map_err(|e| BackendError::GenerationFailed(format!("{e:#}")))
    }
}

#[cfg(feature = "metal")]
struct LoadedModel {
    model: candle_transformers::models::qwen2::ModelForCausalLM,
    tokenizer: tokenizers::Tokenizer,
    device: candle_core::Device,
}

#[cfg(feature = "metal")]
struct BaseSnapshot {
    config: PathBuf,
    tokenizer: PathBuf,
    shards: Vec<PathBuf>,
}

/// Fetch the base model files from the Hugging Face hub cache,
/// downloading on first use.
#[cfg(feature = "metal")]
fn fetch_base_snapshot() -> anyhow::Result<BaseSnapshot> {
    use anyhow::{anyhow, Context};

    let api = hf_hub::api::sync::Api::new().context("Hub API init failed")?;
    let repo = api.model(BASE_MODEL.to_string());

    let config = repo.get("config.json").context("Fetching config.json")?;
    let tokenizer = repo
        .get("tokenizer.json")
        .context("Fetching tokenizer.json")?;

    let index_path = repo
        .get("model.safetensors.index.json")
        .context("Fetching safetensors index")?;
    let index: serde_json::Value = serde_json::from_slice(&std::fs::read(&index_path)?)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("Safetensors index has no weight_map"))?;

    let mut shard_names: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    shard_names.sort_unstable();
    shard_names.dedup();

    let mut shards = Vec::with_capacity(shard_names.len());
    for name in shard_names {
        shards.push(repo.get(name).with_context(|| format!("Fetching {name}"))?);
    }

    Ok(BaseSnapshot {
        config,
        tokenizer,
        shards,
    })
}

#[cfg(feature = "metal")]
fn load_base_with_adapter(adapter_dir: &Path) -> anyhow::Result<LoadedModel> {
    use anyhow::{anyhow, Context};
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use candle_transformers::models::qwen2::{Config as QwenConfig, ModelForCausalLM};
    use tokenizers::Tokenizer;

    let device = if candle_core::utils::metal_is_available() {
        Device::new_metal(0)?
    } else {
        Device::Cpu
    };
    debug!(?device, "Selected device");

    let snapshot = fetch_base_snapshot()?;

    let tokenizer =
        Tokenizer::from_file(&snapshot.tokenizer).map_err(|e| anyhow!("Tokenizer error: {e}"))?;

    let config: QwenConfig = serde_json::from_slice(&std::fs::read(&snapshot.config)?)
        .context("Malformed base model config.json")?;

    // Load every base shard, then fold the adapter deltas in.
    let mut weights = std::collections::HashMap::new();
    for shard in &snapshot.shards {
        let tensors = candle_core::safetensors::load(shard, &device)?;
        weights.extend(tensors);
    }

    apply_lora(&mut weights, adapter_dir, &device)?;

    let vb = VarBuilder::from_tensors(weights, DType::F16, &device);
    let model = ModelForCausalLM::new(&config, vb)?;

    info!(
        base_model = BASE_MODEL,
        adapter = %adapter_dir.display(),
        "Base model and adapter loaded"
    );

    Ok(LoadedModel {
        model,
        tokenizer,
        device,
    })
}

#[cfg(feature = "metal")]
enum LoraHalf {
    A,
    B,
}

/// Map an adapter tensor name to the base weight it modifies.
///
/// Accepts both PEFT naming (`...lora_A.weight`, optionally under a
/// `base_model.model.` prefix) and MLX naming (`...lora_a`).
#[cfg(feature = "metal")]
fn lora_target(name: &str) -> Option<(String, LoraHalf)> {
    let name = name.strip_prefix("base_model.model.").unwrap_or(name);

    for (suffix, half) in [
        (".lora_A.weight", LoraHalf::A),
        (".lora_B.weight", LoraHalf::B),
        (".lora_a", LoraHalf::A),
        (".lora_b", LoraHalf::B),
    ] {
        if let Some(base) = name.strip_suffix(suffix) {
            return Some((format!("{base}.weight"), half));
        }
    }
    None
}

/// Locate the adapter weights file inside the adapter directory.
#[cfg(feature = "metal")]
fn find_adapter_weights(adapter_dir: &Path) -> Option<PathBuf> {
    for name in ["adapters.safetensors", "adapter_model.safetensors"] {
        let candidate = adapter_dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// LoRA scaling factor alpha/r from adapter_config.json, defaulting to 1.
#[cfg(feature = "metal")]
fn adapter_scale(adapter_dir: &Path) -> f64 {
    let path = adapter_dir.join("adapter_config.json");
    let Ok(data) = std::fs::read(&path) else {
        return 1.0;
    };
    let Ok(config) = serde_json::from_slice::<serde_json::Value>(&data) else {
        return 1.0;
    };

    match (config["lora_alpha"].as_f64(), config["r"].as_f64()) {
        (Some(alpha), Some(rank)) if rank > 0.0 => alpha / rank,
        _ => 1.0,
    }
}

/// Fold LoRA deltas from the adapter directory into the base weights:
/// W' = W + scale * (B @ A).
#[cfg(feature = "metal")]
fn apply_lora(
    weights: &mut std::collections::HashMap<String, candle_core::Tensor>,
    adapter_dir: &Path,
    device: &candle_core::Device,
) -> anyhow::Result<()> {
    use std::collections::HashMap;

    use anyhow::anyhow;
    use candle_core::{DType, Tensor};

    let adapter_file = find_adapter_weights(adapter_dir)
        .ok_or_else(|| anyhow!("No adapter weights found under {}", adapter_dir.display()))?;
    let adapter = candle_core::safetensors::load(&adapter_file, device)?;
    let scale = adapter_scale(adapter_dir);

    // Pair up the A and B halves per target weight.
    let mut pairs: HashMap<String, (Option<Tensor>, Option<Tensor>)> = HashMap::new();
    for (name, tensor) in adapter {
        let Some((target, half)) = lora_target(&name) else {
            continue;
        };
        let entry = pairs.entry(target).or_default();
        match half {
            LoraHalf::A => entry.0 = Some(tensor),
            LoraHalf::B => entry.1 = Some(tensor),
        }
    }

    if pairs.is_empty() {
        return Err(anyhow!(
            "{} holds no recognizable LoRA tensors",
            adapter_file.display()
        ));
    }

    let mut merged = 0usize;
    for (target, (a, b)) in pairs {
        let (Some(a), Some(b)) = (a, b) else {
            warn!(weight = %target, "Adapter tensor missing its A or B half, skipping");
            continue;
        };
        let Some(base) = weights.get(&target) else {
            warn!(weight = %target, "Adapter targets a weight the base model lacks, skipping");
            continue;
        };

        let delta = (b.to_dtype(DType::F32)?.matmul(&a.to_dtype(DType::F32)?)? * scale)?;
        let updated = (base.to_dtype(DType::F32)? + delta)?.to_dtype(DType::F16)?;
        weights.insert(target, updated);
        merged += 1;
    }

    info!(merged, scale, "Applied LoRA adapter");
    Ok(())
}

#[cfg(feature = "metal")]
fn generate(mut loaded: LoadedModel, request: &GenerationRequest) -> anyhow::Result<Completion> {
    use anyhow::anyhow;
    use candle_core::{DType, Tensor};
    use candle_transformers::generation::LogitsProcessor;

    let encoding = loaded
        .tokenizer
        .encode(request.prompt.as_str(), true)
        .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
    let mut tokens = encoding.get_ids().to_vec();
    let prompt_tokens = tokens.len();
    if tokens.is_empty() {
        return Err(anyhow!("Prompt produced no tokens"));
    }

    let eos = loaded
        .tokenizer
        .token_to_id("<|im_end|>")
        .or_else(|| loaded.tokenizer.token_to_id("<|endoftext|>"));

    // Temperature None makes the processor greedy.
    let mut processor = LogitsProcessor::new(SAMPLER_SEED, None, None);
    let mut output_ids: Vec<u32> = Vec::new();

    for index in 0..request.max_tokens {
        let context: &[u32] = if index == 0 {
            &tokens
        } else {
            &tokens[tokens.len() - 1..]
        };
        let offset = tokens.len() - context.len();

        let input = Tensor::new(context, &loaded.device)?.unsqueeze(0)?;
        let logits = loaded.model.forward(&input, offset)?;
        // Forward narrows to the last position: shape (1, 1, vocab).
        let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;

        let next = processor.sample(&logits)?;
        tokens.push(next);

        if Some(next) == eos {
            debug!(completion_tokens = output_ids.len(), "End-of-sequence token");
            break;
        }
        output_ids.push(next);
    }

    let completion_tokens = output_ids.len();
    let text = loaded
        .tokenizer
        .decode(&output_ids, false)
        .map_err(|e| anyhow!("Tokenizer decode error: {e}"))?;

    Ok(Completion {
        text,
        prompt_tokens,
        completion_tokens,
    })
}
