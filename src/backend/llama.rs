//! GGUF model engine backed by llama.cpp.
//!
//! Loads a quantized model file and performs a single generation pass
//! with a fixed 2048-token context window, requesting full GPU offload.
//! The library falls back to CPU when no accelerator is available.
//!
//! Without the `llamacpp` feature this module compiles a stub engine
//! that performs the same validation, stop handling, and whitespace
//! stripping but simulates the library calls.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

#[cfg(feature = "llamacpp")]
use tracing::debug;
use tracing::info;

use crate::protocol::InferenceRequest;
use crate::stop;

use super::{expand_model_path, BackendError, Completion, CompletionBackend, GenerationRequest};

/// Fixed context window for every invocation, in tokens.
pub const CONTEXT_SIZE: u32 = 2048;

/// Stop sequences passed into the engine; generation halts at any of them.
pub const STOP_SEQUENCES: &[&str] = &["<|user|>", "<|end|>", "<|endoftext|>", "\n\n"];

/// Magic bytes at the start of every GGUF file.
const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Sampling temperature for the real engine.
#[cfg(feature = "llamacpp")]
const TEMPERATURE: f32 = 0.8;

/// Fixed sampler seed so repeated invocations stay reproducible.
#[cfg(feature = "llamacpp")]
const SAMPLER_SEED: u32 = 1234;

/// Model load parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Number of GPU layers to offload (-1 = all).
    pub n_gpu_layers: i32,

    /// Use memory mapping for the model file.
    pub use_mmap: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: -1, // all layers
            use_mmap: true,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: CONTEXT_SIZE,
            n_batch: 512,
        }
    }
}

/// One-shot GGUF completion engine.
#[derive(Debug)]
pub struct LlamaEngine {
    /// Resolved model file path.
    model_path: PathBuf,

    model_params: ModelParams,
    context_params: ContextParams,
}

impl LlamaEngine {
    /// Validate the model file and prepare an engine for it.
    ///
    /// The file must exist and carry the GGUF magic; the model itself is
    /// loaded on the completion call.
    pub fn open(model_path: &str) -> Result<Self, BackendError> {
        let path = expand_model_path(model_path);
        let file_size = validate_gguf(&path)?;

        info!(
            model = %path.display(),
            file_size,
            "GGUF model file validated"
        );

        Ok(Self {
            model_path: path,
            model_params: ModelParams::default(),
            context_params: ContextParams::default(),
        })
    }

    /// Path the engine will load from.
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

/// The engine-side stop list in the owned form generation requests carry.
pub fn stop_strings() -> Vec<String> {
    STOP_SEQUENCES.iter().map(|s| s.to_string()).collect()
}

/// Handle one parsed request end to end: open the model file, generate
/// with the engine-side stop list, return the stripped completion text.
pub fn handle_request(request: &InferenceRequest) -> anyhow::Result<String> {
    let mut engine = LlamaEngine::open(&request.model_path)?;

    let generation = GenerationRequest {
        prompt: request.prompt.clone(),
        max_tokens: request.max_tokens,
        stop: stop_strings(),
    };

    let completion = engine.complete(&generation)?;

    info!(
        prompt_tokens = completion.prompt_tokens,
        completion_tokens = completion.completion_tokens,
        "Generation complete"
    );

    Ok(completion.text)
}

fn validate_gguf(path: &Path) -> Result<u64, BackendError> {
    if !path.exists() {
        return Err(BackendError::ModelNotFound(path.display().to_string()));
    }

    let metadata = std::fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(BackendError::InvalidFormat(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || &magic != GGUF_MAGIC {
        return Err(BackendError::InvalidFormat(format!(
            "{} does not start with the GGUF magic",
            path.display()
        )));
    }

    Ok(metadata.len())
}

impl CompletionBackend for LlamaEngine {
    fn complete(&mut self, request: &GenerationRequest) -> Result<Completion, BackendError> {
        #[cfg(feature = "llamacpp")]
        {
            self.complete_llamacpp(request)
        }

        #[cfg(not(feature = "llamacpp"))]
        {
            self.complete_stub(request)
        }
    }
}

#[cfg(not(feature = "llamacpp"))]
impl LlamaEngine {
    /// Stub generation: placeholder tokens through the same stop handling
    /// and whitespace stripping as the real decode loop.
    fn complete_stub(&mut self, request: &GenerationRequest) -> Result<Completion, BackendError> {
        let mut completion = super::stub_completion(request);
        stop::truncate_at_stop_sequence(&mut completion.text, &request.stop);
        completion.text = completion.text.trim().to_string();
        Ok(completion)
    }
}

// ─── Real Engine (llama.cpp bindings) ──────────────────────────────────────

/// Process-wide llama.cpp backend; the library allows one per process.
#[cfg(feature = "llamacpp")]
static LLAMA_BACKEND: std::sync::OnceLock<llama_cpp_2::llama_backend::LlamaBackend> =
    std::sync::OnceLock::new();

#[cfg(feature = "llamacpp")]
fn backend_handle() -> Result<&'static llama_cpp_2::llama_backend::LlamaBackend, BackendError> {
    if let Some(backend) = LLAMA_BACKEND.get() {
        return Ok(backend);
    }

    // Route llama.cpp's own stderr chatter into the void before init.
    suppress_llama_logging();

    let backend = llama_cpp_2::llama_backend::LlamaBackend::init()
        .map_err(|e| BackendError::LoadFailed(format!("llama.cpp backend init failed: {e:?}")))?;
    let _ = LLAMA_BACKEND.set(backend);

    LLAMA_BACKEND
        .get()
        .ok_or_else(|| BackendError::LoadFailed("llama.cpp backend unavailable".to_string()))
}

/// Silence llama.cpp's default logging through its C log hook.
#[cfg(feature = "llamacpp")]
fn suppress_llama_logging() {
    unsafe {
        unsafe extern "C" fn void_log(
            _level: std::ffi::c_int,
            _text: *const std::os::raw::c_char,
            _user_data: *mut std::os::raw::c_void,
        ) {
        }
        extern "C" {
            fn llama_log_set(
                log_callback: Option<
                    unsafe extern "C" fn(
                        std::ffi::c_int,
                        *const std::os::raw::c_char,
                        *mut std::os::raw::c_void,
                    ),
                >,
                user_data: *mut std::os::raw::c_void,
            );
        }
        llama_log_set(Some(void_log), std::ptr::null_mut());
    }
}

#[cfg(feature = "llamacpp")]
impl LlamaEngine {
    fn complete_llamacpp(
        &mut self,
        request: &GenerationRequest,
    ) -> Result<Completion, BackendError> {
        use std::num::NonZeroU32;

        use llama_cpp_2::context::params::LlamaContextParams;
        use llama_cpp_2::llama_batch::LlamaBatch;
        use llama_cpp_2::model::params::LlamaModelParams;
        use llama_cpp_2::model::{AddBos, LlamaModel, Special};
        use llama_cpp_2::sampling::LlamaSampler;

        let backend = backend_handle()?;

        // llama.cpp clamps the offload count to the model's layer count,
        // so any large value requests every layer.
        let n_gpu_layers = if self.model_params.n_gpu_layers < 0 {
            99
        } else {
            self.model_params.n_gpu_layers as u32
        };
        let model_params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);

        debug!(gpu_layers = n_gpu_layers, "Loading GGUF model");
        let model = LlamaModel::load_from_file(backend, &self.model_path, &model_params)
            .map_err(|e| BackendError::LoadFailed(format!("{e:?}")))?;

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.context_params.n_ctx))
            .with_n_batch(self.context_params.n_batch.max(self.context_params.n_ctx));

        let mut ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| BackendError::LoadFailed(format!("Context creation failed: {e:?}")))?;

        let tokens = model
            .str_to_token(&request.prompt, AddBos::Always)
            .map_err(|e| BackendError::GenerationFailed(format!("Tokenization failed: {e:?}")))?;
        let prompt_tokens = tokens.len();
        debug!(prompt_tokens, "Tokenized prompt");

        let n_ctx = ctx.n_ctx() as usize;
        if prompt_tokens >= n_ctx {
            return Err(BackendError::GenerationFailed(format!(
                "Prompt occupies {prompt_tokens} tokens, context holds {n_ctx}"
            )));
        }

        let mut batch = LlamaBatch::new(std::cmp::max(512, prompt_tokens), 1);
        let last_index = prompt_tokens as i32 - 1;
        for (i, token) in (0_i32..).zip(tokens.into_iter()) {
            batch
                .add(token, i, &[0], i == last_index)
                .map_err(|e| BackendError::GenerationFailed(format!("Batch add failed: {e:?}")))?;
        }

        ctx.decode(&mut batch)
            .map_err(|e| BackendError::GenerationFailed(format!("Prompt decode failed: {e:?}")))?;

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::temp(TEMPERATURE),
            LlamaSampler::dist(SAMPLER_SEED),
        ]);

        let mut generated = String::new();
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut completion_tokens = 0;
        let mut position = prompt_tokens as i32;

        for _ in 0..request.max_tokens {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);

            if model.is_eog_token(token) {
                debug!(completion_tokens, "End-of-generation token");
                break;
            }

            // A token may end mid-character, so decode incrementally.
            let token_bytes = model.token_to_bytes(token, Special::Tokenize).map_err(|e| {
                BackendError::GenerationFailed(format!("Token decode failed: {e:?}"))
            })?;
            let mut piece = String::with_capacity(32);
            let _ = decoder.decode_to_string(&token_bytes, &mut piece, false);
            generated.push_str(&piece);
            completion_tokens += 1;

            if stop::find_stop_sequence(&generated, &request.stop).is_some() {
                debug!(completion_tokens, "Stop sequence reached");
                break;
            }

            if position as usize + 1 >= n_ctx {
                debug!(completion_tokens, "Context window exhausted");
                break;
            }

            batch.clear();
            batch
                .add(token, position, &[0], true)
                .map_err(|e| BackendError::GenerationFailed(format!("Batch add failed: {e:?}")))?;
            position += 1;

            ctx.decode(&mut batch)
                .map_err(|e| BackendError::GenerationFailed(format!("Decode failed: {e:?}")))?;
        }

        stop::truncate_at_stop_sequence(&mut generated, &request.stop);

        Ok(Completion {
            text: generated.trim().to_string(),
            prompt_tokens,
            completion_tokens,
        })
    }
}
