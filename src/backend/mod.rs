//! Inference backends.
//!
//! Both adapters talk to their inference libraries through the
//! [`CompletionBackend`] trait. Default builds compile stub engines that
//! perform all local validation and simulate generation deterministically;
//! the real engines are gated behind the `llamacpp` and `metal` features.

pub mod llama;
pub mod metal;
pub mod mock;

use std::path::PathBuf;

use thiserror::Error;

use crate::stop;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A single generation call against a loaded model.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Text to complete.
    pub prompt: String,

    /// Maximum number of tokens to generate.
    pub max_tokens: usize,

    /// Stop sequences the engine watches for during decoding. Empty when
    /// the adapter trims after generation instead.
    pub stop: Vec<String>,
}

/// The text produced by one generation call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated text, before any adapter post-processing.
    pub text: String,

    /// Number of tokens in the prompt.
    pub prompt_tokens: usize,

    /// Number of tokens generated.
    pub completion_tokens: usize,
}

/// One-shot completion seam between an adapter and its inference library.
pub trait CompletionBackend {
    /// Perform a single generation call.
    fn complete(&mut self, request: &GenerationRequest) -> Result<Completion, BackendError>;
}

/// Expand a leading `~` in a model path to the user home directory.
pub fn expand_model_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

/// Rough token count for a piece of text (~4 characters per token).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Deterministic placeholder generation shared by the stub engines.
///
/// Emits `token_0 token_1 ...` up to the request cap, breaking early when
/// a stop sequence appears, the way a real decode loop would.
pub fn stub_completion(request: &GenerationRequest) -> Completion {
    let prompt_tokens = estimate_tokens(&request.prompt);

    let mut text = String::new();
    let mut completion_tokens = 0;

    for i in 0..request.max_tokens {
        text.push_str(&format!("token_{i} "));
        completion_tokens += 1;

        if stop::find_stop_sequence(&text, &request.stop).is_some() {
            break;
        }
    }

    Completion {
        text,
        prompt_tokens,
        completion_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_expand_model_path_tilde() {
        if let Ok(home) = std::env::var("HOME") {
            let resolved = expand_model_path("~/models/code.gguf");
            assert_eq!(resolved, PathBuf::from(format!("{home}/models/code.gguf")));
        }
    }

    #[test]
    fn test_expand_model_path_absolute_unchanged() {
        let resolved = expand_model_path("/opt/models/code.gguf");
        assert_eq!(resolved, PathBuf::from("/opt/models/code.gguf"));
    }

    #[test]
    fn test_stub_completion_honors_cap() {
        let request = GenerationRequest {
            prompt: "hello".to_string(),
            max_tokens: 3,
            stop: Vec::new(),
        };
        let completion = stub_completion(&request);
        assert_eq!(completion.text, "token_0 token_1 token_2 ");
        assert_eq!(completion.completion_tokens, 3);
        assert_eq!(completion.prompt_tokens, 1);
    }

    #[test]
    fn test_stub_completion_breaks_on_stop() {
        let request = GenerationRequest {
            prompt: "hello".to_string(),
            max_tokens: 100,
            stop: vec!["token_2".to_string()],
        };
        let completion = stub_completion(&request);
        // Generation stops once the stop sequence has been produced.
        assert_eq!(completion.completion_tokens, 3);
        assert!(completion.text.contains("token_2"));
    }
}
