//! Wire protocol for the one-shot inference adapters.
//!
//! Each adapter invocation reads a single JSON object from stdin:
//!
//! ```json
//! {"modelPath": "~/models/code.gguf", "prompt": "fn main", "maxTokens": 100}
//! ```
//!
//! and writes a single JSON line to stdout, either
//! `{"success": true, "result": "..."}` or
//! `{"success": false, "error": "..."}`.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid request JSON: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Inference request, one per process invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    /// Model location: a GGUF file for `llama-inference`, a fine-tuned
    /// adapter directory for `metal-inference`. A leading `~` is expanded
    /// to the user home directory.
    pub model_path: String,

    /// Text to complete.
    pub prompt: String,

    /// Generation length cap in tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_max_tokens() -> usize {
    100
}

/// Inference response: exactly one JSON line on stdout per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InferenceResponse {
    Success { success: bool, result: String },
    Failure { success: bool, error: String },
}

impl InferenceResponse {
    pub fn success(result: impl Into<String>) -> Self {
        Self::Success {
            success: true,
            result: result.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            success: false,
            error: error.into(),
        }
    }
}

/// Read the entire input to EOF and parse it as one request.
pub fn read_request<R: Read>(mut reader: R) -> Result<InferenceRequest, ProtocolError> {
    let mut buffer = String::new();
    reader.read_to_string(&mut buffer)?;
    let request = serde_json::from_str(&buffer)?;
    Ok(request)
}

/// Serialize a response as a single newline-terminated JSON line and flush it.
pub fn write_response<W: Write>(
    writer: &mut W,
    response: &InferenceResponse,
) -> Result<(), ProtocolError> {
    let line = serde_json::to_string(response)?;
    writeln!(writer, "{line}")?;
    writer.flush()?;
    Ok(())
}
