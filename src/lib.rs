//! infer-bridge: one-shot subprocess adapters for local LLM inference.
//!
//! Ships two binaries that bridge an editor extension to local inference
//! backends over a stdin/stdout JSON contract:
//!   - `llama-inference`: loads a quantized GGUF model via llama.cpp
//!   - `metal-inference`: loads a fixed base model combined with a
//!     fine-tuned adapter directory on Apple silicon
//!
//! Each invocation reads one JSON request from stdin, performs a single
//! generation call, writes exactly one JSON response line to stdout, and
//! exits 0 on success or 1 on failure. Diagnostics go to stderr only.

pub mod backend;
pub mod bridge;
pub mod protocol;
pub mod stop;
