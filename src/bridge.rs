//! One-shot request loop shared by both adapter binaries.
//!
//! Reads a single JSON request from the input, hands it to an engine
//! handler, and writes exactly one JSON line to the output. Diagnostics
//! go through `tracing`; the output stream carries nothing but the
//! response line.

use std::io::{Read, Write};
use std::time::Instant;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::protocol::{self, InferenceRequest, InferenceResponse};

/// Exit code for a completed request.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for any failure; the failure is also reported on the
/// output stream as a response line.
pub const EXIT_FAILURE: i32 = 1;

/// Run one request end to end and return the process exit code.
///
/// `handler` performs the actual inference. Any error it returns is
/// collapsed, context chain included, into the error string of the
/// failure response.
pub fn run<R, W, F>(input: R, mut output: W, handler: F) -> i32
where
    R: Read,
    W: Write,
    F: FnOnce(&InferenceRequest) -> anyhow::Result<String>,
{
    let invocation_id = Uuid::new_v4().to_string();
    let start = Instant::now();

    let request = match protocol::read_request(input) {
        Ok(request) => request,
        Err(e) => {
            error!(invocation_id = invocation_id, error = %e, "Rejected request");
            return write_failure(&mut output, &e.to_string());
        }
    };

    info!(
        invocation_id = invocation_id,
        model = %request.model_path,
        prompt_chars = request.prompt.len(),
        max_tokens = request.max_tokens,
        "Handling inference request"
    );

    match handler(&request) {
        Ok(result) => {
            let response = InferenceResponse::success(result);
            if let Err(e) = protocol::write_response(&mut output, &response) {
                error!(invocation_id = invocation_id, error = %e, "Failed to write response");
                return EXIT_FAILURE;
            }
            info!(
                invocation_id = invocation_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Inference complete"
            );
            EXIT_SUCCESS
        }
        Err(e) => {
            let message = format!("{e:#}");
            warn!(invocation_id = invocation_id, error = %message, "Inference failed");
            write_failure(&mut output, &message)
        }
    }
}

/// Emit a failure response line; the exit code is failure either way.
fn write_failure<W: Write>(output: &mut W, message: &str) -> i32 {
    let response = InferenceResponse::failure(message);
    if let Err(e) = protocol::write_response(output, &response) {
        error!(error = %e, "Failed to write failure response");
    }
    EXIT_FAILURE
}
