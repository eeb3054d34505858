//! CPU/CUDA inference adapter over GGUF models.
//!
//! Reads one JSON request from stdin, runs one completion against the
//! GGUF model named in the request, and writes exactly one JSON response
//! line to stdout. Exits 0 on success and 1 on any failure; the failure
//! is also reported on stdout as a response line.

use std::io;

use clap::Parser;
use tracing::info;

use infer_bridge::backend::llama;
use infer_bridge::bridge;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llama-inference", about = "One-shot GGUF inference adapter")]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Stdout carries the response line, so
    // every diagnostic goes to stderr.
    let filter = if cli.verbose {
        "infer_bridge=debug,llama_inference=debug"
    } else {
        "infer_bridge=info,llama_inference=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    info!("llama-inference v{}", env!("CARGO_PKG_VERSION"));

    let stdin = io::stdin();
    let stdout = io::stdout();
    let code = bridge::run(stdin.lock(), stdout.lock(), llama::handle_request);

    std::process::exit(code);
}
