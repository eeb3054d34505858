//! Inference adapter for LoRA-tuned models on Apple silicon.
//!
//! Reads one JSON request from stdin, combines the adapter directory
//! named in the request with the fixed base model, runs one completion,
//! and writes exactly one JSON response line to stdout. Exits 0 on
//! success and 1 on any failure; the failure is also reported on stdout
//! as a response line.

use std::io;

use clap::Parser;
use tracing::info;

use infer_bridge::backend::metal;
use infer_bridge::bridge;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "metal-inference",
    about = "One-shot LoRA adapter inference over a fixed base model"
)]
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
        "infer_bridge=debug,metal_inference=debug"
    } else {
        "infer_bridge=info,metal_inference=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    info!("metal-inference v{}", env!("CARGO_PKG_VERSION"));

    let stdin = io::stdin();
    let stdout = io::stdout();
    let code = bridge::run(stdin.lock(), stdout.lock(), metal::handle_request);

    std::process::exit(code);
}
