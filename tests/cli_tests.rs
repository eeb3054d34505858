//! End-to-end tests that spawn the compiled adapter binaries and speak
//! the stdin/stdout protocol to them.

#![cfg(not(any(feature = "llamacpp", feature = "metal")))]

use std::io::Write;
use std::process::{Command, Stdio};

const LLAMA_BIN: &str = env!("CARGO_BIN_EXE_llama-inference");
const METAL_BIN: &str = env!("CARGO_BIN_EXE_metal-inference");

/// Spawn an adapter, feed it `input` on stdin, and collect the results.
fn run_adapter(bin: &str, input: &str) -> (Option<i32>, String, String) {
    let mut child = Command::new(bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn adapter");

    child
        .stdin
        .take()
        .expect("stdin handle")
        .write_all(input.as_bytes())
        .expect("write stdin");

    let output = child.wait_with_output().expect("wait for adapter");
    (
        output.status.code(),
        String::from_utf8(output.stdout).expect("stdout utf8"),
        String::from_utf8(output.stderr).expect("stderr utf8"),
    )
}

/// Assert stdout is exactly one JSON line and parse it.
fn parse_response(stdout: &str) -> serde_json::Value {
    assert!(stdout.ends_with('\n'), "response must end with a newline");
    assert_eq!(
        stdout.matches('\n').count(),
        1,
        "stdout must carry exactly one line, got: {stdout:?}"
    );
    serde_json::from_str(stdout.trim_end()).expect("stdout must be valid JSON")
}

fn gguf_fixture() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"GGUF").unwrap();
    file.write_all(&[0u8; 28]).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_llama_binary_success() {
    let model = gguf_fixture();
    let input = serde_json::json!({
        "modelPath": model.path().to_str().unwrap(),
        "prompt": "fn main() {",
        "maxTokens": 2,
    })
    .to_string();

    let (code, stdout, _stderr) = run_adapter(LLAMA_BIN, &input);

    assert_eq!(code, Some(0));
    let value = parse_response(&stdout);
    assert_eq!(value["success"], true);
    assert_eq!(value["result"], "token_0 token_1");
}

#[test]
fn test_llama_binary_rejects_malformed_input() {
    let (code, stdout, _stderr) = run_adapter(LLAMA_BIN, "this is not json");

    assert_eq!(code, Some(1));
    let value = parse_response(&stdout);
    assert_eq!(value["success"], false);
    assert!(value["error"].as_str().is_some());
}

#[test]
fn test_llama_binary_rejects_missing_prompt() {
    let (code, stdout, _stderr) = run_adapter(LLAMA_BIN, r#"{"modelPath": "/m"}"#);

    assert_eq!(code, Some(1));
    let value = parse_response(&stdout);
    assert_eq!(value["success"], false);
    assert!(value["error"].as_str().unwrap().contains("prompt"));
}

#[test]
fn test_llama_binary_reports_missing_model() {
    let input = serde_json::json!({
        "modelPath": "/definitely/missing.gguf",
        "prompt": "hello",
    })
    .to_string();

    let (code, stdout, _stderr) = run_adapter(LLAMA_BIN, &input);

    assert_eq!(code, Some(1));
    let value = parse_response(&stdout);
    assert_eq!(value["success"], false);
    assert!(value["error"].as_str().unwrap().contains("missing.gguf"));
}

#[test]
fn test_llama_binary_rejects_empty_stdin() {
    let (code, stdout, _stderr) = run_adapter(LLAMA_BIN, "");

    assert_eq!(code, Some(1));
    let value = parse_response(&stdout);
    assert_eq!(value["success"], false);
}

#[test]
fn test_llama_binary_keeps_stdout_clean() {
    let model = gguf_fixture();
    let input = serde_json::json!({
        "modelPath": model.path().to_str().unwrap(),
        "prompt": "hello",
        "maxTokens": 1,
    })
    .to_string();

    let (code, stdout, stderr) = run_adapter(LLAMA_BIN, &input);

    assert_eq!(code, Some(0));
    // Logs land on stderr; stdout is the single response line.
    assert!(stdout.starts_with('{'));
    parse_response(&stdout);
    assert!(stderr.contains("llama-inference"));
}

#[test]
fn test_metal_binary_success() {
    let adapter = tempfile::tempdir().unwrap();
    let input = serde_json::json!({
        "modelPath": adapter.path().to_str().unwrap(),
        "prompt": "write a haiku",
        "maxTokens": 2,
    })
    .to_string();

    let (code, stdout, _stderr) = run_adapter(METAL_BIN, &input);

    assert_eq!(code, Some(0));
    let value = parse_response(&stdout);
    assert_eq!(value["success"], true);
    assert_eq!(value["result"], "token_0 token_1");
}

#[test]
fn test_metal_binary_reports_missing_adapter() {
    let input = serde_json::json!({
        "modelPath": "/no/such/adapter",
        "prompt": "hello",
    })
    .to_string();

    let (code, stdout, _stderr) = run_adapter(METAL_BIN, &input);

    assert_eq!(code, Some(1));
    let value = parse_response(&stdout);
    assert_eq!(value["success"], false);
    assert!(value["error"].as_str().unwrap().contains("/no/such/adapter"));
}
