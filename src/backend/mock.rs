//! Scripted backend for tests.
//!
//! Queues outcomes ahead of time and records every request it receives,
//! so tests can drive the adapter layer without a real engine.

use std::collections::VecDeque;

use super::{estimate_tokens, BackendError, Completion, CompletionBackend, GenerationRequest};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with this completion text.
    Text(String),
    /// Fail generation with this message.
    Error(String),
}

/// Backend that replays queued outcomes in order.
#[derive(Debug, Default)]
pub struct MockBackend {
    outcomes: VecDeque<MockOutcome>,
    requests: Vec<GenerationRequest>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful completion.
    pub fn with_text(mut self, text: &str) -> Self {
        self.outcomes.push_back(MockOutcome::Text(text.to_string()));
        self
    }

    /// Queue a generation failure.
    pub fn with_error(mut self, message: &str) -> Self {
        self.outcomes
            .push_back(MockOutcome::Error(message.to_string()));
        self
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> &[GenerationRequest] {
        &self.requests
    }
}

impl CompletionBackend for MockBackend {
    fn complete(&mut self, request: &GenerationRequest) -> Result<Completion, BackendError> {
        self.requests.push(request.clone());

        match self.outcomes.pop_front() {
            Some(MockOutcome::Text(text)) => Ok(Completion {
                prompt_tokens: estimate_tokens(&request.prompt),
                completion_tokens: estimate_tokens(&text),
                text,
            }),
            Some(MockOutcome::Error(message)) => Err(BackendError::GenerationFailed(message)),
            None => Ok(Completion {
                text: "mock completion".to_string(),
                prompt_tokens: 1,
                completion_tokens: 2,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            max_tokens: 16,
            stop: Vec::new(),
        }
    }

    #[test]
    fn test_outcomes_replay_in_order() {
        let mut backend = MockBackend::new().with_text("first").with_error("broken");

        let completion = backend.complete(&request("a")).unwrap();
        assert_eq!(completion.text, "first");

        let err = backend.complete(&request("b")).unwrap_err();
        assert!(matches!(err, BackendError::GenerationFailed(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_requests_are_recorded() {
        let mut backend = MockBackend::new().with_text("x").with_text("y");
        backend.complete(&request("one")).unwrap();
        backend.complete(&request("two")).unwrap();

        let seen = backend.requests();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].prompt, "one");
        assert_eq!(seen[1].prompt, "two");
    }

    #[test]
    fn test_empty_queue_yields_default_completion() {
        let mut backend = MockBackend::new();
        let completion = backend.complete(&request("anything")).unwrap();
        assert_eq!(completion.text, "mock completion");
    }
}
