//! Deterministic LLM client that replays queued responses.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{LlmClient, LlmError, LlmRequest, LlmResponse};

#[derive(Default)]
pub struct ScriptedLlmClient {
    queue: Mutex<VecDeque<Result<String, LlmError>>>,
    default_response: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response returned once the queue is empty.
    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = Some(response.into());
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Ok(response.into()));
        }
    }

    pub fn push_error(&self, error: LlmError) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Err(error));
        }
    }

    /// Prompts received so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.prompt.clone());
        }
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        let content = match next {
            Some(result) => result?,
            None => self
                .default_response
                .clone()
                .ok_or_else(|| LlmError::InvalidResponse("Script exhausted".to_string()))?,
        };
        Ok(LlmResponse {
            content,
            model: "scripted".to_string(),
            usage: None,
        })
    }
}
