//! LLM clients used by the agents.
//!
//! Agents talk to an [`LlmRouter`], which sends critical tasks to the
//! primary provider and everything else to the secondary one (falling back
//! to primary). Providers speak either the Anthropic Messages API or the
//! OpenAI-compatible chat/completions API over `reqwest`.

pub mod anthropic;
pub mod openai;
pub mod router;
pub mod scripted;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiCompatibleClient;
pub use router::{LlmRouter, TaskCriticality};
pub use scripted::ScriptedLlmClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request timed out: {0}")]
    Timeout(String),

    #[error("LLM connection failed: {0}")]
    Connection(String),

    #[error("LLM rate limited: {0}")]
    RateLimited(String),

    #[error("LLM service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("LLM API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("No LLM provider configured")]
    NotConfigured,
}

impl LlmError {
    /// Error kind name used by the agent retry policy.
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Timeout(_) => "TimeoutError",
            LlmError::Connection(_) => "ConnectionError",
            LlmError::RateLimited(_) => "RateLimitError",
            LlmError::ServiceUnavailable(_) => "ServiceUnavailableError",
            LlmError::Api { .. } => "ApiError",
            LlmError::InvalidResponse(_) => "InvalidResponseError",
            LlmError::NotConfigured => "NotConfiguredError",
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            LlmError::Connection(e.to_string())
        } else {
            LlmError::InvalidResponse(e.to_string())
        }
    }

    pub(crate) fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => LlmError::RateLimited(body),
            408 => LlmError::Timeout(body),
            500 | 502 | 503 | 504 | 529 => LlmError::ServiceUnavailable(body),
            _ => LlmError::Api {
                status,
                message: body,
            },
        }
    }
}

/// Connection settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: 4096,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<UsageInfo>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

pub(crate) fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Pull the first JSON object out of a completion.
///
/// Handles fenced code blocks and prose around the object.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }

    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate().skip(open) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        if let Ok(value) = serde_json::from_str(&text[open..=i]) {
                            return Some(value);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        start = open + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"inclusion_criteria\": [\"type 2 diabetes\"], \"note\": \"a } brace\"}\n```\nThanks";
        let value = extract_json(text).unwrap();
        assert_eq!(value["inclusion_criteria"][0], "type 2 diabetes");
        assert_eq!(value["note"], "a } brace");
    }

    #[test]
    fn test_extract_json_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(LlmError::from_status(429, String::new()).kind(), "RateLimitError");
        assert_eq!(LlmError::from_status(503, String::new()).kind(), "ServiceUnavailableError");
        assert_eq!(LlmError::from_status(400, String::new()).kind(), "ApiError");
    }
}
