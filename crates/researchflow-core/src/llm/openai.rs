//! OpenAI-compatible chat completions client (`POST {base_url}/chat/completions`).
//!
//! Used for the secondary, cheaper provider that handles non-critical tasks.

use async_trait::async_trait;
use serde_json::json;

use super::{http_client, LlmClient, LlmError, LlmProviderConfig, LlmRequest, LlmResponse, UsageInfo};

pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    config: LlmProviderConfig,
}

impl OpenAiCompatibleClient {
    pub fn new(config: LlmProviderConfig) -> Self {
        Self {
            client: http_client(config.timeout_secs),
            config,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        });
        if let Some(temp) = self.config.temperature {
            body["temperature"] = json!(temp);
        }

        tracing::debug!("[OpenAiCompatible] POST {} (model: {})", url, self.config.model);

        let mut builder = self
            .client
            .post(&url)
            .header("content-type", "application/json");
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }
        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::from_reqwest)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), text));
        }

        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response JSON: {}", e)))?;
        parse_chat_response(&json, &self.config.model)
    }
}

fn parse_chat_response(json: &serde_json::Value, default_model: &str) -> Result<LlmResponse, LlmError> {
    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| LlmError::InvalidResponse("Missing choices[0].message.content".to_string()))?
        .to_string();

    let usage = json.get("usage").map(|u| UsageInfo {
        input_tokens: u
            .get("prompt_tokens")
            .or_else(|| u.get("input_tokens"))
            .and_then(|v| v.as_u64()),
        output_tokens: u
            .get("completion_tokens")
            .or_else(|| u.get("output_tokens"))
            .and_then(|v| v.as_u64()),
    });

    Ok(LlmResponse {
        content,
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(default_model)
            .to_string(),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let raw = json!({
            "choices": [{ "message": { "role": "assistant", "content": "hello" } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 1 }
        });
        let parsed = parse_chat_response(&raw, "local-model").unwrap();
        assert_eq!(parsed.content, "hello");
        assert_eq!(parsed.model, "local-model");
        assert_eq!(parsed.usage.unwrap().input_tokens, Some(3));
    }
}
