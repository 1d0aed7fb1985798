//! Anthropic Messages API client (`POST {base_url}/v1/messages`).

use async_trait::async_trait;
use serde_json::json;

use super::{http_client, LlmClient, LlmError, LlmProviderConfig, LlmRequest, LlmResponse, UsageInfo};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

pub struct AnthropicClient {
    client: reqwest::Client,
    config: LlmProviderConfig,
}

impl AnthropicClient {
    pub fn new(config: LlmProviderConfig) -> Self {
        Self {
            client: http_client(config.timeout_secs),
            config,
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::Value::String(system.clone());
        }
        if let Some(temp) = self.config.temperature {
            body["temperature"] = json!(temp);
        }

        tracing::debug!("[Anthropic] POST {} (model: {})", url, self.config.model);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
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
        parse_messages_response(&json, &self.config.model)
    }
}

fn parse_messages_response(json: &serde_json::Value, default_model: &str) -> Result<LlmResponse, LlmError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| LlmError::InvalidResponse("Missing content blocks".to_string()))?;

    let content = blocks
        .iter()
        .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n");

    let usage = json.get("usage").map(|u| UsageInfo {
        input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()),
        output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()),
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
    fn test_parse_messages_response() {
        let raw = json!({
            "model": "claude-test",
            "content": [
                { "type": "text", "text": "first" },
                { "type": "tool_use", "id": "x" },
                { "type": "text", "text": "second" }
            ],
            "usage": { "input_tokens": 10, "output_tokens": 4 }
        });
        let parsed = parse_messages_response(&raw, "fallback").unwrap();
        assert_eq!(parsed.content, "first\nsecond");
        assert_eq!(parsed.model, "claude-test");
        assert_eq!(parsed.usage.unwrap().output_tokens, Some(4));

        assert!(parse_messages_response(&json!({}), "m").is_err());
    }
}
