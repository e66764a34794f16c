//! OpenAI-compatible blocking HTTP client.
//!
//! Talks to any `/chat/completions` endpoint that speaks the OpenAI
//! wire format. Auth errors (401/403) fail immediately; 429 and 5xx are
//! classified retryable and handled by [`super::with_retry`].

use std::time::Duration;

use serde_json::Value;

use crate::config::LlmConfig;
use crate::llm::{
    extract_reasoning, with_retry, ChatCompletion, ChatRequest, LlmClient, LlmError, ToolCall,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS,
};
use crate::model::message::TokenUsage;

/// Environment variable consulted for the API key.
pub const API_KEY_ENV: &str = "TRACT_OPENAI_API_KEY";

/// Environment variable consulted for the base URL.
pub const BASE_URL_ENV: &str = "TRACT_OPENAI_BASE_URL";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Blocking OpenAI-compatible chat client.
pub struct OpenAiClient {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    default_model: String,
    max_retries: usize,
}

impl OpenAiClient {
    /// Build a client. Falls back to `TRACT_OPENAI_API_KEY` and
    /// `TRACT_OPENAI_BASE_URL` when arguments are absent.
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<OpenAiClient, LlmError> {
        let api_key = api_key
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                LlmError::Config(format!(
                    "no API key provided; pass one or set {API_KEY_ENV}"
                ))
            })?;
        let base_url = base_url
            .or_else(|| std::env::var(BASE_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(OpenAiClient {
            client,
            base_url,
            api_key,
            default_model: default_model.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let config: &LlmConfig = &request.config;
        let mut payload = serde_json::Map::new();
        payload.insert(
            "model".to_string(),
            Value::String(
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| self.default_model.clone()),
            ),
        );
        payload.insert("messages".to_string(), Value::Array(request.messages.clone()));
        if let Some(temperature) = config.temperature {
            if let Some(number) = serde_json::Number::from_f64(temperature) {
                payload.insert("temperature".to_string(), Value::Number(number));
            }
        }
        if let Some(max_tokens) = config.max_tokens {
            payload.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        if !request.tools.is_empty() {
            payload.insert("tools".to_string(), Value::Array(request.tools.clone()));
        }
        for (key, value) in &config.extra {
            payload.insert(key.clone(), value.clone());
        }
        Value::Object(payload)
    }

    fn do_chat(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let payload = self.build_payload(request);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LlmError::Retryable(format!("request failed: {e}"))
                } else {
                    LlmError::Response(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| LlmError::Response(format!("cannot read response body: {e}")))?;

        match status.as_u16() {
            401 | 403 => return Err(LlmError::Auth(format!("HTTP {status}: {}", snippet(&body)))),
            429 => {
                return Err(LlmError::RateLimit {
                    message: format!("HTTP 429: {}", snippet(&body)),
                    retry_after: None,
                })
            }
            500..=599 => {
                return Err(LlmError::Retryable(format!(
                    "HTTP {status}: {}",
                    snippet(&body)
                )))
            }
            code if code >= 400 => {
                return Err(LlmError::Response(format!(
                    "HTTP {status}: {}",
                    snippet(&body)
                )))
            }
            _ => {}
        }

        let data: Value = serde_json::from_str(&body).map_err(|e| {
            LlmError::Response(format!(
                "cannot parse response JSON: {e}. Body: {}",
                snippet(&body)
            ))
        })?;
        parse_completion(&data)
    }
}

impl LlmClient for OpenAiClient {
    fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        with_retry(self.max_retries, || self.do_chat(request))
    }

    fn describe(&self) -> String {
        format!("openai-compatible:{}", self.base_url)
    }
}

/// Parse a full OpenAI-compatible response body into a completion.
pub fn parse_completion(data: &Value) -> Result<ChatCompletion, LlmError> {
    let message = data
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| {
            LlmError::Response(format!(
                "unexpected response format: missing choices[0].message: {}",
                snippet(&data.to_string())
            ))
        })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(ToolCall::from_openai).collect())
        .unwrap_or_default();

    let usage = data.get("usage").map(|u| TokenUsage {
        prompt_tokens: u
            .get("prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize,
        completion_tokens: u
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize,
        total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as usize,
    });

    let reasoning = extract_reasoning(message, &content);

    Ok(ChatCompletion {
        content,
        reasoning,
        tool_calls,
        usage,
        raw: data.clone(),
    })
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty response body>".to_string();
    }
    let mut s: String = trimmed.chars().take(500).collect();
    if trimmed.chars().count() > 500 {
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// A well-formed response parses content, usage, and tool calls.
    #[test]
    fn test_parse_completion() {
        let data = json!({
            "choices": [{
                "message": {
                    "content": "hello",
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "f", "arguments": "{\"x\": 1}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let completion = parse_completion(&data).expect("parse");
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].arguments["x"], 1);
        let usage = completion.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
    }

    /// Missing choices is a response-format error.
    #[test]
    fn test_parse_completion_missing_choices() {
        let err = parse_completion(&json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, LlmError::Response(_)));
    }
}
