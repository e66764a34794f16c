//! LLM client boundary.
//!
//! The core consumes the [`LlmClient`] capability and never talks HTTP
//! itself; [`openai`] ships an OpenAI-compatible blocking implementation.
//! Error classification drives retry behavior: auth errors never retry,
//! rate limits and transient failures retry with exponential backoff
//! plus jitter.

pub mod openai;
pub mod resolver;

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::model::message::TokenUsage;

pub use resolver::ConflictResolver;

/// Default request timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default number of retry attempts for retryable failures.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// LLM client failure classification.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Missing or invalid client configuration.
    #[error("LLM configuration error: {0}")]
    Config(String),

    /// Authentication failure (401/403). Never retried.
    #[error("LLM authentication failed: {0}")]
    Auth(String),

    /// Rate limited (429). Retried with backoff.
    #[error("LLM rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<f64>,
    },

    /// Transient failure (5xx, connect errors). Retried with backoff.
    #[error("LLM transient error: {0}")]
    Retryable(String),

    /// Unexpected response shape.
    #[error("LLM response error: {0}")]
    Response(String),
}

impl LlmError {
    /// Whether the error class is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimit { .. } | LlmError::Retryable(_))
    }
}

/// A chat request in provider-neutral form.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Messages as `{role, content, name?}` objects.
    pub messages: Vec<Value>,
    /// Sampling parameters; `extra` rides into the payload untouched.
    pub config: LlmConfig,
    /// Tool schemas offered to the model.
    pub tools: Vec<Value>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Value>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }
}

/// A tool invocation requested by the model, provider-neutral.
///
/// OpenAI transports arguments as a JSON string; they are parsed at
/// ingestion so consumers always see a structured value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    /// Parse from an OpenAI-compatible `tool_calls` entry.
    pub fn from_openai(entry: &Value) -> Option<ToolCall> {
        let function = entry.get("function")?;
        let raw_args = function.get("arguments")?;
        let arguments = match raw_args {
            Value::String(s) => serde_json::from_str(s)
                .unwrap_or_else(|_| serde_json::json!({ "_raw": s })),
            other => other.clone(),
        };
        Some(ToolCall {
            id: entry.get("id")?.as_str()?.to_string(),
            name: function.get("name")?.as_str()?.to_string(),
            arguments,
        })
    }
}

/// A chat completion in provider-neutral form.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    /// The raw response for callers that need provider specifics.
    pub raw: Value,
}

/// The LLM capability the core consumes.
///
/// Synchronous from the core's viewpoint; async execution is the host's
/// responsibility.
pub trait LlmClient {
    fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError>;

    /// Short identifier for logs.
    fn describe(&self) -> String {
        "llm".to_string()
    }
}

/// Retry a call with exponential backoff plus jitter.
///
/// Auth and response-format errors surface immediately; rate limits and
/// transient failures sleep `2^attempt` seconds (capped at 30) plus up
/// to two seconds of jitter, honoring a server-provided `retry_after`.
pub fn with_retry<T>(
    max_retries: usize,
    mut call: impl FnMut() -> Result<T, LlmError>,
) -> Result<T, LlmError> {
    let attempts = max_retries.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let base = (1u64 << attempt).min(30);
                let retry_after = match &err {
                    LlmError::RateLimit {
                        retry_after: Some(secs),
                        ..
                    } => *secs,
                    _ => 0.0,
                };
                let jitter: f64 = rand::thread_rng().gen_range(0.0..2.0);
                let sleep_secs = (base as f64).max(retry_after) + jitter;
                tracing::warn!(
                    attempt = attempt + 1,
                    max = attempts,
                    sleep_secs,
                    error = %err,
                    "retrying LLM call"
                );
                thread::sleep(Duration::from_secs_f64(sleep_secs));
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error.unwrap_or_else(|| LlmError::Retryable("retry loop exhausted".to_string())))
}

/// Extract reasoning/thinking content from a raw response.
///
/// Checks provider formats in priority order: a parsed `reasoning`
/// field, `reasoning_content`, then `<think>` tags inside the content.
pub fn extract_reasoning(message: &Value, content: &str) -> Option<String> {
    if let Some(reasoning) = message.get("reasoning").and_then(Value::as_str) {
        if !reasoning.is_empty() {
            return Some(reasoning.to_string());
        }
    }
    if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str) {
        if !reasoning.is_empty() {
            return Some(reasoning.to_string());
        }
    }
    let re = regex::Regex::new(r"(?s)<think>(.*?)</think>").expect("static pattern");
    re.captures(content)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// A scripted client for tests and offline flows: pops canned
/// completions in order, then fails.
#[derive(Default)]
pub struct ScriptedClient {
    responses: std::cell::RefCell<std::collections::VecDeque<ChatCompletion>>,
    calls: std::cell::Cell<usize>,
}

impl ScriptedClient {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = ChatCompletion>,
    {
        Self {
            responses: std::cell::RefCell::new(responses.into_iter().collect()),
            calls: std::cell::Cell::new(0),
        }
    }

    /// Convenience: canned plain-text replies.
    pub fn replies<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| ChatCompletion {
            content: t.into(),
            ..Default::default()
        }))
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl LlmClient for ScriptedClient {
    fn chat(&self, _request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        self.calls.set(self.calls.get() + 1);
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| LlmError::Response("scripted client has no responses left".to_string()))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Auth errors are not retried; transient errors are.
    #[test]
    fn test_retry_classification() {
        let mut calls = 0;
        let result: Result<(), LlmError> = with_retry(3, || {
            calls += 1;
            Err(LlmError::Auth("nope".to_string()))
        });
        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(calls, 1);
    }

    /// Retryable errors are attempted up to max_retries times.
    #[test]
    fn test_retry_exhaustion() {
        let mut calls = 0;
        let result: Result<(), LlmError> = with_retry(2, || {
            calls += 1;
            Err(LlmError::Retryable("flaky".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    /// Tool call arguments arrive parsed, even from JSON strings.
    #[test]
    fn test_tool_call_parsing() {
        let entry = serde_json::json!({
            "id": "call_1",
            "type": "function",
            "function": {"name": "grep", "arguments": "{\"pattern\": \"foo\"}"}
        });
        let call = ToolCall::from_openai(&entry).expect("parse");
        assert_eq!(call.name, "grep");
        assert_eq!(call.arguments["pattern"], "foo");
    }

    /// Reasoning extraction falls back to think tags.
    #[test]
    fn test_extract_reasoning() {
        let message = serde_json::json!({"content": "x"});
        let reasoning =
            extract_reasoning(&message, "<think>chain of thought</think>the answer");
        assert_eq!(reasoning.as_deref(), Some("chain of thought"));

        let parsed = serde_json::json!({"reasoning": "direct"});
        assert_eq!(extract_reasoning(&parsed, "").as_deref(), Some("direct"));
    }

    /// Scripted clients pop responses in order then error.
    #[test]
    fn test_scripted_client() {
        let client = ScriptedClient::replies(["one", "two"]);
        let request = ChatRequest::new(vec![]);
        assert_eq!(client.chat(&request).expect("one").content, "one");
        assert_eq!(client.chat(&request).expect("two").content, "two");
        assert!(client.chat(&request).is_err());
        assert_eq!(client.calls(), 3);
    }
}
