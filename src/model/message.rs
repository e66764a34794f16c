//! Compiled message structures.
//!
//! [`CompiledContext`] is the output of context compilation: the linear
//! `[{role, content}, …]` list an LLM API expects, plus token accounting
//! and the parallel commit metadata the cache needs for incremental
//! patching. [`CompileSnapshot`] is the cached materialization of a
//! compile at a specific HEAD.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single message in a compiled context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
        }
    }

    /// The dict shape token counters and LLM clients consume.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("role".to_string(), Value::String(self.role.clone()));
        map.insert("content".to_string(), Value::String(self.content.clone()));
        if let Some(name) = &self.name {
            map.insert("name".to_string(), Value::String(name.clone()));
        }
        Value::Object(map)
    }
}

/// Token usage reported by an LLM API response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Output of context compilation.
///
/// `commit_hashes[i]` is the DAG commit that produced `messages[i]`;
/// `generation_configs[i]` is its effective config (the edit's when the
/// commit was edited and the edit carries one, else the original's).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompiledContext {
    pub messages: Vec<Message>,
    /// Formatted output tokens: per-message overhead plus the response
    /// primer, or the API-reported prompt tokens once calibrated.
    pub token_count: usize,
    pub commit_count: usize,
    /// `"tiktoken:<enc>"` or `"api:<prompt>+<completion>"`.
    pub token_source: String,
    pub generation_configs: Vec<Option<Value>>,
    pub commit_hashes: Vec<String>,
    /// Tool schemas attached to the latest commit that carried any.
    pub tools: Vec<Value>,
}

impl CompiledContext {
    /// Convert messages to the dict list most LLM APIs accept.
    pub fn to_values(&self) -> Vec<Value> {
        self.messages.iter().map(Message::to_value).collect()
    }

    /// System prompt extracted for APIs that carry it out of band,
    /// paired with the remaining non-system messages.
    pub fn split_system(&self) -> (Option<String>, Vec<Value>) {
        let mut system_parts = Vec::new();
        let mut rest = Vec::new();
        for message in &self.messages {
            if message.role == "system" {
                system_parts.push(message.content.clone());
            } else {
                rest.push(message.to_value());
            }
        }
        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, rest)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl std::fmt::Display for CompiledContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CompiledContext(messages={}, tokens={}, source={})",
            self.commit_count, self.token_count, self.token_source
        )
    }
}

/// Cached intermediate compilation state for incremental extension.
///
/// Each position in `messages` corresponds to one effective commit:
/// `commit_hashes[i]` produced `messages[i]`, and
/// `message_token_counts[i]` is that message's token count including
/// per-message overhead but excluding the response primer.
///
/// Invariant: `token_count == sum(message_token_counts) + primer` while
/// tiktoken-sourced; after API calibration `token_count` is the reported
/// prompt total and per-message counts are rescaled proportionally.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileSnapshot {
    pub head_hash: String,
    pub messages: Vec<Message>,
    pub commit_count: usize,
    pub token_count: usize,
    pub token_source: String,
    pub generation_configs: Vec<Option<Value>>,
    pub commit_hashes: Vec<String>,
    pub message_token_counts: Vec<usize>,
    pub tool_hashes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Messages serialize with `name` only when present.
    #[test]
    fn test_message_to_value() {
        let plain = Message::new("user", "hi");
        assert_eq!(plain.to_value(), serde_json::json!({"role": "user", "content": "hi"}));

        let named = Message {
            role: "user".to_string(),
            content: "hi".to_string(),
            name: Some("alice".to_string()),
        };
        assert_eq!(
            named.to_value(),
            serde_json::json!({"role": "user", "content": "hi", "name": "alice"})
        );
    }

    /// System messages are pulled out and concatenated.
    #[test]
    fn test_split_system() {
        let ctx = CompiledContext {
            messages: vec![
                Message::new("system", "a"),
                Message::new("user", "b"),
                Message::new("system", "c"),
            ],
            ..Default::default()
        };
        let (system, rest) = ctx.split_system();
        assert_eq!(system.as_deref(), Some("a\n\nc"));
        assert_eq!(rest.len(), 1);
    }
}
