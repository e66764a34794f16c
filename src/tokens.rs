//! Token counting.
//!
//! The engine consumes the [`TokenCounter`] capability; the default
//! implementation wraps a tiktoken encoding. Message counting follows
//! the OpenAI convention: a fixed per-message overhead, one extra token
//! per `name` field, and a 3-token response primer appended after all
//! messages.

use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Fixed overhead counted for every message (role + framing).
pub const TOKENS_PER_MESSAGE: usize = 3;

/// Extra token counted when a message carries a `name`.
pub const TOKENS_PER_NAME: usize = 1;

/// Tokens appended after all messages as the response primer.
pub const RESPONSE_PRIMER_TOKENS: usize = 3;

/// Pluggable token counting capability. Must be deterministic.
pub trait TokenCounter {
    /// Count tokens in a plain text string.
    fn count_text(&self, text: &str) -> usize;

    /// Tag describing where counts come from, e.g. `tiktoken:cl100k_base`.
    fn token_source(&self) -> String;

    /// Count tokens in a structured message list, including per-message
    /// overhead and the response primer.
    fn count_messages(&self, messages: &[Value]) -> usize {
        let mut total = 0;
        for message in messages {
            total += TOKENS_PER_MESSAGE;
            if let Some(role) = message.get("role").and_then(Value::as_str) {
                total += self.count_text(role);
            }
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                total += self.count_text(content);
            }
            if let Some(name) = message.get("name").and_then(Value::as_str) {
                total += TOKENS_PER_NAME + self.count_text(name);
            }
        }
        total + RESPONSE_PRIMER_TOKENS
    }
}

/// Token counter backed by a tiktoken encoding.
pub struct TiktokenCounter {
    bpe: CoreBPE,
    encoding_name: String,
}

impl TiktokenCounter {
    /// Build a counter for a named encoding. Unknown names fail; use
    /// [`create_token_counter`] for the fallback path.
    pub fn new(encoding_name: &str) -> Result<TiktokenCounter, String> {
        let bpe = match encoding_name {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => return Err(format!("unknown tokenizer encoding '{other}'")),
        }
        .map_err(|e| format!("failed to load encoding '{encoding_name}': {e}"))?;
        Ok(TiktokenCounter {
            bpe,
            encoding_name: encoding_name.to_string(),
        })
    }

    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn token_source(&self) -> String {
        format!("tiktoken:{}", self.encoding_name)
    }
}

/// Character-estimate fallback counter: 4 chars ~= 1 token.
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_text(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }

    fn token_source(&self) -> String {
        "heuristic:chars".to_string()
    }
}

/// Build the configured counter, falling back to the character estimate
/// when the encoding cannot be loaded.
pub fn create_token_counter(encoding_name: &str) -> Box<dyn TokenCounter> {
    match TiktokenCounter::new(encoding_name) {
        Ok(counter) => Box::new(counter),
        Err(err) => {
            tracing::warn!("{err}; falling back to character estimate");
            Box::new(HeuristicCounter)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Message counting adds per-message overhead and the primer.
    #[test]
    fn test_count_messages_overhead() {
        let counter = HeuristicCounter;
        let single = counter.count_messages(&[json!({"role": "user", "content": "abcd"})]);
        // 3 overhead + 1 (role "user") + 1 (content) + 3 primer
        assert_eq!(single, TOKENS_PER_MESSAGE + 1 + 1 + RESPONSE_PRIMER_TOKENS);

        let empty = counter.count_messages(&[]);
        assert_eq!(empty, RESPONSE_PRIMER_TOKENS);
    }

    /// Named messages count one extra token plus the name text.
    #[test]
    fn test_count_messages_name() {
        let counter = HeuristicCounter;
        let anonymous = counter.count_messages(&[json!({"role": "user", "content": "abcd"})]);
        let named =
            counter.count_messages(&[json!({"role": "user", "content": "abcd", "name": "beth"})]);
        assert_eq!(named, anonymous + TOKENS_PER_NAME + 1);
    }

    /// Tiktoken counters are deterministic and report their encoding.
    #[test]
    fn test_tiktoken_counter() {
        let counter = TiktokenCounter::new("cl100k_base").expect("encoding");
        assert_eq!(counter.token_source(), "tiktoken:cl100k_base");
        let a = counter.count_text("Hello, world!");
        let b = counter.count_text("Hello, world!");
        assert_eq!(a, b);
        assert!(a > 0);
        assert!(TiktokenCounter::new("bogus_base").is_err());
    }
}
