//! Merge conflict resolver capability.
//!
//! A resolver maps one [`ConflictInfo`] to a [`Resolution`]. Closures
//! implement the trait directly; [`LlmResolver`] wraps an LLM client
//! with a fixed prompt.

use serde_json::Value;

use crate::llm::{ChatRequest, LlmClient, LlmError};
use crate::model::merge::{ConflictInfo, Resolution};

/// Decides the outcome of one merge conflict.
pub trait ConflictResolver {
    fn resolve(&self, conflict: &ConflictInfo) -> Result<Resolution, LlmError>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&ConflictInfo) -> Resolution,
{
    fn resolve(&self, conflict: &ConflictInfo) -> Result<Resolution, LlmError> {
        Ok(self(conflict))
    }
}

const RESOLVER_SYSTEM_PROMPT: &str = "You are resolving a conflict between two versions of a \
message in an LLM conversation history. Reply with a single merged text that preserves the \
intent of both versions. Reply with the merged text only, no preamble.";

/// Resolver that asks an LLM to merge the two conflicting texts.
pub struct LlmResolver<'a> {
    client: &'a dyn LlmClient,
    config: crate::config::LlmConfig,
}

impl<'a> LlmResolver<'a> {
    pub fn new(client: &'a dyn LlmClient, config: crate::config::LlmConfig) -> Self {
        Self { client, config }
    }
}

impl ConflictResolver for LlmResolver<'_> {
    fn resolve(&self, conflict: &ConflictInfo) -> Result<Resolution, LlmError> {
        let user = format!(
            "Conflict type: {}\n\nVersion A (current branch):\n{}\n\nVersion B (incoming branch):\n{}\n\nMerged text:",
            conflict.conflict_type, conflict.content_a_text, conflict.content_b_text,
        );
        let request = ChatRequest::new(vec![
            message("system", RESOLVER_SYSTEM_PROMPT),
            message("user", &user),
        ])
        .with_config(self.config.clone());

        let completion = self.client.chat(&request)?;
        let text = completion.content.trim().to_string();
        if text.is_empty() {
            return Ok(Resolution::abort("resolver returned an empty merge"));
        }
        let mut resolution = Resolution::resolved(text);
        resolution.reasoning = completion.reasoning;
        resolution.generation_config = Some(self.config.to_value());
        Ok(resolution)
    }
}

fn message(role: &str, content: &str) -> Value {
    serde_json::json!({"role": role, "content": content})
}
