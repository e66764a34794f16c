//! PendingToolResult: intercepts a tool output before it is committed.
//!
//! Reviewers (human or hook) can rewrite verbose tool output in place
//! or ask the LLM to shorten it; the original text is preserved in the
//! commit metadata once edited.

use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::hooks::pending::{ActionSpec, ParamSpec, PendingMeta, PendingReview};
use crate::model::commit::CommitInfo;
use crate::tract::Tract;

const ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "approve",
        description: "Commit the tool result with the current content.",
        params: &[],
    },
    ActionSpec {
        name: "reject",
        description: "Drop the tool result without committing it.",
        params: &[ParamSpec {
            name: "reason",
            kind: "string",
            required: false,
            description: "Why the result was rejected.",
        }],
    },
    ActionSpec {
        name: "edit_result",
        description: "Replace the tool result content before committing.",
        params: &[ParamSpec {
            name: "text",
            kind: "string",
            required: true,
            description: "Replacement content.",
        }],
    },
    ActionSpec {
        name: "summarize",
        description: "Ask the LLM to shorten the tool result content.",
        params: &[
            ParamSpec {
                name: "instructions",
                kind: "string",
                required: false,
                description: "Extra summarization instructions.",
            },
            ParamSpec {
                name: "include_context",
                kind: "boolean",
                required: false,
                description: "Prefix the compiled conversation context to the prompt.",
            },
        ],
    },
];

/// A tool result held open for review before it becomes a commit.
pub struct PendingToolResult {
    meta: PendingMeta,
    pub tool_name: String,
    pub call_id: String,
    content: String,
    original_content: Option<String>,
    pub is_error: bool,
    token_count: usize,
    commit: Option<CommitInfo>,
}

impl PendingToolResult {
    pub fn new(
        tract: &Tract,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let content = content.into();
        let token_count = tract.count_text(&content);
        Self {
            meta: PendingMeta::new("tool_result"),
            tool_name: tool_name.into(),
            call_id: call_id.into(),
            content,
            original_content: None,
            is_error,
            token_count,
            commit: None,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Original content, preserved once the result has been edited.
    pub fn original_content(&self) -> Option<&str> {
        self.original_content.as_deref()
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn commit_info(&self) -> Option<&CommitInfo> {
        self.commit.as_ref()
    }

    /// Commit the tool result with the current content.
    pub fn approve(&mut self, tract: &mut Tract) -> Result<CommitInfo> {
        self.meta.require_pending()?;
        let info = tract.commit_tool_result_content(
            &self.call_id,
            &self.tool_name,
            &self.content,
            self.original_content.as_deref(),
            self.is_error,
        )?;
        self.meta.mark_approved();
        self.commit = Some(info.clone());
        Ok(info)
    }

    pub fn reject(&mut self, reason: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        self.meta.mark_rejected(reason);
        Ok(())
    }

    /// Replace the content, preserving the original text once.
    pub fn edit_result(&mut self, tract: &Tract, text: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        if self.original_content.is_none() {
            self.original_content = Some(self.content.clone());
        }
        self.content = text.into();
        self.token_count = tract.count_text(&self.content);
        Ok(())
    }

    /// Shorten the content via the summarize LLM client. With
    /// `include_context` the compiled conversation is prefixed so the
    /// summary keeps what the conversation still needs.
    pub fn summarize(
        &mut self,
        tract: &mut Tract,
        instructions: Option<&str>,
        include_context: bool,
    ) -> Result<()> {
        self.meta.require_pending()?;
        let input = if include_context {
            let context = tract.compile()?;
            let transcript: Vec<String> = context
                .messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect();
            format!(
                "Conversation so far:\n{}\n\nTool result to shorten:\n{}",
                transcript.join("\n"),
                self.content
            )
        } else {
            self.content.clone()
        };
        let summary = tract.summarize_text(&input, instructions)?;
        self.edit_result(tract, summary)
    }
}

impl PendingReview for PendingToolResult {
    fn meta(&self) -> &PendingMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut PendingMeta {
        &mut self.meta
    }

    fn actions(&self) -> &'static [ActionSpec] {
        ACTIONS
    }

    fn describe_fields(&self) -> Value {
        serde_json::json!({
            "tool_name": self.tool_name,
            "call_id": self.call_id,
            "content": self.content,
            "original_content": self.original_content,
            "is_error": self.is_error,
            "token_count": self.token_count,
        })
    }

    fn execute_action(&mut self, tract: &mut Tract, name: &str, args: &Value) -> Result<Value> {
        match name {
            "approve" => {
                let info = self.approve(tract)?;
                Ok(serde_json::to_value(info)?)
            }
            "reject" => {
                let reason = args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.reject(reason)?;
                Ok(Value::Null)
            }
            "edit_result" => {
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.edit_result(tract, text)?;
                Ok(Value::Null)
            }
            "summarize" => {
                let instructions = args.get("instructions").and_then(Value::as_str);
                let include_context = args
                    .get("include_context")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.summarize(tract, instructions, include_context)?;
                Ok(Value::Null)
            }
            other => Err(TractError::Hook(format!("unknown action '{other}'"))),
        }
    }
}

impl std::fmt::Debug for PendingToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<PendingToolResult: {} ({} tokens), {}>",
            self.tool_name, self.token_count, self.meta.status
        )
    }
}
