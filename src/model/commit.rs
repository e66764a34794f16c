//! Commit model: the immutable DAG node.
//!
//! A commit binds one content blob to its lineage. APPEND commits add
//! new material; EDIT commits supersede a prior APPEND's content in
//! compile output without rewriting history. Merge commits are APPENDs
//! whose extra parents live in the `commit_parents` side table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The two commit operations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommitOperation {
    #[default]
    Append,
    Edit,
}

impl CommitOperation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CommitOperation::Append => "append",
            CommitOperation::Edit => "edit",
        }
    }

    pub fn parse(s: &str) -> Option<CommitOperation> {
        match s {
            "append" => Some(CommitOperation::Append),
            "edit" => Some(CommitOperation::Edit),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommitOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public description of a commit, returned by the engine and the facade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitInfo {
    pub commit_hash: String,
    pub tract_id: String,
    /// First parent; `None` for the root commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    pub content_hash: String,
    pub content_type: String,
    pub operation: CommitOperation,
    /// Edit target; set iff `operation == Edit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
    /// Human-readable commit message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Raw content tokens (not compile-time formatted tokens).
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl CommitInfo {
    /// Short hash prefix for display.
    pub fn short_hash(&self) -> &str {
        &self.commit_hash[..self.commit_hash.len().min(8)]
    }
}

impl std::fmt::Display for CommitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.short_hash(),
            self.operation,
            self.content_type
        )
    }
}
