//! Error types for the Tract crate.
//!
//! This module defines a unified error enumeration used across commit
//! creation, context compilation, branch management, merges, compression,
//! and garbage collection. It integrates with `thiserror` to provide rich
//! `Display` implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries the offending identifier (hash prefix, branch
//!   name) and, where useful, a one-line remediation hint.
//! - Validation errors surface to the caller without any state change.

use thiserror::Error;

use crate::llm::LlmError;

#[derive(Error, Debug)]
/// Unified error enumeration for the Tract library.
///
/// - Used across the commit engine, compiler, cache, DAG utilities,
///   history-rewriting operations, and the hook protocol.
/// - Implements `std::error::Error` via `thiserror`.
pub enum TractError {
    /// A commit hash failed to resolve.
    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    /// A blob is missing for an existing commit (storage corruption).
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// A content payload does not satisfy its content-type schema.
    #[error("Content validation failed: {0}")]
    ContentValidation(String),

    /// Token budget exceeded in reject mode.
    #[error("Token budget exceeded: {current_tokens} tokens (max: {max_tokens})")]
    BudgetExceeded {
        current_tokens: usize,
        max_tokens: usize,
    },

    /// An edit targets a missing commit, or a commit that is itself an edit.
    #[error("Invalid edit target: {0}")]
    EditTarget(String),

    /// A ref with this name already exists.
    #[error("Ref already exists: {0}")]
    DuplicateRef(String),

    /// Commit attempted while HEAD is detached and the detached gate is on.
    #[error("Cannot commit in detached HEAD state. Use checkout(\"<branch>\") to return to a branch.")]
    DetachedHead,

    /// Branch creation attempted for a name that already exists.
    #[error("Branch already exists: {0}")]
    BranchExists(String),

    /// A branch lookup failed.
    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    /// A branch name violates the naming rules.
    #[error("Invalid branch name '{name}': {reason}")]
    InvalidBranchName { name: String, reason: String },

    /// Branch deletion refused because it has unmerged commits.
    #[error("Branch '{0}' has unmerged commits. Pass force=true to delete anyway.")]
    UnmergedBranch(String),

    /// A hash prefix resolves to more than one commit.
    #[error("Ambiguous prefix '{prefix}'. Matches: {}", format_candidates(.candidates))]
    AmbiguousPrefix {
        prefix: String,
        candidates: Vec<String>,
    },

    /// Invalid argument combination for an operation.
    #[error("Argument error: {0}")]
    InvalidArgument(String),

    /// Merge failed outside the conflict protocol.
    #[error("Merge error: {0}")]
    Merge(String),

    /// Conflicts were detected and the caller asked for an error.
    #[error("Merge has {conflict_count} conflict(s) requiring resolution")]
    MergeConflict { conflict_count: usize },

    /// The source branch is already merged (up to date).
    #[error("Branch '{0}' is already up-to-date")]
    NothingToMerge(String),

    /// Rebase failed.
    #[error("Rebase error: {0}")]
    Rebase(String),

    /// Cherry-pick / import failed.
    #[error("Import commit error: {0}")]
    ImportCommit(String),

    /// Compression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// All retry attempts for a validated operation failed.
    #[error("All {attempts} retry attempts failed. Last diagnosis: {last_diagnosis}")]
    RetryExhausted {
        attempts: usize,
        last_diagnosis: String,
    },

    /// Garbage collection failed.
    #[error("GC error: {0}")]
    Gc(String),

    /// Storage session failure (open, transaction, configuration).
    #[error("Session error: {0}")]
    Session(String),

    /// Hook / pending protocol violation (resolved pending mutated,
    /// non-whitelisted action invoked).
    #[error("Hook error: {0}")]
    Hook(String),

    /// LLM client failure that could not be handled by a fallback.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// SQLite error from the underlying store.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Shorthand result type used across the crate.
pub type Result<T> = std::result::Result<T, TractError>;

fn format_candidates(candidates: &[String]) -> String {
    candidates
        .iter()
        .take(5)
        .map(|c| format!("{}...", &c[..c.len().min(12)]))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ambiguous prefix messages list at most five truncated candidates.
    #[test]
    fn test_ambiguous_prefix_message() {
        let err = TractError::AmbiguousPrefix {
            prefix: "abcd".to_string(),
            candidates: vec![
                "abcd1111222233334444".to_string(),
                "abcd5555666677778888".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Ambiguous prefix 'abcd'"));
        assert!(msg.contains("abcd11112222..."));
        assert!(msg.contains("abcd55556666..."));
    }

    /// Budget errors carry both the current and the maximum token counts.
    #[test]
    fn test_budget_exceeded_message() {
        let err = TractError::BudgetExceeded {
            current_tokens: 1200,
            max_tokens: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Token budget exceeded: 1200 tokens (max: 1000)"
        );
    }
}
