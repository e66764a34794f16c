//! Result models for history-rewriting operations.

use serde::{Deserialize, Serialize};

use crate::model::commit::CommitInfo;

/// Outcome of a compression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressResult {
    pub compression_id: String,
    /// Original hashes of the commits consumed by the compression.
    pub source_commits: Vec<String>,
    /// Hashes of the created summary commits.
    pub summary_commits: Vec<String>,
    /// Original hashes of PINNED / preserved commits that passed through.
    pub preserved_commits: Vec<String>,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// `compressed_tokens / original_tokens`; 0 when the range was empty.
    pub compression_ratio: f64,
    pub new_head: String,
}

/// Outcome of a rebase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebaseResult {
    /// New commits created on top of the target, root-first.
    pub replayed_commits: Vec<CommitInfo>,
    /// Hashes of the original commits that were replayed.
    pub original_commits: Vec<String>,
    pub new_head: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Outcome of a cherry-pick / import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportResult {
    pub original: CommitInfo,
    pub imported: CommitInfo,
}

/// Reset behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// Move the branch pointer only.
    Soft,
    /// Move the branch pointer and leave intermediate commits as orphan
    /// candidates for GC. Requires `force`.
    Hard,
}

/// Outcome of garbage collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GcResult {
    pub commits_removed: usize,
    pub blobs_removed: usize,
    pub tokens_freed: usize,
    /// Subset of `commits_removed` that were compression-archived sources.
    pub source_commits_removed: usize,
    pub duration_seconds: f64,
}
