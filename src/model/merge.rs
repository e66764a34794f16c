//! Merge result and conflict models.
//!
//! A merge either fast-forwards, commits cleanly, or surfaces structural
//! conflicts. Conflicts are never raised by default: the operation
//! returns an uncommitted [`MergeResult`] carrying the conflict list,
//! which the facade lifts into a `PendingMerge` for review.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::commit::CommitInfo;

/// Structural conflict classes detected between two divergent branches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both branches EDIT the same target commit.
    BothEdit,
    /// One branch SKIPs a commit the other branch EDITs.
    SkipVsEdit,
    /// One branch EDITs a pre-merge-base commit while the other has
    /// APPENDs. Edits of commits introduced since the base are fine.
    EditPlusAppend,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictKind::BothEdit => "both_edit",
            ConflictKind::SkipVsEdit => "skip_vs_edit",
            ConflictKind::EditPlusAppend => "edit_plus_append",
        };
        f.write_str(s)
    }
}

/// One detected conflict, with enough context for a resolver to decide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictInfo {
    pub conflict_type: ConflictKind,
    /// The contested commit in shared history (the edit target).
    pub target_hash: String,
    /// The conflicting commit on the current branch (or its stand-in).
    pub commit_a: CommitInfo,
    /// The conflicting commit on the source branch (or its stand-in).
    pub commit_b: CommitInfo,
    pub content_a_text: String,
    pub content_b_text: String,
}

/// How the merge concluded (or would conclude).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    /// Branch pointer moved; no commit created.
    FastForward,
    /// Divergent histories merged without conflicts.
    Clean,
    /// Conflicts detected (and possibly resolved).
    Conflict,
    /// Conflicts resolved by the semantic strategy's resolver.
    Semantic,
}

/// Outcome of a merge attempt.
///
/// `committed == false` with a non-empty `conflicts` list means the
/// caller (or a `PendingMerge`) still has to resolve and commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeResult {
    pub merge_type: MergeType,
    pub source_branch: String,
    pub target_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_base_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictInfo>,
    /// Resolution text per conflict target hash.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolutions: BTreeMap<String, String>,
    /// Optional resolver reasoning per conflict target hash.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolution_reasoning: BTreeMap<String, String>,
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit_hash: Option<String>,
    pub source_tip_hash: String,
    pub target_tip_hash: String,
}

impl MergeResult {
    /// True when every detected conflict has a resolution recorded.
    pub fn fully_resolved(&self) -> bool {
        self.conflicts
            .iter()
            .all(|c| self.resolutions.contains_key(&c.target_hash))
    }
}

/// What a resolver decided for one conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Resolved,
    Abort,
}

/// A resolver's answer for a single conflict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resolution {
    pub action: ResolutionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Value>,
}

impl Resolution {
    pub fn resolved(text: impl Into<String>) -> Self {
        Self {
            action: ResolutionAction::Resolved,
            content_text: Some(text.into()),
            reasoning: None,
            generation_config: None,
        }
    }

    pub fn abort(reasoning: impl Into<String>) -> Self {
        Self {
            action: ResolutionAction::Abort,
            content_text: None,
            reasoning: Some(reasoning.into()),
            generation_config: None,
        }
    }
}
