//! Garbage collection.
//!
//! Reachability is the union of multi-parent ancestor sets over every
//! ref tip (including detached HEAD). Ref-reachable commits are never
//! removed, regardless of age. Two classes of unreachable commits are
//! candidates:
//!
//! - orphans (abandoned by resets, rebases, and rebuilds), removable
//!   after `orphan_retention_days`;
//! - archived compression sources (listed in some summary commit's
//!   `compressed_sources` metadata), removable after
//!   `archive_retention_days`.
//!
//! A `None` retention means keep forever. Removal order: commits, then
//! their `commit_parents` entries, then blobs with no remaining
//! referrers.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{Duration, Utc};
use serde_json::Value;

use crate::dag::get_all_ancestors;
use crate::errors::Result;
use crate::model::results::GcResult;
use crate::storage::{CommitRow, Storage};

/// Retention windows for one GC run.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcOptions {
    /// Days an unreachable non-archived commit survives. `None` = keep
    /// forever.
    pub orphan_retention_days: Option<f64>,
    /// Days an archived compression source survives. `None` = keep
    /// forever.
    pub archive_retention_days: Option<f64>,
}

/// A planned GC run: what would be removed and why.
#[derive(Debug, Clone, Default)]
pub struct GcPlan {
    pub orphan_candidates: Vec<CommitRow>,
    pub archived_candidates: Vec<CommitRow>,
}

impl GcPlan {
    pub fn is_empty(&self) -> bool {
        self.orphan_candidates.is_empty() && self.archived_candidates.is_empty()
    }

    pub fn candidate_count(&self) -> usize {
        self.orphan_candidates.len() + self.archived_candidates.len()
    }
}

/// Compute the removal plan without touching storage.
pub fn plan_gc(store: &Storage, tract_id: &str, opts: &GcOptions) -> Result<GcPlan> {
    let mut reachable: HashSet<String> = HashSet::new();
    for tip in store.all_ref_tips(tract_id)? {
        let ancestors = get_all_ancestors(store, &tip, Some(&reachable))?;
        reachable.extend(ancestors);
    }

    let all_commits = store.get_all_commits(tract_id)?;
    let archived = archived_sources(&all_commits);
    let now = Utc::now();

    let mut plan = GcPlan::default();
    for row in all_commits {
        if reachable.contains(&row.commit_hash) {
            continue;
        }
        let (retention_days, bucket) = if archived.contains(&row.commit_hash) {
            (opts.archive_retention_days, &mut plan.archived_candidates)
        } else {
            (opts.orphan_retention_days, &mut plan.orphan_candidates)
        };
        let Some(days) = retention_days else {
            continue;
        };
        let cutoff = now - Duration::seconds((days * 86_400.0) as i64);
        if row.created_at <= cutoff {
            bucket.push(row);
        }
    }
    Ok(plan)
}

/// Execute a plan: remove commits, their relation rows, and any blobs
/// left without referrers.
pub fn apply_gc(store: &Storage, plan: &GcPlan) -> Result<GcResult> {
    let started = Instant::now();

    let result = store.with_transaction(|store| {
        let mut result = GcResult {
            source_commits_removed: plan.archived_candidates.len(),
            ..Default::default()
        };
        let mut touched_blobs: HashSet<String> = HashSet::new();

        for row in plan
            .orphan_candidates
            .iter()
            .chain(plan.archived_candidates.iter())
        {
            store.delete_annotations_for(&row.commit_hash)?;
            store.delete_commit_tools(&row.commit_hash)?;
            store.delete_parents(&row.commit_hash)?;
            store.delete_commit(&row.commit_hash)?;
            touched_blobs.insert(row.content_hash.clone());
            result.commits_removed += 1;
            result.tokens_freed += row.token_count;
        }

        for content_hash in touched_blobs {
            if store.count_commits_for_content(&content_hash)? == 0 {
                store.delete_blob(&content_hash)?;
                result.blobs_removed += 1;
            }
        }
        Ok(result)
    })?;

    let mut result = result;
    result.duration_seconds = started.elapsed().as_secs_f64();
    tracing::info!(
        commits = result.commits_removed,
        blobs = result.blobs_removed,
        tokens = result.tokens_freed,
        "garbage collection complete"
    );
    Ok(result)
}

/// Hashes listed as compression sources in any summary commit's
/// metadata.
fn archived_sources(commits: &[CommitRow]) -> HashSet<String> {
    let mut archived = HashSet::new();
    for row in commits {
        let Some(metadata) = &row.metadata_json else {
            continue;
        };
        let Some(sources) = metadata.get("compressed_sources").and_then(Value::as_array) else {
            continue;
        };
        for source in sources {
            if let Some(hash) = source.as_str() {
                archived.insert(hash.to_string());
            }
        }
    }
    archived
}
