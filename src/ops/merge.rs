//! Merge operations: fast-forward, clean auto-merge with branch-blocks
//! ordering, structural conflict detection, and resolver-mediated
//! conflict merges.

use serde_json::Value;

use crate::dag::{find_merge_base, get_branch_commits, is_ancestor};
use crate::engine::commit::{CommitEngine, CommitOptions};
use crate::errors::{Result, TractError};
use crate::llm::resolver::ConflictResolver;
use crate::model::annotation::Priority;
use crate::model::commit::{CommitInfo, CommitOperation};
use crate::model::content::{extract_text_from_value, Content};
use crate::model::merge::{
    ConflictInfo, ConflictKind, MergeResult, MergeType, ResolutionAction,
};
use crate::storage::{CommitRow, Storage};

/// Merge strategy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeStrategy {
    #[default]
    Auto,
    Semantic,
}

/// Load the primary text of a commit's blob, empty on failure.
fn load_content_text(store: &Storage, content_hash: &str) -> String {
    let Ok(Some(blob)) = store.get_blob(content_hash) else {
        return String::new();
    };
    match blob.payload() {
        Ok(data) => extract_text_from_value(&data),
        Err(_) => String::new(),
    }
}

/// Detect structural merge conflicts between two divergent branches.
///
/// Three conflict classes:
/// 1. `both_edit`: both branches EDIT the same target.
/// 2. `skip_vs_edit`: the latest annotation SKIPs a commit one branch
///    EDITs.
/// 3. `edit_plus_append`: one branch EDITs a pre-merge-base commit
///    while the other branch has APPENDs.
pub fn detect_conflicts(
    store: &Storage,
    branch_a: &[CommitRow],
    branch_b: &[CommitRow],
) -> Result<Vec<ConflictInfo>> {
    let mut conflicts = Vec::new();

    let a_edits: Vec<&CommitRow> = branch_a
        .iter()
        .filter(|r| r.operation == CommitOperation::Edit && r.response_to.is_some())
        .collect();
    let b_edits: Vec<&CommitRow> = branch_b
        .iter()
        .filter(|r| r.operation == CommitOperation::Edit && r.response_to.is_some())
        .collect();

    let a_targets: std::collections::HashSet<&str> = a_edits
        .iter()
        .filter_map(|r| r.response_to.as_deref())
        .collect();
    let b_targets: std::collections::HashSet<&str> = b_edits
        .iter()
        .filter_map(|r| r.response_to.as_deref())
        .collect();
    let common_targets: std::collections::HashSet<&str> =
        a_targets.intersection(&b_targets).copied().collect();

    // 1. Both branches edit the same target.
    let mut reported: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for edit_a in &a_edits {
        let target = edit_a.response_to.as_deref().expect("filtered");
        if !common_targets.contains(target) || !reported.insert(target) {
            continue;
        }
        let Some(edit_b) = b_edits
            .iter()
            .find(|r| r.response_to.as_deref() == Some(target))
        else {
            continue;
        };
        conflicts.push(ConflictInfo {
            conflict_type: ConflictKind::BothEdit,
            target_hash: target.to_string(),
            commit_a: edit_a.to_info(),
            commit_b: edit_b.to_info(),
            content_a_text: load_content_text(store, &edit_a.content_hash),
            content_b_text: load_content_text(store, &edit_b.content_hash),
        });
    }

    // 2. One side's latest annotation SKIPs a commit the other edits.
    for (edits, skipped_side_is_a) in [(&b_edits, true), (&a_edits, false)] {
        for edit in edits.iter() {
            let target = edit.response_to.as_deref().expect("filtered");
            if common_targets.contains(target) {
                continue;
            }
            let Some(annotation) = store.get_latest_annotation(target)? else {
                continue;
            };
            if annotation.priority != Priority::Skip {
                continue;
            }
            let edit_text = load_content_text(store, &edit.content_hash);
            let (content_a_text, content_b_text) = if skipped_side_is_a {
                ("[SKIPPED]".to_string(), edit_text)
            } else {
                (edit_text, "[SKIPPED]".to_string())
            };
            conflicts.push(ConflictInfo {
                conflict_type: ConflictKind::SkipVsEdit,
                target_hash: target.to_string(),
                commit_a: edit.to_info(),
                commit_b: edit.to_info(),
                content_a_text,
                content_b_text,
            });
        }
    }

    // 3. Pre-merge-base edits racing the other branch's appends.
    let divergent: std::collections::HashSet<&str> = branch_a
        .iter()
        .chain(branch_b.iter())
        .map(|r| r.commit_hash.as_str())
        .collect();
    let a_first_append = branch_a
        .iter()
        .find(|r| r.operation == CommitOperation::Append);
    let b_first_append = branch_b
        .iter()
        .find(|r| r.operation == CommitOperation::Append);

    for (edits, other_append, edit_side_is_a) in [
        (&a_edits, b_first_append, true),
        (&b_edits, a_first_append, false),
    ] {
        let Some(append) = other_append else {
            continue;
        };
        for edit in edits.iter() {
            let target = edit.response_to.as_deref().expect("filtered");
            if common_targets.contains(target) || divergent.contains(target) {
                continue;
            }
            let (commit_a, commit_b, text_a, text_b) = if edit_side_is_a {
                (
                    edit.to_info(),
                    append.to_info(),
                    load_content_text(store, &edit.content_hash),
                    load_content_text(store, &append.content_hash),
                )
            } else {
                (
                    append.to_info(),
                    edit.to_info(),
                    load_content_text(store, &append.content_hash),
                    load_content_text(store, &edit.content_hash),
                )
            };
            conflicts.push(ConflictInfo {
                conflict_type: ConflictKind::EditPlusAppend,
                target_hash: target.to_string(),
                commit_a,
                commit_b,
                content_a_text: text_a,
                content_b_text: text_b,
            });
        }
    }

    Ok(conflicts)
}

/// Execute a merge of `source_branch` into the current branch.
///
/// Fast-forwards when possible (unless `no_ff`), auto-merges clean
/// divergent histories, and otherwise returns an uncommitted result
/// carrying the conflicts, with the resolver (when provided) consulted
/// per conflict.
pub fn merge_branches(
    store: &Storage,
    engine: &CommitEngine<'_>,
    tract_id: &str,
    source_branch: &str,
    resolver: Option<&dyn ConflictResolver>,
    strategy: MergeStrategy,
    no_ff: bool,
) -> Result<MergeResult> {
    let current_branch = store
        .get_current_branch(tract_id)?
        .ok_or_else(|| TractError::Merge("cannot merge in detached HEAD state".to_string()))?;
    let source_hash = store
        .get_branch(tract_id, source_branch)?
        .ok_or_else(|| TractError::BranchNotFound(source_branch.to_string()))?;
    let current_hash = store
        .get_head(tract_id)?
        .ok_or_else(|| TractError::Merge("cannot merge: no commits on current branch".to_string()))?;

    if current_hash == source_hash {
        return Err(TractError::NothingToMerge(source_branch.to_string()));
    }

    // Fast-forward when the current tip is behind the source.
    if is_ancestor(store, &current_hash, &source_hash)? && !no_ff {
        store.set_branch(tract_id, &current_branch, &source_hash)?;
        return Ok(MergeResult {
            merge_type: MergeType::FastForward,
            source_branch: source_branch.to_string(),
            target_branch: current_branch,
            merge_base_hash: None,
            conflicts: Vec::new(),
            resolutions: Default::default(),
            resolution_reasoning: Default::default(),
            committed: true,
            merge_commit_hash: Some(source_hash.clone()),
            source_tip_hash: source_hash,
            target_tip_hash: current_hash,
        });
    }

    let merge_base = find_merge_base(store, &current_hash, &source_hash)?;
    if merge_base.as_deref() == Some(source_hash.as_str()) {
        return Err(TractError::NothingToMerge(source_branch.to_string()));
    }

    let (a_commits, b_commits) = match &merge_base {
        Some(base) => (
            get_branch_commits(store, &current_hash, base)?,
            get_branch_commits(store, &source_hash, base)?,
        ),
        None => {
            // Disjoint histories: everything is divergent.
            let mut a: Vec<CommitRow> = store.get_ancestors(&current_hash, None, None)?;
            let mut b: Vec<CommitRow> = store.get_ancestors(&source_hash, None, None)?;
            a.reverse();
            b.reverse();
            (a, b)
        }
    };

    let conflicts = detect_conflicts(store, &a_commits, &b_commits)?;

    if conflicts.is_empty() {
        let merge_info = create_merge_commit(
            engine,
            &current_branch,
            source_branch,
            &[current_hash.clone(), source_hash.clone()],
            None,
        )?;
        return Ok(MergeResult {
            merge_type: MergeType::Clean,
            source_branch: source_branch.to_string(),
            target_branch: current_branch,
            merge_base_hash: merge_base,
            conflicts: Vec::new(),
            resolutions: Default::default(),
            resolution_reasoning: Default::default(),
            committed: true,
            merge_commit_hash: Some(merge_info.commit_hash),
            source_tip_hash: source_hash,
            target_tip_hash: current_hash,
        });
    }

    let mut result = MergeResult {
        merge_type: MergeType::Conflict,
        source_branch: source_branch.to_string(),
        target_branch: current_branch,
        merge_base_hash: merge_base,
        conflicts,
        resolutions: Default::default(),
        resolution_reasoning: Default::default(),
        committed: false,
        merge_commit_hash: None,
        source_tip_hash: source_hash,
        target_tip_hash: current_hash,
    };

    if let Some(resolver) = resolver {
        for conflict in result.conflicts.clone() {
            let resolution = resolver.resolve(&conflict)?;
            match resolution.action {
                ResolutionAction::Resolved => {
                    if let Some(text) = resolution.content_text {
                        result
                            .resolutions
                            .insert(conflict.target_hash.clone(), text);
                        if let Some(reasoning) = resolution.reasoning {
                            result
                                .resolution_reasoning
                                .insert(conflict.target_hash.clone(), reasoning);
                        }
                    }
                }
                ResolutionAction::Abort => {
                    return Err(TractError::Merge(format!(
                        "resolver aborted merge: {}",
                        resolution.reasoning.unwrap_or_default()
                    )));
                }
            }
        }
        if result.fully_resolved() {
            result.merge_type = match strategy {
                MergeStrategy::Semantic => MergeType::Semantic,
                MergeStrategy::Auto => MergeType::Conflict,
            };
        }
    }

    Ok(result)
}

/// Create the merge commit for a (possibly resolved) merge and apply
/// each recorded resolution as an EDIT of its conflict target.
pub fn commit_resolved_merge(
    store: &Storage,
    engine: &CommitEngine<'_>,
    result: &MergeResult,
) -> Result<CommitInfo> {
    if !result.fully_resolved() {
        let unresolved = result
            .conflicts
            .iter()
            .filter(|c| !result.resolutions.contains_key(&c.target_hash))
            .count();
        return Err(TractError::MergeConflict {
            conflict_count: unresolved,
        });
    }

    let merge_info = create_merge_commit(
        engine,
        &result.target_branch,
        &result.source_branch,
        &[
            result.target_tip_hash.clone(),
            result.source_tip_hash.clone(),
        ],
        Some(serde_json::json!({
            "resolutions": result.resolutions,
            "resolution_reasoning": result.resolution_reasoning,
        })),
    )?;

    // Apply each resolution as an EDIT so compile picks up the merged
    // text for the contested commits.
    for (target, text) in &result.resolutions {
        let target_row = store
            .get_commit(target)?
            .ok_or_else(|| TractError::CommitNotFound(target.clone()))?;
        let content = resolution_content(store, &target_row, text)?;
        engine.create_commit_from_value(
            &content,
            CommitOperation::Edit,
            CommitOptions {
                message: Some(format!(
                    "Merge resolution for {}",
                    &target[..target.len().min(8)]
                )),
                response_to: Some(target.clone()),
                ..Default::default()
            },
        )?;
    }

    Ok(merge_info)
}

/// Rebuild the target commit's payload with the resolved text in its
/// primary text slot, keeping the rest of the payload intact.
fn resolution_content(store: &Storage, target: &CommitRow, text: &str) -> Result<Value> {
    let blob = store
        .get_blob(&target.content_hash)?
        .ok_or_else(|| TractError::BlobNotFound(target.content_hash.clone()))?;
    let mut value = blob.payload()?;
    match value.as_object_mut() {
        Some(map) if map.contains_key("content") && !map.contains_key("text") => {
            map.insert("content".to_string(), Value::String(text.to_string()));
        }
        Some(map) => {
            map.insert("text".to_string(), Value::String(text.to_string()));
        }
        None => {
            value = serde_json::json!({
                "content_type": target.content_type.clone(),
                "text": text,
            });
        }
    }
    Ok(value)
}

fn create_merge_commit(
    engine: &CommitEngine<'_>,
    target_branch: &str,
    source_branch: &str,
    parent_hashes: &[String],
    metadata: Option<Value>,
) -> Result<CommitInfo> {
    let content = Content::Freeform {
        payload: serde_json::json!({
            "message": format!("Merged {source_branch} into {target_branch}"),
        }),
    };
    engine.create_merge_commit(
        &content,
        parent_hashes,
        CommitOptions {
            message: Some(format!(
                "Merge branch '{source_branch}' into {target_branch}"
            )),
            metadata,
            ..Default::default()
        },
    )
}
