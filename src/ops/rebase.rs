//! Rebase, cherry-pick, and reset.
//!
//! Rebase replays the current branch's exclusive commits onto the
//! target tip: content is preserved, hashes change (new parent lineage
//! and timestamps). Cherry-pick imports one commit's content as a new
//! APPEND on the current branch. Reset moves the branch pointer and, in
//! hard mode, leaves the abandoned commits as GC orphan candidates.

use std::collections::HashMap;

use crate::dag::{find_merge_base, get_all_ancestors, get_branch_commits};
use crate::engine::commit::{CommitEngine, CommitOptions};
use crate::errors::{Result, TractError};
use crate::model::commit::CommitOperation;
use crate::model::results::{ImportResult, RebaseResult, ResetMode};
use crate::storage::Storage;

/// Replay the current branch's exclusive commits onto `target_branch`.
pub fn rebase(
    store: &Storage,
    engine: &CommitEngine<'_>,
    tract_id: &str,
    target_branch: &str,
) -> Result<RebaseResult> {
    let current_branch = store
        .get_current_branch(tract_id)?
        .ok_or_else(|| TractError::Rebase("cannot rebase in detached HEAD state".to_string()))?;
    let target_hash = store
        .get_branch(tract_id, target_branch)?
        .ok_or_else(|| TractError::BranchNotFound(target_branch.to_string()))?;
    let current_hash = store
        .get_head(tract_id)?
        .ok_or_else(|| TractError::Rebase("no commits on current branch".to_string()))?;

    if current_hash == target_hash {
        return Err(TractError::Rebase(format!(
            "branch is already at '{target_branch}'"
        )));
    }

    let merge_base = find_merge_base(store, &current_hash, &target_hash)?;

    // Already based on the target: just move the pointer forward.
    if merge_base.as_deref() == Some(current_hash.as_str()) {
        store.set_branch(tract_id, &current_branch, &target_hash)?;
        return Ok(RebaseResult {
            replayed_commits: Vec::new(),
            original_commits: Vec::new(),
            new_head: target_hash,
            warnings: Vec::new(),
        });
    }

    let to_replay = match &merge_base {
        Some(base) => get_branch_commits(store, &current_hash, base)?,
        None => {
            let mut all = store.get_ancestors(&current_hash, None, None)?;
            all.reverse();
            all
        }
    };

    let target_ancestors = get_all_ancestors(store, &target_hash, None)?;

    // Point the branch at the target tip; the engine then builds the
    // replayed chain on top of it.
    store.set_branch(tract_id, &current_branch, &target_hash)?;

    let mut warnings: Vec<String> = Vec::new();
    let mut replayed = Vec::with_capacity(to_replay.len());
    let mut original_commits = Vec::with_capacity(to_replay.len());
    let mut remapped: HashMap<String, String> = HashMap::new();

    for row in &to_replay {
        let blob = store
            .get_blob(&row.content_hash)?
            .ok_or_else(|| TractError::BlobNotFound(row.content_hash.clone()))?;
        let value = blob.payload()?;

        let mut operation = row.operation;
        let mut response_to = row.response_to.clone();
        if operation == CommitOperation::Edit {
            match &row.response_to {
                Some(target) if remapped.contains_key(target) => {
                    response_to = Some(remapped[target].clone());
                }
                Some(target) if target_ancestors.contains(target) => {
                    // Target survives in the new lineage untouched.
                }
                Some(target) => {
                    warnings.push(format!(
                        "edit target {} is not in the new lineage; replayed as append",
                        &target[..target.len().min(8)]
                    ));
                    operation = CommitOperation::Append;
                    response_to = None;
                }
                None => {}
            }
        }

        let info = engine.create_commit_from_value(
            &value,
            operation,
            CommitOptions {
                message: row.message.clone(),
                response_to,
                metadata: row.metadata_json.clone(),
                generation_config: row.generation_config_json.clone(),
            },
        )?;
        remapped.insert(row.commit_hash.clone(), info.commit_hash.clone());
        original_commits.push(row.commit_hash.clone());
        replayed.push(info);
    }

    let new_head = store
        .get_head(tract_id)?
        .ok_or_else(|| TractError::Rebase("rebase produced no head".to_string()))?;

    Ok(RebaseResult {
        replayed_commits: replayed,
        original_commits,
        new_head,
        warnings,
    })
}

/// Cherry-pick: create a new APPEND on the current branch with the same
/// content as `source_hash`.
pub fn import_commit(
    store: &Storage,
    engine: &CommitEngine<'_>,
    source_hash: &str,
) -> Result<ImportResult> {
    let source = store
        .get_commit(source_hash)?
        .ok_or_else(|| TractError::CommitNotFound(source_hash.to_string()))?;
    if source.operation == CommitOperation::Edit {
        return Err(TractError::ImportCommit(format!(
            "cannot import EDIT commit {}; import its target instead",
            &source_hash[..source_hash.len().min(8)]
        )));
    }
    let blob = store
        .get_blob(&source.content_hash)?
        .ok_or_else(|| TractError::BlobNotFound(source.content_hash.clone()))?;
    let value = blob.payload()?;

    let imported = engine.create_commit_from_value(
        &value,
        CommitOperation::Append,
        CommitOptions {
            message: source.message.clone(),
            metadata: Some(serde_json::json!({ "imported_from": source_hash })),
            generation_config: source.generation_config_json.clone(),
            ..Default::default()
        },
    )?;

    Ok(ImportResult {
        original: source.to_info(),
        imported,
    })
}

/// Move the current branch pointer (or detached HEAD) to `target_hash`.
pub fn reset(
    store: &Storage,
    tract_id: &str,
    target_hash: &str,
    mode: ResetMode,
    force: bool,
) -> Result<()> {
    if mode == ResetMode::Hard && !force {
        return Err(TractError::InvalidArgument(
            "hard reset discards commits; pass force=true to confirm".to_string(),
        ));
    }
    if store.get_commit(target_hash)?.is_none() {
        return Err(TractError::CommitNotFound(target_hash.to_string()));
    }

    match store.get_current_branch(tract_id)? {
        Some(branch) => store.set_branch(tract_id, &branch, target_hash)?,
        None => store.detach_head(tract_id, target_hash)?,
    }

    if mode == ResetMode::Hard {
        tracing::info!(
            target = %&target_hash[..target_hash.len().min(12)],
            "hard reset; abandoned commits become GC orphan candidates"
        );
    }
    Ok(())
}
