//! DAG utilities: ancestry, merge bases, branch enumeration.
//!
//! First-parent walks live on [`Storage::get_ancestors`]; everything
//! here expands merge commits through the `commit_parents` side table.
//! Traversal is iterative with explicit queues and visited sets.

use std::collections::{HashSet, VecDeque};

use crate::errors::Result;
use crate::storage::{CommitRow, Storage};

/// Full parent list of a commit: the side-table entries for merges,
/// else the single `parent_hash`.
fn parents_of(store: &Storage, row: &CommitRow) -> Result<Vec<String>> {
    let recorded = store.get_parents(&row.commit_hash)?;
    if recorded.is_empty() {
        Ok(row.parent_hash.iter().cloned().collect())
    } else {
        Ok(recorded)
    }
}

/// Every commit reachable from `start` (inclusive) via multi-parent
/// traversal. Hashes already in `stop_at` are not expanded further.
pub fn get_all_ancestors(
    store: &Storage,
    start: &str,
    stop_at: Option<&HashSet<String>>,
) -> Result<HashSet<String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(start.to_string());

    while let Some(hash) = queue.pop_front() {
        if seen.contains(&hash) || stop_at.is_some_and(|s| s.contains(&hash)) {
            continue;
        }
        let Some(row) = store.get_commit(&hash)? else {
            continue;
        };
        seen.insert(hash);
        for parent in parents_of(store, &row)? {
            if !seen.contains(&parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(seen)
}

/// True iff `ancestor` is reachable from `descendant` via multi-parent
/// walk (a commit is its own ancestor).
pub fn is_ancestor(store: &Storage, ancestor: &str, descendant: &str) -> Result<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(descendant.to_string());

    while let Some(hash) = queue.pop_front() {
        if hash == ancestor {
            return Ok(true);
        }
        if !seen.insert(hash.clone()) {
            continue;
        }
        let Some(row) = store.get_commit(&hash)? else {
            continue;
        };
        for parent in parents_of(store, &row)? {
            if !seen.contains(&parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(false)
}

/// Lowest common ancestor of two commits in the multi-parent DAG.
///
/// Breadth-first from both sides in lockstep; the first node seen from
/// both directions wins. `None` for disjoint histories.
pub fn find_merge_base(store: &Storage, a: &str, b: &str) -> Result<Option<String>> {
    if a == b {
        return Ok(Some(a.to_string()));
    }
    let mut seen_a: HashSet<String> = HashSet::new();
    let mut seen_b: HashSet<String> = HashSet::new();
    let mut queue_a: VecDeque<String> = VecDeque::from([a.to_string()]);
    let mut queue_b: VecDeque<String> = VecDeque::from([b.to_string()]);

    while !queue_a.is_empty() || !queue_b.is_empty() {
        if let Some(found) = step(store, &mut queue_a, &mut seen_a, &seen_b)? {
            return Ok(Some(found));
        }
        if let Some(found) = step(store, &mut queue_b, &mut seen_b, &seen_a)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn step(
    store: &Storage,
    queue: &mut VecDeque<String>,
    seen: &mut HashSet<String>,
    other: &HashSet<String>,
) -> Result<Option<String>> {
    let Some(hash) = queue.pop_front() else {
        return Ok(None);
    };
    if !seen.insert(hash.clone()) {
        return Ok(None);
    }
    if other.contains(&hash) {
        return Ok(Some(hash));
    }
    if let Some(row) = store.get_commit(&hash)? {
        for parent in parents_of(store, &row)? {
            if !seen.contains(&parent) {
                queue.push_back(parent.clone());
            }
        }
    }
    Ok(None)
}

/// Commits exclusive to `tip` since `merge_base`, in chronological
/// (root-first) order. Excludes the merge base itself.
pub fn get_branch_commits(
    store: &Storage,
    tip: &str,
    merge_base: &str,
) -> Result<Vec<CommitRow>> {
    let base_set = get_all_ancestors(store, merge_base, None)?;
    let tip_set = get_all_ancestors(store, tip, Some(&base_set))?;

    let mut rows: Vec<CommitRow> = Vec::with_capacity(tip_set.len());
    for hash in &tip_set {
        if base_set.contains(hash) {
            continue;
        }
        if let Some(row) = store.get_commit(hash)? {
            rows.push(row);
        }
    }
    rows.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.commit_hash.cmp(&b.commit_hash))
    });
    Ok(rows)
}
