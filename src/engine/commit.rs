//! Commit engine: the sole write path for commits, blobs, annotations,
//! and HEAD updates.
//!
//! Enforces:
//! - content-addressed blob storage (dedup via hash)
//! - the immutable parent chain
//! - edit constraints (edits target existing, non-edit commits)
//! - token budget enforcement (warn, reject, callback)
//! - automatic priority annotations for content types with non-NORMAL
//!   defaults
//!
//! Every commit runs inside one storage transaction: a failure at any
//! step leaves no partial state.

use chrono::Utc;
use serde_json::Value;

use crate::config::{BudgetAction, TokenBudgetConfig};
use crate::errors::{Result, TractError};
use crate::hash::{canonical_json_string, commit_hash, content_hash};
use crate::model::annotation::{Priority, PriorityAnnotation, RetentionCriteria};
use crate::model::commit::{CommitInfo, CommitOperation};
use crate::model::content::{default_type_priority, extract_text_from_value, Content};
use crate::storage::rows::{AnnotationRow, BlobRow, CommitRow};
use crate::storage::{format_timestamp, Storage};
use crate::tokens::TokenCounter;

/// Optional fields of a commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub message: Option<String>,
    pub response_to: Option<String>,
    pub metadata: Option<Value>,
    pub generation_config: Option<Value>,
}

impl CommitOptions {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Borrowed view over a tract's storage that performs all writes.
pub struct CommitEngine<'a> {
    store: &'a Storage,
    counter: &'a dyn TokenCounter,
    tract_id: &'a str,
    token_budget: Option<&'a TokenBudgetConfig>,
    forbid_detached: bool,
}

impl<'a> CommitEngine<'a> {
    pub fn new(
        store: &'a Storage,
        counter: &'a dyn TokenCounter,
        tract_id: &'a str,
        token_budget: Option<&'a TokenBudgetConfig>,
        forbid_detached: bool,
    ) -> Self {
        Self {
            store,
            counter,
            tract_id,
            token_budget,
            forbid_detached,
        }
    }

    /// Create a new commit from a built-in content payload.
    pub fn create_commit(
        &self,
        content: &Content,
        operation: CommitOperation,
        opts: CommitOptions,
    ) -> Result<CommitInfo> {
        let value = content.to_value()?;
        self.create_commit_from_value(&value, operation, opts)
    }

    /// Create a new commit from an already-validated payload value.
    ///
    /// Used for custom registered content types; the facade validates
    /// against the type registry before calling this.
    pub fn create_commit_from_value(
        &self,
        value: &Value,
        operation: CommitOperation,
        opts: CommitOptions,
    ) -> Result<CommitInfo> {
        let content_type = value
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let c_hash = content_hash(value)?;
        let text = extract_text_from_value(value);
        let token_count = self.counter.count_text(&text);

        self.store.with_transaction(|store| {
            let now = Utc::now();
            store.save_blob_if_absent(&BlobRow {
                content_hash: c_hash.clone(),
                payload_json: canonical_json_string(value)?,
                byte_size: value.to_string().len(),
                token_count,
                created_at: now,
            })?;

            let parent_hash = store.get_head(self.tract_id)?;

            self.enforce_budget(store, token_count, parent_hash.as_deref())?;

            if self.forbid_detached && store.is_detached(self.tract_id)? {
                return Err(TractError::DetachedHead);
            }

            let timestamp = Utc::now();
            let timestamp_iso = format_timestamp(timestamp);
            let c_commit_hash = commit_hash(
                &c_hash,
                parent_hash.as_deref(),
                &content_type,
                operation.as_str(),
                &timestamp_iso,
                opts.response_to.as_deref(),
                None,
            );

            if operation == CommitOperation::Edit {
                let target = opts.response_to.as_deref().ok_or_else(|| {
                    TractError::EditTarget("EDIT operation requires response_to".to_string())
                })?;
                let target_commit = store.get_commit(target)?.ok_or_else(|| {
                    TractError::EditTarget(format!("EDIT target commit not found: {target}"))
                })?;
                if target_commit.operation == CommitOperation::Edit {
                    return Err(TractError::EditTarget(format!(
                        "Cannot edit an EDIT commit: {target}"
                    )));
                }
            }

            let row = CommitRow {
                commit_hash: c_commit_hash.clone(),
                tract_id: self.tract_id.to_string(),
                parent_hash: parent_hash.clone(),
                content_hash: c_hash.clone(),
                content_type: content_type.clone(),
                operation,
                response_to: opts.response_to.clone(),
                message: opts.message.clone(),
                token_count,
                metadata_json: opts.metadata.clone(),
                generation_config_json: opts.generation_config.clone(),
                created_at: timestamp,
            };
            store.save_commit(&row)?;
            store.update_head(self.tract_id, &c_commit_hash)?;

            let default_priority = default_type_priority(&content_type);
            if default_priority != Priority::Normal {
                store.save_annotation(&AnnotationRow {
                    id: 0,
                    tract_id: self.tract_id.to_string(),
                    target_hash: c_commit_hash.clone(),
                    priority: default_priority,
                    retention: None,
                    reason: Some(format!("Default priority for {content_type}")),
                    created_at: timestamp,
                })?;
            }

            Ok(row.to_info())
        })
    }

    /// Create a merge commit with multiple parents.
    ///
    /// `parent_hashes[0]` becomes `commits.parent_hash`; the full list
    /// is recorded in `commit_parents` and participates in the hash.
    /// Operation is always APPEND; edit checks do not apply.
    pub fn create_merge_commit(
        &self,
        content: &Content,
        parent_hashes: &[String],
        opts: CommitOptions,
    ) -> Result<CommitInfo> {
        if parent_hashes.is_empty() {
            return Err(TractError::Merge(
                "merge commit requires at least one parent".to_string(),
            ));
        }
        let value = content.to_value()?;
        let content_type = content.content_type().to_string();
        let c_hash = content_hash(&value)?;
        let text = content.extract_text();
        let token_count = self.counter.count_text(&text);

        self.store.with_transaction(|store| {
            let now = Utc::now();
            store.save_blob_if_absent(&BlobRow {
                content_hash: c_hash.clone(),
                payload_json: canonical_json_string(&value)?,
                byte_size: value.to_string().len(),
                token_count,
                created_at: now,
            })?;

            let first_parent = parent_hashes.first().cloned();
            let extra_parents: Vec<String> = parent_hashes.iter().skip(1).cloned().collect();

            let timestamp = Utc::now();
            let timestamp_iso = format_timestamp(timestamp);
            let c_commit_hash = commit_hash(
                &c_hash,
                first_parent.as_deref(),
                &content_type,
                CommitOperation::Append.as_str(),
                &timestamp_iso,
                None,
                if extra_parents.is_empty() {
                    None
                } else {
                    Some(&extra_parents)
                },
            );

            let row = CommitRow {
                commit_hash: c_commit_hash.clone(),
                tract_id: self.tract_id.to_string(),
                parent_hash: first_parent,
                content_hash: c_hash.clone(),
                content_type,
                operation: CommitOperation::Append,
                response_to: None,
                message: opts.message.clone(),
                token_count,
                metadata_json: opts.metadata.clone(),
                generation_config_json: opts.generation_config.clone(),
                created_at: timestamp,
            };
            store.save_commit(&row)?;
            store.add_parents(&c_commit_hash, parent_hashes)?;
            store.update_head(self.tract_id, &c_commit_hash)?;

            Ok(row.to_info())
        })
    }

    /// Append a priority annotation to an existing commit.
    pub fn annotate(
        &self,
        target_hash: &str,
        priority: Priority,
        retention: Option<RetentionCriteria>,
        reason: Option<String>,
    ) -> Result<PriorityAnnotation> {
        if self.store.get_commit(target_hash)?.is_none() {
            return Err(TractError::CommitNotFound(target_hash.to_string()));
        }
        let now = Utc::now();
        let row = AnnotationRow {
            id: 0,
            tract_id: self.tract_id.to_string(),
            target_hash: target_hash.to_string(),
            priority,
            retention: retention.clone(),
            reason: reason.clone(),
            created_at: now,
        };
        let id = self.store.save_annotation(&row)?;
        Ok(PriorityAnnotation {
            id,
            tract_id: self.tract_id.to_string(),
            target_hash: target_hash.to_string(),
            priority,
            retention,
            reason,
            created_at: now,
        })
    }

    /// Read-only commit lookup.
    pub fn get_commit(&self, commit_hash: &str) -> Result<Option<CommitInfo>> {
        Ok(self.store.get_commit(commit_hash)?.map(|row| row.to_info()))
    }

    fn enforce_budget(
        &self,
        store: &Storage,
        new_tokens: usize,
        parent_hash: Option<&str>,
    ) -> Result<()> {
        let Some(budget) = self.token_budget else {
            return Ok(());
        };
        let mut total = new_tokens;
        if let Some(parent) = parent_hash {
            for ancestor in store.get_ancestors(parent, None, None)? {
                total += ancestor.token_count;
            }
        }
        if total <= budget.max_tokens {
            return Ok(());
        }
        match budget.action {
            BudgetAction::Reject => Err(TractError::BudgetExceeded {
                current_tokens: total,
                max_tokens: budget.max_tokens,
            }),
            BudgetAction::Warn => {
                tracing::warn!(
                    current = total,
                    max = budget.max_tokens,
                    "token budget exceeded"
                );
                Ok(())
            }
            BudgetAction::Callback => {
                if let Some(callback) = &budget.callback {
                    callback(total, budget.max_tokens);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicCounter;

    fn engine<'a>(store: &'a Storage, counter: &'a HeuristicCounter) -> CommitEngine<'a> {
        CommitEngine::new(store, counter, "t", None, false)
    }

    /// HEAD follows each commit; parents chain correctly.
    #[test]
    fn test_parent_chain_and_head() {
        let store = Storage::open(":memory:").expect("open");
        let counter = HeuristicCounter;
        let engine = engine(&store, &counter);

        let first = engine
            .create_commit(&Content::user("one"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        assert_eq!(first.parent_hash, None);
        assert_eq!(store.get_head("t").expect("head").as_deref(), Some(first.commit_hash.as_str()));

        let second = engine
            .create_commit(&Content::user("two"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        assert_eq!(second.parent_hash.as_deref(), Some(first.commit_hash.as_str()));
        assert_eq!(
            store.get_head("t").expect("head").as_deref(),
            Some(second.commit_hash.as_str())
        );
    }

    /// Committing the same content twice dedups the blob but yields
    /// distinct commits.
    #[test]
    fn test_blob_dedup() {
        let store = Storage::open(":memory:").expect("open");
        let counter = HeuristicCounter;
        let engine = engine(&store, &counter);

        let a = engine
            .create_commit(&Content::user("same"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        let b = engine
            .create_commit(&Content::user("same"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        assert_ne!(a.commit_hash, b.commit_hash);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(store.count_blobs().expect("count"), 1);
    }

    /// Edit constraints: target must exist and must not be an edit.
    #[test]
    fn test_edit_constraints() {
        let store = Storage::open(":memory:").expect("open");
        let counter = HeuristicCounter;
        let engine = engine(&store, &counter);

        let base = engine
            .create_commit(&Content::user("v0"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");

        // Missing response_to.
        let err = engine
            .create_commit(&Content::user("v1"), CommitOperation::Edit, CommitOptions::default())
            .unwrap_err();
        assert!(matches!(err, TractError::EditTarget(_)));

        // Unknown target.
        let err = engine
            .create_commit(
                &Content::user("v1"),
                CommitOperation::Edit,
                CommitOptions {
                    response_to: Some("0".repeat(64)),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TractError::EditTarget(_)));

        // Valid edit.
        let edit = engine
            .create_commit(
                &Content::user("v1"),
                CommitOperation::Edit,
                CommitOptions {
                    response_to: Some(base.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .expect("edit");

        // Edits of edits are forbidden.
        let err = engine
            .create_commit(
                &Content::user("v2"),
                CommitOperation::Edit,
                CommitOptions {
                    response_to: Some(edit.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TractError::EditTarget(_)));
    }

    /// Instruction commits auto-annotate as PINNED.
    #[test]
    fn test_auto_annotation() {
        let store = Storage::open(":memory:").expect("open");
        let counter = HeuristicCounter;
        let engine = engine(&store, &counter);

        let info = engine
            .create_commit(
                &Content::instruction("be brief"),
                CommitOperation::Append,
                CommitOptions::default(),
            )
            .expect("commit");
        let annotation = store
            .get_latest_annotation(&info.commit_hash)
            .expect("query")
            .expect("present");
        assert_eq!(annotation.priority, Priority::Pinned);
    }

    /// Budget rejection leaves no partial commit.
    #[test]
    fn test_budget_reject_no_state_change() {
        let store = Storage::open(":memory:").expect("open");
        let counter = HeuristicCounter;
        let budget = TokenBudgetConfig::reject(1);
        let engine = CommitEngine::new(&store, &counter, "t", Some(&budget), false);

        let err = engine
            .create_commit(
                &Content::user("this is well over one token"),
                CommitOperation::Append,
                CommitOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TractError::BudgetExceeded { .. }));
        assert_eq!(store.get_head("t").expect("head"), None);
        assert_eq!(store.count_blobs().expect("count"), 0);
    }

    /// Merge commits record every parent and hash the full parent list.
    #[test]
    fn test_merge_commit_parents() {
        let store = Storage::open(":memory:").expect("open");
        let counter = HeuristicCounter;
        let engine = engine(&store, &counter);

        let a = engine
            .create_commit(&Content::user("a"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        let b = engine
            .create_commit(&Content::user("b"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");

        let merge = engine
            .create_merge_commit(
                &Content::Freeform {
                    payload: serde_json::json!({"message": "merge"}),
                },
                &[b.commit_hash.clone(), a.commit_hash.clone()],
                CommitOptions::default(),
            )
            .expect("merge");
        assert_eq!(merge.parent_hash.as_deref(), Some(b.commit_hash.as_str()));
        assert_eq!(
            store.get_parents(&merge.commit_hash).expect("parents"),
            vec![b.commit_hash, a.commit_hash]
        );
    }
}
