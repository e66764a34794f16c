//! PendingMerge: a conflicted merge awaiting resolutions.

use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::hooks::pending::{ActionSpec, ParamSpec, PendingMeta, PendingReview};
use crate::hooks::{AutoRetry, ValidationResult};
use crate::model::merge::{ConflictInfo, MergeResult};
use crate::tract::Tract;

const ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "approve",
        description: "Commit the merge with the recorded resolutions.",
        params: &[],
    },
    ActionSpec {
        name: "reject",
        description: "Abandon the merge, leaving both branches untouched.",
        params: &[ParamSpec {
            name: "reason",
            kind: "string",
            required: false,
            description: "Why the merge was rejected.",
        }],
    },
    ActionSpec {
        name: "edit_resolution",
        description: "Replace an existing resolution for a conflict target.",
        params: &[
            ParamSpec {
                name: "target",
                kind: "string",
                required: true,
                description: "Conflict target hash.",
            },
            ParamSpec {
                name: "text",
                kind: "string",
                required: true,
                description: "Replacement resolution text.",
            },
        ],
    },
    ActionSpec {
        name: "set_resolution",
        description: "Record a resolution for a conflict target.",
        params: &[
            ParamSpec {
                name: "target",
                kind: "string",
                required: true,
                description: "Conflict target hash.",
            },
            ParamSpec {
                name: "text",
                kind: "string",
                required: true,
                description: "Resolution text.",
            },
        ],
    },
    ActionSpec {
        name: "retry",
        description: "Re-run the LLM resolver for every conflict.",
        params: &[ParamSpec {
            name: "guidance",
            kind: "string",
            required: false,
            description: "Extra guidance injected into the resolver prompt.",
        }],
    },
    ActionSpec {
        name: "validate",
        description: "Check that every conflict has a non-empty resolution.",
        params: &[],
    },
];

/// A merge with detected conflicts, held open for resolution.
pub struct PendingMerge {
    meta: PendingMeta,
    result: MergeResult,
    pub guidance: Option<String>,
    merge_commit_hash: Option<String>,
}

impl PendingMerge {
    pub fn new(result: MergeResult) -> Self {
        Self {
            meta: PendingMeta::new("merge"),
            result,
            guidance: None,
            merge_commit_hash: None,
        }
    }

    // -- Inspection ----------------------------------------------------

    pub fn conflicts(&self) -> &[ConflictInfo] {
        &self.result.conflicts
    }

    pub fn resolutions(&self) -> &std::collections::BTreeMap<String, String> {
        &self.result.resolutions
    }

    pub fn source_branch(&self) -> &str {
        &self.result.source_branch
    }

    pub fn target_branch(&self) -> &str {
        &self.result.target_branch
    }

    pub fn merge_result(&self) -> &MergeResult {
        &self.result
    }

    pub fn merge_commit_hash(&self) -> Option<&str> {
        self.merge_commit_hash.as_deref()
    }

    // -- Core actions --------------------------------------------------

    /// Commit the merge with the recorded resolutions.
    pub fn approve(&mut self, tract: &mut Tract) -> Result<MergeResult> {
        self.meta.require_pending()?;
        let info = tract.commit_pending_merge(&self.result)?;
        self.meta.mark_approved();
        self.merge_commit_hash = Some(info.commit_hash.clone());
        self.result.committed = true;
        self.result.merge_commit_hash = Some(info.commit_hash);
        Ok(self.result.clone())
    }

    pub fn reject(&mut self, reason: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        self.meta.mark_rejected(reason);
        Ok(())
    }

    // -- Editing -------------------------------------------------------

    /// Record a resolution for a conflict target.
    pub fn set_resolution(&mut self, target: &str, text: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        if !self.result.conflicts.iter().any(|c| c.target_hash == target) {
            return Err(TractError::Hook(format!(
                "'{target}' is not a conflict target of this merge"
            )));
        }
        self.result.resolutions.insert(target.to_string(), text.into());
        Ok(())
    }

    /// Replace an existing resolution.
    pub fn edit_resolution(&mut self, target: &str, text: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        if !self.result.resolutions.contains_key(target) {
            return Err(TractError::Hook(format!(
                "no resolution recorded for '{target}'; use set_resolution first"
            )));
        }
        self.result.resolutions.insert(target.to_string(), text.into());
        Ok(())
    }

    // -- Retry and validation ------------------------------------------

    /// Re-run the configured LLM resolver for every conflict.
    pub fn retry(&mut self, tract: &mut Tract, guidance: Option<&str>) -> Result<()> {
        self.meta.require_pending()?;
        if let Some(text) = guidance {
            self.guidance = Some(text.to_string());
        }
        let resolutions =
            tract.resolve_conflicts_with_llm(&self.result.conflicts, self.guidance.as_deref())?;
        for (target, text) in resolutions {
            self.result.resolutions.insert(target, text);
        }
        Ok(())
    }

    /// Every conflict must carry a non-empty resolution.
    pub fn validate(&self) -> ValidationResult {
        for (index, conflict) in self.result.conflicts.iter().enumerate() {
            match self.result.resolutions.get(&conflict.target_hash) {
                Some(text) if !text.trim().is_empty() => {}
                _ => {
                    return ValidationResult::fail(
                        format!(
                            "conflict on {} has no resolution",
                            &conflict.target_hash[..conflict.target_hash.len().min(8)]
                        ),
                        Some(index),
                    );
                }
            }
        }
        ValidationResult::pass()
    }
}

impl PendingReview for PendingMerge {
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
            "source_branch": self.result.source_branch,
            "target_branch": self.result.target_branch,
            "conflicts": self.result.conflicts,
            "resolutions": self.result.resolutions,
            "guidance": self.guidance,
        })
    }

    fn execute_action(&mut self, tract: &mut Tract, name: &str, args: &Value) -> Result<Value> {
        match name {
            "approve" => {
                let result = self.approve(tract)?;
                Ok(serde_json::to_value(result)?)
            }
            "reject" => {
                let reason = args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.reject(reason)?;
                Ok(Value::Null)
            }
            "edit_resolution" | "set_resolution" => {
                let target = args
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        TractError::Hook("action requires a string 'target'".to_string())
                    })?
                    .to_string();
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if name == "edit_resolution" {
                    self.edit_resolution(&target, text)?;
                } else {
                    self.set_resolution(&target, text)?;
                }
                Ok(Value::Null)
            }
            "retry" => {
                let guidance = args.get("guidance").and_then(Value::as_str);
                self.retry(tract, guidance)?;
                Ok(Value::Null)
            }
            "validate" => Ok(serde_json::to_value(self.validate())?),
            other => Err(TractError::Hook(format!("unknown action '{other}'"))),
        }
    }
}

impl AutoRetry for PendingMerge {
    fn validate_pending(&self, _tract: &Tract) -> ValidationResult {
        self.validate()
    }

    fn retry_with_diagnosis(
        &mut self,
        tract: &mut Tract,
        validation: &ValidationResult,
    ) -> Result<()> {
        self.retry(tract, validation.diagnosis.as_deref())
    }

    fn approve_pending(&mut self, tract: &mut Tract) -> Result<()> {
        self.approve(tract).map(|_| ())
    }

    fn operation_name(&self) -> String {
        "merge".to_string()
    }
}

impl std::fmt::Debug for PendingMerge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<PendingMerge: {} -> {}, {} conflict(s), {} resolved, {}>",
            self.result.source_branch,
            self.result.target_branch,
            self.result.conflicts.len(),
            self.result.resolutions.len(),
            self.meta.status
        )
    }
}
