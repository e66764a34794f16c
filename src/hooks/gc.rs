//! PendingGc: a planned garbage collection awaiting confirmation.

use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::hooks::pending::{ActionSpec, PendingMeta, PendingReview, BASE_ACTIONS};
use crate::model::results::GcResult;
use crate::ops::gc::GcPlan;
use crate::tract::Tract;

/// A GC run that has been planned but not executed.
pub struct PendingGc {
    meta: PendingMeta,
    plan: GcPlan,
    result: Option<GcResult>,
}

impl PendingGc {
    pub fn new(plan: GcPlan) -> Self {
        Self {
            meta: PendingMeta::new("gc"),
            plan,
            result: None,
        }
    }

    pub fn plan(&self) -> &GcPlan {
        &self.plan
    }

    pub fn result(&self) -> Option<&GcResult> {
        self.result.as_ref()
    }

    /// Execute the planned removal.
    pub fn approve(&mut self, tract: &mut Tract) -> Result<GcResult> {
        self.meta.require_pending()?;
        let result = tract.apply_gc_plan(&self.plan)?;
        self.meta.mark_approved();
        self.result = Some(result.clone());
        Ok(result)
    }

    pub fn reject(&mut self, reason: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        self.meta.mark_rejected(reason);
        Ok(())
    }
}

impl PendingReview for PendingGc {
    fn meta(&self) -> &PendingMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut PendingMeta {
        &mut self.meta
    }

    fn actions(&self) -> &'static [ActionSpec] {
        BASE_ACTIONS
    }

    fn describe_fields(&self) -> Value {
        serde_json::json!({
            "orphan_candidates": self.plan.orphan_candidates.len(),
            "archived_candidates": self.plan.archived_candidates.len(),
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
            other => Err(TractError::Hook(format!("unknown action '{other}'"))),
        }
    }
}

impl std::fmt::Debug for PendingGc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<PendingGc: {} orphan(s), {} archived, {}>",
            self.plan.orphan_candidates.len(),
            self.plan.archived_candidates.len(),
            self.meta.status
        )
    }
}
