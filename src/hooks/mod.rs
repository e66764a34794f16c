//! Hook and Pending machinery.
//!
//! Every operation that may take visibly long, destroy information, or
//! benefit from human review is reified as a pending object with
//! approve / reject / edit / retry / validate actions. Dispatch is
//! three-tier:
//!
//! 1. `review=true` hands the pending straight back to the caller.
//! 2. A handler registered for the operation (or the `"*"` wildcard)
//!    decides.
//! 3. The operation's default handler runs (approve for safe
//!    operations).
//!
//! While a handler runs, nested hookable operations auto-approve
//! instead of firing their own hooks (the recursion guard), so a
//! handler that triggers `gc` or `compress` cannot recurse forever.

pub mod compress;
pub mod gc;
pub mod merge;
pub mod pending;
pub mod tool_result;

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::tract::Tract;

pub use compress::PendingCompress;
pub use gc::PendingGc;
pub use merge::PendingMerge;
pub use pending::{ActionSpec, ParamSpec, PendingMeta, PendingReview, PendingStatus};
pub use tool_result::PendingToolResult;

/// Result of validating a pending's current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnosis: None,
            index: None,
        }
    }

    pub fn fail(diagnosis: impl Into<String>, index: Option<usize>) -> Self {
        Self {
            passed: false,
            diagnosis: Some(diagnosis.into()),
            index,
        }
    }
}

/// Why a hookable operation ended up rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookRejection {
    pub reason: String,
    /// Who rejected: `"handler"`, `"auto_retry"`, `"caller"`.
    pub rejection_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Outcome of a hookable operation after dispatch.
#[derive(Debug)]
pub enum Outcome<R, P> {
    /// Approved and executed.
    Applied(R),
    /// Still pending: handed back for review.
    Pending(P),
    /// Rejected by a handler or reviewer.
    Rejected(HookRejection),
}

impl<R, P> Outcome<R, P> {
    /// Unwrap the applied result, erroring on pending/rejected.
    pub fn applied(self) -> Result<R> {
        match self {
            Outcome::Applied(result) => Ok(result),
            Outcome::Pending(_) => Err(crate::errors::TractError::Hook(
                "operation is pending review; resolve the pending first".to_string(),
            )),
            Outcome::Rejected(rejection) => Err(crate::errors::TractError::Hook(format!(
                "operation rejected: {}",
                rejection.reason
            ))),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending(_))
    }
}

/// A pending in dispatch position: handlers receive this and decide.
pub enum PendingOp {
    Compress(PendingCompress),
    Merge(PendingMerge),
    Gc(PendingGc),
    ToolResult(PendingToolResult),
}

impl PendingOp {
    pub fn operation(&self) -> &str {
        self.meta().operation.as_str()
    }

    pub fn meta(&self) -> &PendingMeta {
        match self {
            PendingOp::Compress(p) => p.meta(),
            PendingOp::Merge(p) => p.meta(),
            PendingOp::Gc(p) => p.meta(),
            PendingOp::ToolResult(p) => p.meta(),
        }
    }

    /// Approve whatever kind of pending this is, discarding the typed
    /// result. Used by default handlers and the recursion guard.
    pub fn approve_any(&mut self, tract: &mut Tract) -> Result<()> {
        match self {
            PendingOp::Compress(p) => p.approve(tract).map(|_| ()),
            PendingOp::Merge(p) => p.approve(tract).map(|_| ()),
            PendingOp::Gc(p) => p.approve(tract).map(|_| ()),
            PendingOp::ToolResult(p) => p.approve(tract).map(|_| ()),
        }
    }
}

/// Handler invoked with the tract and the pending under review.
pub type HookHandler = dyn Fn(&mut Tract, &mut PendingOp) -> Result<()>;

/// Registry of hook handlers plus the recursion guard.
///
/// The firing flag is reference-counted so the guard can outlive the
/// registry borrow while a handler holds `&mut Tract`.
#[derive(Default)]
pub struct HookRegistry {
    handlers: HashMap<String, Rc<HookHandler>>,
    firing: Rc<Cell<bool>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an operation name, `"*"` for the
    /// wildcard. Replaces any previous handler for that name.
    pub fn register(&mut self, operation: impl Into<String>, handler: Rc<HookHandler>) {
        self.handlers.insert(operation.into(), handler);
    }

    pub fn unregister(&mut self, operation: &str) {
        self.handlers.remove(operation);
    }

    /// Specific handler first, then the wildcard.
    pub fn resolve(&self, operation: &str) -> Option<Rc<HookHandler>> {
        self.handlers
            .get(operation)
            .or_else(|| self.handlers.get("*"))
            .cloned()
    }

    /// True while a handler is running (nested hookables auto-approve).
    pub fn is_firing(&self) -> bool {
        self.firing.get()
    }

    /// Raise the firing flag until the returned guard drops.
    pub fn firing_guard(&self) -> FiringGuard {
        self.firing.set(true);
        FiringGuard {
            flag: Rc::clone(&self.firing),
        }
    }
}

/// Clears the firing flag when the handler returns or errors.
pub struct FiringGuard {
    flag: Rc<Cell<bool>>,
}

impl Drop for FiringGuard {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Pendings that support the validate / retry(guidance) / approve loop.
pub trait AutoRetry {
    fn validate_pending(&self, tract: &Tract) -> ValidationResult;
    fn retry_with_diagnosis(
        &mut self,
        tract: &mut Tract,
        validation: &ValidationResult,
    ) -> Result<()>;
    fn approve_pending(&mut self, tract: &mut Tract) -> Result<()>;
    fn operation_name(&self) -> String;
}

/// Validate-retry-approve loop: validate, on failure retry with the
/// diagnosis as guidance, up to `max_retries` attempts. Approves on the
/// first passing validation; returns a [`HookRejection`] on exhaustion.
pub fn auto_retry<P: AutoRetry>(
    tract: &mut Tract,
    pending: &mut P,
    max_retries: usize,
) -> Result<std::result::Result<(), HookRejection>> {
    let attempts = max_retries.max(1);
    let mut last = ValidationResult::pass();
    for attempt in 0..=attempts {
        let validation = pending.validate_pending(tract);
        if validation.passed {
            pending.approve_pending(tract)?;
            return Ok(Ok(()));
        }
        if attempt == attempts {
            last = validation;
            break;
        }
        tracing::warn!(
            operation = %pending.operation_name(),
            attempt = attempt + 1,
            diagnosis = validation.diagnosis.as_deref().unwrap_or(""),
            "validation failed; retrying"
        );
        pending.retry_with_diagnosis(tract, &validation)?;
        last = validation;
    }
    Ok(Err(HookRejection {
        reason: format!(
            "validation failed after {attempts} retries: {}",
            last.diagnosis.unwrap_or_default()
        ),
        rejection_source: "auto_retry".to_string(),
        metadata: None,
    }))
}
