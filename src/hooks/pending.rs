//! Common Pending shape and the agent-facing action protocol.
//!
//! Every pending carries a [`PendingMeta`] (identity, status, audit
//! fields) and a static whitelist of actions. The agent interface is
//! generated from the whitelist: `to_tools()` emits one JSON-Schema
//! tool definition per action, `apply_decision` / `execute_tool`
//! dispatch by name and refuse anything outside the whitelist or
//! starting with an underscore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{Result, TractError};
use crate::tract::Tract;

/// Lifecycle state of a pending.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Approved => "approved",
            PendingStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Identity and status shared by every pending operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMeta {
    pub operation: String,
    pub pending_id: String,
    pub created_at: DateTime<Utc>,
    pub status: PendingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl PendingMeta {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            pending_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            created_at: Utc::now(),
            status: PendingStatus::Pending,
            triggered_by: None,
            rejection_reason: None,
        }
    }

    /// Guard: any action other than inspection requires pending status.
    pub fn require_pending(&self) -> Result<()> {
        if self.status != PendingStatus::Pending {
            return Err(TractError::Hook(format!(
                "cannot modify a {} pending with status '{}'; only pending items accept actions",
                self.operation, self.status
            )));
        }
        Ok(())
    }

    pub fn mark_approved(&mut self) {
        self.status = PendingStatus::Approved;
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>) {
        self.status = PendingStatus::Rejected;
        self.rejection_reason = Some(reason.into());
    }
}

/// One parameter of a pending action.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    /// JSON-Schema type name: `"string"`, `"integer"`, `"boolean"`.
    pub kind: &'static str,
    pub required: bool,
    pub description: &'static str,
}

/// One whitelisted action of a pending.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
}

/// The protocol every pending implements.
pub trait PendingReview {
    fn meta(&self) -> &PendingMeta;
    fn meta_mut(&mut self) -> &mut PendingMeta;

    /// Whitelist of invokable actions.
    fn actions(&self) -> &'static [ActionSpec];

    /// Public fields for LLM consumption.
    fn describe_fields(&self) -> Value;

    /// Dispatch one whitelisted action. Implementations match on the
    /// name and pull arguments out of `args`.
    fn execute_action(&mut self, tract: &mut Tract, name: &str, args: &Value) -> Result<Value>;

    /// Serialize to a structured dict for LLM consumption.
    fn to_dict(&self) -> Value {
        let meta = self.meta();
        serde_json::json!({
            "operation": meta.operation,
            "pending_id": meta.pending_id,
            "status": meta.status,
            "created_at": meta.created_at,
            "triggered_by": meta.triggered_by,
            "rejection_reason": meta.rejection_reason,
            "fields": self.describe_fields(),
            "available_actions": self.actions().iter().map(|a| a.name).collect::<Vec<_>>(),
        })
    }

    /// JSON-Schema tool definitions for the whitelisted actions.
    fn to_tools(&self) -> Vec<Value> {
        self.actions().iter().map(action_to_tool).collect()
    }

    /// Human/LLM-readable markdown description of the API.
    fn describe_api(&self) -> String {
        let meta = self.meta();
        let mut out = format!(
            "## Pending {} (id={}, status={})\n\nActions:\n",
            meta.operation, meta.pending_id, meta.status
        );
        for action in self.actions() {
            let params: Vec<String> = action
                .params
                .iter()
                .map(|p| {
                    if p.required {
                        format!("{}: {}", p.name, p.kind)
                    } else {
                        format!("{}?: {}", p.name, p.kind)
                    }
                })
                .collect();
            out.push_str(&format!(
                "- `{}({})`: {}\n",
                action.name,
                params.join(", "),
                action.description
            ));
        }
        out
    }

    /// Execute a named action, guarded by the whitelist.
    fn execute_tool(&mut self, tract: &mut Tract, name: &str, args: &Value) -> Result<Value> {
        if name.starts_with('_') {
            return Err(TractError::Hook(format!(
                "cannot execute private method '{name}'; allowed actions: {}",
                self.action_names().join(", ")
            )));
        }
        if !self.actions().iter().any(|a| a.name == name) {
            return Err(TractError::Hook(format!(
                "action '{name}' is not allowed for this pending; allowed: {}",
                self.action_names().join(", ")
            )));
        }
        for param in self
            .actions()
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.params)
            .unwrap_or(&[])
        {
            if param.required && args.get(param.name).is_none() {
                return Err(TractError::Hook(format!(
                    "action '{name}' requires parameter '{}'",
                    param.name
                )));
            }
        }
        self.execute_action(tract, name, args)
    }

    /// Apply a structured decision: `{"action": ..., "args": {...}}`.
    fn apply_decision(&mut self, tract: &mut Tract, decision: &Value) -> Result<Value> {
        let action = decision
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TractError::Hook("decision is missing the 'action' key".to_string())
            })?;
        let empty = Value::Object(serde_json::Map::new());
        let args = decision.get("args").unwrap_or(&empty);
        self.execute_tool(tract, action, args)
    }

    fn action_names(&self) -> Vec<&'static str> {
        self.actions().iter().map(|a| a.name).collect()
    }
}

fn action_to_tool(action: &ActionSpec) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in action.params {
        properties.insert(
            param.name.to_string(),
            serde_json::json!({"type": param.kind, "description": param.description}),
        );
        if param.required {
            required.push(Value::String(param.name.to_string()));
        }
    }
    serde_json::json!({
        "type": "function",
        "function": {
            "name": action.name,
            "description": action.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        },
    })
}

/// The base approve/reject action pair shared by simple pendings.
pub const BASE_ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "approve",
        description: "Approve and execute the pending operation.",
        params: &[],
    },
    ActionSpec {
        name: "reject",
        description: "Reject the pending operation.",
        params: &[ParamSpec {
            name: "reason",
            kind: "string",
            required: false,
            description: "Human-readable explanation for the rejection.",
        }],
    },
];
