//! PendingCompress: a planned compression awaiting review.
//!
//! Mutable until resolved: reviewers can edit individual summaries,
//! adjust guidance, re-run the LLM for one group, and validate before
//! approving.

use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::hooks::pending::{ActionSpec, ParamSpec, PendingMeta, PendingReview};
use crate::hooks::{AutoRetry, ValidationResult};
use crate::model::results::CompressResult;
use crate::ops::compress::CompressionPlan;
use crate::tract::Tract;

const ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "approve",
        description: "Finalize and commit all summaries, completing the compression.",
        params: &[],
    },
    ActionSpec {
        name: "reject",
        description: "Reject the compression, discarding all planned changes.",
        params: &[ParamSpec {
            name: "reason",
            kind: "string",
            required: false,
            description: "Why the compression was rejected.",
        }],
    },
    ActionSpec {
        name: "edit_summary",
        description: "Replace the summary text at the given index.",
        params: &[
            ParamSpec {
                name: "index",
                kind: "integer",
                required: true,
                description: "Index into the summaries list.",
            },
            ParamSpec {
                name: "text",
                kind: "string",
                required: true,
                description: "Replacement summary text.",
            },
        ],
    },
    ActionSpec {
        name: "edit_guidance",
        description: "Replace the guidance applied to future retries.",
        params: &[ParamSpec {
            name: "text",
            kind: "string",
            required: true,
            description: "New guidance text.",
        }],
    },
    ActionSpec {
        name: "retry",
        description: "Re-run LLM generation for one summary group.",
        params: &[
            ParamSpec {
                name: "index",
                kind: "integer",
                required: true,
                description: "Index of the summary to regenerate.",
            },
            ParamSpec {
                name: "guidance",
                kind: "string",
                required: false,
                description: "Feedback text injected into the retry prompt.",
            },
        ],
    },
    ActionSpec {
        name: "validate",
        description: "Validate the current summaries against quality criteria.",
        params: &[],
    },
];

/// Minimum summary length accepted by `validate`.
const MIN_SUMMARY_CHARS: usize = 10;

/// A compression that has been planned but not yet committed.
pub struct PendingCompress {
    meta: PendingMeta,
    plan: CompressionPlan,
    pub guidance: Option<String>,
    /// Where guidance came from: `"user"`, `"llm"`, or `"user+llm"`.
    pub guidance_source: Option<String>,
    result: Option<CompressResult>,
}

impl PendingCompress {
    pub fn new(plan: CompressionPlan) -> Self {
        let guidance = plan.instructions.clone();
        Self {
            meta: PendingMeta::new("compress"),
            plan,
            guidance_source: guidance.as_ref().map(|_| "user".to_string()),
            guidance,
            result: None,
        }
    }

    // -- Inspection ----------------------------------------------------

    pub fn summaries(&self) -> &[String] {
        &self.plan.summaries
    }

    pub fn source_commits(&self) -> &[String] {
        &self.plan.source_commits
    }

    pub fn preserved_commits(&self) -> &[String] {
        &self.plan.preserved_commits
    }

    pub fn original_tokens(&self) -> usize {
        self.plan.original_tokens
    }

    pub fn estimated_tokens(&self) -> usize {
        self.plan.estimated_tokens
    }

    pub fn result(&self) -> Option<&CompressResult> {
        self.result.as_ref()
    }

    // -- Core actions --------------------------------------------------

    /// Finalize: rebuild the branch with summaries and pass-throughs.
    pub fn approve(&mut self, tract: &mut Tract) -> Result<CompressResult> {
        self.meta.require_pending()?;
        let result = tract.apply_compression_plan(&self.plan)?;
        self.meta.mark_approved();
        self.result = Some(result.clone());
        Ok(result)
    }

    pub fn reject(&mut self, reason: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        self.meta.mark_rejected(reason);
        Ok(())
    }

    // -- Editing -------------------------------------------------------

    /// Replace one draft summary.
    pub fn edit_summary(&mut self, tract: &Tract, index: usize, text: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        let len = self.plan.summaries.len();
        let slot = self.plan.summaries.get_mut(index).ok_or_else(|| {
            TractError::Hook(format!(
                "summary index {index} is out of range; valid indices: 0..{len}"
            ))
        })?;
        *slot = text.into();
        self.recompute_estimate(tract);
        Ok(())
    }

    /// Replace the guidance applied to future retries.
    pub fn edit_guidance(&mut self, text: impl Into<String>) -> Result<()> {
        self.meta.require_pending()?;
        self.guidance = Some(text.into());
        self.guidance_source = Some(match self.guidance_source.as_deref() {
            Some("llm") | Some("user+llm") => "user+llm".to_string(),
            _ => "user".to_string(),
        });
        Ok(())
    }

    // -- Retry and validation ------------------------------------------

    /// Re-run the LLM for one group, with optional extra guidance.
    pub fn retry(&mut self, tract: &mut Tract, index: usize, guidance: Option<&str>) -> Result<()> {
        self.meta.require_pending()?;
        let groups = self.plan.groups();
        let group = groups.get(index).copied().cloned().ok_or_else(|| {
            TractError::Hook(format!(
                "summary index {index} is out of range; valid indices: 0..{}",
                self.plan.summaries.len()
            ))
        })?;

        let mut combined = self.guidance.clone().unwrap_or_default();
        if let Some(extra) = guidance {
            if combined.is_empty() {
                combined = extra.to_string();
            } else {
                combined = format!("{combined}\n{extra}");
            }
        }

        let summary = tract.summarize_compression_group(
            &group,
            self.plan.target_tokens,
            self.plan.instructions.as_deref(),
            self.plan.system_prompt.as_deref(),
            self.plan.generation_config.clone(),
            (!combined.is_empty()).then_some(combined.as_str()),
            self.plan.max_retries,
        )?;
        self.plan.summaries[index] = summary;
        self.recompute_estimate(tract);
        Ok(())
    }

    /// Check every summary: non-empty, not trivially short, and within
    /// 1.5x the token target when one is set.
    pub fn validate(&self, tract: &Tract) -> ValidationResult {
        for (index, summary) in self.plan.summaries.iter().enumerate() {
            let trimmed = summary.trim();
            if trimmed.is_empty() {
                return ValidationResult::fail(
                    format!("Summary at index {index} is empty."),
                    Some(index),
                );
            }
            if trimmed.len() < MIN_SUMMARY_CHARS {
                return ValidationResult::fail(
                    format!(
                        "Summary at index {index} is suspiciously short ({} chars).",
                        trimmed.len()
                    ),
                    Some(index),
                );
            }
            if let Some(target) = self.plan.target_tokens {
                let max_tokens = target * 3 / 2;
                let token_count = tract.count_text(summary);
                if token_count > max_tokens {
                    return ValidationResult::fail(
                        format!(
                            "Summary at index {index} exceeds token budget: {token_count} tokens > {max_tokens} (target={target} * 1.5)."
                        ),
                        Some(index),
                    );
                }
            }
        }
        ValidationResult::pass()
    }

    fn recompute_estimate(&mut self, tract: &Tract) {
        self.plan.estimated_tokens = self
            .plan
            .summaries
            .iter()
            .map(|s| tract.count_text(s))
            .sum();
    }
}

impl PendingReview for PendingCompress {
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
            "summaries": self.plan.summaries,
            "source_commits": self.plan.source_commits,
            "preserved_commits": self.plan.preserved_commits,
            "original_tokens": self.plan.original_tokens,
            "estimated_tokens": self.plan.estimated_tokens,
            "guidance": self.guidance,
            "guidance_source": self.guidance_source,
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
            "edit_summary" => {
                let index = required_index(args)?;
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.edit_summary(tract, index, text)?;
                Ok(Value::Null)
            }
            "edit_guidance" => {
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.edit_guidance(text)?;
                Ok(Value::Null)
            }
            "retry" => {
                let index = required_index(args)?;
                let guidance = args.get("guidance").and_then(Value::as_str);
                self.retry(tract, index, guidance)?;
                Ok(Value::Null)
            }
            "validate" => Ok(serde_json::to_value(self.validate(tract))?),
            other => Err(TractError::Hook(format!("unknown action '{other}'"))),
        }
    }
}

impl AutoRetry for PendingCompress {
    fn validate_pending(&self, tract: &Tract) -> ValidationResult {
        self.validate(tract)
    }

    fn retry_with_diagnosis(
        &mut self,
        tract: &mut Tract,
        validation: &ValidationResult,
    ) -> Result<()> {
        let index = validation.index.unwrap_or(0);
        self.retry(tract, index, validation.diagnosis.as_deref())
    }

    fn approve_pending(&mut self, tract: &mut Tract) -> Result<()> {
        self.approve(tract).map(|_| ())
    }

    fn operation_name(&self) -> String {
        "compress".to_string()
    }
}

fn required_index(args: &Value) -> Result<usize> {
    args.get("index")
        .and_then(Value::as_u64)
        .map(|i| i as usize)
        .ok_or_else(|| TractError::Hook("action requires an integer 'index'".to_string()))
}

impl std::fmt::Debug for PendingCompress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reduction = if self.plan.original_tokens > 0 {
            format!(
                ", {}% reduction",
                100 - self.plan.estimated_tokens * 100 / self.plan.original_tokens.max(1)
            )
        } else {
            String::new()
        };
        write!(
            f,
            "<PendingCompress: {} summaries, {}->{} tokens{reduction}, {}>",
            self.plan.summaries.len(),
            self.plan.original_tokens,
            self.plan.estimated_tokens,
            self.meta.status
        )
    }
}
