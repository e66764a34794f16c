//! Compression: replace a commit range with summary commits while
//! preserving PINNED commits and enforcing IMPORTANT retention.
//!
//! Planning classifies the range by effective priority, splits it into
//! groups at every pinned (or temporarily preserved) commit, and
//! produces one draft summary per group, either from caller-supplied
//! text (manual mode, single group only) or from the compress LLM with
//! deterministic retention validation and diagnosis-guided retries.
//!
//! Applying rebuilds the branch: the pointer resets to the parent of
//! the range and a new sequence is committed in order, pinned commits
//! passing through with their original payloads (blob-deduplicated) and
//! each group collapsing to one summary commit whose metadata links the
//! archived sources. Post-range commits are replayed on top. The old
//! chain becomes unreachable, which is what makes the archived sources
//! GC-eligible without ever touching ref-reachable history.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::engine::commit::{CommitEngine, CommitOptions};
use crate::errors::{Result, TractError};
use crate::llm::{ChatRequest, LlmClient};
use crate::model::annotation::{MatchMode, Priority, RetentionCriteria};
use crate::model::commit::CommitOperation;
use crate::model::content::{builtin_type_hints, extract_text_from_value, Content, DialogueRole};
use crate::model::results::CompressResult;
use crate::prompts::{build_retry_guidance, build_summarize_prompt, SUMMARIZE_SYSTEM_PROMPT};
use crate::storage::{CommitRow, Storage};
use crate::tokens::TokenCounter;

/// Default number of summarize attempts per group.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Caller-facing compression options.
#[derive(Debug, Clone, Default)]
pub struct CompressOptions {
    /// Inclusive (start, end) hashes on the first-parent chain.
    /// `None` compresses everything reachable from HEAD.
    pub range: Option<(String, String)>,
    pub target_tokens: Option<usize>,
    /// Manual summary text; requires exactly one group.
    pub content: Option<String>,
    pub instructions: Option<String>,
    pub system_prompt: Option<String>,
    /// Temporary PINNED set for this call only.
    pub preserve: Vec<String>,
    pub generation_config: Option<LlmConfig>,
    pub max_retries: usize,
}

impl CompressOptions {
    pub fn manual(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// One element of the rebuilt sequence.
#[derive(Debug, Clone)]
pub enum Segment {
    /// A maximal run of compressible commits, collapsed to one summary.
    Group(Vec<CommitRow>),
    /// A pinned or preserved commit passing through verbatim.
    Pinned(CommitRow),
}

/// A planned compression, ready for review or application.
#[derive(Debug, Clone)]
pub struct CompressionPlan {
    pub compression_id: String,
    pub segments: Vec<Segment>,
    /// Draft summaries, parallel to the `Group` segments in order.
    pub summaries: Vec<String>,
    pub source_commits: Vec<String>,
    pub preserved_commits: Vec<String>,
    /// SKIP-priority commits dropped from the rebuilt chain entirely.
    pub skipped_commits: Vec<String>,
    pub original_tokens: usize,
    pub estimated_tokens: usize,
    /// Parent of the first range commit; `None` when the range starts
    /// at the root.
    pub base_hash: Option<String>,
    /// Post-range commits replayed after the rebuilt sequence.
    pub suffix: Vec<CommitRow>,
    pub target_tokens: Option<usize>,
    pub instructions: Option<String>,
    pub system_prompt: Option<String>,
    pub generation_config: Option<LlmConfig>,
    pub max_retries: usize,
}

impl CompressionPlan {
    /// The group segments, in order, with their indices into
    /// `summaries`.
    pub fn groups(&self) -> Vec<&Vec<CommitRow>> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Group(rows) => Some(rows),
                Segment::Pinned(_) => None,
            })
            .collect()
    }
}

/// Plan a compression: resolve the range, classify, group, and draft
/// summaries.
pub fn plan_compress(
    store: &Storage,
    counter: &dyn TokenCounter,
    client: Option<&dyn LlmClient>,
    tract_id: &str,
    opts: &CompressOptions,
) -> Result<CompressionPlan> {
    let head = store
        .get_head(tract_id)?
        .ok_or_else(|| TractError::Compression("nothing to compress: no commits".to_string()))?;

    let mut chain = store.get_ancestors(&head, None, None)?;
    chain.reverse();

    let (range, base_hash, suffix) = slice_range(&chain, opts.range.as_ref())?;
    if range.is_empty() {
        return Err(TractError::Compression("compression range is empty".to_string()));
    }

    // Effective priorities for the range, with `preserve` as a
    // temporary PINNED overlay.
    let hashes: Vec<String> = range.iter().map(|c| c.commit_hash.clone()).collect();
    let annotations = store.batch_latest_annotations(&hashes)?;

    let mut segments: Vec<Segment> = Vec::new();
    let mut current_group: Vec<CommitRow> = Vec::new();
    let mut preserved_commits = Vec::new();
    let mut skipped_commits = Vec::new();
    let mut source_commits = Vec::new();
    let mut original_tokens = 0usize;

    for row in range {
        let preserved = opts.preserve.contains(&row.commit_hash);
        let priority = if preserved {
            Priority::Pinned
        } else {
            annotations
                .get(&row.commit_hash)
                .map(|a| a.priority)
                .unwrap_or_else(|| {
                    builtin_type_hints(&row.content_type)
                        .map(|h| h.default_priority)
                        .unwrap_or(Priority::Normal)
                })
        };

        match priority {
            Priority::Pinned => {
                if !current_group.is_empty() {
                    segments.push(Segment::Group(std::mem::take(&mut current_group)));
                }
                preserved_commits.push(row.commit_hash.clone());
                segments.push(Segment::Pinned(row));
            }
            Priority::Skip => {
                skipped_commits.push(row.commit_hash.clone());
            }
            Priority::Normal | Priority::Important => {
                // EDIT commits travel with their group so the summary
                // reflects the edited content; they are counted as
                // sources like everything else in the group.
                source_commits.push(row.commit_hash.clone());
                original_tokens += row.token_count;
                current_group.push(row);
            }
        }
    }
    if !current_group.is_empty() {
        segments.push(Segment::Group(current_group));
    }

    let groups: Vec<Vec<CommitRow>> = segments
        .iter()
        .filter_map(|s| match s {
            Segment::Group(rows) => Some(rows.clone()),
            Segment::Pinned(_) => None,
        })
        .collect();

    if groups.is_empty() {
        return Err(TractError::Compression(
            "nothing to compress: no compressible commits in range".to_string(),
        ));
    }

    let max_retries = if opts.max_retries == 0 {
        DEFAULT_MAX_RETRIES
    } else {
        opts.max_retries
    };

    let summaries: Vec<String> = match &opts.content {
        Some(content) => {
            if groups.len() != 1 {
                return Err(TractError::Compression(format!(
                    "manual compression requires exactly one group, found {} \
                     (pinned commits split the range); use LLM mode instead",
                    groups.len()
                )));
            }
            vec![content.clone()]
        }
        None => {
            let client = client.ok_or_else(|| {
                TractError::Compression(
                    "no LLM client configured for compression; pass content= for manual mode"
                        .to_string(),
                )
            })?;
            let mut drafts = Vec::with_capacity(groups.len());
            for group in &groups {
                drafts.push(summarize_group(
                    store,
                    client,
                    group,
                    opts.target_tokens,
                    opts.instructions.as_deref(),
                    opts.system_prompt.as_deref(),
                    opts.generation_config.clone(),
                    None,
                    max_retries,
                )?);
            }
            drafts
        }
    };

    let estimated_tokens = summaries.iter().map(|s| counter.count_text(s)).sum();

    Ok(CompressionPlan {
        compression_id: Uuid::new_v4().simple().to_string(),
        segments,
        summaries,
        source_commits,
        preserved_commits,
        skipped_commits,
        original_tokens,
        estimated_tokens,
        base_hash,
        suffix,
        target_tokens: opts.target_tokens,
        instructions: opts.instructions.clone(),
        system_prompt: opts.system_prompt.clone(),
        generation_config: opts.generation_config.clone(),
        max_retries,
    })
}

/// Summarize one group via the LLM with retention validation and
/// diagnosis-guided retry.
#[allow(clippy::too_many_arguments, reason = "one knob per prompt ingredient")]
pub fn summarize_group(
    store: &Storage,
    client: &dyn LlmClient,
    group: &[CommitRow],
    target_tokens: Option<usize>,
    instructions: Option<&str>,
    system_prompt: Option<&str>,
    generation_config: Option<LlmConfig>,
    extra_guidance: Option<&str>,
    max_retries: usize,
) -> Result<String> {
    let transcript = render_group(store, group)?;
    let retention = mine_retention(store, group)?;
    let retention_instructions: Vec<String> = retention
        .iter()
        .filter_map(|c| c.instructions.clone())
        .collect();

    let mut guidance: Option<String> = extra_guidance.map(str::to_string);
    let mut last_diagnosis = String::new();

    for attempt in 0..max_retries {
        let mut combined_instructions = instructions.unwrap_or_default().to_string();
        if let Some(extra) = &guidance {
            if combined_instructions.is_empty() {
                combined_instructions = extra.clone();
            } else {
                combined_instructions = format!("{combined_instructions}\n{extra}");
            }
        }
        let user_prompt = build_summarize_prompt(
            &transcript,
            target_tokens,
            (!combined_instructions.is_empty()).then_some(combined_instructions.as_str()),
            &retention_instructions,
        );
        let request = ChatRequest::new(vec![
            serde_json::json!({
                "role": "system",
                "content": system_prompt.unwrap_or(SUMMARIZE_SYSTEM_PROMPT),
            }),
            serde_json::json!({"role": "user", "content": user_prompt}),
        ])
        .with_config(generation_config.clone().unwrap_or_default());

        let completion = client.chat(&request)?;
        let summary = completion.content.trim().to_string();

        match validate_retention(&summary, &retention) {
            None => return Ok(summary),
            Some(diagnosis) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max = max_retries,
                    %diagnosis,
                    "compression summary failed retention validation"
                );
                guidance = Some(build_retry_guidance(&summary, &diagnosis));
                last_diagnosis = diagnosis;
            }
        }
    }

    Err(TractError::RetryExhausted {
        attempts: max_retries,
        last_diagnosis,
    })
}

/// Deterministic retention check: every pattern of every criteria set
/// must appear in the summary. Returns a diagnosis on failure.
pub fn validate_retention(summary: &str, criteria: &[RetentionCriteria]) -> Option<String> {
    for criterion in criteria {
        for pattern in &criterion.match_patterns {
            let present = match criterion.match_mode {
                MatchMode::Substring => summary.contains(pattern.as_str()),
                MatchMode::Regex => match regex::Regex::new(pattern) {
                    Ok(re) => re.is_match(summary),
                    Err(e) => {
                        return Some(format!("retention pattern '{pattern}' is invalid: {e}"));
                    }
                },
            };
            if !present {
                return Some(format!(
                    "summary is missing required content matching '{pattern}'"
                ));
            }
        }
    }
    None
}

/// Apply a planned compression: rebuild the branch from the range base.
pub fn apply_compress(
    store: &Storage,
    engine: &CommitEngine<'_>,
    tract_id: &str,
    plan: &CompressionPlan,
) -> Result<CompressResult> {
    let branch = store.get_current_branch(tract_id)?.ok_or_else(|| {
        TractError::Compression("cannot compress in detached HEAD state".to_string())
    })?;

    store.with_transaction(|store| {
        // Reset the branch to the commit before the range. With no base
        // the branch ref is dropped so the rebuilt chain starts at the
        // root; the first new commit recreates it through HEAD's
        // symbolic ref.
        match &plan.base_hash {
            Some(base) => store.set_branch(tract_id, &branch, base)?,
            None => store.delete_branch_ref(tract_id, &branch)?,
        }

        let mut remapped: HashMap<String, String> = HashMap::new();
        let mut summary_commits = Vec::with_capacity(plan.summaries.len());
        let mut compressed_tokens = 0usize;
        let mut group_index = 0usize;

        for segment in &plan.segments {
            match segment {
                Segment::Pinned(row) => {
                    let blob = store
                        .get_blob(&row.content_hash)?
                        .ok_or_else(|| TractError::BlobNotFound(row.content_hash.clone()))?;
                    let value = blob.payload()?;
                    let mut metadata = row
                        .metadata_json
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({}));
                    if let Some(map) = metadata.as_object_mut() {
                        map.insert(
                            "preserved_from".to_string(),
                            Value::String(row.commit_hash.clone()),
                        );
                    }
                    let info = engine.create_commit_from_value(
                        &value,
                        CommitOperation::Append,
                        CommitOptions {
                            message: row.message.clone(),
                            metadata: Some(metadata),
                            generation_config: row.generation_config_json.clone(),
                            ..Default::default()
                        },
                    )?;
                    remapped.insert(row.commit_hash.clone(), info.commit_hash);
                }
                Segment::Group(rows) => {
                    let summary = plan.summaries.get(group_index).ok_or_else(|| {
                        TractError::Compression(format!(
                            "missing summary for group {group_index}"
                        ))
                    })?;
                    group_index += 1;
                    let sources: Vec<String> =
                        rows.iter().map(|r| r.commit_hash.clone()).collect();
                    let content = Content::Dialogue {
                        role: DialogueRole::Assistant,
                        text: summary.clone(),
                        name: None,
                    };
                    let info = engine.create_commit(
                        &content,
                        CommitOperation::Append,
                        CommitOptions {
                            message: Some(format!(
                                "Compressed {} commits into a summary",
                                sources.len()
                            )),
                            metadata: Some(serde_json::json!({
                                "compression_id": plan.compression_id,
                                "compressed_sources": sources,
                            })),
                            ..Default::default()
                        },
                    )?;
                    compressed_tokens += info.token_count;
                    summary_commits.push(info.commit_hash);
                }
            }
        }

        // Replay post-range commits on top of the rebuilt sequence.
        for row in &plan.suffix {
            let blob = store
                .get_blob(&row.content_hash)?
                .ok_or_else(|| TractError::BlobNotFound(row.content_hash.clone()))?;
            let value = blob.payload()?;
            let response_to = row
                .response_to
                .as_ref()
                .map(|t| remapped.get(t).cloned().unwrap_or_else(|| t.clone()));
            let info = engine.create_commit_from_value(
                &value,
                row.operation,
                CommitOptions {
                    message: row.message.clone(),
                    response_to,
                    metadata: row.metadata_json.clone(),
                    generation_config: row.generation_config_json.clone(),
                },
            )?;
            remapped.insert(row.commit_hash.clone(), info.commit_hash);
        }

        let new_head = store.get_head(tract_id)?.ok_or_else(|| {
            TractError::Compression("compression produced an empty chain".to_string())
        })?;

        let compression_ratio = if plan.original_tokens > 0 {
            compressed_tokens as f64 / plan.original_tokens as f64
        } else {
            0.0
        };

        Ok(CompressResult {
            compression_id: plan.compression_id.clone(),
            source_commits: plan.source_commits.clone(),
            summary_commits,
            preserved_commits: plan.preserved_commits.clone(),
            original_tokens: plan.original_tokens,
            compressed_tokens,
            compression_ratio,
            new_head,
        })
    })
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn slice_range(
    chain: &[CommitRow],
    range: Option<&(String, String)>,
) -> Result<(Vec<CommitRow>, Option<String>, Vec<CommitRow>)> {
    match range {
        None => Ok((chain.to_vec(), None, Vec::new())),
        Some((start, end)) => {
            let start_index = chain
                .iter()
                .position(|c| &c.commit_hash == start)
                .ok_or_else(|| {
                    TractError::Compression(format!(
                        "range start {} is not on the current chain",
                        &start[..start.len().min(8)]
                    ))
                })?;
            let end_index = chain
                .iter()
                .position(|c| &c.commit_hash == end)
                .ok_or_else(|| {
                    TractError::Compression(format!(
                        "range end {} is not on the current chain",
                        &end[..end.len().min(8)]
                    ))
                })?;
            if end_index < start_index {
                return Err(TractError::Compression(
                    "range end precedes range start".to_string(),
                ));
            }
            let base = (start_index > 0).then(|| chain[start_index - 1].commit_hash.clone());
            Ok((
                chain[start_index..=end_index].to_vec(),
                base,
                chain[end_index + 1..].to_vec(),
            ))
        }
    }
}

/// Render a group as a plain transcript for the summarizer.
pub fn render_group(store: &Storage, group: &[CommitRow]) -> Result<String> {
    let mut lines = Vec::with_capacity(group.len());
    for row in group {
        let blob = store
            .get_blob(&row.content_hash)?
            .ok_or_else(|| TractError::BlobNotFound(row.content_hash.clone()))?;
        let data = blob.payload()?;
        let role = data
            .get("role")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                builtin_type_hints(&row.content_type)
                    .map(|h| h.default_role.to_string())
                    .unwrap_or_else(|| "assistant".to_string())
            });
        lines.push(format!("{role}: {}", extract_text_from_value(&data)));
    }
    Ok(lines.join("\n"))
}

/// Retention criteria attached to IMPORTANT commits in a group.
pub fn mine_retention(store: &Storage, group: &[CommitRow]) -> Result<Vec<RetentionCriteria>> {
    let mut criteria = Vec::new();
    for row in group {
        let Some(annotation) = store.get_latest_annotation(&row.commit_hash)? else {
            continue;
        };
        if annotation.priority == Priority::Important {
            if let Some(retention) = annotation.retention {
                criteria.push(retention);
            }
        }
    }
    Ok(criteria)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Substring and regex retention validation.
    #[test]
    fn test_validate_retention() {
        let substring = RetentionCriteria::matching(["sk-12345"]);
        assert!(validate_retention("the key sk-12345 survives", &[substring.clone()]).is_none());
        let diagnosis =
            validate_retention("the key was dropped", &[substring]).expect("diagnosis");
        assert!(diagnosis.contains("sk-12345"));

        let regex = RetentionCriteria {
            instructions: None,
            match_patterns: vec![r"sk-\d+".to_string()],
            match_mode: MatchMode::Regex,
        };
        assert!(validate_retention("found sk-999", &[regex.clone()]).is_none());
        assert!(validate_retention("nothing here", &[regex]).is_some());
    }
}
