//! Context compiler: transforms a commit DAG into the linear message
//! list an LLM API expects.
//!
//! The walk is deterministic: first-parent chain root-first, merge
//! commits expanded with "branch blocks" ordering (the second parent's
//! unique ancestors inserted immediately before their merge commit, in
//! chronological order). Edits substitute content in place; SKIP
//! priorities drop messages; time-travel filters restrict the walk to
//! commits and annotations within the window.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::hash::content_hash;
use crate::model::annotation::Priority;
use crate::model::content::{builtin_type_hints, default_type_priority};
use crate::model::message::{CompiledContext, Message};
use crate::model::commit::CommitOperation;
use crate::storage::{CommitRow, Storage};
use crate::tokens::TokenCounter;

/// Time-travel and rendering options for one compile.
#[derive(Debug, Clone, Default)]
pub struct CompileQuery {
    /// Only include commits created at or before this instant.
    pub at_time: Option<DateTime<Utc>>,
    /// Only include commits up to and including this hash.
    pub at_commit: Option<String>,
    /// Append a literal ` [edited]` marker to edited content.
    pub include_edit_annotations: bool,
}

/// The default compiler. Borrowed view over a tract's storage.
pub struct ContextCompiler<'a> {
    store: &'a Storage,
    counter: &'a dyn TokenCounter,
    type_roles: &'a HashMap<String, String>,
}

impl<'a> ContextCompiler<'a> {
    pub fn new(
        store: &'a Storage,
        counter: &'a dyn TokenCounter,
        type_roles: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            counter,
            type_roles,
        }
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter
    }

    pub fn store(&self) -> &Storage {
        self.store
    }

    /// Compile commits into structured messages.
    pub fn compile(
        &self,
        _tract_id: &str,
        head_hash: &str,
        query: &CompileQuery,
    ) -> Result<CompiledContext> {
        if query.at_time.is_some() && query.at_commit.is_some() {
            return Err(TractError::InvalidArgument(
                "cannot specify both at_time and at_commit; use one or the other".to_string(),
            ));
        }

        let commits = self.walk_chain(head_hash, query)?;
        if commits.is_empty() {
            return Ok(CompiledContext::default());
        }

        let edit_map = self.build_edit_map(&commits, query.at_time);
        let priority_map = self.build_priority_map(&commits, query.at_time)?;

        let effective: Vec<&CommitRow> = commits
            .iter()
            .filter(|c| c.operation != CommitOperation::Edit)
            .filter(|c| priority_map.get(&c.commit_hash) != Some(&Priority::Skip))
            .collect();

        let commit_hashes: Vec<String> =
            effective.iter().map(|c| c.commit_hash.clone()).collect();

        let mut generation_configs: Vec<Option<Value>> = Vec::with_capacity(effective.len());
        for commit in &effective {
            // Prefer the edit's config, fall back to the original's.
            let edit = edit_map.get(&commit.commit_hash);
            let config = match edit.and_then(|e| e.generation_config_json.clone()) {
                Some(config) => Some(config),
                None => commit.generation_config_json.clone(),
            };
            generation_configs.push(config);
        }

        let mut messages: Vec<Message> = Vec::with_capacity(effective.len());
        for &commit in &effective {
            let source = edit_map.get(&commit.commit_hash).copied().unwrap_or(commit);
            let mut message = self.build_message_for_commit(source)?;
            if query.include_edit_annotations && edit_map.contains_key(&commit.commit_hash) {
                message.content.push_str(" [edited]");
            }
            messages.push(message);
        }

        let message_values: Vec<Value> = messages.iter().map(Message::to_value).collect();
        let token_count = self.counter.count_messages(&message_values);

        let tools = self.latest_tools(&commits)?;

        Ok(CompiledContext {
            messages,
            token_count,
            commit_count: effective.len(),
            token_source: self.counter.token_source(),
            generation_configs,
            commit_hashes,
            tools,
        })
    }

    /// Build a single message from a commit's blob content.
    ///
    /// The single-commit equivalent of the compile loop body; the cache
    /// uses it for O(1) extension and patching.
    pub fn build_message_for_commit(&self, commit: &CommitRow) -> Result<Message> {
        let Some(blob) = self.store.get_blob(&commit.content_hash)? else {
            tracing::warn!(commit = %commit.commit_hash, "blob not found for commit");
            return Ok(Message::new("system", "[missing content]"));
        };
        let data = blob.payload()?;
        let content_type = data
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let role = self.map_role(content_type, &data);
        let text = extract_message_text(content_type, &data);
        let name = if content_type == "dialogue" {
            data.get("name").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        };
        Ok(Message {
            role,
            content: text,
            name,
        })
    }

    // ------------------------------------------------------------------
    // Chain walking
    // ------------------------------------------------------------------

    fn walk_chain(&self, head_hash: &str, query: &CompileQuery) -> Result<Vec<CommitRow>> {
        let ancestors = self.store.get_ancestors(head_hash, None, None)?;
        let mut commits: Vec<CommitRow> = ancestors.into_iter().rev().collect();

        commits = self.expand_merge_parents(commits)?;

        if let Some(at_commit) = &query.at_commit {
            let mut truncated = Vec::new();
            for commit in commits {
                let hash = commit.commit_hash.clone();
                truncated.push(commit);
                if &hash == at_commit {
                    break;
                }
            }
            commits = truncated;
        }

        if let Some(at_time) = query.at_time {
            commits.retain(|c| c.created_at <= at_time);
        }

        Ok(commits)
    }

    /// Expand a first-parent commit list with merge parent branches.
    ///
    /// For each merge commit, the second parent's unique ancestors (not
    /// already present) are inserted before the merge commit in
    /// chronological order.
    fn expand_merge_parents(&self, first_parent: Vec<CommitRow>) -> Result<Vec<CommitRow>> {
        let mut seen: HashSet<String> =
            first_parent.iter().map(|c| c.commit_hash.clone()).collect();
        let mut result: Vec<CommitRow> = Vec::with_capacity(first_parent.len());

        for commit in first_parent {
            let parents = self.store.get_parents(&commit.commit_hash)?;
            if parents.len() >= 2 {
                let branch = self.collect_unique_ancestors(&parents[1], &seen)?;
                for row in branch {
                    seen.insert(row.commit_hash.clone());
                    result.push(row);
                }
            }
            result.push(commit);
        }
        Ok(result)
    }

    /// Ancestors of `start` not in `seen`, in chronological order.
    /// Stops at the first already-seen commit.
    fn collect_unique_ancestors(
        &self,
        start: &str,
        seen: &HashSet<String>,
    ) -> Result<Vec<CommitRow>> {
        let mut unique: Vec<CommitRow> = Vec::new();
        let mut current = Some(start.to_string());
        while let Some(hash) = current {
            if seen.contains(&hash) {
                break;
            }
            let Some(row) = self.store.get_commit(&hash)? else {
                break;
            };
            current = row.parent_hash.clone();
            unique.push(row);
        }
        unique.reverse();
        Ok(unique)
    }

    // ------------------------------------------------------------------
    // Edit and priority maps
    // ------------------------------------------------------------------

    /// `response_to -> latest EDIT commit` within the time window.
    fn build_edit_map<'c>(
        &self,
        commits: &'c [CommitRow],
        at_time: Option<DateTime<Utc>>,
    ) -> HashMap<String, &'c CommitRow> {
        let mut edit_map: HashMap<String, &CommitRow> = HashMap::new();
        for commit in commits {
            if commit.operation != CommitOperation::Edit {
                continue;
            }
            let Some(target) = &commit.response_to else {
                continue;
            };
            if at_time.is_some_and(|t| commit.created_at > t) {
                continue;
            }
            match edit_map.get(target) {
                Some(existing) if existing.created_at >= commit.created_at => {}
                _ => {
                    edit_map.insert(target.clone(), commit);
                }
            }
        }
        edit_map
    }

    /// `commit_hash -> effective priority` within the time window.
    fn build_priority_map(
        &self,
        commits: &[CommitRow],
        at_time: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, Priority>> {
        let hashes: Vec<String> = commits.iter().map(|c| c.commit_hash.clone()).collect();
        let annotations = self.store.batch_latest_annotations(&hashes)?;

        let mut priority_map = HashMap::with_capacity(commits.len());
        for commit in commits {
            let annotation = annotations
                .get(&commit.commit_hash)
                .filter(|a| at_time.is_none_or(|t| a.created_at <= t));
            let priority = match annotation {
                Some(a) => a.priority,
                None => default_type_priority(&commit.content_type),
            };
            priority_map.insert(commit.commit_hash.clone(), priority);
        }
        Ok(priority_map)
    }

    // ------------------------------------------------------------------
    // Role mapping and tools
    // ------------------------------------------------------------------

    /// Map a content type to an LLM role.
    ///
    /// Priority order: configured override, dialogue's own role field,
    /// tool_io -> "tool", built-in type default, then "assistant".
    fn map_role(&self, content_type: &str, data: &Value) -> String {
        if let Some(role) = self.type_roles.get(content_type) {
            return role.clone();
        }
        if content_type == "dialogue" {
            return data
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("user")
                .to_string();
        }
        if content_type == "tool_io" {
            return "tool".to_string();
        }
        builtin_type_hints(content_type)
            .map(|h| h.default_role.to_string())
            .unwrap_or_else(|| "assistant".to_string())
    }

    /// Tool schemas of the latest commit that carried any.
    fn latest_tools(&self, commits: &[CommitRow]) -> Result<Vec<Value>> {
        for commit in commits.iter().rev() {
            let tools = self.store.get_commit_tools(&commit.commit_hash)?;
            if !tools.is_empty() {
                return Ok(tools);
            }
        }
        Ok(Vec::new())
    }
}

/// Extract the display text for a parsed content payload.
fn extract_message_text(content_type: &str, data: &Value) -> String {
    if content_type == "tool_io" {
        let tool_name = data.get("tool_name").and_then(Value::as_str).unwrap_or("unknown");
        let direction = data.get("direction").and_then(Value::as_str).unwrap_or("call");
        let payload = data.get("payload").cloned().unwrap_or(Value::Null);
        let mut header = format!("Tool {direction}: {tool_name}");
        if let Some(status) = data.get("status").and_then(Value::as_str) {
            header.push_str(&format!(" ({status})"));
        }
        let body = serde_json::to_string_pretty(&payload).unwrap_or_default();
        return format!("{header}\n{body}");
    }

    if content_type == "freeform" {
        let payload = data.get("payload").cloned().unwrap_or(Value::Null);
        return serde_json::to_string_pretty(&payload).unwrap_or_default();
    }

    if let Some(text) = data.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(content) = data.get("content").and_then(Value::as_str) {
        return content.to_string();
    }
    data.to_string()
}

/// Hashes of a compiled tool list, for snapshot bookkeeping.
pub fn tool_hashes(tools: &[Value]) -> Vec<String> {
    tools
        .iter()
        .filter_map(|schema| content_hash(schema).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::commit::{CommitEngine, CommitOptions};
    use crate::model::content::Content;
    use crate::tokens::HeuristicCounter;

    fn setup() -> (Storage, HeuristicCounter, HashMap<String, String>) {
        (
            Storage::open(":memory:").expect("open"),
            HeuristicCounter,
            HashMap::new(),
        )
    }

    fn commit(
        store: &Storage,
        counter: &HeuristicCounter,
        content: &Content,
    ) -> crate::model::commit::CommitInfo {
        CommitEngine::new(store, counter, "t", None, false)
            .create_commit(content, CommitOperation::Append, CommitOptions::default())
            .expect("commit")
    }

    /// Linear conversation compiles in order with mapped roles.
    #[test]
    fn test_linear_compile() {
        let (store, counter, roles) = setup();
        commit(&store, &counter, &Content::instruction("You are helpful."));
        commit(&store, &counter, &Content::user("Hi"));
        commit(&store, &counter, &Content::assistant("Hello"));

        let head = store.get_head("t").expect("head").expect("present");
        let compiler = ContextCompiler::new(&store, &counter, &roles);
        let ctx = compiler
            .compile("t", &head, &CompileQuery::default())
            .expect("compile");

        assert_eq!(ctx.commit_count, 3);
        let rendered: Vec<(&str, &str)> = ctx
            .messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                ("system", "You are helpful."),
                ("user", "Hi"),
                ("assistant", "Hello"),
            ]
        );
        assert!(ctx.token_count > 0);
        assert_eq!(ctx.commit_hashes.len(), 3);
    }

    /// The latest edit substitutes content; the EDIT commit itself does
    /// not appear as a message.
    #[test]
    fn test_edit_resolution_latest_wins() {
        let (store, counter, roles) = setup();
        let engine = CommitEngine::new(&store, &counter, "t", None, false);
        let base = engine
            .create_commit(&Content::user("v0"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        engine
            .create_commit(
                &Content::user("v1"),
                CommitOperation::Edit,
                CommitOptions {
                    response_to: Some(base.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .expect("edit");
        engine
            .create_commit(
                &Content::user("v2"),
                CommitOperation::Edit,
                CommitOptions {
                    response_to: Some(base.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .expect("edit");

        let head = store.get_head("t").expect("head").expect("present");
        let compiler = ContextCompiler::new(&store, &counter, &roles);
        let ctx = compiler
            .compile("t", &head, &CompileQuery::default())
            .expect("compile");

        assert_eq!(ctx.commit_count, 1);
        assert_eq!(ctx.messages[0].content, "v2");
        assert_eq!(ctx.commit_hashes[0], base.commit_hash);
    }

    /// SKIP annotations drop messages from compile output.
    #[test]
    fn test_skip_priority() {
        let (store, counter, roles) = setup();
        let engine = CommitEngine::new(&store, &counter, "t", None, false);
        commit(&store, &counter, &Content::instruction("sys"));
        let noisy = commit(&store, &counter, &Content::user("noise"));
        commit(&store, &counter, &Content::assistant("answer"));

        engine
            .annotate(&noisy.commit_hash, Priority::Skip, None, None)
            .expect("annotate");

        let head = store.get_head("t").expect("head").expect("present");
        let compiler = ContextCompiler::new(&store, &counter, &roles);
        let ctx = compiler
            .compile("t", &head, &CompileQuery::default())
            .expect("compile");
        assert_eq!(ctx.commit_count, 2);
        assert_eq!(ctx.messages[0].role, "system");
        assert_eq!(ctx.messages[1].role, "assistant");
    }

    /// Time travel: compile(at_time) ignores later commits and later
    /// annotations.
    #[test]
    fn test_time_travel() {
        let (store, counter, roles) = setup();
        let engine = CommitEngine::new(&store, &counter, "t", None, false);
        let first = commit(&store, &counter, &Content::user("early"));
        let cutoff = first.created_at;
        commit(&store, &counter, &Content::user("late"));
        engine
            .annotate(&first.commit_hash, Priority::Skip, None, None)
            .expect("annotate");

        let head = store.get_head("t").expect("head").expect("present");
        let compiler = ContextCompiler::new(&store, &counter, &roles);
        let ctx = compiler
            .compile(
                "t",
                &head,
                &CompileQuery {
                    at_time: Some(cutoff),
                    ..Default::default()
                },
            )
            .expect("compile");

        // The late commit and the late SKIP annotation are both outside
        // the window.
        assert_eq!(ctx.commit_count, 1);
        assert_eq!(ctx.messages[0].content, "early");
    }

    /// at_time and at_commit are mutually exclusive.
    #[test]
    fn test_time_filters_exclusive() {
        let (store, counter, roles) = setup();
        commit(&store, &counter, &Content::user("x"));
        let head = store.get_head("t").expect("head").expect("present");
        let compiler = ContextCompiler::new(&store, &counter, &roles);
        let err = compiler
            .compile(
                "t",
                &head,
                &CompileQuery {
                    at_time: Some(chrono::Utc::now()),
                    at_commit: Some(head.clone()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TractError::InvalidArgument(_)));
    }

    /// The edited marker is appended when requested.
    #[test]
    fn test_edit_marker() {
        let (store, counter, roles) = setup();
        let engine = CommitEngine::new(&store, &counter, "t", None, false);
        let base = commit(&store, &counter, &Content::user("v0"));
        engine
            .create_commit(
                &Content::user("v1"),
                CommitOperation::Edit,
                CommitOptions {
                    response_to: Some(base.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .expect("edit");

        let head = store.get_head("t").expect("head").expect("present");
        let compiler = ContextCompiler::new(&store, &counter, &roles);
        let ctx = compiler
            .compile(
                "t",
                &head,
                &CompileQuery {
                    include_edit_annotations: true,
                    ..Default::default()
                },
            )
            .expect("compile");
        assert_eq!(ctx.messages[0].content, "v1 [edited]");
    }

    /// Tool I/O renders header plus pretty payload and maps to the tool
    /// role.
    #[test]
    fn test_tool_io_rendering() {
        let (store, counter, roles) = setup();
        commit(
            &store,
            &counter,
            &Content::ToolIo {
                tool_name: "grep".to_string(),
                direction: crate::model::content::ToolDirection::Result,
                payload: serde_json::json!({"hits": 2}),
                status: Some(crate::model::content::ToolStatus::Success),
            },
        );
        let head = store.get_head("t").expect("head").expect("present");
        let compiler = ContextCompiler::new(&store, &counter, &roles);
        let ctx = compiler
            .compile("t", &head, &CompileQuery::default())
            .expect("compile");
        assert_eq!(ctx.messages[0].role, "tool");
        assert!(ctx.messages[0].content.starts_with("Tool result: grep (success)\n"));
        assert!(ctx.messages[0].content.contains("\"hits\": 2"));
    }
}
