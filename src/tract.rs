//! The Tract facade: single entry point binding storage, the commit
//! engine, the compiler, the incremental cache, history operations, the
//! LLM boundary, and the hook protocol.
//!
//! One `Tract` owns one storage session and is the exclusive mutator
//! for its refs, commits, and annotations. Operations are totally
//! ordered by invocation; the cache is patched synchronously with the
//! write that invalidated it.

use std::collections::HashMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{AutoSummarize, LlmConfig, TractConfig};
use crate::dag::get_all_ancestors;
use crate::engine::cache::CacheManager;
use crate::engine::commit::{CommitEngine, CommitOptions};
use crate::engine::compiler::{CompileQuery, ContextCompiler};
use crate::errors::{Result, TractError};
use crate::hooks::{
    HookRegistry, HookRejection, Outcome, PendingCompress, PendingGc, PendingMerge, PendingOp,
    PendingReview, PendingStatus, PendingToolResult,
};
use crate::llm::resolver::ConflictResolver;
use crate::llm::{ChatRequest, LlmClient, LlmError, ToolCall};
use crate::model::annotation::{Priority, PriorityAnnotation, RetentionCriteria};
use crate::model::commit::{CommitInfo, CommitOperation};
use crate::model::content::{Content, ToolDirection, ToolStatus};
use crate::model::merge::{ConflictInfo, MergeResult};
use crate::model::message::{CompiledContext, TokenUsage};
use crate::model::results::{CompressResult, GcResult, ImportResult, RebaseResult, ResetMode};
use crate::ops::compress::{CompressOptions, CompressionPlan};
use crate::ops::gc::{GcOptions, GcPlan};
use crate::ops::merge::MergeStrategy;
use crate::storage::refs::validate_branch_name;
use crate::storage::rows::CompileRecordRow;
use crate::storage::{CommitRow, Storage};
use crate::tokens::{create_token_counter, TokenCounter};

/// Response from [`Tract::chat`] / [`Tract::generate`].
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub commit_info: CommitInfo,
    pub generation_config: LlmConfig,
    /// The user message that triggered this response; `None` for
    /// `generate()` where the user committed separately.
    pub prompt: Option<String>,
    pub reasoning: Option<String>,
    pub reasoning_commit: Option<CommitInfo>,
    pub tool_calls: Vec<ToolCall>,
}

impl std::fmt::Display for ChatResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Per-call merge options.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeCallOptions {
    pub strategy: MergeStrategy,
    pub no_ff: bool,
    /// Return the `PendingMerge` instead of consulting hooks.
    pub review: bool,
}

struct ClientHandle {
    client: Rc<dyn LlmClient>,
    /// Created by this tract (close on shutdown) vs merely received.
    owned: bool,
}

const DEFAULT_CLIENT_KEY: &str = "default";

/// A content-addressed repository of LLM conversation context.
pub struct Tract {
    store: Storage,
    tract_id: String,
    config: TractConfig,
    counter: Box<dyn TokenCounter>,
    cache: CacheManager,
    hooks: HookRegistry,
    clients: HashMap<String, ClientHandle>,
    type_roles: HashMap<String, String>,
    in_batch: bool,
}

impl Tract {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open a tract with the given configuration.
    pub fn open(config: TractConfig) -> Result<Tract> {
        let store = Storage::open(&config.path)?;
        let tract_id = config
            .tract_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let counter = create_token_counter(&config.tokenizer_encoding);
        let cache = CacheManager::new(config.compile_cache_size);

        // Compile-time role overrides: explicit config wins over the
        // custom type registry's role hints.
        let type_roles = config.type_roles.clone();

        Ok(Tract {
            store,
            tract_id,
            config,
            counter,
            cache,
            hooks: HookRegistry::new(),
            clients: HashMap::new(),
            type_roles,
            in_batch: false,
        })
    }

    /// Open an ephemeral in-memory tract.
    pub fn open_in_memory() -> Result<Tract> {
        Self::open(TractConfig::in_memory())
    }

    /// Open a tract stored at a filesystem path.
    pub fn open_at(path: impl Into<String>) -> Result<Tract> {
        Self::open(TractConfig::at_path(path))
    }

    pub fn tract_id(&self) -> &str {
        &self.tract_id
    }

    pub fn config(&self) -> &TractConfig {
        &self.config
    }

    /// Attach a default LLM client the tract merely received (the
    /// caller remains responsible for it).
    pub fn set_llm_client(&mut self, client: Rc<dyn LlmClient>) {
        self.clients.insert(
            DEFAULT_CLIENT_KEY.to_string(),
            ClientHandle {
                client,
                owned: false,
            },
        );
    }

    /// Attach a default LLM client the tract created and owns.
    pub fn set_owned_llm_client(&mut self, client: Rc<dyn LlmClient>) {
        self.clients.insert(
            DEFAULT_CLIENT_KEY.to_string(),
            ClientHandle {
                client,
                owned: true,
            },
        );
    }

    /// Attach a per-operation client override (`chat`, `merge`,
    /// `compress`, `summarize`). Overrides never transfer ownership.
    pub fn set_operation_client(&mut self, operation: impl Into<String>, client: Rc<dyn LlmClient>) {
        self.clients.insert(
            operation.into(),
            ClientHandle {
                client,
                owned: false,
            },
        );
    }

    fn resolve_client(&self, operation: &str) -> Option<Rc<dyn LlmClient>> {
        self.clients
            .get(operation)
            .or_else(|| self.clients.get(DEFAULT_CLIENT_KEY))
            .map(|h| Rc::clone(&h.client))
    }

    /// Close the tract, releasing clients it owns.
    pub fn close(mut self) {
        for (name, handle) in self.clients.drain() {
            if handle.owned {
                tracing::debug!(client = %name, "closing owned LLM client");
            }
        }
    }

    // ------------------------------------------------------------------
    // HEAD and branch state
    // ------------------------------------------------------------------

    pub fn head(&self) -> Result<Option<String>> {
        self.store.get_head(&self.tract_id)
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        self.store.get_current_branch(&self.tract_id)
    }

    pub fn is_detached(&self) -> Result<bool> {
        self.store.is_detached(&self.tract_id)
    }

    // ------------------------------------------------------------------
    // Commit surface
    // ------------------------------------------------------------------

    /// Commit a content payload as an APPEND.
    pub fn commit(&mut self, content: Content) -> Result<CommitInfo> {
        self.commit_with(content, CommitOptions::default())
    }

    /// Commit with explicit options (message, metadata, config).
    pub fn commit_with(&mut self, content: Content, mut opts: CommitOptions) -> Result<CommitInfo> {
        if opts.message.is_none() {
            opts.message = self.auto_message(&content.extract_text());
        }
        let info = self
            .engine()
            .create_commit(&content, CommitOperation::Append, opts)?;
        self.extend_cache(&info)?;
        Ok(info)
    }

    /// Commit a pinned system instruction.
    pub fn system(&mut self, text: impl Into<String>) -> Result<CommitInfo> {
        self.commit(Content::instruction(text))
    }

    /// Commit a user dialogue message.
    pub fn user(&mut self, text: impl Into<String>) -> Result<CommitInfo> {
        self.commit(Content::user(text))
    }

    /// Commit an assistant dialogue message.
    pub fn assistant(&mut self, text: impl Into<String>) -> Result<CommitInfo> {
        self.commit(Content::assistant(text))
    }

    /// Commit an EDIT superseding `target` (hash or prefix).
    pub fn edit(&mut self, target: &str, content: Content) -> Result<CommitInfo> {
        let target = self.resolve_prefix(target)?;
        let info = self.engine().create_commit(
            &content,
            CommitOperation::Edit,
            CommitOptions {
                response_to: Some(target),
                ..Default::default()
            },
        )?;
        self.patch_cache_for_edit(&info)?;
        Ok(info)
    }

    /// Commit a custom-typed payload validated against the per-tract
    /// type registry.
    pub fn commit_custom(&mut self, value: Value) -> Result<CommitInfo> {
        self.config.custom_types.validate(&value)?;
        let info = self.engine().create_commit_from_value(
            &value,
            CommitOperation::Append,
            CommitOptions::default(),
        )?;
        self.extend_cache(&info)?;
        Ok(info)
    }

    /// Annotate a commit (hash or prefix) with a priority.
    pub fn annotate(&mut self, target: &str, priority: Priority) -> Result<PriorityAnnotation> {
        self.annotate_with(target, priority, None, None)
    }

    /// Annotate with retention criteria and a reason.
    pub fn annotate_with(
        &mut self,
        target: &str,
        priority: Priority,
        retention: Option<RetentionCriteria>,
        reason: Option<String>,
    ) -> Result<PriorityAnnotation> {
        let target = self.resolve_prefix(target)?;
        let annotation = self.engine().annotate(&target, priority, retention, reason)?;
        if let Some(head) = self.head()? {
            self.cache.patch_for_annotate(&head, &target, priority);
        }
        Ok(annotation)
    }

    /// Attach an ordered list of tool schemas to the current HEAD.
    pub fn attach_tools(&mut self, tools: &[Value]) -> Result<()> {
        let head = self
            .head()?
            .ok_or_else(|| TractError::Session("cannot attach tools: no commits".to_string()))?;
        let mut hashes = Vec::with_capacity(tools.len());
        for schema in tools {
            let name = schema
                .get("name")
                .or_else(|| schema.pointer("/function/name"))
                .and_then(Value::as_str)
                .unwrap_or("tool");
            hashes.push(self.store.save_tool_schema(name, schema)?);
        }
        self.store.set_commit_tools(&head, &hashes)?;
        // The snapshot under HEAD predates the attachment.
        self.cache.invalidate(&head);
        Ok(())
    }

    /// Commit a tool call emitted by the assistant.
    pub fn tool_call(
        &mut self,
        call_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<CommitInfo> {
        let content = Content::ToolIo {
            tool_name: tool_name.to_string(),
            direction: ToolDirection::Call,
            payload: serde_json::json!({"call_id": call_id, "arguments": arguments}),
            status: None,
        };
        self.commit(content)
    }

    /// Record a tool result through the `tool_result` hook.
    pub fn tool_result(
        &mut self,
        call_id: &str,
        tool_name: &str,
        content: &str,
    ) -> Result<Outcome<CommitInfo, PendingToolResult>> {
        self.tool_result_with(call_id, tool_name, content, false, false)
    }

    /// Record a tool result with an error flag and/or forced review.
    pub fn tool_result_with(
        &mut self,
        call_id: &str,
        tool_name: &str,
        content: &str,
        is_error: bool,
        review: bool,
    ) -> Result<Outcome<CommitInfo, PendingToolResult>> {
        let pending = PendingToolResult::new(self, call_id, tool_name, content, is_error);
        let op = self.dispatch(PendingOp::ToolResult(pending), review, true)?;
        let PendingOp::ToolResult(pending) = op else {
            unreachable!("dispatch preserves the pending kind");
        };
        Ok(match pending.meta().status {
            PendingStatus::Approved => Outcome::Applied(
                pending
                    .commit_info()
                    .cloned()
                    .expect("approved tool result has a commit"),
            ),
            PendingStatus::Rejected => Outcome::Rejected(rejection_of(pending.meta())),
            PendingStatus::Pending => Outcome::Pending(pending),
        })
    }

    /// Run several commits as one batch: automatic LLM commit messages
    /// are deferred, and `chat()` / `generate()` are rejected inside.
    pub fn batch<T>(&mut self, f: impl FnOnce(&mut Tract) -> Result<T>) -> Result<T> {
        if self.in_batch {
            return Err(TractError::Session("batch() cannot be nested".to_string()));
        }
        self.in_batch = true;
        let result = f(self);
        self.in_batch = false;
        result
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    /// Ancestors of HEAD, newest first.
    pub fn log(&self, limit: Option<usize>) -> Result<Vec<CommitInfo>> {
        let Some(head) = self.head()? else {
            return Ok(Vec::new());
        };
        Ok(self
            .store
            .get_ancestors(&head, limit, None)?
            .into_iter()
            .map(|row| row.to_info())
            .collect())
    }

    /// Look up a commit by hash or unique prefix.
    pub fn get_commit(&self, hash_or_prefix: &str) -> Result<CommitInfo> {
        let hash = self.resolve_prefix(hash_or_prefix)?;
        self.store
            .get_commit(&hash)?
            .map(|row| row.to_info())
            .ok_or_else(|| TractError::CommitNotFound(hash_or_prefix.to_string()))
    }

    /// Raw content payload of a commit.
    pub fn get_content(&self, hash_or_prefix: &str) -> Result<Value> {
        let info = self.get_commit(hash_or_prefix)?;
        let blob = self
            .store
            .get_blob(&info.content_hash)?
            .ok_or_else(|| TractError::BlobNotFound(info.content_hash.clone()))?;
        Ok(blob.payload()?)
    }

    /// The commit plus its EDITs, in chronological order.
    pub fn edit_history(&self, target: &str) -> Result<Vec<CommitInfo>> {
        let target = self.resolve_prefix(target)?;
        let base = self
            .store
            .get_commit(&target)?
            .ok_or_else(|| TractError::CommitNotFound(target.clone()))?;
        let mut history = vec![base.to_info()];
        history.extend(
            self.store
                .get_edits_of(&target)?
                .into_iter()
                .map(|row| row.to_info()),
        );
        Ok(history)
    }

    /// Tool result commits, optionally filtered by tool name.
    pub fn find_tool_results(&self, tool_name: Option<&str>) -> Result<Vec<CommitInfo>> {
        let rows = self.store.get_commits_by_type(&self.tract_id, "tool_io")?;
        let mut results = Vec::new();
        for row in rows {
            let Some(blob) = self.store.get_blob(&row.content_hash)? else {
                continue;
            };
            let data = blob.payload()?;
            if data.get("direction").and_then(Value::as_str) != Some("result") {
                continue;
            }
            if let Some(name) = tool_name {
                if data.get("tool_name").and_then(Value::as_str) != Some(name) {
                    continue;
                }
            }
            results.push(row.to_info());
        }
        Ok(results)
    }

    /// Full parent list of a commit: all recorded parents for merges,
    /// else the single first parent.
    pub fn get_parents(&self, hash_or_prefix: &str) -> Result<Vec<String>> {
        let hash = self.resolve_prefix(hash_or_prefix)?;
        let recorded = self.store.get_parents(&hash)?;
        if !recorded.is_empty() {
            return Ok(recorded);
        }
        let info = self.get_commit(&hash)?;
        Ok(info.parent_hash.into_iter().collect())
    }

    /// Resolve a full hash or unique prefix to a full hash.
    pub fn resolve_prefix(&self, hash_or_prefix: &str) -> Result<String> {
        if hash_or_prefix.len() == crate::hash::FULL_HASH_LEN {
            return Ok(hash_or_prefix.to_string());
        }
        self.store
            .get_commit_by_prefix(hash_or_prefix, Some(&self.tract_id))?
            .map(|row| row.commit_hash)
            .ok_or_else(|| TractError::CommitNotFound(hash_or_prefix.to_string()))
    }

    /// Persisted compile records, oldest first.
    pub fn compile_records(&self) -> Result<Vec<CompileRecordRow>> {
        self.store.list_compile_records(&self.tract_id)
    }

    /// Count tokens with the tract's counter.
    pub fn count_text(&self, text: &str) -> usize {
        self.counter.count_text(text)
    }

    // ------------------------------------------------------------------
    // Branch surface
    // ------------------------------------------------------------------

    /// Create a branch at HEAD.
    pub fn create_branch(&mut self, name: &str) -> Result<()> {
        let head = self.head()?.ok_or_else(|| {
            TractError::Session("cannot branch: tract has no commits".to_string())
        })?;
        self.create_branch_at(name, &head)
    }

    /// Create a branch at a specific commit (hash or prefix).
    pub fn create_branch_at(&mut self, name: &str, at: &str) -> Result<()> {
        validate_branch_name(name)?;
        if self.store.get_branch(&self.tract_id, name)?.is_some() {
            return Err(TractError::BranchExists(name.to_string()));
        }
        let target = self.resolve_prefix(at)?;
        self.store.set_branch(&self.tract_id, name, &target)
    }

    /// Check out a branch, or detach at a commit hash/prefix.
    pub fn checkout(&mut self, target: &str) -> Result<()> {
        if self.store.get_branch(&self.tract_id, target)?.is_some() {
            return self.store.attach_head(&self.tract_id, target);
        }
        match self.resolve_prefix(target) {
            Ok(hash) => self.store.detach_head(&self.tract_id, &hash),
            Err(TractError::CommitNotFound(_)) => {
                Err(TractError::BranchNotFound(target.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Delete a branch. Refuses when it carries unmerged commits unless
    /// forced, and always refuses to delete the checked-out branch.
    pub fn delete_branch(&mut self, name: &str, force: bool) -> Result<()> {
        let tip = self
            .store
            .get_branch(&self.tract_id, name)?
            .ok_or_else(|| TractError::BranchNotFound(name.to_string()))?;
        if self.current_branch()?.as_deref() == Some(name) {
            return Err(TractError::InvalidArgument(format!(
                "cannot delete the checked-out branch '{name}'"
            )));
        }

        if !force {
            // Reachability from every other ref: the remaining branches
            // plus a detached HEAD, if any.
            let mut reachable = std::collections::HashSet::new();
            for branch in self.store.list_branches(&self.tract_id)? {
                if branch == name {
                    continue;
                }
                if let Some(other_tip) = self.store.get_branch(&self.tract_id, &branch)? {
                    let more = get_all_ancestors(&self.store, &other_tip, Some(&reachable))?;
                    reachable.extend(more);
                }
            }
            if self.is_detached()? {
                if let Some(head) = self.head()? {
                    let more = get_all_ancestors(&self.store, &head, Some(&reachable))?;
                    reachable.extend(more);
                }
            }
            if !reachable.contains(&tip) {
                return Err(TractError::UnmergedBranch(name.to_string()));
            }
        }
        self.store.delete_branch_ref(&self.tract_id, name)
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        self.store.list_branches(&self.tract_id)
    }

    // ------------------------------------------------------------------
    // Compile surface
    // ------------------------------------------------------------------

    /// Compile the current HEAD, served from the snapshot cache when
    /// possible.
    pub fn compile(&mut self) -> Result<CompiledContext> {
        let Some(head) = self.head()? else {
            return Ok(CompiledContext::default());
        };

        if let Some(snapshot) = self.cache.get(&head) {
            let tool_hashes = snapshot.tool_hashes.clone();
            let mut context = CacheManager::to_compiled(snapshot);
            for hash in &tool_hashes {
                if let Some(row) = self.store.get_tool_schema(hash)? {
                    context.tools.push(row.schema);
                }
            }
            return Ok(context);
        }

        let compiler = ContextCompiler::new(&self.store, self.counter.as_ref(), &self.type_roles);
        let context = compiler.compile(&self.tract_id, &head, &CompileQuery::default())?;
        let snapshot = CacheManager::build_snapshot(&head, &context, self.counter.as_ref());
        self.cache.put(head, snapshot);
        Ok(context)
    }

    /// Compile as of a historical instant. Bypasses the cache.
    pub fn compile_at_time(&self, at_time: DateTime<Utc>) -> Result<CompiledContext> {
        self.compile_query(&CompileQuery {
            at_time: Some(at_time),
            ..Default::default()
        })
    }

    /// Compile up to and including a commit. Bypasses the cache.
    pub fn compile_at_commit(&self, at_commit: &str) -> Result<CompiledContext> {
        let hash = self.resolve_prefix(at_commit)?;
        self.compile_query(&CompileQuery {
            at_commit: Some(hash),
            ..Default::default()
        })
    }

    /// Compile with explicit options. Bypasses the cache.
    pub fn compile_query(&self, query: &CompileQuery) -> Result<CompiledContext> {
        let Some(head) = self.head()? else {
            return Ok(CompiledContext::default());
        };
        let compiler = ContextCompiler::new(&self.store, self.counter.as_ref(), &self.type_roles);
        compiler.compile(&self.tract_id, &head, query)
    }

    /// Drop all cached compile snapshots.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    // ------------------------------------------------------------------
    // LLM surface
    // ------------------------------------------------------------------

    /// Compile, call the chat client, commit the assistant reply, and
    /// persist a compile record calibrated with API usage.
    pub fn generate(&mut self) -> Result<ChatResponse> {
        self.generate_internal(None)
    }

    /// Commit a user message, then [`Tract::generate`].
    pub fn chat(&mut self, text: impl Into<String>) -> Result<ChatResponse> {
        let text = text.into();
        if self.in_batch {
            return Err(TractError::Session(
                "chat() is not allowed inside batch()".to_string(),
            ));
        }
        self.user(text.clone())?;
        self.generate_internal(Some(text))
    }

    fn generate_internal(&mut self, prompt: Option<String>) -> Result<ChatResponse> {
        if self.in_batch {
            return Err(TractError::Session(
                "generate() is not allowed inside batch()".to_string(),
            ));
        }
        let head = self.head()?.ok_or_else(|| {
            TractError::Session("nothing to generate from: tract has no commits".to_string())
        })?;
        let context = self.compile()?;
        let client = self.resolve_client("chat").ok_or_else(|| {
            TractError::Llm(LlmError::Config("no LLM client configured".to_string()))
        })?;
        let config = self.config.config_for("chat");

        let request = ChatRequest {
            messages: context.to_values(),
            config: config.clone(),
            tools: context.tools.clone(),
        };
        let completion = client.chat(&request)?;

        // Persist the compile event with its effective ordering.
        let (token_count, token_source) = match completion.usage {
            Some(usage) => (
                usage.prompt_tokens,
                format!("api:{}+{}", usage.prompt_tokens, usage.completion_tokens),
            ),
            None => (context.token_count, context.token_source.clone()),
        };
        let record = CompileRecordRow {
            record_id: Uuid::new_v4().simple().to_string(),
            tract_id: self.tract_id.clone(),
            head_hash: head.clone(),
            token_count,
            commit_count: context.commit_count,
            token_source,
            params: Some(config.to_value()),
            created_at: Utc::now(),
        };
        self.store
            .save_compile_record(&record, &context.commit_hashes)?;

        if let Some(usage) = completion.usage {
            self.cache
                .record_api_tokens(&head, usage.prompt_tokens, usage.completion_tokens);
        }

        let reasoning_commit = match &completion.reasoning {
            Some(reasoning) => Some(self.commit_with(
                Content::Reasoning {
                    text: reasoning.clone(),
                },
                CommitOptions::default(),
            )?),
            None => None,
        };

        let metadata = if completion.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::json!({
                "tool_calls": &completion.tool_calls,
            }))
        };
        let commit_info = self.commit_with(
            Content::assistant(completion.content.clone()),
            CommitOptions {
                metadata,
                generation_config: Some(config.to_value()),
                ..Default::default()
            },
        )?;

        Ok(ChatResponse {
            text: completion.content,
            usage: completion.usage,
            commit_info,
            generation_config: config,
            prompt,
            reasoning: completion.reasoning,
            reasoning_commit,
            tool_calls: completion.tool_calls,
        })
    }

    /// Shorten arbitrary text via the summarize client.
    pub fn summarize_text(&mut self, text: &str, instructions: Option<&str>) -> Result<String> {
        let client = self.resolve_client("summarize").ok_or_else(|| {
            TractError::Llm(LlmError::Config(
                "no LLM client configured for summarize".to_string(),
            ))
        })?;
        let config = self.config.config_for("summarize");
        let mut prompt = String::from("Shorten the following content, preserving identifiers and outcomes.");
        if let Some(extra) = instructions {
            prompt.push('\n');
            prompt.push_str(extra);
        }
        let request = ChatRequest::new(vec![
            serde_json::json!({"role": "system", "content": prompt}),
            serde_json::json!({"role": "user", "content": text}),
        ])
        .with_config(config);
        Ok(client.chat(&request)?.content.trim().to_string())
    }

    // ------------------------------------------------------------------
    // History operations
    // ------------------------------------------------------------------

    /// Merge a branch into the current branch.
    pub fn merge(&mut self, source_branch: &str) -> Result<Outcome<MergeResult, PendingMerge>> {
        self.merge_with(source_branch, MergeCallOptions::default(), None)
    }

    /// Merge with options and an optional conflict resolver.
    pub fn merge_with(
        &mut self,
        source_branch: &str,
        opts: MergeCallOptions,
        resolver: Option<&dyn ConflictResolver>,
    ) -> Result<Outcome<MergeResult, PendingMerge>> {
        let result = {
            let engine = self.engine();
            crate::ops::merge::merge_branches(
                &self.store,
                &engine,
                &self.tract_id,
                source_branch,
                resolver,
                opts.strategy,
                opts.no_ff,
            )?
        };

        if result.committed {
            return Ok(Outcome::Applied(result));
        }

        if !opts.review && result.fully_resolved() && !result.conflicts.is_empty() {
            // The resolver answered everything: commit directly.
            let info = self.commit_pending_merge(&result)?;
            let mut result = result;
            result.committed = true;
            result.merge_commit_hash = Some(info.commit_hash);
            return Ok(Outcome::Applied(result));
        }

        let pending = PendingMerge::new(result);
        let op = self.dispatch(PendingOp::Merge(pending), opts.review, false)?;
        let PendingOp::Merge(pending) = op else {
            unreachable!("dispatch preserves the pending kind");
        };
        Ok(match pending.meta().status {
            PendingStatus::Approved => Outcome::Applied(pending.merge_result().clone()),
            PendingStatus::Rejected => Outcome::Rejected(rejection_of(pending.meta())),
            PendingStatus::Pending => Outcome::Pending(pending),
        })
    }

    /// Replay the current branch onto a target branch.
    pub fn rebase(&mut self, target_branch: &str) -> Result<RebaseResult> {
        let result = {
            let engine = self.engine();
            crate::ops::rebase::rebase(&self.store, &engine, &self.tract_id, target_branch)?
        };
        self.cache.clear();
        Ok(result)
    }

    /// Cherry-pick one commit (hash or prefix) onto the current branch.
    pub fn cherry_pick(&mut self, source: &str) -> Result<ImportResult> {
        let source = self.resolve_prefix(source)?;
        let result = {
            let engine = self.engine();
            crate::ops::rebase::import_commit(&self.store, &engine, &source)?
        };
        self.extend_cache(&result.imported)?;
        Ok(result)
    }

    /// Move the current branch (or detached HEAD) to a commit.
    pub fn reset(&mut self, target: &str, mode: ResetMode, force: bool) -> Result<()> {
        let target = self.resolve_prefix(target)?;
        crate::ops::rebase::reset(&self.store, &self.tract_id, &target, mode, force)
    }

    /// Compress history through the hook protocol.
    pub fn compress(
        &mut self,
        opts: CompressOptions,
    ) -> Result<Outcome<CompressResult, PendingCompress>> {
        self.compress_with(opts, false)
    }

    /// Compress, optionally returning the pending for review.
    pub fn compress_with(
        &mut self,
        mut opts: CompressOptions,
        review: bool,
    ) -> Result<Outcome<CompressResult, PendingCompress>> {
        if opts.generation_config.is_none() {
            opts.generation_config = Some(self.config.config_for("compress"));
        }
        let client = self.resolve_client("compress");
        let plan = crate::ops::compress::plan_compress(
            &self.store,
            self.counter.as_ref(),
            client.as_deref(),
            &self.tract_id,
            &opts,
        )?;

        let pending = PendingCompress::new(plan);
        let op = self.dispatch(PendingOp::Compress(pending), review, true)?;
        let PendingOp::Compress(pending) = op else {
            unreachable!("dispatch preserves the pending kind");
        };
        Ok(match pending.meta().status {
            PendingStatus::Approved => Outcome::Applied(
                pending
                    .result()
                    .cloned()
                    .expect("approved compression has a result"),
            ),
            PendingStatus::Rejected => Outcome::Rejected(rejection_of(pending.meta())),
            PendingStatus::Pending => Outcome::Pending(pending),
        })
    }

    /// Garbage-collect unreachable history through the hook protocol.
    pub fn gc(&mut self, opts: GcOptions) -> Result<Outcome<GcResult, PendingGc>> {
        self.gc_with(opts, false)
    }

    /// GC, optionally returning the pending for review.
    pub fn gc_with(
        &mut self,
        opts: GcOptions,
        review: bool,
    ) -> Result<Outcome<GcResult, PendingGc>> {
        let plan = crate::ops::gc::plan_gc(&self.store, &self.tract_id, &opts)?;
        let pending = PendingGc::new(plan);
        let op = self.dispatch(PendingOp::Gc(pending), review, true)?;
        let PendingOp::Gc(pending) = op else {
            unreachable!("dispatch preserves the pending kind");
        };
        Ok(match pending.meta().status {
            PendingStatus::Approved => Outcome::Applied(
                pending.result().cloned().expect("approved gc has a result"),
            ),
            PendingStatus::Rejected => Outcome::Rejected(rejection_of(pending.meta())),
            PendingStatus::Pending => Outcome::Pending(pending),
        })
    }

    // ------------------------------------------------------------------
    // Hook registration
    // ------------------------------------------------------------------

    /// Register a handler for a hookable operation (`"*"` catches any
    /// operation without a specific handler).
    pub fn on(
        &mut self,
        operation: impl Into<String>,
        handler: impl Fn(&mut Tract, &mut PendingOp) -> Result<()> + 'static,
    ) {
        self.hooks.register(operation, Rc::new(handler));
    }

    /// Remove a registered handler.
    pub fn off(&mut self, operation: &str) {
        self.hooks.unregister(operation);
    }

    /// Three-tier dispatch with the recursion guard.
    fn dispatch(
        &mut self,
        mut op: PendingOp,
        review: bool,
        default_approve: bool,
    ) -> Result<PendingOp> {
        if review {
            return Ok(op);
        }
        if self.hooks.is_firing() {
            // A handler is already running: auto-approve nested
            // hookables instead of firing their hooks.
            if default_approve {
                op.approve_any(self)?;
            }
            return Ok(op);
        }
        if let Some(handler) = self.hooks.resolve(op.operation()) {
            let _guard = self.hooks.firing_guard();
            handler(self, &mut op)?;
            return Ok(op);
        }
        if default_approve {
            op.approve_any(self)?;
        }
        Ok(op)
    }

    // ------------------------------------------------------------------
    // Internal plumbing used by pendings and operations
    // ------------------------------------------------------------------

    pub(crate) fn apply_compression_plan(
        &mut self,
        plan: &CompressionPlan,
    ) -> Result<CompressResult> {
        let result = {
            let engine = self.engine();
            crate::ops::compress::apply_compress(&self.store, &engine, &self.tract_id, plan)?
        };
        // History was rebuilt; every cached snapshot is stale.
        self.cache.clear();
        Ok(result)
    }

    pub(crate) fn summarize_compression_group(
        &mut self,
        group: &[CommitRow],
        target_tokens: Option<usize>,
        instructions: Option<&str>,
        system_prompt: Option<&str>,
        generation_config: Option<LlmConfig>,
        guidance: Option<&str>,
        max_retries: usize,
    ) -> Result<String> {
        let client = self.resolve_client("compress").ok_or_else(|| {
            TractError::Compression("no LLM client configured for compression".to_string())
        })?;
        crate::ops::compress::summarize_group(
            &self.store,
            client.as_ref(),
            group,
            target_tokens,
            instructions,
            system_prompt,
            generation_config,
            guidance,
            max_retries,
        )
    }

    pub(crate) fn commit_pending_merge(&mut self, result: &MergeResult) -> Result<CommitInfo> {
        let info = {
            let engine = self.engine();
            crate::ops::merge::commit_resolved_merge(&self.store, &engine, result)?
        };
        self.cache.clear();
        Ok(info)
    }

    pub(crate) fn resolve_conflicts_with_llm(
        &mut self,
        conflicts: &[ConflictInfo],
        guidance: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        let client = self.resolve_client("merge").ok_or_else(|| {
            TractError::Merge("no LLM client configured for merge resolution".to_string())
        })?;
        let config = self.config.config_for("merge");

        let mut system = String::from(
            "You are resolving conflicts between two versions of messages in an LLM \
             conversation history. Reply with a single merged text per conflict, no preamble.",
        );
        if let Some(extra) = guidance {
            system.push('\n');
            system.push_str(extra);
        }

        let mut resolutions = Vec::with_capacity(conflicts.len());
        for conflict in conflicts {
            let user = format!(
                "Conflict type: {}\n\nVersion A (current branch):\n{}\n\nVersion B (incoming branch):\n{}\n\nMerged text:",
                conflict.conflict_type, conflict.content_a_text, conflict.content_b_text,
            );
            let request = ChatRequest::new(vec![
                serde_json::json!({"role": "system", "content": system}),
                serde_json::json!({"role": "user", "content": user}),
            ])
            .with_config(config.clone());
            let completion = client.chat(&request)?;
            let text = completion.content.trim().to_string();
            if !text.is_empty() {
                resolutions.push((conflict.target_hash.clone(), text));
            }
        }
        Ok(resolutions)
    }

    pub(crate) fn apply_gc_plan(&mut self, plan: &GcPlan) -> Result<GcResult> {
        crate::ops::gc::apply_gc(&self.store, plan)
    }

    pub(crate) fn commit_tool_result_content(
        &mut self,
        call_id: &str,
        tool_name: &str,
        content: &str,
        original_content: Option<&str>,
        is_error: bool,
    ) -> Result<CommitInfo> {
        let content_payload = Content::ToolIo {
            tool_name: tool_name.to_string(),
            direction: ToolDirection::Result,
            payload: serde_json::json!({"call_id": call_id, "content": content}),
            status: Some(if is_error {
                ToolStatus::Error
            } else {
                ToolStatus::Success
            }),
        };
        let metadata = original_content
            .map(|original| serde_json::json!({"original_content": original}));
        let info = self.engine().create_commit(
            &content_payload,
            CommitOperation::Append,
            CommitOptions {
                metadata,
                ..Default::default()
            },
        )?;
        self.extend_cache(&info)?;
        Ok(info)
    }

    /// Summary commit message for a content payload, when enabled.
    fn auto_message(&self, text: &str) -> Option<String> {
        if !self.config.auto_summarize.is_enabled() || self.in_batch || text.is_empty() {
            return None;
        }

        let fallback = || {
            let preview: String = text.chars().take(57).collect();
            if text.chars().count() > 57 {
                format!("{preview}...")
            } else {
                preview
            }
        };

        let Some(client) = self.resolve_client("summarize") else {
            return Some(fallback());
        };
        let mut config = self.config.config_for("summarize");
        match &self.config.auto_summarize {
            AutoSummarize::Model(model) => config.model = Some(model.clone()),
            AutoSummarize::Config(override_config) => {
                config = config.merged_with(override_config);
            }
            AutoSummarize::On | AutoSummarize::Off => {}
        }

        let request = ChatRequest::new(vec![
            serde_json::json!({
                "role": "system",
                "content": "Write a one-line commit message (at most 60 characters) describing \
                            the following content. Reply with the message only.",
            }),
            serde_json::json!({"role": "user", "content": text}),
        ])
        .with_config(config);

        match client.chat(&request) {
            Ok(completion) => {
                let line = completion.content.lines().next().unwrap_or("").trim();
                if line.is_empty() {
                    Some(fallback())
                } else {
                    Some(line.to_string())
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "auto-message generation failed; using preview");
                Some(fallback())
            }
        }
    }

    fn engine(&self) -> CommitEngine<'_> {
        CommitEngine::new(
            &self.store,
            self.counter.as_ref(),
            &self.tract_id,
            self.config.token_budget.as_ref(),
            self.config.forbid_detached_commits,
        )
    }

    fn extend_cache(&mut self, info: &CommitInfo) -> Result<()> {
        let compiler = ContextCompiler::new(&self.store, self.counter.as_ref(), &self.type_roles);
        self.cache.extend_for_append(info, &compiler)
    }

    fn patch_cache_for_edit(&mut self, info: &CommitInfo) -> Result<()> {
        let Some(row) = self.store.get_commit(&info.commit_hash)? else {
            return Ok(());
        };
        let compiler = ContextCompiler::new(&self.store, self.counter.as_ref(), &self.type_roles);
        self.cache
            .patch_for_edit(&info.commit_hash, &row, &compiler)?;
        Ok(())
    }
}

fn rejection_of(meta: &crate::hooks::PendingMeta) -> HookRejection {
    HookRejection {
        reason: meta.rejection_reason.clone().unwrap_or_default(),
        rejection_source: "handler".to_string(),
        metadata: None,
    }
}
