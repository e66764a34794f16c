//! Compile cache manager.
//!
//! An LRU of per-HEAD [`CompileSnapshot`]s with incremental patching:
//! O(1) extension on APPEND, O(1) in-place patch on EDIT, targeted
//! patching on annotation changes, and absorption of API-reported token
//! counts.
//!
//! Token accounting is per-message: each message's count (including
//! per-message overhead, excluding the response primer) is stored next
//! to the snapshot, so deltas never re-count the whole conversation.
//! After [`CacheManager::record_api_tokens`] calibrates the total with
//! API ground truth, per-message counts are rescaled proportionally so
//! subsequent deltas stay additive against the API base.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::engine::compiler::{tool_hashes, ContextCompiler};
use crate::errors::Result;
use crate::model::annotation::Priority;
use crate::model::commit::CommitInfo;
use crate::model::message::{CompileSnapshot, CompiledContext};
use crate::storage::CommitRow;
use crate::tokens::{TokenCounter, RESPONSE_PRIMER_TOKENS};

/// LRU compile-snapshot cache with incremental patching.
pub struct CacheManager {
    cache: LruCache<String, CompileSnapshot>,
}

impl CacheManager {
    pub fn new(maxsize: usize) -> Self {
        let capacity = NonZeroUsize::new(maxsize.max(1)).expect("nonzero");
        Self {
            cache: LruCache::new(capacity),
        }
    }

    // ------------------------------------------------------------------
    // LRU primitives
    // ------------------------------------------------------------------

    /// Get a snapshot, refreshing its recency. `None` on miss.
    pub fn get(&mut self, head_hash: &str) -> Option<&CompileSnapshot> {
        let hit = self.cache.get(head_hash);
        match &hit {
            Some(_) => tracing::debug!(head = %short(head_hash), "cache hit"),
            None => tracing::debug!(head = %short(head_hash), "cache miss"),
        }
        hit
    }

    /// Store a snapshot, evicting the oldest entry at capacity.
    pub fn put(&mut self, head_hash: String, snapshot: CompileSnapshot) {
        self.cache.put(head_hash.clone(), snapshot);
        tracing::debug!(head = %short(&head_hash), size = self.cache.len(), "cache put");
    }

    /// Drop one entry.
    pub fn invalidate(&mut self, head_hash: &str) {
        self.cache.pop(head_hash);
    }

    /// Drop all cached snapshots.
    pub fn clear(&mut self) {
        let size = self.cache.len();
        self.cache.clear();
        if size > 0 {
            tracing::debug!(entries = size, "cache cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    // ------------------------------------------------------------------
    // Snapshot <-> CompiledContext conversion
    // ------------------------------------------------------------------

    /// Convert a snapshot into a compile result.
    ///
    /// Generation configs are deep-copied so callers mutating the
    /// returned context cannot corrupt the cache. Tools are left for the
    /// facade to resolve from `tool_hashes`.
    pub fn to_compiled(snapshot: &CompileSnapshot) -> CompiledContext {
        CompiledContext {
            messages: snapshot.messages.clone(),
            token_count: snapshot.token_count,
            commit_count: snapshot.commit_count,
            token_source: snapshot.token_source.clone(),
            generation_configs: snapshot.generation_configs.clone(),
            commit_hashes: snapshot.commit_hashes.clone(),
            tools: Vec::new(),
        }
    }

    /// Build a snapshot from a full compile result, computing
    /// per-message token counts for later O(1) updates.
    pub fn build_snapshot(
        head_hash: &str,
        result: &CompiledContext,
        counter: &dyn TokenCounter,
    ) -> CompileSnapshot {
        let message_token_counts: Vec<usize> = result
            .messages
            .iter()
            .map(|m| single_message_tokens(counter, m))
            .collect();
        let token_count = if message_token_counts.is_empty() {
            0
        } else {
            message_token_counts.iter().sum::<usize>() + RESPONSE_PRIMER_TOKENS
        };
        CompileSnapshot {
            head_hash: head_hash.to_string(),
            messages: result.messages.clone(),
            commit_count: result.commit_count,
            token_count,
            token_source: result.token_source.clone(),
            generation_configs: result.generation_configs.clone(),
            commit_hashes: result.commit_hashes.clone(),
            message_token_counts,
            tool_hashes: tool_hashes(&result.tools),
        }
    }

    // ------------------------------------------------------------------
    // Incremental patching
    // ------------------------------------------------------------------

    /// Extend the parent snapshot for a fresh APPEND commit.
    ///
    /// Counts only the new message; preserves an API-calibrated base.
    /// No-op when the parent HEAD is not cached.
    pub fn extend_for_append(
        &mut self,
        info: &CommitInfo,
        compiler: &ContextCompiler<'_>,
    ) -> Result<()> {
        let Some(parent_hash) = &info.parent_hash else {
            return Ok(());
        };
        let Some(parent) = self.cache.get(parent_hash).cloned() else {
            return Ok(());
        };
        let Some(row) = compiler.store().get_commit(&info.commit_hash)? else {
            return Ok(());
        };

        let message = compiler.build_message_for_commit(&row)?;
        let new_tokens = single_message_tokens(compiler.counter(), &message);

        let mut snapshot = parent;
        snapshot.head_hash = info.commit_hash.clone();
        snapshot.messages.push(message);
        snapshot.commit_hashes.push(info.commit_hash.clone());
        snapshot
            .generation_configs
            .push(row.generation_config_json.clone());
        snapshot.message_token_counts.push(new_tokens);
        snapshot.commit_count += 1;
        snapshot.token_count = if snapshot.message_token_counts.len() == 1 {
            new_tokens + RESPONSE_PRIMER_TOKENS
        } else {
            snapshot.token_count + new_tokens
        };

        self.put(info.commit_hash.clone(), snapshot);
        Ok(())
    }

    /// Patch the parent snapshot in place for an EDIT commit.
    ///
    /// Locates the edited target by `response_to`. Returns `false`
    /// (without caching anything) when the target is not in the
    /// snapshot, forcing a full recompile on the next read.
    pub fn patch_for_edit(
        &mut self,
        new_head: &str,
        edit_row: &CommitRow,
        compiler: &ContextCompiler<'_>,
    ) -> Result<bool> {
        let Some(parent_hash) = &edit_row.parent_hash else {
            return Ok(false);
        };
        let Some(target) = &edit_row.response_to else {
            return Ok(false);
        };
        let Some(parent) = self.cache.get(parent_hash).cloned() else {
            return Ok(false);
        };
        let Some(index) = parent.commit_hashes.iter().position(|h| h == target) else {
            return Ok(false);
        };

        let message = compiler.build_message_for_commit(edit_row)?;
        let new_tokens = single_message_tokens(compiler.counter(), &message);

        let mut snapshot = parent;
        snapshot.head_hash = new_head.to_string();
        let old_tokens = snapshot.message_token_counts[index];
        snapshot.messages[index] = message;
        snapshot.message_token_counts[index] = new_tokens;
        // Edit-inherits-original: only an edit carrying its own config
        // replaces the one at the target position.
        if let Some(config) = &edit_row.generation_config_json {
            snapshot.generation_configs[index] = Some(config.clone());
        }
        snapshot.token_count = snapshot.token_count - old_tokens + new_tokens;

        self.put(new_head.to_string(), snapshot);
        Ok(true)
    }

    /// Patch the snapshot under `head` for an annotation change.
    ///
    /// SKIP on a present target removes its entry from every parallel
    /// array; SKIP on an absent target is a no-op; a non-SKIP priority
    /// on an absent (previously skipped) target evicts the snapshot
    /// because the message text is not materialized.
    pub fn patch_for_annotate(&mut self, head: &str, target: &str, new_priority: Priority) {
        let Some(snapshot) = self.cache.get(head).cloned() else {
            return;
        };
        let index = snapshot.commit_hashes.iter().position(|h| h == target);

        match (new_priority, index) {
            (Priority::Skip, Some(index)) => {
                let mut patched = snapshot;
                patched.messages.remove(index);
                patched.generation_configs.remove(index);
                patched.commit_hashes.remove(index);
                let removed = patched.message_token_counts.remove(index);
                patched.commit_count -= 1;
                patched.token_count = patched.token_count.saturating_sub(removed);
                self.put(head.to_string(), patched);
            }
            (Priority::Skip, None) => {
                // Already excluded.
            }
            (_, Some(_)) => {
                // Already included; nothing to change.
            }
            (_, None) => {
                // Previously skipped; the message content is not
                // materialized, so force a full recompile.
                self.invalidate(head);
            }
        }
    }

    /// Absorb API-reported token usage into the snapshot for `head`.
    ///
    /// The total becomes the reported prompt tokens, `token_source`
    /// flips to `api:<prompt>+<completion>`, and per-message counts are
    /// rescaled proportionally so future deltas stay consistent.
    /// Returns `false` when the head is not cached.
    pub fn record_api_tokens(
        &mut self,
        head: &str,
        prompt_tokens: usize,
        completion_tokens: usize,
    ) -> bool {
        let Some(snapshot) = self.cache.get_mut(head) else {
            return false;
        };
        let old_sum: usize = snapshot.message_token_counts.iter().sum();
        if old_sum > 0 {
            let target_sum = prompt_tokens.saturating_sub(RESPONSE_PRIMER_TOKENS);
            let mut new_counts: Vec<usize> = snapshot
                .message_token_counts
                .iter()
                .map(|&c| c * target_sum / old_sum)
                .collect();
            // Push rounding drift into the last message so the invariant
            // sum + primer == token_count holds.
            let scaled_sum: usize = new_counts.iter().sum();
            if let Some(last) = new_counts.last_mut() {
                *last += target_sum - scaled_sum;
            }
            snapshot.message_token_counts = new_counts;
        }
        snapshot.token_count = prompt_tokens;
        snapshot.token_source = format!("api:{prompt_tokens}+{completion_tokens}");
        true
    }
}

fn single_message_tokens(
    counter: &dyn TokenCounter,
    message: &crate::model::message::Message,
) -> usize {
    counter
        .count_messages(&[message.to_value()])
        .saturating_sub(RESPONSE_PRIMER_TOKENS)
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::engine::commit::{CommitEngine, CommitOptions};
    use crate::engine::compiler::CompileQuery;
    use crate::model::commit::CommitOperation;
    use crate::model::content::Content;
    use crate::storage::Storage;
    use crate::tokens::HeuristicCounter;

    struct Fixture {
        store: Storage,
        counter: HeuristicCounter,
        roles: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Storage::open(":memory:").expect("open"),
                counter: HeuristicCounter,
                roles: HashMap::new(),
            }
        }

        fn compiler(&self) -> ContextCompiler<'_> {
            ContextCompiler::new(&self.store, &self.counter, &self.roles)
        }

        fn engine(&self) -> CommitEngine<'_> {
            CommitEngine::new(&self.store, &self.counter, "t", None, false)
        }

        fn full_snapshot(&self, head: &str) -> CompileSnapshot {
            let ctx = self
                .compiler()
                .compile("t", head, &CompileQuery::default())
                .expect("compile");
            CacheManager::build_snapshot(head, &ctx, &self.counter)
        }
    }

    /// A snapshot extended incrementally equals one rebuilt from a full
    /// compile.
    #[test]
    fn test_extend_matches_full_compile() {
        let fixture = Fixture::new();
        let engine = fixture.engine();
        let first = engine
            .create_commit(&Content::user("one"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");

        let mut cache = CacheManager::new(8);
        cache.put(
            first.commit_hash.clone(),
            fixture.full_snapshot(&first.commit_hash),
        );

        let second = engine
            .create_commit(&Content::assistant("two"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        cache
            .extend_for_append(&second, &fixture.compiler())
            .expect("extend");

        let incremental = cache.get(&second.commit_hash).expect("cached").clone();
        let full = fixture.full_snapshot(&second.commit_hash);
        assert_eq!(incremental, full);
    }

    /// Edit patching replaces the message in place and adjusts totals.
    #[test]
    fn test_patch_for_edit() {
        let fixture = Fixture::new();
        let engine = fixture.engine();
        let base = engine
            .create_commit(&Content::user("short"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");

        let mut cache = CacheManager::new(8);
        cache.put(
            base.commit_hash.clone(),
            fixture.full_snapshot(&base.commit_hash),
        );

        let edit = engine
            .create_commit(
                &Content::user("a considerably longer replacement text"),
                CommitOperation::Edit,
                CommitOptions {
                    response_to: Some(base.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .expect("edit");
        let edit_row = fixture
            .store
            .get_commit(&edit.commit_hash)
            .expect("query")
            .expect("present");

        let patched = cache
            .patch_for_edit(&edit.commit_hash, &edit_row, &fixture.compiler())
            .expect("patch");
        assert!(patched);

        let incremental = cache.get(&edit.commit_hash).expect("cached").clone();
        let full = fixture.full_snapshot(&edit.commit_hash);
        assert_eq!(incremental, full);
        // EDIT replaces; it does not add.
        assert_eq!(incremental.commit_count, 1);
    }

    /// Annotation patching: SKIP removes, un-SKIP evicts.
    #[test]
    fn test_patch_for_annotate() {
        let fixture = Fixture::new();
        let engine = fixture.engine();
        engine
            .create_commit(&Content::instruction("sys"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        let noisy = engine
            .create_commit(&Content::user("noise"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        let head = fixture.store.get_head("t").expect("head").expect("present");

        let mut cache = CacheManager::new(8);
        cache.put(head.clone(), fixture.full_snapshot(&head));
        let before = cache.get(&head).expect("cached").token_count;

        cache.patch_for_annotate(&head, &noisy.commit_hash, Priority::Skip);
        let after = cache.get(&head).expect("cached").clone();
        assert_eq!(after.commit_count, 1);
        assert!(after.token_count < before);
        assert!(!after.commit_hashes.contains(&noisy.commit_hash));

        // SKIP again: already excluded, snapshot unchanged.
        cache.patch_for_annotate(&head, &noisy.commit_hash, Priority::Skip);
        assert_eq!(cache.get(&head).expect("cached"), &after);

        // Un-SKIP: message text is gone, snapshot must be evicted.
        cache.patch_for_annotate(&head, &noisy.commit_hash, Priority::Normal);
        assert!(cache.get(&head).is_none());
    }

    /// API calibration rewrites the total and keeps deltas additive.
    #[test]
    fn test_record_api_tokens() {
        let fixture = Fixture::new();
        let engine = fixture.engine();
        let first = engine
            .create_commit(&Content::user("alpha"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");

        let mut cache = CacheManager::new(8);
        cache.put(
            first.commit_hash.clone(),
            fixture.full_snapshot(&first.commit_hash),
        );

        assert!(cache.record_api_tokens(&first.commit_hash, 500, 42));
        let calibrated = cache.get(&first.commit_hash).expect("cached").clone();
        assert_eq!(calibrated.token_count, 500);
        assert_eq!(calibrated.token_source, "api:500+42");
        assert_eq!(
            calibrated.message_token_counts.iter().sum::<usize>() + RESPONSE_PRIMER_TOKENS,
            500
        );

        // A subsequent append adds exactly the new message's tokens.
        let second = engine
            .create_commit(&Content::assistant("beta"), CommitOperation::Append, CommitOptions::default())
            .expect("commit");
        cache
            .extend_for_append(&second, &fixture.compiler())
            .expect("extend");
        let extended = cache.get(&second.commit_hash).expect("cached");
        let new_message_tokens = *extended.message_token_counts.last().expect("counts");
        assert_eq!(extended.token_count, 500 + new_message_tokens);
        assert_eq!(extended.token_source, "api:500+42");
    }

    /// The LRU evicts the oldest entry at capacity.
    #[test]
    fn test_lru_eviction() {
        let fixture = Fixture::new();
        let engine = fixture.engine();
        let mut cache = CacheManager::new(2);

        let mut hashes = Vec::new();
        for text in ["a", "b", "c"] {
            let info = engine
                .create_commit(&Content::user(text), CommitOperation::Append, CommitOptions::default())
                .expect("commit");
            cache.put(
                info.commit_hash.clone(),
                fixture.full_snapshot(&info.commit_hash),
            );
            hashes.push(info.commit_hash);
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&hashes[0]).is_none());
        assert!(cache.get(&hashes[2]).is_some());
    }
}
