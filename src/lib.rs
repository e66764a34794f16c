//! Tract is a content-addressed, Git-inspired version control engine
//! for the context of LLM conversations.
//!
//! Every message, tool call, instruction, artifact, and summary is an
//! immutable commit in a DAG; the context compiler projects that DAG on
//! demand into the linear `[{role, content}, …]` message list an LLM
//! API expects. On top of this substrate sit branches, merges, rebases,
//! cherry-picks, LLM-driven compression with retention guarantees, edit
//! history with restore, and a hook protocol for human-in-the-loop
//! review.
//!
//! ```no_run
//! use tract::{Priority, Tract};
//!
//! # fn main() -> tract::Result<()> {
//! let mut t = Tract::open_in_memory()?;
//! let sys = t.system("You are helpful.")?;
//! t.annotate(&sys.commit_hash, Priority::Pinned)?;
//! t.user("Hi")?;
//! t.assistant("Hello")?;
//!
//! let ctx = t.compile()?;
//! assert_eq!(ctx.messages.len(), 3);
//! assert_eq!(ctx.messages[0].role, "system");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod hash;
pub mod hooks;
pub mod llm;
pub mod model;
pub mod ops;
pub mod prompts;
pub mod storage;
pub mod tokens;
pub mod tract;

pub use config::{AutoSummarize, BudgetAction, LlmConfig, TokenBudgetConfig, TractConfig};
pub use errors::{Result, TractError};
pub use hooks::{auto_retry, HookRejection, Outcome, PendingCompress, PendingGc, PendingMerge,
    PendingOp, PendingReview, PendingStatus, PendingToolResult, ValidationResult};
pub use model::{
    CommitInfo, CommitOperation, CompileSnapshot, CompiledContext, CompressResult, ConflictInfo,
    ConflictKind, Content, DialogueRole, GcResult, ImportResult, MatchMode, MergeResult,
    MergeType, Message, Priority, PriorityAnnotation, RebaseResult, ResetMode, Resolution,
    ResolutionAction, RetentionCriteria, TokenUsage,
};
pub use ops::compress::CompressOptions;
pub use ops::gc::GcOptions;
pub use ops::merge::MergeStrategy;
pub use tokens::{TiktokenCounter, TokenCounter};
pub use tract::{ChatResponse, MergeCallOptions, Tract};
