//! Domain model definitions for Tract commits, content payloads,
//! priority annotations, compiled messages, and operation results.
//!
//! Everything in this module is storage-agnostic: plain serde types that
//! the engine, compiler, and history operations exchange. The relational
//! row types live in [`crate::storage`].
//!
//! # Commit lifecycle
//!
//! ```text
//!  ①  Content (validated tagged union)
//!       │
//!       ▼
//!  ②  Blob (content-addressed, deduplicated)
//!       │
//!       ▼
//!  ③  Commit (APPEND | EDIT, immutable DAG node)
//!       │
//!       ├──▶ Annotation (append-only priority log: SKIP → PINNED)
//!       ├──▶ EDIT commits (supersede the target in compile output)
//!       │
//!       ▼
//!  ④  Compile (deterministic projection to [{role, content}, …])
//!       │
//!       ▼
//!  ⑤  Superseded by compression summaries, then garbage-collected
//!      once unreachable and past retention.
//! ```

pub mod annotation;
pub mod commit;
pub mod content;
pub mod merge;
pub mod message;
pub mod results;

pub use annotation::{MatchMode, Priority, PriorityAnnotation, RetentionCriteria};
pub use commit::{CommitInfo, CommitOperation};
pub use content::{
    Content, ContentTypeHints, CustomTypeSchema, DialogueRole, OutputFormat, ToolDirection,
    ToolStatus, TypeRegistry,
};
pub use merge::{ConflictInfo, ConflictKind, MergeResult, MergeType, Resolution, ResolutionAction};
pub use message::{CompileSnapshot, CompiledContext, Message, TokenUsage};
pub use results::{
    CompressResult, GcResult, ImportResult, RebaseResult, ResetMode,
};
