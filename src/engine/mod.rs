//! The write and read engines: commit creation, context compilation,
//! and the incremental compile cache.

pub mod cache;
pub mod commit;
pub mod compiler;

pub use cache::CacheManager;
pub use commit::{CommitEngine, CommitOptions};
pub use compiler::{CompileQuery, ContextCompiler};
