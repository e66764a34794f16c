//! Row types mirroring the relational schema.
//!
//! These are the storage-facing twins of the public models in
//! [`crate::model`]: raw column values, JSON kept as parsed
//! `serde_json::Value` for callers, timestamps as `DateTime<Utc>`.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::annotation::{Priority, RetentionCriteria};
use crate::model::commit::{CommitInfo, CommitOperation};

/// One row of `commits`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRow {
    pub commit_hash: String,
    pub tract_id: String,
    pub parent_hash: Option<String>,
    pub content_hash: String,
    pub content_type: String,
    pub operation: CommitOperation,
    pub response_to: Option<String>,
    pub message: Option<String>,
    pub token_count: usize,
    pub metadata_json: Option<Value>,
    pub generation_config_json: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl CommitRow {
    /// Convert to the public commit description.
    pub fn to_info(&self) -> CommitInfo {
        CommitInfo {
            commit_hash: self.commit_hash.clone(),
            tract_id: self.tract_id.clone(),
            parent_hash: self.parent_hash.clone(),
            content_hash: self.content_hash.clone(),
            content_type: self.content_type.clone(),
            operation: self.operation,
            response_to: self.response_to.clone(),
            message: self.message.clone(),
            token_count: self.token_count,
            metadata: self.metadata_json.clone(),
            generation_config: self.generation_config_json.clone(),
            created_at: self.created_at,
        }
    }
}

/// One row of `blobs`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRow {
    pub content_hash: String,
    pub payload_json: String,
    pub byte_size: usize,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl BlobRow {
    /// Parse the stored payload.
    pub fn payload(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.payload_json)
    }
}

/// One row of `annotations`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRow {
    pub id: i64,
    pub tract_id: String,
    pub target_hash: String,
    pub priority: Priority,
    pub retention: Option<RetentionCriteria>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of `tool_definitions`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchemaRow {
    pub content_hash: String,
    pub name: String,
    pub schema: Value,
    pub created_at: DateTime<Utc>,
}

/// One row of `compile_records`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRecordRow {
    pub record_id: String,
    pub tract_id: String,
    pub head_hash: String,
    pub token_count: usize,
    pub commit_count: usize,
    pub token_source: String,
    pub params: Option<Value>,
    pub created_at: DateTime<Utc>,
}
