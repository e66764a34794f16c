//! Tool schema repository.
//!
//! Tool definitions are content-addressed JSON schemas, deduplicated by
//! hash; `commit_tools` links a commit to the ordered schema list active
//! at that commit.

use serde_json::Value;

use crate::errors::Result;
use crate::hash::content_hash;
use crate::storage::rows::ToolSchemaRow;
use crate::storage::{conversion_error, format_timestamp, parse_timestamp, Storage};

impl Storage {
    /// Store a tool schema if absent; returns its content hash.
    pub fn save_tool_schema(&self, name: &str, schema: &Value) -> Result<String> {
        let hash = content_hash(schema)?;
        self.conn().execute(
            "INSERT OR IGNORE INTO tool_definitions (content_hash, name, schema_json, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                hash,
                name,
                schema.to_string(),
                format_timestamp(chrono::Utc::now()),
            ],
        )?;
        Ok(hash)
    }

    /// Load a tool schema row by hash.
    pub fn get_tool_schema(&self, schema_hash: &str) -> Result<Option<ToolSchemaRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT content_hash, name, schema_json, created_at \
             FROM tool_definitions WHERE content_hash = ?1",
        )?;
        let mut rows = stmt.query([schema_hash])?;
        match rows.next()? {
            Some(row) => {
                let schema_text: String = row.get(2)?;
                let created_at_text: String = row.get(3)?;
                Ok(Some(ToolSchemaRow {
                    content_hash: row.get(0)?,
                    name: row.get(1)?,
                    schema: serde_json::from_str(&schema_text)
                        .map_err(|e| conversion_error(format!("invalid schema JSON: {e}")))?,
                    created_at: parse_timestamp(&created_at_text)
                        .map_err(|e| conversion_error(format!("invalid created_at: {e}")))?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Attach an ordered list of tool schema hashes to a commit.
    pub fn set_commit_tools(&self, commit_hash: &str, schema_hashes: &[String]) -> Result<()> {
        let mut stmt = self.conn().prepare(
            "INSERT OR REPLACE INTO commit_tools (commit_hash, position, schema_hash) \
             VALUES (?1, ?2, ?3)",
        )?;
        for (position, hash) in schema_hashes.iter().enumerate() {
            stmt.execute(rusqlite::params![commit_hash, position as i64, hash])?;
        }
        Ok(())
    }

    /// Schema hashes attached to a commit, ordered by position.
    pub fn get_commit_tool_hashes(&self, commit_hash: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT schema_hash FROM commit_tools \
             WHERE commit_hash = ?1 ORDER BY position ASC",
        )?;
        let hashes = stmt
            .query_map([commit_hash], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hashes)
    }

    /// Full schema values attached to a commit, ordered by position.
    pub fn get_commit_tools(&self, commit_hash: &str) -> Result<Vec<Value>> {
        let mut tools = Vec::new();
        for hash in self.get_commit_tool_hashes(commit_hash)? {
            if let Some(row) = self.get_tool_schema(&hash)? {
                tools.push(row.schema);
            }
        }
        Ok(tools)
    }

    /// Drop the tool attachments of a commit. Used only by GC.
    pub fn delete_commit_tools(&self, commit_hash: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM commit_tools WHERE commit_hash = ?1",
            [commit_hash],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Tool schemas deduplicate by content hash; attachment order is
    /// preserved.
    #[test]
    fn test_tool_schema_dedup_and_order() {
        let storage = Storage::open(":memory:").expect("open");
        let schema_a = json!({"name": "grep", "parameters": {"type": "object"}});
        let schema_b = json!({"name": "read", "parameters": {"type": "object"}});

        let hash_a1 = storage.save_tool_schema("grep", &schema_a).expect("save");
        let hash_a2 = storage.save_tool_schema("grep", &schema_a).expect("save");
        let hash_b = storage.save_tool_schema("read", &schema_b).expect("save");
        assert_eq!(hash_a1, hash_a2);
        assert_ne!(hash_a1, hash_b);

        storage
            .set_commit_tools("c1", &[hash_b.clone(), hash_a1.clone()])
            .expect("attach");
        let tools = storage.get_commit_tools("c1").expect("tools");
        assert_eq!(tools, vec![schema_b, schema_a]);
    }
}
