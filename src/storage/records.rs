//! Compile record repository.
//!
//! A compile record is persisted by `generate()` / `chat()` (not by a
//! bare `compile()`): which HEAD was compiled, what it cost in tokens,
//! where the count came from, and the effective commit ordering that was
//! sent to the LLM.

use rusqlite::Row;

use crate::errors::Result;
use crate::storage::rows::CompileRecordRow;
use crate::storage::{conversion_error, format_timestamp, parse_timestamp, Storage};

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CompileRecordRow> {
    let params_text: Option<String> = row.get(6)?;
    let params = match params_text {
        None => None,
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| conversion_error(format!("invalid params JSON: {e}")))?,
        ),
    };
    let created_at_text: String = row.get(7)?;
    Ok(CompileRecordRow {
        record_id: row.get(0)?,
        tract_id: row.get(1)?,
        head_hash: row.get(2)?,
        token_count: row.get::<_, i64>(3)? as usize,
        commit_count: row.get::<_, i64>(4)? as usize,
        token_source: row.get(5)?,
        params,
        created_at: parse_timestamp(&created_at_text)
            .map_err(|e| conversion_error(format!("invalid created_at: {e}")))?,
    })
}

impl Storage {
    /// Persist a compile record together with its effective commit
    /// ordering.
    pub fn save_compile_record(
        &self,
        record: &CompileRecordRow,
        commit_hashes: &[String],
    ) -> Result<()> {
        self.with_transaction(|s| {
            s.conn().execute(
                "INSERT INTO compile_records \
                 (record_id, tract_id, head_hash, token_count, commit_count, token_source, params_json, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.record_id,
                    record.tract_id,
                    record.head_hash,
                    record.token_count as i64,
                    record.commit_count as i64,
                    record.token_source,
                    record.params.as_ref().map(|v| v.to_string()),
                    format_timestamp(record.created_at),
                ],
            )?;
            let mut stmt = s.conn().prepare(
                "INSERT INTO compile_record_commits (record_id, position, commit_hash) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for (position, hash) in commit_hashes.iter().enumerate() {
                stmt.execute(rusqlite::params![record.record_id, position as i64, hash])?;
            }
            Ok(())
        })
    }

    /// All compile records of a tract, oldest first.
    pub fn list_compile_records(&self, tract_id: &str) -> Result<Vec<CompileRecordRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT record_id, tract_id, head_hash, token_count, commit_count, token_source, params_json, created_at \
             FROM compile_records WHERE tract_id = ?1 ORDER BY created_at ASC, record_id ASC",
        )?;
        let rows = stmt.query_map([tract_id], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The effective commit ordering compiled for a record.
    pub fn get_compile_record_commits(&self, record_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT commit_hash FROM compile_record_commits \
             WHERE record_id = ?1 ORDER BY position ASC",
        )?;
        let hashes = stmt
            .query_map([record_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hashes)
    }
}
