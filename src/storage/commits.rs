//! Commit repository: reads and writes for the `commits` table.

use rusqlite::Row;

use crate::errors::{Result, TractError};
use crate::hash::is_valid_prefix;
use crate::model::commit::CommitOperation;
use crate::storage::rows::CommitRow;
use crate::storage::{conversion_error, format_timestamp, parse_timestamp, Storage};

const COMMIT_COLUMNS: &str = "commit_hash, tract_id, parent_hash, content_hash, content_type, \
     operation, response_to, message, token_count, metadata_json, generation_config_json, created_at";

pub(crate) fn commit_from_row(row: &Row<'_>) -> rusqlite::Result<CommitRow> {
    let operation_text: String = row.get(5)?;
    let operation = CommitOperation::parse(&operation_text)
        .ok_or_else(|| conversion_error(format!("invalid operation '{operation_text}'")))?;
    let metadata_json: Option<String> = row.get(9)?;
    let generation_config_json: Option<String> = row.get(10)?;
    let created_at_text: String = row.get(11)?;

    Ok(CommitRow {
        commit_hash: row.get(0)?,
        tract_id: row.get(1)?,
        parent_hash: row.get(2)?,
        content_hash: row.get(3)?,
        content_type: row.get(4)?,
        operation,
        response_to: row.get(6)?,
        message: row.get(7)?,
        token_count: row.get::<_, i64>(8)? as usize,
        metadata_json: parse_optional_json(metadata_json)?,
        generation_config_json: parse_optional_json(generation_config_json)?,
        created_at: parse_timestamp(&created_at_text)
            .map_err(|e| conversion_error(format!("invalid created_at: {e}")))?,
    })
}

fn parse_optional_json(
    text: Option<String>,
) -> rusqlite::Result<Option<serde_json::Value>> {
    match text {
        None => Ok(None),
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| conversion_error(format!("invalid JSON column: {e}"))),
    }
}

impl Storage {
    /// Get a commit by its full hash.
    pub fn get_commit(&self, commit_hash: &str) -> Result<Option<CommitRow>> {
        let sql = format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE commit_hash = ?1");
        let mut stmt = self.conn().prepare(&sql)?;
        let mut rows = stmt.query([commit_hash])?;
        match rows.next()? {
            Some(row) => Ok(Some(commit_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Persist a commit row.
    pub fn save_commit(&self, commit: &CommitRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO commits (commit_hash, tract_id, parent_hash, content_hash, content_type, \
             operation, response_to, message, token_count, metadata_json, generation_config_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                commit.commit_hash,
                commit.tract_id,
                commit.parent_hash,
                commit.content_hash,
                commit.content_type,
                commit.operation.as_str(),
                commit.response_to,
                commit.message,
                commit.token_count as i64,
                commit
                    .metadata_json
                    .as_ref()
                    .map(|v| v.to_string()),
                commit
                    .generation_config_json
                    .as_ref()
                    .map(|v| v.to_string()),
                format_timestamp(commit.created_at),
            ],
        )?;
        Ok(())
    }

    /// Walk the first-parent chain from a commit back to the root.
    ///
    /// Returns commits newest first. `limit` bounds the number of
    /// returned commits; `op_filter` keeps only matching operations.
    pub fn get_ancestors(
        &self,
        commit_hash: &str,
        limit: Option<usize>,
        op_filter: Option<CommitOperation>,
    ) -> Result<Vec<CommitRow>> {
        let mut out = Vec::new();
        let mut current = Some(commit_hash.to_string());
        while let Some(hash) = current {
            let Some(row) = self.get_commit(&hash)? else {
                break;
            };
            current = row.parent_hash.clone();
            if op_filter.is_none_or(|op| row.operation == op) {
                out.push(row);
                if limit.is_some_and(|l| out.len() >= l) {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// All commits whose first parent is the given hash.
    pub fn get_children(&self, commit_hash: &str) -> Result<Vec<CommitRow>> {
        let sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM commits WHERE parent_hash = ?1 ORDER BY created_at ASC, commit_hash ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([commit_hash], commit_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All EDIT commits targeting the given commit, oldest first.
    pub fn get_edits_of(&self, target_hash: &str) -> Result<Vec<CommitRow>> {
        let sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM commits \
             WHERE response_to = ?1 AND operation = 'edit' \
             ORDER BY created_at ASC, commit_hash ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([target_hash], commit_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All commits of a content type within a tract, oldest first.
    pub fn get_commits_by_type(
        &self,
        tract_id: &str,
        content_type: &str,
    ) -> Result<Vec<CommitRow>> {
        let sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM commits \
             WHERE tract_id = ?1 AND content_type = ?2 \
             ORDER BY created_at ASC, commit_hash ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([tract_id, content_type], commit_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every commit in a tract, oldest first.
    pub fn get_all_commits(&self, tract_id: &str) -> Result<Vec<CommitRow>> {
        let sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM commits WHERE tract_id = ?1 \
             ORDER BY created_at ASC, commit_hash ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([tract_id], commit_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Resolve a hash prefix to a single commit.
    ///
    /// Requires at least four hex characters; two or more matches raise
    /// an ambiguity error carrying the candidates.
    pub fn get_commit_by_prefix(
        &self,
        prefix: &str,
        tract_id: Option<&str>,
    ) -> Result<Option<CommitRow>> {
        if !is_valid_prefix(prefix) {
            return Err(TractError::InvalidArgument(format!(
                "hash prefix '{prefix}' must be at least 4 hex characters"
            )));
        }
        let pattern = format!("{prefix}%");
        let sql = match tract_id {
            Some(_) => format!(
                "SELECT {COMMIT_COLUMNS} FROM commits \
                 WHERE commit_hash LIKE ?1 AND tract_id = ?2 LIMIT 6"
            ),
            None => format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE commit_hash LIKE ?1 LIMIT 6"),
        };
        let mut stmt = self.conn().prepare(&sql)?;
        let matches: Vec<CommitRow> = match tract_id {
            Some(tid) => stmt
                .query_map(rusqlite::params![pattern, tid], commit_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([pattern], commit_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.into_iter().next().expect("one match"))),
            _ => Err(TractError::AmbiguousPrefix {
                prefix: prefix.to_string(),
                candidates: matches.into_iter().map(|c| c.commit_hash).collect(),
            }),
        }
    }

    /// Delete a commit row. Used only by GC.
    pub fn delete_commit(&self, commit_hash: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM commits WHERE commit_hash = ?1", [commit_hash])?;
        Ok(())
    }

    /// Count remaining commits referencing a content hash. Used by GC to
    /// decide whether a blob is still referenced.
    pub fn count_commits_for_content(&self, content_hash: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM commits WHERE content_hash = ?1",
            [content_hash],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
