//! Annotation repository: the append-only priority log.
//!
//! Latest-wins semantics: the effective priority of a commit is the
//! newest row for that target (ties broken by row id, which is
//! monotonic within a session).

use std::collections::HashMap;

use rusqlite::Row;

use crate::errors::Result;
use crate::model::annotation::Priority;
use crate::storage::rows::AnnotationRow;
use crate::storage::{conversion_error, format_timestamp, parse_timestamp, Storage};

const ANNOTATION_COLUMNS: &str =
    "id, tract_id, target_hash, priority, retention_json, reason, created_at";

fn annotation_from_row(row: &Row<'_>) -> rusqlite::Result<AnnotationRow> {
    let priority_text: String = row.get(3)?;
    let priority = Priority::parse(&priority_text)
        .ok_or_else(|| conversion_error(format!("invalid priority '{priority_text}'")))?;
    let retention_text: Option<String> = row.get(4)?;
    let retention = match retention_text {
        None => None,
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| conversion_error(format!("invalid retention JSON: {e}")))?,
        ),
    };
    let created_at_text: String = row.get(6)?;
    Ok(AnnotationRow {
        id: row.get(0)?,
        tract_id: row.get(1)?,
        target_hash: row.get(2)?,
        priority,
        retention,
        reason: row.get(5)?,
        created_at: parse_timestamp(&created_at_text)
            .map_err(|e| conversion_error(format!("invalid created_at: {e}")))?,
    })
}

impl Storage {
    /// Append an annotation row. Returns the assigned id.
    pub fn save_annotation(&self, annotation: &AnnotationRow) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO annotations \
             (tract_id, target_hash, priority, retention_json, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                annotation.tract_id,
                annotation.target_hash,
                annotation.priority.as_str(),
                annotation
                    .retention
                    .as_ref()
                    .map(|r| serde_json::to_string(r))
                    .transpose()?,
                annotation.reason,
                format_timestamp(annotation.created_at),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Most recent annotation for a commit, `None` if never annotated.
    pub fn get_latest_annotation(&self, target_hash: &str) -> Result<Option<AnnotationRow>> {
        let sql = format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations \
             WHERE target_hash = ?1 ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let mut rows = stmt.query([target_hash])?;
        match rows.next()? {
            Some(row) => Ok(Some(annotation_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Full annotation history for a commit, oldest first.
    pub fn get_annotation_history(&self, target_hash: &str) -> Result<Vec<AnnotationRow>> {
        let sql = format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations \
             WHERE target_hash = ?1 ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([target_hash], annotation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Latest annotation per target for a batch of commits.
    ///
    /// Targets with no annotations are omitted. One query instead of
    /// N+1 lookups during compilation.
    pub fn batch_latest_annotations(
        &self,
        target_hashes: &[String],
    ) -> Result<HashMap<String, AnnotationRow>> {
        if target_hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = (1..=target_hashes.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations \
             WHERE target_hash IN ({placeholders}) ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let params = rusqlite::params_from_iter(target_hashes.iter());
        let rows = stmt.query_map(params, annotation_from_row)?;

        let mut latest: HashMap<String, AnnotationRow> = HashMap::new();
        for row in rows {
            let row = row?;
            // Ascending order: later rows overwrite earlier ones.
            latest.insert(row.target_hash.clone(), row);
        }
        Ok(latest)
    }

    /// Drop every annotation targeting a commit. Used only by GC.
    pub fn delete_annotations_for(&self, target_hash: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM annotations WHERE target_hash = ?1",
            [target_hash],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn annotation(target: &str, priority: Priority) -> AnnotationRow {
        AnnotationRow {
            id: 0,
            tract_id: "t".to_string(),
            target_hash: target.to_string(),
            priority,
            retention: None,
            reason: None,
            created_at: Utc::now(),
        }
    }

    /// Latest-wins across repeated annotations of one target.
    #[test]
    fn test_latest_wins() {
        let storage = Storage::open(":memory:").expect("open");
        storage
            .save_annotation(&annotation("c1", Priority::Pinned))
            .expect("save");
        storage
            .save_annotation(&annotation("c1", Priority::Skip))
            .expect("save");

        let latest = storage
            .get_latest_annotation("c1")
            .expect("query")
            .expect("present");
        assert_eq!(latest.priority, Priority::Skip);
        assert_eq!(storage.get_annotation_history("c1").expect("history").len(), 2);
    }

    /// Batch lookup returns the newest row per target and omits
    /// unannotated targets.
    #[test]
    fn test_batch_latest() {
        let storage = Storage::open(":memory:").expect("open");
        storage
            .save_annotation(&annotation("c1", Priority::Normal))
            .expect("save");
        storage
            .save_annotation(&annotation("c1", Priority::Important))
            .expect("save");
        storage
            .save_annotation(&annotation("c2", Priority::Skip))
            .expect("save");

        let latest = storage
            .batch_latest_annotations(&[
                "c1".to_string(),
                "c2".to_string(),
                "c3".to_string(),
            ])
            .expect("batch");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["c1"].priority, Priority::Important);
        assert_eq!(latest["c2"].priority, Priority::Skip);
    }
}
