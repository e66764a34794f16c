//! Blob repository: content-addressed payload storage.

use crate::errors::Result;
use crate::storage::rows::BlobRow;
use crate::storage::{conversion_error, format_timestamp, parse_timestamp, Storage};

impl Storage {
    /// Get a blob by its content hash.
    pub fn get_blob(&self, content_hash: &str) -> Result<Option<BlobRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT content_hash, payload_json, byte_size, token_count, created_at \
             FROM blobs WHERE content_hash = ?1",
        )?;
        let mut rows = stmt.query([content_hash])?;
        match rows.next()? {
            Some(row) => {
                let created_at_text: String = row.get(4)?;
                Ok(Some(BlobRow {
                    content_hash: row.get(0)?,
                    payload_json: row.get(1)?,
                    byte_size: row.get::<_, i64>(2)? as usize,
                    token_count: row.get::<_, i64>(3)? as usize,
                    created_at: parse_timestamp(&created_at_text)
                        .map_err(|e| conversion_error(format!("invalid created_at: {e}")))?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Store a blob only if its content hash is not already present.
    ///
    /// Content-addressed: equal payloads produce exactly one stored row.
    pub fn save_blob_if_absent(&self, blob: &BlobRow) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO blobs \
             (content_hash, payload_json, byte_size, token_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                blob.content_hash,
                blob.payload_json,
                blob.byte_size as i64,
                blob.token_count as i64,
                format_timestamp(blob.created_at),
            ],
        )?;
        Ok(())
    }

    /// Delete a blob row. Used only by GC after the last referrer goes.
    pub fn delete_blob(&self, content_hash: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM blobs WHERE content_hash = ?1", [content_hash])?;
        Ok(())
    }

    /// Number of blob rows, for dedup assertions and GC accounting.
    pub fn count_blobs(&self) -> Result<usize> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
