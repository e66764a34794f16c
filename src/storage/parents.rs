//! Multi-parent repository for merge commits.
//!
//! Position 0 is the first parent (also stored in `commits.parent_hash`
//! for linear walks); positions >= 1 are the extra parents.

use crate::errors::Result;
use crate::storage::Storage;

impl Storage {
    /// Record the full parent list of a merge commit. Position = index.
    pub fn add_parents(&self, commit_hash: &str, parent_hashes: &[String]) -> Result<()> {
        let mut stmt = self.conn().prepare(
            "INSERT OR REPLACE INTO commit_parents (commit_hash, position, parent_hash) \
             VALUES (?1, ?2, ?3)",
        )?;
        for (position, parent) in parent_hashes.iter().enumerate() {
            stmt.execute(rusqlite::params![commit_hash, position as i64, parent])?;
        }
        Ok(())
    }

    /// Parent hashes ordered by position. Empty for non-merge commits.
    pub fn get_parents(&self, commit_hash: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT parent_hash FROM commit_parents \
             WHERE commit_hash = ?1 ORDER BY position ASC",
        )?;
        let parents = stmt
            .query_map([commit_hash], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(parents)
    }

    /// Drop the parent entries of a commit. Used only by GC.
    pub fn delete_parents(&self, commit_hash: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM commit_parents WHERE commit_hash = ?1",
            [commit_hash],
        )?;
        Ok(())
    }
}
