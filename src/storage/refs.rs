//! Ref repository: branches, HEAD, and symbolic refs.
//!
//! `HEAD` is normally a symbolic ref to `refs/heads/<branch>`; while
//! detached it is a direct ref to a commit. The first commit on a fresh
//! tract initializes `main` and attaches HEAD to it.

use crate::errors::{Result, TractError};
use crate::storage::Storage;

/// Prefix under which branches live.
pub const BRANCH_PREFIX: &str = "refs/heads/";

/// The default branch initialized on first commit.
pub const DEFAULT_BRANCH: &str = "main";

/// Name of the HEAD ref.
pub const HEAD_REF: &str = "HEAD";

impl Storage {
    /// Resolve HEAD to a commit hash, following one symbolic hop.
    pub fn get_head(&self, tract_id: &str) -> Result<Option<String>> {
        match self.get_ref_row(tract_id, HEAD_REF)? {
            None => Ok(None),
            Some((Some(commit), _)) => Ok(Some(commit)),
            Some((None, Some(target))) => self.get_ref(tract_id, &target),
            Some((None, None)) => Ok(None),
        }
    }

    /// Move HEAD to a commit.
    ///
    /// Attached: rewrites the branch HEAD points at. Detached: rewrites
    /// HEAD itself. On a fresh tract, initializes `main` and attaches.
    pub fn update_head(&self, tract_id: &str, commit_hash: &str) -> Result<()> {
        match self.get_ref_row(tract_id, HEAD_REF)? {
            None => {
                let branch_ref = format!("{BRANCH_PREFIX}{DEFAULT_BRANCH}");
                self.set_ref(tract_id, &branch_ref, commit_hash)?;
                self.set_symbolic_ref(tract_id, HEAD_REF, &branch_ref)?;
                Ok(())
            }
            Some((None, Some(target))) => self.set_ref(tract_id, &target, commit_hash),
            Some(_) => self.set_ref(tract_id, HEAD_REF, commit_hash),
        }
    }

    /// True when HEAD points directly at a commit.
    pub fn is_detached(&self, tract_id: &str) -> Result<bool> {
        Ok(matches!(
            self.get_ref_row(tract_id, HEAD_REF)?,
            Some((Some(_), _))
        ))
    }

    /// Attach HEAD to a branch (symbolic ref).
    pub fn attach_head(&self, tract_id: &str, branch_name: &str) -> Result<()> {
        let branch_ref = format!("{BRANCH_PREFIX}{branch_name}");
        self.set_symbolic_ref(tract_id, HEAD_REF, &branch_ref)
    }

    /// Detach HEAD to point directly at a commit.
    pub fn detach_head(&self, tract_id: &str, commit_hash: &str) -> Result<()> {
        self.set_ref(tract_id, HEAD_REF, commit_hash)
    }

    /// Current branch name when HEAD is attached, `None` when detached.
    pub fn get_current_branch(&self, tract_id: &str) -> Result<Option<String>> {
        match self.get_ref_row(tract_id, HEAD_REF)? {
            Some((None, Some(target))) => Ok(target
                .strip_prefix(BRANCH_PREFIX)
                .map(|name| name.to_string())),
            _ => Ok(None),
        }
    }

    /// Commit hash a branch points at.
    pub fn get_branch(&self, tract_id: &str, branch_name: &str) -> Result<Option<String>> {
        self.get_ref(tract_id, &format!("{BRANCH_PREFIX}{branch_name}"))
    }

    /// Create or move a branch pointer.
    pub fn set_branch(&self, tract_id: &str, branch_name: &str, commit_hash: &str) -> Result<()> {
        self.set_ref(tract_id, &format!("{BRANCH_PREFIX}{branch_name}"), commit_hash)
    }

    /// All branch names in a tract, sorted.
    pub fn list_branches(&self, tract_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT ref_name FROM refs \
             WHERE tract_id = ?1 AND ref_name LIKE 'refs/heads/%' \
             ORDER BY ref_name ASC",
        )?;
        let names = stmt
            .query_map([tract_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names
            .into_iter()
            .filter_map(|n| n.strip_prefix(BRANCH_PREFIX).map(str::to_string))
            .collect())
    }

    /// Delete a branch ref. The caller is responsible for unmerged
    /// checks and for not deleting the branch HEAD is attached to.
    pub fn delete_branch_ref(&self, tract_id: &str, branch_name: &str) -> Result<()> {
        self.delete_ref(tract_id, &format!("{BRANCH_PREFIX}{branch_name}"))
    }

    // ------------------------------------------------------------------
    // Generic refs
    // ------------------------------------------------------------------

    /// Direct commit hash of a ref (no symbolic following).
    pub fn get_ref(&self, tract_id: &str, ref_name: &str) -> Result<Option<String>> {
        Ok(self
            .get_ref_row(tract_id, ref_name)?
            .and_then(|(commit, _)| commit))
    }

    /// Point a ref directly at a commit, clearing any symbolic target.
    pub fn set_ref(&self, tract_id: &str, ref_name: &str, commit_hash: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO refs (tract_id, ref_name, commit_hash, symbolic_target) \
             VALUES (?1, ?2, ?3, NULL) \
             ON CONFLICT(tract_id, ref_name) \
             DO UPDATE SET commit_hash = excluded.commit_hash, symbolic_target = NULL",
            rusqlite::params![tract_id, ref_name, commit_hash],
        )?;
        Ok(())
    }

    /// Create a ref that must not already exist.
    pub fn create_ref(&self, tract_id: &str, ref_name: &str, commit_hash: &str) -> Result<()> {
        if self.get_ref_row(tract_id, ref_name)?.is_some() {
            return Err(TractError::DuplicateRef(ref_name.to_string()));
        }
        self.set_ref(tract_id, ref_name, commit_hash)
    }

    /// Point a ref at another ref symbolically.
    pub fn set_symbolic_ref(&self, tract_id: &str, ref_name: &str, target: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO refs (tract_id, ref_name, commit_hash, symbolic_target) \
             VALUES (?1, ?2, NULL, ?3) \
             ON CONFLICT(tract_id, ref_name) \
             DO UPDATE SET commit_hash = NULL, symbolic_target = excluded.symbolic_target",
            rusqlite::params![tract_id, ref_name, target],
        )?;
        Ok(())
    }

    /// Symbolic target of a ref, `None` when absent or direct.
    pub fn get_symbolic_ref(&self, tract_id: &str, ref_name: &str) -> Result<Option<String>> {
        Ok(self
            .get_ref_row(tract_id, ref_name)?
            .and_then(|(_, target)| target))
    }

    /// Delete a ref. No-op when absent.
    pub fn delete_ref(&self, tract_id: &str, ref_name: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM refs WHERE tract_id = ?1 AND ref_name = ?2",
            [tract_id, ref_name],
        )?;
        Ok(())
    }

    /// Every ref tip resolved to a commit hash (branches, tags, detached
    /// HEAD). Symbolic refs are skipped; their targets are listed
    /// directly. Used for GC reachability.
    pub fn all_ref_tips(&self, tract_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT commit_hash FROM refs \
             WHERE tract_id = ?1 AND commit_hash IS NOT NULL",
        )?;
        let tips = stmt
            .query_map([tract_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tips)
    }

    fn get_ref_row(
        &self,
        tract_id: &str,
        ref_name: &str,
    ) -> Result<Option<(Option<String>, Option<String>)>> {
        let mut stmt = self.conn().prepare(
            "SELECT commit_hash, symbolic_target FROM refs \
             WHERE tract_id = ?1 AND ref_name = ?2",
        )?;
        let mut rows = stmt.query([tract_id, ref_name])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
            None => Ok(None),
        }
    }
}

/// Validate a branch name against the naming rules.
pub fn validate_branch_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'));
    if name.is_empty() || !valid_chars {
        return Err(TractError::InvalidBranchName {
            name: name.to_string(),
            reason: "only letters, digits, '.', '_', '-' and '/' are allowed".to_string(),
        });
    }
    if name.starts_with('/') {
        return Err(TractError::InvalidBranchName {
            name: name.to_string(),
            reason: "must not start with '/'".to_string(),
        });
    }
    if name.contains("..") {
        return Err(TractError::InvalidBranchName {
            name: name.to_string(),
            reason: "must not contain '..'".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// First HEAD update initializes main and attaches.
    #[test]
    fn test_head_initialization() {
        let storage = Storage::open(":memory:").expect("open");
        storage.update_head("t", "aaaa").expect("update");
        assert_eq!(storage.get_head("t").expect("head").as_deref(), Some("aaaa"));
        assert_eq!(
            storage.get_current_branch("t").expect("branch").as_deref(),
            Some(DEFAULT_BRANCH)
        );
        assert!(!storage.is_detached("t").expect("detached"));
    }

    /// Detach and re-attach round trip.
    #[test]
    fn test_detach_attach() {
        let storage = Storage::open(":memory:").expect("open");
        storage.update_head("t", "aaaa").expect("update");
        storage.detach_head("t", "aaaa").expect("detach");
        assert!(storage.is_detached("t").expect("detached"));
        assert_eq!(storage.get_current_branch("t").expect("branch"), None);

        // Commits while detached move HEAD itself, not the branch.
        storage.update_head("t", "bbbb").expect("update");
        assert_eq!(storage.get_head("t").expect("head").as_deref(), Some("bbbb"));
        assert_eq!(
            storage.get_branch("t", DEFAULT_BRANCH).expect("branch").as_deref(),
            Some("aaaa")
        );

        storage.attach_head("t", DEFAULT_BRANCH).expect("attach");
        assert_eq!(storage.get_head("t").expect("head").as_deref(), Some("aaaa"));
    }

    /// Branch naming rules.
    #[test]
    fn test_branch_name_rules() {
        assert!(validate_branch_name("feature/login-2").is_ok());
        assert!(validate_branch_name("/leading").is_err());
        assert!(validate_branch_name("a..b").is_err());
        assert!(validate_branch_name("spaces no").is_err());
        assert!(validate_branch_name("").is_err());
    }
}
