//! SQLite-backed storage for Tract.
//!
//! One [`Storage`] wraps one SQLite connection and is the exclusive
//! mutator for its tract's session. The repository surface is grouped by
//! concern into the submodules of this directory (commits, blobs, refs,
//! parents, annotations, tools, compile records), each contributing an
//! `impl Storage` block.
//!
//! Datetimes are stored as RFC 3339 TEXT with fixed microsecond
//! precision and a `Z` suffix, so lexicographic order equals
//! chronological order and `ORDER BY created_at` behaves.

pub mod annotations;
pub mod blobs;
pub mod commits;
pub mod parents;
pub mod records;
pub mod refs;
pub mod rows;
pub mod schema;
pub mod tools;

use std::cell::Cell;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::errors::{Result, TractError};

pub use rows::{AnnotationRow, BlobRow, CommitRow, CompileRecordRow, ToolSchemaRow};

/// One tract's storage session.
pub struct Storage {
    conn: Connection,
    savepoint_depth: Cell<u32>,
}

impl Storage {
    /// Open (or create) a store at the given path. `":memory:"` opens an
    /// ephemeral store.
    pub fn open(path: &str) -> Result<Storage> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| TractError::Session(format!("cannot open storage at '{path}': {e}")))?;

        let storage = Storage {
            conn,
            savepoint_depth: Cell::new(0),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA_DDL)?;
        // Stamp the schema version once; existing stores keep theirs.
        if self.get_meta("schema_version")?.is_none() {
            self.set_meta("schema_version", schema::SCHEMA_VERSION)?;
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a transaction; commit on Ok, roll back on Err.
    ///
    /// Implemented with savepoints so top-level mutations that call
    /// each other (compression applying through the commit engine, for
    /// instance) nest cleanly.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Storage) -> Result<T>) -> Result<T> {
        let depth = self.savepoint_depth.get();
        let name = format!("tract_sp_{depth}");
        self.conn.execute_batch(&format!("SAVEPOINT {name};"))?;
        self.savepoint_depth.set(depth + 1);

        let result = f(self);
        self.savepoint_depth.set(depth);
        match result {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name};"))?;
                Ok(value)
            }
            Err(err) => {
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};"))?;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Meta key-value store
    // ------------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM _tract_meta WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO _tract_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Timestamp encoding
// ----------------------------------------------------------------------

/// Format a timestamp for storage and for commit hashing.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Convert a column conversion failure into a rusqlite error.
pub(crate) fn conversion_error(
    message: impl Into<String>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(message.into()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fresh stores get the schema version stamped.
    #[test]
    fn test_schema_version_stamped() {
        let storage = Storage::open(":memory:").expect("open");
        assert_eq!(
            storage.get_meta("schema_version").expect("meta").as_deref(),
            Some(schema::SCHEMA_VERSION)
        );
    }

    /// Timestamp encoding is fixed-width so text ordering is time
    /// ordering.
    #[test]
    fn test_timestamp_roundtrip_and_order() {
        let a = parse_timestamp("2026-01-01T00:00:00.000001+00:00").expect("parse");
        let b = parse_timestamp("2026-01-01T00:00:00.000002+00:00").expect("parse");
        let fa = format_timestamp(a);
        let fb = format_timestamp(b);
        assert!(fa < fb);
        assert_eq!(parse_timestamp(&fa).expect("parse"), a);
    }

    /// Transactions roll back on error.
    #[test]
    fn test_transaction_rollback() {
        let storage = Storage::open(":memory:").expect("open");
        let result: Result<()> = storage.with_transaction(|s| {
            s.set_meta("doomed", "1")?;
            Err(TractError::Session("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(storage.get_meta("doomed").expect("meta"), None);
    }
}
