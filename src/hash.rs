//! Content addressing for Tract objects.
//!
//! Two pure functions drive the whole storage model:
//!
//! - [`content_hash`]: SHA-256 over the canonical JSON encoding of a
//!   payload (keys sorted lexicographically at every depth, no
//!   insignificant whitespace, stable UTF-8). Structure-insensitive, so
//!   equal payloads deduplicate to one blob row.
//! - [`commit_hash`]: SHA-256 over a canonical concatenation of the
//!   commit's identity fields. Time and lineage participate, so
//!   re-commits of identical content yield distinct commits, and merge
//!   commits with different parent sets are uniquely identified.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Minimum number of hex characters accepted for prefix resolution.
pub const MIN_PREFIX_LEN: usize = 4;

/// Hex length of a full SHA-256 commit or content hash.
pub const FULL_HASH_LEN: usize = 64;

/// Sentinel written into the commit-hash preimage for absent fields
/// (root commits have no parent, APPENDs have no `response_to`).
const NONE_SENTINEL: &str = "none";

/// Sort object keys recursively so the byte encoding is deterministic.
fn canonicalize_json(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items.iter_mut() {
                canonicalize_json(item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, mut value) in entries {
                canonicalize_json(&mut value);
                sorted.insert(key, value);
            }
            *map = sorted;
        }
        _ => {}
    }
}

/// Canonical JSON bytes of any serializable value.
pub fn canonical_json<T: Serialize>(object: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut value = serde_json::to_value(object)?;
    canonicalize_json(&mut value);
    serde_json::to_vec(&value)
}

/// Canonical JSON as a UTF-8 string, for storage in `payload_json`.
pub fn canonical_json_string<T: Serialize>(object: &T) -> Result<String, serde_json::Error> {
    let bytes = canonical_json(object)?;
    // serde_json always emits valid UTF-8.
    Ok(String::from_utf8(bytes).expect("canonical JSON is UTF-8"))
}

/// Compute the content hash (hex SHA-256 of canonical JSON) of a payload.
pub fn content_hash<T: Serialize>(object: &T) -> Result<String, serde_json::Error> {
    let bytes = canonical_json(object)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Compute a commit hash over the commit's identity fields.
///
/// Absent optional fields encode as a fixed sentinel. Extra parents,
/// when present, participate in the hash so merge commits are uniquely
/// identified by their full parent list.
#[allow(clippy::too_many_arguments, reason = "mirrors the commit identity tuple")]
pub fn commit_hash(
    content_hash: &str,
    parent_hash: Option<&str>,
    content_type: &str,
    operation: &str,
    timestamp_iso: &str,
    response_to: Option<&str>,
    extra_parents: Option<&[String]>,
) -> String {
    let mut hasher = Sha256::new();
    for field in [
        content_hash,
        parent_hash.unwrap_or(NONE_SENTINEL),
        content_type,
        operation,
        timestamp_iso,
        response_to.unwrap_or(NONE_SENTINEL),
    ] {
        hasher.update(field.as_bytes());
        hasher.update(b"\n");
    }
    if let Some(parents) = extra_parents {
        for parent in parents {
            hasher.update(parent.as_bytes());
            hasher.update(b"\n");
        }
    }
    hex::encode(hasher.finalize())
}

/// Check whether a string is usable as a hash prefix for resolution.
pub fn is_valid_prefix(prefix: &str) -> bool {
    prefix.len() >= MIN_PREFIX_LEN
        && prefix.len() <= FULL_HASH_LEN
        && prefix.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Serialize)]
    struct MapWrapper {
        map: HashMap<String, String>,
    }

    /// Two serializations of the same payload hash identically regardless
    /// of key insertion order.
    #[test]
    fn test_content_hash_deterministic() {
        let mut map_a = HashMap::new();
        map_a.insert("b".to_string(), "2".to_string());
        map_a.insert("a".to_string(), "1".to_string());

        let mut map_b = HashMap::new();
        map_b.insert("a".to_string(), "1".to_string());
        map_b.insert("b".to_string(), "2".to_string());

        let hash_a = content_hash(&MapWrapper { map: map_a }).expect("hash");
        let hash_b = content_hash(&MapWrapper { map: map_b }).expect("hash");

        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), FULL_HASH_LEN);
    }

    /// Nested objects are canonicalized at every depth.
    #[test]
    fn test_canonical_json_nested() {
        let value = serde_json::json!({"z": {"b": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        let bytes = canonical_json(&value).expect("canonical");
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":[{"x":2,"y":1}],"z":{"a":2,"b":1}}"#
        );
    }

    /// Commit hashes differ when the timestamp differs, even for equal
    /// content and lineage.
    #[test]
    fn test_commit_hash_incorporates_time() {
        let c = "0".repeat(64);
        let h1 = commit_hash(&c, None, "dialogue", "append", "2026-01-01T00:00:00Z", None, None);
        let h2 = commit_hash(&c, None, "dialogue", "append", "2026-01-01T00:00:01Z", None, None);
        assert_ne!(h1, h2);
    }

    /// Extra parents participate in the commit hash.
    #[test]
    fn test_commit_hash_extra_parents() {
        let c = "0".repeat(64);
        let base = commit_hash(&c, Some("p1"), "freeform", "append", "t", None, None);
        let merged = commit_hash(
            &c,
            Some("p1"),
            "freeform",
            "append",
            "t",
            None,
            Some(&["p2".to_string()]),
        );
        assert_ne!(base, merged);
    }

    /// Prefix validity: at least four hex characters.
    #[test]
    fn test_prefix_validation() {
        assert!(is_valid_prefix("abcd"));
        assert!(is_valid_prefix("abcdef012345"));
        assert!(!is_valid_prefix("abc"));
        assert!(!is_valid_prefix("wxyz"));
    }
}
