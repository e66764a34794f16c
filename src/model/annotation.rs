//! Priority annotations.
//!
//! Annotations form an append-only log attached to commits. The
//! effective priority of a commit is the latest annotation row for that
//! target, else the content-type default. Priorities are ordered from
//! low to high preservation: SKIP < NORMAL < IMPORTANT < PINNED.
//!
//! An IMPORTANT annotation may carry [`RetentionCriteria`]: fuzzy
//! instructions passed to the compression LLM plus deterministic
//! patterns the resulting summary must contain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority level assigned to a commit.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Excluded from compile output entirely.
    Skip,
    /// Regular content; compressible.
    #[default]
    Normal,
    /// Compressible, but retention criteria must be honored.
    Important,
    /// Passes through compile and compression verbatim.
    Pinned,
}

impl Priority {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Priority::Skip => "skip",
            Priority::Normal => "normal",
            Priority::Important => "important",
            Priority::Pinned => "pinned",
        }
    }

    pub fn parse(s: &str) -> Option<Priority> {
        match s {
            "skip" => Some(Priority::Skip),
            "normal" => Some(Priority::Normal),
            "important" => Some(Priority::Important),
            "pinned" => Some(Priority::Pinned),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `match_patterns` are interpreted during retention validation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Substring,
    Regex,
}

/// Preservation requirements attached to an IMPORTANT annotation.
///
/// `instructions` steer the summarizer; `match_patterns` are verified
/// deterministically against the draft summary and drive the retry loop
/// on failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_patterns: Vec<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
}

impl RetentionCriteria {
    /// Criteria that require the given literal substrings to survive.
    pub fn matching<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instructions: None,
            match_patterns: patterns.into_iter().map(Into::into).collect(),
            match_mode: MatchMode::Substring,
        }
    }
}

/// One row of the append-only annotation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriorityAnnotation {
    pub id: i64,
    pub tract_id: String,
    pub target_hash: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionCriteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Priorities order from SKIP (lowest preservation) to PINNED.
    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Skip < Priority::Normal);
        assert!(Priority::Normal < Priority::Important);
        assert!(Priority::Important < Priority::Pinned);
    }

    /// String round trip matches the stored representation.
    #[test]
    fn test_priority_parse() {
        for p in [
            Priority::Skip,
            Priority::Normal,
            Priority::Important,
            Priority::Pinned,
        ] {
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
        assert_eq!(Priority::parse("urgent"), None);
    }

    /// Retention criteria serialize without empty optional fields.
    #[test]
    fn test_retention_serialization() {
        let criteria = RetentionCriteria::matching(["sk-12345"]);
        let value = serde_json::to_value(&criteria).expect("serialize");
        assert_eq!(value["match_patterns"][0], "sk-12345");
        assert_eq!(value["match_mode"], "substring");
        assert!(value.get("instructions").is_none());
    }
}
