//! Conflict policies and per-item transfer outcomes.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// What to do when the destination of a transfer already exists.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Fail the item with `destination_exists`.
    #[default]
    None,
    /// Replace the destination.
    Overwrite,
    /// Pick a free `name (n).ext` sibling.
    Rename,
    /// Leave both sides alone and report the item as skipped.
    Skip,
}

impl ConflictPolicy {
    /// Resolve the policy of an upload form, honouring the legacy
    /// `overwrite=true` flag when no explicit policy is given.
    pub fn from_form(policy: Option<&str>, legacy_overwrite: Option<&str>) -> Result<Self, String> {
        match policy.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => p.parse(),
            None => match legacy_overwrite.map(str::trim) {
                Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => {
                    Ok(ConflictPolicy::Overwrite)
                }
                _ => Ok(ConflictPolicy::None),
            },
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(ConflictPolicy::None),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "rename" => Ok(ConflictPolicy::Rename),
            "skip" => Ok(ConflictPolicy::Skip),
            other => Err(format!("unknown conflict policy `{}`", other)),
        }
    }
}

/// Machine-readable reason attached to a failed item.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCode {
    DestinationExists,
    SameDestination,
    QuotaExceeded,
    InvalidDestination,
    NotFound,
    AccessDenied,
    InvalidInput,
    Internal,
}

impl ConflictCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictCode::DestinationExists => "destination_exists",
            ConflictCode::SameDestination => "same_destination",
            ConflictCode::QuotaExceeded => "quota_exceeded",
            ConflictCode::InvalidDestination => "invalid_destination",
            ConflictCode::NotFound => "not_found",
            ConflictCode::AccessDenied => "access_denied",
            ConflictCode::InvalidInput => "invalid_input",
            ConflictCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ConflictCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item of a batch that could not be processed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FailedItem {
    pub path: String,
    pub reason: String,
    pub code: ConflictCode,
}

/// Result of a batch operation, partitioned per source item.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedItem>,
}

impl TransferOutcome {
    pub fn succeed(&mut self, path: impl Into<String>) {
        self.succeeded.push(path.into());
    }

    pub fn skip(&mut self, path: impl Into<String>) {
        self.skipped.push(path.into());
    }

    pub fn fail(&mut self, path: impl Into<String>, code: ConflictCode, reason: impl Into<String>) {
        self.failed.push(FailedItem {
            path: path.into(),
            reason: reason.into(),
            code,
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Where a single item ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemResult {
    /// Placed at the given space-relative path.
    Done(String),
    Skipped,
}

/// Target directory of a batch copy or move.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub space_id: i64,
    #[serde(default)]
    pub path: String,
}

/// A directory entry as shown to clients.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Space-relative path with a leading `/`.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_overwrite_flag_maps_to_overwrite() {
        assert_eq!(
            ConflictPolicy::from_form(None, Some("true")).unwrap(),
            ConflictPolicy::Overwrite
        );
        assert_eq!(
            ConflictPolicy::from_form(None, Some("false")).unwrap(),
            ConflictPolicy::None
        );
        assert_eq!(
            ConflictPolicy::from_form(Some("skip"), Some("true")).unwrap(),
            ConflictPolicy::Skip
        );
        assert!(ConflictPolicy::from_form(Some("merge"), None).is_err());
    }

    #[test]
    fn outcome_serializes_codes_in_snake_case() {
        let mut outcome = TransferOutcome::default();
        outcome.fail("/a.txt", ConflictCode::SameDestination, "same path");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["failed"][0]["code"], "same_destination");
        assert_eq!(outcome.failed.len(), 1);
        assert!(!outcome.is_clean());
    }
}
