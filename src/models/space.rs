//! Represents a space: a named, path-rooted storage area.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::Path;

/// A storage area exposed to every protocol under `/{name}`.
///
/// `id` and `name` never change once the space exists; `quota_bytes` is the
/// only field the engine itself updates.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    /// Registry identifier, used in HTTP routes.
    pub id: i64,

    /// Unique name, used as the first segment of virtual paths.
    pub name: String,

    pub description: Option<String>,

    /// Absolute directory on disk holding the space contents.
    #[serde(skip_serializing)]
    pub root_path: String,

    pub icon: Option<String>,

    pub category: Option<String>,

    /// Byte ceiling for the recursive size of `root_path`. `None` means unlimited.
    pub quota_bytes: Option<i64>,

    pub created_at: DateTime<Utc>,

    pub created_by: Option<String>,

    pub updated_at: Option<DateTime<Utc>>,

    pub updated_by: Option<String>,
}

impl Space {
    pub fn root(&self) -> &Path {
        Path::new(&self.root_path)
    }

    /// Quota as an unsigned byte count; negative values are treated as unlimited.
    pub fn quota(&self) -> Option<u64> {
        self.quota_bytes.and_then(|q| u64::try_from(q).ok())
    }

    #[cfg(test)]
    pub fn for_tests(id: i64, name: &str, root: &Path, quota_bytes: Option<i64>) -> Self {
        Space {
            id,
            name: name.to_string(),
            description: None,
            root_path: root.to_string_lossy().into_owned(),
            icon: None,
            category: None,
            quota_bytes,
            created_at: Utc::now(),
            created_by: None,
            updated_at: None,
            updated_by: None,
        }
    }
}

/// Fields accepted when registering a new space.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewSpace {
    pub name: String,
    pub root_path: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub category: Option<String>,
    pub quota_bytes: Option<i64>,
    pub created_by: Option<String>,
}

/// Recursive disk usage of one space, as reported by the quota tracker.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceUsage {
    pub space_id: i64,
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
    pub over_quota: bool,
    pub scanned_at: DateTime<Utc>,
}
