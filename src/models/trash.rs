//! Trash records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of deleted content.
///
/// `Active -> Trashed -> Restoring -> Restored` or `Trashed -> Purging -> Purged`.
/// A claim that fails falls back from `Restoring`/`Purging` to `Trashed`.
/// Only `Trashed`, `Restoring` and `Purging` are ever stored; the terminal
/// states drop the record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TrashState {
    Active,
    Trashed,
    Restoring,
    Restored,
    Purging,
    Purged,
}

impl TrashState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrashState::Active => "active",
            TrashState::Trashed => "trashed",
            TrashState::Restoring => "restoring",
            TrashState::Restored => "restored",
            TrashState::Purging => "purging",
            TrashState::Purged => "purged",
        }
    }

    pub fn can_transition_to(self, next: TrashState) -> bool {
        use TrashState::*;
        matches!(
            (self, next),
            (Active, Trashed)
                | (Trashed, Restoring)
                | (Trashed, Purging)
                | (Restoring, Restored)
                | (Restoring, Trashed)
                | (Purging, Purged)
                | (Purging, Trashed)
        )
    }
}

/// Metadata for one deleted file or folder parked in a space's trash directory.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TrashItem {
    pub id: Uuid,

    pub space_id: i64,

    /// Space-relative path (leading `/`) the item had before deletion.
    pub original_path: String,

    /// Absolute path of the parked content inside the trash directory.
    #[serde(skip_serializing)]
    pub storage_path: String,

    pub item_name: String,

    pub is_dir: bool,

    pub item_size: i64,

    pub deleted_by: String,

    pub deleted_at: DateTime<Utc>,

    pub state: TrashState,
}

impl TrashItem {
    pub fn state(&self) -> TrashState {
        self.state
    }

    /// Where a restore should put the item back. Only set once a restore has
    /// claimed the record.
    pub fn restore_target(&self) -> Option<&str> {
        (self.state == TrashState::Restoring).then_some(self.original_path.as_str())
    }
}
