//! Single-use download grants.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Out-of-band download grant: redeemable once, by its owner, before `expires_at`.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTicket {
    pub token: String,
    pub owner: String,
    pub space_id: i64,
    #[serde(skip_serializing)]
    pub file_path: PathBuf,
    pub file_name: String,
    pub content_type: String,
    pub content_size: u64,
    /// The file is a temporary artifact (e.g. a zip) and is deleted once used or expired.
    #[serde(skip_serializing)]
    pub remove_after_use: bool,
    pub expires_at: DateTime<Utc>,
}

impl DownloadTicket {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
