//! Quota tracker: cached recursive disk usage per space.
//!
//! Usage is computed by a full scan of the space root and cached for a short
//! TTL. The cache is the only shared mutable state of the engine: lookups
//! take the read lock, population and invalidation take the write lock. Two
//! requests missing the cache at the same time may both scan; the later
//! result simply replaces the earlier one.

use crate::{
    models::space::{Space, SpaceUsage},
    services::{error::QuotaError, fsops},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_USAGE_TTL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug)]
struct UsageCacheEntry {
    used_bytes: u64,
    scanned_at: DateTime<Utc>,
    fresh_until: Instant,
}

#[derive(Clone)]
pub struct QuotaTracker {
    cache: Arc<RwLock<HashMap<i64, UsageCacheEntry>>>,
    ttl: Duration,
}

impl QuotaTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Current usage of a space, from cache when fresh.
    pub async fn usage(&self, space: &Space) -> Result<SpaceUsage, QuotaError> {
        self.usage_with_cancel(space, &CancellationToken::new()).await
    }

    /// Like [`usage`](Self::usage), aborting a scan at the next directory
    /// entry once `cancel` fires.
    pub async fn usage_with_cancel(
        &self,
        space: &Space,
        cancel: &CancellationToken,
    ) -> Result<SpaceUsage, QuotaError> {
        if let Some(entry) = self.fresh_entry(space.id) {
            return Ok(report(space, entry.used_bytes, entry.scanned_at));
        }

        let root = space.root().to_path_buf();
        let token = cancel.clone();
        let used_bytes = tokio::task::spawn_blocking(move || fsops::scan_size(&root, &token))
            .await?
            .map_err(|_| QuotaError::Cancelled)?;
        let scanned_at = Utc::now();
        debug!(space_id = space.id, used_bytes, "scanned space usage");

        self.cache.write().insert(
            space.id,
            UsageCacheEntry {
                used_bytes,
                scanned_at,
                fresh_until: Instant::now() + self.ttl,
            },
        );
        Ok(report(space, used_bytes, scanned_at))
    }

    /// Reject a write of `delta` bytes that would push the space over its quota.
    ///
    /// Must run before the first byte reaches the destination. Spaces without
    /// a quota always pass.
    pub async fn ensure_can_write(&self, space: &Space, delta: u64) -> Result<(), QuotaError> {
        let Some(quota) = space.quota() else {
            return Ok(());
        };
        let usage = self.usage(space).await?;
        check_headroom(usage.used_bytes, quota, delta)
    }

    /// Bytes that still fit under the quota of a space; `None` when unlimited.
    pub async fn headroom(&self, space: &Space) -> Result<Option<u64>, QuotaError> {
        let Some(quota) = space.quota() else {
            return Ok(None);
        };
        let usage = self.usage(space).await?;
        Ok(Some(quota.saturating_sub(usage.used_bytes)))
    }

    /// Drop the cached usage of one space so the next lookup rescans.
    pub fn invalidate(&self, space_id: i64) {
        self.cache.write().remove(&space_id);
    }

    fn fresh_entry(&self, space_id: i64) -> Option<UsageCacheEntry> {
        let cache = self.cache.read();
        cache
            .get(&space_id)
            .filter(|entry| entry.fresh_until > Instant::now())
            .copied()
    }
}

impl fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("ttl", &self.ttl)
            .field("cached_spaces", &self.cache.read().len())
            .finish()
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(DEFAULT_USAGE_TTL)
    }
}

fn check_headroom(used: u64, quota: u64, delta: u64) -> Result<(), QuotaError> {
    if used.saturating_add(delta) > quota {
        return Err(QuotaError::Exceeded { used, quota, delta });
    }
    Ok(())
}

fn report(space: &Space, used_bytes: u64, scanned_at: DateTime<Utc>) -> SpaceUsage {
    let quota_bytes = space.quota();
    SpaceUsage {
        space_id: space.id,
        used_bytes,
        quota_bytes,
        over_quota: quota_bytes.is_some_and(|q| used_bytes > q),
        scanned_at,
    }
}
