//! Soft-delete: deleted items are parked in the space's hidden trash
//! directory and tracked in `trash_items` until restored or purged.

use crate::{
    models::{
        space::Space,
        transfer::{ConflictCode, ConflictPolicy, ItemResult, TransferOutcome},
        trash::{TrashItem, TrashState},
    },
    services::{
        error::{EngineError, EngineResult},
        fsops,
        quota::QuotaTracker,
        sandbox,
        transfer::{self, Located, TransferEngine, TransferKind, blocking},
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, warn};
use uuid::Uuid;

const TRASH_COLUMNS: &str = "id, space_id, original_path, storage_path, item_name, is_dir, \
                             item_size, deleted_by, deleted_at, state";

#[derive(Clone)]
pub struct TrashService {
    db: Arc<SqlitePool>,
    transfer: TransferEngine,
    quota: QuotaTracker,
}

impl TrashService {
    pub fn new(db: Arc<SqlitePool>, transfer: TransferEngine, quota: QuotaTracker) -> Self {
        Self {
            db,
            transfer,
            quota,
        }
    }

    /// Move one item into the trash and record it.
    pub async fn trash(&self, space: &Space, relative: &str, deleted_by: &str) -> EngineResult<TrashItem> {
        let original_path = sandbox::normalize_relative(relative);
        if original_path == "/" {
            return Err(EngineError::denied("the space root cannot be deleted"));
        }
        let real = sandbox::resolve(space, relative)?;

        let id = Uuid::new_v4();
        let bin = sandbox::trash_dir(space);
        let storage = bin.join(id.to_string());
        let (from, to) = (real.clone(), storage.clone());
        let (is_dir, size) = blocking(move || -> EngineResult<(bool, u64)> {
            let meta = from
                .symlink_metadata()
                .map_err(|_| EngineError::NotFound(from.display().to_string()))?;
            let size = fsops::path_size(&from)?;
            std::fs::create_dir_all(&bin)?;
            fsops::move_path(&from, &to)?;
            Ok((meta.is_dir(), size))
        })
        .await
        .map_err(|err| match err {
            EngineError::NotFound(_) => EngineError::NotFound(original_path.clone()),
            other => other,
        })?;

        let item_name = real
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let inserted = sqlx::query_as::<_, TrashItem>(&format!(
            "INSERT INTO trash_items ({TRASH_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {TRASH_COLUMNS}"
        ))
        .bind(id)
        .bind(space.id)
        .bind(&original_path)
        .bind(storage.to_string_lossy().into_owned())
        .bind(&item_name)
        .bind(is_dir)
        .bind(size as i64)
        .bind(deleted_by)
        .bind(Utc::now())
        .bind(TrashState::Trashed)
        .fetch_one(&*self.db)
        .await;

        match inserted {
            Ok(item) => {
                info!(space_id = space.id, path = %original_path, %id, "moved to trash");
                Ok(item)
            }
            Err(err) => {
                // Put the content back so nothing is left unreachable.
                let (from, to) = (storage, real);
                if let Err(undo) = blocking(move || Ok(fsops::move_path(&from, &to)?)).await {
                    error!(path = %original_path, "failed to roll back trash move: {}", undo);
                }
                Err(err.into())
            }
        }
    }

    pub async fn trash_many(&self, space: &Space, paths: &[String], deleted_by: &str) -> TransferOutcome {
        let mut outcome = TransferOutcome::default();
        for path in paths {
            let shown = sandbox::normalize_relative(path);
            let result = self
                .trash(space, path, deleted_by)
                .await
                .map(|item| ItemResult::Done(item.original_path));
            transfer::record(&mut outcome, shown, result);
        }
        outcome
    }

    /// Trash records of a space, newest first.
    pub async fn list(&self, space_id: i64) -> EngineResult<Vec<TrashItem>> {
        let items = sqlx::query_as::<_, TrashItem>(&format!(
            "SELECT {TRASH_COLUMNS} FROM trash_items WHERE space_id = ? ORDER BY deleted_at DESC"
        ))
        .bind(space_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(items)
    }

    async fn fetch(&self, space_id: i64, id: Uuid) -> EngineResult<TrashItem> {
        sqlx::query_as::<_, TrashItem>(&format!(
            "SELECT {TRASH_COLUMNS} FROM trash_items WHERE space_id = ? AND id = ?"
        ))
        .bind(space_id)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("trash item {}", id)))
    }

    /// Atomically move a record from its stored state to `next`. `None` means
    /// another request changed the record first.
    async fn transition(&self, item: &TrashItem, next: TrashState) -> EngineResult<Option<TrashItem>> {
        if !item.state().can_transition_to(next) {
            return Err(EngineError::conflict(
                ConflictCode::InvalidInput,
                format!(
                    "trash item cannot go from {} to {}",
                    item.state().as_str(),
                    next.as_str()
                ),
            ));
        }
        let updated = sqlx::query_as::<_, TrashItem>(&format!(
            "UPDATE trash_items SET state = ? WHERE id = ? AND state = ? RETURNING {TRASH_COLUMNS}"
        ))
        .bind(next)
        .bind(item.id)
        .bind(item.state())
        .fetch_optional(&*self.db)
        .await?;
        Ok(updated)
    }

    /// Take a trashed record for a restore or purge. Fails when the record is
    /// already claimed, so two requests never act on the same content.
    async fn claim(&self, item: &TrashItem, next: TrashState) -> EngineResult<TrashItem> {
        let claimed = match item.state() {
            TrashState::Trashed => self.transition(item, next).await?,
            _ => None,
        };
        claimed.ok_or_else(|| {
            warn!(id = %item.id, state = item.state().as_str(), "trash item already claimed");
            EngineError::NotFound(format!("trash item {}", item.id))
        })
    }

    /// Hand a claimed record back to the trash after a failed restore or purge.
    async fn release(&self, item: &TrashItem) {
        if let Err(err) = self.transition(item, TrashState::Trashed).await {
            error!(id = %item.id, "failed to release trash item: {}", err);
        }
    }

    /// Drop a claimed record once its content reached `done`.
    async fn settle(&self, item: &TrashItem, done: TrashState) -> EngineResult<()> {
        if !item.state().can_transition_to(done) {
            return Err(EngineError::conflict(
                ConflictCode::InvalidInput,
                format!("trash item cannot be {}", done.as_str()),
            ));
        }
        sqlx::query("DELETE FROM trash_items WHERE id = ? AND state = ?")
            .bind(item.id)
            .bind(item.state())
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Return records left mid-restore or mid-purge by an interrupted process
    /// to the trash. Run once at startup.
    pub async fn release_stale_claims(&self) -> EngineResult<u64> {
        let released = sqlx::query("UPDATE trash_items SET state = ? WHERE state IN (?, ?)")
            .bind(TrashState::Trashed)
            .bind(TrashState::Restoring)
            .bind(TrashState::Purging)
            .execute(&*self.db)
            .await?
            .rows_affected();
        if released > 0 {
            warn!(released, "released interrupted trash operations");
        }
        Ok(released)
    }

    /// Move items back to their original paths, resolving collisions with `policy`.
    pub async fn restore(&self, space: &Space, ids: &[Uuid], policy: ConflictPolicy) -> TransferOutcome {
        let mut outcome = TransferOutcome::default();
        for id in ids {
            let (shown, result) = match self.fetch(space.id, *id).await {
                Ok(item) => {
                    let shown = item.original_path.clone();
                    (shown, self.restore_one(space, item, policy).await)
                }
                Err(err) => (id.to_string(), Err(err)),
            };
            transfer::record(&mut outcome, shown, result);
        }
        outcome
    }

    async fn restore_one(
        &self,
        space: &Space,
        item: TrashItem,
        policy: ConflictPolicy,
    ) -> EngineResult<ItemResult> {
        let claimed = self.claim(&item, TrashState::Restoring).await?;
        let result = self.restore_claimed(space, &claimed, policy).await;
        match &result {
            Ok(ItemResult::Done(placed)) => {
                self.settle(&claimed, TrashState::Restored).await?;
                info!(space_id = space.id, id = %claimed.id, path = %placed, "restored from trash");
            }
            _ => self.release(&claimed).await,
        }
        result
    }

    async fn restore_claimed(
        &self,
        space: &Space,
        item: &TrashItem,
        policy: ConflictPolicy,
    ) -> EngineResult<ItemResult> {
        let storage = self.stored_content(space, item)?;
        let target_rel = item
            .restore_target()
            .ok_or_else(|| EngineError::InvalidInput("trash record has no original path".into()))?;
        let target = sandbox::resolve(space, target_rel)?;

        let (artifact, dest, original) = (storage.clone(), target.clone(), item.original_path.clone());
        let created = blocking(move || {
            if !fsops::exists(&artifact) {
                return Err(EngineError::NotFound(original));
            }
            Ok(fsops::create_parents(&dest)?)
        })
        .await?;

        let result = self
            .transfer
            .transfer(
                TransferKind::Move,
                &Located::new(space.clone(), storage),
                &Located::new(space.clone(), target.clone()),
                policy,
            )
            .await;
        if let (Some(top), false) = (created, matches!(result, Ok(ItemResult::Done(_)))) {
            let pruned = blocking(move || {
                fsops::prune_empty_parents(&target, &top);
                Ok(())
            })
            .await;
            if let Err(err) = pruned {
                warn!(id = %item.id, "failed to remove restore folders: {}", err);
            }
        }
        result
    }

    /// Permanently delete trashed items.
    pub async fn purge(&self, space: &Space, ids: &[Uuid]) -> TransferOutcome {
        let mut outcome = TransferOutcome::default();
        for id in ids {
            let (shown, result) = match self.fetch(space.id, *id).await {
                Ok(item) => {
                    let shown = item.original_path.clone();
                    (shown, self.purge_one(space, item).await)
                }
                Err(err) => (id.to_string(), Err(err)),
            };
            transfer::record(&mut outcome, shown, result);
        }
        if !outcome.succeeded.is_empty() {
            self.quota.invalidate(space.id);
        }
        outcome
    }

    async fn purge_one(&self, space: &Space, item: TrashItem) -> EngineResult<ItemResult> {
        let storage = self.stored_content(space, &item)?;
        let claimed = self.claim(&item, TrashState::Purging).await?;
        let removed = blocking(move || {
            match fsops::remove_path(&storage) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!("trash content {} already gone", storage.display());
                }
                Err(err) => return Err(err.into()),
            }
            Ok(())
        })
        .await;
        if let Err(err) = removed {
            self.release(&claimed).await;
            return Err(err);
        }
        self.settle(&claimed, TrashState::Purged).await?;
        info!(space_id = space.id, id = %claimed.id, path = %claimed.original_path, "purged from trash");
        Ok(ItemResult::Done(claimed.original_path))
    }

    /// Drop every record and artifact in the trash of a space. Returns the
    /// number of records removed.
    pub async fn empty(&self, space: &Space) -> EngineResult<u64> {
        let bin = sandbox::trash_dir(space);
        blocking(move || {
            if fsops::exists(&bin) {
                fsops::remove_path(&bin)?;
            }
            Ok(())
        })
        .await?;

        let removed = sqlx::query("DELETE FROM trash_items WHERE space_id = ?")
            .bind(space.id)
            .execute(&*self.db)
            .await?
            .rows_affected();
        self.quota.invalidate(space.id);
        info!(space_id = space.id, removed, "emptied trash");
        Ok(removed)
    }

    /// The stored artifact of a record, refusing paths outside the trash directory.
    fn stored_content(&self, space: &Space, item: &TrashItem) -> EngineResult<PathBuf> {
        let storage = PathBuf::from(&item.storage_path);
        if !sandbox::is_within(&sandbox::trash_dir(space), &storage) {
            error!(id = %item.id, "trash record points outside the trash directory");
            return Err(EngineError::denied("trash record is not in this space"));
        }
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::memory_pool, models::space::NewSpace, services::registry::SpaceRegistry};
    use std::fs;
    use tempfile::{TempDir, tempdir};

    async fn setup(quota: Option<i64>) -> (TempDir, Space, TrashService) {
        let dir = tempdir().unwrap();
        let db = Arc::new(memory_pool().await);
        let space = SpaceRegistry::new(db.clone())
            .create(NewSpace {
                name: "team".into(),
                root_path: dir.path().join("team").to_string_lossy().into_owned(),
                quota_bytes: quota,
                ..Default::default()
            })
            .await
            .unwrap();
        let quota = QuotaTracker::default();
        let service = TrashService::new(db, TransferEngine::new(quota.clone()), quota);
        (dir, space, service)
    }

    #[tokio::test]
    async fn trash_then_restore_brings_content_back() {
        let (_dir, space, trash) = setup(None).await;
        fs::create_dir_all(space.root().join("docs")).unwrap();
        fs::write(space.root().join("docs/plan.md"), "v1").unwrap();

        let item = trash.trash(&space, "/docs/plan.md", "alice").await.unwrap();
        assert_eq!(item.original_path, "/docs/plan.md");
        assert_eq!(item.item_size, 2);
        assert!(!space.root().join("docs/plan.md").exists());
        assert_eq!(trash.list(space.id).await.unwrap().len(), 1);

        let outcome = trash.restore(&space, &[item.id], ConflictPolicy::None).await;
        assert_eq!(outcome.succeeded, vec!["/docs/plan.md".to_string()]);
        assert_eq!(fs::read_to_string(space.root().join("docs/plan.md")).unwrap(), "v1");
        assert!(trash.list(space.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_conflict_keeps_record() {
        let (_dir, space, trash) = setup(None).await;
        fs::write(space.root().join("a.txt"), "old").unwrap();
        let item = trash.trash(&space, "a.txt", "alice").await.unwrap();
        fs::write(space.root().join("a.txt"), "new").unwrap();

        let outcome = trash.restore(&space, &[item.id], ConflictPolicy::None).await;
        assert_eq!(outcome.failed[0].code, ConflictCode::DestinationExists);
        assert_eq!(trash.list(space.id).await.unwrap().len(), 1);

        let outcome = trash.restore(&space, &[item.id], ConflictPolicy::Rename).await;
        assert!(outcome.is_clean());
        assert_eq!(fs::read_to_string(space.root().join("a (1).txt")).unwrap(), "old");
        assert_eq!(fs::read_to_string(space.root().join("a.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn restore_recreates_missing_parents() {
        let (_dir, space, trash) = setup(None).await;
        fs::create_dir_all(space.root().join("x/y")).unwrap();
        fs::write(space.root().join("x/y/z.txt"), "z").unwrap();
        let item = trash.trash(&space, "x/y/z.txt", "bob").await.unwrap();
        fs::remove_dir_all(space.root().join("x")).unwrap();

        let outcome = trash.restore(&space, &[item.id], ConflictPolicy::None).await;
        assert!(outcome.is_clean());
        assert!(space.root().join("x/y/z.txt").exists());
    }

    #[tokio::test]
    async fn concurrent_restores_of_one_item_succeed_once() {
        let (_dir, space, trash) = setup(None).await;
        fs::write(space.root().join("once.txt"), "1").unwrap();
        let item = trash.trash(&space, "once.txt", "alice").await.unwrap();
        assert_eq!(item.state(), TrashState::Trashed);

        let ids = [item.id];
        let (first, second) = tokio::join!(
            trash.restore(&space, &ids, ConflictPolicy::Rename),
            trash.restore(&space, &ids, ConflictPolicy::Rename),
        );
        assert_eq!(first.succeeded.len() + second.succeeded.len(), 1);
        let failed: Vec<_> = first.failed.iter().chain(&second.failed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].code, ConflictCode::NotFound);
        assert!(space.root().join("once.txt").exists());
        assert!(!space.root().join("once (1).txt").exists());
        assert!(trash.list(space.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claimed_items_are_not_restored_or_purged_again() {
        let (_dir, space, trash) = setup(None).await;
        fs::write(space.root().join("busy.txt"), "b").unwrap();
        let item = trash.trash(&space, "busy.txt", "alice").await.unwrap();

        let claimed = trash.claim(&item, TrashState::Purging).await.unwrap();
        assert_eq!(claimed.state(), TrashState::Purging);
        assert!(claimed.restore_target().is_none());

        let outcome = trash.restore(&space, &[item.id], ConflictPolicy::None).await;
        assert_eq!(outcome.failed[0].code, ConflictCode::NotFound);
        let outcome = trash.purge(&space, &[item.id]).await;
        assert_eq!(outcome.failed[0].code, ConflictCode::NotFound);
        assert!(!space.root().join("busy.txt").exists());

        assert_eq!(trash.release_stale_claims().await.unwrap(), 1);
        let listed = trash.list(space.id).await.unwrap();
        assert_eq!(listed[0].state(), TrashState::Trashed);
        let outcome = trash.restore(&space, &[item.id], ConflictPolicy::None).await;
        assert!(outcome.is_clean());
        assert!(space.root().join("busy.txt").exists());
    }

    #[tokio::test]
    async fn failed_restore_leaves_no_empty_folders() {
        let (_dir, space, trash) = setup(None).await;
        fs::create_dir_all(space.root().join("x/y")).unwrap();
        fs::write(space.root().join("x/y/z.txt"), "z").unwrap();
        let item = trash.trash(&space, "x/y/z.txt", "bob").await.unwrap();
        fs::remove_dir_all(space.root().join("x")).unwrap();
        fs::remove_file(&item.storage_path).unwrap();

        let outcome = trash.restore(&space, &[item.id], ConflictPolicy::None).await;
        assert_eq!(outcome.failed[0].code, ConflictCode::NotFound);
        assert_eq!(outcome.failed[0].path, "/x/y/z.txt");
        assert!(!space.root().join("x").exists());

        let listed = trash.list(space.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state(), TrashState::Trashed);
    }

    #[tokio::test]
    async fn root_and_missing_paths_cannot_be_trashed() {
        let (_dir, space, trash) = setup(None).await;
        let outcome = trash
            .trash_many(&space, &["/".into(), "nope.txt".into()], "alice")
            .await;
        assert_eq!(outcome.failed[0].code, ConflictCode::AccessDenied);
        assert_eq!(outcome.failed[1].code, ConflictCode::NotFound);
        assert_eq!(outcome.failed[1].path, "/nope.txt");
    }

    #[tokio::test]
    async fn purge_and_empty_release_space() {
        let (_dir, space, trash) = setup(None).await;
        fs::write(space.root().join("one.bin"), vec![0u8; 64]).unwrap();
        fs::write(space.root().join("two.bin"), vec![0u8; 32]).unwrap();
        let one = trash.trash(&space, "one.bin", "alice").await.unwrap();
        trash.trash(&space, "two.bin", "alice").await.unwrap();

        let usage = trash.quota.usage(&space).await.unwrap();
        assert_eq!(usage.used_bytes, 96);

        let outcome = trash.purge(&space, &[one.id, Uuid::new_v4()]).await;
        assert_eq!(outcome.succeeded, vec!["/one.bin".to_string()]);
        assert_eq!(outcome.failed[0].code, ConflictCode::NotFound);
        assert_eq!(trash.quota.usage(&space).await.unwrap().used_bytes, 32);

        assert_eq!(trash.empty(&space).await.unwrap(), 1);
        assert_eq!(trash.quota.usage(&space).await.unwrap().used_bytes, 0);
        assert!(trash.list(space.id).await.unwrap().is_empty());
    }
}
