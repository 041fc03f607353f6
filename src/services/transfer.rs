//! Transfer engine: copy, move, rename and upload with conflict resolution.
//!
//! Every single-item transfer goes through the same three phases:
//!
//! 1. **plan** (blocking): inspect source and destination, reject self
//!    nesting and same-path overwrites, and apply the [`ConflictPolicy`];
//! 2. **quota**: charge the destination space with the recursive size of the
//!    source before a single byte is written;
//! 3. **execute** (blocking): copy through a hidden partial sibling, or move,
//!    using the backup swap when replacing an existing destination.
//!
//! Batch variants never abort on an item failure; each source ends up in
//! exactly one bucket of the returned [`TransferOutcome`].

use crate::{
    models::{
        space::Space,
        transfer::{ConflictCode, ConflictPolicy, ItemResult, TransferOutcome},
    },
    services::{
        error::{EngineError, EngineResult},
        fsops,
        quota::QuotaTracker,
        sandbox,
    },
};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Copy,
    Move,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::Copy => "copy",
            TransferKind::Move => "move",
        })
    }
}

/// A real path together with the space it was resolved through.
#[derive(Clone, Debug)]
pub struct Located {
    pub space: Space,
    pub real: PathBuf,
}

impl Located {
    pub fn new(space: Space, real: PathBuf) -> Self {
        Self { space, real }
    }

    /// Space-relative form (`/a/b`) of the path.
    pub fn relative(&self) -> String {
        sandbox::to_relative(self.space.root(), &self.real)
    }
}

#[derive(Debug)]
enum Plan {
    Skip,
    Place {
        target: PathBuf,
        replace: bool,
        size: u64,
    },
}

#[derive(Clone)]
pub struct TransferEngine {
    quota: QuotaTracker,
}

impl TransferEngine {
    pub fn new(quota: QuotaTracker) -> Self {
        Self { quota }
    }

    /// Copy or move `src` so that it ends up at exactly `target`.
    pub async fn transfer(
        &self,
        kind: TransferKind,
        src: &Located,
        target: &Located,
        policy: ConflictPolicy,
    ) -> EngineResult<ItemResult> {
        let charge = kind == TransferKind::Copy || src.space.id != target.space.id;
        let (src_real, dst_real) = (src.real.clone(), target.real.clone());
        let plan = blocking(move || plan_item(kind, &src_real, &dst_real, policy, charge)).await?;

        let (target_real, replace, size) = match plan {
            Plan::Skip => {
                debug!(src = %src.real.display(), "destination exists, skipping");
                return Ok(ItemResult::Skipped);
            }
            Plan::Place {
                target,
                replace,
                size,
            } => (target, replace, size),
        };

        if charge {
            self.quota.ensure_can_write(&target.space, size).await?;
        }

        let (src_real, placed) = (src.real.clone(), target_real.clone());
        blocking(move || -> EngineResult<()> {
            match (kind, replace) {
                (TransferKind::Copy, replace) => fsops::copy_into_place(&src_real, &placed, replace)?,
                (TransferKind::Move, false) => fsops::move_path(&src_real, &placed)?,
                (TransferKind::Move, true) => fsops::swap_into_place(&src_real, &placed)?,
            }
            Ok(())
        })
        .await?;

        self.quota.invalidate(target.space.id);
        if kind == TransferKind::Move && src.space.id != target.space.id {
            self.quota.invalidate(src.space.id);
        }

        let placed = Located::new(target.space.clone(), target_real);
        info!(
            %kind,
            from = %src.relative(),
            to = %placed.relative(),
            from_space = src.space.id,
            to_space = placed.space.id,
            replace,
            "transfer complete"
        );
        Ok(ItemResult::Done(placed.relative()))
    }

    /// Copy or move several items of `src_space` into the directory `dest_dir`.
    pub async fn transfer_many(
        &self,
        kind: TransferKind,
        src_space: &Space,
        sources: &[String],
        dest_dir: &Located,
        policy: ConflictPolicy,
    ) -> TransferOutcome {
        let mut outcome = TransferOutcome::default();
        for source in sources {
            let shown = sandbox::normalize_relative(source);
            let result = self
                .transfer_one(kind, src_space, source, &shown, dest_dir, policy)
                .await;
            record(&mut outcome, shown, result);
        }
        outcome
    }

    async fn transfer_one(
        &self,
        kind: TransferKind,
        src_space: &Space,
        source: &str,
        shown: &str,
        dest_dir: &Located,
        policy: ConflictPolicy,
    ) -> EngineResult<ItemResult> {
        if shown == "/" {
            return Err(EngineError::InvalidInput(
                "the space root cannot be transferred".into(),
            ));
        }
        let src_real = sandbox::resolve(src_space, source)?;
        let name = src_real
            .file_name()
            .ok_or_else(|| EngineError::InvalidInput(format!("{} has no name", shown)))?
            .to_owned();
        let src = Located::new(src_space.clone(), src_real);
        let target = Located::new(dest_dir.space.clone(), dest_dir.real.join(name));
        self.transfer(kind, &src, &target, policy).await
    }

    /// Rename an item inside its own directory.
    pub async fn rename(
        &self,
        space: &Space,
        relative: &str,
        new_name: &str,
        policy: ConflictPolicy,
    ) -> EngineResult<ItemResult> {
        sandbox::validate_name(new_name)?;
        let src_real = sandbox::resolve(space, relative)?;
        if sandbox::normalize_relative(relative) == "/" {
            return Err(EngineError::denied("the space root cannot be renamed"));
        }
        let parent = src_real
            .parent()
            .ok_or_else(|| EngineError::InvalidInput("path has no parent".into()))?;
        let target = Located::new(space.clone(), parent.join(new_name));
        let src = Located::new(space.clone(), src_real);
        self.transfer(TransferKind::Move, &src, &target, policy).await
    }

    /// Prepare a streamed write of a file at `relative`.
    ///
    /// Conflict policy and quota are evaluated before anything is created.
    /// `size_hint` is the best-effort payload size used to refuse early; the
    /// slot itself refuses any write past the quota headroom measured here.
    pub async fn begin_upload(
        &self,
        space: &Space,
        relative: &str,
        policy: ConflictPolicy,
        size_hint: Option<u64>,
    ) -> EngineResult<UploadBegin> {
        if sandbox::normalize_relative(relative) == "/" {
            return Err(EngineError::InvalidInput("a file name is required".into()));
        }
        let requested = sandbox::resolve(space, relative)?;

        let probe = requested.clone();
        let planned = blocking(move || -> EngineResult<Option<(PathBuf, bool)>> {
            match probe.symlink_metadata() {
                Err(_) => Ok(Some((probe, false))),
                Ok(meta) if meta.is_dir() => Err(EngineError::conflict(
                    ConflictCode::DestinationExists,
                    "a folder with that name already exists",
                )),
                Ok(_) => match policy {
                    ConflictPolicy::None => Err(EngineError::conflict(
                        ConflictCode::DestinationExists,
                        "destination already exists",
                    )),
                    ConflictPolicy::Skip => Ok(None),
                    ConflictPolicy::Rename => Ok(Some((fsops::unique_destination(&probe, false)?, false))),
                    ConflictPolicy::Overwrite => Ok(Some((probe, true))),
                },
            }
        })
        .await?;

        let Some((target, replace)) = planned else {
            return Ok(UploadBegin::Skipped(file_name_of(&requested)));
        };

        if size_hint.is_none() {
            debug!(space_id = space.id, "upload size unknown, quota check is advisory");
        }
        self.quota
            .ensure_can_write(space, size_hint.unwrap_or(0))
            .await?;
        let headroom = self.quota.headroom(space).await?;

        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| EngineError::InvalidInput("path has no parent".into()))?;
        fs::create_dir_all(&parent).await?;
        let partial = fsops::partial_sibling(&target);
        let file = File::create(&partial).await?;

        Ok(UploadBegin::Ready(UploadSlot {
            space: space.clone(),
            target,
            partial,
            replace,
            file: Some(file),
            written: 0,
            headroom,
            quota: self.quota.clone(),
            finished: false,
        }))
    }
}

/// Result of [`TransferEngine::begin_upload`].
#[derive(Debug)]
pub enum UploadBegin {
    /// Destination exists and the policy is `skip`; carries the file name.
    Skipped(String),
    Ready(UploadSlot),
}

/// An in-flight upload. Bytes land in a hidden partial file next to the
/// destination and only become visible on [`commit`](UploadSlot::commit).
/// Dropping an uncommitted slot removes the partial file.
#[derive(Debug)]
pub struct UploadSlot {
    space: Space,
    target: PathBuf,
    partial: PathBuf,
    replace: bool,
    file: Option<File>,
    written: u64,
    headroom: Option<u64>,
    quota: QuotaTracker,
    finished: bool,
}

impl UploadSlot {
    pub fn file_name(&self) -> String {
        file_name_of(&self.target)
    }

    pub fn relative(&self) -> String {
        sandbox::to_relative(self.space.root(), &self.target)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, chunk: &[u8]) -> EngineResult<()> {
        self.check_headroom(self.written + chunk.len() as u64)?;
        let file = self.open_file()?;
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Positioned write, for protocols that send offsets (SFTP).
    pub async fn write_at(&mut self, offset: u64, chunk: &[u8]) -> EngineResult<()> {
        self.check_headroom(self.written.max(offset + chunk.len() as u64))?;
        let file = self.open_file()?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(chunk).await?;
        self.written = self.written.max(offset + chunk.len() as u64);
        Ok(())
    }

    fn check_headroom(&self, size: u64) -> EngineResult<()> {
        match (self.headroom, self.space.quota()) {
            (Some(headroom), Some(quota)) if size > headroom => Err(EngineError::QuotaExceeded {
                used: quota - headroom,
                quota,
                delta: size,
            }),
            _ => Ok(()),
        }
    }

    /// Flush the partial file and rename it over the destination.
    pub async fn commit(mut self) -> EngineResult<String> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| EngineError::InvalidInput("upload already finished".into()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let (partial, target, replace) = (self.partial.clone(), self.target.clone(), self.replace);
        blocking(move || -> EngineResult<()> {
            if replace && fsops::exists(&target) {
                fsops::swap_into_place(&partial, &target)?;
            } else if fsops::exists(&target) {
                return Err(EngineError::conflict(
                    ConflictCode::DestinationExists,
                    "destination appeared during upload",
                ));
            } else {
                std::fs::rename(&partial, &target)?;
            }
            Ok(())
        })
        .await?;

        self.finished = true;
        self.quota.invalidate(self.space.id);
        info!(
            space_id = self.space.id,
            path = %self.relative(),
            bytes = self.written,
            "upload stored"
        );
        Ok(self.file_name())
    }

    /// Discard everything written so far.
    pub async fn abort(mut self) {
        self.file.take();
        if let Err(err) = fs::remove_file(&self.partial).await {
            warn!("failed to remove partial upload {}: {}", self.partial.display(), err);
        }
        self.finished = true;
    }

    fn open_file(&mut self) -> EngineResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| EngineError::InvalidInput("upload already finished".into()))
    }
}

impl Drop for UploadSlot {
    fn drop(&mut self) {
        if !self.finished && fsops::exists(&self.partial) {
            debug!("dropping unfinished upload {}", self.partial.display());
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}

/// Sort one item result into the outcome, logging unexpected failures.
pub fn record(outcome: &mut TransferOutcome, shown: String, result: EngineResult<ItemResult>) {
    match result {
        Ok(ItemResult::Done(_)) => outcome.succeed(shown),
        Ok(ItemResult::Skipped) => outcome.skip(shown),
        Err(err) => {
            if err.is_internal() {
                error!(path = %shown, "item failed: {}", err);
            } else {
                debug!(path = %shown, "item rejected: {}", err);
            }
            outcome.fail(shown, err.code(), err.to_string());
        }
    }
}

/// Run blocking filesystem work off the async reactor.
pub async fn blocking<T, F>(f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn plan_item(
    kind: TransferKind,
    src: &Path,
    dst: &Path,
    policy: ConflictPolicy,
    charge: bool,
) -> EngineResult<Plan> {
    let meta = src
        .symlink_metadata()
        .map_err(|_| EngineError::NotFound(format!("source {}", display_name(src))))?;
    let is_dir = meta.is_dir();

    if dst == src {
        if policy == ConflictPolicy::Overwrite {
            return Err(EngineError::conflict(
                ConflictCode::SameDestination,
                "source and destination are the same",
            ));
        }
    } else if is_dir && sandbox::is_within(src, dst) {
        return Err(EngineError::conflict(
            ConflictCode::InvalidDestination,
            format!("cannot {} a folder into itself", kind),
        ));
    }

    match dst.parent() {
        Some(parent) if parent.is_dir() => {}
        _ => {
            return Err(EngineError::NotFound(format!(
                "destination folder of {}",
                display_name(dst)
            )));
        }
    }

    let mut target = dst.to_path_buf();
    let mut replace = false;
    if fsops::exists(dst) {
        match policy {
            ConflictPolicy::None => {
                return Err(EngineError::conflict(
                    ConflictCode::DestinationExists,
                    format!("{} already exists", display_name(dst)),
                ));
            }
            ConflictPolicy::Skip => return Ok(Plan::Skip),
            ConflictPolicy::Rename => target = fsops::unique_destination(dst, is_dir)?,
            ConflictPolicy::Overwrite => {
                if sandbox::is_within(dst, src) {
                    return Err(EngineError::conflict(
                        ConflictCode::InvalidDestination,
                        "cannot overwrite a folder that contains the source",
                    ));
                }
                replace = true;
            }
        }
    }

    let size = if charge { fsops::path_size(src)? } else { 0 };
    Ok(Plan::Place {
        target,
        replace,
        size,
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| format!("`{}`", n.to_string_lossy()))
        .unwrap_or_else(|| "`/`".to_string())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        a: Space,
        b: Space,
        engine: TransferEngine,
    }

    fn fixture(quota_b: Option<i64>) -> Fixture {
        let dir = tempdir().unwrap();
        let (ra, rb) = (dir.path().join("a"), dir.path().join("b"));
        stdfs::create_dir_all(&ra).unwrap();
        stdfs::create_dir_all(&rb).unwrap();
        Fixture {
            a: Space::for_tests(1, "a", &ra, None),
            b: Space::for_tests(2, "b", &rb, quota_b),
            engine: TransferEngine::new(QuotaTracker::default()),
            _dir: dir,
        }
    }

    fn put(space: &Space, rel: &str, body: &str) {
        let path = space.root().join(rel);
        stdfs::create_dir_all(path.parent().unwrap()).unwrap();
        stdfs::write(path, body).unwrap();
    }

    fn read(space: &Space, rel: &str) -> String {
        stdfs::read_to_string(space.root().join(rel)).unwrap()
    }

    fn root_of(space: &Space) -> Located {
        Located::new(space.clone(), space.root().to_path_buf())
    }

    #[tokio::test]
    async fn none_policy_fails_and_touches_nothing() {
        let fx = fixture(None);
        put(&fx.a, "doc.txt", "source");
        put(&fx.b, "doc.txt", "dest");

        let outcome = fx
            .engine
            .transfer_many(
                TransferKind::Move,
                &fx.a,
                &["/doc.txt".into()],
                &root_of(&fx.b),
                ConflictPolicy::None,
            )
            .await;

        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].code, ConflictCode::DestinationExists);
        assert_eq!(read(&fx.a, "doc.txt"), "source");
        assert_eq!(read(&fx.b, "doc.txt"), "dest");
    }

    #[tokio::test]
    async fn overwrite_move_replaces_destination_and_removes_source() {
        let fx = fixture(None);
        put(&fx.a, "doc.txt", "source");
        put(&fx.b, "doc.txt", "dest");

        let outcome = fx
            .engine
            .transfer_many(
                TransferKind::Move,
                &fx.a,
                &["doc.txt".into()],
                &root_of(&fx.b),
                ConflictPolicy::Overwrite,
            )
            .await;

        assert_eq!(outcome.succeeded, vec!["/doc.txt".to_string()]);
        assert_eq!(read(&fx.b, "doc.txt"), "source");
        assert!(!fx.a.root().join("doc.txt").exists());
        assert_eq!(stdfs::read_dir(fx.b.root()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn rename_policy_creates_one_new_file() {
        let fx = fixture(None);
        put(&fx.a, "doc.txt", "source");
        put(&fx.b, "doc.txt", "dest");

        let outcome = fx
            .engine
            .transfer_many(
                TransferKind::Copy,
                &fx.a,
                &["doc.txt".into()],
                &root_of(&fx.b),
                ConflictPolicy::Rename,
            )
            .await;

        assert!(outcome.is_clean());
        assert_eq!(read(&fx.b, "doc.txt"), "dest");
        assert_eq!(read(&fx.b, "doc (1).txt"), "source");
        assert_eq!(read(&fx.a, "doc.txt"), "source");
        assert_eq!(stdfs::read_dir(fx.b.root()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn skip_policy_records_skipped_path() {
        let fx = fixture(None);
        put(&fx.a, "doc.txt", "source");
        put(&fx.b, "doc.txt", "dest");

        let outcome = fx
            .engine
            .transfer_many(
                TransferKind::Move,
                &fx.a,
                &["doc.txt".into()],
                &root_of(&fx.b),
                ConflictPolicy::Skip,
            )
            .await;

        assert_eq!(outcome.skipped, vec!["/doc.txt".to_string()]);
        assert_eq!(read(&fx.a, "doc.txt"), "source");
        assert_eq!(read(&fx.b, "doc.txt"), "dest");
    }

    #[tokio::test]
    async fn copy_onto_itself_with_overwrite_is_refused() {
        let fx = fixture(None);
        put(&fx.a, "doc.txt", "keep me");

        let src = Located::new(fx.a.clone(), fx.a.root().join("doc.txt"));
        let err = fx
            .engine
            .transfer(TransferKind::Copy, &src, &src, ConflictPolicy::Overwrite)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ConflictCode::SameDestination);
        assert_eq!(read(&fx.a, "doc.txt"), "keep me");
    }

    #[tokio::test]
    async fn folders_cannot_be_moved_into_themselves() {
        let fx = fixture(None);
        put(&fx.a, "dir/inner/file.txt", "x");

        let dest = Located::new(fx.a.clone(), fx.a.root().join("dir/inner"));
        let outcome = fx
            .engine
            .transfer_many(
                TransferKind::Move,
                &fx.a,
                &["dir".into(), "missing.txt".into()],
                &dest,
                ConflictPolicy::None,
            )
            .await;

        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(outcome.failed[0].code, ConflictCode::InvalidDestination);
        assert_eq!(outcome.failed[1].code, ConflictCode::NotFound);
        assert!(fx.a.root().join("dir/inner/file.txt").exists());
    }

    #[tokio::test]
    async fn quota_failure_aborts_only_that_item() {
        let fx = fixture(Some(10));
        put(&fx.a, "big.bin", "0123456789abcdef");
        put(&fx.a, "small.txt", "tiny");

        let outcome = fx
            .engine
            .transfer_many(
                TransferKind::Copy,
                &fx.a,
                &["big.bin".into(), "small.txt".into()],
                &root_of(&fx.b),
                ConflictPolicy::None,
            )
            .await;

        assert_eq!(outcome.succeeded, vec!["/small.txt".to_string()]);
        assert_eq!(outcome.failed[0].code, ConflictCode::QuotaExceeded);
        assert!(!fx.b.root().join("big.bin").exists());
    }

    #[tokio::test]
    async fn traversal_in_batch_is_reported_per_item() {
        let fx = fixture(None);
        put(&fx.a, "ok.txt", "fine");

        let outcome = fx
            .engine
            .transfer_many(
                TransferKind::Copy,
                &fx.a,
                &["../b/escape".into(), "ok.txt".into()],
                &root_of(&fx.b),
                ConflictPolicy::None,
            )
            .await;

        assert_eq!(outcome.failed[0].code, ConflictCode::AccessDenied);
        assert_eq!(outcome.succeeded, vec!["/ok.txt".to_string()]);
    }

    #[tokio::test]
    async fn rename_moves_within_directory() {
        let fx = fixture(None);
        put(&fx.a, "dir/old.txt", "x");

        let result = fx
            .engine
            .rename(&fx.a, "dir/old.txt", "new.txt", ConflictPolicy::None)
            .await
            .unwrap();

        assert_eq!(result, ItemResult::Done("/dir/new.txt".into()));
        assert!(fx.a.root().join("dir/new.txt").exists());
        assert!(
            fx.engine
                .rename(&fx.a, "dir/new.txt", "../x", ConflictPolicy::None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn rejected_upload_creates_nothing() {
        let fx = fixture(Some(8));
        let before = QuotaTracker::default().usage(&fx.b).await.unwrap().used_bytes;

        let err = fx
            .engine
            .begin_upload(&fx.b, "/big.bin", ConflictPolicy::None, Some(100))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ConflictCode::QuotaExceeded);
        assert_eq!(stdfs::read_dir(fx.b.root()).unwrap().count(), 0);
        let after = QuotaTracker::default().usage(&fx.b).await.unwrap().used_bytes;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn upload_commits_atomically() {
        let fx = fixture(None);
        put(&fx.a, "report.txt", "old");

        let UploadBegin::Ready(mut slot) = fx
            .engine
            .begin_upload(&fx.a, "/report.txt", ConflictPolicy::Overwrite, Some(3))
            .await
            .unwrap()
        else {
            panic!("expected upload slot");
        };
        slot.write(b"new").await.unwrap();
        assert_eq!(read(&fx.a, "report.txt"), "old");
        assert_eq!(slot.commit().await.unwrap(), "report.txt");
        assert_eq!(read(&fx.a, "report.txt"), "new");
        assert_eq!(stdfs::read_dir(fx.a.root()).unwrap().count(), 1);

        let begin = fx
            .engine
            .begin_upload(&fx.a, "/report.txt", ConflictPolicy::Skip, None)
            .await
            .unwrap();
        assert!(matches!(begin, UploadBegin::Skipped(name) if name == "report.txt"));
    }

    #[test]
    fn record_sorts_results_by_outcome() {
        let mut outcome = TransferOutcome::default();
        record(&mut outcome, "/a".into(), Ok(ItemResult::Done("/a".into())));
        record(&mut outcome, "/b".into(), Ok(ItemResult::Skipped));
        record(&mut outcome, "/c".into(), Err(EngineError::NotFound("/c".into())));
        record(&mut outcome, "/d".into(), Err(EngineError::Io(std::io::Error::other("disk"))));

        assert_eq!(outcome.succeeded, vec!["/a".to_string()]);
        assert_eq!(outcome.skipped, vec!["/b".to_string()]);
        assert_eq!(outcome.failed[0].code, ConflictCode::NotFound);
        assert_eq!(outcome.failed[1].path, "/d");
        assert_eq!(outcome.failed[1].code, ConflictCode::Internal);
    }

    #[tokio::test]
    async fn upload_slot_refuses_bytes_past_the_quota() {
        let fx = fixture(Some(8));
        put(&fx.b, "old.bin", "123");

        let UploadBegin::Ready(mut slot) = fx
            .engine
            .begin_upload(&fx.b, "/new.bin", ConflictPolicy::None, None)
            .await
            .unwrap()
        else {
            panic!("expected upload slot");
        };
        slot.write(b"abcd").await.unwrap();
        slot.write(b"e").await.unwrap();
        let err = slot.write(b"f").await.unwrap_err();
        assert_eq!(err.code(), ConflictCode::QuotaExceeded);
        assert_eq!(slot.written(), 5);
        drop(slot);
        assert!(!fx.b.root().join("new.bin").exists());
    }

    #[tokio::test]
    async fn dropped_upload_leaves_no_partial_file() {
        let fx = fixture(None);
        let UploadBegin::Ready(mut slot) = fx
            .engine
            .begin_upload(&fx.a, "/nested/file.bin", ConflictPolicy::None, None)
            .await
            .unwrap()
        else {
            panic!("expected upload slot");
        };
        slot.write(b"partial").await.unwrap();
        drop(slot);

        assert_eq!(stdfs::read_dir(fx.a.root().join("nested")).unwrap().count(), 0);
    }
}
