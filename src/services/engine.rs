//! `SpaceEngine`: the one capability object shared by the HTTP API and the
//! FTP, SFTP and WebDAV adapters.
//!
//! Every public operation takes the caller's [`Identity`] and checks the
//! permission gate before the sandbox resolves a single path. Adapters never
//! touch the filesystem of a space directly.

use crate::{
    models::{
        permission::{Identity, Permission},
        space::{Space, SpaceUsage},
        ticket::DownloadTicket,
        transfer::{ConflictCode, ConflictPolicy, FileEntry, ItemResult, TransferOutcome},
        trash::TrashItem,
    },
    services::{
        accounts::AccountService,
        archive::{self, DownloadArtifact},
        error::{EngineError, EngineResult},
        fsops,
        permissions::{PermissionGate, PermissionService},
        quota::{DEFAULT_USAGE_TTL, QuotaTracker},
        registry::SpaceRegistry,
        sandbox::{self, VirtualPath},
        tickets::{DEFAULT_TICKET_TTL_SECS, TicketStore},
        transfer::{Located, TransferEngine, TransferKind, UploadBegin, blocking},
        trash::TrashService,
    },
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on search hits returned in one call.
pub const SEARCH_LIMIT: usize = 500;

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub usage_ttl: Duration,
    pub ticket_ttl: chrono::Duration,
    /// Where zip downloads are assembled.
    pub scratch_dir: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            usage_ttl: DEFAULT_USAGE_TTL,
            ticket_ttl: chrono::Duration::seconds(DEFAULT_TICKET_TTL_SECS),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

/// Result of resolving a protocol path such as `/{space}/{relative}`.
#[derive(Clone, Debug)]
pub enum Resolved {
    /// The virtual root listing the caller's spaces.
    Root,
    Entry { space: Space, relative: String },
}

#[derive(Clone)]
pub struct SpaceEngine {
    db: Arc<SqlitePool>,
    registry: SpaceRegistry,
    accounts: AccountService,
    gate: PermissionGate,
    quota: QuotaTracker,
    transfer: TransferEngine,
    trash: TrashService,
    tickets: TicketStore,
    scratch_dir: PathBuf,
}

impl SpaceEngine {
    pub fn new(db: Arc<SqlitePool>, options: EngineOptions) -> Self {
        let accounts = AccountService::new(db.clone());
        let quota = QuotaTracker::new(options.usage_ttl);
        let transfer = TransferEngine::new(quota.clone());
        Self {
            registry: SpaceRegistry::new(db.clone()),
            gate: PermissionGate::new(Arc::new(accounts.clone())),
            trash: TrashService::new(db.clone(), transfer.clone(), quota.clone()),
            tickets: TicketStore::new(options.ticket_ttl),
            scratch_dir: options.scratch_dir,
            accounts,
            quota,
            transfer,
            db,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn registry(&self) -> &SpaceRegistry {
        &self.registry
    }

    // ---- spaces ----

    /// Spaces on which `identity` holds at least `level`.
    pub async fn spaces_for(&self, identity: &Identity, level: Permission) -> EngineResult<Vec<Space>> {
        let mut visible = Vec::new();
        for space in self.registry.get_all().await? {
            if self.gate.can_access(identity, space.id, level).await? {
                visible.push(space);
            }
        }
        Ok(visible)
    }

    pub async fn space_by_id(&self, identity: &Identity, id: i64) -> EngineResult<Space> {
        self.gate.require(identity, id, Permission::Read).await?;
        self.registry.get_by_id(id).await
    }

    pub async fn space_by_name(&self, identity: &Identity, name: &str) -> EngineResult<Space> {
        let space = self.registry.get_by_name(name).await?;
        self.gate.require(identity, space.id, Permission::Read).await?;
        Ok(space)
    }

    /// Split and authorize a protocol path `/{space}/{relative}`.
    pub async fn locate(&self, identity: &Identity, path: &str) -> EngineResult<Resolved> {
        let virtual_path = VirtualPath::parse(path);
        let Some(name) = virtual_path.space else {
            return Ok(Resolved::Root);
        };
        let space = self.space_by_name(identity, &name).await?;
        sandbox::resolve(&space, &virtual_path.relative)?;
        Ok(Resolved::Entry {
            space,
            relative: virtual_path.relative,
        })
    }

    async fn authorize(
        &self,
        identity: &Identity,
        space: &Space,
        level: Permission,
        relative: &str,
    ) -> EngineResult<PathBuf> {
        self.gate.require(identity, space.id, level).await?;
        Ok(sandbox::resolve(space, relative)?)
    }

    // ---- browse ----

    pub async fn list(&self, identity: &Identity, space: &Space, relative: &str) -> EngineResult<Vec<FileEntry>> {
        let dir = self.authorize(identity, space, Permission::Read, relative).await?;
        let root = space.root().to_path_buf();
        let shown = sandbox::normalize_relative(relative);
        blocking(move || {
            if !dir.is_dir() {
                return Err(match dir.symlink_metadata() {
                    Ok(_) => EngineError::InvalidInput(format!("{} is not a folder", shown)),
                    Err(_) => EngineError::NotFound(shown),
                });
            }
            Ok(fsops::list_dir(&root, &dir)?)
        })
        .await
    }

    pub async fn stat(&self, identity: &Identity, space: &Space, relative: &str) -> EngineResult<FileEntry> {
        let real = self.authorize(identity, space, Permission::Read, relative).await?;
        let root = space.root().to_path_buf();
        let shown = sandbox::normalize_relative(relative);
        blocking(move || fsops::entry_for(&root, &real).map_err(|_| EngineError::NotFound(shown))).await
    }

    /// Case-insensitive name search below `relative`, at most [`SEARCH_LIMIT`] hits.
    pub async fn search(
        &self,
        identity: &Identity,
        space: &Space,
        relative: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<FileEntry>> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(EngineError::InvalidInput("search query is empty".into()));
        }
        let start = self.authorize(identity, space, Permission::Read, relative).await?;
        let root = space.root().to_path_buf();
        let token = cancel.clone();
        blocking(move || {
            fsops::search(&root, &start, &query, SEARCH_LIMIT, &token).map_err(|_| EngineError::Cancelled)
        })
        .await
    }

    pub async fn mkdir(&self, identity: &Identity, space: &Space, relative: &str) -> EngineResult<FileEntry> {
        let real = self.authorize(identity, space, Permission::Write, relative).await?;
        let root = space.root().to_path_buf();
        let entry = blocking(move || {
            if fsops::exists(&real) {
                return Err(EngineError::conflict(
                    ConflictCode::DestinationExists,
                    format!("{} already exists", sandbox::to_relative(&root, &real)),
                ));
            }
            std::fs::create_dir_all(&real)?;
            Ok(fsops::entry_for(&root, &real)?)
        })
        .await?;
        info!(user = %identity, space_id = space.id, path = %entry.path, "created folder");
        Ok(entry)
    }

    /// Open a regular file for streaming to a client.
    pub async fn open_read(
        &self,
        identity: &Identity,
        space: &Space,
        relative: &str,
    ) -> EngineResult<(File, FileEntry)> {
        let entry = self.stat(identity, space, relative).await?;
        if entry.is_dir {
            return Err(EngineError::InvalidInput(format!("{} is a folder", entry.path)));
        }
        let real = sandbox::resolve(space, relative)?;
        Ok((File::open(real).await?, entry))
    }

    // ---- transfers ----

    /// Copy items of `src` into the directory `dest_dir` of `dest`.
    pub async fn copy_items(
        &self,
        identity: &Identity,
        src: &Space,
        sources: &[String],
        dest: &Space,
        dest_dir: &str,
        policy: ConflictPolicy,
    ) -> EngineResult<TransferOutcome> {
        self.batch(identity, TransferKind::Copy, src, sources, dest, dest_dir, policy)
            .await
    }

    /// Move items of `src` into the directory `dest_dir` of `dest`.
    pub async fn move_items(
        &self,
        identity: &Identity,
        src: &Space,
        sources: &[String],
        dest: &Space,
        dest_dir: &str,
        policy: ConflictPolicy,
    ) -> EngineResult<TransferOutcome> {
        self.batch(identity, TransferKind::Move, src, sources, dest, dest_dir, policy)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn batch(
        &self,
        identity: &Identity,
        kind: TransferKind,
        src: &Space,
        sources: &[String],
        dest: &Space,
        dest_dir: &str,
        policy: ConflictPolicy,
    ) -> EngineResult<TransferOutcome> {
        if sources.is_empty() {
            return Err(EngineError::InvalidInput("no sources given".into()));
        }
        let src_level = match kind {
            TransferKind::Copy => Permission::Read,
            TransferKind::Move => Permission::Write,
        };
        self.gate.require(identity, src.id, src_level).await?;
        let dest_real = self.authorize(identity, dest, Permission::Write, dest_dir).await?;

        let outcome = self
            .transfer
            .transfer_many(kind, src, sources, &Located::new(dest.clone(), dest_real), policy)
            .await;
        info!(
            user = %identity,
            %kind,
            from_space = src.id,
            to_space = dest.id,
            succeeded = outcome.succeeded.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failed.len(),
            "batch transfer finished"
        );
        Ok(outcome)
    }

    /// Copy or move one item to an exact target path (WebDAV, FTP rename, SFTP rename).
    #[allow(clippy::too_many_arguments)]
    pub async fn transfer_to(
        &self,
        identity: &Identity,
        kind: TransferKind,
        src: &Space,
        src_rel: &str,
        dest: &Space,
        dest_rel: &str,
        policy: ConflictPolicy,
    ) -> EngineResult<ItemResult> {
        let src_level = match kind {
            TransferKind::Copy => Permission::Read,
            TransferKind::Move => Permission::Write,
        };
        let src_real = self.authorize(identity, src, src_level, src_rel).await?;
        let dest_real = self.authorize(identity, dest, Permission::Write, dest_rel).await?;
        if sandbox::normalize_relative(src_rel) == "/" || sandbox::normalize_relative(dest_rel) == "/" {
            return Err(EngineError::denied("space roots cannot be transferred"));
        }
        self.transfer
            .transfer(
                kind,
                &Located::new(src.clone(), src_real),
                &Located::new(dest.clone(), dest_real),
                policy,
            )
            .await
    }

    pub async fn rename(
        &self,
        identity: &Identity,
        space: &Space,
        relative: &str,
        new_name: &str,
        policy: ConflictPolicy,
    ) -> EngineResult<ItemResult> {
        self.gate.require(identity, space.id, Permission::Write).await?;
        self.transfer.rename(space, relative, new_name, policy).await
    }

    /// Start a streamed write (HTTP upload, FTP `STOR`, WebDAV `PUT`, SFTP open).
    pub async fn open_write(
        &self,
        identity: &Identity,
        space: &Space,
        relative: &str,
        policy: ConflictPolicy,
        size_hint: Option<u64>,
    ) -> EngineResult<UploadBegin> {
        self.gate.require(identity, space.id, Permission::Write).await?;
        self.transfer
            .begin_upload(space, relative, policy, size_hint)
            .await
    }

    // ---- trash ----

    pub async fn delete(&self, identity: &Identity, space: &Space, paths: &[String]) -> EngineResult<TransferOutcome> {
        self.gate.require(identity, space.id, Permission::Write).await?;
        Ok(self.trash.trash_many(space, paths, &identity.username).await)
    }

    pub async fn delete_one(&self, identity: &Identity, space: &Space, relative: &str) -> EngineResult<TrashItem> {
        self.gate.require(identity, space.id, Permission::Write).await?;
        self.trash.trash(space, relative, &identity.username).await
    }

    pub async fn trash_list(&self, identity: &Identity, space: &Space) -> EngineResult<Vec<TrashItem>> {
        self.gate.require(identity, space.id, Permission::Read).await?;
        self.trash.list(space.id).await
    }

    pub async fn trash_restore(
        &self,
        identity: &Identity,
        space: &Space,
        ids: &[Uuid],
        policy: ConflictPolicy,
    ) -> EngineResult<TransferOutcome> {
        self.gate.require(identity, space.id, Permission::Write).await?;
        Ok(self.trash.restore(space, ids, policy).await)
    }

    pub async fn trash_purge(&self, identity: &Identity, space: &Space, ids: &[Uuid]) -> EngineResult<TransferOutcome> {
        self.gate.require(identity, space.id, Permission::Write).await?;
        Ok(self.trash.purge(space, ids).await)
    }

    pub async fn trash_empty(&self, identity: &Identity, space: &Space) -> EngineResult<u64> {
        self.gate.require(identity, space.id, Permission::Manage).await?;
        self.trash.empty(space).await
    }

    // ---- quota ----

    pub async fn usage(&self, identity: &Identity, space: &Space) -> EngineResult<SpaceUsage> {
        self.gate.require(identity, space.id, Permission::Read).await?;
        Ok(self.quota.usage(space).await?)
    }

    /// Usage of every space the caller can read.
    pub async fn usage_all(&self, identity: &Identity, cancel: &CancellationToken) -> EngineResult<Vec<SpaceUsage>> {
        let mut report = Vec::new();
        for space in self.spaces_for(identity, Permission::Read).await? {
            report.push(self.quota.usage_with_cancel(&space, cancel).await?);
        }
        Ok(report)
    }

    pub async fn set_quota(
        &self,
        identity: &Identity,
        space_id: i64,
        quota_bytes: Option<i64>,
    ) -> EngineResult<SpaceUsage> {
        self.gate.require(identity, space_id, Permission::Manage).await?;
        let space = self
            .registry
            .update_quota(space_id, quota_bytes, &identity.username)
            .await?;
        self.quota.invalidate(space.id);
        info!(user = %identity, space_id, ?quota_bytes, "quota updated");
        Ok(self.quota.usage(&space).await?)
    }

    // ---- downloads ----

    /// A single file as is; a folder or several paths as a temporary zip.
    pub async fn prepare_download(
        &self,
        identity: &Identity,
        space: &Space,
        paths: &[String],
    ) -> EngineResult<DownloadArtifact> {
        self.gate.require(identity, space.id, Permission::Read).await?;
        let mut reals = Vec::with_capacity(paths.len());
        for path in paths {
            if sandbox::normalize_relative(path) == "/" {
                return Err(EngineError::InvalidInput("the space root cannot be downloaded".into()));
            }
            reals.push(sandbox::resolve(space, path)?);
        }
        let scratch = self.scratch_dir.clone();
        let fallback = format!("{}.zip", space.name);

        blocking(move || {
            for real in &reals {
                if !fsops::exists(real) {
                    return Err(EngineError::NotFound(
                        real.file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                    ));
                }
            }
            match reals.as_slice() {
                [] => Err(EngineError::InvalidInput("no paths given".into())),
                [one] if one.is_file() => Ok(archive::single_file(one)?),
                [one] => {
                    let name = one
                        .file_name()
                        .map(|n| format!("{}.zip", n.to_string_lossy()))
                        .unwrap_or(fallback);
                    archive::zip_paths(&reals, &scratch, &name)
                }
                _ => archive::zip_paths(&reals, &scratch, &fallback),
            }
        })
        .await
    }

    pub async fn issue_ticket(
        &self,
        identity: &Identity,
        space: &Space,
        paths: &[String],
    ) -> EngineResult<DownloadTicket> {
        let artifact = self.prepare_download(identity, space, paths).await?;
        Ok(self.tickets.issue(&identity.username, space.id, artifact))
    }

    /// Consume a ticket. Its owner must still be able to read the space the
    /// ticket was issued for.
    pub async fn redeem_ticket(&self, identity: &Identity, token: &str) -> EngineResult<DownloadTicket> {
        let ticket = self.tickets.redeem(token, &identity.username)?;
        if self
            .gate
            .can_access_space(&ticket.owner, ticket.space_id, Permission::Read)
            .await?
        {
            return Ok(ticket);
        }
        if ticket.remove_after_use {
            let path = ticket.file_path.clone();
            if let Err(err) = blocking(move || Ok(std::fs::remove_file(path)?)).await {
                warn!("failed to remove revoked download: {}", err);
            }
        }
        Err(EngineError::denied(format!(
            "read permission on space {} was revoked",
            ticket.space_id
        )))
    }

    /// Return trash records left mid-restore or mid-purge to the trash.
    pub async fn release_stale_trash_claims(&self) -> EngineResult<u64> {
        self.trash.release_stale_claims().await
    }
}
