//! SFTP front end: a `russh` SSH server whose `sftp` subsystem runs
//! [`SftpSession`] over the engine.
//!
//! Paths are `/{space}/{relative}` like FTP. Files opened for writing land in
//! an upload slot and only replace the destination on `close`, so a client
//! that disconnects mid-transfer leaves nothing behind. Partial rewrites
//! (append, or writing an existing file without truncating) are refused.

use crate::{
    models::{
        permission::{Identity, Permission},
        space::Space,
        transfer::{ConflictPolicy, FileEntry},
    },
    services::{
        engine::{Resolved, SpaceEngine},
        error::EngineError,
        transfer::{TransferKind, UploadBegin, UploadSlot},
    },
};
use anyhow::Context;
use russh::{
    Channel, ChannelId,
    keys::{Algorithm, PrivateKey},
    server::{Auth, Msg, Server as _, Session},
};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::{collections::HashMap, io::SeekFrom, net::SocketAddr, sync::Arc, time::Duration};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};

const HANDLE_LIMIT: usize = 32;
const MAX_READ: u32 = 256 * 1024;

/// Start the SSH listener; returns when the server stops.
pub async fn serve(engine: SpaceEngine, addr: String, host_key: Option<String>) -> anyhow::Result<()> {
    let key = match host_key {
        Some(path) => russh::keys::load_secret_key(&path, None)
            .with_context(|| format!("failed to load SFTP host key {}", path))?,
        None => {
            warn!("no SFTP host key configured, generating an ephemeral one");
            PrivateKey::random(&mut russh::keys::ssh_key::rand_core::OsRng, Algorithm::Ed25519)
                .context("failed to generate SFTP host key")?
        }
    };

    let config = russh::server::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    };

    info!("SFTP listening on {}", addr);
    let mut server = SshServer { engine };
    server.run_on_address(Arc::new(config), addr.as_str()).await?;
    Ok(())
}

struct SshServer {
    engine: SpaceEngine,
}

impl russh::server::Server for SshServer {
    type Handler = SshConnection;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshConnection {
        debug!(?peer, "ssh client connected");
        SshConnection {
            engine: self.engine.clone(),
            identity: None,
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        warn!("ssh session error: {:#}", error);
    }
}

struct SshConnection {
    engine: SpaceEngine,
    identity: Option<Identity>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl russh::server::Handler for SshConnection {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.engine.accounts().authenticate(user, password).await? {
            Some(identity) => {
                info!(user = %identity, "sftp login");
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            None => {
                warn!(user = %user, "sftp authentication failed");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_eof(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        session.close(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let identity = self.identity.clone();
        match (name, self.channels.remove(&channel_id), identity) {
            ("sftp", Some(channel), Some(identity)) => {
                session.channel_success(channel_id)?;
                let handler = SftpSession::new(self.engine.clone(), identity);
                russh_sftp::server::run(channel.into_stream(), handler).await;
            }
            _ => session.channel_failure(channel_id)?,
        }
        Ok(())
    }
}

enum OpenHandle {
    /// Listing taken at `opendir`, handed out on the first `readdir`.
    Dir(Option<Vec<File>>),
    Read { path: String, file: tokio::fs::File },
    Write { path: String, slot: UploadSlot },
}

/// One SFTP subsystem session for an authenticated user.
pub struct SftpSession {
    engine: SpaceEngine,
    identity: Identity,
    handle_id: u64,
    handles: HashMap<String, OpenHandle>,
}

impl SftpSession {
    pub fn new(engine: SpaceEngine, identity: Identity) -> Self {
        Self {
            engine,
            identity,
            handle_id: 0,
            handles: HashMap::new(),
        }
    }

    fn next_handle(&mut self, handle: OpenHandle) -> Result<String, StatusCode> {
        if self.handles.len() >= HANDLE_LIMIT {
            return Err(StatusCode::Failure);
        }
        let id = format!("{:x}", self.handle_id);
        self.handle_id += 1;
        self.handles.insert(id.clone(), handle);
        Ok(id)
    }

    async fn locate(&self, path: &str) -> Result<Resolved, StatusCode> {
        self.engine
            .locate(&self.identity, path)
            .await
            .map_err(to_status)
    }

    /// Paths at or above a space root cannot be changed over SFTP.
    async fn locate_item(&self, path: &str) -> Result<(Space, String), StatusCode> {
        match self.locate(path).await? {
            Resolved::Entry { space, relative } if relative != "/" => Ok((space, relative)),
            _ => Err(StatusCode::PermissionDenied),
        }
    }

    async fn attrs_of(&self, path: &str) -> Result<FileAttributes, StatusCode> {
        match self.locate(path).await? {
            Resolved::Root => Ok(dir_attrs(None)),
            Resolved::Entry { space, relative } => self
                .engine
                .stat(&self.identity, &space, &relative)
                .await
                .map(|entry| attrs_for(&entry))
                .map_err(to_status),
        }
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(&mut self, _version: u32, _extensions: HashMap<String, String>) -> Result<Version, Self::Error> {
        Ok(Version {
            version: russh_sftp::protocol::VERSION,
            extensions: HashMap::new(),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::Write { path, slot }) => {
                slot.commit().await.map_err(to_status)?;
                info!(user = %self.identity, %path, "sftp upload stored");
            }
            Some(_) => {}
            None => return Err(StatusCode::NoSuchFile),
        }
        Ok(ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(virtual_path(&path))],
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let files = match self.locate(&path).await? {
            Resolved::Root => self
                .engine
                .spaces_for(&self.identity, Permission::Read)
                .await
                .map_err(to_status)?
                .into_iter()
                .map(|space| {
                    let modified = space.updated_at.unwrap_or(space.created_at);
                    File::new(space.name, dir_attrs(Some(modified.timestamp())))
                })
                .collect(),
            Resolved::Entry { space, relative } => self
                .engine
                .list(&self.identity, &space, &relative)
                .await
                .map_err(to_status)?
                .iter()
                .map(|entry| File::new(entry.name.clone(), attrs_for(entry)))
                .collect(),
        };
        let handle = self.next_handle(OpenHandle::Dir(Some(files)))?;
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir(listing)) => match listing.take() {
                Some(files) if !files.is_empty() => Ok(Name { id, files }),
                _ => Err(StatusCode::Eof),
            },
            _ => Err(StatusCode::NoSuchFile),
        }
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let (space, relative) = self.locate_item(&filename).await?;
        let path = virtual_path(&filename);
        let existing = match self.engine.stat(&self.identity, &space, &relative).await {
            Ok(entry) => Some(entry),
            Err(EngineError::NotFound(_)) => None,
            Err(err) => return Err(to_status(err)),
        };
        if existing.as_ref().is_some_and(|entry| entry.is_dir) {
            return Err(StatusCode::Failure);
        }

        let writing = pflags.intersects(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::APPEND);
        if !writing {
            let (file, _) = self
                .engine
                .open_read(&self.identity, &space, &relative)
                .await
                .map_err(to_status)?;
            let handle = self.next_handle(OpenHandle::Read { path, file })?;
            return Ok(Handle { id, handle });
        }

        if pflags.contains(OpenFlags::APPEND) || (existing.is_some() && !pflags.contains(OpenFlags::TRUNCATE)) {
            return Err(StatusCode::OpUnsupported);
        }
        if existing.is_none() && !pflags.contains(OpenFlags::CREATE) {
            return Err(StatusCode::NoSuchFile);
        }
        let policy = if pflags.contains(OpenFlags::EXCLUDE) {
            ConflictPolicy::None
        } else {
            ConflictPolicy::Overwrite
        };
        let slot = match self
            .engine
            .open_write(&self.identity, &space, &relative, policy, None)
            .await
            .map_err(to_status)?
        {
            UploadBegin::Ready(slot) => slot,
            UploadBegin::Skipped(_) => return Err(StatusCode::Failure),
        };
        let handle = self.next_handle(OpenHandle::Write { path, slot })?;
        Ok(Handle { id, handle })
    }

    async fn read(&mut self, id: u32, handle: String, offset: u64, len: u32) -> Result<Data, Self::Error> {
        let file = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Read { file, .. }) => file,
            _ => return Err(StatusCode::NoSuchFile),
        };
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|_| StatusCode::Failure)?;
        let mut data = vec![0; len.min(MAX_READ) as usize];
        let n = file.read(&mut data).await.map_err(|_| StatusCode::Failure)?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(n);
        Ok(Data { id, data })
    }

    async fn write(&mut self, id: u32, handle: String, offset: u64, data: Vec<u8>) -> Result<Status, Self::Error> {
        let slot = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Write { slot, .. }) => slot,
            _ => return Err(StatusCode::NoSuchFile),
        };
        slot.write_at(offset, &data).await.map_err(to_status)?;
        Ok(ok(id))
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = self.attrs_of(&path).await?;
        Ok(Attrs { id, attrs })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.stat(id, path).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let path = match self.handles.get(&handle) {
            Some(OpenHandle::Read { path, .. }) => path.clone(),
            Some(OpenHandle::Write { slot, .. }) => {
                let mut attrs = FileAttributes {
                    size: Some(slot.written()),
                    permissions: Some(0o644),
                    ..Default::default()
                };
                attrs.set_regular(true);
                return Ok(Attrs { id, attrs });
            }
            _ => return Err(StatusCode::NoSuchFile),
        };
        self.stat(id, path).await
    }

    /// Spaces keep no ownership or modes; attribute changes are acknowledged
    /// so clients that `chmod` after upload do not fail the transfer.
    async fn setstat(&mut self, id: u32, path: String, _attrs: FileAttributes) -> Result<Status, Self::Error> {
        self.attrs_of(&path).await?;
        Ok(ok(id))
    }

    async fn fsetstat(&mut self, id: u32, handle: String, _attrs: FileAttributes) -> Result<Status, Self::Error> {
        if self.handles.contains_key(&handle) {
            Ok(ok(id))
        } else {
            Err(StatusCode::NoSuchFile)
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let (space, relative) = self.locate_item(&filename).await?;
        let entry = self
            .engine
            .stat(&self.identity, &space, &relative)
            .await
            .map_err(to_status)?;
        if entry.is_dir {
            return Err(StatusCode::Failure);
        }
        self.engine
            .delete_one(&self.identity, &space, &relative)
            .await
            .map_err(to_status)?;
        Ok(ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let (space, relative) = self.locate_item(&path).await?;
        let entry = self
            .engine
            .stat(&self.identity, &space, &relative)
            .await
            .map_err(to_status)?;
        if !entry.is_dir {
            return Err(StatusCode::Failure);
        }
        self.engine
            .delete_one(&self.identity, &space, &relative)
            .await
            .map_err(to_status)?;
        Ok(ok(id))
    }

    async fn mkdir(&mut self, id: u32, path: String, _attrs: FileAttributes) -> Result<Status, Self::Error> {
        let (space, relative) = self.locate_item(&path).await?;
        self.engine
            .mkdir(&self.identity, &space, &relative)
            .await
            .map_err(to_status)?;
        Ok(ok(id))
    }

    async fn rename(&mut self, id: u32, oldpath: String, newpath: String) -> Result<Status, Self::Error> {
        let (src, src_rel) = self.locate_item(&oldpath).await?;
        let (dest, dest_rel) = self.locate_item(&newpath).await?;
        self.engine
            .transfer_to(
                &self.identity,
                TransferKind::Move,
                &src,
                &src_rel,
                &dest,
                &dest_rel,
                ConflictPolicy::None,
            )
            .await
            .map_err(to_status)?;
        Ok(ok(id))
    }

    async fn readlink(&mut self, _id: u32, _path: String) -> Result<Name, Self::Error> {
        Err(StatusCode::PermissionDenied)
    }

    async fn symlink(&mut self, _id: u32, _linkpath: String, _targetpath: String) -> Result<Status, Self::Error> {
        Err(StatusCode::PermissionDenied)
    }
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn to_status(err: EngineError) -> StatusCode {
    match err {
        EngineError::AccessDenied(_) => StatusCode::PermissionDenied,
        EngineError::NotFound(_) => StatusCode::NoSuchFile,
        EngineError::Conflict { .. }
        | EngineError::QuotaExceeded { .. }
        | EngineError::InvalidInput(_)
        | EngineError::Cancelled => StatusCode::Failure,
        err => {
            error!("sftp operation failed: {}", err);
            StatusCode::Failure
        }
    }
}

/// Lexically resolve a client path to its absolute `/a/b` form.
fn virtual_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

fn dir_attrs(mtime: Option<i64>) -> FileAttributes {
    let mut attrs = FileAttributes {
        size: Some(0),
        mtime: mtime.map(|t| t.max(0) as u32),
        permissions: Some(0o755),
        ..Default::default()
    };
    attrs.set_dir(true);
    attrs
}

fn attrs_for(entry: &FileEntry) -> FileAttributes {
    let mtime = entry.modified_at.map(|t| t.timestamp());
    if entry.is_dir {
        return dir_attrs(mtime);
    }
    let mut attrs = FileAttributes {
        size: Some(entry.size),
        mtime: mtime.map(|t| t.max(0) as u32),
        permissions: Some(0o644),
        ..Default::default()
    };
    attrs.set_regular(true);
    attrs
}
