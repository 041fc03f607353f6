//! FTP front end built on `libunftp`.
//!
//! The virtual root lists the spaces the user can read; everything below
//! `/{space}` is served by the engine. `DELE` and `RMD` move items to the
//! trash, `RNFR`/`RNTO` is a move that refuses to replace, and `STOR` always
//! replaces through the engine's atomic write. Restarted transfers are not
//! advertised and a `STOR` with a non-zero offset is refused.

use crate::{
    models::{
        permission::{Identity, Permission},
        space::Space,
        transfer::{ConflictPolicy, FileEntry},
    },
    services::{
        accounts::AccountService,
        engine::{Resolved, SpaceEngine},
        error::EngineError,
        transfer::{TransferKind, UploadBegin},
    },
};
use async_trait::async_trait;
use libunftp::{
    ServerBuilder,
    auth::{AuthenticationError, Authenticator, Credentials, UserDetail},
    storage::{Error, ErrorKind, Fileinfo, Metadata, Result, StorageBackend},
};
use std::{
    fmt::{self, Debug, Display},
    io::SeekFrom,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::{error, info, warn};

const COPY_BUFFER: usize = 64 * 1024;

/// Start the FTP listener; returns when the server stops.
pub async fn serve(engine: SpaceEngine, addr: String, passive_ports: RangeInclusive<u16>) -> anyhow::Result<()> {
    let backend = SpaceFtpBackend::new(engine.clone());
    let authenticator = Arc::new(SpaceAuthenticator::new(engine.accounts().clone()));
    let server = ServerBuilder::with_authenticator(Box::new(move || backend.clone()), authenticator)
        .greeting("spacefs FTP ready")
        .passive_ports(passive_ports)
        .build()?;

    info!("FTP listening on {}", addr);
    server.listen(addr).await?;
    Ok(())
}

/// The logged-in FTP user.
#[derive(Debug, Clone)]
pub struct SpaceUser {
    pub identity: Identity,
}

impl Display for SpaceUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.identity, f)
    }
}

impl UserDetail for SpaceUser {}

pub struct SpaceAuthenticator {
    accounts: AccountService,
}

impl SpaceAuthenticator {
    pub fn new(accounts: AccountService) -> Self {
        Self { accounts }
    }
}

impl Debug for SpaceAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpaceAuthenticator")
    }
}

#[async_trait]
impl Authenticator<SpaceUser> for SpaceAuthenticator {
    async fn authenticate(
        &self,
        username: &str,
        creds: &Credentials,
    ) -> std::result::Result<SpaceUser, AuthenticationError> {
        let password = creds
            .password
            .as_deref()
            .ok_or(AuthenticationError::BadPassword)?;
        match self.accounts.authenticate(username, password).await {
            Ok(Some(identity)) => {
                info!(user = %identity, "ftp login");
                Ok(SpaceUser { identity })
            }
            Ok(None) => {
                warn!(user = %username, "ftp authentication failed");
                Err(AuthenticationError::BadPassword)
            }
            Err(err) => {
                error!(user = %username, "ftp authentication error: {}", err);
                Err(AuthenticationError::ImplPropagated(err.to_string(), None))
            }
        }
    }
}

#[derive(Clone)]
pub struct SpaceFtpBackend {
    engine: SpaceEngine,
}

impl SpaceFtpBackend {
    pub fn new(engine: SpaceEngine) -> Self {
        Self { engine }
    }

    async fn locate<P: AsRef<Path>>(&self, user: &SpaceUser, path: P) -> Result<Resolved> {
        let path = path.as_ref().to_string_lossy();
        self.engine
            .locate(&user.identity, &path)
            .await
            .map_err(to_ftp_error)
    }

    /// Paths at or above a space root cannot be changed over FTP.
    async fn locate_item<P: AsRef<Path>>(&self, user: &SpaceUser, path: P) -> Result<(Space, String)> {
        match self.locate(user, path).await? {
            Resolved::Entry { space, relative } if relative != "/" => Ok((space, relative)),
            _ => Err(Error::new(
                ErrorKind::PermissionDenied,
                "the root and space roots are read-only",
            )),
        }
    }
}

impl Debug for SpaceFtpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpaceFtpBackend")
    }
}

#[async_trait]
impl StorageBackend<SpaceUser> for SpaceFtpBackend {
    type Metadata = FtpMeta;

    async fn metadata<P: AsRef<Path> + Send + Debug>(&self, user: &SpaceUser, path: P) -> Result<Self::Metadata> {
        match self.locate(user, path).await? {
            Resolved::Root => Ok(FtpMeta::directory(SystemTime::now())),
            Resolved::Entry { space, relative } => self
                .engine
                .stat(&user.identity, &space, &relative)
                .await
                .map(|entry| FtpMeta::from(&entry))
                .map_err(to_ftp_error),
        }
    }

    async fn list<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SpaceUser,
        path: P,
    ) -> Result<Vec<Fileinfo<PathBuf, Self::Metadata>>> {
        match self.locate(user, path).await? {
            Resolved::Root => {
                let spaces = self
                    .engine
                    .spaces_for(&user.identity, Permission::Read)
                    .await
                    .map_err(to_ftp_error)?;
                Ok(spaces
                    .into_iter()
                    .map(|space| Fileinfo {
                        metadata: FtpMeta::directory(space.updated_at.unwrap_or(space.created_at).into()),
                        path: PathBuf::from(space.name),
                    })
                    .collect())
            }
            Resolved::Entry { space, relative } => {
                let entries = self
                    .engine
                    .list(&user.identity, &space, &relative)
                    .await
                    .map_err(to_ftp_error)?;
                Ok(entries
                    .iter()
                    .map(|entry| Fileinfo {
                        path: PathBuf::from(&entry.name),
                        metadata: FtpMeta::from(entry),
                    })
                    .collect())
            }
        }
    }

    async fn get<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SpaceUser,
        path: P,
        start_pos: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Sync + Unpin>> {
        let (space, relative) = self.locate_item(user, path).await?;
        let (mut file, _) = self
            .engine
            .open_read(&user.identity, &space, &relative)
            .await
            .map_err(to_ftp_error)?;
        if start_pos > 0 {
            file.seek(SeekFrom::Start(start_pos))
                .await
                .map_err(|e| Error::new(ErrorKind::LocalError, e))?;
        }
        Ok(Box::new(file))
    }

    async fn put<P: AsRef<Path> + Send + Debug, R: AsyncRead + Send + Sync + Unpin + 'static>(
        &self,
        user: &SpaceUser,
        mut input: R,
        path: P,
        start_pos: u64,
    ) -> Result<u64> {
        if start_pos > 0 {
            return Err(Error::new(
                ErrorKind::CommandNotImplemented,
                "resuming uploads is not supported",
            ));
        }
        let (space, relative) = self.locate_item(user, path).await?;
        let mut slot = match self
            .engine
            .open_write(&user.identity, &space, &relative, ConflictPolicy::Overwrite, None)
            .await
            .map_err(to_ftp_error)?
        {
            UploadBegin::Ready(slot) => slot,
            UploadBegin::Skipped(name) => {
                return Err(Error::new(ErrorKind::PermanentFileNotAvailable, format!("{} exists", name)));
            }
        };

        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = match input.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    slot.abort().await;
                    return Err(Error::new(ErrorKind::ConnectionClosed, err));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(err) = slot.write(&buf[..n]).await {
                slot.abort().await;
                return Err(to_ftp_error(err));
            }
        }
        let written = slot.written();
        slot.commit().await.map_err(to_ftp_error)?;
        Ok(written)
    }

    async fn del<P: AsRef<Path> + Send + Debug>(&self, user: &SpaceUser, path: P) -> Result<()> {
        let (space, relative) = self.locate_item(user, path).await?;
        self.engine
            .delete_one(&user.identity, &space, &relative)
            .await
            .map(|_| ())
            .map_err(to_ftp_error)
    }

    async fn mkd<P: AsRef<Path> + Send + Debug>(&self, user: &SpaceUser, path: P) -> Result<()> {
        let (space, relative) = self.locate_item(user, path).await?;
        self.engine
            .mkdir(&user.identity, &space, &relative)
            .await
            .map(|_| ())
            .map_err(to_ftp_error)
    }

    async fn rename<P: AsRef<Path> + Send + Debug>(&self, user: &SpaceUser, from: P, to: P) -> Result<()> {
        let (src, src_rel) = self.locate_item(user, from).await?;
        let (dest, dest_rel) = self.locate_item(user, to).await?;
        self.engine
            .transfer_to(
                &user.identity,
                TransferKind::Move,
                &src,
                &src_rel,
                &dest,
                &dest_rel,
                ConflictPolicy::None,
            )
            .await
            .map(|_| ())
            .map_err(to_ftp_error)
    }

    async fn rmd<P: AsRef<Path> + Send + Debug>(&self, user: &SpaceUser, path: P) -> Result<()> {
        let (space, relative) = self.locate_item(user, path).await?;
        let entry = self
            .engine
            .stat(&user.identity, &space, &relative)
            .await
            .map_err(to_ftp_error)?;
        if !entry.is_dir {
            return Err(Error::new(
                ErrorKind::PermanentDirectoryNotAvailable,
                "not a directory",
            ));
        }
        self.engine
            .delete_one(&user.identity, &space, &relative)
            .await
            .map(|_| ())
            .map_err(to_ftp_error)
    }

    async fn cwd<P: AsRef<Path> + Send + Debug>(&self, user: &SpaceUser, path: P) -> Result<()> {
        let meta = self.metadata(user, path).await?;
        if meta.is_dir {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::PermanentDirectoryNotAvailable,
                "not a directory",
            ))
        }
    }
}

fn to_ftp_error(err: EngineError) -> Error {
    let kind = match &err {
        EngineError::AccessDenied(_) => ErrorKind::PermissionDenied,
        EngineError::NotFound(_) | EngineError::Conflict { .. } => ErrorKind::PermanentFileNotAvailable,
        EngineError::QuotaExceeded { .. } => ErrorKind::ExceededStorageAllocationError,
        EngineError::InvalidInput(_) => ErrorKind::FileNameNotAllowedError,
        EngineError::Cancelled => ErrorKind::TransientFileNotAvailable,
        _ => {
            error!("ftp operation failed: {}", err);
            ErrorKind::LocalError
        }
    };
    Error::new(kind, err)
}

#[derive(Debug, Clone)]
pub struct FtpMeta {
    len: u64,
    is_dir: bool,
    modified: SystemTime,
}

impl FtpMeta {
    fn directory(modified: SystemTime) -> Self {
        Self {
            len: 0,
            is_dir: true,
            modified,
        }
    }
}

impl From<&FileEntry> for FtpMeta {
    fn from(entry: &FileEntry) -> Self {
        Self {
            len: entry.size,
            is_dir: entry.is_dir,
            modified: entry
                .modified_at
                .map(SystemTime::from)
                .unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }
}

impl Metadata for FtpMeta {
    fn len(&self) -> u64 {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn is_file(&self) -> bool {
        !self.is_dir
    }

    fn is_symlink(&self) -> bool {
        false
    }

    fn modified(&self) -> Result<SystemTime> {
        Ok(self.modified)
    }

    fn gid(&self) -> u32 {
        0
    }

    fn uid(&self) -> u32 {
        0
    }

    fn links(&self) -> u64 {
        1
    }
}
