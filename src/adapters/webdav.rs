//! WebDAV mount at `/webdav`.
//!
//! A fresh [`SpaceDavFs`] is built per request around the authenticated
//! caller, so every filesystem call goes through the engine's permission
//! gate. The collection root lists the spaces the caller can read; space
//! roots themselves cannot be created, removed or renamed.
//!
//! `dav-server` enforces the `Overwrite` header before it calls `rename` or
//! `copy` (a refused overwrite never reaches the filesystem), so both use the
//! `overwrite` conflict policy.

use crate::{
    handlers::auth::authenticate,
    models::{
        permission::{Identity, Permission},
        space::Space,
        transfer::{ConflictCode, ConflictPolicy, FileEntry},
    },
    services::{
        engine::{Resolved, SpaceEngine},
        error::EngineError,
        transfer::{TransferKind, UploadBegin, UploadSlot},
    },
};
use axum::{
    Extension,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use bytes::{Buf, Bytes};
use dav_server::{
    DavConfig, DavHandler,
    davpath::DavPath,
    fakels::FakeLs,
    fs::{
        DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError, FsFuture, FsResult, FsStream,
        OpenOptions, ReadDirMeta,
    },
};
use futures::{FutureExt, future, stream};
use std::{io::SeekFrom, sync::Arc, time::SystemTime};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::{debug, error};

pub const MOUNT: &str = "/webdav";

/// Shared handler; the filesystem is supplied per request.
pub fn dav_handler() -> Arc<DavHandler> {
    Arc::new(
        DavHandler::builder()
            .strip_prefix(MOUNT)
            .locksystem(FakeLs::new())
            .build_handler(),
    )
}

/// Axum entry point for `/webdav` and `/webdav/{*path}`.
pub async fn webdav(
    State(engine): State<SpaceEngine>,
    Extension(dav): Extension<Arc<DavHandler>>,
    req: Request,
) -> Response {
    let identity = match authenticate(req.headers(), &engine).await {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };
    debug!(user = %identity, method = %req.method(), uri = %req.uri(), "webdav request");
    let fs = SpaceDavFs::new(engine, identity);
    dav.handle_with(DavConfig::new().filesystem(Box::new(fs)), req)
        .await
        .into_response()
}

#[derive(Clone)]
pub struct SpaceDavFs {
    engine: SpaceEngine,
    identity: Identity,
}

impl SpaceDavFs {
    pub fn new(engine: SpaceEngine, identity: Identity) -> Self {
        Self { engine, identity }
    }

    async fn locate(&self, path: &DavPath) -> FsResult<Resolved> {
        let virtual_path = format!("/{}", path.as_rel_ospath().to_string_lossy());
        self.engine
            .locate(&self.identity, &virtual_path)
            .await
            .map_err(to_fs_error)
    }

    /// Locate a path below a space root; anything at or above a space root is refused.
    async fn locate_item(&self, path: &DavPath) -> FsResult<(Space, String)> {
        match self.locate(path).await? {
            Resolved::Entry { space, relative } if relative != "/" => Ok((space, relative)),
            _ => Err(FsError::Forbidden),
        }
    }
}

impl DavFileSystem for SpaceDavFs {
    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>> {
        async move {
            let (space, relative) = self.locate_item(path).await?;
            if options.write || options.append || options.create || options.create_new {
                if options.append {
                    return Err(FsError::NotImplemented);
                }
                let policy = if options.create_new {
                    ConflictPolicy::None
                } else {
                    ConflictPolicy::Overwrite
                };
                let begin = self
                    .engine
                    .open_write(&self.identity, &space, &relative, policy, options.size)
                    .await
                    .map_err(to_fs_error)?;
                return match begin {
                    UploadBegin::Ready(slot) => Ok(Box::new(WriteFile { slot: Some(slot) }) as Box<dyn DavFile>),
                    UploadBegin::Skipped(_) => Err(FsError::Exists),
                };
            }

            let (file, entry) = self
                .engine
                .open_read(&self.identity, &space, &relative)
                .await
                .map_err(to_fs_error)?;
            Ok(Box::new(ReadFile {
                file,
                meta: EntryMeta::from(&entry),
            }) as Box<dyn DavFile>)
        }
        .boxed()
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        _meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        async move {
            let entries: Vec<DirEntry> = match self.locate(path).await? {
                Resolved::Root => self
                    .engine
                    .spaces_for(&self.identity, Permission::Read)
                    .await
                    .map_err(to_fs_error)?
                    .into_iter()
                    .map(|space| DirEntry {
                        meta: EntryMeta {
                            len: 0,
                            modified: Some(space.updated_at.unwrap_or(space.created_at).into()),
                            is_dir: true,
                        },
                        name: space.name,
                    })
                    .collect(),
                Resolved::Entry { space, relative } => self
                    .engine
                    .list(&self.identity, &space, &relative)
                    .await
                    .map_err(to_fs_error)?
                    .iter()
                    .map(|entry| DirEntry {
                        name: entry.name.clone(),
                        meta: EntryMeta::from(entry),
                    })
                    .collect(),
            };
            let stream: FsStream<Box<dyn DavDirEntry>> = Box::pin(stream::iter(
                entries
                    .into_iter()
                    .map(|entry| Ok(Box::new(entry) as Box<dyn DavDirEntry>)),
            ));
            Ok(stream)
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move {
            let meta = match self.locate(path).await? {
                Resolved::Root => EntryMeta {
                    len: 0,
                    modified: Some(SystemTime::now()),
                    is_dir: true,
                },
                Resolved::Entry { space, relative } => EntryMeta::from(
                    &self
                        .engine
                        .stat(&self.identity, &space, &relative)
                        .await
                        .map_err(to_fs_error)?,
                ),
            };
            Ok(Box::new(meta) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            let (space, relative) = self.locate_item(path).await?;
            self.engine
                .mkdir(&self.identity, &space, &relative)
                .await
                .map_err(to_fs_error)?;
            Ok(())
        }
        .boxed()
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        self.remove_file(path)
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            let (space, relative) = self.locate_item(path).await?;
            self.engine
                .delete_one(&self.identity, &space, &relative)
                .await
                .map_err(to_fs_error)?;
            Ok(())
        }
        .boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        self.transfer(TransferKind::Move, from, to)
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        self.transfer(TransferKind::Copy, from, to)
    }
}

impl SpaceDavFs {
    fn transfer<'a>(&'a self, kind: TransferKind, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            let (src, src_rel) = self.locate_item(from).await?;
            let (dest, dest_rel) = self.locate_item(to).await?;
            self.engine
                .transfer_to(
                    &self.identity,
                    kind,
                    &src,
                    &src_rel,
                    &dest,
                    &dest_rel,
                    ConflictPolicy::Overwrite,
                )
                .await
                .map_err(to_fs_error)?;
            Ok(())
        }
        .boxed()
    }
}

fn to_fs_error(err: EngineError) -> FsError {
    match err {
        EngineError::AccessDenied(_) | EngineError::InvalidInput(_) => FsError::Forbidden,
        EngineError::NotFound(_) => FsError::NotFound,
        EngineError::Conflict {
            code: ConflictCode::DestinationExists,
            ..
        } => FsError::Exists,
        EngineError::Conflict { .. } => FsError::Forbidden,
        EngineError::QuotaExceeded { .. } => FsError::InsufficientStorage,
        other => {
            error!("webdav operation failed: {}", other);
            FsError::GeneralFailure
        }
    }
}

#[derive(Clone, Debug)]
struct EntryMeta {
    len: u64,
    modified: Option<SystemTime>,
    is_dir: bool,
}

impl From<&FileEntry> for EntryMeta {
    fn from(entry: &FileEntry) -> Self {
        Self {
            len: entry.size,
            modified: entry.modified_at.map(SystemTime::from),
            is_dir: entry.is_dir,
        }
    }
}

impl DavMetaData for EntryMeta {
    fn len(&self) -> u64 {
        self.len
    }

    fn modified(&self) -> FsResult<SystemTime> {
        self.modified.ok_or(FsError::GeneralFailure)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }
}

struct DirEntry {
    name: String,
    meta: EntryMeta,
}

impl DavDirEntry for DirEntry {
    fn name(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }

    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        future::ready(Ok(Box::new(self.meta.clone()) as Box<dyn DavMetaData>)).boxed()
    }
}

#[derive(Debug)]
struct ReadFile {
    file: File,
    meta: EntryMeta,
}

impl DavFile for ReadFile {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        future::ready(Ok(Box::new(self.meta.clone()) as Box<dyn DavMetaData>)).boxed()
    }

    fn write_buf(&mut self, _buf: Box<dyn Buf + Send>) -> FsFuture<'_, ()> {
        future::ready(Err(FsError::Forbidden)).boxed()
    }

    fn write_bytes(&mut self, _buf: Bytes) -> FsFuture<'_, ()> {
        future::ready(Err(FsError::Forbidden)).boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes> {
        async move {
            let mut buf = vec![0u8; count];
            let mut filled = 0;
            while filled < count {
                let n = self
                    .file
                    .read(&mut buf[filled..])
                    .await
                    .map_err(|_| FsError::GeneralFailure)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        }
        .boxed()
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<'_, u64> {
        async move { self.file.seek(pos).await.map_err(|_| FsError::GeneralFailure) }.boxed()
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        future::ready(Ok(())).boxed()
    }
}

/// A `PUT` in progress; committed on `flush`.
#[derive(Debug)]
struct WriteFile {
    slot: Option<UploadSlot>,
}

impl WriteFile {
    fn slot(&mut self) -> FsResult<&mut UploadSlot> {
        self.slot.as_mut().ok_or(FsError::GeneralFailure)
    }
}

impl DavFile for WriteFile {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let len = self.slot.as_ref().map(UploadSlot::written).unwrap_or(0);
        future::ready(Ok(Box::new(EntryMeta {
            len,
            modified: Some(SystemTime::now()),
            is_dir: false,
        }) as Box<dyn DavMetaData>))
        .boxed()
    }

    fn write_buf(&mut self, mut buf: Box<dyn Buf + Send>) -> FsFuture<'_, ()> {
        let bytes = buf.copy_to_bytes(buf.remaining());
        self.write_bytes(bytes)
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()> {
        async move { self.slot()?.write(&buf).await.map_err(to_fs_error) }.boxed()
    }

    fn read_bytes(&mut self, _count: usize) -> FsFuture<'_, Bytes> {
        future::ready(Err(FsError::NotImplemented)).boxed()
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<'_, u64> {
        let written = self.slot.as_ref().map(UploadSlot::written).unwrap_or(0);
        let result = match pos {
            SeekFrom::Current(0) | SeekFrom::End(0) => Ok(written),
            _ => Err(FsError::NotImplemented),
        };
        future::ready(result).boxed()
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        async move {
            if let Some(slot) = self.slot.take() {
                slot.commit().await.map_err(to_fs_error)?;
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::engine::tests::world;
    use std::fs;

    fn dav(path: &str) -> DavPath {
        DavPath::new(path).unwrap()
    }

    fn write_options() -> OpenOptions {
        OpenOptions {
            write: true,
            create: true,
            truncate: true,
            ..OpenOptions::default()
        }
    }

    #[tokio::test]
    async fn put_is_invisible_until_flushed() {
        let w = world().await;
        let dav_fs = SpaceDavFs::new(w.engine.clone(), w.alice.clone());

        let mut file = dav_fs.open(&dav("/docs/new.txt"), write_options()).await.unwrap();
        file.write_bytes(Bytes::from_static(b"dav body")).await.unwrap();
        assert!(!w.docs.root().join("new.txt").exists());

        file.flush().await.unwrap();
        assert_eq!(fs::read_to_string(w.docs.root().join("new.txt")).unwrap(), "dav body");
    }

    #[tokio::test]
    async fn space_roots_and_read_only_spaces_are_forbidden() {
        let w = world().await;
        let dav_fs = SpaceDavFs::new(w.engine.clone(), w.alice.clone());

        assert!(matches!(dav_fs.create_dir(&dav("/")).await, Err(FsError::Forbidden)));
        assert!(matches!(dav_fs.remove_dir(&dav("/docs")).await, Err(FsError::Forbidden)));
        assert!(matches!(
            dav_fs.open(&dav("/media/x.txt"), write_options()).await,
            Err(FsError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn delete_goes_to_trash_and_move_overwrites() {
        let w = world().await;
        fs::write(w.docs.root().join("a.txt"), "a").unwrap();
        fs::write(w.docs.root().join("b.txt"), "b").unwrap();
        let dav_fs = SpaceDavFs::new(w.engine.clone(), w.alice.clone());

        dav_fs.rename(&dav("/docs/a.txt"), &dav("/docs/b.txt")).await.unwrap();
        assert_eq!(fs::read_to_string(w.docs.root().join("b.txt")).unwrap(), "a");

        dav_fs.remove_file(&dav("/docs/b.txt")).await.unwrap();
        assert!(!w.docs.root().join("b.txt").exists());
        assert_eq!(w.engine.trash_list(&w.alice, &w.docs).await.unwrap().len(), 1);
    }
}
