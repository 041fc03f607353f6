//! Blocking filesystem primitives used by the transfer engine, the trash and
//! the quota tracker. Callers run these inside `spawn_blocking`.

use crate::{
    models::transfer::FileEntry,
    services::sandbox::{self, BACKUP_PREFIX, PARTIAL_PREFIX},
};
use chrono::{DateTime, Utc};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

const MAX_RENAME_ATTEMPTS: u32 = 10_000;

/// Returned by scans interrupted through their cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

pub fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Recursive on-disk size of a file or directory. Unreadable entries are skipped.
pub fn path_size(path: &Path) -> io::Result<u64> {
    let meta = path.symlink_metadata()?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    scan_size(path, &CancellationToken::new()).map_err(|_| io::Error::other("scan cancelled"))
}

/// Walk `root` summing file sizes. Checks `cancel` before every entry.
pub fn scan_size(root: &Path, cancel: &CancellationToken) -> Result<u64, Cancelled> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("skipping unreadable directory {}: {}", dir.display(), err);
                continue;
            }
        };
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let Ok(entry) = entry else { continue };
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total = total.saturating_add(meta.len());
            }
        }
    }
    Ok(total)
}

/// Remove a file, symlink or directory tree.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a file or directory tree to `dst`, which must not exist yet.
pub fn copy_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = src.symlink_metadata()?;
    if meta.is_dir() {
        fs::create_dir(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else if meta.file_type().is_symlink() {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("refusing to copy symlink {}", src.display()),
        ))
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

/// Hidden sibling used to assemble content before it is renamed into place.
pub fn partial_sibling(dst: &Path) -> PathBuf {
    sibling_with_prefix(dst, PARTIAL_PREFIX)
}

/// Hidden sibling a destination is parked under during an overwrite swap.
pub fn backup_sibling(dst: &Path) -> PathBuf {
    sibling_with_prefix(dst, BACKUP_PREFIX)
}

fn sibling_with_prefix(dst: &Path, prefix: &str) -> PathBuf {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{}{}", prefix, Uuid::new_v4().simple()))
}

/// Copy `src` to `dst` through a hidden partial sibling so `dst` never holds
/// half-written content. With `replace`, an existing `dst` is deleted just
/// before the finished copy is renamed over it.
pub fn copy_into_place(src: &Path, dst: &Path, replace: bool) -> io::Result<()> {
    let partial = partial_sibling(dst);
    if let Err(err) = copy_recursive(src, &partial) {
        discard(&partial);
        return Err(err);
    }
    if replace && exists(dst) {
        if let Err(err) = remove_path(dst) {
            discard(&partial);
            return Err(err);
        }
    }
    if let Err(err) = fs::rename(&partial, dst) {
        discard(&partial);
        return Err(err);
    }
    Ok(())
}

/// Rename `src` to `dst`, falling back to copy-then-delete across filesystems.
pub fn move_path(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            debug!(
                "rename {} -> {} crosses devices, copying",
                src.display(),
                dst.display()
            );
            copy_into_place(src, dst, false)?;
            remove_path(src)
        }
        Err(err) => Err(err),
    }
}

/// Replace `dst` with `src` without ever leaving `dst` missing on failure.
///
/// The destination is renamed aside to a hidden backup, the source is moved
/// onto the destination path, and the backup is deleted. If the second step
/// fails the backup is renamed back before the error is returned.
pub fn swap_into_place(src: &Path, dst: &Path) -> io::Result<()> {
    src.symlink_metadata()?;

    let backup = backup_sibling(dst);
    fs::rename(dst, &backup)?;

    match move_path(src, dst) {
        Ok(()) => {
            if let Err(err) = remove_path(&backup) {
                warn!(
                    "overwrite of {} succeeded but backup {} could not be removed: {}",
                    dst.display(),
                    backup.display(),
                    err
                );
            }
            Ok(())
        }
        Err(err) => {
            if let Err(restore_err) = fs::rename(&backup, dst) {
                error!(
                    "failed to restore {} from backup {}: {}",
                    dst.display(),
                    backup.display(),
                    restore_err
                );
            }
            Err(err)
        }
    }
}

/// First free `name (n).ext` sibling of `dst`. Directories keep their whole
/// name as the stem.
pub fn unique_destination(dst: &Path, is_dir: bool) -> io::Result<PathBuf> {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for n in 1..=MAX_RENAME_ATTEMPTS {
        let candidate = parent.join(numbered_name(&file_name, is_dir, n));
        if !exists(&candidate) {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name found for {}", dst.display()),
    ))
}

/// `name (n).ext`, or `name (n)` for directories and extensionless names.
pub fn numbered_name(name: &str, is_dir: bool, n: u32) -> String {
    let path = Path::new(name);
    let ext = path.extension().filter(|_| !is_dir);
    match (ext, path.file_stem()) {
        (Some(ext), Some(stem)) => format!(
            "{} ({}).{}",
            stem.to_string_lossy(),
            n,
            ext.to_string_lossy()
        ),
        _ => format!("{} ({})", name, n),
    }
}

/// Create the missing ancestors of `path`. Returns the outermost directory
/// that had to be created, so a failed caller can undo it.
pub fn create_parents(path: &Path) -> io::Result<Option<PathBuf>> {
    let Some(parent) = path.parent() else {
        return Ok(None);
    };
    let mut created = None;
    let mut dir = parent;
    while !exists(dir) {
        created = Some(dir.to_path_buf());
        match dir.parent() {
            Some(up) => dir = up,
            None => break,
        }
    }
    fs::create_dir_all(parent)?;
    Ok(created)
}

/// Remove empty ancestors of `path`, innermost first, stopping after `top`.
pub fn prune_empty_parents(path: &Path, top: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if !current.starts_with(top) || fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

/// Describe one real path as a client-facing entry relative to `root`.
pub fn entry_for(root: &Path, path: &Path) -> io::Result<FileEntry> {
    let meta = path.symlink_metadata()?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    Ok(FileEntry {
        name,
        path: sandbox::to_relative(root, path),
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}

/// Entries of a directory, reserved names hidden, directories first.
pub fn list_dir(root: &Path, dir: &Path) -> io::Result<Vec<FileEntry>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if sandbox::is_reserved_name(&name) {
            continue;
        }
        match entry_for(root, &entry.path()) {
            Ok(item) => out.push(item),
            Err(err) => debug!("skipping {}: {}", entry.path().display(), err),
        }
    }
    out.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(out)
}

/// Case-insensitive name search under `start`, skipping reserved entries and
/// unreadable subtrees.
pub fn search(
    root: &Path,
    start: &Path,
    query: &str,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<FileEntry>, Cancelled> {
    let needle = query.to_lowercase();
    let mut found = Vec::new();
    let mut pending = vec![start.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let Ok(entry) = entry else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            if sandbox::is_reserved_name(&name) {
                continue;
            }
            let path = entry.path();
            let is_dir = path.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false);
            if name.to_lowercase().contains(&needle) {
                if let Ok(item) = entry_for(root, &path) {
                    found.push(item);
                    if found.len() >= limit {
                        return Ok(found);
                    }
                }
            }
            if is_dir {
                pending.push(path);
            }
        }
    }
    Ok(found)
}

fn discard(path: &Path) {
    if exists(path) {
        if let Err(err) = remove_path(path) {
            warn!("failed to remove partial {}: {}", path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn created_parents_can_be_pruned_again() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("keep")).unwrap();
        let target = dir.path().join("keep/x/y/z.txt");

        let top = create_parents(&target).unwrap().unwrap();
        assert_eq!(top, dir.path().join("keep/x"));
        assert!(dir.path().join("keep/x/y").is_dir());
        assert_eq!(create_parents(&target).unwrap(), None);

        prune_empty_parents(&target, &top);
        assert!(!dir.path().join("keep/x").exists());
        assert!(dir.path().join("keep").is_dir());
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn unique_destination_appends_counter_before_extension() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("report.pdf");
        fs::write(&dst, "v0").unwrap();
        fs::write(dir.path().join("report (1).pdf"), "v1").unwrap();

        let next = unique_destination(&dst, false).unwrap();
        assert_eq!(next, dir.path().join("report (2).pdf"));

        let folder = dir.path().join("photos.2024");
        fs::create_dir(&folder).unwrap();
        assert_eq!(
            unique_destination(&folder, true).unwrap(),
            dir.path().join("photos.2024 (1)")
        );
    }

    #[test]
    fn swap_replaces_destination_and_drops_backup() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("new.txt");
        let dst = dir.path().join("old.txt");
        fs::write(&src, "fresh").unwrap();
        fs::write(&dst, "stale").unwrap();

        swap_into_place(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(&dst).unwrap(), "fresh");
        assert!(!src.exists());
        assert_eq!(names_in(dir.path()), vec!["old.txt".to_string()]);
    }

    #[test]
    fn swap_with_missing_source_keeps_destination() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("keep.txt");
        fs::write(&dst, "precious").unwrap();

        let err = swap_into_place(&dir.path().join("ghost.txt"), &dst).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "precious");
        assert_eq!(names_in(dir.path()), vec!["keep.txt".to_string()]);
    }

    #[test]
    fn copy_into_place_copies_trees_without_leftovers() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/a.txt"), "a").unwrap();
        let dst = dir.path().join("dst");

        copy_into_place(&src, &dst, false).unwrap();

        assert_eq!(fs::read_to_string(dst.join("nested/a.txt")).unwrap(), "a");
        assert_eq!(names_in(dir.path()), vec!["dst".to_string(), "src".to_string()]);
        assert_eq!(path_size(&dst).unwrap(), 1);
    }

    #[test]
    fn listing_hides_reserved_entries() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(sandbox::TRASH_DIR_NAME)).unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let entries = list_dir(dir.path(), dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a.txt"]);
        assert_eq!(entries[1].path, "/a.txt");
    }

    #[test]
    fn scans_stop_when_cancelled() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), "1234").unwrap();
        let token = CancellationToken::new();
        assert_eq!(scan_size(dir.path(), &token), Ok(4));
        token.cancel();
        assert_eq!(scan_size(dir.path(), &token), Err(Cancelled));
        assert_eq!(
            search(dir.path(), dir.path(), "a", 10, &token),
            Err(Cancelled)
        );
    }
}
