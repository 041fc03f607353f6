//! Download artifacts: single files served in place, folders and
//! multi-selections zipped into a temporary file.

use crate::services::{error::EngineResult, fsops, sandbox};
use std::{
    collections::HashSet,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use tracing::debug;
use uuid::Uuid;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

/// Something ready to be streamed to a client.
#[derive(Clone, Debug)]
pub struct DownloadArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    /// Created for this download only and removed after use.
    pub temporary: bool,
}

pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Describe a regular file for download.
pub fn single_file(real: &Path) -> io::Result<DownloadArtifact> {
    let meta = fs::metadata(real)?;
    Ok(DownloadArtifact {
        path: real.to_path_buf(),
        file_name: real
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string()),
        content_type: content_type_for(real),
        size: meta.len(),
        temporary: false,
    })
}

/// Zip `items` (files or folders) into a fresh file under `scratch`.
///
/// Every item becomes a top-level entry named after its basename; items that
/// share a basename get `name (n).ext` entries. Reserved names are never
/// included and symlinks are skipped.
pub fn zip_paths(items: &[PathBuf], scratch: &Path, archive_name: &str) -> EngineResult<DownloadArtifact> {
    fs::create_dir_all(scratch)?;
    let out = scratch.join(format!("spacefs-{}.zip", Uuid::new_v4()));
    let result = write_zip(items, &out);
    if let Err(err) = result {
        let _ = fs::remove_file(&out);
        return Err(err);
    }

    let size = fs::metadata(&out)?.len();
    debug!(items = items.len(), size, "built zip {}", out.display());
    Ok(DownloadArtifact {
        path: out,
        file_name: archive_name.to_string(),
        content_type: "application/zip".to_string(),
        size,
        temporary: true,
    })
}

fn write_zip(items: &[PathBuf], out: &Path) -> EngineResult<()> {
    let mut zip = ZipWriter::new(File::create(out)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut taken = HashSet::new();
    let mut pending: Vec<(PathBuf, String)> = Vec::with_capacity(items.len());
    for item in items {
        let Some(name) = item.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let is_dir = item.is_dir();
        let mut entry = name.clone();
        let mut n = 0;
        while !taken.insert(entry.clone()) {
            n += 1;
            entry = fsops::numbered_name(&name, is_dir, n);
        }
        pending.push((item.clone(), entry));
    }

    while let Some((path, name)) = pending.pop() {
        let meta = path.symlink_metadata()?;
        if meta.file_type().is_symlink() {
            debug!("skipping symlink {}", path.display());
            continue;
        }
        if meta.is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
            for entry in fs::read_dir(&path)? {
                let entry = entry?;
                let child = entry.file_name().to_string_lossy().into_owned();
                if sandbox::is_reserved_name(&child) {
                    continue;
                }
                pending.push((entry.path(), format!("{}/{}", name, child)));
            }
        } else {
            zip.start_file(name, options)?;
            io::copy(&mut File::open(&path)?, &mut zip)?;
        }
    }

    zip.finish()?;
    Ok(())
}
