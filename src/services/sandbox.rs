//! Path sandbox: maps client paths onto real paths inside a space root.
//!
//! Every resolution joins the space root with the requested path, cleans the
//! result lexically and only then checks containment, so `..` sequences and
//! mixed separators cannot be used to walk out of the root. Existing path
//! prefixes are additionally canonicalized to catch symlinks that point
//! outside the space.
//!
//! The per-space trash directory and the engine's own scratch artifacts
//! (overwrite backups, partial uploads) are reserved names: regular
//! resolutions that touch them are rejected, only the trash subsystem reaches
//! them through [`resolve_internal`].

use crate::{models::space::Space, services::error::SandboxError};
use std::path::{Component, Path, PathBuf};

/// Hidden directory under each space root holding trashed content.
pub const TRASH_DIR_NAME: &str = ".spacefs-trash";
/// Prefix of the sibling a destination is parked under during an overwrite swap.
pub const BACKUP_PREFIX: &str = ".spacefs-backup-";
/// Prefix of in-flight uploads and copies before they are renamed into place.
pub const PARTIAL_PREFIX: &str = ".spacefs-partial-";

/// True for names owned by the engine and never exposed to clients.
pub fn is_reserved_name(name: &str) -> bool {
    name == TRASH_DIR_NAME || name.starts_with(BACKUP_PREFIX) || name.starts_with(PARTIAL_PREFIX)
}

/// Resolve a space-relative path for browse, download, upload and transfers.
pub fn resolve(space: &Space, relative: &str) -> Result<PathBuf, SandboxError> {
    resolve_in(space.root(), relative, false)
}

/// Resolve a space-relative path, allowing the reserved trash directory.
pub fn resolve_internal(space: &Space, relative: &str) -> Result<PathBuf, SandboxError> {
    resolve_in(space.root(), relative, true)
}

/// Absolute path of the trash directory of a space.
pub fn trash_dir(space: &Space) -> PathBuf {
    clean(space.root()).join(TRASH_DIR_NAME)
}

pub fn resolve_in(root: &Path, relative: &str, allow_reserved: bool) -> Result<PathBuf, SandboxError> {
    if relative.contains('\0') {
        return Err(SandboxError::Invalid(relative.escape_default().to_string()));
    }

    let unified = relative.replace('\\', "/");
    let trimmed = unified.trim_start_matches('/');
    let root_clean = clean(root);
    let joined = clean(&root_clean.join(trimmed));

    let inside = joined
        .strip_prefix(&root_clean)
        .map_err(|_| SandboxError::Escape(relative.to_string()))?;
    if matches!(inside.components().next(), Some(Component::ParentDir)) {
        return Err(SandboxError::Escape(relative.to_string()));
    }

    if !allow_reserved
        && inside
            .components()
            .any(|c| matches!(c, Component::Normal(s) if is_reserved_name(&s.to_string_lossy())))
    {
        return Err(SandboxError::Reserved(relative.to_string()));
    }

    ensure_no_symlink_escape(&root_clean, &joined, relative)?;
    Ok(joined)
}

/// Space-relative form (`/a/b`) of a real path that lies inside `root`.
pub fn to_relative(root: &Path, real: &Path) -> String {
    let root_clean = clean(root);
    let real_clean = clean(real);
    match real_clean.strip_prefix(&root_clean) {
        Ok(rest) => {
            let parts: Vec<String> = rest
                .components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();
            format!("/{}", parts.join("/"))
        }
        Err(_) => "/".to_string(),
    }
}

/// Normalize a client-facing relative path to `/a/b` form without touching disk.
pub fn normalize_relative(relative: &str) -> String {
    let unified = relative.replace('\\', "/");
    let cleaned = clean(&Path::new("/").join(unified.trim_start_matches('/')));
    to_relative(Path::new("/"), &cleaned)
}

/// A protocol path `/{space}/{relative...}` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPath {
    /// `None` for the root listing of spaces.
    pub space: Option<String>,
    /// Space-relative remainder, always starting with `/`.
    pub relative: String,
}

impl VirtualPath {
    pub fn parse(path: &str) -> Self {
        let normalized = normalize_relative(path);
        let mut parts = normalized.trim_start_matches('/').splitn(2, '/');
        match parts.next().filter(|s| !s.is_empty()) {
            None => VirtualPath {
                space: None,
                relative: "/".into(),
            },
            Some(space) => VirtualPath {
                space: Some(space.to_string()),
                relative: format!("/{}", parts.next().unwrap_or("")),
            },
        }
    }

    pub fn is_root(&self) -> bool {
        self.space.is_none()
    }

    pub fn is_space_root(&self) -> bool {
        self.space.is_some() && self.relative == "/"
    }
}

/// Validate a single path segment supplied as a new name.
pub fn validate_name(name: &str) -> Result<(), SandboxError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(SandboxError::Invalid(name.to_string()));
    }
    if is_reserved_name(name) {
        return Err(SandboxError::Reserved(name.to_string()));
    }
    Ok(())
}

/// True when `candidate` equals `ancestor` or lies beneath it.
pub fn is_within(ancestor: &Path, candidate: &Path) -> bool {
    clean(candidate).starts_with(clean(ancestor))
}

/// Lexical normalization: drops `.`, folds `..` into its parent, never climbs
/// above a filesystem root.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(s) => out.push(s),
        }
    }
    out
}

/// Canonicalize the deepest existing prefix of `joined` and make sure it is
/// still under the canonical root.
fn ensure_no_symlink_escape(root: &Path, joined: &Path, requested: &str) -> Result<(), SandboxError> {
    let Ok(canonical_root) = root.canonicalize() else {
        return Ok(());
    };

    let mut probe = joined.to_path_buf();
    loop {
        if probe.symlink_metadata().is_ok() {
            let canonical = probe
                .canonicalize()
                .map_err(|_| SandboxError::Escape(requested.to_string()))?;
            if !canonical.starts_with(&canonical_root) {
                return Err(SandboxError::Escape(requested.to_string()));
            }
            return Ok(());
        }
        if !probe.pop() || !probe.starts_with(root) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn space_at(root: &Path) -> Space {
        Space::for_tests(1, "docs", root, None)
    }

    #[test]
    fn traversal_sequences_are_rejected() {
        let dir = tempdir().unwrap();
        let space = space_at(dir.path());

        for attempt in [
            "..",
            "../etc/passwd",
            "/../../etc",
            "a/../../b",
            "a/b/../../../c",
            "..\\..\\windows",
            "./../x",
        ] {
            assert!(
                matches!(resolve(&space, attempt), Err(SandboxError::Escape(_))),
                "{attempt} should escape"
            );
        }
    }

    #[test]
    fn paths_inside_root_resolve_under_root() {
        let dir = tempdir().unwrap();
        let space = space_at(dir.path());
        fs::create_dir_all(dir.path().join("a/b")).unwrap();

        for ok in ["", "/", ".", "a", "/a/b", "a/./b/../b/file.txt", "a/../a", "new/dir"] {
            let resolved = resolve(&space, ok).unwrap();
            assert!(resolved.starts_with(dir.path()), "{ok} -> {resolved:?}");
        }
        assert_eq!(resolve(&space, "/").unwrap(), clean(dir.path()));
    }

    #[test]
    fn trash_directory_is_reserved_for_regular_access() {
        let dir = tempdir().unwrap();
        let space = space_at(dir.path());

        assert_eq!(
            resolve(&space, "/.spacefs-trash/x"),
            Err(SandboxError::Reserved("/.spacefs-trash/x".into()))
        );
        assert!(resolve(&space, "a/../.spacefs-trash").is_err());
        assert!(resolve_internal(&space, "/.spacefs-trash/x").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_pointing_outside_is_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        symlink(outside.path(), dir.path().join("link")).unwrap();
        let space = space_at(dir.path());

        assert!(matches!(
            resolve(&space, "link/secret.txt"),
            Err(SandboxError::Escape(_))
        ));
        assert!(matches!(resolve(&space, "link/new.txt"), Err(SandboxError::Escape(_))));
    }

    #[test]
    fn virtual_paths_split_into_space_and_relative() {
        assert!(VirtualPath::parse("/").is_root());
        assert!(VirtualPath::parse("").is_root());
        assert!(VirtualPath::parse("/docs/..").is_root());

        let vp = VirtualPath::parse("/docs/a/b.txt");
        assert_eq!(vp.space.as_deref(), Some("docs"));
        assert_eq!(vp.relative, "/a/b.txt");

        let vp = VirtualPath::parse("/docs");
        assert!(vp.is_space_root());

        let vp = VirtualPath::parse("/docs/../media/x");
        assert_eq!(vp.space.as_deref(), Some("media"));
        assert_eq!(vp.relative, "/x");
    }

    #[test]
    fn relative_form_of_real_paths() {
        let root = Path::new("/srv/space");
        assert_eq!(to_relative(root, Path::new("/srv/space")), "/");
        assert_eq!(to_relative(root, Path::new("/srv/space/a/b")), "/a/b");
        assert_eq!(normalize_relative("a//b/./c/.."), "/a/b");
    }

    #[test]
    fn names_must_be_single_segments() {
        assert!(validate_name("report (1).pdf").is_ok());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(TRASH_DIR_NAME).is_err());
    }
}
