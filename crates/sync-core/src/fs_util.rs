//! Small filesystem helpers shared by the processors.

use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

pub fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

/// Mode bits of a file (0 where the platform has none).
pub fn permissions_of(metadata: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if metadata.permissions().readonly() { 0o444 } else { 0o644 }
    }
}

/// Apply mode bits to a file.
pub async fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path).await?.permissions();
        perms.set_readonly(mode & 0o222 == 0);
        fs::set_permissions(path, perms).await
    }
}

/// Turn an absolute path under `root` into the slash-separated relative form
/// used on the wire. Returns `None` for paths outside the root.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Resolve a wire path against `root`, refusing anything that would escape it.
pub fn absolute_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    let mut pushed = false;
    for part in relative.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part if Path::new(part).is_absolute() => return None,
            part => {
                path.push(part);
                pushed = true;
            }
        }
    }
    pushed.then_some(path)
}

/// Remove `dir` and then each parent in turn while they are empty, stopping at
/// (and never removing) `root`.
pub async fn remove_empty_ancestors(dir: &Path, root: &Path) {
    let mut current = Some(dir);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails on non-empty or missing directories, which ends the walk
        if fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}
