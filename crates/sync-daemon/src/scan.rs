//! Startup rescan of the sync root.
//!
//! The watcher only reports what happens while the agent runs. At startup
//! every file on disk is reported as an update (unchanged files are discarded
//! by hash comparison) and every path whose recorded latest event is an
//! update but which is gone from disk is reported as a delete.

use crate::watcher::is_ignored;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use sync_core::fs_util::{absolute_path, relative_path};
use sync_core::{Event, LocalChange};
use tokio::fs;
use tracing::{debug, info};

/// Changes that happened while the agent was not running.
pub async fn scan(
    root: &Path,
    ignored: &[PathBuf],
    latest: &HashMap<String, Event>,
) -> io::Result<Vec<LocalChange>> {
    let mut changes = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_ignored(&path, ignored) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Some(relative) = relative_path(root, &path) {
                    seen.insert(relative);
                }
                changes.push(LocalChange::update(path));
            } else {
                debug!("Skipping non-regular file {}", path.display());
            }
        }
    }
    let found = changes.len();

    let mut vanished: Vec<_> = latest
        .iter()
        .filter(|(path, event)| event.is_update() && !seen.contains(*path))
        .filter_map(|(path, _)| absolute_path(root, path))
        .collect();
    vanished.sort();
    let deleted = vanished.len();
    changes.extend(vanished.into_iter().map(LocalChange::delete));

    info!(
        "Startup scan: {} files on disk, {} deleted while stopped",
        found, deleted
    );
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{ContentHash, EventType};
    use tempfile::TempDir;

    fn recorded(event_type: EventType, path: &str) -> (String, Event) {
        let mut event = Event::new(event_type, path);
        if event_type == EventType::Update {
            event.hash = Some(ContentHash::of_bytes(path.as_bytes()));
        }
        (path.to_string(), event)
    }

    #[tokio::test]
    async fn test_reports_files_and_vanished_paths() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("docs/deep")).unwrap();
        std::fs::write(root.join("top.txt"), b"1").unwrap();
        std::fs::write(root.join("docs/deep/note.md"), b"2").unwrap();

        let latest: HashMap<_, _> = [
            recorded(EventType::Update, "top.txt"),
            recorded(EventType::Update, "docs/gone.txt"),
            recorded(EventType::Delete, "already-deleted.txt"),
        ]
        .into_iter()
        .collect();

        let changes = scan(&root, &[], &latest).await.unwrap();
        let mut updates: Vec<_> = changes
            .iter()
            .filter(|c| c.event_type == EventType::Update)
            .map(|c| c.path.clone())
            .collect();
        updates.sort();
        assert_eq!(
            updates,
            vec![root.join("docs/deep/note.md"), root.join("top.txt")]
        );

        let deletes: Vec<_> = changes
            .iter()
            .filter(|c| c.event_type == EventType::Delete)
            .map(|c| c.path.clone())
            .collect();
        assert_eq!(deletes, vec![root.join("docs/gone.txt")]);
    }

    #[tokio::test]
    async fn test_ignored_dirs_are_not_scanned() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join(".cache")).unwrap();
        std::fs::write(root.join(".cache/abc"), b"blob").unwrap();
        std::fs::write(root.join("kept.txt"), b"x").unwrap();

        let changes = scan(&root, &[root.join(".cache")], &HashMap::new())
            .await
            .unwrap();
        assert_eq!(changes, vec![LocalChange::update(root.join("kept.txt"))]);
    }
}
