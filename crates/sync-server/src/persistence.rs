//! Durable event log stored as JSON lines.
//!
//! One event per line, in id order. The whole log is loaded on open and new
//! events are appended and synced before they are acknowledged, so ids keep
//! counting from where they left off after a restart.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use sync_core::event_log::{self, EventLog, LogError, SUBSCRIBER_BUFFER, slice_range, stamp};
use sync_core::Event;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

struct LogState {
    file: File,
    events: Vec<Event>,
    /// Byte length of the durable records
    committed: u64,
    poisoned: bool,
}

pub struct FileEventLog {
    path: PathBuf,
    state: Mutex<LogState>,
    appended: broadcast::Sender<Event>,
}

impl FileEventLog {
    /// Open the log at `path`, creating it if needed.
    ///
    /// A final line cut short by a crash is dropped; any other unreadable
    /// line is an error.
    pub async fn open(path: impl Into<PathBuf>) -> event_log::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let (events, valid_len) = parse_log(&contents)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if valid_len < contents.len() {
            warn!(
                "Dropping {} bytes of incomplete record at the end of {}",
                contents.len() - valid_len,
                path.display()
            );
            file.set_len(valid_len as u64).await?;
        }

        info!("Loaded {} events from {}", events.len(), path.display());
        let (appended, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let state = LogState {
            file,
            events,
            committed: valid_len as u64,
            poisoned: false,
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
            appended,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cut the file back to its durable records after a failed append and
    /// reopen the append handle.
    async fn roll_back(&self, state: &mut LogState) -> std::io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(state.committed).await?;
        file.sync_data().await?;
        state.file = OpenOptions::new().append(true).open(&self.path).await?;
        Ok(())
    }

    /// Receive every event appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.appended.subscribe()
    }
}

/// Parse log contents, returning the events and the byte length of the
/// well-formed prefix.
fn parse_log(contents: &str) -> event_log::Result<(Vec<Event>, usize)> {
    let mut events = Vec::new();
    let mut offset = 0;

    for (index, line) in contents.split_inclusive('\n').enumerate() {
        let complete = line.ends_with('\n');
        let record = line.trim();
        if record.is_empty() {
            offset += line.len();
            continue;
        }

        let event: Event = match serde_json::from_str(record) {
            Ok(event) => event,
            Err(_) if !complete => break,
            Err(source) => {
                return Err(LogError::Corrupt {
                    line: index + 1,
                    source,
                });
            }
        };

        let expected = events.len() as u64 + 1;
        if event.id != Some(expected) {
            return Err(LogError::OutOfOrder {
                line: index + 1,
                expected,
                found: event.id,
            });
        }
        events.push(event);
        offset += line.len();
    }

    Ok((events, offset))
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn append(&self, event: Event) -> event_log::Result<Event> {
        let mut state = self.state.lock().await;
        if state.poisoned {
            return Err(LogError::Poisoned);
        }
        let stored = stamp(event, state.events.len() as u64 + 1)?;

        let mut line = serde_json::to_string(&stored).expect("Event serialization should not fail");
        line.push('\n');
        // Write errors surface on flush, not on sync_data
        let written = async {
            state.file.write_all(line.as_bytes()).await?;
            state.file.flush().await?;
            state.file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            warn!("Failed to append to {}: {}", self.path.display(), e);
            if let Err(rollback) = self.roll_back(&mut state).await {
                error!(
                    "Failed to roll back {}: {}; refusing further appends",
                    self.path.display(),
                    rollback
                );
                state.poisoned = true;
            }
            return Err(e.into());
        }

        state.committed += line.len() as u64;
        state.events.push(stored.clone());
        // No subscribers is fine
        let _ = self.appended.send(stored.clone());
        Ok(stored)
    }

    async fn retrieve_range(&self, first_id: u64, max: usize) -> event_log::Result<Vec<Event>> {
        Ok(slice_range(&self.state.lock().await.events, first_id, max))
    }

    async fn last_id(&self) -> u64 {
        self.state.lock().await.events.len() as u64
    }
}
