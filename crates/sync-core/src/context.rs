//! Collaborators shared by the local and remote processors.

use crate::blob::BlobStore;
use crate::path_lock::PathLocks;
use crate::retry::RetryConfig;
use crate::shutdown::ShutdownBarrier;
use crate::stage::Stager;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct SyncContext {
    /// Root of the synced tree
    pub root: PathBuf,
    pub stager: Stager,
    pub blobs: Arc<dyn BlobStore>,
    pub locks: PathLocks,
    pub retry: RetryConfig,
    pub shutdown: ShutdownBarrier,
}
