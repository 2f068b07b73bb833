//! Agent configuration file.
//!
//! ```toml
//! [local]
//! sync_dir = "~/Sync"
//! cache_dir = "cache"          # optional, relative to the config file
//! tmp_dir = "tmp"              # optional; same filesystem as sync_dir
//! state_file = "state.json"    # optional
//!
//! [server]
//! url = "ws://sync.example.com:7340"
//! username = "alice"
//! password = "wonderland"
//!
//! [blobs]
//! dir = "/mnt/shared/blobs"
//!
//! [sync]
//! conflict_policy = "preserve_local"
//! op_timeout_secs = 30
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::state::partial_path;
use sync_core::{ConflictPolicy, Credentials, RetryConfig};
use thiserror::Error;

/// Directory holding the default config, state, cache and tmp dirs.
pub const CONFIG_DIR_NAME: &str = ".chainsync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Cannot locate the home directory")]
    NoHomeDir,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub local: LocalConfig,
    pub server: ServerConfig,
    pub blobs: BlobsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    /// Root of the synced tree
    pub sync_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// WebSocket URL of the sync server
    pub url: String,
    pub username: String,
    pub password: String,
}

impl ServerConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlobsConfig {
    /// Shared directory used as the content-addressed blob store
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub conflict_policy: ConflictPolicy,
    pub op_timeout_secs: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// 0 retries forever
    pub retry_max_attempts: u32,
    pub state_save_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            conflict_policy: ConflictPolicy::default(),
            op_timeout_secs: retry.op_timeout.as_secs(),
            retry_initial_ms: retry.initial_delay.as_millis() as u64,
            retry_max_ms: retry.max_delay.as_millis() as u64,
            retry_max_attempts: retry.max_attempts.unwrap_or(0),
            state_save_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            max_attempts: (self.retry_max_attempts > 0).then_some(self.retry_max_attempts),
            op_timeout: self.op_timeout(),
            ..RetryConfig::default()
        }
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs.max(1))
    }

    pub fn state_save_interval(&self) -> Duration {
        Duration::from_secs(self.state_save_secs.max(1))
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

impl Config {
    /// `~/.chainsync/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(CONFIG_DIR_NAME).join("config.toml"))
    }

    /// Read and resolve the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or(Path::new("."));
        Self::parse(&text, base).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse config text; relative paths resolve against `base` and a
    /// leading `~` against the home directory.
    pub fn parse(text: &str, base: &Path) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(text)?;
        for path in [
            &mut config.local.sync_dir,
            &mut config.local.cache_dir,
            &mut config.local.tmp_dir,
            &mut config.local.state_file,
            &mut config.blobs.dir,
        ] {
            *path = resolve(base, path);
        }
        Ok(config)
    }

    /// Create every directory the agent writes to.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        let local = &self.local;
        for dir in [&local.sync_dir, &local.cache_dir, &local.tmp_dir, &self.blobs.dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        if let Some(parent) = local.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Agent-owned paths that must never be synced, canonicalized so they
    /// compare against watcher paths. Call after [`Config::ensure_dirs`].
    pub fn ignored_paths(&self) -> Vec<PathBuf> {
        let local = &self.local;
        let partial_state = partial_path(&local.state_file);
        [
            &local.cache_dir,
            &local.tmp_dir,
            &local.state_file,
            &partial_state,
            &self.blobs.dir,
        ]
        .into_iter()
        .map(|p| canonical(p))
        .collect()
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Canonical form of `path`, falling back to its parent's canonical form for
/// files that do not exist yet.
pub fn canonical(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}
