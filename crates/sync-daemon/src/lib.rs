//! sync-daemon library: the sync agent, exposed for integration tests.
//!
//! The binary in `main.rs` only parses arguments and sets up logging; all
//! behavior lives in these modules.

pub mod agent;
pub mod config;
pub mod link;
pub mod scan;
pub mod state;
pub mod watcher;

pub use agent::Agent;
pub use config::{Config, ConfigError};
pub use link::{LoginDenied, ServerLink};
pub use state::{ClientState, StateError, StateStore};
pub use watcher::FileWatcher;
