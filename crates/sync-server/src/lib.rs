//! sync-server library: the event log server, exposed for integration tests.

pub mod persistence;
pub mod server;
pub mod users;

pub use persistence::FileEventLog;
pub use server::{REPLAY_BATCH, SyncServer};
pub use users::Users;
