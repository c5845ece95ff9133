//! Storage engine for the file storage daemon.
//!
//! Files live in server memory and are addressed by pathname. A file is first
//! staged by its creator, becomes visible to other clients on commit, and is
//! evicted in least-recently-used order when the table runs out of room.

pub mod config;
pub mod error;
pub mod file;
pub mod links;
pub mod queue;
pub mod staging;
pub mod table;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use file::{ClientId, FileEntry, FileSnapshot, LockOutcome, OpenOutcome, RemovedFile};
pub use table::{FileStatus, LockGrant, StorageTable, StoreStats};
