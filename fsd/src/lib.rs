//! File storage daemon: serves a [`libfilestore::StorageTable`] to TCP
//! clients speaking the `common` protocol.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod notifier;
pub mod server;
