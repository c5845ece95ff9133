use thiserror::Error;

use crate::file::ClientId;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0}: no such file")]
    NotFound(String),

    #[error("{pathname}: permission denied for {client}")]
    PermissionDenied { pathname: String, client: ClientId },

    #[error("{0}: file already exists")]
    AlreadyExists(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The write would not fit even in an empty table. The file is dropped;
    /// `openers` had it open and `waiters` lists the clients whose queued
    /// lock requests are void.
    #[error("{pathname}: {size} bytes exceeds the storage limit of {limit} bytes")]
    TooLarge {
        pathname: String,
        size: u64,
        limit: u64,
        openers: Vec<ClientId>,
        waiters: Vec<ClientId>,
    },

    #[error("{pathname}: not opened by {client}")]
    NotOpen { pathname: String, client: ClientId },

    #[error("{pathname}: lock is neither held nor requested by {client}")]
    NotHolder { pathname: String, client: ClientId },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} mutex poisoned")]
    LockPoisoned(&'static str),
}
