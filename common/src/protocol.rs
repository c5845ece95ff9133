use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OpenFlags: u8 {
        /// Create the file; it stays private to the creator until the first write.
        const CREATE = 1;
        /// Take the exclusive lock as part of the open.
        const LOCK = 1 << 1;
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Request {
    OpenFile { pathname: String, flags: OpenFlags },
    ReadFile { pathname: String },
    /// Sample read of up to `n` files; `n <= 0` asks for as many as the server holds.
    ReadNFiles { n: i64 },
    WriteFile { pathname: String, data: Vec<u8> },
    AppendToFile { pathname: String, data: Vec<u8> },
    LockFile { pathname: String },
    UnlockFile { pathname: String },
    CloseFile { pathname: String },
    RemoveFile { pathname: String },
}

pub const OPERATIONS: [&str; 9] = [
    "openFile",
    "readFile",
    "readNFiles",
    "writeFile",
    "appendToFile",
    "lockFile",
    "unlockFile",
    "closeFile",
    "removeFile",
];

impl Request {
    /// Name sent in the frame that precedes the request body.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::OpenFile { .. } => "openFile",
            Request::ReadFile { .. } => "readFile",
            Request::ReadNFiles { .. } => "readNFiles",
            Request::WriteFile { .. } => "writeFile",
            Request::AppendToFile { .. } => "appendToFile",
            Request::LockFile { .. } => "lockFile",
            Request::UnlockFile { .. } => "unlockFile",
            Request::CloseFile { .. } => "closeFile",
            Request::RemoveFile { .. } => "removeFile",
        }
    }

    pub fn pathname(&self) -> Option<&str> {
        match self {
            Request::ReadNFiles { .. } => None,
            Request::OpenFile { pathname, .. }
            | Request::ReadFile { pathname }
            | Request::WriteFile { pathname, .. }
            | Request::AppendToFile { pathname, .. }
            | Request::LockFile { pathname }
            | Request::UnlockFile { pathname }
            | Request::CloseFile { pathname }
            | Request::RemoveFile { pathname } => Some(pathname),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    AlreadyRequested,
    CapacityExceeded,
    TooLarge,
    NotOpen,
    NotHolder,
    InvalidArgument,
    BadRequest,
    Internal,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::NotFound => "not found",
            Status::PermissionDenied => "permission denied",
            Status::AlreadyExists => "already exists",
            Status::AlreadyRequested => "already requested",
            Status::CapacityExceeded => "capacity exceeded",
            Status::TooLarge => "too large",
            Status::NotOpen => "not open",
            Status::NotHolder => "not lock holder",
            Status::InvalidArgument => "invalid argument",
            Status::BadRequest => "bad request",
            Status::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// A file shipped back to a client, either as a read result or because it
/// was evicted to make room for the client's write.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WireFile {
    pub pathname: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Data(Vec<u8>),
    Files(Vec<WireFile>),
    Evicted(Vec<WireFile>),
    Error { status: Status, message: String },
}

impl Response {
    pub fn error(status: Status, message: impl Into<String>) -> Self {
        Response::Error {
            status,
            message: message.into(),
        }
    }
}
