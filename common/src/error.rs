use std::io;

use thiserror::Error;

use crate::protocol::Status;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode or decode a frame: {0}")]
    Codec(#[from] bincode::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("unknown operation {0:?}")]
    UnknownOperation(String),

    #[error("operation frame says {announced} but the body is {actual}")]
    OperationMismatch {
        announced: String,
        actual: &'static str,
    },

    #[error("server replied {status}: {message}")]
    Server { status: Status, message: String },

    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("gave up connecting to {addr} after {attempts} attempt(s): {source}")]
    ConnectTimeout {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

impl ProtocolError {
    /// Status carried by a server-side failure, if this is one.
    pub fn status(&self) -> Option<Status> {
        match self {
            ProtocolError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
