//! Wire protocol spoken between the file storage daemon and its clients.

pub mod client;
pub mod error;
pub mod frame;
pub mod protocol;

pub use client::{Connection, save_files};
pub use error::{ProtocolError, Result};
pub use protocol::{OpenFlags, Request, Response, Status, WireFile};
