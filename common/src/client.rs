use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::SinkExt;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep};

use crate::error::{ProtocolError, Result};
use crate::frame::{Transport, recv_response, send_request, transport};
use crate::protocol::{OpenFlags, Request, Response, WireFile};

/// A client session with the file storage daemon.
///
/// Requests are answered in order. `lock_file` may wait for as long as another
/// client holds the lock.
pub struct Connection {
    addr: String,
    transport: Transport<TcpStream>,
}

impl Connection {
    /// Connects to `addr`, retrying every `retry_interval` until `deadline`
    /// has passed since the first attempt.
    pub async fn open(addr: &str, retry_interval: Duration, deadline: Duration) -> Result<Self> {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!("connected to {addr} after {attempts} attempt(s)");
                    return Ok(Self {
                        addr: addr.to_string(),
                        transport: transport(stream),
                    });
                }
                Err(e) if started.elapsed() + retry_interval <= deadline => {
                    debug!("connect to {addr} failed ({e}), retrying in {retry_interval:?}");
                    sleep(retry_interval).await;
                }
                Err(source) => {
                    return Err(ProtocolError::ConnectTimeout {
                        addr: addr.to_string(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        send_request(&mut self.transport, &request).await?;
        match recv_response(&mut self.transport).await? {
            Some(Response::Error { status, message }) => {
                Err(ProtocolError::Server { status, message })
            }
            Some(response) => Ok(response),
            None => Err(ProtocolError::Closed),
        }
    }

    async fn expect_ok(&mut self, request: Request) -> Result<()> {
        let op = request.op_name();
        match self.call(request).await? {
            Response::Ok => Ok(()),
            _ => Err(ProtocolError::UnexpectedResponse(op)),
        }
    }

    async fn expect_evicted(&mut self, request: Request, save_dir: Option<&Path>) -> Result<Vec<WireFile>> {
        let op = request.op_name();
        let evicted = match self.call(request).await? {
            Response::Ok => Vec::new(),
            Response::Evicted(files) => files,
            _ => return Err(ProtocolError::UnexpectedResponse(op)),
        };
        if let Some(dir) = save_dir
            && !evicted.is_empty()
        {
            save_files(dir, &evicted).await?;
        }
        Ok(evicted)
    }

    pub async fn open_file(&mut self, pathname: &str, flags: OpenFlags) -> Result<()> {
        self.expect_ok(Request::OpenFile {
            pathname: pathname.to_string(),
            flags,
        })
        .await
    }

    pub async fn read_file(&mut self, pathname: &str) -> Result<Vec<u8>> {
        match self
            .call(Request::ReadFile {
                pathname: pathname.to_string(),
            })
            .await?
        {
            Response::Data(content) => Ok(content),
            _ => Err(ProtocolError::UnexpectedResponse("readFile")),
        }
    }

    /// Reads up to `n` files (`n <= 0` for as many as the server allows).
    pub async fn read_n_files(&mut self, n: i64, save_dir: Option<&Path>) -> Result<Vec<WireFile>> {
        let files = match self.call(Request::ReadNFiles { n }).await? {
            Response::Files(files) => files,
            _ => return Err(ProtocolError::UnexpectedResponse("readNFiles")),
        };
        if let Some(dir) = save_dir {
            save_files(dir, &files).await?;
        }
        Ok(files)
    }

    /// First write of a file created with `CREATE | LOCK`. Returns the files
    /// evicted to make room for it.
    pub async fn write_file(
        &mut self,
        pathname: &str,
        data: &[u8],
        save_dir: Option<&Path>,
    ) -> Result<Vec<WireFile>> {
        self.expect_evicted(
            Request::WriteFile {
                pathname: pathname.to_string(),
                data: data.to_vec(),
            },
            save_dir,
        )
        .await
    }

    pub async fn append_to_file(
        &mut self,
        pathname: &str,
        data: &[u8],
        save_dir: Option<&Path>,
    ) -> Result<Vec<WireFile>> {
        self.expect_evicted(
            Request::AppendToFile {
                pathname: pathname.to_string(),
                data: data.to_vec(),
            },
            save_dir,
        )
        .await
    }

    /// Returns once the lock is held.
    pub async fn lock_file(&mut self, pathname: &str) -> Result<()> {
        self.expect_ok(Request::LockFile {
            pathname: pathname.to_string(),
        })
        .await
    }

    pub async fn unlock_file(&mut self, pathname: &str) -> Result<()> {
        self.expect_ok(Request::UnlockFile {
            pathname: pathname.to_string(),
        })
        .await
    }

    pub async fn close_file(&mut self, pathname: &str) -> Result<()> {
        self.expect_ok(Request::CloseFile {
            pathname: pathname.to_string(),
        })
        .await
    }

    pub async fn remove_file(&mut self, pathname: &str) -> Result<()> {
        self.expect_ok(Request::RemoveFile {
            pathname: pathname.to_string(),
        })
        .await
    }

    /// Ends the session. The server releases everything still held.
    pub async fn close(mut self) -> Result<()> {
        SinkExt::<bytes::Bytes>::close(&mut self.transport).await?;
        debug!("closed connection to {}", self.addr);
        Ok(())
    }
}

/// Local file name for a stored pathname: separators become `_`.
pub fn flatten_pathname(pathname: &str) -> String {
    let flat: String = pathname
        .trim_start_matches('/')
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    match flat.as_str() {
        "" | "." | ".." => format!("_{flat}"),
        _ => flat,
    }
}

/// Writes each file under `dir`, creating it if needed. Returns the paths
/// written.
pub async fn save_files(dir: &Path, files: &[WireFile]) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let target = dir.join(flatten_pathname(&file.pathname));
        if let Err(e) = tokio::fs::write(&target, &file.content).await {
            warn!("failed to save {} to {}: {e}", file.pathname, target.display());
            return Err(e.into());
        }
        written.push(target);
    }
    Ok(written)
}
