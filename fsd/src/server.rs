use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use common::error::ProtocolError;
use common::frame::{recv_request, send_response, transport};
use common::protocol::{Response, Status};
use futures::StreamExt;
use libfilestore::{ClientId, StorageTable};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::dispatch::dispatch;
use crate::notifier::Notifier;

/// Shared by every connection task.
pub struct ServerState {
    pub store: StorageTable,
    pub notifier: Notifier,
    next_client: AtomicU64,
}

impl ServerState {
    pub fn new(store: StorageTable) -> Self {
        Self {
            store,
            notifier: Notifier::new(),
            next_client: AtomicU64::new(1),
        }
    }

    fn next_client_id(&self) -> ClientId {
        ClientId(self.next_client.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Running,
    /// Stop accepting, let connected clients finish.
    Graceful,
    /// Drop every connection now.
    Immediate,
}

/// Accepts connections until told to stop. A closed shutdown channel counts
/// as an immediate stop.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    max_clients: usize,
    mut shutdown: watch::Receiver<Shutdown>,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(max_clients));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() != Shutdown::Running {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    warn!("refusing connection from {peer}: {max_clients} clients already connected");
                    drop(stream);
                    continue;
                };
                let client = state.next_client_id();
                let state = state.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_connection(stream, client, state).await {
                        warn!("{client} ({peer}) dropped: {e:#}");
                    }
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined && e.is_panic() {
                    error!("connection task panicked: {e}");
                }
            }
        }
    }
    drop(listener);

    let mode = match shutdown.has_changed() {
        Err(_) => Shutdown::Immediate,
        Ok(_) => *shutdown.borrow(),
    };
    if mode == Shutdown::Graceful {
        info!("no longer accepting, waiting for {} client(s)", tasks.len());
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_panic() => error!("connection task panicked: {e}"),
                    Some(_) => {}
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() == Shutdown::Immediate {
                        info!("stopping now, dropping {} client(s)", tasks.len());
                        break;
                    }
                }
            }
        }
    }
    tasks.shutdown().await;
    Ok(())
}

/// Serves one client until it hangs up or sends something undecodable, then
/// releases whatever it still holds.
async fn handle_connection(
    stream: TcpStream,
    client: ClientId,
    state: Arc<ServerState>,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (mut sink, mut frames) = transport(stream).split();
    let mut replies = state.notifier.register(client);
    info!("{client} connected from {peer}");

    // every reply, deferred or not, leaves through here in queue order; the
    // stream ends once the client is unregistered and its queue is drained
    let writer = async move {
        while let Some(response) = replies.recv().await {
            send_response(&mut sink, &response).await?;
        }
        Ok::<_, ProtocolError>(())
    };

    let reader = async {
        let outcome = loop {
            match recv_request(&mut frames).await {
                Ok(Some(request)) => {
                    debug!("{client}: {}", request.op_name());
                    if let Some(reply) = dispatch(&state.store, &state.notifier, client, request) {
                        state.notifier.send(client, reply);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e @ (ProtocolError::Io(_) | ProtocolError::Closed)) => break Err(e),
                Err(e) => {
                    state
                        .notifier
                        .send(client, Response::error(Status::BadRequest, e.to_string()));
                    break Err(e);
                }
            }
        };
        match state.store.client_disconnect(client) {
            Ok(grants) => state.notifier.grant_all(&grants),
            Err(e) => error!("failed to release resources of {client}: {e}"),
        }
        state.notifier.unregister(client);
        outcome
    };

    let (outcome, written) = tokio::join!(reader, writer);
    if let Err(e) = written {
        debug!("{client}: writer stopped: {e}");
    }
    info!("{client} disconnected");
    outcome.with_context(|| format!("connection of {client}"))
}

/// SIGINT and SIGQUIT stop at once; SIGHUP stops accepting and waits for
/// connected clients.
pub async fn watch_signals(tx: &watch::Sender<Shutdown>) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut quit = signal(SignalKind::quit()).context("SIGQUIT handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("SIGINT received, shutting down");
                tx.send_replace(Shutdown::Immediate);
                break;
            }
            _ = quit.recv() => {
                info!("SIGQUIT received, shutting down");
                tx.send_replace(Shutdown::Immediate);
                break;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, finishing connected clients");
                tx.send_replace(Shutdown::Graceful);
            }
        }
    }
    Ok(())
}

pub fn log_summary(state: &ServerState) -> Result<()> {
    let stats = state.store.stats()?;
    info!(
        "summary: {} file(s), {} byte(s) resident; peak {} file(s), {} byte(s); {} eviction(s)",
        stats.file_count,
        stats.byte_count,
        stats.max_file_count_seen,
        stats.max_bytes_seen,
        stats.evictions
    );
    for (pathname, size) in state.store.resident()? {
        info!("  {pathname} ({size} bytes)");
    }
    Ok(())
}

pub async fn run(cfg: Config) -> Result<()> {
    let store = StorageTable::new(cfg.storage.clone()).context("invalid storage configuration")?;
    let state = Arc::new(ServerState::new(store));
    let listener = TcpListener::bind(&cfg.addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.addr))?;
    info!(
        "fsd listening on {} with {} worker(s), at most {} client(s)",
        listener.local_addr()?,
        cfg.workers,
        cfg.max_clients
    );

    let (tx, rx) = watch::channel(Shutdown::Running);
    let signals = tokio::spawn(async move {
        if let Err(e) = watch_signals(&tx).await {
            error!("signal handling unavailable: {e:#}");
            // keep the channel open so the server is not taken for stopped
            tx.closed().await;
        }
    });

    serve(listener, state.clone(), cfg.max_clients, rx).await?;
    signals.abort();
    log_summary(&state)
}
