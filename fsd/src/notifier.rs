use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use common::protocol::{Response, Status};
use libfilestore::{ClientId, LockGrant};
use log::debug;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Routes replies to connected clients, including replies produced by
/// another client's request (a lock grant on unlock, or the news that the
/// file a client was waiting on is gone).
#[derive(Default)]
pub struct Notifier {
    senders: Mutex<HashMap<ClientId, UnboundedSender<Response>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, HashMap<ClientId, UnboundedSender<Response>>> {
        // the map stays consistent even if a holder panicked
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, client: ClientId) -> UnboundedReceiver<Response> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders().insert(client, tx);
        rx
    }

    pub fn unregister(&self, client: ClientId) {
        self.senders().remove(&client);
    }

    pub fn connected(&self) -> usize {
        self.senders().len()
    }

    /// Queues `response` for `client`. Returns false if the client is gone.
    pub fn send(&self, client: ClientId, response: Response) -> bool {
        let delivered = self
            .senders()
            .get(&client)
            .is_some_and(|tx| tx.send(response).is_ok());
        if !delivered {
            debug!("dropped reply for {client}: not connected");
        }
        delivered
    }

    /// Completes the deferred lock request of a promoted waiter.
    pub fn grant(&self, pathname: &str, client: ClientId) {
        debug!("lock on {pathname} granted to {client}");
        self.send(client, Response::Ok);
    }

    pub fn grant_all(&self, grants: &[LockGrant]) {
        for grant in grants {
            self.grant(&grant.pathname, grant.client);
        }
    }

    /// Fails the deferred lock requests of clients waiting on a file that
    /// no longer exists.
    pub fn file_gone(&self, pathname: &str, waiters: &[ClientId]) {
        for client in waiters {
            self.send(
                *client,
                Response::error(Status::NotFound, format!("{pathname}: file is gone")),
            );
        }
    }
}
