use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, StoreError};
use crate::queue::Queue;

/// Opaque handle of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    AlreadyOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller is now the lock holder.
    Acquired,
    /// The lock is held by someone else; the caller is queued and will be
    /// promoted when the holders ahead of it release.
    Queued,
    /// The caller already holds or already waits for the lock.
    AlreadyRequested,
}

/// Source of the logical timestamps used for LRU ordering.
#[derive(Debug, Default)]
pub struct AccessClock(AtomicU64);

impl AccessClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Read-only copy of a file handed out by sample reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub pathname: String,
    pub content: Vec<u8>,
}

/// A file that left the table (removed, evicted or dropped), owned by the
/// caller from now on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedFile {
    pub pathname: String,
    pub content: Vec<u8>,
    pub openers: Vec<ClientId>,
    pub lock_holder: Option<ClientId>,
    /// Clients whose queued lock requests died with the file.
    pub waiters: Vec<ClientId>,
}

/// One named object held in memory.
///
/// The entry does not synchronize itself; callers hold the mutex that owns
/// it. Invariants: the lock holder and every waiter are openers, and the
/// opener set never grows past `max_openers`.
#[derive(Debug)]
pub struct FileEntry {
    pathname: String,
    content: Vec<u8>,
    openers: Vec<ClientId>,
    max_openers: usize,
    lock_holder: Option<ClientId>,
    lock_waiters: Queue<ClientId>,
    clock: Arc<AccessClock>,
    last_access: Arc<AtomicU64>,
}

impl FileEntry {
    pub fn new(pathname: impl Into<String>, max_openers: usize, clock: Arc<AccessClock>) -> Self {
        let last_access = Arc::new(AtomicU64::new(clock.tick()));
        Self {
            pathname: pathname.into(),
            content: Vec::new(),
            openers: Vec::new(),
            max_openers,
            lock_holder: None,
            lock_waiters: Queue::new(),
            clock,
            last_access,
        }
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn openers(&self) -> &[ClientId] {
        &self.openers
    }

    pub fn lock_holder(&self) -> Option<ClientId> {
        self.lock_holder
    }

    pub fn waiters(&self) -> impl Iterator<Item = &ClientId> {
        self.lock_waiters.iter()
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Shared handle on the access stamp, kept by the table index so the LRU
    /// order can be computed without locking the file.
    pub fn access_stamp(&self) -> Arc<AtomicU64> {
        self.last_access.clone()
    }

    pub fn touch(&self) {
        self.last_access.store(self.clock.tick(), Ordering::Relaxed);
    }

    pub fn is_open_by(&self, client: ClientId) -> bool {
        self.openers.contains(&client)
    }

    pub fn is_locked_by_other(&self, client: ClientId) -> bool {
        matches!(self.lock_holder, Some(holder) if holder != client)
    }

    pub fn open(&mut self, client: ClientId) -> Result<OpenOutcome> {
        if self.is_open_by(client) {
            return Ok(OpenOutcome::AlreadyOpen);
        }
        if self.openers.len() >= self.max_openers {
            return Err(StoreError::CapacityExceeded(format!(
                "{} already has {} openers",
                self.pathname, self.max_openers
            )));
        }
        self.openers.push(client);
        self.touch();
        Ok(OpenOutcome::Opened)
    }

    /// Drops `client` from the opener set. A held lock is released on the
    /// way out and the promoted waiter, if any, is returned.
    pub fn close(&mut self, client: ClientId) -> Result<Option<ClientId>> {
        let pos = self
            .openers
            .iter()
            .position(|c| *c == client)
            .ok_or_else(|| StoreError::NotOpen {
                pathname: self.pathname.clone(),
                client,
            })?;
        let promoted = if self.lock_holder == Some(client) {
            self.lock_holder = self.lock_waiters.pop();
            self.lock_holder
        } else {
            self.lock_waiters.remove(&client);
            None
        };
        self.openers.swap_remove(pos);
        Ok(promoted)
    }

    pub fn lock(&mut self, client: ClientId) -> Result<LockOutcome> {
        if !self.is_open_by(client) {
            return Err(StoreError::PermissionDenied {
                pathname: self.pathname.clone(),
                client,
            });
        }
        if self.lock_holder == Some(client) || self.lock_waiters.contains(&client) {
            return Ok(LockOutcome::AlreadyRequested);
        }
        self.touch();
        if self.lock_holder.is_none() {
            self.lock_holder = Some(client);
            Ok(LockOutcome::Acquired)
        } else {
            self.lock_waiters.push(client);
            Ok(LockOutcome::Queued)
        }
    }

    /// Releases the lock or withdraws a queued request. Releasing the lock
    /// hands it to the next waiter, which is returned so the caller can tell
    /// it that its wait is over.
    pub fn unlock(&mut self, client: ClientId) -> Result<Option<ClientId>> {
        let not_holder = || StoreError::NotHolder {
            pathname: self.pathname.clone(),
            client,
        };
        if !self.is_open_by(client) {
            return Err(not_holder());
        }
        if self.lock_holder == Some(client) {
            self.lock_holder = self.lock_waiters.pop();
            self.touch();
            Ok(self.lock_holder)
        } else if self.lock_waiters.remove(&client) {
            self.touch();
            Ok(None)
        } else {
            Err(not_holder())
        }
    }

    /// Concatenates `bytes` onto the content and returns the new size.
    /// Write authorization is checked by the table, not here.
    pub fn append_content(&mut self, bytes: &[u8], limit: u64) -> Result<u64> {
        if bytes.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "{}: empty append",
                self.pathname
            )));
        }
        if bytes.len() as u64 > limit {
            return Err(StoreError::InvalidArgument(format!(
                "{}: append of {} bytes exceeds {limit}",
                self.pathname,
                bytes.len()
            )));
        }
        self.content.extend_from_slice(bytes);
        self.touch();
        Ok(self.size())
    }

    pub(crate) fn discard_content(&mut self) {
        self.content.clear();
    }

    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            pathname: self.pathname.clone(),
            content: self.content.clone(),
        }
    }

    pub fn into_removed(mut self) -> RemovedFile {
        let waiters = self.lock_waiters.drain().collect();
        RemovedFile {
            pathname: self.pathname,
            content: self.content,
            openers: self.openers,
            lock_holder: self.lock_holder,
            waiters,
        }
    }

    #[cfg(test)]
    pub(crate) fn invariants_hold(&self) -> bool {
        let holder_ok = self.lock_holder.is_none_or(|h| self.is_open_by(h));
        let waiters_ok = self.lock_waiters.iter().all(|w| self.is_open_by(*w));
        holder_ok && waiters_ok && self.openers.len() <= self.max_openers
    }
}
