use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::error::{Result, StoreError};
use crate::file::ClientId;

pub const DEFAULT_LINK_BUCKETS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLink {
    pub client: ClientId,
    pub pathname: String,
}

/// Reverse index from a client to the pathnames it has open.
///
/// All links of one client hash to the same bucket, so `remove_all` is atomic
/// with respect to a concurrent `register_open` for that client.
pub struct ClientLinks {
    buckets: Vec<Mutex<Vec<ClientLink>>>,
}

impl Default for ClientLinks {
    fn default() -> Self {
        Self::new(DEFAULT_LINK_BUCKETS)
    }
}

impl ClientLinks {
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: (0..buckets).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn bucket(&self, client: ClientId) -> Result<MutexGuard<'_, Vec<ClientLink>>> {
        let idx = (client.0 % self.buckets.len() as u64) as usize;
        self.buckets[idx]
            .lock()
            .map_err(|_| StoreError::LockPoisoned("client link bucket"))
    }

    /// Records that `client` opened `pathname`. Registering the same pair
    /// twice keeps a single link.
    pub fn register_open(&self, client: ClientId, pathname: &str) -> Result<()> {
        let mut bucket = self.bucket(client)?;
        if !bucket
            .iter()
            .any(|l| l.client == client && l.pathname == pathname)
        {
            bucket.push(ClientLink {
                client,
                pathname: pathname.to_string(),
            });
        }
        Ok(())
    }

    pub fn remove_one(&self, client: ClientId, pathname: &str) -> Result<()> {
        let mut bucket = self.bucket(client)?;
        match bucket
            .iter()
            .position(|l| l.client == client && l.pathname == pathname)
        {
            Some(pos) => {
                bucket.swap_remove(pos);
                Ok(())
            }
            None => Err(StoreError::NotFound(pathname.to_string())),
        }
    }

    /// Removes every link of `client` and returns the linked pathnames.
    pub fn remove_all(&self, client: ClientId) -> Result<Vec<String>> {
        let mut bucket = self.bucket(client)?;
        let mut paths = Vec::new();
        bucket.retain(|l| {
            if l.client == client {
                paths.push(l.pathname.clone());
                false
            } else {
                true
            }
        });
        debug!("dropped {} links of {client}", paths.len());
        Ok(paths)
    }

    pub fn pathnames_of(&self, client: ClientId) -> Result<Vec<String>> {
        let bucket = self.bucket(client)?;
        Ok(bucket
            .iter()
            .filter(|l| l.client == client)
            .map(|l| l.pathname.clone())
            .collect())
    }
}
