use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, StoreError};
use crate::file::{ClientId, FileEntry};

#[derive(Debug)]
pub struct StagedFile {
    pub file: FileEntry,
    pub creator: ClientId,
}

/// Files created but not yet committed, keyed by pathname.
///
/// Staged files take no table capacity and are invisible to everyone but
/// their creator.
#[derive(Default)]
pub struct StagingTable {
    drafts: Mutex<HashMap<String, StagedFile>>,
}

impl StagingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn drafts(&self) -> Result<MutexGuard<'_, HashMap<String, StagedFile>>> {
        self.drafts
            .lock()
            .map_err(|_| StoreError::LockPoisoned("staging table"))
    }

    pub fn contains(&self, pathname: &str) -> Result<bool> {
        Ok(self.drafts()?.contains_key(pathname))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.drafts()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.drafts()?.is_empty())
    }

    pub fn insert(&self, file: FileEntry, creator: ClientId) -> Result<()> {
        let mut drafts = self.drafts()?;
        if drafts.contains_key(file.pathname()) {
            return Err(StoreError::AlreadyExists(file.pathname().to_string()));
        }
        drafts.insert(file.pathname().to_string(), StagedFile { file, creator });
        Ok(())
    }

    /// Takes the draft out for commit. The draft stays staged unless
    /// `committer` has it open and, when `require_lock` is set, holds its lock.
    pub fn take_for_commit(
        &self,
        pathname: &str,
        committer: ClientId,
        require_lock: bool,
    ) -> Result<FileEntry> {
        let mut drafts = self.drafts()?;
        let staged = drafts
            .get(pathname)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))?;
        let allowed = staged.file.is_open_by(committer)
            && (!require_lock || staged.file.lock_holder() == Some(committer));
        if !allowed {
            return Err(StoreError::PermissionDenied {
                pathname: pathname.to_string(),
                client: committer,
            });
        }
        drafts
            .remove(pathname)
            .map(|s| s.file)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))
    }

    /// Drops the draft if `client` created it. Returns whether a draft went.
    pub fn discard(&self, pathname: &str, client: ClientId) -> Result<bool> {
        let mut drafts = self.drafts()?;
        match drafts.get(pathname) {
            Some(staged) if staged.creator == client => {
                drafts.remove(pathname);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
