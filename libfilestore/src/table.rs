use std::collections::{BTreeMap, HashMap};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::file::{
    AccessClock, ClientId, FileEntry, FileSnapshot, LockOutcome, OpenOutcome, RemovedFile,
};
use crate::links::ClientLinks;
use crate::staging::StagingTable;

/// Index entry of a committed file.
struct Resident {
    /// Slot of the file-lock pool that owns the file.
    slot: usize,
    size: u64,
    last_access: Arc<AtomicU64>,
}

/// State guarded by the structural mutex.
#[derive(Default)]
struct Structure {
    index: HashMap<String, Resident>,
    byte_count: u64,
    max_files_seen: usize,
    max_bytes_seen: u64,
    evictions: u64,
}

impl Structure {
    fn record_high_water(&mut self) {
        self.max_files_seen = self.max_files_seen.max(self.index.len());
        self.max_bytes_seen = self.max_bytes_seen.max(self.byte_count);
    }

    /// Committed files, least recently used first. Stamps are read once up
    /// front since openers may touch files while the sort runs.
    fn lru_order(&self) -> Vec<(&String, &Resident)> {
        let mut order: Vec<_> = self
            .index
            .iter()
            .map(|(name, r)| (r.last_access.load(Ordering::Relaxed), name, r))
            .collect();
        order.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        order.into_iter().map(|(_, name, r)| (name, r)).collect()
    }
}

/// Files owned by one slot of the file-lock pool.
type Slot = HashMap<String, FileEntry>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub file_count: usize,
    pub byte_count: u64,
    pub max_file_count_seen: usize,
    pub max_bytes_seen: u64,
    pub evictions: u64,
    pub staged: usize,
}

/// A queued lock request that has just been granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub pathname: String,
    pub client: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub size: u64,
    pub openers: Vec<ClientId>,
    pub lock_holder: Option<ClientId>,
    pub waiters: Vec<ClientId>,
    pub last_access: u64,
}

/// The committed-file cache.
///
/// Lock order is structural mutex, then file-lock slot, then (only during
/// eviction, with the structural mutex still held) a victim's slot. The
/// structural mutex is never taken while a slot is held. Staging and the
/// client-link buckets are leaf locks.
///
/// Files are sharded over a fixed pool of `2 * max_files` mutexes by a stable
/// hash of the pathname. Unrelated pathnames sharing a slot only serialize
/// each other.
pub struct StorageTable {
    config: StoreConfig,
    structure: Mutex<Structure>,
    file_locks: Vec<Mutex<Slot>>,
    staging: StagingTable,
    links: ClientLinks,
    clock: Arc<AccessClock>,
}

impl StorageTable {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = config.max_files.saturating_mul(2);
        info!(
            "storage table: max_files={} max_bytes={} max_openers_per_file={} lock pool={pool}",
            config.max_files, config.max_bytes, config.max_openers_per_file
        );
        Ok(Self {
            file_locks: (0..pool).map(|_| Mutex::new(HashMap::new())).collect(),
            structure: Mutex::new(Structure::default()),
            staging: StagingTable::new(),
            links: ClientLinks::default(),
            clock: Arc::new(AccessClock::new()),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn structure(&self) -> Result<MutexGuard<'_, Structure>> {
        self.structure
            .lock()
            .map_err(|_| StoreError::LockPoisoned("structural"))
    }

    fn slot_of(&self, pathname: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        pathname.hash(&mut hasher);
        (hasher.finish() % self.file_locks.len() as u64) as usize
    }

    fn file_lock(&self, slot: usize) -> Result<MutexGuard<'_, Slot>> {
        self.file_locks[slot]
            .lock()
            .map_err(|_| StoreError::LockPoisoned("file"))
    }

    /// Locks the slot owning a committed file, holding the structural mutex
    /// only for the lookup.
    fn pin(&self, pathname: &str) -> Result<MutexGuard<'_, Slot>> {
        let structure = self.structure()?;
        let slot = structure
            .index
            .get(pathname)
            .map(|r| r.slot)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))?;
        let guard = self.file_lock(slot)?;
        drop(structure);
        Ok(guard)
    }

    fn resident_mut<'a>(slot: &'a mut Slot, pathname: &str) -> Result<&'a mut FileEntry> {
        slot.get_mut(pathname)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))
    }

    fn check_pathname(&self, pathname: &str) -> Result<()> {
        if pathname.is_empty() {
            return Err(StoreError::InvalidArgument("empty pathname".to_string()));
        }
        if pathname.len() > self.config.max_pathname_len {
            return Err(StoreError::InvalidArgument(format!(
                "pathname longer than {} bytes",
                self.config.max_pathname_len
            )));
        }
        Ok(())
    }

    fn drop_links(&self, removed: &RemovedFile) {
        for client in &removed.openers {
            if let Err(e) = self.links.remove_one(*client, &removed.pathname) {
                debug!("no link {client} -> {}: {e}", removed.pathname);
            }
        }
    }

    /// Takes a committed file out of the index and its slot.
    fn drop_resident(
        &self,
        structure: &mut Structure,
        slot: &mut Slot,
        pathname: &str,
    ) -> Result<RemovedFile> {
        let file = slot
            .remove(pathname)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))?;
        if let Some(resident) = structure.index.remove(pathname) {
            structure.byte_count = structure.byte_count.saturating_sub(resident.size);
        }
        let removed = file.into_removed();
        self.drop_links(&removed);
        Ok(removed)
    }

    /// Evicts least-recently-used files until `files_to_add` more files and
    /// `bytes_to_add` more bytes fit. `target` is never chosen. When the
    /// target's slot is already held by the caller it is passed in `held`.
    ///
    /// Victims are chosen and their slots locked before anything is taken
    /// out, so a failure leaves the table as it was.
    fn make_room(
        &self,
        structure: &mut Structure,
        files_to_add: usize,
        bytes_to_add: u64,
        target: &str,
        mut held: Option<(usize, &mut Slot)>,
    ) -> Result<Vec<RemovedFile>> {
        let (target_files, target_bytes) = structure
            .index
            .get(target)
            .map_or((0, 0), |r| (1, r.size));
        if target_files + files_to_add > self.config.max_files
            || target_bytes + bytes_to_add > self.config.max_bytes
        {
            return Err(StoreError::CapacityExceeded(format!(
                "{target} does not fit even in an empty table"
            )));
        }

        let fits = |files: usize, bytes: u64| {
            files + files_to_add <= self.config.max_files
                && bytes + bytes_to_add <= self.config.max_bytes
        };
        let mut files = structure.index.len();
        let mut bytes = structure.byte_count;
        let mut victims: Vec<(String, usize)> = Vec::new();
        for (name, resident) in structure.lru_order() {
            if fits(files, bytes) {
                break;
            }
            if name.as_str() == target {
                continue;
            }
            files -= 1;
            bytes = bytes.saturating_sub(resident.size);
            victims.push((name.clone(), resident.slot));
        }
        if !fits(files, bytes) {
            return Err(StoreError::CapacityExceeded(format!(
                "no file left to evict for {target}"
            )));
        }

        let held_slot = held.as_ref().map(|(slot, _)| *slot);
        let mut slots: Vec<usize> = victims
            .iter()
            .map(|(_, slot)| *slot)
            .filter(|slot| Some(*slot) != held_slot)
            .collect();
        slots.sort_unstable();
        slots.dedup();
        let mut guards = BTreeMap::new();
        for slot in slots {
            guards.insert(slot, self.file_lock(slot)?);
        }

        let mut evicted = Vec::with_capacity(victims.len());
        for (name, slot) in victims {
            let file = match (held.as_mut(), guards.get_mut(&slot)) {
                (Some((held_slot, guard)), _) if *held_slot == slot => guard.remove(&name),
                (_, Some(guard)) => guard.remove(&name),
                _ => None,
            };
            if let Some(resident) = structure.index.remove(&name) {
                structure.byte_count = structure.byte_count.saturating_sub(resident.size);
            }
            structure.evictions += 1;

            let Some(file) = file else {
                warn!("index entry {name} had no file behind it");
                continue;
            };
            let removed = file.into_removed();
            self.drop_links(&removed);
            warn!(
                "evicted {} ({} bytes) to make room for {target}",
                removed.pathname,
                removed.content.len()
            );
            evicted.push(removed);
        }
        Ok(evicted)
    }

    /// Reserves `pathname` for `creator` without consuming capacity. The
    /// draft is opened by its creator and, on request, locked.
    pub fn stage_create(&self, pathname: &str, creator: ClientId, request_lock: bool) -> Result<()> {
        self.check_pathname(pathname)?;
        let structure = self.structure()?;
        if structure.index.contains_key(pathname) || self.staging.contains(pathname)? {
            return Err(StoreError::AlreadyExists(pathname.to_string()));
        }

        let mut file = FileEntry::new(pathname, self.config.max_openers_per_file, self.clock.clone());
        file.open(creator)?;
        if request_lock {
            file.lock(creator)?;
        }
        self.staging.insert(file, creator)?;
        self.links.register_open(creator, pathname)?;
        drop(structure);

        debug!("staged {pathname} for {creator} (lock: {request_lock})");
        Ok(())
    }

    /// Promotes a draft into the table, evicting as needed. Returns the
    /// evicted files, now owned by the caller.
    pub fn commit(
        &self,
        pathname: &str,
        committer: ClientId,
        require_lock: bool,
    ) -> Result<Vec<RemovedFile>> {
        self.commit_with(pathname, committer, require_lock, &[])
    }

    /// The first write of a freshly created file: commit with `bytes` as
    /// the initial content. Room is made for the final size in one pass, so
    /// either the file lands with its content and the evicted files are
    /// returned, or nothing is evicted.
    pub fn write(&self, pathname: &str, client: ClientId, bytes: &[u8]) -> Result<Vec<RemovedFile>> {
        self.commit_with(pathname, client, true, bytes)
    }

    fn commit_with(
        &self,
        pathname: &str,
        committer: ClientId,
        require_lock: bool,
        bytes: &[u8],
    ) -> Result<Vec<RemovedFile>> {
        let mut structure = self.structure()?;
        let mut file = self
            .staging
            .take_for_commit(pathname, committer, require_lock)?;

        if structure.index.contains_key(pathname) {
            // lost a race with another commit of the same pathname
            if let Err(e) = self.links.remove_one(committer, pathname) {
                debug!("no link {committer} -> {pathname}: {e}");
            }
            warn!("discarded draft {pathname} of {committer}: already committed");
            return Err(StoreError::AlreadyExists(pathname.to_string()));
        }

        let size = bytes.len() as u64;
        if size > self.config.max_bytes {
            let removed = file.into_removed();
            self.drop_links(&removed);
            warn!(
                "dropped {pathname}: first write of {size} bytes exceeds the {} byte limit",
                self.config.max_bytes
            );
            return Err(StoreError::TooLarge {
                pathname: pathname.to_string(),
                size,
                limit: self.config.max_bytes,
                openers: removed.openers,
                waiters: removed.waiters,
            });
        }

        if !bytes.is_empty()
            && let Err(e) = file.append_content(bytes, self.config.max_bytes)
        {
            self.staging.insert(file, committer)?;
            return Err(e);
        }

        let slot = self.slot_of(pathname);
        let placed = self.file_lock(slot).and_then(|mut guard| {
            let evicted =
                self.make_room(&mut structure, 1, size, pathname, Some((slot, &mut *guard)))?;
            Ok((guard, evicted))
        });
        let (mut guard, evicted) = match placed {
            Ok(placed) => placed,
            Err(e) => {
                // back to staging as it was before this write
                file.discard_content();
                self.staging.insert(file, committer)?;
                return Err(e);
            }
        };

        file.touch();
        let resident = Resident {
            slot,
            size,
            last_access: file.access_stamp(),
        };
        guard.insert(pathname.to_string(), file);
        drop(guard);

        structure.byte_count += size;
        structure.index.insert(pathname.to_string(), resident);
        structure.record_high_water();
        debug!(
            "committed {pathname} for {committer}: {} files, {} bytes resident",
            structure.index.len(),
            structure.byte_count
        );
        Ok(evicted)
    }

    pub fn open(&self, pathname: &str, client: ClientId) -> Result<OpenOutcome> {
        let mut guard = self.pin(pathname)?;
        let file = Self::resident_mut(&mut guard, pathname)?;
        let outcome = file.open(client)?;
        if outcome == OpenOutcome::Opened {
            self.links.register_open(client, pathname)?;
        }
        Ok(outcome)
    }

    /// Closes `pathname` for `client`. If the client held the lock, the
    /// promoted waiter is returned. Closing one's own draft abandons it.
    pub fn close(&self, pathname: &str, client: ClientId) -> Result<Option<ClientId>> {
        let structure = self.structure()?;
        let Some(slot) = structure.index.get(pathname).map(|r| r.slot) else {
            let discarded = self.staging.discard(pathname, client)?;
            drop(structure);
            if !discarded {
                return Err(StoreError::NotFound(pathname.to_string()));
            }
            if let Err(e) = self.links.remove_one(client, pathname) {
                debug!("no link {client} -> {pathname}: {e}");
            }
            debug!("{client} abandoned draft {pathname}");
            return Ok(None);
        };
        let mut guard = self.file_lock(slot)?;
        drop(structure);

        let file = Self::resident_mut(&mut guard, pathname)?;
        let promoted = file.close(client)?;
        if let Err(e) = self.links.remove_one(client, pathname) {
            debug!("no link {client} -> {pathname}: {e}");
        }
        Ok(promoted)
    }

    /// Returns a private copy of the content.
    pub fn read(&self, pathname: &str, client: ClientId) -> Result<Vec<u8>> {
        let guard = self.pin(pathname)?;
        let file = guard
            .get(pathname)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))?;
        if !file.is_open_by(client) || file.is_locked_by_other(client) {
            return Err(StoreError::PermissionDenied {
                pathname: pathname.to_string(),
                client,
            });
        }
        file.touch();
        Ok(file.content().to_vec())
    }

    /// Copies up to `n` files in LRU order, skipping files locked by other
    /// clients. `n <= 0` means up to `max_files`. Access stamps are left
    /// untouched.
    pub fn read_sample(&self, n: i64, client: ClientId) -> Result<Vec<FileSnapshot>> {
        let limit = if n <= 0 {
            self.config.max_files
        } else {
            usize::try_from(n).unwrap_or(usize::MAX)
        };
        let structure = self.structure()?;
        let mut sample = Vec::new();
        for (pathname, resident) in structure.lru_order() {
            if sample.len() >= limit {
                break;
            }
            let guard = self.file_lock(resident.slot)?;
            if let Some(file) = guard.get(pathname.as_str())
                && !file.is_locked_by_other(client)
            {
                sample.push(file.snapshot());
            }
        }
        Ok(sample)
    }

    /// Appends to a file locked by `client`. A file that would outgrow the
    /// whole table is dropped and `TooLarge` is returned.
    pub fn append(&self, pathname: &str, client: ClientId, bytes: &[u8]) -> Result<Vec<RemovedFile>> {
        if bytes.is_empty() {
            return Err(StoreError::InvalidArgument(format!("{pathname}: empty append")));
        }
        let mut structure = self.structure()?;
        let slot = structure
            .index
            .get(pathname)
            .map(|r| r.slot)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))?;
        let mut guard = self.file_lock(slot)?;

        let size = {
            let file = Self::resident_mut(&mut guard, pathname)?;
            if !file.is_open_by(client) || file.lock_holder() != Some(client) {
                return Err(StoreError::PermissionDenied {
                    pathname: pathname.to_string(),
                    client,
                });
            }
            file.size()
        };

        let added = bytes.len() as u64;
        if size + added > self.config.max_bytes {
            let removed = self.drop_resident(&mut structure, &mut guard, pathname)?;
            warn!(
                "dropped {pathname}: {} bytes would exceed the {} byte limit",
                size + added,
                self.config.max_bytes
            );
            return Err(StoreError::TooLarge {
                pathname: pathname.to_string(),
                size: size + added,
                limit: self.config.max_bytes,
                openers: removed.openers,
                waiters: removed.waiters,
            });
        }

        let evicted = self.make_room(&mut structure, 0, added, pathname, Some((slot, &mut *guard)))?;
        let file = Self::resident_mut(&mut guard, pathname)?;
        let new_size = file.append_content(bytes, self.config.max_bytes)?;
        drop(guard);

        structure.byte_count += added;
        if let Some(resident) = structure.index.get_mut(pathname) {
            resident.size = new_size;
        }
        structure.record_high_water();
        Ok(evicted)
    }

    pub fn lock(&self, pathname: &str, client: ClientId) -> Result<LockOutcome> {
        let mut guard = self.pin(pathname)?;
        let file = Self::resident_mut(&mut guard, pathname)?;
        let outcome = file.lock(client)?;
        debug!("lock {pathname} by {client}: {outcome:?}");
        Ok(outcome)
    }

    /// Releases or withdraws `client`'s lock request; returns the waiter that
    /// now holds the lock, if any.
    pub fn unlock(&self, pathname: &str, client: ClientId) -> Result<Option<ClientId>> {
        let mut guard = self.pin(pathname)?;
        let file = Self::resident_mut(&mut guard, pathname)?;
        let promoted = file.unlock(client)?;
        if let Some(next) = promoted {
            debug!("lock {pathname} passed from {client} to {next}");
        }
        Ok(promoted)
    }

    /// Removes a file opened by `client`; a locked file can only be removed
    /// by its holder.
    pub fn remove(&self, pathname: &str, client: ClientId) -> Result<RemovedFile> {
        let mut structure = self.structure()?;
        let slot = structure
            .index
            .get(pathname)
            .map(|r| r.slot)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))?;
        let mut guard = self.file_lock(slot)?;

        let file = Self::resident_mut(&mut guard, pathname)?;
        let allowed = file.is_open_by(client) && file.lock_holder().is_none_or(|h| h == client);
        if !allowed {
            return Err(StoreError::PermissionDenied {
                pathname: pathname.to_string(),
                client,
            });
        }
        let removed = self.drop_resident(&mut structure, &mut guard, pathname)?;
        info!("{client} removed {pathname} ({} bytes)", removed.content.len());
        Ok(removed)
    }

    /// Releases everything `client` holds: locks are handed to the next
    /// waiter, opens are closed and drafts are discarded.
    pub fn client_disconnect(&self, client: ClientId) -> Result<Vec<LockGrant>> {
        let pathnames = self.links.remove_all(client)?;
        let mut grants = Vec::new();
        for pathname in pathnames {
            match self.close(&pathname, client) {
                Ok(Some(next)) => grants.push(LockGrant {
                    pathname,
                    client: next,
                }),
                Ok(None) => {}
                Err(StoreError::NotFound(_) | StoreError::NotOpen { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        info!("{client} disconnected, {} lock(s) handed over", grants.len());
        Ok(grants)
    }

    pub fn contains(&self, pathname: &str) -> Result<bool> {
        Ok(self.structure()?.index.contains_key(pathname))
    }

    pub fn is_staged(&self, pathname: &str) -> Result<bool> {
        self.staging.contains(pathname)
    }

    pub fn status(&self, pathname: &str) -> Result<FileStatus> {
        let guard = self.pin(pathname)?;
        let file = guard
            .get(pathname)
            .ok_or_else(|| StoreError::NotFound(pathname.to_string()))?;
        Ok(FileStatus {
            size: file.size(),
            openers: file.openers().to_vec(),
            lock_holder: file.lock_holder(),
            waiters: file.waiters().copied().collect(),
            last_access: file.last_access(),
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let structure = self.structure()?;
        Ok(StoreStats {
            file_count: structure.index.len(),
            byte_count: structure.byte_count,
            max_file_count_seen: structure.max_files_seen,
            max_bytes_seen: structure.max_bytes_seen,
            evictions: structure.evictions,
            staged: self.staging.len()?,
        })
    }

    /// Committed pathnames with their sizes, least recently used first.
    pub fn resident(&self) -> Result<Vec<(String, u64)>> {
        let structure = self.structure()?;
        Ok(structure
            .lru_order()
            .into_iter()
            .map(|(name, r)| (name.clone(), r.size))
            .collect())
    }
}
