// src/pool.rs
//! Fixed-capacity pool of open datasets keyed by [`DatasetKey`].
//!
//! The pool-wide lock only guards lookup, insertion and eviction. Opening,
//! reopening and every native call happen under the per-entry lock, so a slow
//! open never stalls unrelated entries.
//!
//! A key may be held by several entries ("copies") so that calls on a hot
//! dataset can run side by side, each on its own native handle. Every copy
//! counts against the capacity.
//!
//! Entries are inserted unopened; the first caller to lock one opens it. An
//! entry that displaced an evicted one does not open until the evicted dataset
//! is closed. An entry whose generation moves past the generation its dataset
//! was opened at is reopened by the next caller. Evicted or retired entries
//! refuse to reopen, which surfaces as a transient failure and sends the
//! caller back to the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::backend::{cple, NativeResult, RasterBackend, RasterDataset};
use crate::error::{NativeError, WarpError, WarpResult};
use crate::key::DatasetKey;

/// One unit of the pool's open-dataset count, returned on drop.
struct OpenTicket(Arc<AtomicUsize>);

impl OpenTicket {
    fn take(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for OpenTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An opened dataset together with the generation it was opened at.
struct OpenDataset {
    generation: u64,
    // fields drop in declaration order: the dataset is closed before the
    // ticket is returned
    dataset: Box<dyn RasterDataset>,
    _ticket: OpenTicket,
}

/// The pool's record of one dataset.
pub struct Entry {
    key: DatasetKey,
    inserted: u64,
    generation: AtomicU64,
    last_used: AtomicU64,
    in_flight: AtomicUsize,
    retired: AtomicBool,
    is_open: AtomicBool,
    /// The evicted entry whose slot this one took, until it is closed.
    predecessor: Mutex<Option<Arc<Entry>>>,
    slot: Mutex<Option<OpenDataset>>,
}

impl Entry {
    fn new(
        key: DatasetKey,
        inserted: u64,
        last_used: u64,
        generation: u64,
        predecessor: Option<Arc<Entry>>,
    ) -> Self {
        Self {
            key,
            inserted,
            generation: AtomicU64::new(generation),
            last_used: AtomicU64::new(last_used),
            in_flight: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            is_open: AtomicBool::new(false),
            predecessor: Mutex::new(predecessor),
            slot: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &DatasetKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    /// Close the evicted entry this one replaced. Returns once it is closed,
    /// whichever thread ends up doing the work.
    fn settle(&self) {
        let mut pending = self.predecessor.lock();
        if let Some(victim) = pending.take() {
            debug!(key = %victim.key, generation = victim.generation(), "closing evicted entry");
            victim.retire();
        }
    }

    /// Detach from the pool and close, waiting for any call in progress.
    fn retire(&self) {
        self.settle();
        self.retired.store(true, Ordering::SeqCst);
        let mut slot = self.slot.lock();
        // closed under the lock: whoever gets the lock next sees it gone
        *slot = None;
        self.is_open.store(false, Ordering::SeqCst);
    }
}

/// A claim on an entry. While it lives the entry counts as busy and cannot be
/// evicted.
pub struct EntryRef {
    entry: Arc<Entry>,
}

impl EntryRef {
    fn new(entry: Arc<Entry>) -> Self {
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { entry }
    }

    /// Take the entry's exclusive lock. The lock borrows the claim, so it is
    /// always released before the claim is.
    pub fn lock(&self) -> EntryLock<'_> {
        EntryLock {
            entry: &self.entry,
            slot: self.entry.slot.lock(),
        }
    }

    /// The entry's lock, if nobody else holds it right now.
    pub fn try_lock(&self) -> Option<EntryLock<'_>> {
        self.entry.slot.try_lock().map(|slot| EntryLock {
            entry: &self.entry,
            slot,
        })
    }
}

impl std::ops::Deref for EntryRef {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        &self.entry
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive access to an entry's native objects.
pub struct EntryLock<'a> {
    entry: &'a Entry,
    slot: MutexGuard<'a, Option<OpenDataset>>,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<DatasetKey, Vec<Arc<Entry>>>,
    count: usize,
    clock: u64,
    inserted: u64,
}

impl PoolState {
    /// The idle entry with the oldest use, earliest insertion first on ties.
    fn idle_victim(&self, skip: Option<&DatasetKey>) -> Option<Arc<Entry>> {
        self.entries
            .iter()
            .filter(|(key, _)| Some(*key) != skip)
            .flat_map(|(_, copies)| copies.iter())
            .filter(|e| e.in_flight() == 0)
            .min_by_key(|e| (e.last_used.load(Ordering::SeqCst), e.inserted))
            .cloned()
    }

    fn remove(&mut self, entry: &Entry) {
        let Some(copies) = self.entries.get_mut(&entry.key) else {
            return;
        };
        let before = copies.len();
        copies.retain(|e| e.inserted != entry.inserted);
        self.count -= before - copies.len();
        if copies.is_empty() {
            self.entries.remove(&entry.key);
        }
    }
}

pub struct HandlePool {
    capacity: usize,
    backend: Arc<dyn RasterBackend>,
    state: Mutex<PoolState>,
    generations: AtomicU64,
    open_count: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl HandlePool {
    pub fn new(capacity: usize, backend: Arc<dyn RasterBackend>) -> Self {
        Self {
            capacity,
            backend,
            state: Mutex::new(PoolState::default()),
            generations: AtomicU64::new(0),
            open_count: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently held, opened or not.
    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Datasets currently open through this pool.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &DatasetKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Entries held for `key`.
    pub fn copies(&self, key: &DatasetKey) -> usize {
        self.state.lock().entries.get(key).map_or(0, Vec::len)
    }

    /// Whether any entry for `key` has an open dataset.
    pub fn is_open(&self, key: &DatasetKey) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|copies| copies.iter().any(|e| e.is_open()))
    }

    /// Generation of the oldest entry for `key`.
    pub fn generation(&self, key: &DatasetKey) -> Option<u64> {
        self.state
            .lock()
            .entries
            .get(key)
            .and_then(|copies| copies.first())
            .map(|e| e.generation())
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim the entry for `key`, inserting an unopened one if needed.
    ///
    /// When the pool is full the idle entry with the oldest use is evicted,
    /// earliest insertion first on ties. If every entry is busy the call fails
    /// with `ResourceExhausted`.
    pub fn acquire_or_open(&self, key: &DatasetKey) -> WarpResult<EntryRef> {
        self.acquire(key, 1)?
            .into_iter()
            .next()
            .ok_or(WarpError::ResourceExhausted {
                capacity: self.capacity,
            })
    }

    /// Claim every entry held for `key`, inserting new ones until there are
    /// `copies` of them or no idle entry of another key is left to evict.
    ///
    /// The claims come back in rotating order so that concurrent callers
    /// start from different copies. Fails with `ResourceExhausted` only when
    /// not a single entry could be had.
    pub fn acquire(&self, key: &DatasetKey, copies: usize) -> WarpResult<Vec<EntryRef>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WarpError::NotInitialized);
        }
        let wanted = copies.max(1);

        let (claims, fresh) = {
            let mut state = self.state.lock();
            state.clock += 1;
            let now = state.clock;

            let mut claims: Vec<EntryRef> = match state.entries.get(key) {
                Some(held) if !held.is_empty() => {
                    let start = (now % held.len() as u64) as usize;
                    held.iter()
                        .cycle()
                        .skip(start)
                        .take(held.len())
                        .map(|e| {
                            e.last_used.store(now, Ordering::SeqCst);
                            EntryRef::new(Arc::clone(e))
                        })
                        .collect()
                }
                _ => Vec::new(),
            };

            let mut fresh = Vec::new();
            while claims.len() < wanted {
                let predecessor = if state.count < self.capacity {
                    None
                } else {
                    match state.idle_victim(Some(key)) {
                        Some(victim) => {
                            state.remove(&victim);
                            Some(victim)
                        }
                        None if claims.is_empty() => {
                            warn!(capacity = self.capacity, key = %key, "pool exhausted");
                            return Err(WarpError::ResourceExhausted {
                                capacity: self.capacity,
                            });
                        }
                        None => break,
                    }
                };

                state.inserted += 1;
                let entry = Arc::new(Entry::new(
                    key.clone(),
                    state.inserted,
                    now,
                    self.next_generation(),
                    predecessor,
                ));
                state.entries.entry(key.clone()).or_default().push(Arc::clone(&entry));
                state.count += 1;
                // claimed before the pool lock drops so nobody can evict it first
                claims.push(EntryRef::new(Arc::clone(&entry)));
                fresh.push(entry);
            }
            (claims, fresh)
        };

        for entry in &fresh {
            entry.settle();
        }
        Ok(claims)
    }

    /// Force the next caller of `entry` to reopen it.
    pub fn invalidate(&self, entry: &Entry) {
        let generation = self.next_generation();
        entry.generation.store(generation, Ordering::SeqCst);
        debug!(key = %entry.key, generation, "entry invalidated");
    }

    /// The locked entry's dataset, opening or reopening it first if its
    /// generation moved on.
    pub fn dataset<'l>(&self, lock: &'l mut EntryLock<'_>) -> NativeResult<&'l dyn RasterDataset> {
        let entry = lock.entry;
        if entry.retired.load(Ordering::SeqCst) {
            return Err(NativeError::transient(
                cple::OBJECT_NULL,
                format!("entry for {} was evicted", entry.key),
            ));
        }

        let wanted = entry.generation();
        let open = match lock.slot.take() {
            Some(open) if open.generation == wanted => open,
            stale => {
                if let Some(stale) = stale {
                    debug!(key = %entry.key, from = stale.generation, to = wanted, "reopening entry");
                    drop(stale);
                }
                entry.is_open.store(false, Ordering::SeqCst);
                entry.settle();
                let dataset = self.backend.open(&entry.key)?;
                entry.is_open.store(true, Ordering::SeqCst);
                debug!(key = %entry.key, generation = wanted, "entry opened");
                OpenDataset {
                    generation: wanted,
                    dataset,
                    _ticket: OpenTicket::take(&self.open_count),
                }
            }
        };
        Ok(&*lock.slot.insert(open).dataset)
    }

    /// Close one idle entry chosen by least-recent use. Returns its key.
    pub fn evict_idle(&self) -> Option<DatasetKey> {
        let victim = {
            let mut state = self.state.lock();
            let victim = state.idle_victim(None)?;
            state.remove(&victim);
            victim
        };
        debug!(key = %victim.key, "evicting idle entry on request");
        victim.retire();
        Some(victim.key.clone())
    }

    /// Close every entry, waiting for calls in progress. With `shutdown` the
    /// pool refuses further claims.
    pub fn clear(&self, shutdown: bool) -> usize {
        if shutdown {
            self.closed.store(true, Ordering::SeqCst);
        }
        let entries: Vec<Arc<Entry>> = {
            let mut state = self.state.lock();
            state.count = 0;
            state.entries.drain().flat_map(|(_, copies)| copies).collect()
        };
        for entry in &entries {
            entry.retire();
        }
        entries.len()
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryRaster};
    use crate::key::DatasetSelector;

    fn pool(capacity: usize) -> (HandlePool, MemoryBackend) {
        let backend = MemoryBackend::new();
        for uri in ["mem://a", "mem://b", "mem://c"] {
            backend.insert(uri, MemoryRaster::gradient(4, 4, 1));
        }
        (HandlePool::new(capacity, Arc::new(backend.clone())), backend)
    }

    fn key(uri: &str) -> DatasetKey {
        DatasetKey::new(uri, Vec::<String>::new())
    }

    fn touch(pool: &HandlePool, k: &DatasetKey) {
        let entry = pool.acquire_or_open(k).unwrap();
        let mut lock = entry.lock();
        pool.dataset(&mut lock)
            .unwrap()
            .band_count(DatasetSelector::Source)
            .unwrap();
    }

    #[test]
    fn same_key_shares_an_entry() {
        let (pool, backend) = pool(4);
        touch(&pool, &key("mem://a"));
        touch(&pool, &key("mem://a"));
        assert_eq!(pool.len(), 1);
        assert_eq!(backend.opens("mem://a"), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let (pool, backend) = pool(1);
        touch(&pool, &key("mem://a"));
        touch(&pool, &key("mem://b"));
        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(&key("mem://a")));
        assert!(pool.contains(&key("mem://b")));
        assert_eq!(backend.live_handles(), 1);
    }

    #[test]
    fn least_recently_used_idle_entry_is_evicted() {
        let (pool, _) = pool(2);
        touch(&pool, &key("mem://a"));
        touch(&pool, &key("mem://b"));
        touch(&pool, &key("mem://a"));
        touch(&pool, &key("mem://c"));
        assert!(pool.contains(&key("mem://a")));
        assert!(!pool.contains(&key("mem://b")));
        assert!(pool.contains(&key("mem://c")));
    }

    #[test]
    fn busy_entries_are_not_evicted() {
        let (pool, _) = pool(1);
        let held = pool.acquire_or_open(&key("mem://a")).unwrap();
        let err = pool.acquire_or_open(&key("mem://b")).err().unwrap();
        assert_eq!(err, WarpError::ResourceExhausted { capacity: 1 });
        drop(held);
        assert!(pool.acquire_or_open(&key("mem://b")).is_ok());
    }

    #[test]
    fn invalidate_forces_a_reopen() {
        let (pool, backend) = pool(2);
        let k = key("mem://a");
        touch(&pool, &k);
        let before = pool.generation(&k).unwrap();
        {
            let entry = pool.acquire_or_open(&k).unwrap();
            pool.invalidate(&entry);
        }
        touch(&pool, &k);
        assert!(pool.generation(&k).unwrap() > before);
        assert_eq!(backend.opens("mem://a"), 2);
        assert_eq!(backend.live_handles(), 1);
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn evicted_entry_refuses_to_reopen() {
        let (pool, _) = pool(2);
        let k = key("mem://a");
        touch(&pool, &k);
        let stale = {
            let state = pool.state.lock();
            Arc::clone(&state.entries.get(&k).unwrap()[0])
        };
        assert_eq!(pool.evict_idle(), Some(k));
        let claim = EntryRef::new(stale);
        let mut lock = claim.lock();
        let err = pool.dataset(&mut lock).err().unwrap();
        assert!(err.is_transient());
    }

    #[test]
    fn copies_are_distinct_entries_within_capacity() {
        let (pool, backend) = pool(3);
        let a = key("mem://a");
        let claims = pool.acquire(&a, 2).unwrap();
        assert_eq!(claims.len(), 2);
        assert_ne!(claims[0].inserted, claims[1].inserted);
        assert_eq!(pool.copies(&a), 2);

        // both copies of a are claimed, so b only gets the one free slot
        let b = pool.acquire(&key("mem://b"), 2).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(pool.len(), 3);

        for claim in &claims {
            let mut lock = claim.lock();
            pool.dataset(&mut lock).unwrap();
        }
        assert_eq!(backend.opens("mem://a"), 2);
        assert_eq!(pool.open_count(), 2);
    }

    #[test]
    fn try_lock_skips_a_held_copy() {
        let (pool, _) = pool(2);
        let claims = pool.acquire(&key("mem://a"), 2).unwrap();
        let _held = claims[0].lock();
        assert!(claims[0].try_lock().is_none());
        assert!(claims[1].try_lock().is_some());
    }

    #[test]
    fn open_count_drops_after_the_close() {
        let (pool, backend) = pool(1);
        touch(&pool, &key("mem://a"));
        assert_eq!(pool.open_count(), 1);
        touch(&pool, &key("mem://b"));
        assert_eq!(pool.open_count(), 1);
        assert_eq!(backend.live_handles(), 1);
        assert_eq!(backend.max_live_handles(), 1);
    }

    #[test]
    fn clear_closes_everything_and_shutdown_refuses_claims() {
        let (pool, backend) = pool(3);
        touch(&pool, &key("mem://a"));
        touch(&pool, &key("mem://b"));
        assert_eq!(pool.clear(true), 2);
        assert_eq!(backend.live_handles(), 0);
        assert_eq!(pool.open_count(), 0);
        assert_eq!(
            pool.acquire_or_open(&key("mem://a")).err(),
            Some(WarpError::NotInitialized)
        );
    }
}
