//! GPU residency cache
//!
//! Keyed store of GPU-resident grids under a byte budget. Entries are
//! evicted least-recently-accessed first. Every lookup, touch and publish
//! takes a new tick of the access clock; [`ResidentCache::touch_many`]
//! gives a whole batch the same tick, and among equal ticks the coarser LOD
//! goes first, then the older insertion. Pinned entries and entries with a
//! live [`ResidentHandle`] are never evicted.
//!
//! The map, the LRU index and the budget sit behind one mutex. No I/O and no
//! GPU work happens while it is held.

use crate::math::Aabb;
use crate::streaming::budget::MemoryBudget;
use crate::streaming::buffer_pool::GpuBuffer;
use crate::streaming::key::{FrameKey, SequenceId};
use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;

/// Default pin limit: the current frame and the previous one
pub const DEFAULT_MAX_PINNED: usize = 2;

/// Residency cache errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Larger than the whole budget; retrying cannot help
    #[error("{key} needs {bytes} bytes, more than the {ceiling} byte budget")]
    TooLarge { key: FrameKey, bytes: u64, ceiling: u64 },

    /// Pinned or read-held entries leave no room right now
    #[error("{key} needs {bytes} bytes but only {evictable} can be freed")]
    BudgetExhausted { key: FrameKey, bytes: u64, evictable: u64 },

    #[error("cannot pin {key}: {max} entries already pinned")]
    PinLimitReached { key: FrameKey, max: usize },

    #[error("{0} is not resident")]
    NotResident(FrameKey),

    #[error("{0} is already resident or being inserted")]
    Duplicate(FrameKey),
}

impl CacheError {
    /// Whether the failure holds for the rest of the session
    pub fn is_permanent(&self) -> bool {
        matches!(self, CacheError::TooLarge { .. })
    }
}

/// Grid metadata supplied at publish time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridInfo {
    pub bounds: Aabb,
    pub active_voxel_count: u64,
}

/// A GPU-resident grid
#[derive(Debug)]
pub struct ResidentGrid {
    pub key: FrameKey,
    /// Bytes charged against the budget
    pub bytes: u64,
    pub bounds: Aabb,
    pub active_voxel_count: u64,
    pub buffer: GpuBuffer,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pinned: usize,
    pub held: usize,
    pub charged_bytes: u64,
    pub reserved_bytes: u64,
    pub ceiling_bytes: u64,
    pub requested_ceiling_bytes: u64,
    pub pressure: f32,
    pub frame: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejections: u64,
}

/// LRU position: (last access tick, LOD, insertion stamp, key)
type LruKey = (u64, u8, u64, FrameKey);

#[derive(Debug)]
struct Entry {
    grid: Arc<ResidentGrid>,
    last_access: u64,
    stamp: u64,
    pinned: bool,
    readers: usize,
}

impl Entry {
    /// Level 0 is the coarsest, so ascending LOD evicts coarser detail
    /// first on equal access ticks
    fn lru_key(&self) -> LruKey {
        (self.last_access, self.grid.key.lod, self.stamp, self.grid.key)
    }

    fn evictable(&self) -> bool {
        !self.pinned && self.readers == 0
    }
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<FrameKey, Entry>,
    lru: BTreeSet<LruKey>,
    /// Open reservations and their charged bytes
    reserved: HashMap<FrameKey, u64>,
    budget: MemoryBudget,
    /// Ceiling last asked for; the budget may sit above it while pinned
    /// bytes do not fit under it
    requested_ceiling: u64,
    frame: u64,
    access_clock: u64,
    next_stamp: u64,
    pinned: usize,
    max_pinned: usize,
    /// Evicted grids whose buffers the upload pipeline will recycle
    retired: Vec<Arc<ResidentGrid>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejections: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    fn touch(&mut self, key: FrameKey) {
        let tick = self.tick();
        self.touch_at(key, tick);
    }

    fn touch_at(&mut self, key: FrameKey, tick: u64) {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.last_access != tick {
                self.lru.remove(&entry.lru_key());
                entry.last_access = tick;
                self.lru.insert(entry.lru_key());
            }
        }
    }

    /// Evictable keys in eviction order, until `bytes` are covered.
    ///
    /// Returns `None` if evicting everything evictable would not free enough.
    fn victims_for(&self, bytes: u64) -> Option<Vec<FrameKey>> {
        let mut freed = 0u64;
        let mut victims = Vec::new();
        for &(_, _, _, key) in &self.lru {
            if freed >= bytes {
                break;
            }
            let Some(entry) = self.entries.get(&key) else { continue };
            if entry.evictable() {
                freed += entry.grid.bytes;
                victims.push(key);
            }
        }
        (freed >= bytes).then_some(victims)
    }

    fn evictable_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.evictable())
            .map(|e| e.grid.bytes)
            .sum()
    }

    fn remove_entry(&mut self, key: FrameKey) -> Option<Arc<ResidentGrid>> {
        let entry = self.entries.remove(&key)?;
        self.lru.remove(&entry.lru_key());
        self.budget.refund(entry.grid.bytes);
        if entry.pinned {
            self.pinned -= 1;
        }
        Some(entry.grid)
    }

    fn evict(&mut self, key: FrameKey) {
        if let Some(grid) = self.remove_entry(key) {
            log::trace!("Evicted {} ({} bytes)", key, grid.bytes);
            self.evictions += 1;
            self.retired.push(grid);
        }
    }

    /// Evict down to the requested ceiling as far as possible, then set the
    /// effective ceiling to whatever the unevictable bytes require
    fn enforce_ceiling(&mut self) {
        let target = self.requested_ceiling;
        if self.budget.charged() > target {
            let excess = self.budget.charged() - target;
            let victims = match self.victims_for(excess) {
                Some(victims) => victims,
                // Not all of it can go; evict what we can
                None => self
                    .lru
                    .iter()
                    .map(|&(_, _, _, key)| key)
                    .filter(|key| self.entries.get(key).is_some_and(Entry::evictable))
                    .collect(),
            };
            for key in victims {
                self.evict(key);
            }
        }

        let effective = target.max(self.budget.charged());
        if effective != self.budget.ceiling() {
            if effective > target {
                log::warn!(
                    "Budget ceiling {} is below {} unevictable bytes, holding at {}",
                    target,
                    self.budget.charged(),
                    effective
                );
            }
            self.budget.set_ceiling(effective);
        }
    }

    fn release_reader(&mut self, grid: &Arc<ResidentGrid>) {
        if let Some(entry) = self.entries.get_mut(&grid.key) {
            if Arc::ptr_eq(&entry.grid, grid) {
                entry.readers = entry.readers.saturating_sub(1);
            }
        }
    }

    fn acquire_reader(&mut self, grid: &Arc<ResidentGrid>) {
        if let Some(entry) = self.entries.get_mut(&grid.key) {
            if Arc::ptr_eq(&entry.grid, grid) {
                entry.readers += 1;
            }
        }
    }
}

fn lock_state(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read handle to a resident grid.
///
/// While any handle exists the entry is exempt from eviction, and the grid
/// (with its GPU buffer) lives until the last handle drops, even after the
/// entry itself was removed.
#[derive(Debug)]
pub struct ResidentHandle {
    grid: Arc<ResidentGrid>,
    cache: Weak<Mutex<CacheState>>,
}

impl ResidentHandle {
    pub fn key(&self) -> FrameKey {
        self.grid.key
    }

    /// Whether both handles refer to the same resident grid
    pub fn same_grid(&self, other: &ResidentHandle) -> bool {
        Arc::ptr_eq(&self.grid, &other.grid)
    }
}

impl Deref for ResidentHandle {
    type Target = ResidentGrid;

    fn deref(&self) -> &ResidentGrid {
        &self.grid
    }
}

impl Clone for ResidentHandle {
    fn clone(&self) -> Self {
        if let Some(state) = self.cache.upgrade() {
            lock_state(&state).acquire_reader(&self.grid);
        }
        Self {
            grid: Arc::clone(&self.grid),
            cache: self.cache.clone(),
        }
    }
}

impl Drop for ResidentHandle {
    fn drop(&mut self) {
        if let Some(state) = self.cache.upgrade() {
            lock_state(&state).release_reader(&self.grid);
        }
    }
}

/// Budget charged for a grid that is not visible yet.
///
/// Dropping a reservation without publishing refunds the budget.
#[derive(Debug)]
pub struct Reservation {
    key: FrameKey,
    bytes: u64,
    cache: Weak<Mutex<CacheState>>,
    armed: bool,
}

impl Reservation {
    pub fn key(&self) -> FrameKey {
        self.key
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(state) = self.cache.upgrade() {
            let mut state = lock_state(&state);
            if state.reserved.remove(&self.key).is_some() {
                state.budget.refund(self.bytes);
                log::trace!("Reservation for {} dropped, refunded {} bytes", self.key, self.bytes);
            }
        }
    }
}

/// Shared residency cache; clones refer to the same store
#[derive(Debug, Clone)]
pub struct ResidentCache {
    state: Arc<Mutex<CacheState>>,
}

impl ResidentCache {
    /// Create a new cache
    ///
    /// # Arguments
    /// * `ceiling_bytes` - GPU byte budget
    /// * `max_pinned` - Maximum number of simultaneously pinned entries
    pub fn new(ceiling_bytes: u64, max_pinned: usize) -> Self {
        let state = CacheState {
            entries: HashMap::new(),
            lru: BTreeSet::new(),
            reserved: HashMap::new(),
            budget: MemoryBudget::new(ceiling_bytes),
            requested_ceiling: ceiling_bytes,
            frame: 0,
            access_clock: 0,
            next_stamp: 0,
            pinned: 0,
            max_pinned,
            retired: Vec::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            rejections: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        lock_state(&self.state)
    }

    /// Look up a resident grid, marking it accessed
    pub fn lookup(&self, key: FrameKey) -> Option<ResidentHandle> {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            state.misses += 1;
            return None;
        };
        entry.readers += 1;
        let grid = Arc::clone(&entry.grid);
        state.hits += 1;
        state.touch(key);

        Some(ResidentHandle {
            grid,
            cache: Arc::downgrade(&self.state),
        })
    }

    /// Whether a key is resident (does not count as an access)
    pub fn contains(&self, key: FrameKey) -> bool {
        self.lock().entries.contains_key(&key)
    }

    /// Mark a resident key accessed without taking a handle
    pub fn touch(&self, key: FrameKey) {
        self.lock().touch(key);
    }

    /// Mark several keys accessed at the same instant
    pub fn touch_many(&self, keys: impl IntoIterator<Item = FrameKey>) {
        let mut state = self.lock();
        let tick = state.tick();
        for key in keys {
            state.touch_at(key, tick);
        }
    }

    /// Charge `bytes` for `key`, evicting as needed.
    ///
    /// Eviction and charging happen under one lock, so the budget invariant
    /// holds for every observer. Nothing is evicted if the request fails.
    pub fn reserve(&self, key: FrameKey, bytes: u64) -> Result<Reservation, CacheError> {
        let mut state = self.lock();

        if state.entries.contains_key(&key) || state.reserved.contains_key(&key) {
            return Err(CacheError::Duplicate(key));
        }

        if !state.budget.can_ever_fit(bytes) {
            state.rejections += 1;
            return Err(CacheError::TooLarge {
                key,
                bytes,
                ceiling: state.budget.ceiling(),
            });
        }

        let shortfall = state.budget.shortfall(bytes);
        if shortfall > 0 {
            let Some(victims) = state.victims_for(shortfall) else {
                state.rejections += 1;
                return Err(CacheError::BudgetExhausted {
                    key,
                    bytes,
                    evictable: state.evictable_bytes(),
                });
            };
            for victim in victims {
                state.evict(victim);
            }
        }

        state.budget.charge(bytes);
        state.reserved.insert(key, bytes);
        log::trace!("Reserved {} bytes for {}", bytes, key);

        Ok(Reservation {
            key,
            bytes,
            cache: Arc::downgrade(&self.state),
            armed: true,
        })
    }

    /// Make a reserved grid visible
    pub fn publish(&self, mut reservation: Reservation, buffer: GpuBuffer, info: GridInfo) -> ResidentHandle {
        reservation.armed = false;
        let key = reservation.key;
        let bytes = reservation.bytes;

        // Bytes stay charged; they now belong to the entry
        let mut state = self.lock();
        state.reserved.remove(&key);

        let grid = Arc::new(ResidentGrid {
            key,
            bytes,
            bounds: info.bounds,
            active_voxel_count: info.active_voxel_count,
            buffer,
        });
        let last_access = state.tick();
        let entry = Entry {
            grid: Arc::clone(&grid),
            last_access,
            stamp: state.next_stamp,
            pinned: false,
            readers: 1,
        };
        state.next_stamp += 1;
        state.lru.insert(entry.lru_key());
        state.entries.insert(key, entry);
        log::trace!("Published {} ({} bytes)", key, bytes);

        ResidentHandle {
            grid,
            cache: Arc::downgrade(&self.state),
        }
    }

    /// Reserve and publish in one step
    pub fn insert(
        &self,
        key: FrameKey,
        bytes: u64,
        buffer: GpuBuffer,
        info: GridInfo,
    ) -> Result<ResidentHandle, CacheError> {
        let reservation = self.reserve(key, bytes)?;
        Ok(self.publish(reservation, buffer, info))
    }

    /// Pin a resident entry so it is never evicted
    pub fn pin(&self, key: FrameKey) -> Result<(), CacheError> {
        let mut state = self.lock();
        let max = state.max_pinned;
        let pinned = state.pinned;
        let entry = state.entries.get_mut(&key).ok_or(CacheError::NotResident(key))?;
        if entry.pinned {
            return Ok(());
        }
        if pinned >= max {
            return Err(CacheError::PinLimitReached { key, max });
        }
        entry.pinned = true;
        state.pinned += 1;
        Ok(())
    }

    /// Unpin an entry; returns whether it was pinned
    pub fn unpin(&self, key: FrameKey) -> bool {
        let mut state = self.lock();
        let was_pinned = match state.entries.get_mut(&key) {
            Some(entry) if entry.pinned => {
                entry.pinned = false;
                true
            }
            _ => false,
        };
        if was_pinned {
            state.pinned -= 1;
        }
        was_pinned
    }

    pub fn is_pinned(&self, key: FrameKey) -> bool {
        self.lock().entries.get(&key).is_some_and(|e| e.pinned)
    }

    pub fn set_max_pinned(&self, max_pinned: usize) {
        self.lock().max_pinned = max_pinned;
    }

    /// Advance the cache frame counter. Also retries a lowered ceiling that
    /// pinned bytes held up.
    pub fn begin_frame(&self) -> u64 {
        let mut state = self.lock();
        state.frame += 1;
        if state.budget.ceiling() > state.requested_ceiling {
            state.enforce_ceiling();
        }
        state.frame
    }

    /// Apply a new byte budget, evicting down to it where possible
    pub fn set_ceiling(&self, ceiling_bytes: u64) {
        let mut state = self.lock();
        state.requested_ceiling = ceiling_bytes;
        state.enforce_ceiling();
    }

    /// Remove every entry of a sequence, pinned or not.
    ///
    /// Outstanding handles keep their grids alive.
    pub fn remove_sequence(&self, sequence: SequenceId) -> usize {
        let mut state = self.lock();
        let keys: Vec<FrameKey> = state
            .entries
            .keys()
            .filter(|k| k.sequence == sequence)
            .copied()
            .collect();
        for &key in &keys {
            if let Some(grid) = state.remove_entry(key) {
                state.retired.push(grid);
            }
        }
        keys.len()
    }

    /// Resident LOD levels of a frame, ascending
    pub fn resident_lods(&self, sequence: SequenceId, frame: u32) -> Vec<u8> {
        let state = self.lock();
        let mut levels: Vec<u8> = state
            .entries
            .keys()
            .filter(|k| k.sequence == sequence && k.frame == frame)
            .map(|k| k.lod)
            .collect();
        levels.sort_unstable();
        levels
    }

    /// All resident keys (unordered)
    pub fn resident_keys(&self) -> Vec<FrameKey> {
        self.lock().entries.keys().copied().collect()
    }

    /// Take the grids evicted since the last call
    pub fn take_retired(&self) -> Vec<Arc<ResidentGrid>> {
        std::mem::take(&mut self.lock().retired)
    }

    pub fn charged_bytes(&self) -> u64 {
        self.lock().budget.charged()
    }

    pub fn ceiling(&self) -> u64 {
        self.lock().budget.ceiling()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            pinned: state.pinned,
            held: state.entries.values().filter(|e| e.readers > 0).count(),
            charged_bytes: state.budget.charged(),
            reserved_bytes: state.reserved.values().sum(),
            ceiling_bytes: state.budget.ceiling(),
            requested_ceiling_bytes: state.requested_ceiling,
            pressure: state.budget.pressure(),
            frame: state.frame,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            rejections: state.rejections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SEQ: SequenceId = SequenceId(1);

    fn key(frame: u32, lod: u8) -> FrameKey {
        FrameKey::new(SEQ, frame, lod)
    }

    fn host(bytes: u64) -> GpuBuffer {
        GpuBuffer::Host(vec![0u8; bytes as usize].into_boxed_slice())
    }

    fn info() -> GridInfo {
        GridInfo { bounds: Aabb::unit(), active_voxel_count: 8 }
    }

    fn insert(cache: &ResidentCache, key: FrameKey, bytes: u64) -> Result<(), CacheError> {
        cache.insert(key, bytes, host(bytes), info()).map(drop)
    }

    #[test]
    fn test_insert_evicts_lru() {
        let cache = ResidentCache::new(100, 2);
        let a = key(0, 0);
        let b = key(1, 0);

        insert(&cache, a, 60).expect("A fits");
        insert(&cache, b, 50).expect("B fits after evicting A");

        assert!(!cache.contains(a));
        assert!(cache.contains(b));
        assert_eq!(cache.charged_bytes(), 50);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_too_large_is_permanent() {
        let cache = ResidentCache::new(100, 2);
        let err = insert(&cache, key(0, 0), 101).expect_err("over the ceiling");
        assert!(matches!(err, CacheError::TooLarge { bytes: 101, ceiling: 100, .. }));
        assert!(err.is_permanent());
        assert_eq!(cache.charged_bytes(), 0);
    }

    #[test]
    fn test_pinned_entry_survives_pressure() {
        let cache = ResidentCache::new(100, 2);
        let pinned = key(7, 1);
        insert(&cache, pinned, 40).expect("insert");
        cache.pin(pinned).expect("pin");

        for frame in 8..20 {
            cache.begin_frame();
            insert(&cache, key(frame, 1), 30).expect("room after evicting unpinned");
        }

        assert!(cache.contains(pinned));
        assert!(cache.charged_bytes() <= 100);

        // Only 60 bytes are evictable now
        let err = insert(&cache, key(99, 0), 70).expect_err("pinned bytes block");
        assert!(matches!(err, CacheError::BudgetExhausted { .. }));
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_handle_blocks_eviction_and_outlives_entry() {
        let cache = ResidentCache::new(100, 2);
        let a = key(0, 0);
        cache.insert(a, 60, host(60), info()).expect("insert");

        let handle = cache.lookup(a).expect("resident");
        assert!(matches!(insert(&cache, key(1, 0), 50), Err(CacheError::BudgetExhausted { .. })));

        drop(handle);
        insert(&cache, key(1, 0), 50).expect("A evictable once released");
        assert!(!cache.contains(a));

        // A handle keeps the grid alive after teardown
        let handle = cache.lookup(key(1, 0)).expect("resident");
        assert_eq!(cache.remove_sequence(SEQ), 1);
        assert_eq!(handle.bytes, 50);
        assert_eq!(handle.buffer.size(), 50);
        assert_eq!(cache.charged_bytes(), 0);
    }

    #[test]
    fn test_cloned_handle_counts_as_reader() {
        let cache = ResidentCache::new(100, 2);
        let a = key(0, 0);
        insert(&cache, a, 60).expect("insert");

        let first = cache.lookup(a).expect("resident");
        let second = first.clone();
        drop(first);
        assert_eq!(cache.stats().held, 1);
        assert!(insert(&cache, key(1, 0), 50).is_err());

        drop(second);
        assert_eq!(cache.stats().held, 0);
    }

    #[test]
    fn test_lookup_refreshes_recency() {
        let cache = ResidentCache::new(100, 2);
        let a = key(0, 1);
        let b = key(1, 1);
        insert(&cache, a, 40).expect("insert");
        insert(&cache, b, 40).expect("insert");

        drop(cache.lookup(a).expect("resident"));
        insert(&cache, key(2, 1), 40).expect("room after evicting B");

        assert!(cache.contains(a));
        assert!(!cache.contains(b));
    }

    #[test]
    fn test_eviction_order() {
        let cache = ResidentCache::new(300, 2);
        insert(&cache, key(0, 2), 100).expect("insert");
        insert(&cache, key(1, 0), 100).expect("insert");
        insert(&cache, key(2, 1), 100).expect("insert");

        // Same access tick: coarser LOD goes first
        cache.touch_many([key(0, 2), key(1, 0), key(2, 1)]);
        insert(&cache, key(3, 2), 100).expect("insert");
        assert!(!cache.contains(key(1, 0)));

        insert(&cache, key(4, 2), 100).expect("insert");
        assert!(!cache.contains(key(2, 1)));

        // Recently accessed entries outlive older ones regardless of LOD
        cache.touch(key(0, 2));
        insert(&cache, key(5, 2), 100).expect("insert");
        assert!(cache.contains(key(0, 2)));
        assert!(!cache.contains(key(3, 2)));
    }

    #[test]
    fn test_oldest_insertion_evicted_without_access() {
        let cache = ResidentCache::new(200, 2);
        insert(&cache, key(5, 1), 100).expect("insert");
        insert(&cache, key(2, 1), 100).expect("insert");
        insert(&cache, key(9, 1), 100).expect("insert");
        assert!(!cache.contains(key(5, 1)));
        assert!(cache.contains(key(2, 1)));
    }

    #[test]
    fn test_reservation_refunds_on_drop() {
        let cache = ResidentCache::new(100, 2);
        let reservation = cache.reserve(key(0, 0), 80).expect("reserve");
        assert_eq!(cache.charged_bytes(), 80);
        assert!(!cache.contains(key(0, 0)));
        assert!(matches!(cache.reserve(key(0, 0), 10), Err(CacheError::Duplicate(_))));

        drop(reservation);
        assert_eq!(cache.charged_bytes(), 0);
        assert_eq!(cache.stats().reserved_bytes, 0);
    }

    #[test]
    fn test_reserved_bytes_are_not_evictable() {
        let cache = ResidentCache::new(100, 2);
        let _reservation = cache.reserve(key(0, 0), 80).expect("reserve");
        assert!(matches!(
            cache.reserve(key(1, 0), 30),
            Err(CacheError::BudgetExhausted { evictable: 0, .. })
        ));
    }

    #[test]
    fn test_publish_after_reserve() {
        let cache = ResidentCache::new(100, 2);
        let reservation = cache.reserve(key(3, 1), 40).expect("reserve");
        let handle = cache.publish(reservation, host(40), info());
        assert_eq!(handle.key(), key(3, 1));
        assert_eq!(cache.charged_bytes(), 40);
        assert_eq!(cache.stats().reserved_bytes, 0);
        assert!(cache.lookup(key(3, 1)).expect("resident").same_grid(&handle));
    }

    #[test]
    fn test_pin_limit() {
        let cache = ResidentCache::new(1000, 2);
        for frame in 0..3 {
            insert(&cache, key(frame, 0), 10).expect("insert");
        }
        cache.pin(key(0, 0)).expect("pin");
        cache.pin(key(1, 0)).expect("pin");
        cache.pin(key(1, 0)).expect("pinning twice is a no-op");
        assert!(matches!(cache.pin(key(2, 0)), Err(CacheError::PinLimitReached { max: 2, .. })));
        assert!(matches!(cache.pin(key(9, 0)), Err(CacheError::NotResident(_))));

        assert!(cache.unpin(key(0, 0)));
        assert!(!cache.unpin(key(0, 0)));
        cache.pin(key(2, 0)).expect("room after unpin");
        assert_eq!(cache.stats().pinned, 2);
    }

    #[test]
    fn test_lowered_ceiling_evicts_and_holds_for_pins() {
        let cache = ResidentCache::new(300, 2);
        insert(&cache, key(0, 0), 100).expect("insert");
        insert(&cache, key(1, 0), 100).expect("insert");
        insert(&cache, key(2, 0), 100).expect("insert");
        cache.pin(key(2, 0)).expect("pin");
        cache.pin(key(1, 0)).expect("pin");

        cache.set_ceiling(50);
        assert!(!cache.contains(key(0, 0)));
        // Pinned bytes hold the effective ceiling up
        assert_eq!(cache.ceiling(), 200);
        assert!(cache.charged_bytes() <= cache.ceiling());

        cache.unpin(key(1, 0));
        cache.unpin(key(2, 0));
        cache.begin_frame();
        assert_eq!(cache.charged_bytes(), 0);
        assert_eq!(cache.ceiling(), 50);
    }

    #[test]
    fn test_retired_grids() {
        let cache = ResidentCache::new(100, 2);
        insert(&cache, key(0, 0), 60).expect("insert");
        insert(&cache, key(1, 0), 60).expect("insert");
        let retired = cache.take_retired();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].key, key(0, 0));
        assert!(cache.take_retired().is_empty());
    }

    #[test]
    fn test_resident_lods() {
        let cache = ResidentCache::new(1000, 2);
        insert(&cache, key(4, 2), 10).expect("insert");
        insert(&cache, key(4, 0), 10).expect("insert");
        insert(&cache, key(5, 1), 10).expect("insert");
        assert_eq!(cache.resident_lods(SEQ, 4), vec![0, 2]);
        assert!(cache.resident_lods(SequenceId(2), 4).is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_inserts() {
        let cache = ResidentCache::new(10_000, 2);
        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for frame in 0..500 {
                    insert(&cache, key(frame, 0), 100).expect("insert");
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for frame in 0..500 {
                        if let Some(handle) = cache.lookup(key(frame, 0)) {
                            assert_eq!(handle.bytes, 100);
                            assert_eq!(handle.buffer.size(), 100);
                        }
                        assert!(cache.charged_bytes() <= 10_000);
                    }
                })
            })
            .collect();

        writer.join().expect("writer panicked");
        for reader in readers {
            reader.join().expect("reader panicked");
        }
        assert_eq!(cache.stats().held, 0);
        assert_eq!(cache.charged_bytes(), 10_000);
    }
}
