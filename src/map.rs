//! The shared hash map.
//!
//! Two slot arrays back a map: the bucket array (one `u64` chain head per
//! bucket) and the entry array. Bucket array header slots hold the control
//! words, entry array header slots hold the layout fingerprint and the
//! journal.
//!
//! ```text
//! bucket header                    entry header
//! 0 lock (pid)                     0 journal flags
//! 1 version                        1 layout fingerprint
//! 2 next version                   2 reserved max capacity
//! 3 count                          3..=7 journal copies
//! 4 free list (+1)
//! 5 free count
//! 6 generation
//! ```
//!
//! Growing never rehashes. An entry stays in the chain of the bucket it was
//! inserted into, computed modulo the capacity of the generation that was
//! current at the time, so lookups walk the matching bucket of every
//! generation from the newest down.

use std::hash::{BuildHasher, Hash};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use ahash::RandomState;
use tracing::{debug, info, warn};

use crate::array::{MemorySlotArray, MmapSlotArray, SlotArray};
use crate::buffer::{DirectBuffer, Plain};
use crate::entry::{self, Buckets, Entries, END, FREE};
use crate::fault::{FaultHook, FaultPoint};
use crate::journal::{Journal, PendingStep};
use crate::lock::{self, Acquisition, LivenessCheck, LockContext, OsLiveness, ProcessId, WriteGuard};
use crate::metrics::MapMetrics;
use crate::primes::{generation_for, prime, MAX_CAPACITY, PRIMES};
use crate::util::{Backoff, SpinBackoff, SpinConfig};
use crate::{MapError, OpenError};

const COUNT: usize = 3 * 8;
const FREE_LIST: usize = 4 * 8;
const FREE_COUNT: usize = 5 * 8;
const GENERATION: usize = 6 * 8;

const FINGERPRINT: usize = 8;
const RESERVED_CAPACITY: usize = 2 * 8;

const MIN_CAPACITY: usize = 5;
const DEFAULT_MAX_CAPACITY: usize = 1 << 20;

/// Hashed into the layout fingerprint so maps built with different hashers
/// refuse each other's files.
const FINGERPRINT_SEED: u64 = 0x6469_7265_6374_6d61;

/// Hasher with fixed seeds. Every process sharing a map must hash keys the
/// same way, so the per-process random seeds of `RandomState::new()` will not
/// do.
pub fn stable_hasher() -> RandomState {
    RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
}

/// Builder for [`DirectMap`]
pub struct DirectMapBuilder<S = RandomState> {
    path: PathBuf,
    capacity: usize,
    max_capacity: usize,
    hasher: S,
    spin: SpinConfig,
    backoff: Box<dyn Backoff>,
    liveness: Box<dyn LivenessCheck>,
    process_id: Option<ProcessId>,
    fault_hook: Option<FaultHook>,
}

impl Default for DirectMapBuilder<RandomState> {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            capacity: MIN_CAPACITY,
            max_capacity: DEFAULT_MAX_CAPACITY,
            hasher: stable_hasher(),
            spin: SpinConfig::default(),
            backoff: Box::new(SpinBackoff),
            liveness: Box::new(OsLiveness),
            process_id: None,
            fault_hook: None,
        }
    }
}

impl DirectMapBuilder<RandomState> {
    /// Map stored in `<path>-buckets` and `<path>-entries`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

impl<S: BuildHasher> DirectMapBuilder<S> {
    /// Initial capacity, raised to the next generation size
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Largest capacity the map may grow to. Address space for it is
    /// reserved up front. Ignored when opening files that already record one.
    pub fn max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Key hasher. Must be deterministic across processes.
    pub fn hasher<T: BuildHasher>(self, hasher: T) -> DirectMapBuilder<T> {
        DirectMapBuilder {
            path: self.path,
            capacity: self.capacity,
            max_capacity: self.max_capacity,
            hasher,
            spin: self.spin,
            backoff: self.backoff,
            liveness: self.liveness,
            process_id: self.process_id,
            fault_hook: self.fault_hook,
        }
    }

    pub fn spin(mut self, spin: SpinConfig) -> Self {
        self.spin = spin;
        self
    }

    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    /// How lock holders are checked for liveness
    pub fn liveness(mut self, liveness: impl LivenessCheck + 'static) -> Self {
        self.liveness = Box::new(liveness);
        self
    }

    /// Identity written into the lock word. Defaults to the current process.
    pub fn process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = Some(process_id);
        self
    }

    pub fn fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = Some(hook);
        self
    }

    /// `(initial, maximum)` generations.
    fn generations(&self) -> Result<(usize, usize), OpenError> {
        let capacity = self.capacity.max(MIN_CAPACITY);
        let invalid = OpenError::InvalidCapacity {
            capacity,
            maximum: self.max_capacity,
        };
        if capacity > self.max_capacity || self.max_capacity > MAX_CAPACITY {
            return Err(invalid);
        }
        match (generation_for(capacity), generation_for(self.max_capacity)) {
            (Some(initial), Some(maximum)) => Ok((initial, maximum)),
            _ => Err(invalid),
        }
    }

    /// Open or create the file-backed map.
    pub fn build<K, V>(self) -> Result<DirectMap<K, V, MmapSlotArray, S>, OpenError>
    where
        K: Plain + Hash + Eq,
        V: Plain,
    {
        let (initial, maximum) = self.generations()?;
        let item_size = entry::item_size::<K, V>();
        let path = self.path.clone();
        let (buckets, entries) = open_files(&path, item_size, prime(maximum))?;
        let mut map = DirectMap::assemble(buckets, entries, maximum, self);

        let mut adopted = false;
        loop {
            match map.initialize(initial.min(map.max_generation)) {
                // Whoever stamped the files decided the reservation.
                Err(OpenError::ReservationMismatch { stored, .. }) if !adopted => {
                    let maximum = PRIMES
                        .iter()
                        .position(|&p| p as i64 == stored)
                        .ok_or(OpenError::InvalidStoredCapacity(stored))?;
                    debug!(
                        path = %path.display(),
                        max_capacity = stored,
                        "adopting reserved capacity of existing map"
                    );
                    (map.buckets, map.entries) = open_files(&path, item_size, prime(maximum))?;
                    map.max_generation = maximum;
                    adopted = true;
                }
                result => {
                    result?;
                    break;
                }
            }
        }

        info!(
            path = %path.display(),
            pid = %map.pid,
            generation = map.generation(),
            len = map.len(),
            "map opened"
        );
        Ok(map)
    }

    /// Map held in process memory. Shareable between threads only; the
    /// path is ignored.
    pub fn build_in_memory<K, V>(self) -> Result<DirectMap<K, V, MemorySlotArray, S>, OpenError>
    where
        K: Plain + Hash + Eq,
        V: Plain,
    {
        let (initial, maximum) = self.generations()?;
        let buckets = MemorySlotArray::new(std::mem::size_of::<u64>(), prime(maximum))?;
        let entries = MemorySlotArray::new(entry::item_size::<K, V>(), prime(maximum))?;
        let map = DirectMap::assemble(buckets, entries, maximum, self);
        map.initialize(initial)?;
        Ok(map)
    }
}

fn sibling(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn open_files(base: &Path, item_size: usize, max_capacity: usize) -> io::Result<(MmapSlotArray, MmapSlotArray)> {
    let buckets = MmapSlotArray::open(sibling(base, "-buckets"), std::mem::size_of::<u64>(), max_capacity)?;
    let entries = MmapSlotArray::open(sibling(base, "-entries"), item_size, max_capacity)?;
    Ok((buckets, entries))
}

enum Lookup {
    Found(i32),
    Missing,
    /// A concurrent writer moved things under the reader.
    Torn,
}

/// Hash map of fixed-size keys and values shared through two slot arrays.
///
/// Every handle, in this process or another, that opens the same files sees
/// the same map. Mutations serialize on the lock word; lookups run without
/// locking and retry when a writer overlapped them. A writer that dies
/// mid-mutation is detected by the next one to want the lock, which takes it
/// over and rolls the journaled steps back.
pub struct DirectMap<K, V, A = MmapSlotArray, S = RandomState> {
    buckets: A,
    entries: A,
    hasher: S,
    pid: ProcessId,
    spin: SpinConfig,
    backoff: Box<dyn Backoff>,
    liveness: Box<dyn LivenessCheck>,
    fault_hook: Option<FaultHook>,
    max_generation: usize,
    metrics: MapMetrics,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, A, S> DirectMap<K, V, A, S>
where
    K: Plain + Hash + Eq,
    V: Plain,
    A: SlotArray,
    S: BuildHasher,
{
    fn assemble(buckets: A, entries: A, max_generation: usize, builder: DirectMapBuilder<S>) -> Self {
        let DirectMapBuilder {
            hasher,
            spin,
            backoff,
            liveness,
            process_id,
            fault_hook,
            ..
        } = builder;

        Self {
            buckets,
            entries,
            hasher,
            pid: process_id.unwrap_or_else(ProcessId::current),
            spin,
            backoff,
            liveness,
            fault_hook,
            max_generation,
            metrics: MapMetrics::new(),
            _marker: PhantomData,
        }
    }

    /// Stamp or check the layout and reservation, roll back anything left
    /// open and grow to the requested generation.
    ///
    /// The stamp is only trusted under the lock: a reservation read before
    /// it may predate the first opener's stamp.
    fn initialize(&self, generation: usize) -> Result<(), OpenError> {
        let expected = self.fingerprint();
        let reservation = prime(self.max_generation);
        let _guard = self.lock(Acquisition::Write);

        let header = self.entries.header();
        // SAFETY: header slots are aligned words inside the header
        let stored = unsafe { header.volatile_read_i64(FINGERPRINT) } as u64;
        if stored == 0 {
            unsafe {
                header.volatile_write_i64(FINGERPRINT, expected as i64);
                header.volatile_write_i64(RESERVED_CAPACITY, reservation as i64);
            }
        } else if stored != expected {
            return Err(OpenError::LayoutMismatch { stored, expected });
        } else {
            let reserved = unsafe { header.volatile_read_i64(RESERVED_CAPACITY) };
            if reserved != reservation as i64 {
                return Err(OpenError::ReservationMismatch {
                    stored: reserved,
                    expected: reservation,
                });
            }
        }

        self.sync_capacity()?;
        self.recover_locked();
        if self.generation() < generation {
            let size = prime(generation);
            self.buckets.grow(size)?;
            self.entries.grow(size)?;
            self.set_generation(generation);
        }
        self.sync_capacity()?;
        Ok(())
    }

    fn fingerprint(&self) -> u64 {
        let item_size = entry::item_size::<K, V>() as u64;
        (item_size << 32) | (self.hasher.hash_one(FINGERPRINT_SEED) & 0xFFFF_FFFF)
    }

    // Control words

    fn control(&self) -> DirectBuffer<'_> {
        self.buckets.header()
    }

    fn count(&self) -> i32 {
        // SAFETY: header slots are aligned words inside the header
        unsafe { self.control().volatile_read_i32(COUNT) }
    }

    fn set_count(&self, count: i32) {
        unsafe { self.control().volatile_write_i32(COUNT, count) }
    }

    fn free_list(&self) -> i32 {
        let raw = unsafe { self.control().volatile_read_u32(FREE_LIST) };
        (raw as i64 - 1) as i32
    }

    fn set_free_list(&self, index: i32) {
        unsafe { self.control().volatile_write_u32(FREE_LIST, (index as i64 + 1) as u32) }
    }

    pub(crate) fn free_count(&self) -> i32 {
        unsafe { self.control().volatile_read_i32(FREE_COUNT) }
    }

    fn set_free_count(&self, free_count: i32) {
        unsafe { self.control().volatile_write_i32(FREE_COUNT, free_count) }
    }

    fn stored_generation(&self) -> usize {
        let generation = unsafe { self.control().volatile_read_i32(GENERATION) };
        generation.max(0) as usize
    }

    fn set_generation(&self, generation: usize) {
        unsafe { self.control().volatile_write_i32(GENERATION, generation as i32) };
    }

    /// Grow the local view to the shared generation. Another process may
    /// have grown the files since this handle last looked.
    fn sync_capacity(&self) -> io::Result<usize> {
        let generation = self.stored_generation();
        if generation > self.max_generation {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "generation {generation} beyond the reserved generation {}",
                    self.max_generation
                ),
            ));
        }
        let size = prime(generation);
        if self.buckets.capacity() < size || self.entries.capacity() < size {
            self.buckets.grow(size)?;
            self.entries.grow(size)?;
        }
        Ok(generation)
    }

    fn hash_of(&self, key: &K) -> i32 {
        (self.hasher.hash_one(key) as u32 & 0x7FFF_FFFF) as i32
    }

    fn fault(&self, point: FaultPoint) -> Result<(), MapError> {
        match &self.fault_hook {
            Some(hook) => hook(point).map_err(|_| MapError::Faulted(point)),
            None => Ok(()),
        }
    }

    // Locking

    fn context(&self) -> LockContext<'_> {
        LockContext {
            pid: self.pid,
            spin: self.spin,
            backoff: &*self.backoff,
            liveness: &*self.liveness,
            metrics: &self.metrics,
        }
    }

    fn lock(&self, mode: Acquisition) -> WriteGuard<'_> {
        lock::acquire(self.buckets.header(), &self.context(), mode)
    }

    /// Run `op` under the write lock, after syncing capacity and rolling
    /// back whatever a dead writer left open. A faulted mutation keeps the
    /// lock, as if the process had died there.
    fn write<R>(&self, op: impl FnOnce(usize) -> Result<R, MapError>) -> Result<R, MapError> {
        let guard = self.lock(Acquisition::Write);
        let result = self.sync_capacity().map_err(MapError::from).and_then(|generation| {
            let steps = self.recover_locked();
            if guard.stolen() {
                debug!(pid = %self.pid, steps, "write lock taken over from dead holder");
            }
            op(generation)
        });
        if let Err(MapError::Faulted(point)) = &result {
            debug!(pid = %self.pid, %point, "fault injected, abandoning write lock");
            guard.abandon();
        }
        result
    }

    /// Run `read` until no writer overlapped it. `read` gets the current
    /// generation and returns `None` for a torn view.
    fn read<T>(&self, mut read: impl FnMut(usize) -> Option<T>) -> T {
        lock::read_optimistic(
            self.buckets.header(),
            &self.context(),
            || match self.sync_capacity() {
                Ok(generation) => read(generation),
                Err(e) => {
                    debug!(error = %e, "capacity sync failed during read");
                    None
                }
            },
            || self.fix_versions(),
        )
    }

    /// A reader has been failing validation: the versions are stuck apart
    /// or a writer died. Take the lock without starting a new write and let
    /// the release line the versions up again.
    fn fix_versions(&self) {
        self.metrics.fix_versions.increment();
        let (version, next_version) = lock::versions(&self.control());
        debug!(version, next_version, "running fix-versions pass");

        let _guard = self.lock(Acquisition::FixVersions);
        match self.sync_capacity() {
            Ok(_) => {
                self.recover_locked();
            }
            Err(e) => warn!(error = %e, "capacity sync failed during fix-versions pass"),
        }
    }

    /// Roll back every open journal step, latest first. Returns the number
    /// of steps handled. Must hold the write lock.
    fn recover_locked(&self) -> usize {
        let journal = Journal::new(self.entries.header());
        if journal.is_clean() {
            return 0;
        }

        let unknown = journal.unknown_bits();
        if unknown != 0 {
            warn!(bits = unknown, "discarding unknown journal bits");
            journal.discard_unknown();
        }

        let steps = journal.pending();
        if steps.is_empty() {
            return 0;
        }
        warn!(
            flags = journal.flags(),
            steps = steps.len(),
            "rolling back interrupted mutation"
        );

        let buckets = Buckets::new(&self.buckets);
        let entries = Entries::<K, V>::new(&self.entries);
        for &step in &steps {
            debug!(?step, "rolling back");
            match step {
                PendingStep::Clear => self.wipe(),
                PendingStep::Release {
                    index,
                    free_list,
                    free_count,
                } => {
                    self.set_free_list(free_list);
                    self.set_free_count(free_count);
                    entries.unstash_link(index);
                }
                PendingStep::UnlinkMiddle { last, next } => entries.set_next(last, next),
                PendingStep::UnlinkHead { bucket, head } => buckets.set_head(bucket as usize, head),
                PendingStep::Publish {
                    bucket,
                    previous_head,
                } => buckets.set_head(bucket as usize, previous_head),
                PendingStep::Append { count } => self.set_count(count),
                PendingStep::PopFree {
                    free_list,
                    free_count,
                } => {
                    self.set_free_list(free_list);
                    self.set_free_count(free_count);
                    entries.unstash_link(free_list);
                }
                PendingStep::Overwrite { index } => entries.unstash(index),
            }
            journal.resolve(step);
        }

        self.metrics.recovery.increment();
        self.metrics.recovered_step.add(steps.len() as u64);
        steps.len()
    }

    fn wipe(&self) {
        self.buckets.clear();
        self.entries.clear();
        self.set_count(0);
        self.set_free_list(END);
        self.set_free_count(0);
    }

    /// Find `key` in the chain of its bucket in every generation, newest
    /// first.
    fn find_entry(&self, key: &K, hash: i32, generation: usize) -> Lookup {
        let buckets = Buckets::new(&self.buckets);
        let entries = Entries::<K, V>::new(&self.entries);

        for generation in (0..=generation).rev() {
            let bucket = hash as usize % prime(generation);
            if bucket >= buckets.len() {
                return Lookup::Torn;
            }
            let mut index = buckets.head(bucket);
            let mut steps = 0;
            while index != END {
                if !entries.contains(index) || steps > entries.len() {
                    return Lookup::Torn;
                }
                if entries.hash(index) == hash && entries.key(index) == *key {
                    return Lookup::Found(index);
                }
                index = entries.next(index);
                steps += 1;
            }
        }
        Lookup::Missing
    }

    // Mutations. All run under the write lock.

    fn insert_locked(&self, key: K, value: V, add_only: bool, generation: usize) -> Result<(), MapError> {
        let hash = self.hash_of(&key);
        let journal = Journal::new(self.entries.header());

        match self.find_entry(&key, hash, generation) {
            Lookup::Found(index) => {
                if add_only {
                    return Err(MapError::DuplicateKey);
                }
                let entries = Entries::<K, V>::new(&self.entries);
                entries.stash(index);
                journal.open(PendingStep::Overwrite { index });
                self.fault(FaultPoint::OverwriteJournaled)?;
                entries.set_value(index, value);
                self.fault(FaultPoint::OverwriteWritten)?;
                journal.commit();
                self.metrics.update.increment();
                return Ok(());
            }
            Lookup::Torn => return Err(MapError::Corrupted),
            Lookup::Missing => {}
        }

        let mut generation = generation;
        let free_count = self.free_count();
        let index = if free_count > 0 {
            let entries = Entries::<K, V>::new(&self.entries);
            let index = self.free_list();
            if !entries.contains(index) {
                return Err(MapError::Corrupted);
            }
            entries.stash_link(index);
            journal.open(PendingStep::PopFree {
                free_list: index,
                free_count,
            });
            self.fault(FaultPoint::FreePopJournaled)?;
            self.set_free_list(entries.next(index));
            self.fault(FaultPoint::FreeListAdvanced)?;
            self.set_free_count(free_count - 1);
            self.fault(FaultPoint::FreeCountDecremented)?;
            index
        } else {
            let count = self.count();
            if count as usize >= prime(generation) {
                generation = self.resize(generation)?;
            }
            journal.open(PendingStep::Append { count });
            self.fault(FaultPoint::AppendJournaled)?;
            self.set_count(count + 1);
            self.fault(FaultPoint::CountAdvanced)?;
            count
        };

        // Views taken after a possible resize
        let buckets = Buckets::new(&self.buckets);
        let entries = Entries::<K, V>::new(&self.entries);
        let bucket = hash as usize % prime(generation);
        let previous_head = buckets.head(bucket);
        journal.open(PendingStep::Publish {
            bucket: bucket as i32,
            previous_head,
        });
        self.fault(FaultPoint::PublishJournaled)?;
        entries.write(index, hash, previous_head, key, value);
        self.fault(FaultPoint::EntryWritten)?;
        buckets.set_head(bucket, index);
        self.fault(FaultPoint::BucketPublished)?;
        journal.commit();
        self.metrics.insert.increment();
        self.fault(FaultPoint::InsertCommitted)
    }

    /// Move to the next generation. Existing entries stay where they are.
    fn resize(&self, generation: usize) -> Result<usize, MapError> {
        let next = generation + 1;
        if next > self.max_generation {
            return Err(MapError::CapacityExceeded {
                requested: PRIMES.get(next).copied().unwrap_or(usize::MAX),
                maximum: prime(self.max_generation),
            });
        }
        let size = prime(next);
        self.buckets.grow(size)?;
        self.entries.grow(size)?;
        self.set_generation(next);
        self.metrics.resize.increment();
        info!(generation = next, capacity = size, "map grown");
        Ok(next)
    }

    fn remove_locked(&self, key: &K, generation: usize, matches: impl Fn(&V) -> bool) -> Result<bool, MapError> {
        let hash = self.hash_of(key);
        let journal = Journal::new(self.entries.header());
        let buckets = Buckets::new(&self.buckets);
        let entries = Entries::<K, V>::new(&self.entries);

        for generation in (0..=generation).rev() {
            let bucket = hash as usize % prime(generation);
            let mut last = END;
            let mut index = buckets.head(bucket);
            let mut steps = 0;

            while index != END {
                if !entries.contains(index) || steps > entries.len() {
                    return Err(MapError::Corrupted);
                }
                if entries.hash(index) != hash || entries.key(index) != *key {
                    last = index;
                    index = entries.next(index);
                    steps += 1;
                    continue;
                }
                if !matches(&entries.value(index)) {
                    self.metrics.remove_not_found.increment();
                    return Ok(false);
                }

                let next = entries.next(index);
                if last == END {
                    journal.open(PendingStep::UnlinkHead {
                        bucket: bucket as i32,
                        head: index,
                    });
                    self.fault(FaultPoint::UnlinkHeadJournaled)?;
                    buckets.set_head(bucket, next);
                    self.fault(FaultPoint::HeadUnlinked)?;
                } else {
                    journal.open(PendingStep::UnlinkMiddle { last, next: index });
                    self.fault(FaultPoint::UnlinkMiddleJournaled)?;
                    entries.set_next(last, next);
                    self.fault(FaultPoint::MiddleUnlinked)?;
                }

                let free_list = self.free_list();
                let free_count = self.free_count();
                entries.stash_link(index);
                journal.open(PendingStep::Release {
                    index,
                    free_list,
                    free_count,
                });
                self.fault(FaultPoint::ReleaseJournaled)?;
                entries.set_hash(index, FREE);
                self.fault(FaultPoint::HashCleared)?;
                entries.set_next(index, free_list);
                self.fault(FaultPoint::NextLinked)?;
                self.set_free_list(index);
                self.fault(FaultPoint::FreeListPushed)?;
                self.set_free_count(free_count + 1);
                self.fault(FaultPoint::FreeCountIncremented)?;
                journal.commit();

                self.metrics.remove.increment();
                return Ok(true);
            }
        }

        self.metrics.remove_not_found.increment();
        Ok(false)
    }

    // Public API

    /// Insert or overwrite.
    pub fn insert(&self, key: K, value: V) -> Result<(), MapError> {
        self.write(|generation| self.insert_locked(key, value, false, generation))
    }

    /// Insert, failing with [`MapError::DuplicateKey`] when the key is present.
    pub fn add(&self, key: K, value: V) -> Result<(), MapError> {
        self.write(|generation| self.insert_locked(key, value, true, generation))
    }

    /// Add every pair, stopping at the first failure.
    pub fn extend<I>(&self, pairs: I) -> Result<(), MapError>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in pairs {
            self.add(key, value)?;
        }
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &K) -> Result<bool, MapError> {
        self.write(|generation| self.remove_locked(key, generation, |_| true))
    }

    /// Remove `key` only if it maps to `value`.
    pub fn remove_entry(&self, key: &K, value: &V) -> Result<bool, MapError>
    where
        V: PartialEq,
    {
        self.write(|generation| self.remove_locked(key, generation, |stored| stored == value))
    }

    /// Drop every entry. Capacity is kept.
    pub fn clear(&self) -> Result<(), MapError> {
        self.write(|_| {
            let journal = Journal::new(self.entries.header());
            journal.open(PendingStep::Clear);
            self.fault(FaultPoint::ClearJournaled)?;
            self.wipe();
            self.fault(FaultPoint::ClearWiped)?;
            journal.commit();
            self.metrics.clear.increment();
            Ok(())
        })
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let hash = self.hash_of(key);
        self.read(|generation| match self.find_entry(key, hash, generation) {
            Lookup::Found(index) => Some(Some(Entries::<K, V>::new(&self.entries).value(index))),
            Lookup::Missing => Some(None),
            Lookup::Torn => None,
        })
    }

    /// Like [`get`](Self::get), failing with [`MapError::KeyNotFound`].
    pub fn fetch(&self, key: &K) -> Result<V, MapError> {
        self.get(key).ok_or(MapError::KeyNotFound)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.hash_of(key);
        self.read(|generation| match self.find_entry(key, hash, generation) {
            Lookup::Found(_) => Some(true),
            Lookup::Missing => Some(false),
            Lookup::Torn => None,
        })
    }

    /// Linear scan over every live entry.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.read(|_| {
            let entries = Entries::<K, V>::new(&self.entries);
            let count = self.count();
            if count < 0 || count as usize > entries.len() {
                return None;
            }
            Some((0..count).any(|index| entries.hash(index) != FREE && entries.value(index) == *value))
        })
    }

    /// Snapshot of every live pair, in slot order.
    pub fn to_vec(&self) -> Vec<(K, V)> {
        self.read(|_| {
            let entries = Entries::<K, V>::new(&self.entries);
            let count = self.count();
            if count < 0 || count as usize > entries.len() {
                return None;
            }
            Some(
                (0..count)
                    .filter(|&index| entries.hash(index) != FREE)
                    .map(|index| (entries.key(index), entries.value(index)))
                    .collect(),
            )
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.read(|_| {
            let count = self.count();
            let free_count = self.free_count();
            (free_count >= 0 && count >= free_count).then(|| (count - free_count) as usize)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries the current generation holds before it has to grow.
    pub fn capacity(&self) -> usize {
        prime(self.generation())
    }

    pub fn generation(&self) -> usize {
        self.stored_generation().min(self.max_generation)
    }

    /// Take the write lock and roll back any interrupted mutation. Returns
    /// the number of journal steps rolled back.
    pub fn recover(&self) -> Result<usize, MapError> {
        let _guard = self.lock(Acquisition::Write);
        self.sync_capacity()?;
        Ok(self.recover_locked())
    }

    pub fn metrics(&self) -> &MapMetrics {
        &self.metrics
    }

    pub fn process_id(&self) -> ProcessId {
        self.pid
    }
}

impl<K, V, S> DirectMap<K, V, MmapSlotArray, S> {
    /// Flush both files to disk.
    pub fn flush(&self) -> io::Result<()> {
        self.buckets.flush()?;
        self.entries.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{fail_once_at, FaultSwitch};
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, HashMap};
    use std::hash::Hasher;

    type TestMap = DirectMap<u64, u64, MemorySlotArray, CollidingState>;

    /// Every key hashes the same, so chains are built in insertion order.
    #[derive(Clone, Copy, Default)]
    struct CollidingState;

    struct Colliding;

    impl Hasher for Colliding {
        fn finish(&self) -> u64 {
            7
        }

        fn write(&mut self, _bytes: &[u8]) {}
    }

    impl BuildHasher for CollidingState {
        type Hasher = Colliding;

        fn build_hasher(&self) -> Colliding {
            Colliding
        }
    }

    struct AlwaysDead;

    impl LivenessCheck for AlwaysDead {
        fn is_alive(&self, _pid: ProcessId) -> bool {
            false
        }
    }

    fn fast_spin() -> SpinConfig {
        SpinConfig {
            escalate_after: 2,
            early_spin_threshold: 0,
        }
    }

    fn create_test_map() -> DirectMap<u64, u64, MemorySlotArray> {
        DirectMapBuilder::default()
            .max_capacity(10_000)
            .build_in_memory()
            .expect("Failed to create test map")
    }

    fn create_crash_map(switch: &FaultSwitch) -> TestMap {
        DirectMapBuilder::default()
            .capacity(16)
            .max_capacity(64)
            .hasher(CollidingState)
            .spin(fast_spin())
            .liveness(AlwaysDead)
            .fault_hook(switch.hook())
            .build_in_memory()
            .expect("Failed to create crash map")
    }

    fn contents<A: SlotArray, S: BuildHasher>(map: &DirectMap<u64, u64, A, S>) -> BTreeMap<u64, u64> {
        map.to_vec().into_iter().collect()
    }

    /// Walk every chain and the free list under the lock and check they
    /// account for exactly `count` entries.
    fn check_consistency<K, V, A, S>(map: &DirectMap<K, V, A, S>)
    where
        K: Plain + Hash + Eq,
        V: Plain,
        A: SlotArray,
        S: BuildHasher,
    {
        let _guard = map.lock(Acquisition::Write);
        assert!(Journal::new(map.entries.header()).is_clean());

        let buckets = Buckets::new(&map.buckets);
        let entries = Entries::<K, V>::new(&map.entries);
        let count = map.count();

        let mut live = 0;
        for bucket in 0..prime(map.generation()) {
            let mut index = buckets.head(bucket);
            while index != END {
                assert!(index < count, "chain reaches entry {index} beyond count {count}");
                assert_ne!(entries.hash(index), FREE);
                live += 1;
                index = entries.next(index);
            }
        }

        let mut free = 0;
        let mut index = map.free_list();
        while index != END {
            assert_eq!(entries.hash(index), FREE);
            free += 1;
            index = entries.next(index);
        }

        assert_eq!(free, map.free_count());
        assert_eq!(live + free, count);
    }

    #[test]
    fn test_insert_remove_reuses_slot() {
        let map: DirectMap<[u8; 1], u64, MemorySlotArray> = DirectMapBuilder::default()
            .max_capacity(100)
            .build_in_memory()
            .expect("Failed to create map");

        map.add(*b"a", 1).expect("add a");
        map.add(*b"b", 2).expect("add b");
        assert_eq!(map.len(), 2);

        assert!(map.remove(b"a").expect("remove a"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.free_count(), 1);
        assert_eq!(map.get(b"a"), None);
        assert_eq!(map.get(b"b"), Some(2));

        map.add(*b"a", 3).expect("add a again");
        assert_eq!(map.free_count(), 0);
        assert_eq!(map.count(), 2);
        assert_eq!(map.get(b"a"), Some(3));
        check_consistency(&map);
    }

    #[test]
    fn test_duplicate_add_leaves_map_unchanged() {
        let map = create_test_map();
        map.add(1, 10).expect("add");

        match map.add(1, 11) {
            Err(MapError::DuplicateKey) => {}
            other => panic!("expected duplicate key, got {other:?}"),
        }
        assert_eq!(map.get(&1), Some(10));
        assert_eq!(map.len(), 1);

        let (version, next_version) = lock::versions(&map.control());
        assert_eq!(version, next_version);
        check_consistency(&map);
    }

    #[test]
    fn test_insert_overwrites() {
        let map = create_test_map();
        map.insert(1, 10).expect("insert");
        map.insert(1, 11).expect("overwrite");
        assert_eq!(map.get(&1), Some(11));
        assert_eq!(map.len(), 1);
        assert_eq!(map.metrics().insert.value(), 1);
        assert_eq!(map.metrics().update.value(), 1);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let map = create_test_map();
        map.insert(1, 10).expect("insert");
        map.insert(2, 20).expect("insert");
        assert!(map.remove(&2).expect("remove"));

        let (count, free_count) = (map.count(), map.free_count());
        let before = map.to_vec();
        assert!(!map.remove(&2).expect("remove again"));
        assert!(!map.remove(&3).expect("remove missing"));
        assert_eq!(map.count(), count);
        assert_eq!(map.free_count(), free_count);
        assert_eq!(map.to_vec(), before);
        assert_eq!(map.get(&1), Some(10));
        assert!(Journal::new(map.entries.header()).is_clean());

        // Only the lock's own version bump per call, and the pair agrees
        let (version, next_version) = lock::versions(&map.control());
        assert_eq!(version, next_version);
        assert!(!map.remove(&3).expect("remove missing"));
        assert_eq!(lock::versions(&map.control()), (version + 1, next_version + 1));
        assert_eq!(map.to_vec(), before);
        assert_eq!(map.metrics().remove_not_found.value(), 2);
    }

    #[test]
    fn test_remove_entry_checks_value() {
        let map = create_test_map();
        map.insert(1, 10).expect("insert");

        assert!(!map.remove_entry(&1, &11).expect("remove_entry"));
        assert_eq!(map.get(&1), Some(10));
        assert!(map.remove_entry(&1, &10).expect("remove_entry"));
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn test_fetch_and_contains() {
        let map = create_test_map();
        map.extend([(1, 10), (2, 20)]).expect("extend");

        assert_eq!(map.fetch(&2).expect("fetch"), 20);
        assert!(matches!(map.fetch(&3), Err(MapError::KeyNotFound)));
        assert!(map.contains_key(&1));
        assert!(!map.contains_key(&3));
        assert!(map.contains_value(&20));
        assert!(!map.contains_value(&30));

        map.remove(&2).expect("remove");
        assert!(!map.contains_value(&20));
        assert!(matches!(map.extend([(3, 30), (1, 11)]), Err(MapError::DuplicateKey)));
        assert_eq!(map.get(&3), Some(30));
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let map = create_test_map();
        for key in 0..50 {
            map.insert(key, key).expect("insert");
        }
        let generation = map.generation();

        map.clear().expect("clear");
        assert!(map.is_empty());
        assert!(map.to_vec().is_empty());
        assert_eq!(map.generation(), generation);
        assert_eq!(map.get(&7), None);

        map.insert(7, 70).expect("insert after clear");
        assert_eq!(map.get(&7), Some(70));
        check_consistency(&map);
    }

    #[test]
    fn test_growth_keeps_every_key_reachable() {
        let map = create_test_map();
        assert_eq!(map.capacity(), 7);

        for key in 0..1000u64 {
            map.insert(key, key * 3).expect("insert");
        }
        assert!(map.generation() > 1);
        assert!(map.capacity() >= 1000);
        assert!(map.metrics().resize.value() > 0);
        for key in 0..1000u64 {
            assert_eq!(map.get(&key), Some(key * 3), "key {key}");
        }

        // Removing across generations
        for key in (0..1000u64).step_by(3) {
            assert!(map.remove(&key).expect("remove"));
        }
        for key in 0..1000u64 {
            assert_eq!(map.contains_key(&key), key % 3 != 0);
        }
        check_consistency(&map);
    }

    #[test]
    fn test_capacity_exceeded() {
        let map: DirectMap<u64, u64, MemorySlotArray> = DirectMapBuilder::default()
            .max_capacity(7)
            .build_in_memory()
            .expect("Failed to create map");

        for key in 0..7 {
            map.insert(key, key).expect("insert");
        }
        match map.insert(7, 7) {
            Err(MapError::CapacityExceeded { requested, maximum }) => {
                assert_eq!(requested, 11);
                assert_eq!(maximum, 7);
            }
            other => panic!("expected capacity exceeded, got {other:?}"),
        }
        assert_eq!(map.len(), 7);

        // Freed slots are still usable
        map.remove(&3).expect("remove");
        map.insert(7, 7).expect("insert into freed slot");
        check_consistency(&map);
    }

    #[test]
    fn test_invalid_capacity() {
        let result = DirectMapBuilder::default()
            .capacity(100)
            .max_capacity(50)
            .build_in_memory::<u64, u64>();
        assert!(matches!(result, Err(OpenError::InvalidCapacity { .. })));

        let result = DirectMapBuilder::default()
            .max_capacity(MAX_CAPACITY + 1)
            .build_in_memory::<u64, u64>();
        assert!(matches!(result, Err(OpenError::InvalidCapacity { .. })));
    }

    #[test]
    fn test_matches_model() {
        let map: DirectMap<u32, u64, MemorySlotArray> = DirectMapBuilder::default()
            .max_capacity(1000)
            .build_in_memory()
            .expect("Failed to create map");
        let mut model = HashMap::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for _ in 0..5000 {
            let key = rng.gen_range(0..64u32);
            let value = rng.gen::<u64>();
            match rng.gen_range(0..100) {
                0..=39 => {
                    map.insert(key, value).expect("insert");
                    model.insert(key, value);
                }
                40..=49 => {
                    let added = map.add(key, value).is_ok();
                    assert_eq!(added, !model.contains_key(&key));
                    model.entry(key).or_insert(value);
                }
                50..=74 => {
                    assert_eq!(map.remove(&key).expect("remove"), model.remove(&key).is_some());
                }
                75..=98 => assert_eq!(map.get(&key), model.get(&key).copied()),
                _ => {
                    map.clear().expect("clear");
                    model.clear();
                }
            }
            assert_eq!(map.len(), model.len());
        }

        let mut snapshot = map.to_vec();
        snapshot.sort_unstable();
        let mut expected: Vec<_> = model.into_iter().collect();
        expected.sort_unstable();
        assert_eq!(snapshot, expected);
        check_consistency(&map);
    }

    fn setup_chain(map: &TestMap) {
        // Chain is 3 -> 2 -> 1
        for key in 1..=3 {
            map.insert(key, key * 10).expect("insert");
        }
    }

    fn setup_with_free(map: &TestMap) {
        setup_chain(map);
        map.remove(&2).expect("remove");
    }

    #[test]
    fn test_crash_at_every_point_recovers() {
        type Setup = fn(&TestMap);
        type Op = fn(&TestMap) -> Result<(), MapError>;

        let overwrite: Op = |map| map.insert(2, 99);
        let insert: Op = |map| map.insert(4, 40);
        let remove_head: Op = |map| map.remove(&3).map(|_| ());
        let remove_middle: Op = |map| map.remove(&1).map(|_| ());
        let clear: Op = |map| map.clear();
        let chain: Setup = setup_chain;
        let with_free: Setup = setup_with_free;

        use FaultPoint::*;
        let cases: Vec<(Setup, Op, Vec<FaultPoint>)> = vec![
            (chain, overwrite, vec![OverwriteJournaled, OverwriteWritten]),
            (
                with_free,
                insert,
                vec![
                    FreePopJournaled,
                    FreeListAdvanced,
                    FreeCountDecremented,
                    PublishJournaled,
                    EntryWritten,
                    BucketPublished,
                    InsertCommitted,
                ],
            ),
            (
                chain,
                insert,
                vec![
                    AppendJournaled,
                    CountAdvanced,
                    PublishJournaled,
                    EntryWritten,
                    BucketPublished,
                    InsertCommitted,
                ],
            ),
            (
                chain,
                remove_head,
                vec![
                    UnlinkHeadJournaled,
                    HeadUnlinked,
                    ReleaseJournaled,
                    HashCleared,
                    NextLinked,
                    FreeListPushed,
                    FreeCountIncremented,
                ],
            ),
            (
                chain,
                remove_middle,
                vec![
                    UnlinkMiddleJournaled,
                    MiddleUnlinked,
                    ReleaseJournaled,
                    HashCleared,
                    NextLinked,
                    FreeListPushed,
                    FreeCountIncremented,
                ],
            ),
            (chain, clear, vec![ClearJournaled, ClearWiped]),
        ];

        for (setup, op, points) in cases {
            let after = {
                let map = create_crash_map(&FaultSwitch::new());
                setup(&map);
                op(&map).expect("unfaulted op");
                contents(&map)
            };

            for point in points {
                let switch = FaultSwitch::new();
                let map = create_crash_map(&switch);
                setup(&map);
                let before = contents(&map);

                switch.arm(point);
                match op(&map) {
                    Err(MapError::Faulted(faulted)) => assert_eq!(faulted, point),
                    other => panic!("{point}: expected a fault, got {other:?}"),
                }

                // The next read finds the versions apart, escalates, steals
                // the lock from the "dead" holder and rolls back.
                let recovered = contents(&map);
                let rolls_forward = matches!(point, InsertCommitted | ClearJournaled | ClearWiped);
                let expected = if rolls_forward { &after } else { &before };
                assert_eq!(&recovered, expected, "{point}");
                assert!(map.metrics().lock_steal.value() >= 1, "{point}");
                check_consistency(&map);

                map.insert(100, 1000).expect("insert after recovery");
                assert_eq!(map.get(&100), Some(1000), "{point}");
                check_consistency(&map);
            }
        }
    }

    #[test]
    fn test_recover_reports_steps() {
        let switch = FaultSwitch::new();
        let map = create_crash_map(&switch);
        setup_chain(&map);

        switch.arm(FaultPoint::FreeListPushed);
        assert!(map.remove(&1).is_err());

        // UnlinkMiddle and Release
        assert_eq!(map.recover().expect("recover"), 2);
        assert_eq!(map.recover().expect("recover"), 0);
        assert_eq!(map.metrics().recovery.value(), 1);
        assert_eq!(map.metrics().recovered_step.value(), 2);
        assert_eq!(map.get(&1), Some(10));
    }

    #[test]
    fn test_unknown_journal_bits_are_discarded() {
        let map = create_test_map();
        map.insert(1, 10).expect("insert");
        unsafe { map.entries.header().volatile_write_i32(0, 1 << 20) };

        assert_eq!(map.recover().expect("recover"), 0);
        assert!(Journal::new(map.entries.header()).is_clean());
        assert_eq!(map.get(&1), Some(10));
    }

    fn file_builder(path: &Path) -> DirectMapBuilder {
        DirectMapBuilder::new(path).capacity(16).max_capacity(4096)
    }

    #[test]
    fn test_file_map_persists() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = dir.path().join("persist");

        {
            let map = file_builder(&base).build::<u64, u64>().expect("Failed to create map");
            for key in 0..100 {
                map.insert(key, key + 1).expect("insert");
            }
            map.remove(&50).expect("remove");
            map.flush().expect("flush");
        }
        assert!(sibling(&base, "-buckets").exists());
        assert!(sibling(&base, "-entries").exists());

        let map = file_builder(&base).build::<u64, u64>().expect("Failed to reopen map");
        assert_eq!(map.len(), 99);
        assert_eq!(map.get(&0), Some(1));
        assert_eq!(map.get(&99), Some(100));
        assert_eq!(map.get(&50), None);
        check_consistency(&map);
    }

    #[test]
    fn test_reopen_with_other_layout_fails() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = dir.path().join("layout");
        drop(file_builder(&base).build::<u64, u64>().expect("Failed to create map"));

        let result = file_builder(&base).build::<u64, u32>();
        assert!(matches!(result, Err(OpenError::LayoutMismatch { .. })));

        let result = file_builder(&base)
            .hasher(RandomState::with_seeds(1, 2, 3, 4))
            .build::<u64, u64>();
        assert!(matches!(result, Err(OpenError::LayoutMismatch { .. })));
    }

    #[test]
    fn test_reopen_adopts_reserved_capacity() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = dir.path().join("reserved");
        drop(
            DirectMapBuilder::new(&base)
                .max_capacity(100)
                .build::<u64, u64>()
                .expect("Failed to create map"),
        );

        let map = DirectMapBuilder::new(&base)
            .max_capacity(5000)
            .build::<u64, u64>()
            .expect("Failed to reopen map");
        assert_eq!(map.entries.max_capacity(), 107);
        assert_eq!(map.buckets.max_capacity(), 107);
    }

    #[test]
    fn test_reservation_is_checked_under_lock() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = dir.path().join("stale");
        let first = DirectMapBuilder::new(&base)
            .max_capacity(100)
            .build::<u64, u64>()
            .expect("first handle");

        // Mapped with a smaller reservation before the first opener stamped
        let (buckets, entries) =
            open_files(&base, entry::item_size::<u64, u64>(), prime(4)).expect("Failed to open files");
        let stale: DirectMap<u64, u64> = DirectMap::assemble(buckets, entries, 4, DirectMapBuilder::new(&base));
        assert!(matches!(
            stale.initialize(1),
            Err(OpenError::ReservationMismatch {
                stored: 107,
                expected: 23
            })
        ));
        drop(stale);

        let second = DirectMapBuilder::new(&base)
            .max_capacity(20)
            .build::<u64, u64>()
            .expect("second handle");
        assert_eq!(second.entries.max_capacity(), 107);
        assert_eq!(second.buckets.max_capacity(), 107);

        for key in 0..80 {
            first.insert(key, key).expect("insert");
        }
        assert!(first.generation() > 4);
        assert_eq!(second.get(&79), Some(79));
        assert_eq!(second.len(), 80);
    }

    #[test]
    fn test_handles_share_growth() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = dir.path().join("shared");
        let first = file_builder(&base).build::<u64, u64>().expect("first handle");
        let second = file_builder(&base).build::<u64, u64>().expect("second handle");

        for key in 0..500 {
            first.insert(key, key).expect("insert");
        }
        assert!(second.generation() > 3);
        for key in 0..500 {
            assert_eq!(second.get(&key), Some(key));
        }
        second.remove(&10).expect("remove");
        assert_eq!(first.get(&10), None);
        assert_eq!(first.len(), 499);
    }

    #[test]
    fn test_dead_process_lock_is_taken_over() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = dir.path().join("takeover");

        // No process has this id
        let dead = ProcessId::from_raw(i32::MAX - 7);
        let crashing = file_builder(&base)
            .process_id(dead)
            .fault_hook(fail_once_at(FaultPoint::EntryWritten))
            .build::<u64, u64>()
            .expect("crashing handle");
        let survivor = file_builder(&base)
            .spin(fast_spin())
            .build::<u64, u64>()
            .expect("surviving handle");

        survivor.insert(1, 10).expect("insert");
        assert!(matches!(
            crashing.insert(2, 20),
            Err(MapError::Faulted(FaultPoint::EntryWritten))
        ));
        drop(crashing);

        survivor.insert(3, 30).expect("insert after takeover");
        assert_eq!(survivor.metrics().lock_steal.value(), 1);
        assert_eq!(survivor.metrics().recovery.value(), 1);
        assert_eq!(survivor.get(&1), Some(10));
        assert_eq!(survivor.get(&2), None);
        assert_eq!(survivor.get(&3), Some(30));
        assert_eq!(survivor.len(), 2);
        check_consistency(&survivor);
    }

    #[test]
    fn test_concurrent_readers_see_committed_values() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = dir.path().join("concurrent");
        let writer = file_builder(&base).build::<u64, u64>().expect("writer handle");
        let reader = file_builder(&base).build::<u64, u64>().expect("reader handle");
        const KEYS: u64 = 2000;

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for key in 0..KEYS {
                    writer.insert(key, key * 2).expect("insert");
                }
            });

            for _ in 0..2 {
                scope.spawn(|| {
                    let mut seen = 0;
                    while reader.get(&(KEYS - 1)).is_none() {
                        let len = reader.len();
                        assert!(len >= seen, "len went backwards");
                        seen = len;
                        for key in (0..KEYS).step_by(97) {
                            if let Some(value) = reader.get(&key) {
                                assert_eq!(value, key * 2);
                            }
                        }
                    }
                });
            }
        });

        assert_eq!(reader.len(), KEYS as usize);
        for key in 0..KEYS {
            assert_eq!(reader.get(&key), Some(key * 2));
        }
    }
}
