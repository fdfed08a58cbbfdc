use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-handle metrics.
///
/// Counters only reflect work done through this handle; other processes
/// attached to the same files keep their own.
#[derive(Default)]
pub struct MapMetrics {
    // Write lock
    pub lock_acquire: Counter,
    pub lock_contended: Counter,
    pub lock_steal: Counter,
    pub fix_versions: Counter,

    // Optimistic reads
    pub read_retry: Counter,

    // Crash recovery
    pub recovery: Counter,
    pub recovered_step: Counter,

    // Mutations
    pub insert: Counter,
    pub update: Counter,
    pub remove: Counter,
    pub remove_not_found: Counter,
    pub clear: Counter,
    pub resize: Counter,
}

impl MapMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}
