//! Crash-recoverable hash map shared between processes through
//! memory-mapped files.
//!
//! A [`DirectMap`] keeps its buckets and entries in two [`SlotArray`]s. Writers
//! serialize on a process-id lock stored in the bucket array header and
//! journal every irreversible write, so a process killed mid-mutation leaves
//! enough behind for the next writer to roll it back. Readers never lock;
//! they validate against a version pair and retry.

pub mod array;
pub mod buffer;
mod entry;
pub mod fault;
mod journal;
mod lock;
mod map;
mod metrics;
mod primes;
mod util;

use std::fmt;
use std::io;

// Public API exports
pub use array::{MemorySlotArray, MmapSlotArray, SlotArray};
pub use buffer::{DirectBuffer, Plain, Uuid};
pub use fault::{fail_once_at, FaultHook, FaultPoint, FaultSwitch, InjectedFault};
pub use lock::{LivenessCheck, OsLiveness, ProcessId};
pub use map::{stable_hasher, DirectMap, DirectMapBuilder};
pub use metrics::{Counter, MapMetrics};
pub use primes::MAX_CAPACITY;
pub use util::{Backoff, SpinBackoff, SpinConfig};

/// Error types for [`DirectBuffer`] construction, slicing and copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Null pointer or zero length
    Invalid,
    /// The byte range does not fit in the buffer
    OutOfBounds {
        index: usize,
        length: usize,
        capacity: usize,
    },
    /// An external source or destination is shorter than the copy
    OutOfRange { requested: usize, available: usize },
}

impl std::error::Error for BufferError {}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "buffer is invalid"),
            Self::OutOfBounds {
                index,
                length,
                capacity,
            } => write!(
                f,
                "{length} bytes at {index} out of bounds for a buffer of {capacity} bytes"
            ),
            Self::OutOfRange {
                requested,
                available,
            } => write!(
                f,
                "requested {requested} bytes but only {available} are available"
            ),
        }
    }
}

/// Error types for map operations
#[derive(Debug)]
pub enum MapError {
    /// Key already exists (returned by add)
    DuplicateKey,
    /// Key not found (returned by fetch)
    KeyNotFound,
    /// Growing would exceed the maximum capacity the files were created with
    CapacityExceeded { requested: usize, maximum: usize },
    /// The shared structure is inconsistent even under the write lock
    Corrupted,
    /// Growing a backing file failed
    Io(io::Error),
    /// A fault hook stopped the mutation at this point
    Faulted(FaultPoint),
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "an entry with the same key already exists"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::CapacityExceeded { requested, maximum } => {
                write!(f, "capacity {requested} exceeds maximum {maximum}")
            }
            Self::Corrupted => write!(f, "map structure is corrupted"),
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Faulted(point) => write!(f, "fault injected at {point}"),
        }
    }
}

impl From<io::Error> for MapError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Error types for opening a map
#[derive(Debug)]
pub enum OpenError {
    /// Requested capacity is above the maximum, or the maximum above the
    /// largest supported capacity
    InvalidCapacity { capacity: usize, maximum: usize },
    /// Existing files were written with a different entry size or hasher
    LayoutMismatch { stored: u64, expected: u64 },
    /// Existing files were created with an unsupported maximum capacity
    InvalidStoredCapacity(i64),
    /// Existing files reserve a different maximum capacity than this handle
    /// mapped
    ReservationMismatch { stored: i64, expected: usize },
    /// Opening, mapping or growing a file failed
    Io(io::Error),
}

impl std::error::Error for OpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidCapacity { capacity, maximum } => {
                write!(f, "invalid capacity {capacity} (maximum {maximum})")
            }
            Self::LayoutMismatch { stored, expected } => write!(
                f,
                "layout fingerprint {stored:#x} does not match {expected:#x}"
            ),
            Self::InvalidStoredCapacity(stored) => {
                write!(f, "stored maximum capacity {stored} is not supported")
            }
            Self::ReservationMismatch { stored, expected } => write!(
                f,
                "files reserve {stored} elements but {expected} were mapped"
            ),
            Self::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl From<io::Error> for OpenError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
