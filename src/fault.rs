//! Deterministic crash points for recovery tests.
//!
//! A [`FaultHook`] is called at every [`FaultPoint`] a mutation passes. When
//! it returns [`InjectedFault`] the mutation stops right there: the journal
//! stays open, the write lock stays held by this handle's process id, and
//! the caller gets `MapError::Faulted`. The next acquirer that finds the
//! holder dead steals the lock and rolls the mutation back.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Named points inside insert, remove and clear. The numeric id groups them
/// by the journal step that is open when the point is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FaultPoint {
    /// Old entry saved, overwrite step open.
    OverwriteJournaled = 11,
    /// New value written, step not yet committed.
    OverwriteWritten = 12,

    /// Free-list pop step open.
    FreePopJournaled = 21,
    /// Free list head advanced.
    FreeListAdvanced = 22,
    /// Free count decremented.
    FreeCountDecremented = 23,

    /// Append step open.
    AppendJournaled = 31,
    /// Count advanced.
    CountAdvanced = 32,

    /// Publish step open.
    PublishJournaled = 41,
    /// Entry written into its slot, bucket not updated.
    EntryWritten = 42,
    /// Bucket points at the new entry, journal not cleared.
    BucketPublished = 43,
    /// Insert committed, lock not released.
    InsertCommitted = 44,

    /// Head unlink step open.
    UnlinkHeadJournaled = 51,
    /// Bucket skips the removed entry.
    HeadUnlinked = 52,

    /// Mid-chain unlink step open.
    UnlinkMiddleJournaled = 61,
    /// Predecessor skips the removed entry.
    MiddleUnlinked = 62,

    /// Release step open.
    ReleaseJournaled = 71,
    /// Entry hash set to the free marker.
    HashCleared = 72,
    /// Entry linked to the old free-list head.
    NextLinked = 73,
    /// Free list head points at the entry.
    FreeListPushed = 74,
    /// Free count incremented, journal not cleared.
    FreeCountIncremented = 75,

    /// Clear step open.
    ClearJournaled = 81,
    /// Arrays wiped, journal not cleared.
    ClearWiped = 82,
}

impl FaultPoint {
    pub fn id(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.id())
    }
}

/// Returned by a hook to stop the mutation at the current point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedFault;

/// Callback invoked at every fault point.
pub type FaultHook = Arc<dyn Fn(FaultPoint) -> Result<(), InjectedFault> + Send + Sync>;

/// Hook that faults the first time `target` is reached and never again.
pub fn fail_once_at(target: FaultPoint) -> FaultHook {
    let fired = AtomicBool::new(false);
    Arc::new(move |point| {
        if point == target && !fired.swap(true, Ordering::AcqRel) {
            Err(InjectedFault)
        } else {
            Ok(())
        }
    })
}

/// Fault point that can be armed after the map is built, so a table can be
/// populated before the crash is staged.
#[derive(Clone, Default)]
pub struct FaultSwitch {
    armed: Arc<AtomicU32>,
}

impl FaultSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault the next time `point` is reached.
    pub fn arm(&self, point: FaultPoint) {
        self.armed.store(point.id(), Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(0, Ordering::Release);
    }

    /// Hook that fires once per arming.
    pub fn hook(&self) -> FaultHook {
        let armed = self.armed.clone();
        Arc::new(move |point| {
            match armed.compare_exchange(point.id(), 0, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => Err(InjectedFault),
                Err(_) => Ok(()),
            }
        })
    }
}
