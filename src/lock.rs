//! Inter-process write lock and optimistic reads.
//!
//! The bucket array header carries three words used here:
//!
//! ```text
//! slot 0  lock         i32  0 when free, else the holder's process id
//! slot 1  version      i64  bumped when a writer releases
//! slot 2  next_version i64  bumped when a writer acquires
//! ```
//!
//! `version == next_version` exactly when no writer is inside its critical
//! section, which is what optimistic readers validate against.

use std::sync::atomic::{fence, Ordering};

use tracing::{debug, error, warn};

use crate::buffer::DirectBuffer;
use crate::metrics::MapMetrics;
use crate::util::{Backoff, SpinConfig, Spinner, Step};

const LOCK: usize = 0;
const VERSION: usize = 8;
const NEXT_VERSION: usize = 16;

/// OS process id as stored in the lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Id of the running process.
    pub fn current() -> Self {
        Self(std::process::id() as i32)
    }

    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decides whether a lock holder still exists.
pub trait LivenessCheck: Send + Sync {
    fn is_alive(&self, pid: ProcessId) -> bool;
}

/// Asks the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLiveness;

impl LivenessCheck for OsLiveness {
    #[cfg(unix)]
    fn is_alive(&self, pid: ProcessId) -> bool {
        if pid.as_raw() <= 0 {
            return false;
        }
        // kill(pid, 0) checks existence without sending a signal
        let result = unsafe { libc::kill(pid.as_raw() as libc::pid_t, 0) };
        if result == 0 {
            true
        } else {
            // ESRCH = no such process, EPERM means it exists
            std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: ProcessId) -> bool {
        // Without a way to tell, never steal.
        true
    }
}

/// Everything the lock routines need from their owner.
pub(crate) struct LockContext<'a> {
    pub(crate) pid: ProcessId,
    pub(crate) spin: SpinConfig,
    pub(crate) backoff: &'a dyn Backoff,
    pub(crate) liveness: &'a dyn LivenessCheck,
    pub(crate) metrics: &'a MapMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquisition {
    /// Regular writer: bumps `next_version` on entry, `version` on exit.
    Write,
    /// Resynchronize diverged versions: leaves `next_version` alone on
    /// entry and sets `version = next_version` on exit.
    FixVersions,
}

/// Held write lock. Released on drop.
pub(crate) struct WriteGuard<'a> {
    header: DirectBuffer<'a>,
    pid: ProcessId,
    stolen: bool,
    sync_versions: bool,
}

impl WriteGuard<'_> {
    /// Whether the lock was taken from a dead holder.
    pub(crate) fn stolen(&self) -> bool {
        self.stolen
    }

    /// Leave the lock held and the versions diverged, as a process that
    /// dies inside its critical section would.
    pub(crate) fn abandon(self) {
        std::mem::forget(self);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let own = self.pid.as_raw();
        // SAFETY: header slots are aligned words inside the header
        unsafe {
            let holder = self.header.volatile_read_i32(LOCK);
            if holder != own {
                lost_lock(own, holder);
            }

            // Publish the version before the lock word is cleared so no
            // other writer can bump next_version in between.
            if self.sync_versions {
                let next = self.header.interlocked_read_i64(NEXT_VERSION);
                self.header.volatile_write_i64(VERSION, next);
            } else {
                self.header.interlocked_increment_i64(VERSION);
            }

            let holder = self.header.interlocked_compare_exchange_i32(LOCK, 0, own);
            if holder != own {
                lost_lock(own, holder);
            }
        }
    }
}

fn lost_lock(own: i32, holder: i32) -> ! {
    error!(
        pid = own,
        holder,
        "write lock was stolen while this process is alive, aborting"
    );
    std::process::abort()
}

/// Take the write lock in `header`, spinning until it is free or its holder
/// is found dead.
pub(crate) fn acquire<'a>(header: DirectBuffer<'a>, ctx: &LockContext<'_>, mode: Acquisition) -> WriteGuard<'a> {
    let own = ctx.pid.as_raw();
    let mut spinner = Spinner::new(ctx.spin, ctx.backoff);
    ctx.metrics.lock_acquire.increment();

    loop {
        // SAFETY: header slots are aligned words inside the header
        let holder = unsafe { header.interlocked_compare_exchange_i32(LOCK, own, 0) };
        if holder == 0 {
            return enter(header, ctx, mode, false);
        }
        if spinner.attempts() == 0 {
            ctx.metrics.lock_contended.increment();
        }

        match spinner.spin() {
            Step::Retry => {}
            Step::Escalate => {
                let holder_pid = ProcessId::from_raw(holder);
                if ctx.liveness.is_alive(holder_pid) {
                    debug!(
                        pid = own,
                        holder,
                        attempts = spinner.attempts(),
                        "write lock still held by a live process"
                    );
                    continue;
                }
                let previous = unsafe { header.interlocked_compare_exchange_i32(LOCK, own, holder) };
                if previous == holder {
                    warn!(old_pid = holder, new_pid = own, "write lock stolen from dead holder");
                    ctx.metrics.lock_steal.increment();
                    return enter(header, ctx, mode, true);
                }
            }
        }
    }
}

fn enter<'a>(header: DirectBuffer<'a>, ctx: &LockContext<'_>, mode: Acquisition, stolen: bool) -> WriteGuard<'a> {
    if mode == Acquisition::Write {
        // SAFETY: header slots are aligned words inside the header
        unsafe { header.interlocked_increment_i64(NEXT_VERSION) };
    }
    WriteGuard {
        header,
        pid: ctx.pid,
        stolen,
        sync_versions: stolen || mode == Acquisition::FixVersions,
    }
}

/// Run `read` until it completes with no writer overlapping it.
///
/// `read` returns `None` when it saw an inconsistent structure, which is
/// treated like a version mismatch. Every time the retry bound is reached
/// `escalate` runs, which is expected to take the lock in
/// [`Acquisition::FixVersions`] mode and recover.
pub(crate) fn read_optimistic<T>(
    header: DirectBuffer<'_>,
    ctx: &LockContext<'_>,
    mut read: impl FnMut() -> Option<T>,
    mut escalate: impl FnMut(),
) -> T {
    let mut spinner = Spinner::new(ctx.spin, ctx.backoff);
    loop {
        // SAFETY: header slots are aligned words inside the header
        let version = unsafe { header.volatile_read_i64(VERSION) };
        let value = read();
        fence(Ordering::Acquire);
        let next_version = unsafe { header.volatile_read_i64(NEXT_VERSION) };

        if version == next_version {
            if let Some(value) = value {
                return value;
            }
        }

        ctx.metrics.read_retry.increment();
        if spinner.spin() == Step::Escalate {
            escalate();
        }
    }
}

/// Current `(version, next_version)` pair.
pub(crate) fn versions(header: &DirectBuffer<'_>) -> (i64, i64) {
    // SAFETY: header slots are aligned words inside the header
    unsafe {
        (
            header.volatile_read_i64(VERSION),
            header.volatile_read_i64(NEXT_VERSION),
        )
    }
}
