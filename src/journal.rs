//! Write-ahead journal for the mutation in flight.
//!
//! The journal lives in the entry array's header: slot 0 holds a bitmask of
//! open steps, slots 3..=7 hold the values needed to undo them. A step is
//! opened (copies first, then its bit) before the write it guards, and the
//! whole mask is cleared once the mutation is complete. Entry-sized backups
//! go to the scratch element, see [`crate::entry::Entries::stash`].

use crate::buffer::DirectBuffer;

const FLAGS: usize = 0;
const COUNT_COPY: usize = 3 * 8;
const FREE_LIST_COPY: usize = 4 * 8;
const FREE_COUNT_COPY: usize = 5 * 8;
const INDEX_COPY: usize = 6 * 8;
const BUCKET_OR_LAST_NEXT_COPY: usize = 7 * 8;

/// Bits 1..=8.
const KNOWN_BITS: i32 = 0b1_1111_1110;

/// One open step of a mutation and what it takes to roll it back.
///
/// Steps that may be open together never share a copy slot: an insert opens
/// `PopFree` or `Append`, then `Publish`; a remove opens `UnlinkHead` or
/// `UnlinkMiddle`, then `Release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingStep {
    /// Entry `index` is being overwritten; the scratch element holds the old entry.
    Overwrite { index: i32 },
    /// The free-list head is being popped; the scratch element holds its old link.
    PopFree { free_list: i32, free_count: i32 },
    /// A new entry is being appended at `count`.
    Append { count: i32 },
    /// A new entry is being linked in as head of `bucket`.
    Publish { bucket: i32, previous_head: i32 },
    /// `head` is being unlinked from the front of `bucket`.
    UnlinkHead { bucket: i32, head: i32 },
    /// The entry after `last` (which is `next`) is being unlinked.
    UnlinkMiddle { last: i32, next: i32 },
    /// Entry `index` is being pushed on the free list; the scratch element
    /// holds its old link.
    Release { index: i32, free_list: i32, free_count: i32 },
    /// Both arrays are being wiped.
    Clear,
}

impl PendingStep {
    fn bit_index(&self) -> u32 {
        match self {
            PendingStep::Overwrite { .. } => 1,
            PendingStep::PopFree { .. } => 2,
            PendingStep::Append { .. } => 3,
            PendingStep::Publish { .. } => 4,
            PendingStep::UnlinkHead { .. } => 5,
            PendingStep::UnlinkMiddle { .. } => 6,
            PendingStep::Release { .. } => 7,
            PendingStep::Clear => 8,
        }
    }

    pub(crate) fn bit(&self) -> i32 {
        1 << self.bit_index()
    }
}

/// View over the journal slots of an entry array header.
pub(crate) struct Journal<'a> {
    header: DirectBuffer<'a>,
}

impl<'a> Journal<'a> {
    pub(crate) fn new(header: DirectBuffer<'a>) -> Self {
        Self { header }
    }

    pub(crate) fn flags(&self) -> i32 {
        // SAFETY: header slots are 8-byte aligned words inside the header
        unsafe { self.header.volatile_read_i32(FLAGS) }
    }

    fn set_flags(&self, flags: i32) {
        unsafe { self.header.volatile_write_i32(FLAGS, flags) }
    }

    fn read(&self, slot: usize) -> i32 {
        unsafe { self.header.volatile_read_i32(slot) }
    }

    fn write(&self, slot: usize, value: i32) {
        unsafe { self.header.volatile_write_i32(slot, value) }
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.flags() == 0
    }

    /// Save the step's copies, then mark it open.
    pub(crate) fn open(&self, step: PendingStep) {
        match step {
            PendingStep::Overwrite { index } => {
                self.write(INDEX_COPY, index);
            }
            PendingStep::PopFree {
                free_list,
                free_count,
            } => {
                self.write(FREE_LIST_COPY, free_list);
                self.write(FREE_COUNT_COPY, free_count);
            }
            PendingStep::Append { count } => {
                self.write(COUNT_COPY, count);
            }
            PendingStep::Publish {
                bucket,
                previous_head,
            } => {
                self.write(BUCKET_OR_LAST_NEXT_COPY, bucket);
                self.write(INDEX_COPY, previous_head);
            }
            PendingStep::UnlinkHead { bucket, head } => {
                self.write(BUCKET_OR_LAST_NEXT_COPY, bucket);
                self.write(INDEX_COPY, head);
            }
            PendingStep::UnlinkMiddle { last, next } => {
                self.write(INDEX_COPY, last);
                self.write(BUCKET_OR_LAST_NEXT_COPY, next);
            }
            PendingStep::Release {
                index,
                free_list,
                free_count,
            } => {
                self.write(COUNT_COPY, index);
                self.write(FREE_LIST_COPY, free_list);
                self.write(FREE_COUNT_COPY, free_count);
            }
            PendingStep::Clear => {}
        }
        self.set_flags(self.flags() | step.bit());
    }

    /// Mark a rolled-back step closed.
    pub(crate) fn resolve(&self, step: PendingStep) {
        self.set_flags(self.flags() & !step.bit());
    }

    /// Close every step: the mutation is complete.
    pub(crate) fn commit(&self) {
        self.set_flags(0);
    }

    /// Bits set in the mask that no step uses.
    pub(crate) fn unknown_bits(&self) -> i32 {
        self.flags() & !KNOWN_BITS
    }

    /// Drop bits no step uses.
    pub(crate) fn discard_unknown(&self) {
        self.set_flags(self.flags() & KNOWN_BITS);
    }

    /// Open steps, latest first.
    pub(crate) fn pending(&self) -> Vec<PendingStep> {
        let flags = self.flags();
        (1..=8)
            .rev()
            .filter(|bit| flags & (1 << bit) != 0)
            .map(|bit| self.decode(bit))
            .collect()
    }

    fn decode(&self, bit: u32) -> PendingStep {
        match bit {
            1 => PendingStep::Overwrite {
                index: self.read(INDEX_COPY),
            },
            2 => PendingStep::PopFree {
                free_list: self.read(FREE_LIST_COPY),
                free_count: self.read(FREE_COUNT_COPY),
            },
            3 => PendingStep::Append {
                count: self.read(COUNT_COPY),
            },
            4 => PendingStep::Publish {
                bucket: self.read(BUCKET_OR_LAST_NEXT_COPY),
                previous_head: self.read(INDEX_COPY),
            },
            5 => PendingStep::UnlinkHead {
                bucket: self.read(BUCKET_OR_LAST_NEXT_COPY),
                head: self.read(INDEX_COPY),
            },
            6 => PendingStep::UnlinkMiddle {
                last: self.read(INDEX_COPY),
                next: self.read(BUCKET_OR_LAST_NEXT_COPY),
            },
            7 => PendingStep::Release {
                index: self.read(COUNT_COPY),
                free_list: self.read(FREE_LIST_COPY),
                free_count: self.read(FREE_COUNT_COPY),
            },
            _ => PendingStep::Clear,
        }
    }
}
