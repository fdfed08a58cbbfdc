//! Field-level access to the bucket and entry arrays.
//!
//! Entry layout, `item_size = 16 + size_of::<K>() + size_of::<V>()`:
//!
//! ```text
//! 0   hash   i32   31-bit hash, -1 when the entry is free
//! 4   next   i32   next entry in the chain, -1 at the end
//! 8   length i64   reserved, written as 0
//! 16  key    K
//! ..  value  V
//! ```
//!
//! `hash` and `next` are adjacent so the pair can be saved and restored as a
//! single `i64` (the entry's link).

use std::marker::PhantomData;
use std::mem::size_of;

use crate::array::SlotArray;
use crate::buffer::{DirectBuffer, Plain};

/// Hash of a free entry.
pub(crate) const FREE: i32 = -1;
/// End of a chain or of the free list.
pub(crate) const END: i32 = -1;

const HASH: usize = 0;
const NEXT: usize = 4;
const LENGTH: usize = 8;
const KEY: usize = 16;

/// Bytes taken by one entry holding `K` and `V`.
pub(crate) const fn item_size<K, V>() -> usize {
    KEY + size_of::<K>() + size_of::<V>()
}

/// Entry fields over the backed part of an entry array.
pub(crate) struct Entries<'a, K, V> {
    buffer: DirectBuffer<'a>,
    data_offset: usize,
    len: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: Plain, V: Plain> Entries<'a, K, V> {
    const ITEM_SIZE: usize = item_size::<K, V>();
    const VALUE: usize = KEY + size_of::<K>();

    pub(crate) fn new<A: SlotArray>(array: &'a A) -> Self {
        debug_assert_eq!(array.item_size(), Self::ITEM_SIZE);
        let buffer = array.buffer();
        let data_offset = array.data_offset();
        Self {
            buffer,
            data_offset,
            len: (buffer.len() - data_offset) / Self::ITEM_SIZE,
            _marker: PhantomData,
        }
    }

    /// Number of backed entries.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Whether `index` names a backed entry. Readers check indices read from
    /// shared memory with this before following them.
    pub(crate) fn contains(&self, index: i32) -> bool {
        index >= 0 && (index as usize) < self.len
    }

    fn offset(&self, index: i32) -> usize {
        assert!(
            index >= -1 && (index as i64) < self.len as i64,
            "entry {index} out of range for {} entries",
            self.len
        );
        (self.data_offset as isize + index as isize * Self::ITEM_SIZE as isize) as usize
    }

    pub(crate) fn hash(&self, index: i32) -> i32 {
        // SAFETY: offset() checked the entry is backed
        unsafe { self.buffer.read_i32(self.offset(index) + HASH) }
    }

    pub(crate) fn set_hash(&self, index: i32, hash: i32) {
        unsafe { self.buffer.write_i32(self.offset(index) + HASH, hash) }
    }

    pub(crate) fn next(&self, index: i32) -> i32 {
        unsafe { self.buffer.read_i32(self.offset(index) + NEXT) }
    }

    pub(crate) fn set_next(&self, index: i32, next: i32) {
        unsafe { self.buffer.write_i32(self.offset(index) + NEXT, next) }
    }

    pub(crate) fn key(&self, index: i32) -> K {
        unsafe { self.buffer.read::<K>(self.offset(index) + KEY) }
    }

    pub(crate) fn value(&self, index: i32) -> V {
        unsafe { self.buffer.read::<V>(self.offset(index) + Self::VALUE) }
    }

    pub(crate) fn set_value(&self, index: i32, value: V) {
        unsafe { self.buffer.write::<V>(self.offset(index) + Self::VALUE, value) }
    }

    /// Write every field of entry `index`.
    pub(crate) fn write(&self, index: i32, hash: i32, next: i32, key: K, value: V) {
        let offset = self.offset(index);
        unsafe {
            self.buffer.write_i32(offset + HASH, hash);
            self.buffer.write_i32(offset + NEXT, next);
            self.buffer.write_i64(offset + LENGTH, 0);
            self.buffer.write::<K>(offset + KEY, key);
            self.buffer.write::<V>(offset + Self::VALUE, value);
        }
    }

    /// Copy the whole entry into the scratch element.
    pub(crate) fn stash(&self, index: i32) {
        let (from, to) = (self.offset(index), self.offset(-1));
        // SAFETY: both entries are inside the buffer and do not overlap
        let copied = unsafe { self.buffer.copy_to_buffer(from, &self.buffer, to, Self::ITEM_SIZE) };
        debug_assert!(copied.is_ok());
    }

    /// Copy the scratch element back over entry `index`.
    pub(crate) fn unstash(&self, index: i32) {
        let (from, to) = (self.offset(-1), self.offset(index));
        let copied = unsafe { self.buffer.copy_to_buffer(from, &self.buffer, to, Self::ITEM_SIZE) };
        debug_assert!(copied.is_ok());
    }

    /// Save the hash and next fields of entry `index` into the scratch element.
    pub(crate) fn stash_link(&self, index: i32) {
        unsafe {
            let link = self.buffer.read_i64(self.offset(index) + HASH);
            self.buffer.write_i64(self.offset(-1) + HASH, link);
        }
    }

    /// Restore the hash and next fields of entry `index` from the scratch element.
    pub(crate) fn unstash_link(&self, index: i32) {
        unsafe {
            let link = self.buffer.read_i64(self.offset(-1) + HASH);
            self.buffer.write_i64(self.offset(index) + HASH, link);
        }
    }
}

/// Chain heads over the backed part of a bucket array. Every bucket holds
/// `1 + index` of its head entry, 0 when empty.
pub(crate) struct Buckets<'a> {
    buffer: DirectBuffer<'a>,
    data_offset: usize,
    len: usize,
}

impl<'a> Buckets<'a> {
    pub(crate) fn new<A: SlotArray>(array: &'a A) -> Self {
        debug_assert_eq!(array.item_size(), size_of::<u64>());
        let buffer = array.buffer();
        let data_offset = array.data_offset();
        Self {
            buffer,
            data_offset,
            len: (buffer.len() - data_offset) / size_of::<u64>(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn offset(&self, bucket: usize) -> usize {
        assert!(bucket < self.len, "bucket {bucket} out of range for {} buckets", self.len);
        self.data_offset + bucket * size_of::<u64>()
    }

    /// Index of the head entry, `END` for an empty bucket.
    pub(crate) fn head(&self, bucket: usize) -> i32 {
        // SAFETY: bucket elements are 8-byte aligned inside the buffer
        let raw = unsafe { self.buffer.volatile_read_u64(self.offset(bucket)) };
        (raw as i64 - 1) as i32
    }

    pub(crate) fn set_head(&self, bucket: usize, index: i32) {
        let raw = (index as i64 + 1) as u64;
        unsafe { self.buffer.volatile_write_u64(self.offset(bucket), raw) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::MemorySlotArray;

    fn create_test_entries(capacity: usize) -> MemorySlotArray {
        let array = MemorySlotArray::new(item_size::<u32, u64>(), 16).expect("Failed to create array");
        array.grow(capacity).expect("Failed to grow array");
        array
    }

    #[test]
    fn test_item_size() {
        assert_eq!(item_size::<u32, u64>(), 28);
        assert_eq!(item_size::<[u8; 3], u8>(), 20);
    }

    #[test]
    fn test_fields_do_not_overlap() {
        let array = create_test_entries(4);
        let entries = Entries::<u32, u64>::new(&array);

        entries.write(2, 0x1234, 3, 77, u64::MAX);
        assert_eq!(entries.hash(2), 0x1234);
        assert_eq!(entries.next(2), 3);
        assert_eq!(entries.key(2), 77);
        assert_eq!(entries.value(2), u64::MAX);

        entries.set_value(2, 5);
        entries.set_next(2, END);
        entries.set_hash(2, FREE);
        assert_eq!(entries.key(2), 77);
        assert_eq!(entries.value(2), 5);
        assert_eq!(entries.next(2), END);
        assert_eq!(entries.hash(2), FREE);

        // Neighbours untouched
        assert_eq!(entries.hash(1), 0);
        assert_eq!(entries.hash(3), 0);
    }

    #[test]
    fn test_stash_restores_whole_entry() {
        let array = create_test_entries(2);
        let entries = Entries::<u32, u64>::new(&array);

        entries.write(1, 10, 0, 1, 100);
        entries.stash(1);
        entries.write(1, 11, END, 2, 200);
        entries.unstash(1);

        assert_eq!(entries.hash(1), 10);
        assert_eq!(entries.next(1), 0);
        assert_eq!(entries.key(1), 1);
        assert_eq!(entries.value(1), 100);
    }

    #[test]
    fn test_stash_link_only_covers_hash_and_next() {
        let array = create_test_entries(2);
        let entries = Entries::<u32, u64>::new(&array);

        entries.write(0, 42, 1, 9, 90);
        entries.stash_link(0);
        entries.set_hash(0, FREE);
        entries.set_next(0, END);
        entries.set_value(0, 91);
        entries.unstash_link(0);

        assert_eq!(entries.hash(0), 42);
        assert_eq!(entries.next(0), 1);
        assert_eq!(entries.value(0), 91);
    }

    #[test]
    fn test_contains() {
        let array = create_test_entries(3);
        let entries = Entries::<u32, u64>::new(&array);
        assert_eq!(entries.len(), 3);
        assert!(entries.contains(0));
        assert!(entries.contains(2));
        assert!(!entries.contains(3));
        assert!(!entries.contains(-1));
    }

    #[test]
    fn test_bucket_heads_are_biased() {
        let array = MemorySlotArray::new(8, 16).expect("Failed to create array");
        array.grow(5).expect("Failed to grow array");
        let buckets = Buckets::new(&array);

        assert_eq!(buckets.len(), 5);
        assert_eq!(buckets.head(4), END);
        buckets.set_head(4, 0);
        assert_eq!(array.get::<u64>(4), 1);
        assert_eq!(buckets.head(4), 0);
        buckets.set_head(4, END);
        assert_eq!(array.get::<u64>(4), 0);
    }
}
