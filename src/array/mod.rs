mod memory;
mod mmap;

pub use memory::*;
pub use mmap::*;

use crate::buffer::{DirectBuffer, Plain};

/// Number of reserved control words at the start of every array.
pub const SLOT_COUNT: usize = 8;
/// Size of one control word.
pub const SLOT_SIZE: usize = 8;
/// Bytes taken by the control words.
pub const HEADER_SIZE: usize = SLOT_COUNT * SLOT_SIZE;

/// Growable array of fixed-size elements.
///
/// Layout of the backing region:
///
/// ```text
/// [0, 64)                      Slot0..Slot7, 8 bytes each
/// [64, 64 + item)              element -1, scratch space
/// [data_offset, ..)            elements 0..capacity
/// ```
///
/// Implementations reserve address space for their maximum capacity up
/// front, so [`SlotArray::grow`] never moves the region: views and slot
/// addresses taken before a grow stay valid.
pub trait SlotArray: Send + Sync {
    /// Size of one element in bytes.
    fn item_size(&self) -> usize;

    /// Number of elements currently backed.
    fn capacity(&self) -> usize;

    /// Capacity the address reservation can hold.
    fn max_capacity(&self) -> usize;

    /// Back at least `new_capacity` elements. Never shrinks and never moves
    /// the region; a no-op when the capacity is already large enough.
    fn grow(&self, new_capacity: usize) -> std::io::Result<()>;

    /// View over the header, the scratch element and all backed elements.
    fn buffer(&self) -> DirectBuffer<'_>;

    /// Byte offset of element 0.
    fn data_offset(&self) -> usize {
        HEADER_SIZE + self.item_size()
    }

    /// Byte offset of element `index`; `-1` addresses the scratch element.
    fn offset_of(&self, index: isize) -> usize {
        debug_assert!(index >= -1);
        (self.data_offset() as isize + index * self.item_size() as isize) as usize
    }

    /// The 64 header bytes.
    fn header(&self) -> DirectBuffer<'_> {
        let buffer = self.buffer();
        // SAFETY: every array is at least HEADER_SIZE + item_size bytes long
        unsafe { DirectBuffer::new_unchecked(buffer.as_ptr(), HEADER_SIZE) }
    }

    /// 8-byte view over control word `slot`.
    fn slot(&self, slot: usize) -> DirectBuffer<'_> {
        assert!(slot < SLOT_COUNT, "slot {slot} out of range");
        let buffer = self.buffer();
        // SAFETY: the slot lies inside the header
        unsafe { DirectBuffer::new_unchecked(buffer.as_ptr().add(slot * SLOT_SIZE), SLOT_SIZE) }
    }

    /// Read element `index` as a `T` that fits in one element.
    fn get<T: Plain>(&self, index: isize) -> T {
        self.check_element::<T>(index);
        // SAFETY: the element is backed and T fits in it
        unsafe { self.buffer().read::<T>(self.offset_of(index)) }
    }

    /// Write element `index` as a `T` that fits in one element.
    fn set<T: Plain>(&self, index: isize, value: T) {
        self.check_element::<T>(index);
        // SAFETY: the element is backed and T fits in it
        unsafe { self.buffer().write::<T>(self.offset_of(index), value) }
    }

    #[doc(hidden)]
    fn check_element<T: Plain>(&self, index: isize) {
        assert!(
            std::mem::size_of::<T>() <= self.item_size(),
            "element type larger than item size"
        );
        assert!(
            index >= -1 && index < self.capacity() as isize,
            "element {index} out of range for capacity {}",
            self.capacity()
        );
    }

    /// Zero the scratch element and every backed element. Header slots are
    /// left to their owner.
    fn clear(&self) {
        let buffer = self.buffer();
        let length = buffer.len() - HEADER_SIZE;
        // SAFETY: the range is the tail of the buffer
        unsafe { buffer.clear(HEADER_SIZE, length) }
    }
}
