use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io::{Error, ErrorKind};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::array::{SlotArray, HEADER_SIZE};
use crate::buffer::DirectBuffer;

/// Slot array in private process memory.
///
/// The whole reservation is allocated zeroed up front; growing only moves
/// the capacity mark. Useful for single-process tables and tests.
pub struct MemorySlotArray {
    /// Pointer to the zeroed reservation
    ptr: NonNull<u8>,

    /// Layout used for allocation (needed for deallocation)
    layout: Layout,

    item_size: usize,
    max_capacity: usize,
    capacity: AtomicUsize,
}

// SAFETY: MemorySlotArray is safe to send and share between threads because:
// 1. ptr is allocated once at construction and never moved or freed until Drop
// 2. capacity is atomic and only ever increases
// 3. element access goes through DirectBuffer, whose users synchronize with
//    the atomic header slots
unsafe impl Send for MemorySlotArray {}
unsafe impl Sync for MemorySlotArray {}

impl Drop for MemorySlotArray {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout in new()
        // and has not been deallocated yet
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl MemorySlotArray {
    /// Reserve room for `max_capacity` elements of `item_size` bytes.
    /// The array starts with capacity 0.
    pub fn new(item_size: usize, max_capacity: usize) -> Result<Self, Error> {
        if item_size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "item size must be positive"));
        }
        let size = reservation_size(item_size, max_capacity)?;
        let layout = Layout::from_size_align(size, 64)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;

        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::new(ErrorKind::OutOfMemory, format!("failed to allocate {size} bytes"))
        })?;

        Ok(Self {
            ptr,
            layout,
            item_size,
            max_capacity,
            capacity: AtomicUsize::new(0),
        })
    }
}

impl SlotArray for MemorySlotArray {
    fn item_size(&self) -> usize {
        self.item_size
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn grow(&self, new_capacity: usize) -> Result<(), Error> {
        if new_capacity > self.max_capacity {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "capacity {new_capacity} exceeds reservation of {} elements",
                    self.max_capacity
                ),
            ));
        }
        self.capacity.fetch_max(new_capacity, Ordering::AcqRel);
        Ok(())
    }

    fn buffer(&self) -> DirectBuffer<'_> {
        let len = self.data_offset() + self.capacity() * self.item_size;
        // SAFETY: the reservation covers data_offset + max_capacity * item_size bytes
        unsafe { DirectBuffer::new_unchecked(self.ptr.as_ptr(), len) }
    }
}

/// Bytes needed for the header, the scratch element and `max_capacity` elements.
pub(crate) fn reservation_size(item_size: usize, max_capacity: usize) -> Result<usize, Error> {
    max_capacity
        .checked_add(1)
        .and_then(|n| n.checked_mul(item_size))
        .and_then(|n| n.checked_add(HEADER_SIZE))
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("reservation of {max_capacity} x {item_size} bytes overflows"),
            )
        })
}
