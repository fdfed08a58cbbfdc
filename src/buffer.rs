//! Raw, non-owning views over mapped memory.
//!
//! A [`DirectBuffer`] is a pointer and a length borrowed from whoever owns the
//! mapping. It never allocates or frees. Element accessors are `unsafe`: the
//! caller guarantees the byte range lies inside the view, and that guarantee
//! is verified by [`DirectBuffer::assert`] only when checks are compiled in
//! (debug builds, or release builds with the `checks` feature).

use crate::BufferError;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// Whether bounds checks are compiled into buffer accessors.
pub const CHECKS_ENABLED: bool = cfg!(any(debug_assertions, feature = "checks"));

/// Marker for types that may be copied to and from raw mapped bytes.
///
/// # Safety
///
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid value and
/// the type must not hold pointers or references. Integers, floats, [`Uuid`]
/// and arrays of such types qualify; `bool`, `char` and enums do not.
pub unsafe trait Plain: Copy + 'static {}

unsafe impl Plain for u8 {}
unsafe impl Plain for i8 {}
unsafe impl Plain for u16 {}
unsafe impl Plain for i16 {}
unsafe impl Plain for u32 {}
unsafe impl Plain for i32 {}
unsafe impl Plain for u64 {}
unsafe impl Plain for i64 {}
unsafe impl Plain for u128 {}
unsafe impl Plain for i128 {}
unsafe impl Plain for usize {}
unsafe impl Plain for isize {}
unsafe impl Plain for f32 {}
unsafe impl Plain for f64 {}
unsafe impl Plain for Uuid {}
unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

/// A 16-byte identifier stored verbatim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Uuid([u8; 16]);

impl Uuid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub const fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }
}

/// Non-owning view over `len` bytes starting at `data`.
#[derive(Clone, Copy)]
pub struct DirectBuffer<'a> {
    data: *mut u8,
    len: usize,
    _lifetime: PhantomData<&'a [u8]>,
}

// SAFETY: the view is a plain address range; concurrent access to the bytes
// behind it is coordinated by the owner through the atomic accessors.
unsafe impl Send for DirectBuffer<'_> {}
unsafe impl Sync for DirectBuffer<'_> {}

impl std::fmt::Debug for DirectBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectBuffer")
            .field("data", &self.data)
            .field("len", &self.len)
            .finish()
    }
}

macro_rules! plain_accessors {
    ($($read:ident, $write:ident => $ty:ty;)*) => {
        $(
            #[doc = concat!("Read an unaligned `", stringify!($ty), "` at byte offset `index`.")]
            ///
            /// # Safety
            ///
            /// The value's bytes must lie within the view.
            #[inline]
            pub unsafe fn $read(&self, index: usize) -> $ty {
                self.read::<$ty>(index)
            }

            #[doc = concat!("Write an unaligned `", stringify!($ty), "` at byte offset `index`.")]
            ///
            /// # Safety
            ///
            /// The value's bytes must lie within the view.
            #[inline]
            pub unsafe fn $write(&self, index: usize, value: $ty) {
                self.write::<$ty>(index, value)
            }
        )*
    };
}

impl<'a> DirectBuffer<'a> {
    /// Create a view over `len` bytes at `data`.
    ///
    /// Fails with [`BufferError::Invalid`] for a null pointer or zero length.
    ///
    /// # Safety
    ///
    /// `data..data + len` must stay mapped and writable for `'a`.
    pub unsafe fn new(data: *mut u8, len: usize) -> Result<Self, BufferError> {
        if data.is_null() || len == 0 {
            return Err(BufferError::Invalid);
        }
        Ok(Self::new_unchecked(data, len))
    }

    /// Create a view without validating the arguments.
    ///
    /// # Safety
    ///
    /// Same as [`DirectBuffer::new`]; the result may be an invalid view.
    #[inline]
    pub const unsafe fn new_unchecked(data: *mut u8, len: usize) -> Self {
        Self {
            data,
            len,
            _lifetime: PhantomData,
        }
    }

    /// View over a borrowed byte slice.
    pub fn from_slice(slice: &'a mut [u8]) -> Self {
        // SAFETY: the slice is valid for 'a and exclusively borrowed.
        unsafe { Self::new_unchecked(slice.as_mut_ptr(), slice.len()) }
    }

    pub fn is_valid(&self) -> bool {
        !self.data.is_null() && self.len > 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.data
    }

    /// Check that `index..index + length` lies within a valid view.
    ///
    /// This is the only bounds check the buffer performs. It always succeeds
    /// when checks are compiled out.
    #[inline]
    pub fn assert(&self, index: usize, length: usize) -> Result<(), BufferError> {
        if CHECKS_ENABLED {
            self.check(index, length)
        } else {
            Ok(())
        }
    }

    fn check(&self, index: usize, length: usize) -> Result<(), BufferError> {
        if !self.is_valid() {
            return Err(BufferError::Invalid);
        }
        match index.checked_add(length) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BufferError::OutOfBounds {
                index,
                length,
                capacity: self.len,
            }),
        }
    }

    #[inline]
    fn guard(&self, index: usize, length: usize) {
        if let Err(e) = self.assert(index, length) {
            panic!("{e}");
        }
    }

    /// Sub-view from `start` to the end of this view.
    pub fn slice_from(&self, start: usize) -> Result<DirectBuffer<'a>, BufferError> {
        self.assert(0, start)?;
        // SAFETY: the range is inside this view (checked when checks are on).
        Ok(unsafe { Self::new_unchecked(self.data.wrapping_add(start), self.len.wrapping_sub(start)) })
    }

    /// Sub-view of `length` bytes starting at `start`.
    pub fn slice(&self, start: usize, length: usize) -> Result<DirectBuffer<'a>, BufferError> {
        self.assert(start, length)?;
        // SAFETY: the range is inside this view (checked when checks are on).
        Ok(unsafe { Self::new_unchecked(self.data.wrapping_add(start), length) })
    }

    /// Read an unaligned `T` at byte offset `index`.
    ///
    /// # Safety
    ///
    /// `index..index + size_of::<T>()` must lie within the view.
    #[inline]
    pub unsafe fn read<T: Plain>(&self, index: usize) -> T {
        self.guard(index, std::mem::size_of::<T>());
        ptr::read_unaligned(self.data.add(index) as *const T)
    }

    /// Write an unaligned `T` at byte offset `index`.
    ///
    /// # Safety
    ///
    /// `index..index + size_of::<T>()` must lie within the view.
    #[inline]
    pub unsafe fn write<T: Plain>(&self, index: usize, value: T) {
        self.guard(index, std::mem::size_of::<T>());
        ptr::write_unaligned(self.data.add(index) as *mut T, value)
    }

    plain_accessors! {
        read_u8, write_u8 => u8;
        read_i8, write_i8 => i8;
        read_u16, write_u16 => u16;
        read_i16, write_i16 => i16;
        read_u32, write_u32 => u32;
        read_i32, write_i32 => i32;
        read_u64, write_u64 => u64;
        read_i64, write_i64 => i64;
        read_f32, write_f32 => f32;
        read_f64, write_f64 => f64;
        read_uuid, write_uuid => Uuid;
    }

    #[inline]
    unsafe fn atomic_i32(&self, index: usize) -> &AtomicI32 {
        self.guard(index, 4);
        let ptr = self.data.add(index) as *mut i32;
        debug_assert!(ptr.is_aligned(), "unaligned atomic access at {index}");
        AtomicI32::from_ptr(ptr)
    }

    #[inline]
    unsafe fn atomic_i64(&self, index: usize) -> &AtomicI64 {
        self.guard(index, 8);
        let ptr = self.data.add(index) as *mut i64;
        debug_assert!(ptr.is_aligned(), "unaligned atomic access at {index}");
        AtomicI64::from_ptr(ptr)
    }

    // Volatile accessors have acquire/release semantics. Offsets must be
    // naturally aligned.

    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn volatile_read_i32(&self, index: usize) -> i32 {
        self.atomic_i32(index).load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn volatile_write_i32(&self, index: usize, value: i32) {
        self.atomic_i32(index).store(value, Ordering::Release)
    }

    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn volatile_read_u32(&self, index: usize) -> u32 {
        self.volatile_read_i32(index) as u32
    }

    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn volatile_write_u32(&self, index: usize, value: u32) {
        self.volatile_write_i32(index, value as i32)
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn volatile_read_i64(&self, index: usize) -> i64 {
        self.atomic_i64(index).load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn volatile_write_i64(&self, index: usize, value: i64) {
        self.atomic_i64(index).store(value, Ordering::Release)
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn volatile_read_u64(&self, index: usize) -> u64 {
        self.volatile_read_i64(index) as u64
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn volatile_write_u64(&self, index: usize, value: u64) {
        self.volatile_write_i64(index, value as i64)
    }

    // Interlocked operations are sequentially consistent and return the
    // value after the update, except compare_exchange which returns the
    // value found before it.

    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_increment_i32(&self, index: usize) -> i32 {
        self.interlocked_add_i32(index, 1)
    }

    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_decrement_i32(&self, index: usize) -> i32 {
        self.interlocked_add_i32(index, -1)
    }

    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_add_i32(&self, index: usize, value: i32) -> i32 {
        self.atomic_i32(index)
            .fetch_add(value, Ordering::SeqCst)
            .wrapping_add(value)
    }

    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_read_i32(&self, index: usize) -> i32 {
        self.atomic_i32(index).load(Ordering::SeqCst)
    }

    /// Store `value` if the current value equals `comparand`. Returns the
    /// value observed before the operation.
    ///
    /// # Safety
    ///
    /// `index` must be 4-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_compare_exchange_i32(&self, index: usize, value: i32, comparand: i32) -> i32 {
        match self
            .atomic_i32(index)
            .compare_exchange(comparand, value, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_increment_i64(&self, index: usize) -> i64 {
        self.interlocked_add_i64(index, 1)
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_decrement_i64(&self, index: usize) -> i64 {
        self.interlocked_add_i64(index, -1)
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_add_i64(&self, index: usize, value: i64) -> i64 {
        self.atomic_i64(index)
            .fetch_add(value, Ordering::SeqCst)
            .wrapping_add(value)
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_read_i64(&self, index: usize) -> i64 {
        self.atomic_i64(index).load(Ordering::SeqCst)
    }

    /// # Safety
    ///
    /// `index` must be 8-byte aligned and inside the view.
    #[inline]
    pub unsafe fn interlocked_compare_exchange_i64(&self, index: usize, value: i64, comparand: i64) -> i64 {
        match self
            .atomic_i64(index)
            .compare_exchange(comparand, value, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Zero `length` bytes starting at `index`.
    ///
    /// # Safety
    ///
    /// The range must lie within the view.
    pub unsafe fn clear(&self, index: usize, length: usize) {
        self.guard(index, length);
        ptr::write_bytes(self.data.add(index), 0, length);
    }

    /// Copy `length` bytes at `index` into `destination`.
    ///
    /// # Safety
    ///
    /// `index..index + length` must lie within the view.
    pub unsafe fn copy_to(&self, index: usize, destination: &mut [u8], length: usize) -> Result<(), BufferError> {
        if CHECKS_ENABLED && destination.len() < length {
            return Err(BufferError::OutOfRange {
                requested: length,
                available: destination.len(),
            });
        }
        self.assert(index, length)?;
        ptr::copy_nonoverlapping(self.data.add(index), destination.as_mut_ptr(), length);
        Ok(())
    }

    /// Copy `length` bytes at `index` into `destination` at `offset`.
    ///
    /// # Safety
    ///
    /// Both ranges must lie within their views and may overlap.
    pub unsafe fn copy_to_buffer(
        &self,
        index: usize,
        destination: &DirectBuffer<'_>,
        offset: usize,
        length: usize,
    ) -> Result<(), BufferError> {
        destination.assert(offset, length)?;
        self.assert(index, length)?;
        ptr::copy(self.data.add(index), destination.data.add(offset), length);
        Ok(())
    }

    /// Copy `length` bytes from `source` into the view at `index`.
    ///
    /// # Safety
    ///
    /// `index..index + length` must lie within the view.
    pub unsafe fn copy_from(&self, index: usize, source: &[u8], length: usize) -> Result<(), BufferError> {
        if CHECKS_ENABLED && source.len() < length {
            return Err(BufferError::OutOfRange {
                requested: length,
                available: source.len(),
            });
        }
        self.assert(index, length)?;
        ptr::copy_nonoverlapping(source.as_ptr(), self.data.add(index), length);
        Ok(())
    }

    /// Copy `length` bytes from `source` at `offset` into the view at `index`.
    ///
    /// # Safety
    ///
    /// Both ranges must lie within their views and may overlap.
    pub unsafe fn copy_from_buffer(
        &self,
        index: usize,
        source: &DirectBuffer<'_>,
        offset: usize,
        length: usize,
    ) -> Result<(), BufferError> {
        source.copy_to_buffer(offset, self, index, length)
    }
}
