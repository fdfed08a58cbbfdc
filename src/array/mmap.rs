use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::array::memory::reservation_size;
use crate::array::{SlotArray, HEADER_SIZE};
use crate::buffer::DirectBuffer;

/// Slot array backed by a shared file mapping.
///
/// The mapping covers the whole reservation from the start while the file
/// only covers the backed capacity. Growing extends the file underneath the
/// mapping, which every process that maps the same file observes.
pub struct MmapSlotArray {
    /// Memory mapped region. Element access goes through `ptr`, which must
    /// not outlive the mapping.
    mmap: MmapMut,
    ptr: NonNull<u8>,
    file: File,
    path: PathBuf,
    item_size: usize,
    max_capacity: usize,
    capacity: AtomicUsize,
}

// SAFETY: the mapping is never remapped or moved while the array lives, the
// capacity mark is atomic, and element access is synchronized by the owner
// through the atomic header slots.
unsafe impl Send for MmapSlotArray {}
unsafe impl Sync for MmapSlotArray {}

impl MmapSlotArray {
    /// Open or create the array file at `path`.
    ///
    /// An existing file keeps its contents; a new one starts with zeroed
    /// header and scratch element and capacity 0.
    pub fn open(path: impl Into<PathBuf>, item_size: usize, max_capacity: usize) -> Result<Self, Error> {
        let path = path.into();
        if item_size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "item size must be positive"));
        }
        let reserved = reservation_size(item_size, max_capacity)?;
        let data_offset = HEADER_SIZE + item_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = extend(&file, data_offset as u64)? as usize;

        // Map the whole reservation. Pages past the end of the file are
        // never touched until grow() has extended the file over them.
        let mut mmap = unsafe { MmapOptions::new().len(reserved).map_mut(&file)? };
        let ptr = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| Error::new(ErrorKind::Other, "mapping returned a null address"))?;

        let capacity = ((file_len - data_offset) / item_size).min(max_capacity);

        Ok(Self {
            mmap,
            ptr,
            file,
            path,
            item_size,
            max_capacity,
            capacity: AtomicUsize::new(capacity),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush dirty pages of the mapping to the file.
    pub fn flush(&self) -> Result<(), Error> {
        self.mmap.flush()
    }
}

/// Grow `file` to at least `len` bytes and return its length. Never
/// shrinks it: the length check and `set_len` run under an exclusive
/// advisory lock, so a stale length seen by another opener cannot cut the
/// file under a live mapping.
fn extend(file: &File, len: u64) -> Result<u64, Error> {
    let _lock = FileLock::exclusive(file)?;
    let current = file.metadata()?.len();
    if current >= len {
        return Ok(current);
    }
    file.set_len(len)?;
    Ok(len)
}

/// Exclusive `flock` held until drop.
struct FileLock<'a> {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: &'a File,
}

impl<'a> FileLock<'a> {
    #[cfg(unix)]
    fn exclusive(file: &'a File) -> Result<Self, Error> {
        use std::os::unix::io::AsRawFd;
        loop {
            // SAFETY: the descriptor is owned by `file`, which outlives the lock
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                return Ok(Self { file });
            }
            let e = Error::last_os_error();
            if e.kind() != ErrorKind::Interrupted {
                return Err(e);
            }
        }
    }

    #[cfg(not(unix))]
    fn exclusive(file: &'a File) -> Result<Self, Error> {
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: as in exclusive()
            unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        }
    }
}

impl SlotArray for MmapSlotArray {
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
        if new_capacity <= self.capacity() {
            return Ok(());
        }
        if new_capacity > self.max_capacity {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "capacity {new_capacity} exceeds reservation of {} elements in {}",
                    self.max_capacity,
                    self.path.display()
                ),
            ));
        }

        let needed = (self.data_offset() + new_capacity * self.item_size) as u64;
        extend(&self.file, needed)?;
        self.capacity.fetch_max(new_capacity, Ordering::AcqRel);
        Ok(())
    }

    fn buffer(&self) -> DirectBuffer<'_> {
        let len = self.data_offset() + self.capacity() * self.item_size;
        // SAFETY: the mapping covers the reservation and the file covers
        // `len` bytes of it
        unsafe { DirectBuffer::new_unchecked(self.ptr.as_ptr(), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("Failed to create temp dir")
    }

    #[test]
    fn test_new_file_has_header_and_scratch() {
        let dir = create_test_dir();
        let path = dir.path().join("array");
        let array = MmapSlotArray::open(&path, 24, 100).expect("Failed to open array");

        assert_eq!(array.capacity(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), (HEADER_SIZE + 24) as u64);
    }

    #[test]
    fn test_grow_extends_file() {
        let dir = create_test_dir();
        let path = dir.path().join("array");
        let array = MmapSlotArray::open(&path, 8, 100).expect("Failed to open array");

        array.grow(10).expect("Failed to grow");
        assert_eq!(array.capacity(), 10);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), (HEADER_SIZE + 8 + 80) as u64);

        assert!(array.grow(101).is_err());
    }

    #[test]
    fn test_reopen_keeps_contents() {
        let dir = create_test_dir();
        let path = dir.path().join("array");
        {
            let array = MmapSlotArray::open(&path, 8, 100).expect("Failed to open array");
            array.grow(7).expect("Failed to grow");
            array.set::<u64>(6, 0xfeed);
            unsafe { array.slot(2).volatile_write_i64(0, 12) };
            array.flush().expect("Failed to flush");
        }

        let array = MmapSlotArray::open(&path, 8, 100).expect("Failed to reopen array");
        assert_eq!(array.capacity(), 7);
        assert_eq!(array.get::<u64>(6), 0xfeed);
        assert_eq!(unsafe { array.slot(2).volatile_read_i64(0) }, 12);
    }

    #[test]
    fn test_extend_never_shrinks() {
        let dir = create_test_dir();
        let path = dir.path().join("array");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .expect("Failed to create file");

        assert_eq!(extend(&file, 4096).expect("extend"), 4096);
        assert_eq!(extend(&file, 100).expect("stale extend"), 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn test_late_opener_keeps_grown_file() {
        let dir = create_test_dir();
        let path = dir.path().join("array");
        let first = MmapSlotArray::open(&path, 8, 100).expect("Failed to open array");
        first.grow(50).expect("Failed to grow");
        first.set::<u64>(49, 7);

        let second = MmapSlotArray::open(&path, 8, 100).expect("Failed to open array");
        assert_eq!(second.capacity(), 50);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), (HEADER_SIZE + 8 + 400) as u64);
        assert_eq!(first.get::<u64>(49), 7);
    }

    #[test]
    fn test_concurrent_open_and_grow_only_extend() {
        let dir = create_test_dir();
        let path = dir.path().join("array");

        std::thread::scope(|scope| {
            for n in 1..=8usize {
                let path = &path;
                scope.spawn(move || {
                    let array = MmapSlotArray::open(path, 8, 100).expect("Failed to open array");
                    array.grow(n * 10).expect("Failed to grow");
                });
            }
        });

        assert_eq!(std::fs::metadata(&path).unwrap().len(), (HEADER_SIZE + 8 + 640) as u64);
    }

    #[test]
    fn test_two_mappings_share_memory_and_growth() {
        let dir = create_test_dir();
        let path = dir.path().join("array");
        let first = MmapSlotArray::open(&path, 8, 100).expect("Failed to open array");
        let second = MmapSlotArray::open(&path, 8, 100).expect("Failed to open array");

        first.grow(20).expect("Failed to grow");
        first.set::<u64>(19, 5);

        // The second mapping only needs to learn the new capacity
        second.grow(20).expect("Failed to sync capacity");
        assert_eq!(second.get::<u64>(19), 5);

        unsafe { second.slot(0).interlocked_increment_i32(0) };
        assert_eq!(unsafe { first.slot(0).volatile_read_i32(0) }, 1);
    }
}
