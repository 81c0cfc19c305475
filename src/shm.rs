//! Integer-keyed shared memory segments.
//!
//! Segments are plain files under `/dev/shm` (Linux) or the temp
//! directory (other Unixes), named by the decimal rendering of their key
//! so host and worker can derive the name independently. The creating
//! side is the master: it owns the backing file and unlinks it when the
//! segment is dropped. Attached sides only map and unmap; the OS keeps
//! the memory alive until the last mapping goes away.

use crate::error::{Error, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// A mapped shared memory segment.
///
/// Writes go through an `UnsafeCell` because the region is shared
/// between processes and is written through shared references. This is
/// sound at the API level: every writer is serialized by the owning
/// component (the FIFO data semaphore, or the StartProcessing /
/// ProcessingDone round trip for the audio buffer).
pub struct SharedMemory {
    mapping: UnsafeCell<Option<Mapping>>,
    key: i32,
    size: usize,
    master: bool,
}

// SAFETY: the mapping itself is Send + Sync (it is OS shared memory);
// all mutation is funneled through `ptr()` under external serialization
// as documented on the struct.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

fn segment_path(key: i32) -> PathBuf {
    #[cfg(target_os = "linux")]
    let base = PathBuf::from("/dev/shm");

    #[cfg(not(target_os = "linux"))]
    let base = std::env::temp_dir();

    base.join(format!("outboard_{}", key))
}

impl SharedMemory {
    /// Create a fresh segment at `key`. Fails if the key is in use.
    pub fn create(key: i32, size: usize) -> Result<Self> {
        Self::try_create(key, size)
            .map_err(|e| Error::SharedMemory(format!("failed to create segment {}: {}", key, e)))
    }

    fn try_create(key: i32, size: usize) -> io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let path = segment_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.set_len(size as u64)?;

        let mmap = unsafe { MmapMut::map_mut(&file) }?;

        Ok(Self {
            mapping: UnsafeCell::new(Some(Mapping::ReadWrite(mmap))),
            key,
            size,
            master: true,
        })
    }

    /// Attach to an existing segment. The size is taken from the
    /// segment itself.
    pub fn attach(key: i32, read_only: bool) -> Result<Self> {
        let path = segment_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| {
                Error::SharedMemory(format!("failed to attach segment {}: {}", key, e))
            })?;
        let size = file
            .metadata()
            .map_err(|e| Error::SharedMemory(format!("failed to stat segment {}: {}", key, e)))?
            .len() as usize;

        let mapping = if read_only {
            Mapping::ReadOnly(unsafe { MmapOptions::new().map(&file) }.map_err(|e| {
                Error::SharedMemory(format!("failed to map segment {}: {}", key, e))
            })?)
        } else {
            Mapping::ReadWrite(unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
                Error::SharedMemory(format!("failed to map segment {}: {}", key, e))
            })?)
        };

        Ok(Self {
            mapping: UnsafeCell::new(Some(mapping)),
            key,
            size,
            master: false,
        })
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_attached(&self) -> bool {
        // SAFETY: detach takes &mut self, so no mutation races this read.
        unsafe { (*self.mapping.get()).is_some() }
    }

    /// Base pointer of the mapping. Null once detached.
    pub(crate) fn ptr(&self) -> *mut u8 {
        // SAFETY: the mapping lives as long as self; see struct docs for
        // the write-serialization argument.
        unsafe {
            match &mut *self.mapping.get() {
                Some(Mapping::ReadWrite(m)) => m.as_mut_ptr(),
                Some(Mapping::ReadOnly(m)) => m.as_ptr() as *mut u8,
                None => std::ptr::null_mut(),
            }
        }
    }

    fn checked_ptr(&self, offset: usize, len: usize) -> Result<*mut u8> {
        let ptr = self.ptr();
        if ptr.is_null() {
            return Err(Error::SharedMemory("segment is detached".to_string()));
        }
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(Error::SharedMemory(format!(
                "range {}..{} outside segment of {} bytes",
                offset,
                offset + len,
                self.size
            )));
        }
        // SAFETY: offset is within the mapping.
        Ok(unsafe { ptr.add(offset) })
    }

    /// Copy bytes into the segment at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.checked_ptr(offset, data.len())?;
        // SAFETY: bounds checked; writers are serialized by the owning
        // component (see struct docs).
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Copy bytes out of the segment at `offset`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let src = self.checked_ptr(offset, out.len())?;
        // SAFETY: bounds checked.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Copy samples into the segment; `offset` counts floats.
    pub fn write_f32s(&self, offset: usize, data: &[f32]) -> Result<()> {
        let dst = self.checked_ptr(offset * 4, data.len() * 4)?;
        // SAFETY: bounds checked; f32 has no alignment requirement on a
        // byte copy.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, dst, data.len() * 4)
        };
        Ok(())
    }

    /// Copy samples out of the segment; `offset` counts floats.
    pub fn read_f32s(&self, offset: usize, out: &mut [f32]) -> Result<()> {
        let src = self.checked_ptr(offset * 4, out.len() * 4)?;
        // SAFETY: bounds checked.
        unsafe {
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr() as *mut u8, out.len() * 4)
        };
        Ok(())
    }

    /// Drop the mapping. For a master this also requests destruction of
    /// the segment; the OS reclaims it once the last attachment is gone.
    ///
    /// Returns `Ok(false)` when there was nothing to detach, `Ok(true)`
    /// on success.
    pub fn detach(&mut self) -> Result<bool> {
        if self.mapping.get_mut().take().is_none() {
            return Ok(false);
        }
        self.size = 0;
        if self.master {
            match std::fs::remove_file(segment_path(self.key)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::SharedMemory(format!(
                        "failed to unlink segment {}: {}",
                        self.key, e
                    )))
                }
            }
        }
        Ok(true)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.master && self.mapping.get_mut().is_some() {
            let _ = std::fs::remove_file(segment_path(self.key));
        }
    }
}

/// Hands out fresh segment keys by probing an incrementing counter until
/// creation succeeds. Owned by the host rather than process-global, so
/// tests and multiple hosts can run side by side.
pub struct KeyAllocator {
    next: AtomicI32,
}

impl KeyAllocator {
    pub fn new() -> Self {
        // Seed from the pid so concurrent hosts rarely probe the same
        // range; collisions are still handled by the create-retry loop.
        let pid = std::process::id() as i32;
        Self {
            next: AtomicI32::new(((pid & 0xf_ffff) << 10).max(1)),
        }
    }

    /// Create a segment of `size` bytes at the next free key.
    pub fn create_with_free_key(&self, size: usize) -> Result<SharedMemory> {
        loop {
            let key = self.next.fetch_add(1, Ordering::Relaxed) + 1;
            match SharedMemory::try_create(key, size) {
                Ok(shm) => return Ok(shm),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(Error::SharedMemory(format!(
                        "failed to create segment {}: {}",
                        key, e
                    )))
                }
            }
        }
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}
