//! A bounded byte FIFO inside a shared memory segment.
//!
//! The segment starts with a fixed header followed by the payload ring:
//!
//! ```text
//! offset  0   data-semaphore key (i32, padded to 32 bytes)
//! offset 32   message-semaphore key (i32, padded to 32 bytes)
//! offset 64   start cursor (i32)
//! offset 68   end cursor (i32)
//! offset 72   payload area (FIFO_CAPACITY bytes)
//! ```
//!
//! The 32-byte padding of the semaphore-key fields is part of the
//! cross-process layout and keeps the header identical between 32-bit
//! and 64-bit peers. Bytes in `[start, end)` are the live queue; both
//! cursors reset to zero whenever the queue fully drains. The data
//! semaphore (initial count 1) serializes all cursor and payload access;
//! the message semaphore (initial count 0) counts announced messages.

use crate::error::{Error, Result};
use crate::sem::NamedSemaphore;
use crate::shm::{KeyAllocator, SharedMemory};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

/// Payload capacity. Sized generously so plugin parameter dumps fit in
/// one message.
pub const FIFO_CAPACITY: usize = 512 * 1024;

const OFF_DATA_SEM: usize = 0;
const OFF_MESSAGE_SEM: usize = 32;
const OFF_START: usize = 64;
const OFF_END: usize = 68;
const OFF_DATA: usize = 72;

pub(crate) const FIFO_SEGMENT_SIZE: usize = OFF_DATA + FIFO_CAPACITY;

/// Back-off interval while spinning for FIFO space or data.
const SPIN_SLEEP: Duration = Duration::from_micros(5);

pub struct ShmFifo {
    shm: SharedMemory,
    data_sem: NamedSemaphore,
    message_sem: NamedSemaphore,
    lock_depth: AtomicI32,
    invalid: AtomicBool,
    master: bool,
}

impl ShmFifo {
    /// Master side: allocate a fresh segment and both semaphores, and
    /// publish the semaphore keys in the header.
    pub fn create(keys: &KeyAllocator) -> Result<Self> {
        static SEM_SEQ: AtomicI32 = AtomicI32::new(0);

        let shm = keys.create_with_free_key(FIFO_SEGMENT_SIZE)?;

        let pid = (std::process::id() & 0xf_ffff) as i32;
        let data_key = (pid << 10) + SEM_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        let message_key = (pid << 10) + SEM_SEQ.fetch_add(1, Ordering::Relaxed) + 1;

        let data_sem = NamedSemaphore::create(data_key, 1)?;
        let message_sem = NamedSemaphore::create(message_key, 0)?;

        let fifo = Self {
            shm,
            data_sem,
            message_sem,
            lock_depth: AtomicI32::new(0),
            invalid: AtomicBool::new(false),
            master: true,
        };
        fifo.header_write(OFF_DATA_SEM, data_key);
        fifo.header_write(OFF_MESSAGE_SEM, message_key);
        fifo.header_write(OFF_START, 0);
        fifo.header_write(OFF_END, 0);
        Ok(fifo)
    }

    /// Worker side: attach to the master's segment and open its
    /// semaphores from the keys published in the header.
    pub fn attach(shm_key: i32) -> Result<Self> {
        let shm = SharedMemory::attach(shm_key, false)?;
        if shm.len() < FIFO_SEGMENT_SIZE {
            return Err(Error::SharedMemory(format!(
                "segment {} too small for a FIFO: {} bytes",
                shm_key,
                shm.len()
            )));
        }

        // SAFETY: the header fields are aligned i32s inside the mapping.
        let data_key = unsafe { (shm.ptr().add(OFF_DATA_SEM) as *const i32).read_volatile() };
        let message_key =
            unsafe { (shm.ptr().add(OFF_MESSAGE_SEM) as *const i32).read_volatile() };

        let data_sem = NamedSemaphore::open(data_key)?;
        let message_sem = NamedSemaphore::open(message_key)?;

        Ok(Self {
            shm,
            data_sem,
            message_sem,
            lock_depth: AtomicI32::new(0),
            invalid: AtomicBool::new(false),
            master: false,
        })
    }

    fn header_read(&self, offset: usize) -> i32 {
        // SAFETY: offset is one of the aligned header fields inside the
        // mapping.
        unsafe { (self.shm.ptr().add(offset) as *const i32).read_volatile() }
    }

    fn header_write(&self, offset: usize, value: i32) {
        // SAFETY: as above; all writers hold the data semaphore except
        // during single-owner initialization.
        unsafe { (self.shm.ptr().add(offset) as *mut i32).write_volatile(value) }
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the payload area starts at a fixed offset inside the
        // mapping.
        unsafe { self.shm.ptr().add(OFF_DATA) }
    }

    fn start(&self) -> i32 {
        self.header_read(OFF_START)
    }

    fn end(&self) -> i32 {
        self.header_read(OFF_END)
    }

    pub fn shm_key(&self) -> i32 {
        self.shm.key()
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Mark the FIFO dead. Subsequent reads zero-fill, writes are
    /// dropped, and one spurious message announcement wakes any blocked
    /// consumer so it can observe the flag.
    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
        self.message_sem.release();
    }

    /// Recursive lock over the FIFO management data: only the outermost
    /// acquisition touches the data semaphore.
    pub fn lock(&self) {
        if self.lock_depth.fetch_add(1, Ordering::AcqRel) == 0 && !self.is_invalid() {
            self.data_sem.acquire();
        }
    }

    /// Counterpart of [`lock`](Self::lock); the data semaphore is
    /// released only by the outermost unlock.
    pub fn unlock(&self) {
        if self.lock_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.data_sem.release();
        }
    }

    /// Block until at least one message has been announced.
    pub fn wait_for_message(&self) {
        if !self.is_invalid() {
            self.message_sem.acquire();
        }
    }

    /// Announce one complete message to the consumer side.
    pub fn message_sent(&self) {
        self.message_sem.release();
    }

    /// True while the queue holds unread bytes.
    pub fn messages_left(&self) -> bool {
        if self.is_invalid() {
            return false;
        }
        self.lock();
        let pending = self.start() != self.end();
        self.unlock();
        pending
    }

    /// Copy `buf.len()` bytes out of the queue, blocking until enough
    /// bytes are available. Zero-fills the buffer once invalidated.
    pub fn read(&self, buf: &mut [u8]) {
        if self.is_invalid() {
            buf.fill(0);
            return;
        }
        let len = buf.len();
        self.lock();
        while !self.is_invalid() && ((self.end() - self.start()) as usize) < len {
            self.unlock();
            thread::sleep(SPIN_SLEEP);
            self.lock();
        }
        if self.is_invalid() {
            self.unlock();
            buf.fill(0);
            return;
        }
        let start = self.start() as usize;
        // SAFETY: [start, start + len) lies inside the payload area per
        // the cursor invariant checked above.
        unsafe { fast_copy(buf.as_mut_ptr(), self.data_ptr().add(start), len) };
        let new_start = (start + len) as i32;
        if new_start == self.end() {
            // Fully drained: reset so the next writer starts at the base.
            self.header_write(OFF_START, 0);
            self.header_write(OFF_END, 0);
        } else {
            self.header_write(OFF_START, new_start);
        }
        self.unlock();
    }

    /// Append `buf` to the queue. Writes beyond the total capacity and
    /// writes on an invalid FIFO are dropped silently; otherwise this
    /// blocks until space is available, compacting the live region to
    /// the base of the payload area when that frees enough room.
    pub fn write(&self, buf: &[u8]) {
        let len = buf.len();
        if self.is_invalid() || len > FIFO_CAPACITY {
            return;
        }
        self.lock();
        while !self.is_invalid() && FIFO_CAPACITY - (self.end() as usize) < len {
            let start = self.start() as usize;
            if start > 0 {
                let end = self.end() as usize;
                // SAFETY: the live region [start, end) is inside the
                // payload area; regions may overlap, hence `copy`.
                unsafe { ptr::copy(self.data_ptr().add(start), self.data_ptr(), end - start) };
                self.header_write(OFF_END, (end - start) as i32);
                self.header_write(OFF_START, 0);
            } else {
                self.unlock();
                thread::sleep(SPIN_SLEEP);
                self.lock();
            }
        }
        if self.is_invalid() {
            self.unlock();
            return;
        }
        let end = self.end() as usize;
        // SAFETY: the space check above guarantees [end, end + len) fits
        // in the payload area.
        unsafe { fast_copy(self.data_ptr().add(end), buf.as_ptr(), len) };
        self.header_write(OFF_END, (end + len) as i32);
        self.unlock();
    }

    pub fn write_i32(&self, value: i32) {
        self.write(&value.to_ne_bytes());
    }

    pub fn read_i32(&self) -> i32 {
        let mut buf = [0u8; 4];
        self.read(&mut buf);
        i32::from_ne_bytes(buf)
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes_prefixed(&self, bytes: &[u8]) {
        self.write_i32(bytes.len() as i32);
        self.write(bytes);
    }

    /// Read a length-prefixed byte string. An implausible length (seen
    /// after invalidation) yields an empty string.
    pub fn read_bytes_prefixed(&self) -> Vec<u8> {
        let len = self.read_i32();
        if len <= 0 || len as usize > FIFO_CAPACITY {
            return Vec::new();
        }
        let mut buf = vec![0u8; len as usize];
        self.read(&mut buf);
        buf
    }
}

/// A 4-byte payload is just an integer store; everything else is a
/// plain copy.
unsafe fn fast_copy(dst: *mut u8, src: *const u8, len: usize) {
    if len == 4 {
        (dst as *mut u32).write_unaligned((src as *const u32).read_unaligned());
    } else {
        ptr::copy_nonoverlapping(src, dst, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fifo_pair() -> (Arc<ShmFifo>, Arc<ShmFifo>) {
        let keys = KeyAllocator::new();
        let master = ShmFifo::create(&keys).unwrap();
        let slave = ShmFifo::attach(master.shm_key()).unwrap();
        (Arc::new(master), Arc::new(slave))
    }

    #[test]
    fn test_byte_roundtrip_preserves_order() {
        let (master, slave) = fifo_pair();

        master.write(b"hello");
        master.write(b", ");
        master.write(b"world");

        let mut buf = [0u8; 12];
        slave.read(&mut buf);
        assert_eq!(&buf, b"hello, world");
    }

    #[test]
    fn test_i32_and_string_framing() {
        let (master, slave) = fifo_pair();

        master.write_i32(0x1234_5678);
        master.write_bytes_prefixed(b"frame data");
        master.write_i32(-7);

        assert_eq!(slave.read_i32(), 0x1234_5678);
        assert_eq!(slave.read_bytes_prefixed(), b"frame data");
        assert_eq!(slave.read_i32(), -7);
    }

    #[test]
    fn test_cursors_reset_after_full_drain() {
        let (master, slave) = fifo_pair();

        master.write(&[1u8; 100]);
        let mut buf = [0u8; 100];
        slave.read(&mut buf);

        // After the drain the writer starts at the base again, so one
        // full-capacity write succeeds without compaction.
        let payload = vec![0xA5u8; FIFO_CAPACITY];
        master.write(&payload);
        let mut echo = vec![0u8; FIFO_CAPACITY];
        slave.read(&mut echo);
        assert_eq!(echo, payload);
    }

    #[test]
    fn test_oversized_write_is_dropped() {
        let (master, slave) = fifo_pair();

        master.write(&vec![1u8; FIFO_CAPACITY + 1]);
        assert!(!slave.messages_left());

        // The FIFO still works afterwards.
        master.write(b"ok");
        let mut buf = [0u8; 2];
        slave.read(&mut buf);
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn test_full_fifo_write_blocks_until_reader_drains() {
        let (master, slave) = fifo_pair();

        master.write(&vec![0u8; FIFO_CAPACITY]);

        let reader = {
            let slave = Arc::clone(&slave);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                let mut buf = vec![0u8; FIFO_CAPACITY];
                slave.read(&mut buf);
            })
        };

        // Blocks until the reader frees space, then completes.
        master.write(&[9u8]);
        reader.join().unwrap();

        let mut buf = [0u8; 1];
        slave.read(&mut buf);
        assert_eq!(buf[0], 9);
    }

    #[test]
    fn test_write_across_compaction_boundary() {
        let (master, slave) = fifo_pair();

        master.write(&[7u8; 100]);
        let mut buf = [0u8; 60];
        slave.read(&mut buf);

        // start == 60, end == 100: this write only fits after the live
        // region moves to the base.
        let big = vec![3u8; FIFO_CAPACITY - 40];
        master.write(&big);

        let mut tail = [0u8; 40];
        slave.read(&mut tail);
        assert_eq!(tail, [7u8; 40]);

        let mut echo = vec![0u8; big.len()];
        slave.read(&mut echo);
        assert_eq!(echo, big);
    }

    #[test]
    fn test_invalidate_zero_fills_blocked_read() {
        let (master, slave) = fifo_pair();

        let reader = {
            let slave = Arc::clone(&slave);
            std::thread::spawn(move || {
                let mut buf = [0xFFu8; 16];
                slave.read(&mut buf);
                buf
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        slave.invalidate();
        let buf = reader.join().unwrap();
        assert_eq!(buf, [0u8; 16]);

        // Writes on the other half are unaffected, writes here dropped.
        slave.write(b"dropped");
        assert!(!master.messages_left());
    }

    #[test]
    fn test_invalidate_unblocks_message_wait() {
        let (master, _slave) = fifo_pair();

        let waiter = {
            let master = Arc::clone(&master);
            std::thread::spawn(move || master.wait_for_message())
        };

        std::thread::sleep(Duration::from_millis(50));
        master.invalidate();
        waiter.join().unwrap();
    }

    #[test]
    fn test_recursive_lock_releases_once() {
        let (master, slave) = fifo_pair();

        master.lock();
        master.lock();
        // A nested write must not deadlock on the already-held lock.
        master.write(b"nested");
        master.unlock();
        master.unlock();

        // The data semaphore is back to one: the other side can lock
        // and read normally.
        let mut buf = [0u8; 6];
        slave.read(&mut buf);
        assert_eq!(&buf, b"nested");
    }

    #[test]
    fn test_message_announcement() {
        let (master, slave) = fifo_pair();

        assert!(!slave.messages_left());
        master.write(b"x");
        master.message_sent();
        assert!(slave.messages_left());

        slave.wait_for_message();
        let mut buf = [0u8; 1];
        slave.read(&mut buf);
        assert!(!slave.messages_left());
    }
}
