//! System-scope named counting semaphores.
//!
//! Both FIFO semaphores are named by the decimal rendering of an integer
//! key so the worker can open them from the key it finds in the FIFO
//! header. Named (rather than anonymous in-segment) semaphores are
//! deliberate: an unnamed `sem_t` embedded in shared memory has a
//! different size on 32-bit and 64-bit peers, while the named handle is
//! ABI-stable across mixed-width host/worker pairs.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;

pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
    key: i32,
    owner: bool,
}

// SAFETY: POSIX semaphore operations are thread-safe; the handle is a
// process-shared kernel object.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn sem_name(key: i32) -> CString {
    CString::new(format!("/outboard-{}", key)).expect("no interior NUL in a decimal key")
}

impl NamedSemaphore {
    /// Create the semaphore with an initial count. A stale semaphore
    /// left behind by a crashed process is unlinked and replaced, so the
    /// initial count always takes effect.
    pub fn create(key: i32, initial: u32) -> Result<Self> {
        let name = sem_name(key);
        for _ in 0..2 {
            let sem = unsafe {
                // Variadic call: mode_t promotes to c_uint.
                libc::sem_open(
                    name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                    initial as libc::c_uint,
                )
            };
            if sem != libc::SEM_FAILED {
                return Ok(Self {
                    sem,
                    name,
                    key,
                    owner: true,
                });
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                unsafe { libc::sem_unlink(name.as_ptr()) };
                continue;
            }
            return Err(Error::Semaphore(format!(
                "failed to create semaphore {}: {}",
                key, err
            )));
        }
        Err(Error::Semaphore(format!(
            "failed to replace stale semaphore {}",
            key
        )))
    }

    /// Open an existing semaphore without touching its count.
    pub fn open(key: i32) -> Result<Self> {
        let name = sem_name(key);
        let sem = unsafe { libc::sem_open(name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(Error::Semaphore(format!(
                "failed to open semaphore {}: {}",
                key,
                io::Error::last_os_error()
            )));
        }
        Ok(Self {
            sem,
            name,
            key,
            owner: false,
        })
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    /// Decrement, blocking while the count is zero.
    pub fn acquire(&self) {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            tracing::error!(key = self.key, %err, "sem_wait failed");
            return;
        }
    }

    /// Increment, waking one blocked acquirer.
    pub fn release(&self) {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            tracing::error!(
                key = self.key,
                err = %io::Error::last_os_error(),
                "sem_post failed"
            );
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if self.owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}
