//! Worker process ownership and liveness.
//!
//! The child process is spawned and watched from a dedicated thread:
//! the watcher owns the process handle, polls for exit, and invalidates
//! the RPC endpoint when the worker dies without being asked to. Running
//! the child under a non-main thread owner is deliberate — it keeps the
//! worker's signal handling away from whatever the embedding
//! application does on its main thread.

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct ProcessWatcher {
    thread: Option<JoinHandle<()>>,
    quit: Arc<AtomicBool>,
    died: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    link: Arc<OnceLock<Arc<Endpoint>>>,
}

impl ProcessWatcher {
    /// Spawn `exec` on the watcher thread and start watching it.
    /// Returns once the spawn itself has succeeded or failed.
    pub fn spawn(exec: PathBuf, args: Vec<OsString>) -> Result<Self> {
        let quit = Arc::new(AtomicBool::new(false));
        let died = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(None::<Child>));
        let link = Arc::new(OnceLock::<Arc<Endpoint>>::new());

        let (spawn_tx, spawn_rx) = crossbeam_channel::bounded::<io::Result<()>>(1);

        let thread = {
            let quit = Arc::clone(&quit);
            let died = Arc::clone(&died);
            let child = Arc::clone(&child);
            let link = Arc::clone(&link);
            std::thread::Builder::new()
                .name("outboard-watcher".to_string())
                .spawn(move || {
                    match Command::new(&exec).args(&args).spawn() {
                        Ok(c) => {
                            tracing::debug!(?exec, pid = c.id(), "spawned worker");
                            *child.lock() = Some(c);
                            let _ = spawn_tx.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = spawn_tx.send(Err(e));
                            return;
                        }
                    }
                    loop {
                        if quit.load(Ordering::Acquire) {
                            break;
                        }
                        let status = child
                            .lock()
                            .as_mut()
                            .and_then(|c| c.try_wait().ok().flatten());
                        match status {
                            Some(status) => {
                                if !quit.load(Ordering::Acquire) {
                                    tracing::error!(
                                        %status,
                                        "worker process died, invalidating the link"
                                    );
                                    died.store(true, Ordering::Release);
                                    if let Some(endpoint) = link.get() {
                                        endpoint.invalidate();
                                    }
                                }
                                break;
                            }
                            None => std::thread::sleep(POLL_INTERVAL),
                        }
                    }
                })
                .map_err(Error::Io)?
        };

        spawn_rx
            .recv()
            .map_err(|_| Error::Io(io::Error::other("watcher thread quit before spawning")))?
            .map_err(Error::Io)?;

        Ok(Self {
            thread: Some(thread),
            quit,
            died,
            child,
            link,
        })
    }

    /// Hand the watcher the endpoint to invalidate on death. Done after
    /// spawn because the socket flavor only has an endpoint once the
    /// worker has connected.
    pub fn attach_endpoint(&self, endpoint: Arc<Endpoint>) {
        let _ = self.link.set(endpoint);
        if self.died.load(Ordering::Acquire) {
            if let Some(endpoint) = self.link.get() {
                endpoint.invalidate();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.child.lock().as_mut().map(|c| c.try_wait()),
            Some(Ok(None))
        )
    }

    /// Tell the watcher the upcoming exit is expected.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    /// Wait up to `timeout` for the worker to exit on its own.
    pub fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_running() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        !self.is_running()
    }

    /// Ask politely (SIGTERM).
    pub fn terminate(&self) {
        if let Some(child) = self.child.lock().as_ref() {
            unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
        }
    }

    /// Stop asking (SIGKILL), and reap.
    pub fn kill(&self) {
        if let Some(child) = self.child.lock().as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ProcessWatcher {
    fn drop(&mut self) {
        self.request_quit();
        self.join();
    }
}
