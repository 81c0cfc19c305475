//! Error types for the plugin bridge.
//!
//! These cover setup and resource acquisition. The RPC hot path never
//! returns errors: a broken link flips the endpoint's invalid flag,
//! reads start zero-filling and `process()` reports failure by value.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("semaphore error: {0}")]
    Semaphore(String),

    #[error("worker executable not found: {0}")]
    WorkerNotFound(PathBuf),

    #[error("invalid worker invocation: {0}")]
    BadInvocation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
