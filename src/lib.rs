//! Out-of-process audio plugin bridging.
//!
//! An in-process audio engine drives a plugin running in a separate
//! worker process: control messages travel over a shared-memory FIFO
//! pair or a local stream socket, one period of float32 audio per round
//! trip travels through a shared-memory buffer, and a watcher thread
//! turns a worker crash into silence instead of a locked-up engine.
//!
//! ## The two sides
//!
//! - [`PluginHost`] lives in the engine process: it spawns the worker,
//!   owns the audio buffer, and runs `process()` once per period.
//! - [`ClientSession`] lives in the worker process: it services the
//!   host's messages and hands each period to a [`Processor`]
//!   implementation.
//!
//! ```ignore
//! use outboard::{EngineConfig, PluginHost, TransportFlavor};
//!
//! let mut host = PluginHost::new(TransportFlavor::ShmFifo, EngineConfig::default())?;
//! host.init("outboard-worker", true, &[])?;
//!
//! // once per audio period:
//! host.process(Some(&input_frames), Some(&mut output_frames));
//! ```

#[cfg(not(unix))]
compile_error!(
    "outboard requires a Unix platform (POSIX shared memory, named semaphores, local sockets)"
);

pub mod channel;
pub mod client;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod fifo;
pub mod host;
pub mod message;
pub mod sem;
pub mod shm;
mod watcher;

pub use channel::{SocketChannel, SocketListener, Transport};
pub use client::{ClientSession, Processor};
pub use endpoint::{is_foreground_waiting, Endpoint, Flow, MessageHandler};
pub use engine::{EngineConfig, EngineSyncData, Frame, MidiEvent, CANONICAL_CHANNELS};
pub use error::{Error, Result};
pub use fifo::{ShmFifo, FIFO_CAPACITY};
pub use host::{PluginHost, TransportFlavor};
pub use message::{Message, MessageId};
pub use sem::NamedSemaphore;
pub use shm::{KeyAllocator, SharedMemory};
