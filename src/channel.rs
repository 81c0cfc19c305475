//! Control-channel transports.
//!
//! Two flavors carry the same framed messages: a pair of shared-memory
//! FIFOs (one per direction), or a single local stream socket. The
//! flavor is fixed when the host is built; only the byte transport
//! differs, the codec on top is shared.

use crate::error::{Error, Result};
use crate::fifo::{ShmFifo, FIFO_CAPACITY};
use crate::message::Message;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Upper bound on the argument count of one message; anything larger is
/// stream corruption.
const MAX_MESSAGE_ARGS: i32 = 1024;

/// Upper bound on a single socket-borne argument. Sockets are not
/// capacity-limited like the FIFO, but a multi-megabyte length prefix
/// means the stream has desynchronized.
const MAX_SOCKET_ARG: i32 = 64 * 1024 * 1024;

/// A connected local stream socket carrying framed messages.
///
/// One mutex per direction serializes concurrent senders or receivers
/// so a message is never interleaved with another. Reads and writes that
/// return zero or fail invalidate the channel; from then on reads
/// zero-fill and writes are dropped.
pub struct SocketChannel {
    stream: UnixStream,
    invalid: AtomicBool,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl SocketChannel {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .map_err(|e| Error::Transport(format!("could not connect to {:?}: {}", path, e)))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream (the accept path, and tests
    /// driving both ends of a socket pair).
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            invalid: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
        // Wake anything blocked in read on this side.
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// True if at least one byte of a message is readable right now.
    pub fn messages_left(&self) -> bool {
        let mut pollfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pollfd, 1, 0) } == -1 {
            tracing::warn!("unexpected poll error on control socket");
            return false;
        }
        pollfd.revents & libc::POLLIN != 0
    }

    fn read_exact(&self, buf: &mut [u8]) {
        if self.is_invalid() {
            buf.fill(0);
            return;
        }
        let mut filled = 0;
        while filled < buf.len() {
            match (&self.stream).read(&mut buf[filled..]) {
                Ok(0) => {
                    self.invalidate();
                    buf.fill(0);
                    return;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(%e, "error while reading control socket");
                    self.invalidate();
                    buf.fill(0);
                    return;
                }
            }
        }
    }

    fn write_all(&self, buf: &[u8]) {
        if self.is_invalid() {
            return;
        }
        let mut written = 0;
        while written < buf.len() {
            match (&self.stream).write(&buf[written..]) {
                Ok(0) => {
                    self.invalidate();
                    return;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(%e, "error while writing control socket");
                    self.invalidate();
                    return;
                }
            }
        }
    }

    fn read_i32(&self) -> i32 {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf);
        i32::from_ne_bytes(buf)
    }

    fn write_i32(&self, value: i32) {
        self.write_all(&value.to_ne_bytes());
    }
}

/// The host side of the socket flavor: bound to a unique temporary
/// path, expecting exactly one worker to dial in.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    pub fn bind_unique() -> Result<Self> {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "outboard-{}-{}.sock",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::Transport(format!("could not bind {:?}: {}", path, e)))?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the worker to connect, retrying a few times on
    /// transient poll errors.
    pub fn accept(&self, timeout: Duration) -> Result<SocketChannel> {
        let mut retries = 0;
        loop {
            let mut pollfd = libc::pollfd {
                fd: self.listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            match unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int) } {
                -1 => {
                    if retries >= 3 {
                        return Err(Error::Transport("poll error while accepting".to_string()));
                    }
                    retries += 1;
                    tracing::warn!("retrying to accept the worker connection");
                }
                0 => return Err(Error::Transport("worker did not connect".to_string())),
                _ => {
                    let (stream, _) = self.listener.accept()?;
                    return Ok(SocketChannel::from_stream(stream));
                }
            }
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One endpoint's transport: either a FIFO per direction or a single
/// full-duplex socket.
pub enum Transport {
    Fifo { input: ShmFifo, output: ShmFifo },
    Socket(SocketChannel),
}

impl Transport {
    pub fn is_invalid(&self) -> bool {
        match self {
            Transport::Fifo { input, output } => input.is_invalid() || output.is_invalid(),
            Transport::Socket(chan) => chan.is_invalid(),
        }
    }

    pub fn invalidate(&self) {
        match self {
            Transport::Fifo { input, output } => {
                input.invalidate();
                output.invalidate();
            }
            Transport::Socket(chan) => chan.invalidate(),
        }
    }

    pub fn messages_left(&self) -> bool {
        match self {
            Transport::Fifo { input, .. } => input.messages_left(),
            Transport::Socket(chan) => chan.messages_left(),
        }
    }

    /// Enqueue one message; returns the number of bytes written. A
    /// message too large for the FIFO is dropped whole (never a partial
    /// frame) and reported as zero bytes.
    pub fn send(&self, msg: &Message) -> usize {
        match self {
            Transport::Fifo { output, .. } => {
                if msg.encoded_len() > FIFO_CAPACITY {
                    tracing::warn!(
                        id = msg.id,
                        len = msg.encoded_len(),
                        "dropping message larger than the FIFO"
                    );
                    return 0;
                }
                output.lock();
                output.write_i32(msg.id);
                output.write_i32(msg.arg_count() as i32);
                for arg in msg.args() {
                    output.write_bytes_prefixed(arg);
                }
                output.unlock();
                output.message_sent();
                msg.encoded_len()
            }
            Transport::Socket(chan) => {
                let _guard = chan.send_lock.lock();
                chan.write_i32(msg.id);
                chan.write_i32(msg.arg_count() as i32);
                for arg in msg.args() {
                    chan.write_i32(arg.len() as i32);
                    chan.write_all(arg);
                }
                if chan.is_invalid() {
                    0
                } else {
                    msg.encoded_len()
                }
            }
        }
    }

    /// Block until one complete message is available. A dead transport
    /// yields the `Undefined` sentinel.
    pub fn receive(&self) -> Message {
        match self {
            Transport::Fifo { input, .. } => {
                input.wait_for_message();
                if input.is_invalid() {
                    return Message::undefined();
                }
                input.lock();
                let mut msg = Message::from_raw_id(input.read_i32());
                let argc = input.read_i32().clamp(0, MAX_MESSAGE_ARGS);
                for _ in 0..argc {
                    msg.push_arg(input.read_bytes_prefixed());
                }
                input.unlock();
                msg
            }
            Transport::Socket(chan) => {
                let _guard = chan.recv_lock.lock();
                let mut msg = Message::from_raw_id(chan.read_i32());
                let argc = chan.read_i32();
                if !(0..=MAX_MESSAGE_ARGS).contains(&argc) {
                    chan.invalidate();
                    return Message::undefined();
                }
                for _ in 0..argc {
                    let len = chan.read_i32();
                    if !(0..=MAX_SOCKET_ARG).contains(&len) {
                        chan.invalidate();
                        return Message::undefined();
                    }
                    let mut arg = vec![0u8; len as usize];
                    chan.read_exact(&mut arg);
                    msg.push_arg(arg);
                }
                if chan.is_invalid() {
                    return Message::undefined();
                }
                msg
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use crate::shm::KeyAllocator;

    fn socket_pair() -> (Transport, Transport) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Transport::Socket(SocketChannel::from_stream(a)),
            Transport::Socket(SocketChannel::from_stream(b)),
        )
    }

    fn fifo_pair() -> (Transport, Transport) {
        let keys = KeyAllocator::new();
        let host_in = ShmFifo::create(&keys).unwrap();
        let host_out = ShmFifo::create(&keys).unwrap();
        let worker_in = ShmFifo::attach(host_out.shm_key()).unwrap();
        let worker_out = ShmFifo::attach(host_in.shm_key()).unwrap();
        (
            Transport::Fifo {
                input: host_in,
                output: host_out,
            },
            Transport::Fifo {
                input: worker_in,
                output: worker_out,
            },
        )
    }

    fn message_roundtrip(sender: &Transport, receiver: &Transport) {
        let msg = Message::new(MessageId::MidiEvent)
            .with_int(0x90)
            .with_int(0)
            .with_int(60)
            .with_int(100)
            .with_int(0);
        let written = sender.send(&msg);
        assert_eq!(written, msg.encoded_len());

        let echoed = receiver.receive();
        assert_eq!(echoed, msg);
    }

    #[test]
    fn test_socket_message_roundtrip() {
        let (host, worker) = socket_pair();
        message_roundtrip(&host, &worker);
        message_roundtrip(&worker, &host);
    }

    #[test]
    fn test_fifo_message_roundtrip() {
        let (host, worker) = fifo_pair();
        message_roundtrip(&host, &worker);
        message_roundtrip(&worker, &host);
    }

    #[test]
    fn test_messages_left_tracks_buffered_frames() {
        let (host, worker) = socket_pair();
        assert!(!worker.messages_left());

        host.send(&Message::new(MessageId::StartProcessing));
        // Give the loopback a moment to become readable.
        std::thread::sleep(Duration::from_millis(10));
        assert!(worker.messages_left());

        worker.receive();
        assert!(!worker.messages_left());
    }

    #[test]
    fn test_fifo_messages_left() {
        let (host, worker) = fifo_pair();
        assert!(!worker.messages_left());
        host.send(&Message::new(MessageId::InitDone));
        assert!(worker.messages_left());
        worker.receive();
        assert!(!worker.messages_left());
    }

    #[test]
    fn test_peer_drop_invalidates_socket() {
        let (host, worker) = socket_pair();
        drop(host);

        let msg = worker.receive();
        assert!(msg.is(MessageId::Undefined));
        assert!(worker.is_invalid());

        // Subsequent receives keep yielding the sentinel without
        // blocking.
        assert!(worker.receive().is(MessageId::Undefined));
    }

    #[test]
    fn test_oversized_fifo_message_dropped_whole() {
        let (host, worker) = fifo_pair();

        let big = Message::new(MessageId::DebugMessage)
            .with_str(&"x".repeat(700 * 1024));
        assert_eq!(host.send(&big), 0);
        assert!(!worker.messages_left());
        assert!(!host.is_invalid());

        // A normal message still round-trips: no partial frame was
        // written.
        message_roundtrip(&host, &worker);
    }

    #[test]
    fn test_invalidate_yields_undefined() {
        let (host, worker) = fifo_pair();
        host.send(&Message::new(MessageId::InitDone));
        worker.invalidate();
        assert!(worker.receive().is(MessageId::Undefined));
    }

    #[test]
    fn test_listener_accept_and_connect() {
        let listener = SocketListener::bind_unique().unwrap();
        let path = listener.path().to_path_buf();

        let dialer = std::thread::spawn(move || SocketChannel::connect(&path).unwrap());
        let accepted = listener.accept(Duration::from_secs(5)).unwrap();
        let dialed = dialer.join().unwrap();

        let host = Transport::Socket(accepted);
        let worker = Transport::Socket(dialed);
        message_roundtrip(&host, &worker);
    }

    #[test]
    fn test_listener_removes_socket_path() {
        let path = {
            let listener = SocketListener::bind_unique().unwrap();
            listener.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
