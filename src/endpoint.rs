//! The symmetric RPC endpoint shared by host and worker.
//!
//! An endpoint wraps one [`Transport`] and layers the dispatch
//! machinery on top: handlers are composed in rather than inherited
//! from, so a plugin wrapper owns an endpoint plus a [`MessageHandler`]
//! implementation instead of subclassing anything.

use crate::channel::Transport;
use crate::message::{Message, MessageId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Whether the dispatch loop should keep servicing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Reaction to incoming messages.
pub trait MessageHandler {
    fn handle(&mut self, msg: &Message) -> Flow;

    /// Cooperatively service foreground work (a UI event pump) for one
    /// short slice during a busy wait. Return `false` if no pump is
    /// available — the wait then falls back to blocking.
    fn pump_foreground(&mut self, _budget: Duration) -> bool {
        false
    }
}

/// Process-wide count of active busy waits. Collaborators consult this
/// to defer foreground work that must not reenter the bridge.
static WAIT_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// True while any thread of this process is inside a busy wait.
pub fn is_foreground_waiting() -> bool {
    WAIT_DEPTH.load(Ordering::Acquire) > 0
}

struct WaitDepthGuard {
    active: bool,
}

impl WaitDepthGuard {
    fn new(active: bool) -> Self {
        if active {
            WAIT_DEPTH.fetch_add(1, Ordering::AcqRel);
        }
        Self { active }
    }
}

impl Drop for WaitDepthGuard {
    fn drop(&mut self) {
        if self.active {
            WAIT_DEPTH.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Slice handed to the foreground pump between polls of a busy wait.
const PUMP_BUDGET: Duration = Duration::from_millis(50);

pub struct Endpoint {
    transport: Transport,
}

impl Endpoint {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Enqueue one message. Returns the number of bytes written (zero
    /// when the message was dropped or the endpoint is dead).
    pub fn send(&self, msg: &Message) -> usize {
        self.transport.send(msg)
    }

    /// Block until one message arrives. Yields the `Undefined` sentinel
    /// once the endpoint has been invalidated.
    pub fn receive(&self) -> Message {
        self.transport.receive()
    }

    pub fn messages_left(&self) -> bool {
        self.transport.messages_left()
    }

    pub fn is_invalid(&self) -> bool {
        self.transport.is_invalid()
    }

    /// Flip the invalid flag on both directions and post a wake-up for
    /// any blocked consumer.
    pub fn invalidate(&self) {
        tracing::debug!("invalidating RPC endpoint");
        self.transport.invalidate();
    }

    /// Receive one message and hand it to the handler.
    pub fn dispatch_one<H: MessageHandler + ?Sized>(&self, handler: &mut H) -> (Message, Flow) {
        let msg = self.receive();
        let flow = handler.handle(&msg);
        (msg, flow)
    }

    /// Service everything currently buffered without blocking for more.
    pub fn drain<H: MessageHandler + ?Sized>(&self, handler: &mut H) {
        while self.messages_left() {
            self.dispatch_one(handler);
        }
    }

    /// Loop `receive` + `handle` until a message with the expected id
    /// (or the `Undefined` sentinel of a dead endpoint) arrives; every
    /// message seen on the way is dispatched, so out-of-order replies
    /// are never dropped.
    ///
    /// With `busy` set, the handler's foreground pump is serviced
    /// between polls instead of blocking outright, and the process-wide
    /// wait depth is raised for the duration so collaborators can defer
    /// reentrant work.
    pub fn wait_for<H: MessageHandler + ?Sized>(
        &self,
        handler: &mut H,
        expected: MessageId,
        busy: bool,
    ) -> Message {
        let mut busy = busy;
        let _depth = WaitDepthGuard::new(busy);
        while !self.is_invalid() {
            if busy && !self.messages_left() {
                if handler.pump_foreground(PUMP_BUDGET) {
                    continue;
                }
                // No pump available on this thread; block from here on.
                busy = false;
            }
            let msg = self.receive();
            handler.handle(&msg);
            if msg.is(expected) || msg.is(MessageId::Undefined) {
                return msg;
            }
        }
        Message::undefined()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SocketChannel;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    fn endpoint_pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Arc::new(Endpoint::new(Transport::Socket(SocketChannel::from_stream(a)))),
            Arc::new(Endpoint::new(Transport::Socket(SocketChannel::from_stream(b)))),
        )
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<i32>,
    }

    impl MessageHandler for Recorder {
        fn handle(&mut self, msg: &Message) -> Flow {
            self.seen.push(msg.id);
            if msg.is(MessageId::Quit) {
                Flow::Stop
            } else {
                Flow::Continue
            }
        }
    }

    #[test]
    fn test_send_receive() {
        let (host, worker) = endpoint_pair();
        let msg = Message::new(MessageId::SampleRateInformation).with_int(48000);
        assert!(host.send(&msg) > 0);
        let got = worker.receive();
        assert_eq!(got, msg);
        assert_eq!(got.int_arg(0), 48000);
    }

    #[test]
    fn test_dispatch_one_reports_flow() {
        let (host, worker) = endpoint_pair();
        let mut rec = Recorder::default();

        host.send(&Message::new(MessageId::InitDone));
        host.send(&Message::new(MessageId::Quit));

        let (msg, flow) = worker.dispatch_one(&mut rec);
        assert!(msg.is(MessageId::InitDone));
        assert_eq!(flow, Flow::Continue);

        let (msg, flow) = worker.dispatch_one(&mut rec);
        assert!(msg.is(MessageId::Quit));
        assert_eq!(flow, Flow::Stop);

        assert_eq!(rec.seen, vec![2, 3]);
    }

    #[test]
    fn test_wait_for_dispatches_interleaved_messages() {
        let (host, worker) = endpoint_pair();
        let mut rec = Recorder::default();

        host.send(&Message::new(MessageId::DebugMessage).with_str("one"));
        host.send(&Message::new(MessageId::InformationUpdated));

        let got = worker.wait_for(&mut rec, MessageId::InformationUpdated, false);
        assert!(got.is(MessageId::InformationUpdated));
        // The non-matching message went through the handler first.
        assert_eq!(
            rec.seen,
            vec![
                MessageId::DebugMessage.raw(),
                MessageId::InformationUpdated.raw()
            ]
        );
    }

    #[test]
    fn test_wait_for_returns_undefined_after_invalidate() {
        let (host, worker) = endpoint_pair();
        let mut rec = Recorder::default();

        let waiter = {
            let worker = Arc::clone(&worker);
            std::thread::spawn(move || {
                let mut rec = Recorder::default();
                worker.wait_for(&mut rec, MessageId::ProcessingDone, false)
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        host.invalidate();
        drop(host);
        let got = waiter.join().unwrap();
        assert!(got.is(MessageId::Undefined));

        // An already-dead endpoint short-circuits.
        worker.invalidate();
        let got = worker.wait_for(&mut rec, MessageId::ProcessingDone, false);
        assert!(got.is(MessageId::Undefined));
    }

    #[test]
    fn test_drain_consumes_buffered_only() {
        let (host, worker) = endpoint_pair();
        let mut rec = Recorder::default();

        host.send(&Message::new(MessageId::ShowUi));
        host.send(&Message::new(MessageId::HideUi));
        std::thread::sleep(Duration::from_millis(10));

        worker.drain(&mut rec);
        assert_eq!(
            rec.seen,
            vec![MessageId::ShowUi.raw(), MessageId::HideUi.raw()]
        );
        // Nothing left: drain returns without blocking.
        worker.drain(&mut rec);
        assert_eq!(rec.seen.len(), 2);
    }

    #[test]
    fn test_busy_wait_raises_wait_depth() {
        struct Pumping {
            depth_seen: bool,
            sender: Arc<Endpoint>,
        }

        impl MessageHandler for Pumping {
            fn handle(&mut self, _msg: &Message) -> Flow {
                Flow::Continue
            }

            fn pump_foreground(&mut self, _budget: Duration) -> bool {
                self.depth_seen |= is_foreground_waiting();
                // Produce the awaited reply from "the UI thread".
                self.sender.send(&Message::new(MessageId::InitDone));
                true
            }
        }

        let (host, worker) = endpoint_pair();
        assert!(!is_foreground_waiting());

        let mut handler = Pumping {
            depth_seen: false,
            sender: Arc::clone(&host),
        };
        let got = worker.wait_for(&mut handler, MessageId::InitDone, true);
        assert!(got.is(MessageId::InitDone));
        assert!(handler.depth_seen);
        assert!(!is_foreground_waiting());
    }

    #[test]
    fn test_busy_wait_without_pump_falls_back_to_blocking() {
        let (host, worker) = endpoint_pair();
        let mut rec = Recorder::default();

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            host.send(&Message::new(MessageId::ProcessingDone));
        });

        let got = worker.wait_for(&mut rec, MessageId::ProcessingDone, true);
        assert!(got.is(MessageId::ProcessingDone));
        sender.join().unwrap();
    }
}
