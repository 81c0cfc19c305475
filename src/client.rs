//! The worker side: attaches to the host's channels and services its
//! requests, handing each audio period to a [`Processor`].

use crate::channel::{SocketChannel, Transport};
use crate::endpoint::{Endpoint, Flow};
use crate::engine::{EngineSyncData, MidiEvent, SYNC_DATA_SIZE};
use crate::error::{Error, Result};
use crate::fifo::ShmFifo;
use crate::message::{Message, MessageId};
use crate::shm::SharedMemory;
use std::path::Path;

/// The hooks a remote plugin implements. Audio regions are planar or
/// interleaved float32 exactly as the host laid them out; `inputs` is
/// `None` for generators (no input channels).
pub trait Processor {
    fn process(&mut self, inputs: Option<&[f32]>, outputs: &mut [f32]);

    fn process_midi_event(&mut self, _event: MidiEvent, _offset: i32) {}

    fn update_sample_rate(&mut self, _sample_rate: u32) {}

    fn update_buffer_size(&mut self, _frames: u32) {}

    /// Hook for format-specific extension messages (`UserBase` ids and
    /// anything the base session does not consume). Return `true` when
    /// the message was handled.
    fn handle_message(&mut self, _msg: &Message) -> bool {
        false
    }
}

/// Worker-side RPC session. Built from the argv the host passed to the
/// worker process, then driven by [`run`](Self::run).
pub struct ClientSession {
    endpoint: Endpoint,
    audio_shm: Option<SharedMemory>,
    sync_shm: Option<SharedMemory>,
    input_count: usize,
    output_count: usize,
    sample_rate: u32,
    frames_per_period: u32,
    info_query_pending: bool,
    host_info_sent: bool,
}

impl ClientSession {
    /// Parse the host-supplied argv tail:
    /// `<in-fifo-key> <out-fifo-key> <sync-key> [extra...]` for the
    /// FIFO flavor, `<socket-path> <sync-key> [extra...]` for the
    /// socket flavor. Returns the session plus the leftover arguments.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        if args.len() >= 3 {
            if let (Ok(in_key), Ok(out_key), Ok(sync_key)) = (
                args[0].parse::<i32>(),
                args[1].parse::<i32>(),
                args[2].parse::<i32>(),
            ) {
                let input = ShmFifo::attach(in_key)?;
                let output = ShmFifo::attach(out_key)?;
                let session =
                    Self::with_transport(Transport::Fifo { input, output }, Some(sync_key));
                return Ok((session, args[3..].to_vec()));
            }
        }
        if args.len() >= 2 {
            if let Ok(sync_key) = args[1].parse::<i32>() {
                let chan = SocketChannel::connect(Path::new(&args[0]))?;
                let session = Self::with_transport(Transport::Socket(chan), Some(sync_key));
                return Ok((session, args[2..].to_vec()));
            }
        }
        Err(Error::BadInvocation(
            "expected '<in-key> <out-key> <sync-key>' or '<socket-path> <sync-key>'".to_string(),
        ))
    }

    /// Wrap an already-connected control socket (embedding and tests).
    pub fn from_socket(channel: SocketChannel) -> Self {
        Self::with_transport(Transport::Socket(channel), None)
    }

    fn with_transport(transport: Transport, sync_key: Option<i32>) -> Self {
        let mut session = Self {
            endpoint: Endpoint::new(transport),
            audio_shm: None,
            sync_shm: None,
            input_count: 0,
            output_count: 0,
            sample_rate: 44100,
            frames_per_period: 0,
            info_query_pending: false,
            host_info_sent: false,
        };

        if let Some(key) = sync_key {
            if let Ok(shm) = SharedMemory::attach(key, true) {
                if shm.len() >= SYNC_DATA_SIZE {
                    let data = session_sync_read(&shm);
                    session.sample_rate = data.sample_rate;
                    session.frames_per_period = data.frames_per_period;
                    session.sync_shm = Some(shm);
                    session.endpoint.send(&Message::new(MessageId::HostInfoGotten));
                    session.host_info_sent = true;
                    return session;
                }
            }
        }

        // No sync region to read: ask the host explicitly. The replies
        // are collected at the start of run().
        session
            .endpoint
            .send(&Message::new(MessageId::SampleRateInformation));
        session
            .endpoint
            .send(&Message::new(MessageId::BufferSizeInformation));
        session.info_query_pending = true;
        session
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.frames_per_period
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    /// Live view of the host's sync region, when one was attached.
    pub fn engine_sync(&self) -> Option<EngineSyncData> {
        self.sync_shm.as_ref().map(session_sync_read)
    }

    /// Announce this worker's channel counts; the host reallocates the
    /// audio buffer and replies with a fresh segment key.
    pub fn set_input_count(&mut self, count: usize) {
        self.input_count = count;
        self.endpoint
            .send(&Message::new(MessageId::ChangeInputCount).with_int(count as i32));
    }

    pub fn set_output_count(&mut self, count: usize) {
        self.output_count = count;
        self.endpoint
            .send(&Message::new(MessageId::ChangeOutputCount).with_int(count as i32));
    }

    pub fn set_input_output_count(&mut self, inputs: usize, outputs: usize) {
        self.input_count = inputs;
        self.output_count = outputs;
        self.endpoint.send(
            &Message::new(MessageId::ChangeInputOutputCount)
                .with_int(inputs as i32)
                .with_int(outputs as i32),
        );
    }

    /// Tell the host this worker is fully constructed (plugin loaded,
    /// channel counts announced). Hosts started with
    /// `wait_for_init_done` block until this arrives.
    pub fn init_done(&self) {
        self.endpoint.send(&Message::new(MessageId::InitDone));
    }

    /// Forward a diagnostic line to the host's standard error.
    pub fn debug_message(&self, text: &str) {
        self.endpoint
            .send(&Message::new(MessageId::DebugMessage).with_str(text));
    }

    /// Service the host until it says `Quit` or the link dies. Finishes
    /// the handshake first if the sync-region fast path was not
    /// available.
    pub fn run(&mut self, processor: &mut dyn Processor) {
        if self.info_query_pending {
            loop {
                let msg = self.endpoint.receive();
                let flow = self.dispatch(&msg, processor);
                if msg.is(MessageId::BufferSizeInformation) || msg.is(MessageId::Undefined) {
                    break;
                }
                if flow == Flow::Stop {
                    return;
                }
            }
            self.info_query_pending = false;
        }
        if !self.host_info_sent {
            self.endpoint.send(&Message::new(MessageId::HostInfoGotten));
            self.host_info_sent = true;
        }

        loop {
            let msg = self.endpoint.receive();
            if self.dispatch(&msg, processor) == Flow::Stop {
                return;
            }
        }
    }

    fn dispatch(&mut self, msg: &Message, processor: &mut dyn Processor) -> Flow {
        match MessageId::from_raw(msg.id) {
            Some(MessageId::Undefined) => return Flow::Stop,
            Some(MessageId::Quit) => return Flow::Stop,
            Some(MessageId::SampleRateInformation) => {
                self.sample_rate = msg.int_arg(0) as u32;
                processor.update_sample_rate(self.sample_rate);
                self.endpoint
                    .send(&Message::new(MessageId::InformationUpdated));
            }
            Some(MessageId::BufferSizeInformation) => {
                // Must finish before any further processing: hosts that
                // change the period size mid-flight rely on it.
                self.frames_per_period = msg.int_arg(0) as u32;
                processor.update_buffer_size(self.frames_per_period);
            }
            Some(MessageId::MidiEvent) => {
                let event = MidiEvent {
                    kind: msg.int_arg(0) as u8,
                    channel: msg.int_arg(1) as u8,
                    data1: msg.int_arg(2) as u8,
                    data2: msg.int_arg(3) as u8,
                };
                processor.process_midi_event(event, msg.int_arg(4));
            }
            Some(MessageId::StartProcessing) => {
                self.do_processing(processor);
                self.endpoint.send(&Message::new(MessageId::ProcessingDone));
            }
            Some(MessageId::ChangeSharedMemoryKey) => {
                self.set_audio_key(msg.int_arg(0));
            }
            Some(MessageId::InitDone) => {}
            _ => {
                if !processor.handle_message(msg) {
                    self.debug_message(&format!("undefined message: {}", msg.id));
                }
            }
        }
        Flow::Continue
    }

    fn do_processing(&mut self, processor: &mut dyn Processor) {
        let frames = self.frames_per_period as usize;
        let needed = (self.input_count + self.output_count) * frames;
        let Some(shm) = &self.audio_shm else {
            self.debug_message("processing without a shared audio buffer");
            return;
        };
        if shm.len() < needed * std::mem::size_of::<f32>() {
            self.debug_message("audio buffer is smaller than the configured channel layout");
            return;
        }
        // SAFETY: the host only touches the segment outside the
        // StartProcessing/ProcessingDone window, and the bounds were
        // checked above.
        let floats =
            unsafe { std::slice::from_raw_parts_mut(shm.ptr() as *mut f32, needed) };
        let (inputs, outputs) = floats.split_at_mut(self.input_count * frames);
        let inputs = (self.input_count > 0).then_some(&*inputs);
        processor.process(inputs, outputs);
    }

    fn set_audio_key(&mut self, key: i32) {
        // Detach the previous segment before mapping the new one.
        self.audio_shm = None;
        match SharedMemory::attach(key, false) {
            Ok(shm) => self.audio_shm = Some(shm),
            Err(e) => self.debug_message(&format!("failed to attach the audio buffer: {}", e)),
        }
    }
}

fn session_sync_read(shm: &SharedMemory) -> EngineSyncData {
    // SAFETY: attach verified the segment covers EngineSyncData.
    unsafe { (shm.ptr() as *const EngineSyncData).read_volatile() }
}
