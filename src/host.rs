//! The host side: spawns a worker, owns the audio buffer, and drives
//! the per-period processing round trip on behalf of the engine.

use crate::channel::{SocketListener, Transport};
use crate::endpoint::{Endpoint, Flow, MessageHandler};
use crate::engine::{
    EngineConfig, EngineSyncData, Frame, MidiEvent, CANONICAL_CHANNELS, SYNC_DATA_SIZE,
};
use crate::error::{Error, Result};
use crate::fifo::ShmFifo;
use crate::message::{Message, MessageId};
use crate::shm::KeyAllocator;
use crate::shm::SharedMemory;
use crate::watcher::ProcessWatcher;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Control-channel flavor, fixed per host instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFlavor {
    ShmFifo,
    LocalSocket,
}

/// How long the socket flavor waits for the freshly spawned worker to
/// dial in.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between `Quit` and forced termination at shutdown.
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Host-side handle to one out-of-process plugin worker.
///
/// The lifecycle is: [`new`](Self::new) reserves the control channel,
/// [`init`](Self::init) spawns the worker and completes the handshake,
/// [`process`](Self::process) runs once per audio period, and dropping
/// the host shuts the worker down.
pub struct PluginHost {
    engine: EngineConfig,
    keys: KeyAllocator,
    endpoint: Option<Arc<Endpoint>>,
    listener: Option<SocketListener>,
    watcher: Option<ProcessWatcher>,
    /// Channel identifiers as the worker will see them:
    /// (worker input key, worker output key).
    fifo_args: Option<(i32, i32)>,
    failed: bool,
    split_channels: bool,
    audio_shm: Option<SharedMemory>,
    input_count: usize,
    output_count: usize,
    sync_shm: SharedMemory,
    pump: Option<Box<dyn FnMut(Duration) + Send>>,
}

impl PluginHost {
    pub fn new(flavor: TransportFlavor, engine: EngineConfig) -> Result<Self> {
        let keys = KeyAllocator::new();

        let sync_shm = keys.create_with_free_key(SYNC_DATA_SIZE)?;

        let (endpoint, listener, fifo_args) = match flavor {
            TransportFlavor::ShmFifo => {
                let input = ShmFifo::create(&keys)?;
                let output = ShmFifo::create(&keys)?;
                // Swapped for the worker's view: our output is its input.
                let args = (output.shm_key(), input.shm_key());
                let endpoint = Arc::new(Endpoint::new(Transport::Fifo { input, output }));
                (Some(endpoint), None, Some(args))
            }
            TransportFlavor::LocalSocket => {
                (None, Some(SocketListener::bind_unique()?), None)
            }
        };

        let host = Self {
            engine,
            keys,
            endpoint,
            listener,
            watcher: None,
            fifo_args,
            failed: true,
            split_channels: false,
            audio_shm: None,
            input_count: CANONICAL_CHANNELS,
            output_count: CANONICAL_CHANNELS,
            sync_shm,
            pump: None,
        };
        host.write_sync_data();
        Ok(host)
    }

    /// Locate the worker, spawn it under the watcher thread and run the
    /// handshake. With `wait_for_init_done` the call also blocks (busy,
    /// so an installed foreground pump stays serviced) until the worker
    /// reports that its plugin is fully up.
    pub fn init(
        &mut self,
        executable: &str,
        wait_for_init_done: bool,
        extra_args: &[String],
    ) -> Result<()> {
        if self.watcher.is_some() {
            return Err(Error::BadInvocation("worker already started".to_string()));
        }
        self.failed = false;

        let exec = match self.locate_executable(executable) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(executable, "worker executable not found");
                self.failed = true;
                self.invalidate();
                return Err(e);
            }
        };

        let mut args: Vec<OsString> = Vec::new();
        if let Some((worker_in, worker_out)) = self.fifo_args {
            args.push(worker_in.to_string().into());
            args.push(worker_out.to_string().into());
        } else if let Some(listener) = &self.listener {
            args.push(listener.path().as_os_str().to_os_string());
        }
        args.push(self.sync_shm.key().to_string().into());
        args.extend(extra_args.iter().map(OsString::from));

        let watcher = match ProcessWatcher::spawn(exec, args) {
            Ok(watcher) => watcher,
            Err(e) => {
                self.failed = true;
                self.invalidate();
                return Err(e);
            }
        };
        if let Some(endpoint) = &self.endpoint {
            watcher.attach_endpoint(Arc::clone(endpoint));
        }
        self.watcher = Some(watcher);

        if self.endpoint.is_none() {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(ACCEPT_TIMEOUT),
                None => Err(Error::Transport("no control channel".to_string())),
            };
            match accepted {
                Ok(chan) => {
                    let endpoint = Arc::new(Endpoint::new(Transport::Socket(chan)));
                    if let Some(watcher) = &self.watcher {
                        watcher.attach_endpoint(Arc::clone(&endpoint));
                    }
                    self.endpoint = Some(endpoint);
                }
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }

        self.resize_audio_shm();
        if self.failed {
            return Err(Error::SharedMemory(
                "audio buffer allocation failed".to_string(),
            ));
        }

        if !self.wait_for(MessageId::HostInfoGotten, false).is(MessageId::HostInfoGotten) {
            self.failed = true;
            return Err(Error::Transport(
                "worker did not complete the handshake".to_string(),
            ));
        }
        if wait_for_init_done
            && !self.wait_for(MessageId::InitDone, true).is(MessageId::InitDone)
        {
            self.failed = true;
            return Err(Error::Transport(
                "worker did not finish initializing".to_string(),
            ));
        }
        Ok(())
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn is_running(&self) -> bool {
        self.watcher.as_ref().is_some_and(ProcessWatcher::is_running)
    }

    pub fn is_invalid(&self) -> bool {
        self.endpoint.as_ref().map_or(true, |e| e.is_invalid())
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.engine.sample_rate
    }

    pub fn frames_per_period(&self) -> u32 {
        self.engine.frames_per_period
    }

    /// Use one planar region per channel instead of interleaved frames
    /// for the canonical stereo case. Must match the worker's layout
    /// expectation.
    pub fn set_split_channels(&mut self, on: bool) {
        self.split_channels = on;
    }

    /// Install the foreground pump serviced during busy waits
    /// (typically the UI event loop, called with a ~50 ms budget).
    pub fn set_foreground_pump(&mut self, pump: impl FnMut(Duration) + Send + 'static) {
        self.pump = Some(Box::new(pump));
    }

    /// Run one audio period through the worker. Returns false — with
    /// the output buffer zeroed — when the link is down or the worker
    /// has not produced a period.
    pub fn process(
        &mut self,
        in_buf: Option<&[Frame]>,
        mut out_buf: Option<&mut [Frame]>,
    ) -> bool {
        let frames = self.engine.frames_per_period as usize;

        if self.failed || !self.is_running() {
            if let Some(out) = out_buf.as_deref_mut() {
                zero_frames(out);
            }
            return false;
        }

        if self.audio_shm.is_none() {
            // No buffer yet: service pending messages so a late key
            // change can land, and skip this period.
            self.drain_messages();
            if let Some(out) = out_buf.as_deref_mut() {
                zero_frames(out);
            }
            return false;
        }

        self.stage_period_inputs(in_buf, frames);

        self.send(&Message::new(MessageId::StartProcessing));

        if self.is_invalid() || self.output_count == 0 || out_buf.is_none() {
            if let Some(out) = out_buf.as_deref_mut() {
                zero_frames(out);
            }
            return false;
        }

        if !self
            .wait_for(MessageId::ProcessingDone, false)
            .is(MessageId::ProcessingDone)
        {
            if let Some(out) = out_buf.as_deref_mut() {
                zero_frames(out);
            }
            return false;
        }

        match out_buf.as_deref_mut() {
            Some(out) => self.collect_period_outputs(out, frames),
            None => return false,
        }
        true
    }

    fn stage_period_inputs(&mut self, in_buf: Option<&[Frame]>, frames: usize) {
        let Some(shm) = &self.audio_shm else { return };
        let total = (self.input_count + self.output_count) * frames;
        // SAFETY: the segment was allocated for exactly this float
        // count when the counts last changed; the worker only touches
        // it between StartProcessing and ProcessingDone.
        let floats =
            unsafe { std::slice::from_raw_parts_mut(shm.ptr() as *mut f32, total) };
        floats.fill(0.0);
        if let Some(input) = in_buf {
            stage_inputs(floats, input, self.input_count, frames, self.split_channels);
        }
    }

    fn collect_period_outputs(&mut self, out: &mut [Frame], frames: usize) {
        // Re-borrow: a count change dispatched while waiting for
        // ProcessingDone swaps the segment underneath the round trip.
        let Some(shm) = &self.audio_shm else {
            zero_frames(out);
            return;
        };
        let total = (self.input_count + self.output_count) * frames;
        // SAFETY: as in stage_period_inputs.
        let floats = unsafe { std::slice::from_raw_parts(shm.ptr() as *const f32, total) };
        collect_outputs(
            out,
            floats,
            self.input_count,
            self.output_count,
            frames,
            self.split_channels,
        );
    }

    /// Forward one MIDI event to the worker.
    pub fn send_midi_event(&self, event: MidiEvent, offset: u32) {
        self.send(
            &Message::new(MessageId::MidiEvent)
                .with_int(event.kind as i32)
                .with_int(event.channel as i32)
                .with_int(event.data1 as i32)
                .with_int(event.data2 as i32)
                .with_int(offset as i32),
        );
    }

    /// Push a new sample rate to the worker and wait (busy) until it
    /// has taken effect.
    pub fn update_sample_rate(&mut self, sample_rate: u32) {
        self.engine.sample_rate = sample_rate;
        self.write_sync_data();
        self.send(&Message::new(MessageId::SampleRateInformation).with_int(sample_rate as i32));
        self.wait_for(MessageId::InformationUpdated, true);
    }

    pub fn show_ui(&self) {
        self.send(&Message::new(MessageId::ShowUi));
    }

    pub fn hide_ui(&self) {
        self.send(&Message::new(MessageId::HideUi));
    }

    pub fn toggle_ui(&self) {
        self.send(&Message::new(MessageId::ToggleUi));
    }

    /// Ask whether the worker's editor window is open: 1 visible, 0
    /// hidden, -1 when the transport is broken.
    pub fn is_ui_visible(&mut self) -> i32 {
        self.send(&Message::new(MessageId::IsUiVisible));
        let reply = self.wait_for(MessageId::IsUiVisible, false);
        if !reply.is(MessageId::IsUiVisible) {
            -1
        } else if reply.int_arg(0) != 0 {
            1
        } else {
            0
        }
    }

    pub fn save_settings_to_file(&self, path: &Path) {
        self.send(
            &Message::new(MessageId::SaveSettingsToFile).with_str(&path.to_string_lossy()),
        );
    }

    pub fn load_settings_from_file(&self, path: &Path) {
        self.send(
            &Message::new(MessageId::LoadSettingsFromFile).with_str(&path.to_string_lossy()),
        );
    }

    pub fn save_preset_file(&self, path: &Path) {
        self.send(&Message::new(MessageId::SavePresetFile).with_str(&path.to_string_lossy()));
    }

    pub fn load_preset_file(&self, path: &Path) {
        self.send(&Message::new(MessageId::LoadPresetFile).with_str(&path.to_string_lossy()));
    }

    fn send(&self, msg: &Message) -> usize {
        self.endpoint.as_ref().map_or(0, |e| e.send(msg))
    }

    fn wait_for(&mut self, expected: MessageId, busy: bool) -> Message {
        match self.endpoint.clone() {
            Some(endpoint) => endpoint.wait_for(self, expected, busy),
            None => Message::undefined(),
        }
    }

    fn drain_messages(&mut self) {
        if let Some(endpoint) = self.endpoint.clone() {
            endpoint.drain(self);
        }
    }

    fn invalidate(&self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.invalidate();
        }
    }

    fn write_sync_data(&self) {
        let data = EngineSyncData {
            sample_rate: self.engine.sample_rate,
            frames_per_period: self.engine.frames_per_period,
        };
        // SAFETY: the sync segment is sized for EngineSyncData; workers
        // map it read-only.
        unsafe { (self.sync_shm.ptr() as *mut EngineSyncData).write_volatile(data) };
    }

    /// Reallocate the audio segment for the current channel counts and
    /// publish the fresh key to the worker.
    fn resize_audio_shm(&mut self) {
        let frames = self.engine.frames_per_period as usize;
        let bytes =
            (self.input_count + self.output_count) * frames * std::mem::size_of::<f32>();

        // Dropping the old master segment detaches it; the OS keeps it
        // alive until the worker re-attaches elsewhere.
        self.audio_shm = None;

        match self.keys.create_with_free_key(bytes) {
            Ok(shm) => {
                let key = shm.key();
                let size = shm.len() as i32;
                self.audio_shm = Some(shm);
                self.send(
                    &Message::new(MessageId::ChangeSharedMemoryKey)
                        .with_int(key)
                        .with_int(size),
                );
            }
            Err(e) => {
                tracing::error!(%e, "failed to allocate the audio buffer");
                self.failed = true;
            }
        }
    }

    fn locate_executable(&self, name: &str) -> Result<PathBuf> {
        let direct = Path::new(name);
        if direct.is_absolute() {
            if direct.exists() {
                return Ok(direct.to_path_buf());
            }
            return Err(Error::WorkerNotFound(direct.to_path_buf()));
        }

        let mut dirs: Vec<PathBuf> = self.engine.plugin_dirs.clone();
        if let Some(app_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            dirs.push(app_dir);
        }

        for dir in &dirs {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(Error::WorkerNotFound(PathBuf::from(name)))
    }

    fn shutdown(&mut self) {
        if let Some(watcher) = &self.watcher {
            watcher.request_quit();
        }
        if !self.failed && self.is_running() {
            self.send(&Message::new(MessageId::Quit));
            if let Some(watcher) = &self.watcher {
                if !watcher.wait_exit(QUIT_TIMEOUT) {
                    tracing::warn!("worker ignored Quit, terminating");
                    watcher.terminate();
                    watcher.kill();
                }
            }
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.join();
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MessageHandler for PluginHost {
    fn handle(&mut self, msg: &Message) -> Flow {
        match MessageId::from_raw(msg.id) {
            Some(MessageId::Undefined) => return Flow::Stop,
            Some(MessageId::InitDone) => {
                self.send(&Message::new(MessageId::InitDone));
            }
            Some(MessageId::SampleRateInformation) => {
                self.send(
                    &Message::new(MessageId::SampleRateInformation)
                        .with_int(self.engine.sample_rate as i32),
                );
            }
            Some(MessageId::BufferSizeInformation) => {
                self.send(
                    &Message::new(MessageId::BufferSizeInformation)
                        .with_int(self.engine.frames_per_period as i32),
                );
            }
            Some(MessageId::ChangeInputCount) => {
                self.input_count = msg.int_arg(0).max(0) as usize;
                self.resize_audio_shm();
            }
            Some(MessageId::ChangeOutputCount) => {
                self.output_count = msg.int_arg(0).max(0) as usize;
                self.resize_audio_shm();
            }
            Some(MessageId::ChangeInputOutputCount) => {
                self.input_count = msg.int_arg(0).max(0) as usize;
                self.output_count = msg.int_arg(1).max(0) as usize;
                self.resize_audio_shm();
            }
            Some(MessageId::DebugMessage) => {
                eprintln!("worker: {}", msg.str_arg(0).trim_end());
            }
            // Stray replies (ProcessingDone after an aborted period,
            // Quit echoes) are harmless.
            _ => {}
        }
        Flow::Continue
    }

    fn pump_foreground(&mut self, budget: Duration) -> bool {
        match self.pump.as_mut() {
            Some(pump) => {
                pump(budget);
                true
            }
            None => false,
        }
    }
}

fn zero_frames(buf: &mut [Frame]) {
    buf.fill([0.0; CANONICAL_CHANNELS]);
}

/// Copy engine frames into the input region of the audio segment.
fn stage_inputs(dst: &mut [f32], input: &[Frame], input_count: usize, frames: usize, split: bool) {
    let channels = input_count.min(CANONICAL_CHANNELS);
    if channels == 0 {
        return;
    }
    let frames = frames.min(input.len());
    if !split && input_count == CANONICAL_CHANNELS {
        // Interleaved fast path: the region is laid out exactly like
        // the engine's frame buffer.
        for (f, frame) in input.iter().take(frames).enumerate() {
            dst[2 * f] = frame[0];
            dst[2 * f + 1] = frame[1];
        }
    } else {
        for ch in 0..channels {
            for (f, frame) in input.iter().take(frames).enumerate() {
                dst[ch * frames + f] = frame[ch];
            }
        }
    }
}

/// Copy the output region of the audio segment back into engine frames.
fn collect_outputs(
    out: &mut [Frame],
    src: &[f32],
    input_count: usize,
    output_count: usize,
    frames: usize,
    split: bool,
) {
    let base = input_count * frames;
    let channels = output_count.min(CANONICAL_CHANNELS);
    let frames = frames.min(out.len());
    if !split && output_count == CANONICAL_CHANNELS {
        for (f, frame) in out.iter_mut().take(frames).enumerate() {
            frame[0] = src[base + 2 * f];
            frame[1] = src[base + 2 * f + 1];
        }
    } else {
        // The worker may fill fewer channels than the engine carries.
        zero_frames(out);
        for ch in 0..channels {
            for (f, frame) in out.iter_mut().take(frames).enumerate() {
                frame[ch] = src[base + ch * frames + f];
            }
        }
    }
}
