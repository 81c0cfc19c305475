//! The narrow contract with the in-process audio engine.
//!
//! The engine itself lives elsewhere; the bridge only needs its sample
//! rate, period size and plugin search path, plus a couple of plain data
//! types that cross the process boundary.

use std::path::PathBuf;

/// Channel count of the engine's canonical frame format.
pub const CANONICAL_CHANNELS: usize = 2;

/// One interleaved stereo frame as handed over by the engine.
pub type Frame = [f32; CANONICAL_CHANNELS];

/// Engine-side parameters the host needs to drive a worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub frames_per_period: u32,
    /// Directories searched for worker executables, in order. The
    /// directory of the running executable is always searched last.
    pub plugin_dirs: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            frames_per_period: 256,
            plugin_dirs: Vec::new(),
        }
    }
}

/// A raw channel-voice MIDI event.
///
/// `kind` is the status nibble including the message type (0x90 note-on,
/// 0x80 note-off, 0xB0 controller, ...); the channel rides separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub kind: u8,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
}

impl MidiEvent {
    pub fn note_on(channel: u8, key: u8, velocity: u8) -> Self {
        Self {
            kind: 0x90,
            channel,
            data1: key,
            data2: velocity,
        }
    }

    pub fn note_off(channel: u8, key: u8) -> Self {
        Self {
            kind: 0x80,
            channel,
            data1: key,
            data2: 0,
        }
    }

    pub fn controller(channel: u8, controller: u8, value: u8) -> Self {
        Self {
            kind: 0xB0,
            channel,
            data1: controller,
            data2: value,
        }
    }
}

/// Layout of the host-sync shared segment.
///
/// The host publishes this read-only region so a freshly spawned worker
/// can pick up the engine parameters without a control-channel round
/// trip. Field order is part of the cross-process contract.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EngineSyncData {
    pub sample_rate: u32,
    pub frames_per_period: u32,
}

pub const SYNC_DATA_SIZE: usize = std::mem::size_of::<EngineSyncData>();
