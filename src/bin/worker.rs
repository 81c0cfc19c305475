//! Minimal remote worker. Spawned by the host with the control-channel
//! identifiers on the command line; the mode argument after them picks
//! the behavior. `passthrough` and `gain:<factor>` are usable as-is for
//! wiring checks; the remaining modes misbehave on purpose so the
//! integration tests can exercise the failure paths.

use outboard::client::{ClientSession, Processor};
use outboard::engine::MidiEvent;
use std::process::ExitCode;

/// Copies the input region onto the output region, optionally scaled.
/// With no inputs it writes silence.
struct Passthrough {
    gain: f32,
    notes_seen: u32,
}

impl Processor for Passthrough {
    fn process(&mut self, inputs: Option<&[f32]>, outputs: &mut [f32]) {
        match inputs {
            Some(inputs) => {
                let n = inputs.len().min(outputs.len());
                for (out, sample) in outputs[..n].iter_mut().zip(inputs) {
                    *out = sample * self.gain;
                }
                outputs[n..].fill(0.0);
            }
            None => outputs.fill(0.0),
        }
    }

    fn process_midi_event(&mut self, event: MidiEvent, offset: i32) {
        if event.kind == 0x90 {
            self.notes_seen += 1;
        }
        tracing::debug!(?event, offset, notes = self.notes_seen, "midi event");
    }

    fn update_sample_rate(&mut self, sample_rate: u32) {
        tracing::debug!(sample_rate, "sample rate changed");
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mut session, extra) = match ClientSession::from_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("outboard-worker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mode = extra.first().map(String::as_str).unwrap_or("passthrough");

    let mut processor = Passthrough {
        gain: 1.0,
        notes_seen: 0,
    };
    match mode {
        "passthrough" => {
            session.set_input_output_count(2, 2);
        }
        gain if gain.starts_with("gain:") => {
            processor.gain = gain["gain:".len()..].parse().unwrap_or(1.0);
            session.set_input_output_count(2, 2);
        }
        "mono-quad" => {
            // One input channel fanned out over four outputs; the host
            // folds the first two back into its stereo frame.
            session.set_input_output_count(1, 4);
        }
        "die-early" => {
            // Complete the handshake, then drop dead while idle.
            session.set_input_output_count(2, 2);
            session.init_done();
            session.debug_message("dying early as requested");
            return ExitCode::SUCCESS;
        }
        other => {
            eprintln!("outboard-worker: unknown mode '{}'", other);
            return ExitCode::FAILURE;
        }
    }
    session.init_done();

    session.run(&mut processor);
    ExitCode::SUCCESS
}
