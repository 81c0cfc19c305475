//! End-to-end scenarios: a real `PluginHost` spawning the
//! `outboard-worker` binary over both transport flavors.

use outboard::{EngineConfig, Frame, MidiEvent, PluginHost, TransportFlavor};
use std::time::{Duration, Instant};

const FRAMES: usize = 64;

fn engine() -> EngineConfig {
    EngineConfig {
        sample_rate: 48000,
        frames_per_period: FRAMES as u32,
        plugin_dirs: Vec::new(),
    }
}

fn worker_exe() -> &'static str {
    env!("CARGO_BIN_EXE_outboard-worker")
}

fn start(flavor: TransportFlavor, mode: &str) -> PluginHost {
    let mut host = PluginHost::new(flavor, engine()).unwrap();
    host.init(worker_exe(), true, &[mode.to_string()]).unwrap();
    assert!(!host.failed());
    host
}

fn sine_input() -> Vec<Frame> {
    (0..FRAMES)
        .map(|i| {
            let phase = i as f32 * std::f32::consts::TAU / FRAMES as f32;
            [phase.sin(), (phase * 2.0).sin()]
        })
        .collect()
}

fn assert_frames_eq(actual: &[Frame], expected: &[Frame]) {
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a[0] - e[0]).abs() < 1e-6 && (a[1] - e[1]).abs() < 1e-6,
            "frame {} differs: {:?} vs {:?}",
            i,
            a,
            e
        );
    }
}

#[test]
fn test_boot_handshake_and_clean_shutdown_fifo() {
    let host = start(TransportFlavor::ShmFifo, "passthrough");
    assert!(host.is_running());
    // Dropping sends Quit and must come back without a deadlock.
    drop(host);
}

#[test]
fn test_boot_handshake_socket() {
    let host = start(TransportFlavor::LocalSocket, "passthrough");
    assert!(host.is_running());
}

#[test]
fn test_audio_roundtrip_fifo() {
    let mut host = start(TransportFlavor::ShmFifo, "passthrough");
    let input = sine_input();
    let mut output = vec![[0.0f32; 2]; FRAMES];

    for _ in 0..4 {
        assert!(host.process(Some(&input), Some(&mut output)));
    }
    assert_frames_eq(&output, &input);
}

#[test]
fn test_audio_roundtrip_socket() {
    let mut host = start(TransportFlavor::LocalSocket, "passthrough");
    let input = sine_input();
    let mut output = vec![[0.0f32; 2]; FRAMES];

    for _ in 0..4 {
        assert!(host.process(Some(&input), Some(&mut output)));
    }
    assert_frames_eq(&output, &input);
}

#[test]
fn test_gain_worker_scales_samples() {
    let mut host = start(TransportFlavor::ShmFifo, "gain:0.5");
    let input = sine_input();
    let expected: Vec<Frame> = input.iter().map(|f| [f[0] * 0.5, f[1] * 0.5]).collect();
    let mut output = vec![[0.0f32; 2]; FRAMES];

    for _ in 0..2 {
        assert!(host.process(Some(&input), Some(&mut output)));
    }
    assert_frames_eq(&output, &expected);
}

#[test]
fn test_rekey_to_mono_quad_layout() {
    // The worker announces 1 input / 4 outputs during init, so the host
    // reallocates the segment and both sides agree on the planar
    // layout before the first period.
    let mut host = start(TransportFlavor::ShmFifo, "mono-quad");
    assert_eq!(host.input_count(), 1);
    assert_eq!(host.output_count(), 4);

    let input = sine_input();
    let mut output = vec![[9.0f32; 2]; FRAMES];
    for _ in 0..2 {
        assert!(host.process(Some(&input), Some(&mut output)));
    }
    // Channel 0 passed through; the worker left the remaining output
    // planes silent.
    for (i, frame) in output.iter().enumerate() {
        assert!(
            (frame[0] - input[i][0]).abs() < 1e-6,
            "frame {} channel 0 differs",
            i
        );
        assert_eq!(frame[1], 0.0, "frame {} channel 1 should be silent", i);
    }
}

#[test]
fn test_midi_and_sample_rate_updates_keep_processing() {
    let mut host = start(TransportFlavor::ShmFifo, "passthrough");

    host.send_midi_event(MidiEvent::note_on(0, 60, 100), 0);
    host.update_sample_rate(96000);
    assert_eq!(host.sample_rate(), 96000);

    let input = sine_input();
    let mut output = vec![[0.0f32; 2]; FRAMES];
    for _ in 0..2 {
        assert!(host.process(Some(&input), Some(&mut output)));
    }
    assert_frames_eq(&output, &input);
}

#[test]
fn test_peer_crash_silences_output() {
    let mut host = start(TransportFlavor::ShmFifo, "die-early");

    // The worker exits right after the handshake; wait for the watcher
    // to notice.
    let deadline = Instant::now() + Duration::from_secs(5);
    while host.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!host.is_running());

    let input = sine_input();
    let mut output = vec![[9.0f32; 2]; FRAMES];
    assert!(!host.process(Some(&input), Some(&mut output)));
    assert!(output.iter().all(|f| *f == [0.0, 0.0]));

    // Repeated calls fail fast rather than blocking.
    assert!(!host.process(Some(&input), Some(&mut output)));
    assert_eq!(host.is_ui_visible(), -1);

    // The destructor must not deadlock on the dead worker.
    drop(host);
}

#[test]
fn test_process_without_output_buffer_returns_false() {
    let mut host = start(TransportFlavor::ShmFifo, "passthrough");
    let input = sine_input();
    assert!(!host.process(Some(&input), None));

    // The skipped period leaves the link healthy.
    let mut output = vec![[0.0f32; 2]; FRAMES];
    assert!(host.process(Some(&input), Some(&mut output)));
}
