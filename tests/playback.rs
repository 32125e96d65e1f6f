use daw_engine::audio::pool::AudioClip;
use daw_engine::audio::region::BUILTIN_FADE_FRAMES;
use daw_engine::io::audio_file::BitDepth;
use daw_engine::{AudioEngine, Command, EngineConfig, TrackKind};

const BLOCK: u32 = 256;

fn new_engine(dir: &tempfile::TempDir) -> AudioEngine {
    let (engine, _handle) = AudioEngine::new(EngineConfig::default(), dir.path());
    engine
}

/// Interleaved ramp so every frame is identifiable
fn ramp_clip(frames: usize) -> AudioClip {
    let mut data = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        let v = i as f32 / frames as f32;
        data.push(v);
        data.push(v);
    }
    AudioClip::from_float_array("ramp", data, 2, 44100, 120.0, BitDepth::B32)
}

fn const_clip(frames: usize, value: f32) -> AudioClip {
    AudioClip::from_float_array(
        "const",
        vec![value; frames * 2],
        2,
        44100,
        120.0,
        BitDepth::B32,
    )
}

/// Roll the engine, collecting the monitor output (left channel, one value
/// per frame)
fn collect_output(engine: &mut AudioEngine, cycles: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(cycles * BLOCK as usize);
    let mut scratch = vec![0.0f32; BLOCK as usize * 2];
    for _ in 0..cycles {
        engine.process_cycle(BLOCK);
        engine.fill_output(&mut scratch, 2);
        for frame in 0..BLOCK as usize {
            out.push(scratch[frame * 2]);
        }
    }
    out
}

#[test]
fn region_playback_reaches_monitor_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let track = engine.add_track(TrackKind::Audio, "Audio 1");

    let clip_id = engine.import_clip(const_clip(44100, 0.5));
    engine.add_audio_region(track, 0, clip_id, 0).unwrap();

    engine.transport.request_roll();
    let out = collect_output(&mut engine, 4);

    // Past the built-in edge fade the signal arrives at unity through
    // processor, pre-fader, fader, master and monitor
    let sample = out[BLOCK as usize];
    assert!((sample - 0.5).abs() < 1e-4, "got {}", sample);
    // The very first frames carry the built-in fade-in
    assert!(out[0].abs() < 1e-4);
    assert!(out[(BUILTIN_FADE_FRAMES / 2) as usize] < 0.5);
}

#[test]
fn loop_playback_is_bit_identical_across_passes() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let track = engine.add_track(TrackKind::Audio, "Audio 1");

    let clip_id = engine.import_clip(ramp_clip(8192));
    engine.add_audio_region(track, 0, clip_id, 0).unwrap();

    engine.transport.loop_enabled = true;
    engine.transport.loop_start = engine.position_at_frame(1024);
    engine.transport.loop_end = engine.position_at_frame(5120);
    engine.transport.request_roll();

    // 0..5120 is the first pass; afterwards every pass is 4096 frames
    let out = collect_output(&mut engine, 52);

    // Second and third passes start at output frames 5120 and 9216
    for k in 0..4096usize {
        assert_eq!(
            out[5120 + k],
            out[1024 + k],
            "pass 2 diverges at frame {}",
            k
        );
        assert_eq!(
            out[9216 + k],
            out[5120 + k],
            "pass 3 diverges at frame {}",
            k
        );
    }

    // Loop preserved the playhead window
    assert!(engine.transport.playhead.frames < 5120);
    assert!(engine.transport.playhead.frames >= 1024);
}

#[test]
fn mute_and_solo_gate_at_the_fader() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, mut handle) = AudioEngine::new(EngineConfig::default(), dir.path());
    let a = engine.add_track(TrackKind::Audio, "A");
    let b = engine.add_track(TrackKind::Audio, "B");

    let clip_a = engine.import_clip(const_clip(44100, 0.25));
    let clip_b = engine.import_clip(const_clip(44100, 0.5));
    engine.add_audio_region(a, 0, clip_a, 0).unwrap();
    engine.add_audio_region(b, 0, clip_b, 0).unwrap();
    engine.transport.request_roll();

    // Both audible: 0.75 on the master
    let out = collect_output(&mut engine, 2);
    assert!((out[BLOCK as usize + 64] - 0.75).abs() < 1e-3);

    // Solo A silences B
    handle.send(Command::SetTrackSolo(a, true));
    let out = collect_output(&mut engine, 2);
    assert!((out[BLOCK as usize + 64] - 0.25).abs() < 1e-3);

    // Unsolo, mute A: only B remains
    handle.send(Command::SetTrackSolo(a, false));
    handle.send(Command::SetTrackMute(a, true));
    let out = collect_output(&mut engine, 2);
    assert!((out[BLOCK as usize + 64] - 0.5).abs() < 1e-3);

    // Mute both: silence
    handle.send(Command::SetTrackMute(b, true));
    let out = collect_output(&mut engine, 2);
    assert!(out[BLOCK as usize + 64].abs() < 1e-3);
}

#[test]
fn prefader_send_doubles_signal_at_master() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let a = engine.add_track(TrackKind::Audio, "A");
    let bus = engine.add_track(TrackKind::AudioBus, "FX Bus");

    let clip = engine.import_clip(const_clip(44100, 0.25));
    engine.add_audio_region(a, 0, clip, 0).unwrap();

    // Pre-fader send 0 from A into the bus; both A and the bus hit master
    engine.set_send_dest(a, 0, Some(bus)).unwrap();

    engine.transport.request_roll();
    let out = collect_output(&mut engine, 3);
    let sample = out[BLOCK as usize * 2 + 16];
    assert!((sample - 0.5).abs() < 1e-3, "got {}", sample);
}

#[test]
fn track_volume_scales_output() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, mut handle) = AudioEngine::new(EngineConfig::default(), dir.path());
    let a = engine.add_track(TrackKind::Audio, "A");
    let clip = engine.import_clip(const_clip(44100, 0.5));
    engine.add_audio_region(a, 0, clip, 0).unwrap();

    handle.send(Command::SetTrackVolume(a, 0.5));
    engine.transport.request_roll();
    let out = collect_output(&mut engine, 2);
    assert!((out[BLOCK as usize + 32] - 0.25).abs() < 1e-3);
}
