use daw_engine::audio::midi::MidiEvent;
use daw_engine::audio::region::RegionData;
use daw_engine::{AudioEngine, EngineConfig, RecordingMode, TrackKind};

const BLOCK: u32 = 256;
const SR: u32 = 44100;

fn new_engine(dir: &tempfile::TempDir) -> AudioEngine {
    let (engine, _handle) = AudioEngine::new(EngineConfig::default(), dir.path());
    engine
}

fn run_cycles(engine: &mut AudioEngine, cycles: usize) {
    for _ in 0..cycles {
        engine.process_cycle(BLOCK);
        engine.process_recording_events();
    }
}

fn arm(engine: &mut AudioEngine, track: daw_engine::TrackId) {
    engine
        .state()
        .tracklist
        .get_mut()
        .track_mut(track)
        .unwrap()
        .armed = true;
}

fn seconds_to_cycles(seconds: f64) -> usize {
    ((seconds * SR as f64) / BLOCK as f64).round() as usize
}

#[test]
fn audio_takes_with_pause_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let track = engine.add_track(TrackKind::Audio, "Vocals");
    arm(&mut engine, track);
    engine.transport.recording = true;
    engine.transport.recording_mode = RecordingMode::Takes;

    // Roll ~1.5 s
    let take1_cycles = seconds_to_cycles(1.5);
    engine.transport.request_roll();
    run_cycles(&mut engine, take1_cycles);
    let take1_frames = take1_cycles as i64 * BLOCK as i64;
    assert_eq!(engine.transport.playhead.frames, take1_frames);

    // Pause briefly, then resume for ~2 s
    engine.transport.request_pause();
    run_cycles(&mut engine, 1);
    engine.transport.request_roll();
    let take2_cycles = seconds_to_cycles(2.0);
    run_cycles(&mut engine, take2_cycles);
    let take2_frames = take2_cycles as i64 * BLOCK as i64;

    // Stop
    engine.transport.recording = false;
    engine.transport.request_pause();
    run_cycles(&mut engine, 2);

    let state = engine.state().clone();
    let tracklist = state.tracklist.get();
    let t = tracklist.track(track).unwrap();

    // Two takes on two successive lanes
    assert!(t.lanes.len() >= 2, "lanes: {}", t.lanes.len());
    assert_eq!(t.lanes[0].regions.len(), 1);
    assert_eq!(t.lanes[1].regions.len(), 1);
    let r1 = &t.lanes[0].regions[0];
    let r2 = &t.lanes[1].regions[0];
    assert!((r1.length_frames() - take1_frames).abs() <= 1);
    assert!((r2.length_frames() - take2_frames).abs() <= 1);
    assert_eq!(r2.start.frames, take1_frames);

    // Both backed by distinct clips whose file hashes differ
    let (p1, p2) = match (&r1.data, &r2.data) {
        (RegionData::Audio(a), RegionData::Audio(b)) => (a.pool_id, b.pool_id),
        _ => panic!("expected audio regions"),
    };
    assert_ne!(p1, p2);
    let pool = state.pool.get();
    let c1 = pool.get_clip(p1).unwrap();
    let c2 = pool.get_clip(p2).unwrap();
    assert!((c1.num_frames() as i64 - take1_frames).abs() <= 1);
    assert!((c2.num_frames() as i64 - take2_frames).abs() <= 1);
    assert!(c1.file_hash.is_some());
    assert!(c2.file_hash.is_some());
    assert_ne!(c1.file_hash, c2.file_hash);
    // The written pool files exist
    assert!(pool.clip_path(c1, false).exists());
    assert!(pool.clip_path(c2, false).exists());
}

fn inject_midi(engine: &AudioEngine, ev: MidiEvent) {
    let arena = engine.state().ports.get();
    let port = arena.get_mut(engine.midi_in).unwrap();
    port.midi_events.push(ev);
}

#[test]
fn midi_overwrite_deletes_covered_notes() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let track = engine.add_track(TrackKind::Midi, "Keys");
    let tp_midi_in = engine
        .state()
        .tracklist
        .get()
        .track(track)
        .unwrap()
        .processor
        .midi_in
        .unwrap();
    engine.connect_ports(engine.midi_in, tp_midi_in, false).unwrap();
    arm(&mut engine, track);

    // Session 1: record a C4 from 0 to ~1 s
    engine.transport.recording = true;
    engine.transport.recording_mode = RecordingMode::MergeEvents;
    engine.transport.request_roll();
    inject_midi(&engine, MidiEvent::note_on(0, 0, 60, 100));
    run_cycles(&mut engine, seconds_to_cycles(1.0));
    inject_midi(&engine, MidiEvent::note_off(0, 0, 60));
    run_cycles(&mut engine, 1);
    engine.transport.recording = false;
    engine.transport.request_pause();
    run_cycles(&mut engine, 2);

    {
        let tracklist = engine.state().tracklist.get();
        let t = tracklist.track(track).unwrap();
        let region = &t.lanes[0].regions[0];
        let notes = &region.midi().unwrap().notes;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].pitch, 60);
    }

    // Session 2: overwrite-record an E4 from 0.5 s to ~1.5 s
    engine.transport.set_playhead((SR / 2) as i64);
    engine.transport.recording = true;
    engine.transport.recording_mode = RecordingMode::OverwriteEvents;
    engine.transport.request_roll();
    inject_midi(&engine, MidiEvent::note_on(0, 0, 64, 100));
    run_cycles(&mut engine, seconds_to_cycles(1.0));
    inject_midi(&engine, MidiEvent::note_off(0, 0, 64));
    run_cycles(&mut engine, 1);
    engine.transport.recording = false;
    engine.transport.request_pause();
    run_cycles(&mut engine, 2);

    // Exactly the E4 remains; the C4 was deleted under the recorded range
    let tracklist = engine.state().tracklist.get();
    let t = tracklist.track(track).unwrap();
    let mut all_notes = Vec::new();
    for lane in &t.lanes {
        for region in &lane.regions {
            let region_start = region.start.frames;
            for note in &region.midi().unwrap().notes {
                all_notes.push((note.pitch, region_start + note.pos.frames));
            }
        }
    }
    assert_eq!(all_notes.len(), 1, "notes: {:?}", all_notes);
    assert_eq!(all_notes[0].0, 64);
    let onset = all_notes[0].1;
    assert!((onset - (SR / 2) as i64).abs() <= BLOCK as i64, "onset {}", onset);
}

#[test]
fn untouched_automation_records_no_points() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let track = engine.add_track(TrackKind::Audio, "Synth");

    // Automation lane on the track fader's volume, armed in Touch mode
    let amp_port = {
        let tracklist = engine.state().tracklist.get();
        tracklist
            .track(track)
            .unwrap()
            .channel
            .as_ref()
            .unwrap()
            .fader
            .amp_port
    };
    {
        let tracklist = engine.state().tracklist.get_mut();
        let t = tracklist.track_mut(track).unwrap();
        let idx = t.automation.add(amp_port);
        let at = t.automation.get_mut(idx).unwrap();
        at.armed = true;
    }

    engine.transport.recording = true;
    engine.transport.request_roll();
    run_cycles(&mut engine, seconds_to_cycles(4.0));
    engine.transport.recording = false;
    engine.transport.request_pause();
    run_cycles(&mut engine, 2);

    // The value never moved: no automation region, no points
    let tracklist = engine.state().tracklist.get();
    let t = tracklist.track(track).unwrap();
    let at = t.automation.get(0).unwrap();
    assert!(at.regions.is_empty());
}

#[test]
fn takes_muted_mutes_the_previous_take() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let track = engine.add_track(TrackKind::Audio, "Gtr");
    arm(&mut engine, track);
    engine.transport.recording = true;
    engine.transport.recording_mode = RecordingMode::TakesMuted;

    engine.transport.request_roll();
    run_cycles(&mut engine, 20);
    engine.transport.request_pause();
    run_cycles(&mut engine, 1);
    engine.transport.request_roll();
    run_cycles(&mut engine, 20);
    engine.transport.recording = false;
    engine.transport.request_pause();
    run_cycles(&mut engine, 2);

    let tracklist = engine.state().tracklist.get();
    let t = tracklist.track(track).unwrap();
    assert!(t.lanes[0].regions[0].muted);
    assert!(!t.lanes[1].regions[0].muted);
}

#[test]
fn recording_finished_event_carries_the_action() {
    use daw_engine::AudioEvent;

    let dir = tempfile::tempdir().unwrap();
    let (mut engine, handle) = AudioEngine::new(EngineConfig::default(), dir.path());
    let track = engine.add_track(TrackKind::Midi, "Keys");
    arm(&mut engine, track);
    engine.transport.recording = true;
    engine.transport.request_roll();
    run_cycles(&mut engine, 10);
    engine.transport.recording = false;
    engine.transport.request_pause();
    run_cycles(&mut engine, 2);

    // Recording stop disarms the transport record button
    assert!(!engine.transport.recording);

    let mut finished = None;
    while let Ok(ev) = handle.event_rx.try_recv() {
        if let AudioEvent::RecordingFinished(action) = ev {
            finished = Some(action);
        }
    }
    let action = finished.expect("RecordingFinished event");
    assert_eq!(action.new_regions.len(), 1);
    assert_eq!(action.new_regions[0].0, track);
    // The pre-recording snapshot is empty for a fresh project
    assert!(action.prior_regions.is_empty());
}
