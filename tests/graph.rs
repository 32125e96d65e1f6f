use daw_engine::audio::engine::EngineError;
use daw_engine::audio::plugin::{DelayLinePlugin, GainPlugin, PluginSlotKey};
use daw_engine::{AudioEngine, EngineConfig, TrackKind};

fn new_engine(dir: &tempfile::TempDir) -> AudioEngine {
    let (engine, _handle) = AudioEngine::new(EngineConfig::default(), dir.path());
    engine
}

#[test]
fn graph_compiles_for_default_project() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let baseline = engine.graph_node_count();
    assert!(baseline > 0);

    engine.add_track(TrackKind::Audio, "Audio 1");
    assert!(engine.graph_node_count() > baseline);
}

#[test]
fn send_feedback_is_rejected_as_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let a = engine.add_track(TrackKind::AudioBus, "A");
    let b = engine.add_track(TrackKind::AudioBus, "B");

    engine.set_send_dest(a, 0, Some(b)).unwrap();
    let nodes_before = engine.graph_node_count();

    // B sending back into A closes a loop through both strips
    let err = engine.set_send_dest(b, 0, Some(a)).unwrap_err();
    assert!(matches!(err, EngineError::RoutingCycle(_, _)));

    // The graph is unchanged and still runs
    assert_eq!(engine.graph_node_count(), nodes_before);
    engine.process_cycle(256);
}

#[test]
fn direct_output_feedback_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let a = engine.add_track(TrackKind::AudioGroup, "Group A");
    let b = engine.add_track(TrackKind::AudioBus, "Bus B");

    engine.set_track_output(b, a).unwrap();
    let err = engine.set_track_output(a, b).unwrap_err();
    assert!(matches!(err, EngineError::RoutingCycle(_, _)));
}

#[test]
fn plugin_latency_sets_route_latency() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let master = engine
        .state()
        .tracklist
        .get()
        .master()
        .expect("master exists")
        .id;
    assert_eq!(engine.max_route_latency(), 0);

    engine
        .add_plugin(master, PluginSlotKey::Insert(0), Box::new(DelayLinePlugin::new(256)))
        .unwrap();
    assert_eq!(engine.max_route_latency(), 256);
}

#[test]
fn latency_preroll_splits_first_cycle() {
    use daw_engine::audio::pool::AudioClip;
    use daw_engine::io::audio_file::BitDepth;

    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        buffer_size: 512,
        ..Default::default()
    };
    let (mut engine, _handle) = AudioEngine::new(config, dir.path());
    let master = engine.state().tracklist.get().master().unwrap().id;
    engine
        .add_plugin(master, PluginSlotKey::Insert(0), Box::new(DelayLinePlugin::new(256)))
        .unwrap();

    // Timeline material so the rolled half of the cycle carries signal
    let track = engine.add_track(TrackKind::Audio, "A");
    let clip = engine.import_clip(AudioClip::from_float_array(
        "c",
        vec![0.5; 44100 * 2],
        2,
        44100,
        120.0,
        BitDepth::B32,
    ));
    engine.add_audio_region(track, 0, clip, 0).unwrap();

    // Start rolling at frame 1000 with a 512-frame buffer: 256 frames of
    // latency pre-roll are consumed first, so the playhead lands at 1256
    engine.transport.set_playhead(1000);
    engine.transport.request_roll();
    engine.process_cycle(512);
    assert_eq!(engine.transport.playhead.frames, 1000 + (512 - 256));

    // The zero-latency track processor ran no-roll over the first 256-frame
    // sub-cycle: that window holds only the denormal prevention value, while
    // the rolled second half carries the region audio
    {
        let tracklist = engine.state().tracklist.get();
        let tp_out = tracklist
            .track(track)
            .unwrap()
            .processor
            .stereo_out
            .unwrap();
        let arena = engine.state().ports.get();
        let buf = &arena.get(tp_out.l).unwrap().buf;
        assert!(buf[10].abs() <= 1e-19, "expected denormal fill, got {}", buf[10]);
        assert!(
            buf[128].abs() <= 1e-19,
            "expected denormal fill, got {}",
            buf[128]
        );
        assert!(
            (buf[300] - 0.5).abs() < 1e-3,
            "expected rolled audio, got {}",
            buf[300]
        );
    }

    // Subsequent cycles advance normally
    engine.process_cycle(512);
    assert_eq!(engine.transport.playhead.frames, 1256 + 512);
}

#[test]
fn bypassed_insert_passes_audio_through() {
    use daw_engine::audio::pool::AudioClip;
    use daw_engine::io::audio_file::BitDepth;

    let dir = tempfile::tempdir().unwrap();
    let mut engine = new_engine(&dir);
    let a = engine.add_track(TrackKind::Audio, "A");
    let clip = engine.import_clip(AudioClip::from_float_array(
        "c",
        vec![0.5; 44100 * 2],
        2,
        44100,
        120.0,
        BitDepth::B32,
    ));
    engine.add_audio_region(a, 0, clip, 0).unwrap();
    engine
        .add_plugin(a, PluginSlotKey::Insert(0), Box::new(GainPlugin::new()))
        .unwrap();

    // Halve through the plugin parameter
    let param_port = {
        let tracklist = engine.state().tracklist.get();
        let channel = tracklist.track(a).unwrap().channel.as_ref().unwrap();
        channel.slot(PluginSlotKey::Insert(0)).unwrap().param_ports[0]
    };
    {
        let arena = engine.state().ports.get();
        arena.get_mut(param_port).unwrap().set_control_value(0.5, true);
    }

    engine.transport.request_roll();
    let mut scratch = vec![0.0f32; 512];
    engine.process_cycle(256);
    engine.process_cycle(256);
    engine.fill_output(&mut scratch, 2);
    assert!((scratch[64] - 0.25).abs() < 1e-3, "got {}", scratch[64]);

    // Disable the plugin: bypass passes the dry signal
    let enabled_port = {
        let tracklist = engine.state().tracklist.get();
        let channel = tracklist.track(a).unwrap().channel.as_ref().unwrap();
        channel.slot(PluginSlotKey::Insert(0)).unwrap().enabled_port
    };
    {
        let arena = engine.state().ports.get();
        arena.get_mut(enabled_port).unwrap().set_control_value(0.0, true);
    }
    engine.process_cycle(256);
    engine.fill_output(&mut scratch, 2);
    assert!((scratch[64] - 0.5).abs() < 1e-3, "got {}", scratch[64]);
}
