use crate::audio::fader::{Fader, FaderKind};
use crate::audio::graph::{collect_internal_edges, default_worker_count, CycleCtx, Router, TimeInfo};
use crate::audio::hardware::HardwareProcessor;
use crate::audio::metronome::SampleProcessor;
use crate::audio::plugin::{Plugin, PluginSlotKey};
use crate::audio::pool::{AudioPool, PoolId};
use crate::audio::port::{
    Port, PortArena, PortFlow, PortId, PortOwner, PortType, RtCell,
};
use crate::audio::position::Position;
use crate::audio::recording::{
    recording_channels, RecordingManager, RecordingProducer,
};
use crate::audio::region::RegionData;
use crate::audio::track::{Track, TrackId, TrackKind};
use crate::audio::tracklist::Tracklist;
use crate::audio::transport::Transport;
use crate::command::{AudioEvent, Command, EngineEvent};
use crate::config::EngineConfig;
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Monitor fade length around pause/resume, seconds
const FADE_SECONDS: f32 = 0.03;

/// Engine-level errors from structural operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such track {0}")]
    UnknownTrack(TrackId),
    #[error("track {0} has no channel")]
    NoChannel(TrackId),
    #[error("routing {0} into {1} would loop")]
    RoutingCycle(TrackId, TrackId),
    #[error(transparent)]
    Connection(#[from] crate::audio::connections::ConnectionError),
}

/// The control room: monitor fader plus listen dim
pub struct ControlRoom {
    pub monitor_fader: Fader,
    /// Gain applied to listened tracks mixed into the monitor bus
    pub listen_dim: f32,
}

impl ControlRoom {
    fn new(arena: &mut PortArena) -> Self {
        let monitor_fader = Fader::create(arena, FaderKind::Monitor, None);
        for id in [monitor_fader.stereo_out.l, monitor_fader.stereo_out.r] {
            if let Some(port) = arena.get_mut(id) {
                port.set_exposed_to_backend(true);
            }
        }
        Self {
            monitor_fader,
            listen_dim: 0.5,
        }
    }
}

/// State shared between the engine, the graph workers and the recording
/// consumer
///
/// Everything inside follows the single-writer-per-cycle discipline
/// documented on `RtCell`; structural mutation happens only while the graph
/// is not running.
pub struct EngineState {
    pub ports: RtCell<PortArena>,
    pub tracklist: RtCell<Tracklist>,
    pub pool: RtCell<AudioPool>,
    pub sample_processor: RtCell<SampleProcessor>,
    pub control_room: RtCell<ControlRoom>,
    next_region_id: AtomicU32,
}

impl EngineState {
    /// Allocate a project-unique region id
    pub fn allocate_region_id(&self) -> u32 {
        self.next_region_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Monitor fade state machine around pause/resume
enum FadePhase {
    None,
    FadingOut { left: u32, total: u32 },
    FadingIn { left: u32, total: u32 },
}

/// A learned MIDI CC binding driving a control port
#[derive(Debug, Clone, Copy)]
pub struct MidiMapping {
    /// MIDI channel the binding listens on (0-15)
    pub channel: u8,
    /// CC number
    pub cc: u8,
    pub port: PortId,
}

/// UI-side handle to a running engine
pub struct EngineHandle {
    command_tx: rtrb::Producer<Command>,
    pub event_rx: Receiver<AudioEvent>,
    engine_event_tx: Sender<EngineEvent>,
    playhead: Arc<AtomicU64>,
    pub sample_rate: u32,
}

impl EngineHandle {
    /// Queue a command for the audio thread; false when the queue is full
    pub fn send(&mut self, command: Command) -> bool {
        self.command_tx.push(command).is_ok()
    }

    /// Playhead position in frames as of the last processed cycle
    pub fn playhead_frames(&self) -> u64 {
        self.playhead.load(Ordering::Relaxed)
    }

    /// Playhead position in seconds
    pub fn playhead_seconds(&self) -> f64 {
        self.playhead_frames() as f64 / self.sample_rate as f64
    }

    /// Request a buffer-size or sample-rate change (any thread)
    pub fn request_engine_change(&self, event: EngineEvent) {
        let _ = self.engine_event_tx.try_send(event);
    }
}

/// The audio engine facade
///
/// Owns the whole processing world; `process_cycle` is the per-cycle entry
/// point invoked from the backend's audio callback (or a test/export
/// driver).
pub struct AudioEngine {
    pub config: EngineConfig,
    state: Arc<EngineState>,
    pub transport: Transport,
    pub connections: crate::audio::connections::PortConnections,
    router: Router,

    pub hardware_in: HardwareProcessor,
    pub hardware_out: HardwareProcessor,

    recording_producer: RecordingProducer,
    recording_manager: Option<RecordingManager>,

    command_rx: rtrb::Consumer<Command>,
    event_tx: Sender<AudioEvent>,
    engine_event_rx: Receiver<EngineEvent>,

    /// Engine-owned MIDI input from the backend
    pub midi_in: PortId,
    /// Events injected by the piano-roll editor's on-screen keyboard
    pub midi_editor_manual_press: PortId,
    /// Learned CC bindings applied to incoming hardware MIDI
    pub midi_mappings: Vec<MidiMapping>,

    playhead_atomic: Arc<AtomicU64>,

    block_length: u32,
    max_block_length: u32,
    sample_rate: u32,

    /// Engine is processing; cleared during structural swaps
    pub run: bool,
    /// The last cycle produced no audio (engine held off)
    silent: bool,
    denormal_positive: bool,
    remaining_latency_preroll: u32,
    fade: FadePhase,
    pending_changes: Vec<EngineEvent>,

    frames_since_pos_event: u32,
    pos_event_interval: u32,
}

impl AudioEngine {
    /// Build an engine with the default singleton tracks (master, tempo,
    /// chord, marker, modulator) and an empty project
    pub fn new(config: EngineConfig, project_dir: impl AsRef<Path>) -> (Self, EngineHandle) {
        let config = config.validated();
        let sample_rate = config.sample_rate;
        let block_length = config.buffer_size;

        let mut arena = PortArena::new();
        let transport = Transport::new(sample_rate, &mut arena);
        let sample_processor = SampleProcessor::new(&mut arena, sample_rate);
        let control_room = ControlRoom::new(&mut arena);

        let midi_in = {
            let mut port = Port::new(
                PortType::Midi,
                PortFlow::Input,
                PortOwner::Engine,
                0,
                "MIDI In",
            );
            port.set_exposed_to_backend(true);
            arena.insert(port)
        };
        let midi_editor_manual_press = arena.insert(Port::new(
            PortType::Midi,
            PortFlow::Input,
            PortOwner::Engine,
            1,
            "MIDI Editor Manual Press",
        ));

        let state = Arc::new(EngineState {
            ports: RtCell::new(arena),
            tracklist: RtCell::new(Tracklist::new()),
            pool: RtCell::new(AudioPool::new(project_dir.as_ref())),
            sample_processor: RtCell::new(sample_processor),
            control_room: RtCell::new(control_room),
            next_region_id: AtomicU32::new(0),
        });

        let (command_tx, command_rx) = rtrb::RingBuffer::new(256);
        let (event_tx, event_rx) = crossbeam_channel::bounded(1024);
        let (engine_event_tx, engine_event_rx) = crossbeam_channel::bounded(16);

        let (recording_producer, recording_manager) =
            recording_channels(Arc::clone(&state), 4096, event_tx.clone());

        let router = Router::new(Arc::clone(&state), default_worker_count());
        let playhead_atomic = Arc::new(AtomicU64::new(0));

        let mut engine = Self {
            config,
            state: Arc::clone(&state),
            transport,
            connections: crate::audio::connections::PortConnections::new(),
            router,
            hardware_in: HardwareProcessor::new(true),
            hardware_out: HardwareProcessor::new(false),
            recording_producer,
            recording_manager: Some(recording_manager),
            command_rx,
            event_tx,
            engine_event_rx,
            midi_in,
            midi_editor_manual_press,
            midi_mappings: Vec::new(),
            playhead_atomic: Arc::clone(&playhead_atomic),
            block_length,
            max_block_length: block_length.max(4096),
            sample_rate,
            run: true,
            silent: false,
            denormal_positive: false,
            remaining_latency_preroll: 0,
            fade: FadePhase::None,
            pending_changes: Vec::new(),
            frames_since_pos_event: 0,
            pos_event_interval: sample_rate / 30,
        };

        // Singleton tracks
        engine.add_track(TrackKind::Master, "Master");
        let chord = engine.add_track(TrackKind::Chord, "Chords");
        engine.add_track(TrackKind::Tempo, "Tempo");
        engine.add_track(TrackKind::Marker, "Markers");
        engine.add_track(TrackKind::Modulator, "Modulators");
        if let Some(track) = engine.state.tracklist.get_mut().track_mut(chord) {
            track.pinned = true;
        }

        let handle = EngineHandle {
            command_tx,
            event_rx,
            engine_event_tx,
            playhead: playhead_atomic,
            sample_rate,
        };
        (engine, handle)
    }

    /// Shared state, for embedders wiring recording/UI consumers
    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Current block length in frames
    pub fn block_length(&self) -> u32 {
        self.block_length
    }

    /// Current sample rate
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of compiled scheduler nodes
    pub fn graph_node_count(&self) -> usize {
        self.router.node_count()
    }

    /// Longest route playback latency in the compiled graph
    pub fn max_route_latency(&self) -> u32 {
        self.router.max_route_latency()
    }

    /// Detach the recording consumer to drive it from another thread
    pub fn take_recording_manager(&mut self) -> Option<RecordingManager> {
        self.recording_manager.take()
    }

    /// Drive the recording consumer in place (single-threaded embedders)
    pub fn process_recording_events(&mut self) -> usize {
        match self.recording_manager.as_mut() {
            Some(manager) => manager.process_events(&mut self.transport),
            None => 0,
        }
    }

    // ---- structural operations (engine idle / between cycles) ----

    /// Create a track, route it to the master bus and rebuild the graph
    pub fn add_track(&mut self, kind: TrackKind, name: &str) -> TrackId {
        let id = {
            let arena = self.state.ports.get_mut();
            let tracklist = self.state.tracklist.get_mut();
            let id = tracklist.allocate_id();
            let mut track = Track::new(id, name, kind, arena);
            if kind.has_channel() && kind != TrackKind::Master {
                if let Some(channel) = &mut track.channel {
                    channel.output = tracklist.master().map(|m| m.id);
                }
            }
            tracklist.append_track(track);
            id
        };
        self.rewire_and_rebuild();
        id
    }

    /// Remove a track, its ports and its connections
    pub fn remove_track(&mut self, id: TrackId) -> Result<(), EngineError> {
        {
            let arena = self.state.ports.get_mut();
            let tracklist = self.state.tracklist.get_mut();
            let track = tracklist
                .remove_track(id)
                .ok_or(EngineError::UnknownTrack(id))?;
            for port in track.all_ports() {
                self.connections.disconnect_all_for_port(port);
                arena.remove(port);
            }
            // Anything routed into the removed track falls back to master
            let master = tracklist.master().map(|m| m.id);
            for other in tracklist.iter_mut() {
                if let Some(channel) = &mut other.channel {
                    if channel.output == Some(id) {
                        channel.output = master;
                    }
                    for send in &mut channel.sends {
                        if send.dest == Some(id) {
                            send.dest = None;
                        }
                    }
                }
            }
        }
        self.rewire_and_rebuild();
        Ok(())
    }

    /// Route a channel into a downstream channel
    pub fn set_track_output(&mut self, track: TrackId, output: TrackId) -> Result<(), EngineError> {
        {
            let tracklist = self.state.tracklist.get_mut();
            if tracklist.track(output).is_none() {
                return Err(EngineError::UnknownTrack(output));
            }
            // Feeding a track that already routes through us would loop
            if tracklist.routes_through(output, track) {
                return Err(EngineError::RoutingCycle(track, output));
            }
            let t = tracklist
                .track_mut(track)
                .ok_or(EngineError::UnknownTrack(track))?;
            let channel = t.channel.as_mut().ok_or(EngineError::NoChannel(track))?;
            channel.output = Some(output);
        }
        self.rewire_and_rebuild();
        Ok(())
    }

    /// Point a channel send at a destination channel
    pub fn set_send_dest(
        &mut self,
        track: TrackId,
        send_index: u8,
        dest: Option<TrackId>,
    ) -> Result<(), EngineError> {
        // Trial-connect through the full port graph so feedback through
        // other sends and strips is rejected before anything mutates
        if let Some(d) = dest {
            let endpoints = {
                let tracklist = self.state.tracklist.get();
                let send_out = tracklist
                    .track(track)
                    .and_then(|t| t.channel.as_ref())
                    .and_then(|c| c.sends.get(send_index as usize))
                    .map(|s| s.stereo_out);
                let dest_in = tracklist.track(d).and_then(|t| t.processor.stereo_in);
                send_out.zip(dest_in)
            };
            if let Some((send_out, dest_in)) = endpoints {
                let internal = collect_internal_edges(&self.state);
                let arena = self.state.ports.get();
                use crate::audio::connections::ConnectionError;
                match self
                    .connections
                    .connect(arena, &internal, send_out.l, dest_in.l, true)
                {
                    Ok(()) => {
                        let _ = self.connections.disconnect(send_out.l, dest_in.l);
                    }
                    Err(ConnectionError::WouldCreateCycle) => {
                        return Err(EngineError::RoutingCycle(track, d));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        {
            let tracklist = self.state.tracklist.get_mut();
            if let Some(d) = dest {
                if tracklist.track(d).is_none() {
                    return Err(EngineError::UnknownTrack(d));
                }
                if d == track || tracklist.routes_through(d, track) {
                    return Err(EngineError::RoutingCycle(track, d));
                }
            }
            let t = tracklist
                .track_mut(track)
                .ok_or(EngineError::UnknownTrack(track))?;
            let channel = t.channel.as_mut().ok_or(EngineError::NoChannel(track))?;
            let Some(send) = channel.sends.get_mut(send_index as usize) else {
                return Err(EngineError::UnknownTrack(track));
            };
            send.dest = dest;
            let arena = self.state.ports.get();
            if let Some(port) = arena.get_mut(send.enabled_port) {
                port.set_control_value(if dest.is_some() { 1.0 } else { 0.0 }, true);
            }
        }
        self.rewire_and_rebuild();
        Ok(())
    }

    /// Mount a plugin into a channel slot
    pub fn add_plugin(
        &mut self,
        track: TrackId,
        key: PluginSlotKey,
        instance: Box<dyn Plugin>,
    ) -> Result<(), EngineError> {
        {
            let arena = self.state.ports.get_mut();
            let tracklist = self.state.tracklist.get_mut();
            let t = tracklist
                .track_mut(track)
                .ok_or(EngineError::UnknownTrack(track))?;
            let channel = t.channel.as_mut().ok_or(EngineError::NoChannel(track))?;
            if let Some(old) = channel.remove_plugin(key) {
                for port in old.all_ports() {
                    self.connections.disconnect_all_for_port(port);
                    arena.remove(port);
                }
            }
            channel.add_plugin(arena, key, instance);
        }
        self.rewire_and_rebuild();
        Ok(())
    }

    /// Unmount a plugin from a channel slot
    pub fn remove_plugin(&mut self, track: TrackId, key: PluginSlotKey) -> Result<(), EngineError> {
        {
            let arena = self.state.ports.get_mut();
            let tracklist = self.state.tracklist.get_mut();
            let t = tracklist
                .track_mut(track)
                .ok_or(EngineError::UnknownTrack(track))?;
            let channel = t.channel.as_mut().ok_or(EngineError::NoChannel(track))?;
            if let Some(old) = channel.remove_plugin(key) {
                for port in old.all_ports() {
                    self.connections.disconnect_all_for_port(port);
                    arena.remove(port);
                }
            }
        }
        self.rewire_and_rebuild();
        Ok(())
    }

    /// User-facing port connection with full validation
    pub fn connect_ports(
        &mut self,
        src: PortId,
        dest: PortId,
        locked: bool,
    ) -> Result<(), EngineError> {
        {
            let arena = self.state.ports.get();
            let internal = collect_internal_edges(&self.state);
            self.connections.connect(arena, &internal, src, dest, locked)?;
        }
        self.refresh_connections();
        Ok(())
    }

    /// Remove a user connection
    pub fn disconnect_ports(&mut self, src: PortId, dest: PortId) -> Result<(), EngineError> {
        self.connections.disconnect(src, dest)?;
        self.refresh_connections();
        Ok(())
    }

    /// Change a connection's gain multiplier
    pub fn set_connection_multiplier(
        &mut self,
        src: PortId,
        dest: PortId,
        multiplier: f32,
    ) -> Result<(), EngineError> {
        self.connections.set_multiplier(src, dest, multiplier)?;
        self.refresh_connections();
        Ok(())
    }

    /// Enable or disable a connection without removing it
    pub fn set_connection_enabled(
        &mut self,
        src: PortId,
        dest: PortId,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.connections.set_enabled(src, dest, enabled)?;
        self.refresh_connections();
        Ok(())
    }

    /// Register an imported or generated clip in the pool
    pub fn import_clip(&mut self, clip: crate::audio::pool::AudioClip) -> PoolId {
        self.state.pool.get_mut().add_clip(clip)
    }

    /// Place an audio region backed by a pool clip on a track lane
    pub fn add_audio_region(
        &mut self,
        track: TrackId,
        lane: usize,
        pool_id: PoolId,
        start_frame: i64,
    ) -> Result<crate::audio::region::RegionId, EngineError> {
        use crate::audio::region::{AudioRegionData, Region};
        let fpt = self.transport.frames_per_tick;
        let region_id = self.state.allocate_region_id();
        let (frames, bpm, name) = {
            let pool = self.state.pool.get();
            let clip = pool
                .get_clip(pool_id)
                .ok_or(EngineError::UnknownTrack(track))?;
            (Arc::clone(&clip.frames), clip.bpm, clip.name.clone())
        };
        let length = frames.num_frames as i64;
        let tracklist = self.state.tracklist.get_mut();
        let t = tracklist
            .track_mut(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        t.ensure_lanes(lane + 1);
        let region = Region::new(
            region_id,
            name,
            track,
            lane,
            Position::from_frames(start_frame, fpt),
            Position::from_frames(start_frame + length, fpt),
            RegionData::Audio(AudioRegionData {
                clip: frames,
                pool_id,
                gain: 1.0,
                musical_mode: false,
                clip_bpm: bpm,
            }),
        );
        t.lanes[lane].add_region(region);
        Ok(region_id)
    }

    /// Place an empty MIDI region on a track lane
    pub fn add_midi_region(
        &mut self,
        track: TrackId,
        lane: usize,
        start_frame: i64,
        length_frames: i64,
    ) -> Result<crate::audio::region::RegionId, EngineError> {
        use crate::audio::region::{MidiRegionData, Region};
        let fpt = self.transport.frames_per_tick;
        let region_id = self.state.allocate_region_id();
        let tracklist = self.state.tracklist.get_mut();
        let t = tracklist
            .track_mut(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        t.ensure_lanes(lane + 1);
        let region = Region::new(
            region_id,
            format!("{} region", t.name),
            track,
            lane,
            Position::from_frames(start_frame, fpt),
            Position::from_frames(start_frame + length_frames, fpt),
            RegionData::Midi(MidiRegionData::default()),
        );
        t.lanes[lane].add_region(region);
        Ok(region_id)
    }

    /// Drop pool clips referenced by no region and none of `undo_refs`
    pub fn remove_unused_clips(
        &mut self,
        undo_refs: &HashSet<PoolId>,
        backup: bool,
    ) -> Result<usize, crate::audio::pool::PoolError> {
        let mut in_use: HashSet<PoolId> = undo_refs.clone();
        {
            let tracklist = self.state.tracklist.get();
            for track in tracklist.iter() {
                for lane in &track.lanes {
                    for region in &lane.regions {
                        if let RegionData::Audio(data) = &region.data {
                            in_use.insert(data.pool_id);
                        }
                    }
                }
            }
        }
        self.state.pool.get_mut().remove_unused(&in_use, backup)
    }

    /// Re-resolve connection caches into the arena and recompile the graph
    fn refresh_connections(&mut self) {
        let arena = self.state.ports.get();
        self.connections.resolve_into_arena(arena);
        self.router.rebuild();
    }

    /// Rebuild the standard wiring (channel strips, routing, monitor bus)
    /// and recompile the graph
    pub fn rewire_and_rebuild(&mut self) {
        self.run = false;
        let internal = collect_internal_edges(&self.state);
        {
            let arena = self.state.ports.get();
            let tracklist = self.state.tracklist.get_mut();

            // Channel strips
            for track in tracklist.iter_mut() {
                let tp_stereo = track.processor.stereo_out;
                let tp_midi = track.processor.midi_out;
                if let Some(channel) = &mut track.channel {
                    channel.wire(tp_stereo, tp_midi, arena, &mut self.connections);
                }
            }

            // Channel -> downstream channel
            let routes: Vec<(TrackId, Option<TrackId>)> = tracklist
                .iter()
                .filter_map(|t| t.channel.as_ref().map(|c| (t.id, c.output)))
                .collect();
            for (src_id, dest_id) in routes {
                let Some(dest_id) = dest_id else { continue };
                let (src_stereo, src_midi) = {
                    let Some(src) = tracklist.track(src_id) else { continue };
                    let Some(channel) = src.channel.as_ref() else { continue };
                    (channel.stereo_out(), channel.wired_midi_out)
                };
                let Some(dest) = tracklist.track(dest_id) else { continue };
                if let Some(dest_in) = dest.processor.stereo_in {
                    let _ = self
                        .connections
                        .connect(arena, &internal, src_stereo.l, dest_in.l, true);
                    let _ = self
                        .connections
                        .connect(arena, &internal, src_stereo.r, dest_in.r, true);
                }
                if let (Some(midi_src), Some(midi_dest)) = (src_midi, dest.processor.midi_in) {
                    let _ = self
                        .connections
                        .connect(arena, &internal, midi_src, midi_dest, true);
                }
            }

            // Sends -> destination processor inputs
            let send_routes: Vec<(crate::audio::port::StereoPorts, TrackId)> = tracklist
                .iter()
                .filter_map(|t| t.channel.as_ref())
                .flat_map(|c| {
                    c.sends
                        .iter()
                        .filter_map(|s| s.dest.map(|d| (s.stereo_out, d)))
                })
                .collect();
            for (send_out, dest_id) in send_routes {
                let Some(dest) = tracklist.track(dest_id) else { continue };
                if let Some(dest_in) = dest.processor.stereo_in {
                    let _ = self
                        .connections
                        .connect(arena, &internal, send_out.l, dest_in.l, true);
                    let _ = self
                        .connections
                        .connect(arena, &internal, send_out.r, dest_in.r, true);
                }
            }

            // Master and the sample processor feed the monitor bus; listened
            // tracks ride along at the dim gain
            let control_room = self.state.control_room.get();
            let monitor_in = control_room.monitor_fader.stereo_in;
            if let Some(master) = tracklist.master() {
                if let Some(channel) = &master.channel {
                    let out = channel.stereo_out();
                    let _ = self.connections.connect(arena, &internal, out.l, monitor_in.l, true);
                    let _ = self.connections.connect(arena, &internal, out.r, monitor_in.r, true);
                }
            }
            {
                let sp = self.state.sample_processor.get();
                let _ = self
                    .connections
                    .connect(arena, &internal, sp.stereo_out.l, monitor_in.l, true);
                let _ = self
                    .connections
                    .connect(arena, &internal, sp.stereo_out.r, monitor_in.r, true);
            }
            for track in tracklist.iter() {
                if track.kind == TrackKind::Master || !track.is_listened(arena) {
                    continue;
                }
                if let Some(channel) = &track.channel {
                    let out = channel.stereo_out();
                    for (s, d) in [(out.l, monitor_in.l), (out.r, monitor_in.r)] {
                        let _ = self.connections.connect(arena, &internal, s, d, true);
                        let _ = self
                            .connections
                            .set_multiplier(s, d, control_room.listen_dim);
                    }
                }
            }

            self.connections.resolve_into_arena(arena);
        }
        self.allocate_all_buffers();
        self.router.rebuild();
        self.run = true;
    }

    /// Size every port buffer to the maximum block length
    fn allocate_all_buffers(&mut self) {
        let arena = self.state.ports.get_mut();
        let needed = self.max_block_length as usize;
        for id in arena.ids().collect::<Vec<_>>() {
            if let Some(port) = arena.get_mut(id) {
                let want = match port.port_type {
                    PortType::Audio | PortType::Cv => needed,
                    PortType::Control => 1,
                    PortType::Midi => 0,
                };
                if port.buf.len() != want {
                    port.allocate_buffers(needed);
                }
            }
        }
    }

    // ---- the audio cycle ----

    /// Process one backend buffer
    ///
    /// Splits the buffer into sub-cycles for latency pre-roll, count-in,
    /// transport pre-roll and loop points, and drives the router for each.
    pub fn process_cycle(&mut self, nframes: u32) {
        if !self.run
            || self
                .router
                .setup_in_progress
                .load(Ordering::SeqCst)
        {
            self.silent = true;
            return;
        }
        self.silent = false;
        let nframes = nframes.min(self.block_length);
        if nframes == 0 {
            return;
        }

        while let Ok(cmd) = self.command_rx.pop() {
            self.handle_command(cmd);
        }
        self.apply_engine_events();
        self.advance_fade(nframes);

        // Alternate the denormal prevention sign each cycle
        self.denormal_positive = !self.denormal_positive;
        let denormal = if self.denormal_positive { 1e-20 } else { -1e-20 };

        let was_rolling = self.transport.is_rolling();
        self.transport.transition();
        let rolling = self.transport.is_rolling();

        if was_rolling && !rolling {
            // Pause frame: recording pauses, pending clicks are dropped
            let playhead = self.transport.playhead.frames;
            let time = TimeInfo {
                g_start_frame: playhead,
                g_start_w_offset: playhead,
                local_offset: 0,
                nframes: 0,
            };
            self.recording_producer
                .handle_recording(&self.state, &self.transport, &time);
            self.state.sample_processor.get_mut().flush();
            let _ = self.event_tx.try_send(AudioEvent::TransportChanged);
        }
        if !was_rolling && rolling {
            // Latency pre-roll runs once at roll start
            self.remaining_latency_preroll = self.router.max_route_latency();
            let _ = self.event_tx.try_send(AudioEvent::TransportChanged);
        }

        self.hardware_in.process(self.state.ports.get(), nframes);
        self.apply_midi_mappings();

        let any_soloed = {
            let arena = self.state.ports.get();
            self.state.tracklist.get().any_soloed(arena)
        };

        let monitor_fade = self.current_fade(nframes);
        let base_ctx = CycleCtx {
            time: TimeInfo::default(),
            rolling,
            denormal,
            remaining_latency_preroll: 0,
            sample_rate: self.sample_rate,
            bpm: self.transport.bpm,
            frames_per_tick: self.transport.frames_per_tick,
            recording: self.transport.recording,
            punch_enabled: self.transport.punch_enabled,
            punch_start: self.transport.punch_start.frames,
            punch_end: self.transport.punch_end.frames,
            any_soloed,
            pan_law: self.config.pan_law,
            pan_algorithm: self.config.pan_algorithm,
            listen_dim: self.state.control_room.get().listen_dim,
            monitor_fade,
        };

        let mut cur_offset: u32 = 0;

        // 1. Latency pre-roll: low-latency routes run silent while routes
        // with enough accumulated latency already roll
        while self.remaining_latency_preroll > 0 && cur_offset < nframes {
            let sub = self.remaining_latency_preroll.min(nframes - cur_offset);
            let playhead = self.transport.playhead.frames;
            let mut ctx = base_ctx;
            ctx.time = TimeInfo {
                g_start_frame: playhead - cur_offset as i64,
                g_start_w_offset: playhead,
                local_offset: cur_offset,
                nframes: sub,
            };
            ctx.remaining_latency_preroll = self.remaining_latency_preroll;
            self.router.run_cycle(ctx);
            self.remaining_latency_preroll -= sub;
            cur_offset += sub;
        }

        // 2. Count-in: the metronome sounds but the playhead holds still
        while self.transport.count_in_frames_remaining > 0 && cur_offset < nframes {
            let sub = self
                .transport
                .count_in_frames_remaining
                .min(nframes - cur_offset);
            let playhead = self.transport.playhead.frames;
            let countdown_start =
                playhead - self.transport.count_in_frames_remaining as i64;
            {
                let sp = self.state.sample_processor.get_mut();
                sp.queue_metronome(
                    self.transport.frames_per_bar(),
                    self.transport.frames_per_beat(),
                    countdown_start,
                    sub,
                );
            }
            let mut ctx = base_ctx;
            ctx.rolling = false;
            ctx.time = TimeInfo {
                g_start_frame: playhead - cur_offset as i64,
                g_start_w_offset: playhead,
                local_offset: cur_offset,
                nframes: sub,
            };
            self.router.run_cycle(ctx);
            self.transport.count_in_frames_remaining -= sub;
            cur_offset += sub;
        }

        // 3. Transport pre-roll, loop splits and the plain remainder
        while cur_offset < nframes {
            let remaining = nframes - cur_offset;
            let g_start = self.transport.playhead.frames;
            let mut sub = remaining;
            if let Some(until) = self.transport.frames_until_loop_end(g_start) {
                sub = sub.min(until as u32);
            }
            let in_preroll = self.transport.preroll_frames_remaining > 0;
            if in_preroll {
                sub = sub.min(self.transport.preroll_frames_remaining);
            }

            if rolling && self.state.sample_processor.get().metronome.enabled {
                let sp = self.state.sample_processor.get_mut();
                sp.queue_metronome(
                    self.transport.frames_per_bar(),
                    self.transport.frames_per_beat(),
                    g_start,
                    sub,
                );
            }

            let mut ctx = base_ctx;
            ctx.time = TimeInfo {
                g_start_frame: g_start - cur_offset as i64,
                g_start_w_offset: g_start,
                local_offset: cur_offset,
                nframes: sub,
            };
            self.router.run_cycle(ctx);

            // The producer also emits stop events for disarmed tracks, so it
            // runs every sub-cycle
            self.recording_producer
                .handle_recording(&self.state, &self.transport, &ctx.time);

            if rolling {
                self.transport.add_to_playhead(sub as i64);
                if in_preroll {
                    self.transport.preroll_frames_remaining -= sub;
                }
                // Loop wrap: continue the same buffer from loop start
                if self.transport.loop_enabled
                    && self.transport.playhead.frames >= self.transport.loop_end.frames
                    && g_start < self.transport.loop_end.frames
                {
                    let loop_start = self.transport.loop_start.frames;
                    self.transport.set_playhead(loop_start);
                }
            }
            cur_offset += sub;
        }

        self.post_cycle(nframes);
    }

    /// Interleave the monitor output into a backend buffer
    pub fn fill_output(&self, out: &mut [f32], channels: u32) {
        out.fill(0.0);
        if channels == 0 || self.silent {
            return;
        }
        let arena = self.state.ports.get();
        let monitor = &self.state.control_room.get().monitor_fader;
        let (Some(l), Some(r)) = (
            arena.get(monitor.stereo_out.l),
            arena.get(monitor.stereo_out.r),
        ) else {
            return;
        };
        let frames = out.len() / channels as usize;
        for frame in 0..frames.min(l.buf.len()) {
            out[frame * channels as usize] = l.buf[frame];
            if channels > 1 {
                out[frame * channels as usize + 1] = r.buf[frame];
            }
        }
    }

    fn post_cycle(&mut self, nframes: u32) {
        let tempo_update = {
            let arena = self.state.ports.get();

            // Transport hardware mappings act on rising edges
            if self.transport.process_transport_ports(arena) {
                let _ = self.event_tx.try_send(AudioEvent::TransportChanged);
            }

            // Tempo/time-signature ports re-derive the conversion factors
            let bpm_changed = arena
                .get_mut(self.transport.bpm_port)
                .map(|p| {
                    let changed = p.control_change_pending;
                    p.control_change_pending = false;
                    p.last_control = p.control;
                    changed.then_some(p.control)
                })
                .unwrap_or(None);
            let mut sig_changed = false;
            for id in [
                self.transport.beats_per_bar_port,
                self.transport.beat_unit_port,
            ] {
                if let Some(p) = arena.get_mut(id) {
                    if p.control_change_pending {
                        sig_changed = true;
                        p.control_change_pending = false;
                        p.last_control = p.control;
                    }
                }
            }
            if bpm_changed.is_some() || sig_changed {
                let bpm = bpm_changed.unwrap_or(self.transport.bpm);
                let beats = arena
                    .get(self.transport.beats_per_bar_port)
                    .map(|p| p.control as u32)
                    .unwrap_or(self.transport.beats_per_bar);
                let unit = arena
                    .get(self.transport.beat_unit_port)
                    .map(|p| (p.control as u32).max(1))
                    .unwrap_or(self.transport.beat_unit);
                Some((beats, bpm, unit))
            } else {
                None
            }
        };
        if let Some((beats, bpm, unit)) = tempo_update {
            self.transport.beat_unit = unit;
            self.transport
                .update_frames_per_tick(beats, bpm, self.sample_rate);
            self.refresh_project_positions();
        }

        // Publish control changes and meter rings
        {
            let arena = self.state.ports.get();
            for id in arena.ids() {
                if let Some(port) = arena.get_mut(id) {
                    port.write_rings(nframes);
                    if port.control_change_pending && port.flags.automatable {
                        port.control_change_pending = false;
                        port.last_control = port.control;
                        let _ = self
                            .event_tx
                            .try_send(AudioEvent::ControlChange(id, port.control));
                    }
                }
            }
        }

        // Backend-written MIDI inputs were consumed this cycle
        {
            let arena = self.state.ports.get();
            for id in [self.midi_in, self.midi_editor_manual_press] {
                if let Some(port) = arena.get_mut(id) {
                    port.midi_events.clear();
                }
            }
        }

        self.playhead_atomic
            .store(self.transport.playhead.frames.max(0) as u64, Ordering::Relaxed);
        self.frames_since_pos_event += nframes;
        if self.frames_since_pos_event >= self.pos_event_interval {
            self.frames_since_pos_event = 0;
            let seconds = self.transport.playhead.frames as f64 / self.sample_rate as f64;
            let _ = self
                .event_tx
                .try_send(AudioEvent::PlaybackPosition(seconds));
        }
    }

    /// Re-derive every stored frame position from ticks after a tempo or
    /// sample-rate change
    pub fn refresh_project_positions(&mut self) {
        let fpt = self.transport.frames_per_tick;
        let tracklist = self.state.tracklist.get_mut();
        for track in tracklist.iter_mut() {
            for lane in &mut track.lanes {
                for region in &mut lane.regions {
                    refresh_region_positions(region, fpt);
                }
            }
            for at in track.automation.iter_mut() {
                for region in &mut at.regions {
                    refresh_region_positions(region, fpt);
                }
            }
            for marker in &mut track.markers {
                marker.pos.update_frames_from_ticks(fpt);
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        let arena = self.state.ports.get();
        match cmd {
            Command::Play => self.transport.request_roll(),
            Command::Stop => {
                self.transport.request_pause();
                self.transport.set_playhead(0);
            }
            Command::Pause => self.transport.request_pause(),
            Command::Seek(frames) => {
                self.transport.set_playhead(frames);
                self.state.sample_processor.get_mut().flush();
            }
            Command::SetLoopEnabled(on) => self.transport.loop_enabled = on,
            Command::SetPunchEnabled(on) => self.transport.punch_enabled = on,
            Command::SetRecording(on) => self.transport.recording = on,
            Command::SetRecordingMode(mode) => self.transport.recording_mode = mode,
            Command::SetBpm(bpm) => {
                if let Some(port) = arena.get_mut(self.transport.bpm_port) {
                    port.set_control_value(bpm, true);
                }
            }
            Command::SetTimeSignature(beats, unit) => {
                if let Some(port) = arena.get_mut(self.transport.beats_per_bar_port) {
                    port.set_control_value(beats as f32, true);
                }
                if let Some(port) = arena.get_mut(self.transport.beat_unit_port) {
                    port.set_control_value(unit as f32, true);
                }
            }
            Command::SetMetronomeEnabled(on) => {
                self.state.sample_processor.get_mut().metronome.enabled = on;
            }
            Command::SetTrackVolume(track, volume) => {
                self.with_fader_port(track, |f| f.amp_port, volume.clamp(0.0, 2.0));
            }
            Command::SetTrackBalance(track, balance) => {
                self.with_fader_port(track, |f| f.balance_port, balance.clamp(0.0, 1.0));
            }
            Command::SetTrackMute(track, on) => {
                self.with_fader_port(track, |f| f.mute_port, if on { 1.0 } else { 0.0 });
            }
            Command::SetTrackSolo(track, on) => {
                self.with_fader_port(track, |f| f.solo_port, if on { 1.0 } else { 0.0 });
            }
            Command::SetTrackListen(track, on) => {
                self.with_fader_port(track, |f| f.listen_port, if on { 1.0 } else { 0.0 });
            }
            Command::ArmTrack(track, on) => {
                let tracklist = self.state.tracklist.get_mut();
                if let Some(t) = tracklist.track_mut(track) {
                    if t.kind.can_record() {
                        t.armed = on;
                    }
                }
            }
            Command::SetControlValue(port, value) => {
                if let Some(p) = arena.get_mut(port) {
                    p.set_control_value(value, true);
                }
            }
        }
    }

    /// Bind a MIDI CC to a control port (MIDI learn)
    pub fn add_midi_mapping(&mut self, mapping: MidiMapping) {
        self.midi_mappings.retain(|m| {
            !(m.channel == mapping.channel && m.cc == mapping.cc && m.port == mapping.port)
        });
        self.midi_mappings.push(mapping);
    }

    /// Remove every binding for a control port
    pub fn remove_midi_mappings_for_port(&mut self, port: PortId) {
        self.midi_mappings.retain(|m| m.port != port);
    }

    /// Dispatch learned CC bindings against this cycle's hardware MIDI
    fn apply_midi_mappings(&mut self) {
        if self.midi_mappings.is_empty() {
            return;
        }
        let arena = self.state.ports.get();
        let Some(port) = arena.get(self.midi_in) else {
            return;
        };
        for ev in port.midi_events.as_slice() {
            if ev.message_type() != 0xB0 {
                continue;
            }
            for mapping in &self.midi_mappings {
                if mapping.channel != ev.channel() || mapping.cc != ev.data1 {
                    continue;
                }
                if let Some(target) = arena.get_mut(mapping.port) {
                    let value =
                        target.minf + (ev.data2 as f32 / 127.0) * (target.maxf - target.minf);
                    target.set_control_value(value, true);
                }
            }
        }
    }

    fn with_fader_port(&self, track: TrackId, pick: impl Fn(&Fader) -> PortId, value: f32) {
        let tracklist = self.state.tracklist.get();
        let arena = self.state.ports.get();
        if let Some(channel) = tracklist.track(track).and_then(|t| t.channel.as_ref()) {
            if let Some(port) = arena.get_mut(pick(&channel.fader)) {
                port.set_control_value(value, true);
            }
        }
    }

    // ---- engine event handling (buffer size / sample rate) ----

    fn apply_engine_events(&mut self) {
        // Coalesce duplicates, keeping only the newest of each kind
        let mut buffer_change = None;
        let mut rate_change = None;
        while let Ok(ev) = self.engine_event_rx.try_recv() {
            match ev {
                EngineEvent::BufferSizeChange(_) => buffer_change = Some(ev),
                EngineEvent::SampleRateChange(_) => rate_change = Some(ev),
            }
        }
        let had_pending = !self.pending_changes.is_empty();
        if let Some(ev) = rate_change {
            self.pending_changes.push(ev);
        }
        if let Some(ev) = buffer_change {
            self.pending_changes.push(ev);
        }
        if !had_pending && !self.pending_changes.is_empty() {
            let total = (self.sample_rate as f32 * FADE_SECONDS) as u32;
            self.fade = FadePhase::FadingOut { left: total, total };
        }
    }

    fn advance_fade(&mut self, nframes: u32) {
        let next = match &mut self.fade {
            FadePhase::None => None,
            FadePhase::FadingOut { left, total } => {
                if *left > nframes {
                    *left -= nframes;
                    None
                } else {
                    Some(FadePhase::FadingIn {
                        left: *total,
                        total: *total,
                    })
                }
            }
            FadePhase::FadingIn { left, .. } => {
                if *left > nframes {
                    *left -= nframes;
                    None
                } else {
                    Some(FadePhase::None)
                }
            }
        };
        let Some(next) = next else {
            return;
        };
        // Fully faded out: apply pending changes before fading back in
        if matches!(next, FadePhase::FadingIn { .. }) {
            let changes = std::mem::take(&mut self.pending_changes);
            for change in changes {
                self.apply_config_change(change);
            }
        }
        self.fade = next;
    }

    fn current_fade(&self, _nframes: u32) -> Option<(f32, f32)> {
        match &self.fade {
            FadePhase::None => None,
            FadePhase::FadingOut { left, total } => {
                let total_f = *total as f32;
                Some((*left as f32 / total_f, -1.0 / total_f))
            }
            FadePhase::FadingIn { left, total } => {
                let total_f = *total as f32;
                Some((1.0 - *left as f32 / total_f, 1.0 / total_f))
            }
        }
    }

    fn apply_config_change(&mut self, change: EngineEvent) {
        match change {
            EngineEvent::BufferSizeChange(size) => {
                log::info!("engine: buffer size change to {}", size);
                self.block_length = size;
                self.max_block_length = self.max_block_length.max(size);
                self.config.buffer_size = size;
            }
            EngineEvent::SampleRateChange(rate) => {
                log::info!("engine: sample rate change to {}", rate);
                self.sample_rate = rate;
                self.config.sample_rate = rate;
                self.transport.update_frames_per_tick(
                    self.transport.beats_per_bar,
                    self.transport.bpm,
                    rate,
                );
                self.refresh_project_positions();
            }
        }
        self.allocate_all_buffers();
        self.router.rebuild();
    }

    /// Pause processing for a structural change from another thread
    ///
    /// The audio callback observes `run == false` (or the router's setup
    /// flag) and returns silence until `resume` is called.
    pub fn pause_engine(&mut self) {
        self.run = false;
        if self.transport.is_rolling() {
            self.transport.request_pause();
            self.transport.transition();
        }
    }

    /// Resume processing after a structural change
    pub fn resume_engine(&mut self) {
        let total = (self.sample_rate as f32 * FADE_SECONDS) as u32;
        self.fade = FadePhase::FadingIn { left: total, total };
        self.run = true;
    }
}

fn refresh_region_positions(region: &mut crate::audio::region::Region, fpt: f64) {
    for pos in [
        &mut region.start,
        &mut region.end,
        &mut region.clip_start,
        &mut region.loop_start,
        &mut region.loop_end,
        &mut region.fade_in,
        &mut region.fade_out,
    ] {
        pos.update_frames_from_ticks(fpt);
    }
    match &mut region.data {
        RegionData::Midi(data) => {
            for note in &mut data.notes {
                note.pos.update_frames_from_ticks(fpt);
                note.end.update_frames_from_ticks(fpt);
            }
        }
        RegionData::Automation(data) => {
            for point in &mut data.points {
                point.pos.update_frames_from_ticks(fpt);
            }
        }
        RegionData::Chord(data) => {
            for chord in &mut data.chords {
                chord.pos.update_frames_from_ticks(fpt);
            }
        }
        RegionData::Audio(_) => {}
    }
}

/// Convenience for building positions against the engine's transport
impl AudioEngine {
    /// Position at an absolute frame with ticks derived from the tempo map
    pub fn position_at_frame(&self, frame: i64) -> Position {
        Position::from_frames(frame, self.transport.frames_per_tick)
    }
}
