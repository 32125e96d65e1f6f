use crate::audio::engine::EngineState;
use crate::audio::graph::TimeInfo;
use crate::audio::midi::MidiEvent;
use crate::audio::pool::{AudioClip, ClipFrames, PoolId};
use crate::audio::position::Position;
use crate::audio::region::{
    AudioRegionData, AutomationRegionData, ChordRegionData, MidiNote, MidiRegionData, Region,
    RegionData, RegionId,
};
use crate::audio::track::{TrackId, TrackKind};
use crate::audio::transport::{RecordingMode, Transport};
use crate::command::AudioEvent;
use crate::io::audio_file::BitDepth;
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Preallocated recording events; the producer drops when exhausted
pub const RECORDING_EVENT_POOL_SIZE: usize = 256;

/// Wall-clock interval between chunked pool writes of a growing clip
pub const CLIP_WRITE_INTERVAL: Duration = Duration::from_secs(2);

/// Recording event variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingEventType {
    StartTrackRecording,
    StartAutomationRecording,
    Midi,
    Audio,
    Automation,
    PauseTrackRecording,
    PauseAutomationRecording,
    StopTrackRecording,
    StopAutomationRecording,
}

/// Fixed-size event passed from the audio thread to the consumer
///
/// Events are only ever drawn from the preallocated pool; the audio buffers
/// are sized to the maximum block length at startup so no allocation ever
/// happens on the audio thread.
pub struct RecordingEvent {
    pub kind: RecordingEventType,
    pub track: TrackId,
    pub automation_index: usize,
    pub g_start_frame: i64,
    pub local_offset: u32,
    pub nframes: u32,
    pub has_midi_event: bool,
    pub midi_event: MidiEvent,
    pub lbuf: Vec<f32>,
    pub rbuf: Vec<f32>,
    /// Port value captured at produce time (automation events)
    pub automation_value: f32,
}

impl RecordingEvent {
    fn new(max_block_length: usize) -> Self {
        Self {
            kind: RecordingEventType::Midi,
            track: 0,
            automation_index: 0,
            g_start_frame: 0,
            local_offset: 0,
            nframes: 0,
            has_midi_event: false,
            midi_event: MidiEvent::new(0, 0, 0, 0),
            lbuf: vec![0.0; max_block_length],
            rbuf: vec![0.0; max_block_length],
            automation_value: 0.0,
        }
    }
}

/// Undoable outcome of one recording session
#[derive(Debug, Clone)]
pub struct RecordedAction {
    /// Region ids that existed on the affected tracks before recording
    pub prior_regions: Vec<(TrackId, RegionId)>,
    /// Regions created by this session
    pub new_regions: Vec<(TrackId, RegionId)>,
    /// Pool clips created by this session
    pub new_clips: Vec<PoolId>,
}

/// Producer half: lives on the audio thread inside the engine
pub struct RecordingProducer {
    pool_rx: Receiver<Box<RecordingEvent>>,
    queue_tx: Sender<Box<RecordingEvent>>,
    dropped: usize,
}

impl RecordingProducer {
    fn take_event(&mut self) -> Option<Box<RecordingEvent>> {
        match self.pool_rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(_) => {
                self.dropped += 1;
                None
            }
        }
    }

    fn send(&mut self, ev: Box<RecordingEvent>) {
        if self.queue_tx.try_send(ev).is_err() {
            self.dropped += 1;
        }
    }

    /// Events dropped because the pool or queue was exhausted
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Produce recording events for one processed sub-cycle
    ///
    /// Called on the audio thread after the graph ran, while no worker is
    /// active. `nframes == 0` marks a pause frame.
    pub fn handle_recording(
        &mut self,
        state: &EngineState,
        transport: &Transport,
        time: &TimeInfo,
    ) {
        let now = Instant::now();
        let tracklist = state.tracklist.get_mut();
        let arena = state.ports.get();

        for track in tracklist.iter_mut() {
            if !track.kind.can_record() {
                continue;
            }
            let armed = transport.recording && track.armed;
            let active = track.recording_region.is_some() || track.recording_start_sent;

            if !armed {
                if active && !track.recording_stop_sent {
                    track.recording_stop_sent = true;
                    if let Some(mut ev) = self.take_event() {
                        ev.kind = RecordingEventType::StopTrackRecording;
                        ev.track = track.id;
                        ev.g_start_frame = time.g_start_w_offset;
                        ev.local_offset = time.local_offset;
                        ev.nframes = 0;
                        self.send(ev);
                    }
                }
            } else if time.nframes == 0 {
                // Pause frame
                if active && !track.recording_paused {
                    if let Some(mut ev) = self.take_event() {
                        ev.kind = RecordingEventType::PauseTrackRecording;
                        ev.track = track.id;
                        ev.g_start_frame = time.g_start_w_offset;
                        ev.local_offset = time.local_offset;
                        ev.nframes = 0;
                        self.send(ev);
                    }
                }
            } else if transport.is_rolling() {
                // Clamp the recorded window to the punch range
                let win_start = time.g_start_w_offset;
                let win_end = win_start + time.nframes as i64;
                let (rec_start, rec_end) = if transport.punch_enabled {
                    (
                        win_start.max(transport.punch_start.frames),
                        win_end.min(transport.punch_end.frames),
                    )
                } else {
                    (win_start, win_end)
                };
                if rec_start >= rec_end {
                    continue;
                }
                let rec_offset = time.local_offset + (rec_start - win_start) as u32;
                let rec_frames = (rec_end - rec_start) as u32;

                if track.recording_region.is_none() && !track.recording_start_sent {
                    track.recording_start_sent = true;
                    track.recording_stop_sent = false;
                    if let Some(mut ev) = self.take_event() {
                        ev.kind = RecordingEventType::StartTrackRecording;
                        ev.track = track.id;
                        ev.g_start_frame = rec_start;
                        ev.local_offset = rec_offset;
                        ev.nframes = rec_frames;
                        self.send(ev);
                    }
                }

                if track.kind == TrackKind::Audio {
                    if let Some(mut ev) = self.take_event() {
                        ev.kind = RecordingEventType::Audio;
                        ev.track = track.id;
                        ev.g_start_frame = rec_start;
                        ev.local_offset = rec_offset;
                        ev.nframes = rec_frames;
                        if let Some(sin) = track.processor.stereo_in {
                            if let (Some(l), Some(r)) = (arena.get(sin.l), arena.get(sin.r)) {
                                let s = rec_offset as usize;
                                let n = (s + rec_frames as usize).min(l.buf.len());
                                ev.lbuf[..n.saturating_sub(s)]
                                    .copy_from_slice(&l.buf[s..n]);
                                ev.rbuf[..n.saturating_sub(s)]
                                    .copy_from_slice(&r.buf[s..n]);
                            }
                        }
                        self.send(ev);
                    }
                } else {
                    // One event per incoming MIDI message, or one empty
                    // marker so the region keeps growing
                    let mut sent_any = false;
                    if let Some(port) = track.processor.midi_in.and_then(|p| arena.get(p)) {
                        for midi_ev in port.midi_events.as_slice() {
                            let abs = win_start
                                + midi_ev.time.saturating_sub(time.local_offset) as i64;
                            if abs < rec_start || abs >= rec_end {
                                continue;
                            }
                            sent_any = true;
                            if let Some(mut ev) = self.take_event() {
                                ev.kind = RecordingEventType::Midi;
                                ev.track = track.id;
                                ev.g_start_frame = rec_start;
                                ev.local_offset = rec_offset;
                                ev.nframes = rec_frames;
                                ev.has_midi_event = true;
                                ev.midi_event = *midi_ev;
                                self.send(ev);
                            }
                        }
                    }
                    if !sent_any {
                        if let Some(mut ev) = self.take_event() {
                            ev.kind = RecordingEventType::Midi;
                            ev.track = track.id;
                            ev.g_start_frame = rec_start;
                            ev.local_offset = rec_offset;
                            ev.nframes = rec_frames;
                            ev.has_midi_event = false;
                            self.send(ev);
                        }
                    }
                }
            }

            // Automation lanes
            for at_index in 0..track.automation.len() {
                let Some(at) = track.automation.get_mut(at_index) else {
                    continue;
                };
                let Some(port) = arena.get(at.port) else {
                    continue;
                };
                // The knob moved this cycle
                if port.control_change_pending {
                    at.touch(now);
                }

                let should = transport.recording
                    && transport.is_rolling()
                    && at.should_be_recording(now);
                let at_active = at.recording_region.is_some() || at.recording_start_sent;

                if should && time.nframes > 0 {
                    if !at.recording_start_sent {
                        at.recording_start_sent = true;
                        at.recording_started = true;
                        if let Some(mut ev) = self.take_event() {
                            ev.kind = RecordingEventType::StartAutomationRecording;
                            ev.track = track.id;
                            ev.automation_index = at_index;
                            ev.g_start_frame = time.g_start_w_offset;
                            ev.local_offset = time.local_offset;
                            ev.nframes = time.nframes;
                            self.send(ev);
                        }
                    }
                    if let Some(mut ev) = self.take_event() {
                        ev.kind = RecordingEventType::Automation;
                        ev.track = track.id;
                        ev.automation_index = at_index;
                        ev.g_start_frame = time.g_start_w_offset;
                        ev.local_offset = time.local_offset;
                        ev.nframes = time.nframes;
                        ev.automation_value = port.control;
                        self.send(ev);
                    }
                } else if at_active && time.nframes == 0 {
                    if let Some(mut ev) = self.take_event() {
                        ev.kind = RecordingEventType::PauseAutomationRecording;
                        ev.track = track.id;
                        ev.automation_index = at_index;
                        ev.g_start_frame = time.g_start_w_offset;
                        ev.local_offset = 0;
                        ev.nframes = 0;
                        self.send(ev);
                    }
                } else if at.recording_start_sent && !should && !transport.recording {
                    // One stop per session; the consumer clears the rest
                    at.recording_started = false;
                    at.recording_start_sent = false;
                    if let Some(mut ev) = self.take_event() {
                        ev.kind = RecordingEventType::StopAutomationRecording;
                        ev.track = track.id;
                        ev.automation_index = at_index;
                        ev.g_start_frame = time.g_start_w_offset;
                        ev.local_offset = 0;
                        ev.nframes = 0;
                        self.send(ev);
                    }
                }
            }
        }
    }
}

/// Per-track consumer bookkeeping
struct TrackRecState {
    /// Lane the current take records into
    lane: usize,
    /// Growing sample data for audio takes
    audio_l: Vec<f32>,
    audio_r: Vec<f32>,
    /// Pool clip backing the current audio take
    clip: Option<PoolId>,
    last_chunk_write: Instant,
}

impl TrackRecState {
    fn new() -> Self {
        Self {
            lane: 0,
            audio_l: Vec::new(),
            audio_r: Vec::new(),
            clip: None,
            last_chunk_write: Instant::now(),
        }
    }
}

/// Consumer half: turns queued cycle fragments into regions, notes, clips
/// and automation points
///
/// Runs on the UI thread (driven roughly every 12 ms); it mutates project
/// structures, so the embedder must drive it from the same thread that owns
/// structural changes, between engine cycles.
pub struct RecordingManager {
    state: Arc<EngineState>,
    queue_rx: Receiver<Box<RecordingEvent>>,
    pool_tx: Sender<Box<RecordingEvent>>,
    event_tx: Sender<AudioEvent>,

    track_states: HashMap<TrackId, TrackRecState>,
    /// Snapshot of pre-recording region ids, taken at the first start
    snapshot: Option<Vec<(TrackId, RegionId)>>,
    recorded_ids: Vec<(TrackId, RegionId)>,
    new_clips: Vec<PoolId>,
    num_active: usize,
}

/// Create the producer/consumer pair with a preallocated event pool
pub fn recording_channels(
    state: Arc<EngineState>,
    max_block_length: usize,
    event_tx: Sender<AudioEvent>,
) -> (RecordingProducer, RecordingManager) {
    let (pool_tx, pool_rx) = crossbeam_channel::bounded(RECORDING_EVENT_POOL_SIZE);
    let (queue_tx, queue_rx) = crossbeam_channel::bounded(RECORDING_EVENT_POOL_SIZE);
    for _ in 0..RECORDING_EVENT_POOL_SIZE {
        let _ = pool_tx.send(Box::new(RecordingEvent::new(max_block_length)));
    }
    (
        RecordingProducer {
            pool_rx,
            queue_tx,
            dropped: 0,
        },
        RecordingManager {
            state,
            queue_rx,
            pool_tx,
            event_tx,
            track_states: HashMap::new(),
            snapshot: None,
            recorded_ids: Vec::new(),
            new_clips: Vec::new(),
            num_active: 0,
        },
    )
}

impl RecordingManager {
    /// Drain and apply all queued recording events
    ///
    /// Returns the number of events processed. `transport` is borrowed so a
    /// finished session can disarm the record button.
    pub fn process_events(&mut self, transport: &mut Transport) -> usize {
        let mut processed = 0;
        while let Ok(ev) = self.queue_rx.try_recv() {
            self.handle_event(&ev, transport);
            processed += 1;
            let _ = self.pool_tx.send(ev);
        }
        processed
    }

    fn handle_event(&mut self, ev: &RecordingEvent, transport: &mut Transport) {
        match ev.kind {
            RecordingEventType::StartTrackRecording => self.on_start_track(ev, transport),
            RecordingEventType::Midi => self.on_midi(ev, transport),
            RecordingEventType::Audio => self.on_audio(ev, transport),
            RecordingEventType::Automation => self.on_automation(ev, transport),
            RecordingEventType::PauseTrackRecording => self.on_pause_track(ev, transport),
            RecordingEventType::StopTrackRecording => self.on_stop_track(ev, transport),
            RecordingEventType::StartAutomationRecording => {
                self.num_active += 1;
                self.on_automation_region(ev, transport);
            }
            RecordingEventType::PauseAutomationRecording => {
                let tracklist = self.state.tracklist.get_mut();
                if let Some(at) = tracklist
                    .track_mut(ev.track)
                    .and_then(|t| t.automation.get_mut(ev.automation_index))
                {
                    at.recording_paused = true;
                }
            }
            RecordingEventType::StopAutomationRecording => {
                let tracklist = self.state.tracklist.get_mut();
                if let Some(at) = tracklist
                    .track_mut(ev.track)
                    .and_then(|t| t.automation.get_mut(ev.automation_index))
                {
                    at.clear_recording_state();
                }
                self.finish_one(transport);
            }
        }
    }

    /// Take the pre-recording snapshot on the first active recording
    fn ensure_snapshot(&mut self) {
        if self.snapshot.is_some() {
            return;
        }
        let tracklist = self.state.tracklist.get();
        let mut prior = Vec::new();
        for track in tracklist.iter() {
            for lane in &track.lanes {
                for region in &lane.regions {
                    prior.push((track.id, region.id));
                }
            }
            for at in track.automation.iter() {
                for region in &at.regions {
                    prior.push((track.id, region.id));
                }
            }
        }
        self.snapshot = Some(prior);
    }

    fn on_start_track(&mut self, ev: &RecordingEvent, transport: &mut Transport) {
        self.ensure_snapshot();
        self.num_active += 1;
        let mode = transport.recording_mode;

        let tracklist = self.state.tracklist.get_mut();
        let Some(track) = tracklist.track_mut(ev.track) else {
            return;
        };
        track.recording_paused = false;

        // Overdub modes record into an existing region under the playhead
        if matches!(
            mode,
            RecordingMode::OverwriteEvents | RecordingMode::MergeEvents
        ) && track.kind != TrackKind::Audio
        {
            let hit = track
                .lanes
                .iter()
                .flat_map(|l| l.regions.iter())
                .find(|r| {
                    !r.muted
                        && ev.g_start_frame >= r.start.frames
                        && ev.g_start_frame < r.end.frames
                })
                .map(|r| (r.id, r.lane));
            if let Some((region_id, lane)) = hit {
                track.recording_region = Some(region_id);
                let state = self
                    .track_states
                    .entry(ev.track)
                    .or_insert_with(TrackRecState::new);
                state.lane = lane;
                return;
            }
        }

        // Fresh region on the first lane free at this position
        let lane = free_lane_at(track, ev.g_start_frame);
        self.start_new_region(ev.track, lane, ev, transport);
    }

    /// Create a new recording region (and clip for audio) on the given lane
    fn start_new_region(
        &mut self,
        track_id: TrackId,
        lane: usize,
        ev: &RecordingEvent,
        transport: &Transport,
    ) {
        let fpt = transport.frames_per_tick;
        let region_id = self.state.allocate_region_id();
        let start = Position::from_frames(ev.g_start_frame, fpt);
        let end = Position::from_frames(ev.g_start_frame + ev.nframes as i64, fpt);

        let tracklist = self.state.tracklist.get_mut();
        let Some(track) = tracklist.track_mut(track_id) else {
            return;
        };
        track.ensure_lanes(lane + 1);

        let state = self
            .track_states
            .entry(track_id)
            .or_insert_with(TrackRecState::new);
        state.lane = lane;

        let (name, data) = match track.kind {
            TrackKind::Audio => {
                state.audio_l.clear();
                state.audio_r.clear();
                state.last_chunk_write = Instant::now();

                let clip = AudioClip::from_float_array(
                    format!("{} - recording", track.name),
                    Vec::new(),
                    2,
                    transport.sample_rate,
                    transport.bpm,
                    BitDepth::B32,
                );
                let pool = self.state.pool.get_mut();
                let pool_id = pool.add_clip(clip);
                state.clip = Some(pool_id);
                self.new_clips.push(pool_id);
                let frames = Arc::clone(&pool.get_clip(pool_id).expect("just added").frames);
                (
                    pool.get_clip(pool_id).expect("just added").name.clone(),
                    RegionData::Audio(AudioRegionData {
                        clip: frames,
                        pool_id,
                        gain: 1.0,
                        musical_mode: false,
                        clip_bpm: transport.bpm,
                    }),
                )
            }
            TrackKind::Chord => (
                format!("{} - take", track.name),
                RegionData::Chord(ChordRegionData::default()),
            ),
            _ => (
                format!("{} - take", track.name),
                RegionData::Midi(MidiRegionData::default()),
            ),
        };

        let region = Region::new(region_id, name, track_id, lane, start, end, data);
        track.lanes[lane].add_region(region);
        track.recording_region = Some(region_id);
        self.recorded_ids.push((track_id, region_id));
    }

    /// Takes-mode handling after a pause: mute/land on a new lane
    fn roll_over_take(&mut self, ev: &RecordingEvent, transport: &Transport) {
        let mode = transport.recording_mode;
        let (old_lane, old_region, is_audio) = {
            let tracklist = self.state.tracklist.get_mut();
            let Some(track) = tracklist.track_mut(ev.track) else {
                return;
            };
            track.recording_paused = false;
            let is_audio = track.kind == TrackKind::Audio;
            let state = self
                .track_states
                .entry(ev.track)
                .or_insert_with(TrackRecState::new);
            (state.lane, track.recording_region, is_audio)
        };

        // Resuming lands on a new lane for takes modes, always for audio
        let new_take =
            matches!(mode, RecordingMode::Takes | RecordingMode::TakesMuted) || is_audio;
        if !new_take {
            return;
        }

        let mute_previous = mode == RecordingMode::TakesMuted
            || (mode == RecordingMode::OverwriteEvents && is_audio);
        if mute_previous {
            let tracklist = self.state.tracklist.get_mut();
            if let Some(region) = old_region
                .and_then(|id| tracklist.track_mut(ev.track).and_then(|t| t.region_mut(id)))
            {
                region.muted = true;
            }
        }
        self.start_new_region(ev.track, old_lane + 1, ev, transport);
    }

    fn on_midi(&mut self, ev: &RecordingEvent, transport: &mut Transport) {
        let paused = {
            let tracklist = self.state.tracklist.get();
            tracklist
                .track(ev.track)
                .map(|t| t.recording_paused)
                .unwrap_or(false)
        };
        if paused {
            self.roll_over_take(ev, transport);
        }

        let fpt = transport.frames_per_tick;
        let mode = transport.recording_mode;
        let end_frame = ev.g_start_frame + ev.nframes as i64;

        let tracklist = self.state.tracklist.get_mut();
        let Some(track) = tracklist.track_mut(ev.track) else {
            return;
        };
        let Some(region_id) = track.recording_region else {
            return;
        };

        // Overwrite clears every note under the recorded window, in any
        // region of this track
        if mode == RecordingMode::OverwriteEvents {
            let win_start = ev.g_start_frame;
            for lane in track.lanes.iter_mut() {
                for region in lane.regions.iter_mut() {
                    let rs = region.start.frames;
                    if let Some(data) = region.midi_mut() {
                        // Notes still being recorded are never overwritten
                        data.notes.retain(|n| {
                            let abs_start = rs + n.pos.frames;
                            let abs_end = rs + n.end.frames;
                            !n.ended || abs_end <= win_start || abs_start >= end_frame
                        });
                    }
                }
            }
        }

        let Some(region) = track.region_mut(region_id) else {
            return;
        };
        region.grow_to(Position::from_frames(end_frame.max(region.end.frames), fpt));

        if ev.has_midi_event {
            let midi = ev.midi_event;
            let abs_frame =
                ev.g_start_frame + (midi.time.saturating_sub(ev.local_offset)) as i64;
            let local = abs_frame - region.start.frames;
            let pos = Position::from_frames(local.max(0), fpt);
            if let Some(data) = region.midi_mut() {
                if midi.is_note_on() {
                    data.notes.push(MidiNote::unended(midi.data1, midi.data2, pos));
                } else if midi.is_note_off() {
                    if let Some(note) = data
                        .notes
                        .iter_mut()
                        .rev()
                        .find(|n| !n.ended && n.pitch == midi.data1)
                    {
                        note.end = pos;
                        note.ended = true;
                    }
                }
            }
        }
    }

    fn on_audio(&mut self, ev: &RecordingEvent, transport: &mut Transport) {
        let paused = {
            let tracklist = self.state.tracklist.get();
            tracklist
                .track(ev.track)
                .map(|t| t.recording_paused)
                .unwrap_or(false)
        };
        if paused {
            self.roll_over_take(ev, transport);
        }

        let fpt = transport.frames_per_tick;
        let end_frame = ev.g_start_frame + ev.nframes as i64;

        // Grow the take buffers
        let Some(state) = self.track_states.get_mut(&ev.track) else {
            return;
        };
        let n = ev.nframes as usize;
        state.audio_l.extend_from_slice(&ev.lbuf[..n.min(ev.lbuf.len())]);
        state.audio_r.extend_from_slice(&ev.rbuf[..n.min(ev.rbuf.len())]);
        let Some(pool_id) = state.clip else {
            return;
        };
        let chunk_due = state.last_chunk_write.elapsed() >= CLIP_WRITE_INTERVAL;

        // Refresh the clip frames and region length
        let frames = interleave(&state.audio_l, &state.audio_r);
        let sample_rate = transport.sample_rate;
        let new_frames = {
            let pool = self.state.pool.get_mut();
            let Some(clip) = pool.get_clip_mut(pool_id) else {
                return;
            };
            clip.set_frames(Arc::new(ClipFrames::from_interleaved(frames, 2, sample_rate)));
            Arc::clone(&clip.frames)
        };

        let duration_secs = new_frames.num_frames as f64 / sample_rate as f64;
        let region_for_event = {
            let tracklist = self.state.tracklist.get_mut();
            let Some(track) = tracklist.track_mut(ev.track) else {
                return;
            };
            let Some(region_id) = track.recording_region else {
                return;
            };
            if let Some(region) = track.region_mut(region_id) {
                region.grow_to(Position::from_frames(end_frame, fpt));
                if let RegionData::Audio(data) = &mut region.data {
                    data.clip = new_frames;
                }
            }
            region_id
        };

        if chunk_due {
            state.last_chunk_write = Instant::now();
            let pool = self.state.pool.get_mut();
            if let Err(e) = pool.write_clip(pool_id, true, false) {
                log::error!("recording: chunked clip write failed: {}", e);
                let _ = self
                    .event_tx
                    .try_send(AudioEvent::RecordingError(e.to_string()));
            }
        }
        let _ = self.event_tx.try_send(AudioEvent::RecordingProgress(
            ev.track,
            region_for_event,
            duration_secs,
        ));
    }

    fn on_automation_region(&mut self, ev: &RecordingEvent, transport: &mut Transport) {
        let fpt = transport.frames_per_tick;
        let region_id = self.state.allocate_region_id();
        let tracklist = self.state.tracklist.get_mut();
        let Some(track) = tracklist.track_mut(ev.track) else {
            return;
        };
        let track_id = track.id;
        let Some(at) = track.automation.get_mut(ev.automation_index) else {
            return;
        };
        if at.recording_region.is_some() {
            return;
        }
        let start = Position::from_frames(ev.g_start_frame, fpt);
        let end = Position::from_frames(ev.g_start_frame + ev.nframes.max(1) as i64, fpt);
        let region = Region::new(
            region_id,
            "Automation - take",
            track_id,
            at.index,
            start,
            end,
            RegionData::Automation(AutomationRegionData::default()),
        );
        at.regions.push(region);
        at.recording_region = Some(region_id);
        at.recording_paused = false;
        self.recorded_ids.push((track_id, region_id));
    }

    fn on_automation(&mut self, ev: &RecordingEvent, transport: &mut Transport) {
        use crate::audio::automation::{insert_point, AutomationPoint, AutomationRecordMode, CurveType};

        let fpt = transport.frames_per_tick;
        let tracklist = self.state.tracklist.get_mut();
        let arena = self.state.ports.get();
        let Some(track) = tracklist.track_mut(ev.track) else {
            return;
        };
        let Some(at) = track.automation.get_mut(ev.automation_index) else {
            return;
        };
        let Some(region_id) = at.recording_region else {
            return;
        };
        let latch = at.record_mode == AutomationRecordMode::Latch;
        let value = ev.automation_value;
        let changed = (value - at.last_recorded_value).abs() > f32::EPSILON;

        let normalized = arena
            .get(at.port)
            .map(|p| {
                if p.maxf > p.minf {
                    (value - p.minf) / (p.maxf - p.minf)
                } else {
                    0.0
                }
            })
            .unwrap_or(value);

        let end_frame = ev.g_start_frame + ev.nframes as i64;
        let last_ap_ticks = at.last_recorded_ap_ticks;
        let Some(region) = at.region_mut(region_id) else {
            return;
        };
        region.grow_to(Position::from_frames(end_frame, fpt));
        let local_ticks = (ev.g_start_frame - region.start.frames).max(0) as f64 / fpt;

        if changed || latch {
            if let Some(data) = region.automation_mut() {
                // Points written between the last recorded one and now are
                // superseded by the live value
                if let Some(last) = last_ap_ticks {
                    data.points
                        .retain(|p| p.pos.ticks <= last || p.pos.ticks > local_ticks);
                }
                insert_point(
                    &mut data.points,
                    AutomationPoint::new(
                        Position::from_ticks(local_ticks, fpt),
                        normalized,
                        CurveType::Linear,
                    ),
                );
            }
            at.last_recorded_value = value;
            at.last_recorded_ap_ticks = Some(local_ticks);
        }
    }

    fn on_pause_track(&mut self, ev: &RecordingEvent, transport: &mut Transport) {
        let fpt = transport.frames_per_tick;
        let tracklist = self.state.tracklist.get_mut();
        let Some(track) = tracklist.track_mut(ev.track) else {
            return;
        };
        track.recording_paused = true;

        // Close any unended notes at the pause position
        if let Some(region) = track
            .recording_region
            .and_then(|id| track.region_mut(id))
        {
            let local = (ev.g_start_frame - region.start.frames).max(0);
            let pos = Position::from_frames(local, fpt);
            if let Some(data) = region.midi_mut() {
                for note in data.notes.iter_mut().filter(|n| !n.ended) {
                    note.end = pos;
                    note.ended = true;
                }
            }
        }
    }

    fn on_stop_track(&mut self, ev: &RecordingEvent, transport: &mut Transport) {
        {
            let tracklist = self.state.tracklist.get_mut();
            if let Some(track) = tracklist.track_mut(ev.track) {
                // Close unended notes at the region end
                if let Some(region) = track
                    .recording_region
                    .and_then(|id| track.region_mut(id))
                {
                    let end = Position {
                        frames: region.length_frames(),
                        ticks: region.end.ticks - region.start.ticks,
                    };
                    if let Some(data) = region.midi_mut() {
                        for note in data.notes.iter_mut().filter(|n| !n.ended) {
                            note.end = end;
                            note.ended = true;
                        }
                    }
                }
                track.recording_region = None;
                track.recording_start_sent = false;
                track.recording_paused = false;
            }
        }
        self.finish_one(transport);
    }

    /// Book one finished recording; when the last one closes, flush clips
    /// and publish the undoable action
    fn finish_one(&mut self, transport: &mut Transport) {
        self.num_active = self.num_active.saturating_sub(1);
        if self.num_active > 0 {
            return;
        }

        // Flush every new clip fully to the pool
        let clips = std::mem::take(&mut self.new_clips);
        {
            let pool = self.state.pool.get_mut();
            for id in &clips {
                if let Err(e) = pool.write_clip(*id, false, false) {
                    log::error!("recording: final clip write failed: {}", e);
                    let _ = self
                        .event_tx
                        .try_send(AudioEvent::RecordingError(e.to_string()));
                }
            }
        }

        let action = RecordedAction {
            prior_regions: self.snapshot.take().unwrap_or_default(),
            new_regions: std::mem::take(&mut self.recorded_ids),
            new_clips: clips,
        };
        self.track_states.clear();
        transport.recording = false;
        let _ = self
            .event_tx
            .try_send(AudioEvent::RecordingFinished(action));
    }
}

/// Lowest lane index with no region overlapping the given frame
fn free_lane_at(track: &crate::audio::track::Track, frame: i64) -> usize {
    for (i, lane) in track.lanes.iter().enumerate() {
        let occupied = lane
            .regions
            .iter()
            .any(|r| frame >= r.start.frames && frame < r.end.frames);
        if !occupied {
            return i;
        }
    }
    track.lanes.len()
}

/// Interleave two channel buffers
fn interleave(l: &[f32], r: &[f32]) -> Vec<f32> {
    let frames = l.len().min(r.len());
    let mut out = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        out.push(l[i]);
        out.push(r[i]);
    }
    out
}
