use crate::audio::port::{
    Port, PortArena, PortId, PortOwner, TransportRole,
};
use crate::audio::position::{Position, TICKS_PER_QUARTER_NOTE};
use serde::{Deserialize, Serialize};

/// Play state with explicit request -> transition semantics
///
/// Requests are made from any thread; the transition happens at the start of
/// an audio cycle so state never changes mid-window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Rolling,
    Paused,
    RollRequested,
    PauseRequested,
}

/// What recording does to overlapping material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingMode {
    /// Delete events under the newly recorded range
    OverwriteEvents,
    /// Merge new events into the existing region
    MergeEvents,
    /// Each resumed take lands on a new lane
    Takes,
    /// New takes mute the previous take's region
    TakesMuted,
}

/// The transport: playhead, ranges, tempo map and roll state
pub struct Transport {
    pub sample_rate: u32,
    pub beats_per_bar: u32,
    /// Time signature denominator
    pub beat_unit: u32,
    pub bpm: f32,
    pub frames_per_tick: f64,
    pub ticks_per_frame: f64,

    pub playhead: Position,
    pub loop_start: Position,
    pub loop_end: Position,
    pub punch_start: Position,
    pub punch_end: Position,

    pub play_state: PlayState,
    pub loop_enabled: bool,
    pub punch_enabled: bool,

    /// Master record arm
    pub recording: bool,
    pub recording_mode: RecordingMode,

    /// Bars of metronome count-in before the playhead starts moving
    pub count_in_bars: u32,
    /// Bars of playback before the punch-in point when recording
    pub preroll_bars: u32,
    pub count_in_frames_remaining: u32,
    pub preroll_frames_remaining: u32,

    /// Exposed control ports for hardware transport mappings
    pub roll_port: PortId,
    pub stop_port: PortId,
    pub backward_port: PortId,
    pub forward_port: PortId,
    pub loop_toggle_port: PortId,
    pub rec_toggle_port: PortId,

    /// Automatable tempo/time-signature controls; a summed change triggers
    /// `update_frames_per_tick` after the cycle
    pub bpm_port: PortId,
    pub beats_per_bar_port: PortId,
    pub beat_unit_port: PortId,
}

impl Transport {
    /// Create the transport and its exposed control ports
    pub fn new(sample_rate: u32, arena: &mut PortArena) -> Self {
        let mut port_for = |label: &str, index: u32, role: TransportRole| {
            let mut port = Port::control(PortOwner::Transport, index, label, 0.0, 1.0, 0.0);
            port.flags.toggle = true;
            port.transport_role = Some(role);
            port.set_exposed_to_backend(true);
            arena.insert(port)
        };
        let roll_port = port_for("Roll", 0, TransportRole::Roll);
        let stop_port = port_for("Stop", 1, TransportRole::Stop);
        let backward_port = port_for("Backward", 2, TransportRole::Backward);
        let forward_port = port_for("Forward", 3, TransportRole::Forward);
        let loop_toggle_port = port_for("Loop Toggle", 4, TransportRole::LoopToggle);
        let rec_toggle_port = port_for("Record Toggle", 5, TransportRole::RecToggle);

        let mut bpm = Port::control(PortOwner::Transport, 6, "BPM", 20.0, 999.0, 120.0);
        bpm.flags.bpm = true;
        bpm.flags.automatable = true;
        let bpm_port = arena.insert(bpm);
        let mut bpb = Port::control(PortOwner::Transport, 7, "Beats per Bar", 1.0, 16.0, 4.0);
        bpb.flags.beats_per_bar = true;
        let beats_per_bar_port = arena.insert(bpb);
        let mut bu = Port::control(PortOwner::Transport, 8, "Beat Unit", 1.0, 16.0, 4.0);
        bu.flags.beat_unit = true;
        let beat_unit_port = arena.insert(bu);

        let mut transport = Self {
            sample_rate,
            beats_per_bar: 4,
            beat_unit: 4,
            bpm: 120.0,
            frames_per_tick: 0.0,
            ticks_per_frame: 0.0,
            playhead: Position::zero(),
            loop_start: Position::zero(),
            loop_end: Position::zero(),
            punch_start: Position::zero(),
            punch_end: Position::zero(),
            play_state: PlayState::Paused,
            loop_enabled: false,
            punch_enabled: false,
            recording: false,
            recording_mode: RecordingMode::Takes,
            count_in_bars: 0,
            preroll_bars: 0,
            count_in_frames_remaining: 0,
            preroll_frames_remaining: 0,
            roll_port,
            stop_port,
            backward_port,
            forward_port,
            loop_toggle_port,
            rec_toggle_port,
            bpm_port,
            beats_per_bar_port,
            beat_unit_port,
        };
        transport.update_frames_per_tick(4, 120.0, sample_rate);
        // Default loop: bars 1..5
        transport.loop_end = Position::from_ticks(
            transport.ticks_per_bar() * 4.0,
            transport.frames_per_tick,
        );
        transport
    }

    /// Ticks in one beat for the current time signature
    pub fn ticks_per_beat(&self) -> f64 {
        TICKS_PER_QUARTER_NOTE as f64 * 4.0 / self.beat_unit as f64
    }

    /// Ticks in one bar for the current time signature
    pub fn ticks_per_bar(&self) -> f64 {
        self.ticks_per_beat() * self.beats_per_bar as f64
    }

    /// Frames in one beat
    pub fn frames_per_beat(&self) -> i64 {
        (self.ticks_per_beat() * self.frames_per_tick) as i64
    }

    /// Frames in one bar
    pub fn frames_per_bar(&self) -> i64 {
        (self.ticks_per_bar() * self.frames_per_tick) as i64
    }

    /// Recompute the tick/frame conversion factors
    ///
    /// Every stored position's frames must be re-derived from ticks after
    /// this; the engine walks the project and calls
    /// `Position::update_frames_from_ticks` on each.
    pub fn update_frames_per_tick(&mut self, beats_per_bar: u32, bpm: f32, sample_rate: u32) {
        self.beats_per_bar = beats_per_bar.max(1);
        self.bpm = bpm.clamp(20.0, 999.0);
        self.sample_rate = sample_rate;
        self.frames_per_tick = (sample_rate as f64 * 60.0 * self.beats_per_bar as f64)
            / (self.bpm as f64 * self.ticks_per_bar());
        self.ticks_per_frame = 1.0 / self.frames_per_tick;

        for pos in [
            &mut self.playhead,
            &mut self.loop_start,
            &mut self.loop_end,
            &mut self.punch_start,
            &mut self.punch_end,
        ] {
            pos.update_frames_from_ticks(self.frames_per_tick);
        }
    }

    /// Whether the playhead is advancing this cycle
    pub fn is_rolling(&self) -> bool {
        self.play_state == PlayState::Rolling
    }

    /// Request a transition to rolling; takes effect at the next cycle
    pub fn request_roll(&mut self) {
        if self.play_state == PlayState::Rolling {
            return;
        }
        self.play_state = PlayState::RollRequested;
        if self.count_in_bars > 0 {
            self.count_in_frames_remaining =
                (self.count_in_bars as i64 * self.frames_per_bar()) as u32;
        }
        if self.recording && self.preroll_bars > 0 {
            let preroll = self.preroll_bars as i64 * self.frames_per_bar();
            let target = if self.punch_enabled {
                self.punch_start.frames
            } else {
                self.playhead.frames
            };
            let start = (target - preroll).max(0);
            self.preroll_frames_remaining = (target - start) as u32;
            self.playhead = Position::from_frames(start, self.frames_per_tick);
        }
    }

    /// Request a pause; takes effect at the next cycle
    pub fn request_pause(&mut self) {
        if self.play_state == PlayState::Paused {
            return;
        }
        self.play_state = PlayState::PauseRequested;
    }

    /// Apply pending state requests at the top of a cycle
    pub fn transition(&mut self) {
        match self.play_state {
            PlayState::RollRequested => self.play_state = PlayState::Rolling,
            PlayState::PauseRequested => {
                self.play_state = PlayState::Paused;
                self.count_in_frames_remaining = 0;
                self.preroll_frames_remaining = 0;
            }
            _ => {}
        }
    }

    /// Move the playhead without changing state
    pub fn set_playhead(&mut self, frames: i64) {
        self.playhead = Position::from_frames(frames.max(0), self.frames_per_tick);
    }

    /// Advance the playhead by processed roll frames
    pub fn add_to_playhead(&mut self, frames: i64) {
        self.playhead
            .add_frames(frames, self.frames_per_tick);
    }

    /// Jump back one bar
    pub fn move_backward(&mut self) {
        let bar = self.frames_per_bar();
        let current_bar = self.playhead.frames / bar;
        let target = if self.playhead.frames % bar == 0 {
            (current_bar - 1).max(0)
        } else {
            current_bar
        };
        self.set_playhead(target * bar);
    }

    /// Jump forward one bar
    pub fn move_forward(&mut self) {
        let bar = self.frames_per_bar();
        let next_bar = self.playhead.frames / bar + 1;
        self.set_playhead(next_bar * bar);
    }

    /// Frames until the loop end from the given position, if looping applies
    pub fn frames_until_loop_end(&self, g_start: i64) -> Option<i64> {
        if !self.loop_enabled || !self.is_rolling() {
            return None;
        }
        if g_start >= self.loop_end.frames {
            return None;
        }
        Some(self.loop_end.frames - g_start)
    }

    /// Whether the given absolute frame lies inside the punch range
    pub fn in_punch_range(&self, frame: i64) -> bool {
        !self.punch_enabled
            || (frame >= self.punch_start.frames && frame < self.punch_end.frames)
    }

    /// React to edge-triggered transport control ports after a cycle
    ///
    /// Returns true when any transport action fired, so the engine can
    /// publish a state-change notification.
    pub fn process_transport_ports(&mut self, arena: &PortArena) -> bool {
        let mut fired = false;
        let roles = [
            self.roll_port,
            self.stop_port,
            self.backward_port,
            self.forward_port,
            self.loop_toggle_port,
            self.rec_toggle_port,
        ];
        for id in roles {
            let Some(port) = arena.get_mut(id) else {
                continue;
            };
            if !port.control_change_pending {
                continue;
            }
            port.control_change_pending = false;
            let rising = port.control > 0.5 && port.last_control <= 0.5;
            port.last_control = port.control;
            if !rising {
                continue;
            }
            fired = true;
            match port.transport_role {
                Some(TransportRole::Roll) => self.request_roll(),
                Some(TransportRole::Stop) => self.request_pause(),
                Some(TransportRole::Backward) => self.move_backward(),
                Some(TransportRole::Forward) => self.move_forward(),
                Some(TransportRole::LoopToggle) => self.loop_enabled = !self.loop_enabled,
                Some(TransportRole::RecToggle) => self.recording = !self.recording,
                None => {}
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (Transport, PortArena) {
        let mut arena = PortArena::new();
        let t = Transport::new(44100, &mut arena);
        (t, arena)
    }

    #[test]
    fn test_frames_per_tick_formula() {
        let (t, _) = transport();
        // 120 BPM, 4/4, 44100: one quarter note = 22050 frames = 960 ticks
        assert!((t.frames_per_tick - 22050.0 / 960.0).abs() < 1e-9);
        assert_eq!(t.frames_per_beat(), 22050);
        assert_eq!(t.frames_per_bar(), 88200);
    }

    #[test]
    fn test_roll_request_transition() {
        let (mut t, _) = transport();
        assert_eq!(t.play_state, PlayState::Paused);
        t.request_roll();
        assert_eq!(t.play_state, PlayState::RollRequested);
        t.transition();
        assert_eq!(t.play_state, PlayState::Rolling);
        t.request_pause();
        assert_eq!(t.play_state, PlayState::PauseRequested);
        t.transition();
        assert_eq!(t.play_state, PlayState::Paused);
    }

    #[test]
    fn test_count_in_frames() {
        let (mut t, _) = transport();
        t.count_in_bars = 1;
        t.request_roll();
        assert_eq!(t.count_in_frames_remaining, 88200);
    }

    #[test]
    fn test_tempo_change_rederives_positions() {
        let (mut t, _) = transport();
        t.loop_end = Position::from_ticks(t.ticks_per_bar() * 2.0, t.frames_per_tick);
        let frames_at_120 = t.loop_end.frames;
        t.update_frames_per_tick(4, 60.0, 44100);
        // Half tempo doubles every frame position
        assert_eq!(t.loop_end.frames, frames_at_120 * 2);
        assert!((t.loop_end.ticks - t.ticks_per_bar() * 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_loop_end_split() {
        let (mut t, _) = transport();
        t.loop_enabled = true;
        t.play_state = PlayState::Rolling;
        t.loop_start = Position::from_frames(0, t.frames_per_tick);
        t.loop_end = Position::from_frames(1000, t.frames_per_tick);
        assert_eq!(t.frames_until_loop_end(800), Some(200));
        assert_eq!(t.frames_until_loop_end(1000), None);
        t.loop_enabled = false;
        assert_eq!(t.frames_until_loop_end(800), None);
    }

    #[test]
    fn test_transport_port_rising_edge() {
        let (mut t, arena) = transport();
        let port = arena.get_mut(t.roll_port).unwrap();
        port.set_control_value(1.0, true);
        assert!(t.process_transport_ports(&arena));
        assert_eq!(t.play_state, PlayState::RollRequested);

        // Held high: no retrigger
        t.play_state = PlayState::Paused;
        let port = arena.get_mut(t.roll_port).unwrap();
        port.control_change_pending = true;
        assert!(!t.process_transport_ports(&arena));
        assert_eq!(t.play_state, PlayState::Paused);
    }

    #[test]
    fn test_move_by_bars() {
        let (mut t, _) = transport();
        t.set_playhead(10_000);
        t.move_forward();
        assert_eq!(t.playhead.frames, 88200);
        t.move_forward();
        assert_eq!(t.playhead.frames, 176400);
        t.move_backward();
        assert_eq!(t.playhead.frames, 88200);
        t.move_backward();
        assert_eq!(t.playhead.frames, 0);
        t.move_backward();
        assert_eq!(t.playhead.frames, 0);
    }

    #[test]
    fn test_punch_range() {
        let (mut t, _) = transport();
        t.punch_start = Position::from_frames(100, t.frames_per_tick);
        t.punch_end = Position::from_frames(200, t.frames_per_tick);
        assert!(t.in_punch_range(150));
        t.punch_enabled = true;
        assert!(t.in_punch_range(150));
        assert!(!t.in_punch_range(50));
        assert!(!t.in_punch_range(200));
    }
}
