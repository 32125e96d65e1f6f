use crate::audio::fader::pan_gains;
use crate::audio::graph::CycleCtx;
use crate::audio::midi::MidiEvent;
use crate::audio::port::{
    Port, PortArena, PortFlow, PortId, PortOwner, PortType, StereoPorts,
};
use crate::audio::position::Position;
use crate::audio::region::{Region, RegionData};
use crate::audio::track::{Track, TrackId, TrackKind};

/// Per-track input stage
///
/// Turns timeline material into the track's port buffers each cycle: audio
/// regions are mixed into the stereo outs, MIDI/chord regions become events
/// on the MIDI out, live input is passed through with gain/pan/mono, and
/// automation lanes are applied to their bound ports.
pub struct TrackProcessor {
    pub track: TrackId,

    pub stereo_in: Option<StereoPorts>,
    pub stereo_out: Option<StereoPorts>,
    pub midi_in: Option<PortId>,
    pub midi_out: Option<PortId>,

    /// Input gain applied to monitored/live input (audio tracks)
    pub input_gain: Option<PortId>,
    /// Input pan 0..1 applied with the engine's pan law
    pub input_pan: Option<PortId>,
    /// Mono-sum toggle for the input stage
    pub mono: Option<PortId>,

    /// Per-MIDI-channel pitch bend controls (0..16383, 8192 center)
    pub pitch_bend: Vec<PortId>,
    /// Per-MIDI-channel channel pressure controls
    pub channel_pressure: Vec<PortId>,
    /// Per-MIDI-channel polyphonic pressure controls (applied to the pitch
    /// carried in the port's index metadata)
    pub poly_pressure: Vec<PortId>,
}

impl TrackProcessor {
    /// Create the processor and its ports for a track of the given kind
    pub fn new(arena: &mut PortArena, track: TrackId, kind: TrackKind) -> Self {
        let owner = PortOwner::TrackProcessor(track);
        let mut processor = Self {
            track,
            stereo_in: None,
            stereo_out: None,
            midi_in: None,
            midi_out: None,
            input_gain: None,
            input_pan: None,
            mono: None,
            pitch_bend: Vec::new(),
            channel_pressure: Vec::new(),
            poly_pressure: Vec::new(),
        };

        if kind.has_audio_signal() {
            let mut mk = |label: &str, flow: PortFlow, index: u32| {
                arena.insert(Port::new(PortType::Audio, flow, owner, index, label))
            };
            processor.stereo_in = Some(StereoPorts {
                l: mk("TP Stereo In L", PortFlow::Input, 0),
                r: mk("TP Stereo In R", PortFlow::Input, 1),
            });
            processor.stereo_out = Some(StereoPorts {
                l: mk("TP Stereo Out L", PortFlow::Output, 2),
                r: mk("TP Stereo Out R", PortFlow::Output, 3),
            });
        }
        if kind == TrackKind::Audio {
            processor.input_gain =
                Some(arena.insert(Port::control(owner, 10, "TP Input Gain", 0.0, 4.0, 1.0)));
            processor.input_pan =
                Some(arena.insert(Port::control(owner, 11, "TP Input Pan", 0.0, 1.0, 0.5)));
            let mut mono = Port::control(owner, 12, "TP Mono Toggle", 0.0, 1.0, 0.0);
            mono.flags.toggle = true;
            processor.mono = Some(arena.insert(mono));
        }
        if kind.has_piano_roll() || kind.is_midi_bus_like() {
            processor.midi_in = Some(arena.insert(Port::new(
                PortType::Midi,
                PortFlow::Input,
                owner,
                20,
                "TP MIDI In",
            )));
            processor.midi_out = Some(arena.insert(Port::new(
                PortType::Midi,
                PortFlow::Output,
                owner,
                21,
                "TP MIDI Out",
            )));
        }
        if kind.has_piano_roll() {
            for ch in 0..16u32 {
                processor.pitch_bend.push(arena.insert(Port::control(
                    owner,
                    100 + ch,
                    format!("Ch{} Pitch Bend", ch + 1),
                    0.0,
                    16383.0,
                    8192.0,
                )));
                processor.channel_pressure.push(arena.insert(Port::control(
                    owner,
                    200 + ch,
                    format!("Ch{} Pressure", ch + 1),
                    0.0,
                    127.0,
                    0.0,
                )));
                processor.poly_pressure.push(arena.insert(Port::control(
                    owner,
                    300 + ch,
                    format!("Ch{} Poly Pressure", ch + 1),
                    0.0,
                    127.0,
                    0.0,
                )));
            }
        }
        processor
    }

    /// All arena ports belonging to this processor
    pub fn all_ports(&self) -> Vec<PortId> {
        let mut ports = Vec::new();
        for sp in [self.stereo_in, self.stereo_out].into_iter().flatten() {
            ports.push(sp.l);
            ports.push(sp.r);
        }
        for p in [
            self.midi_in,
            self.midi_out,
            self.input_gain,
            self.input_pan,
            self.mono,
        ]
        .into_iter()
        .flatten()
        {
            ports.push(p);
        }
        ports.extend(&self.pitch_bend);
        ports.extend(&self.channel_pressure);
        ports.extend(&self.poly_pressure);
        ports
    }

    /// Process one window for this track
    ///
    /// `no_roll` is decided per route by the scheduler during latency
    /// pre-roll; the outputs are then filled with the denormal value only.
    pub fn process(&self, track: &Track, arena: &PortArena, ctx: &CycleCtx, no_roll: bool) {
        let start = ctx.time.local_offset as usize;
        let end = start + ctx.time.nframes as usize;

        // 1. Clear outputs; audio outs get the denormal prevention value
        if let Some(out) = self.stereo_out {
            for id in [out.l, out.r] {
                if let Some(port) = arena.get_mut(id) {
                    let len = port.buf.len();
                    for s in &mut port.buf[start..end.min(len)] {
                        *s = ctx.denormal;
                    }
                }
            }
        }
        if let Some(out) = self.midi_out {
            if let Some(port) = arena.get_mut(out) {
                port.midi_events.clear();
            }
        }
        if no_roll {
            return;
        }

        // 2. Apply automation lanes at the window start
        self.apply_automation(track, arena, ctx);

        // 3. Live input passthrough
        self.process_live_input(track, arena, ctx);

        // 4. Timeline material
        if ctx.rolling {
            match track.kind {
                TrackKind::Audio => self.render_audio_regions(track, arena, ctx),
                k if k.has_piano_roll() => self.render_midi_regions(track, arena, ctx),
                _ => {}
            }
        }

        // 5. MIDI controls become events
        self.apply_midi_controls(arena, ctx);

        if let Some(out) = self.midi_out {
            if let Some(port) = arena.get_mut(out) {
                port.midi_events.sort();
            }
        }
    }

    fn apply_automation(&self, track: &Track, arena: &PortArena, ctx: &CycleCtx) {
        let pos = Position {
            frames: ctx.time.g_start_w_offset,
            ticks: ctx.time.g_start_w_offset as f64 / ctx.frames_per_tick,
        };
        for at in track.automation.iter() {
            let Some(norm) = at.evaluate(&pos) else {
                continue;
            };
            if let Some(port) = arena.get_mut(at.port) {
                let value = port.minf + norm * (port.maxf - port.minf);
                port.set_control_value(value, false);
            }
        }
    }

    fn process_live_input(&self, track: &Track, arena: &PortArena, ctx: &CycleCtx) {
        let start = ctx.time.local_offset as usize;
        let end = start + ctx.time.nframes as usize;

        // Audio: stereo in -> stereo out with gain/pan/mono
        if let (Some(sin), Some(sout)) = (self.stereo_in, self.stereo_out) {
            let gain = self
                .input_gain
                .and_then(|p| arena.get(p))
                .map(|p| p.control)
                .unwrap_or(1.0);
            let pan = self
                .input_pan
                .and_then(|p| arena.get(p))
                .map(|p| p.control)
                .unwrap_or(0.5);
            let mono = self
                .mono
                .and_then(|p| arena.get(p))
                .map(|p| p.is_toggled())
                .unwrap_or(false);
            // Buses pass through untouched; only recordable audio inputs
            // carry an input pan stage
            let (pan_l, pan_r) = if self.input_pan.is_some() {
                pan_gains(pan, ctx.pan_law, ctx.pan_algorithm)
            } else {
                (1.0, 1.0)
            };

            let (Some(in_l), Some(in_r)) = (arena.get(sin.l), arena.get(sin.r)) else {
                return;
            };
            let (Some(out_l), Some(out_r)) =
                (arena.get_mut(sout.l), arena.get_mut(sout.r))
            else {
                return;
            };
            for i in start..end.min(out_l.buf.len()) {
                let mut l = in_l.buf[i] * gain;
                let mut r = in_r.buf[i] * gain;
                if mono {
                    let m = (l + r) * 0.5;
                    l = m;
                    r = m;
                }
                out_l.buf[i] += l * pan_l;
                out_r.buf[i] += r * pan_r;
            }
        }

        // MIDI: hardware/live events pass through the channel filter
        if let (Some(min), Some(mout)) = (self.midi_in, self.midi_out) {
            let (Some(src), Some(dest)) = (arena.get(min), arena.get_mut(mout)) else {
                return;
            };
            // While punch-recording, live events outside the punch window are
            // gated so they neither sound nor get recorded
            if ctx.recording && ctx.punch_enabled && track.armed {
                let window_start = ctx.time.g_start_w_offset;
                for ev in src.midi_events.as_slice() {
                    let abs = window_start + ev.time as i64 - ctx.time.local_offset as i64;
                    if abs < ctx.punch_start || abs >= ctx.punch_end {
                        continue;
                    }
                    if let Some(filter) = &track.midi_channel_filter {
                        if ev.status < 0xF0 && !filter[ev.channel() as usize] {
                            continue;
                        }
                    }
                    dest.midi_events.push(*ev);
                }
            } else {
                dest.midi_events.append_with_filter(
                    &src.midi_events,
                    track.midi_channel_filter.as_ref(),
                    ctx.time.local_offset,
                    ctx.time.nframes,
                );
            }
        }
    }

    /// Mix every overlapping audio region into the stereo outs
    fn render_audio_regions(&self, track: &Track, arena: &PortArena, ctx: &CycleCtx) {
        let Some(sout) = self.stereo_out else {
            return;
        };
        let g_start = ctx.time.g_start_w_offset;
        let g_end = g_start + ctx.time.nframes as i64;

        let (Some(out_l), Some(out_r)) = (arena.get_mut(sout.l), arena.get_mut(sout.r)) else {
            return;
        };

        for lane in &track.lanes {
            for region in &lane.regions {
                if region.muted || !region.is_hit_by_range(g_start, g_end) {
                    continue;
                }
                self.render_one_audio_region(region, out_l, out_r, ctx);
            }
        }
    }

    fn render_one_audio_region(
        &self,
        region: &Region,
        out_l: &mut Port,
        out_r: &mut Port,
        ctx: &CycleCtx,
    ) {
        let Some(data) = region.audio() else {
            return;
        };
        let clip = &data.clip;
        let g_start = ctx.time.g_start_w_offset;

        // Sample-rate conversion ratio between the clip and the engine
        let rate_ratio = clip.samplerate as f64 / ctx.sample_rate as f64;
        // Musical mode: the clip keeps musical length, so the read advances
        // faster when the live tempo is above the clip's recorded tempo
        let bpm_ratio = if data.musical_mode && data.clip_bpm > 0.0 {
            ctx.bpm as f64 / data.clip_bpm as f64
        } else {
            1.0
        };
        let step = rate_ratio * bpm_ratio;

        for i in 0..ctx.time.nframes as i64 {
            let timeline_frame = g_start + i;
            if timeline_frame < region.start.frames || timeline_frame >= region.end.frames {
                continue;
            }
            let region_local = timeline_frame - region.start.frames;

            // Map through the loop window in content space
            let content_pos = content_pos_f(region, region_local as f64 * step);
            // Stop at the end of the backing clip rather than reading past it
            if content_pos < 0.0 || content_pos >= clip.num_frames as f64 {
                continue;
            }

            let idx = content_pos as u64;
            let frac = (content_pos - idx as f64) as f32;
            let l0 = clip.sample(0, idx);
            let r0 = clip.sample(1, idx);
            let (l, r) = if idx + 1 < clip.num_frames && frac > 0.0 {
                let l1 = clip.sample(0, idx + 1);
                let r1 = clip.sample(1, idx + 1);
                (l0 + (l1 - l0) * frac, r0 + (r1 - r0) * frac)
            } else {
                (l0, r0)
            };

            let gain = data.gain * region.fade_gain(region_local);
            let out_idx = (ctx.time.local_offset as i64 + i) as usize;
            if out_idx < out_l.buf.len() {
                out_l.buf[out_idx] += l * gain;
                out_r.buf[out_idx] += r * gain;
            }
        }
    }

    /// Emit note events for every overlapping MIDI/chord region
    fn render_midi_regions(&self, track: &Track, arena: &PortArena, ctx: &CycleCtx) {
        let Some(mout) = self.midi_out else {
            return;
        };
        let Some(out) = arena.get_mut(mout) else {
            return;
        };
        let g_start = ctx.time.g_start_w_offset;
        let g_end = g_start + ctx.time.nframes as i64;

        let mut emit = |timeline_frame: i64, make: &dyn Fn(u32) -> MidiEvent| {
            if timeline_frame >= g_start && timeline_frame < g_end {
                let time = ctx.time.local_offset + (timeline_frame - g_start) as u32;
                out.midi_events.push(make(time));
            }
        };

        for lane in &track.lanes {
            for region in &lane.regions {
                if region.muted || !region.is_hit_by_range(g_start, g_end) {
                    continue;
                }
                match &region.data {
                    RegionData::Midi(data) => {
                        for_each_loop_pass(region, |pass_start, pass_len, local_base| {
                            let pass_end_content = pass_start + pass_len;
                            for note in &data.notes {
                                if note.pos.frames < pass_start
                                    || note.pos.frames >= pass_end_content
                                {
                                    continue;
                                }
                                let on_local = local_base + (note.pos.frames - pass_start);
                                // Notes crossing the loop edge are cut there
                                let off_content = if note.ended {
                                    note.end.frames.min(pass_end_content)
                                } else {
                                    pass_end_content
                                };
                                let off_local = (local_base + (off_content - pass_start))
                                    .min(region.length_frames());
                                let on_frame = region.start.frames + on_local;
                                let off_frame = region.start.frames + off_local;
                                emit(on_frame, &|t| {
                                    MidiEvent::note_on(t, 0, note.pitch, note.velocity)
                                });
                                emit(off_frame, &|t| MidiEvent::note_off(t, 0, note.pitch));
                            }
                        });
                    }
                    RegionData::Chord(data) => {
                        for_each_loop_pass(region, |pass_start, pass_len, local_base| {
                            let pass_end_content = pass_start + pass_len;
                            for (i, chord) in data.chords.iter().enumerate() {
                                if chord.pos.frames < pass_start
                                    || chord.pos.frames >= pass_end_content
                                {
                                    continue;
                                }
                                let on_local = local_base + (chord.pos.frames - pass_start);
                                // A chord sounds until the next chord or the
                                // end of the pass
                                let off_content = data
                                    .chords
                                    .get(i + 1)
                                    .map(|c| c.pos.frames)
                                    .unwrap_or(pass_end_content)
                                    .min(pass_end_content);
                                let off_local = (local_base + (off_content - pass_start))
                                    .min(region.length_frames());
                                for pitch in &chord.pitches {
                                    let pitch = *pitch;
                                    emit(region.start.frames + on_local, &move |t| {
                                        MidiEvent::note_on(t, 0, pitch, 90)
                                    });
                                    emit(region.start.frames + off_local, &move |t| {
                                        MidiEvent::note_off(t, 0, pitch)
                                    });
                                }
                            }
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    /// Translate changed MIDI control ports into events on the MIDI out
    fn apply_midi_controls(&self, arena: &PortArena, ctx: &CycleCtx) {
        let Some(mout) = self.midi_out else {
            return;
        };
        let Some(out) = arena.get_mut(mout) else {
            return;
        };
        let time = ctx.time.local_offset;

        for (ch, id) in self.pitch_bend.iter().enumerate() {
            if let Some(port) = arena.get_mut(*id) {
                if port.control_change_pending {
                    port.control_change_pending = false;
                    port.last_control = port.control;
                    out.midi_events
                        .push(MidiEvent::pitch_bend(time, ch as u8, port.control as u16));
                }
            }
        }
        for (ch, id) in self.channel_pressure.iter().enumerate() {
            if let Some(port) = arena.get_mut(*id) {
                if port.control_change_pending {
                    port.control_change_pending = false;
                    port.last_control = port.control;
                    out.midi_events.push(MidiEvent::channel_pressure(
                        time,
                        ch as u8,
                        port.control as u8,
                    ));
                }
            }
        }
        for (ch, id) in self.poly_pressure.iter().enumerate() {
            if let Some(port) = arena.get_mut(*id) {
                if port.control_change_pending {
                    port.control_change_pending = false;
                    port.last_control = port.control;
                    // The pressured pitch rides in the port index metadata
                    let pitch = port.id.index.saturating_sub(300) as u8;
                    out.midi_events.push(MidiEvent::poly_pressure(
                        time,
                        ch as u8,
                        pitch,
                        port.control as u8,
                    ));
                }
            }
        }
    }
}

/// Unwrapped content position for a region-local offset (fractional frames)
///
/// Playback starts at `clip_start`; on reaching `loop_end` it wraps back to
/// `loop_start`.
fn content_pos_f(region: &Region, region_local: f64) -> f64 {
    let clip_start = region.clip_start.frames as f64;
    let loop_start = region.loop_start.frames as f64;
    let loop_end = region.loop_end.frames as f64;
    let loop_len = loop_end - loop_start;

    let first_pass = loop_end - clip_start;
    if region_local < first_pass || loop_len <= 0.0 {
        clip_start + region_local
    } else {
        loop_start + (region_local - first_pass) % loop_len
    }
}

/// Visit each repetition of the region's loop window that lies inside the
/// region, as (content_pass_start, pass_len, region_local_base)
fn for_each_loop_pass(region: &Region, mut f: impl FnMut(i64, i64, i64)) {
    let length = region.length_frames();
    let loop_len = region.loop_length_frames();
    let first_pass = region.loop_end.frames - region.clip_start.frames;

    // First pass runs from clip_start
    f(
        region.clip_start.frames,
        first_pass.min(length),
        0,
    );
    if loop_len <= 0 {
        return;
    }
    let mut base = first_pass;
    while base < length {
        f(
            region.loop_start.frames,
            loop_len.min(length - base),
            base,
        );
        base += loop_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::graph::{CycleCtx, TimeInfo};
    use crate::audio::pool::ClipFrames;
    use crate::audio::region::{AudioRegionData, MidiNote, MidiRegionData};
    use std::sync::Arc;

    fn frames(n: i64) -> Position {
        Position {
            frames: n,
            ticks: n as f64,
        }
    }

    fn ctx_at(g_start: i64, nframes: u32) -> CycleCtx {
        let mut ctx = CycleCtx::test_default();
        ctx.time = TimeInfo {
            g_start_frame: g_start,
            g_start_w_offset: g_start,
            local_offset: 0,
            nframes,
        };
        ctx.rolling = true;
        ctx
    }

    fn audio_track_with_region(arena: &mut PortArena, region: Region) -> Track {
        let mut track = Track::new(1, "audio", TrackKind::Audio, arena);
        track.lanes[0].regions.push(region);
        track
    }

    #[test]
    fn test_audio_region_rendered_with_gain() {
        let mut arena = PortArena::new();
        let clip = Arc::new(ClipFrames::from_interleaved(vec![1.0; 2000], 2, 44100));
        let mut region = Region::new(
            7,
            "r",
            1,
            0,
            frames(0),
            frames(1000),
            RegionData::Audio(AudioRegionData {
                clip,
                pool_id: 0,
                gain: 0.5,
                musical_mode: false,
                clip_bpm: 120.0,
            }),
        );
        region.fade_in = frames(0);
        let track = audio_track_with_region(&mut arena, region);
        for id in track.processor.all_ports() {
            arena.get_mut(id).unwrap().allocate_buffers(256);
        }

        let ctx = ctx_at(100, 256);
        track.processor.process(&track, &arena, &ctx, false);

        let out = track.processor.stereo_out.unwrap();
        let buf = &arena.get(out.l).unwrap().buf;
        // Mid-region: region gain 0.5 on full-scale clip, past built-in fades
        assert!((buf[64] - 0.5).abs() < 1e-5, "got {}", buf[64]);
    }

    #[test]
    fn test_clip_end_clamped() {
        let mut arena = PortArena::new();
        // Clip of 100 frames but region claims 200
        let clip = Arc::new(ClipFrames::from_interleaved(vec![1.0; 200], 2, 44100));
        let region = Region {
            loop_end: frames(200),
            ..Region::new(
                7,
                "r",
                1,
                0,
                frames(0),
                frames(200),
                RegionData::Audio(AudioRegionData {
                    clip,
                    pool_id: 0,
                    gain: 1.0,
                    musical_mode: false,
                    clip_bpm: 120.0,
                }),
            )
        };
        let track = audio_track_with_region(&mut arena, region);
        for id in track.processor.all_ports() {
            arena.get_mut(id).unwrap().allocate_buffers(256);
        }

        let ctx = ctx_at(90, 40);
        track.processor.process(&track, &arena, &ctx, false);

        let out = track.processor.stereo_out.unwrap();
        let buf = &arena.get(out.l).unwrap().buf;
        // Frames 90..100 have clip content, 100..130 are past the clip end
        assert!(buf[5] > 0.5);
        assert!(buf[20].abs() < 1e-10, "got {}", buf[20]);
    }

    #[test]
    fn test_midi_region_emits_notes_in_window() {
        let mut arena = PortArena::new();
        let mut track = Track::new(1, "midi", TrackKind::Midi, &mut arena);
        let mut region = Region::new(
            9,
            "m",
            1,
            0,
            frames(1000),
            frames(2000),
            RegionData::Midi(MidiRegionData::default()),
        );
        if let RegionData::Midi(data) = &mut region.data {
            data.notes
                .push(MidiNote::new(60, 100, frames(100), frames(200)));
        }
        track.lanes[0].regions.push(region);
        for id in track.processor.all_ports() {
            arena.get_mut(id).unwrap().allocate_buffers(256);
        }

        // Window covering the note-on at absolute frame 1100
        let ctx = ctx_at(1100, 64);
        track.processor.process(&track, &arena, &ctx, false);
        let out = arena.get(track.processor.midi_out.unwrap()).unwrap();
        assert_eq!(out.midi_events.len(), 1);
        let ev = out.midi_events.as_slice()[0];
        assert!(ev.is_note_on());
        assert_eq!(ev.time, 0);

        // Window covering the note-off at absolute frame 1200
        let out_port = track.processor.midi_out.unwrap();
        arena.get_mut(out_port).unwrap().midi_events.clear();
        let ctx = ctx_at(1180, 64);
        track.processor.process(&track, &arena, &ctx, false);
        let out = arena.get(out_port).unwrap();
        assert_eq!(out.midi_events.len(), 1);
        let ev = out.midi_events.as_slice()[0];
        assert!(ev.is_note_off());
        assert_eq!(ev.time, 20);
    }

    #[test]
    fn test_no_roll_clears_to_denormal() {
        let mut arena = PortArena::new();
        let track = Track::new(1, "audio", TrackKind::Audio, &mut arena);
        for id in track.processor.all_ports() {
            arena.get_mut(id).unwrap().allocate_buffers(256);
        }
        let ctx = ctx_at(0, 128);
        track.processor.process(&track, &arena, &ctx, true);
        let out = track.processor.stereo_out.unwrap();
        let buf = &arena.get(out.l).unwrap().buf;
        assert!(buf[..128].iter().all(|s| *s == ctx.denormal));
    }

    #[test]
    fn test_content_pos_wraps() {
        let clip = Arc::new(ClipFrames::from_interleaved(vec![0.0; 200], 2, 44100));
        let mut region = Region::new(
            1,
            "r",
            0,
            0,
            frames(0),
            frames(300),
            RegionData::Audio(AudioRegionData {
                clip,
                pool_id: 0,
                gain: 1.0,
                musical_mode: false,
                clip_bpm: 120.0,
            }),
        );
        region.loop_start = frames(0);
        region.loop_end = frames(100);
        assert_eq!(content_pos_f(&region, 50.0), 50.0);
        assert_eq!(content_pos_f(&region, 150.0), 50.0);
        assert_eq!(content_pos_f(&region, 250.0), 50.0);
    }
}
