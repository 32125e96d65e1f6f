use crate::audio::port::{Port, PortArena, PortFlow, PortOwner, PortType, StereoPorts};

/// A click scheduled inside the current cycle
#[derive(Debug, Clone, Copy)]
pub struct MetronomeEvent {
    /// Bar starts get the accented click, beats the normal one
    pub bar_start: bool,
    /// Frame offset within the cycle
    pub offset: u32,
}

/// Metronome click source
///
/// Clicks are synthesized once at the engine sample rate; playback state
/// lives in the sample processor so clicks can span cycle boundaries.
pub struct Metronome {
    pub enabled: bool,
    /// Click gain
    pub volume: f32,
    high_click: Vec<f32>,
    low_click: Vec<f32>,
}

impl Metronome {
    /// Create a metronome with pre-generated click sounds
    pub fn new(sample_rate: u32) -> Self {
        let (high_click, low_click) = Self::generate_clicks(sample_rate);
        Self {
            enabled: false,
            volume: 1.0,
            high_click,
            low_click,
        }
    }

    /// Generate woodblock-style click samples
    ///
    /// The voicing constants (partial pairs 1200/2400 Hz and 800/1600 Hz,
    /// squared-linear decay, sine-hash attack noise, 0.5/0.4 levels) are the
    /// established click sound and are kept as a set; retune them together
    /// or the accent/beat pair stops matching.
    fn generate_clicks(sample_rate: u32) -> (Vec<f32>, Vec<f32>) {
        let click_duration_ms = 10.0;
        let click_samples = ((sample_rate as f32 * click_duration_ms) / 1000.0) as usize;

        let make = |freq1: f32, freq2: f32, level: f32| {
            let mut click = Vec::with_capacity(click_samples);
            for i in 0..click_samples {
                let t = i as f32 / sample_rate as f32;
                let envelope = 1.0 - (i as f32 / click_samples as f32);
                let envelope = envelope * envelope;

                // Two sine partials give the woodblock character, a touch of
                // noise sharpens the attack
                let sample = 0.3 * (2.0 * std::f32::consts::PI * freq1 * t).sin()
                    + 0.2 * (2.0 * std::f32::consts::PI * freq2 * t).sin();
                let noise = (i as f32 * 0.1).sin() * 0.1;

                click.push((sample + noise) * envelope * level);
            }
            click
        };

        // Accent click is pitched higher and slightly louder
        (make(1200.0, 2400.0, 0.5), make(800.0, 1600.0, 0.4))
    }

    /// Click sample data for an event
    pub fn click(&self, bar_start: bool) -> &[f32] {
        if bar_start {
            &self.high_click
        } else {
            &self.low_click
        }
    }

    /// Queue bar/beat events falling inside `[g_start, g_start + nframes)`
    pub fn queue_events(
        &self,
        frames_per_bar: i64,
        frames_per_beat: i64,
        g_start: i64,
        nframes: u32,
        out: &mut Vec<MetronomeEvent>,
    ) {
        if !self.enabled || frames_per_beat <= 0 || frames_per_bar <= 0 {
            return;
        }
        let g_end = g_start + nframes as i64;
        // First beat boundary at or after g_start
        let mut beat_frame = ((g_start + frames_per_beat - 1) / frames_per_beat) * frames_per_beat;
        while beat_frame < g_end {
            if beat_frame >= g_start {
                out.push(MetronomeEvent {
                    bar_start: beat_frame % frames_per_bar == 0,
                    offset: (beat_frame - g_start) as u32,
                });
            }
            beat_frame += frames_per_beat;
        }
    }
}

/// A click currently sounding, possibly across cycle boundaries
struct ActiveClick {
    bar_start: bool,
    /// Read position within the click sample
    pos: usize,
    /// Cycle offset where it starts (only for the cycle it was queued in)
    start_offset: u32,
}

/// Renders queued one-shot samples (metronome clicks) into the monitor input
pub struct SampleProcessor {
    pub metronome: Metronome,
    pub stereo_out: StereoPorts,
    active: Vec<ActiveClick>,
    queued: Vec<MetronomeEvent>,
}

impl SampleProcessor {
    /// Create the processor and its output ports
    pub fn new(arena: &mut PortArena, sample_rate: u32) -> Self {
        let owner = PortOwner::SampleProcessor;
        let stereo_out = StereoPorts {
            l: arena.insert(Port::new(
                PortType::Audio,
                PortFlow::Output,
                owner,
                0,
                "Sample Processor Out L",
            )),
            r: arena.insert(Port::new(
                PortType::Audio,
                PortFlow::Output,
                owner,
                1,
                "Sample Processor Out R",
            )),
        };
        Self {
            metronome: Metronome::new(sample_rate),
            stereo_out,
            active: Vec::new(),
            queued: Vec::new(),
        }
    }

    /// Queue metronome events for the coming window (engine, cycle prepare)
    pub fn queue_metronome(
        &mut self,
        frames_per_bar: i64,
        frames_per_beat: i64,
        g_start: i64,
        nframes: u32,
    ) {
        let metronome = &self.metronome;
        metronome.queue_events(
            frames_per_bar,
            frames_per_beat,
            g_start,
            nframes,
            &mut self.queued,
        );
    }

    /// Drop queued and sounding clicks (seek, stop)
    pub fn flush(&mut self) {
        self.active.clear();
        self.queued.clear();
    }

    /// Mix queued/sounding clicks into the output ports for the window
    pub fn process(&mut self, arena: &PortArena, local_offset: u32, nframes: u32) {
        let start = local_offset as usize;
        let end = (local_offset + nframes) as usize;

        let (Some(out_l), Some(out_r)) = (
            arena.get_mut(self.stereo_out.l),
            arena.get_mut(self.stereo_out.r),
        ) else {
            return;
        };
        for i in start..end.min(out_l.buf.len()) {
            out_l.buf[i] = 0.0;
            out_r.buf[i] = 0.0;
        }

        for ev in self.queued.drain(..) {
            self.active.push(ActiveClick {
                bar_start: ev.bar_start,
                pos: 0,
                start_offset: ev.offset,
            });
        }

        let volume = self.metronome.volume;
        for click in &mut self.active {
            let data = if click.bar_start {
                self.metronome.click(true)
            } else {
                self.metronome.click(false)
            };
            let first_frame = if click.pos == 0 { click.start_offset } else { 0 };
            for i in first_frame..nframes {
                if click.pos >= data.len() {
                    break;
                }
                let idx = (local_offset + i) as usize;
                if idx >= out_l.buf.len() {
                    break;
                }
                let s = data[click.pos] * volume;
                out_l.buf[idx] += s;
                out_r.buf[idx] += s;
                click.pos += 1;
            }
        }
        self.active.retain(|c| {
            c.pos
                < if c.bar_start {
                    self.metronome.click(true).len()
                } else {
                    self.metronome.click(false).len()
                }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_events_on_beats() {
        let mut m = Metronome::new(44100);
        m.enabled = true;
        let mut events = Vec::new();
        // 4/4 at some tempo: bar = 4000 frames, beat = 1000
        m.queue_events(4000, 1000, 0, 2500, &mut events);
        assert_eq!(events.len(), 3);
        assert!(events[0].bar_start);
        assert_eq!(events[0].offset, 0);
        assert!(!events[1].bar_start);
        assert_eq!(events[1].offset, 1000);
        assert_eq!(events[2].offset, 2000);
    }

    #[test]
    fn test_queue_events_mid_bar() {
        let mut m = Metronome::new(44100);
        m.enabled = true;
        let mut events = Vec::new();
        m.queue_events(4000, 1000, 3500, 1000, &mut events);
        // Only the bar line at 4000 falls inside [3500, 4500)
        assert_eq!(events.len(), 1);
        assert!(events[0].bar_start);
        assert_eq!(events[0].offset, 500);
    }

    #[test]
    fn test_disabled_metronome_is_silent() {
        let m = Metronome::new(44100);
        let mut events = Vec::new();
        m.queue_events(4000, 1000, 0, 4000, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn test_click_spans_cycles() {
        let mut arena = PortArena::new();
        let mut sp = SampleProcessor::new(&mut arena, 44100);
        sp.metronome.enabled = true;
        for id in [sp.stereo_out.l, sp.stereo_out.r] {
            arena.get_mut(id).unwrap().allocate_buffers(64);
        }

        sp.queue_metronome(4000, 1000, 0, 64);
        sp.process(&arena, 0, 64);
        let first_cycle_tail = arena.get(sp.stereo_out.l).unwrap().buf[63];
        // A 10 ms click at 44.1 kHz is ~441 frames, so it keeps sounding
        sp.process(&arena, 0, 64);
        let second_cycle_head = arena.get(sp.stereo_out.l).unwrap().buf[0];
        let _ = first_cycle_tail;
        assert!(second_cycle_head.abs() > 0.0);
    }
}
