use crate::audio::port::{PortArena, PortId, StereoPorts};
use crate::audio::track::TrackId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Center attenuation applied by the stereo law
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanLaw {
    ZeroDb,
    Minus3Db,
    Minus6Db,
}

/// Curve distributing signal between left and right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanAlgorithm {
    Linear,
    SquareRoot,
    SineLaw,
}

/// Left/right gains for a pan position in 0..1 (0.5 = center)
pub fn pan_gains(pan: f32, law: PanLaw, algorithm: PanAlgorithm) -> (f32, f32) {
    let pan = pan.clamp(0.0, 1.0);
    let (l, r) = match algorithm {
        PanAlgorithm::Linear => (1.0 - pan, pan),
        PanAlgorithm::SquareRoot => ((1.0 - pan).sqrt(), pan.sqrt()),
        PanAlgorithm::SineLaw => {
            let angle = pan * std::f32::consts::FRAC_PI_2;
            (angle.cos(), angle.sin())
        }
    };
    // The law compensates the center buildup: 0 dB leaves center untouched,
    // -3/-6 dB attenuate it
    let center_gain = match law {
        PanLaw::ZeroDb => 1.0,
        PanLaw::Minus3Db => 0.707_945_8,
        PanLaw::Minus6Db => 0.501_187_2,
    };
    // Scale so the curve passes through center_gain at pan 0.5
    let at_center = match algorithm {
        PanAlgorithm::Linear => 0.5,
        PanAlgorithm::SquareRoot => 0.5f32.sqrt(),
        PanAlgorithm::SineLaw => (std::f32::consts::FRAC_PI_4).sin(),
    };
    let norm = center_gain / at_center;
    (l * norm, r * norm)
}

/// Left/right gains for a stereo balance in 0..1 (0.5 = center)
///
/// Balance attenuates the opposite side only; it never boosts.
pub fn balance_gains(balance: f32) -> (f32, f32) {
    let balance = balance.clamp(0.0, 1.0);
    if balance < 0.5 {
        (1.0, balance * 2.0)
    } else {
        ((1.0 - balance) * 2.0, 1.0)
    }
}

/// Role a fader plays in the signal chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaderKind {
    /// Pre-fader passthrough with input/output gain and mono sum
    Prefader,
    /// Channel fader with amp/balance/mute/solo/listen
    Fader,
    /// The control room's monitor fader
    Monitor,
}

/// Gating inputs the graph computes from the tracklist before a fader runs
#[derive(Debug, Clone, Copy, Default)]
pub struct FaderGate {
    /// Some track in the project is soloed
    pub any_solo: bool,
    /// This fader's track is soloed or implicitly soloed through a child
    pub soloed: bool,
    pub muted: bool,
    pub listened: bool,
}

/// A fader stage: gain, balance and gating between two stereo port pairs
///
/// All user-facing values live in control ports; the struct itself only holds
/// port ids and the per-cycle peak meters.
pub struct Fader {
    pub kind: FaderKind,
    pub track: Option<TrackId>,

    pub stereo_in: StereoPorts,
    pub stereo_out: StereoPorts,
    pub midi_in: Option<PortId>,
    pub midi_out: Option<PortId>,

    /// Amplitude 0..2 (1 = unity)
    pub amp_port: PortId,
    /// Balance 0..1 (0.5 = center)
    pub balance_port: PortId,
    pub mute_port: PortId,
    pub solo_port: PortId,
    pub listen_port: PortId,

    /// Prefader-only controls
    pub input_gain_port: Option<PortId>,
    pub output_gain_port: Option<PortId>,
    pub mono_port: Option<PortId>,

    /// Cycle peak per channel, stored as f32 bits for lock-free UI reads
    peak_l: AtomicU32,
    peak_r: AtomicU32,
}

impl Fader {
    /// Create a fader and all of its ports in the arena
    pub fn create(arena: &mut PortArena, kind: FaderKind, track: Option<TrackId>) -> Self {
        use crate::audio::port::{Port, PortFlow, PortOwner, PortType};
        let owner = match (kind, track) {
            (FaderKind::Prefader, Some(t)) => PortOwner::Prefader(t),
            (_, Some(t)) => PortOwner::Fader(t),
            (_, None) => PortOwner::MonitorFader,
        };
        let mut audio = |label: &str, flow: PortFlow, idx: u32| {
            arena.insert(Port::new(PortType::Audio, flow, owner, idx, label))
        };
        let stereo_in = StereoPorts {
            l: audio("Fader In L", PortFlow::Input, 0),
            r: audio("Fader In R", PortFlow::Input, 1),
        };
        let stereo_out = StereoPorts {
            l: audio("Fader Out L", PortFlow::Output, 2),
            r: audio("Fader Out R", PortFlow::Output, 3),
        };
        let mut amp = Port::control(owner, 4, "Volume", 0.0, 2.0, 1.0);
        amp.flags.amplitude = true;
        amp.flags.automatable = true;
        let amp = arena.insert(amp);
        let mut balance = Port::control(owner, 5, "Balance", 0.0, 1.0, 0.5);
        balance.flags.stereo_balance = true;
        balance.flags.automatable = true;
        let balance = arena.insert(balance);
        let mut mute = Port::control(owner, 6, "Mute", 0.0, 1.0, 0.0);
        mute.flags.toggle = true;
        let mute = arena.insert(mute);
        let mut solo = Port::control(owner, 7, "Solo", 0.0, 1.0, 0.0);
        solo.flags.toggle = true;
        let solo = arena.insert(solo);
        let mut listen = Port::control(owner, 8, "Listen", 0.0, 1.0, 0.0);
        listen.flags.toggle = true;
        let listen = arena.insert(listen);

        let mut fader = Fader::new(
            kind, track, stereo_in, stereo_out, amp, balance, mute, solo, listen,
        );
        if kind == FaderKind::Prefader {
            fader.input_gain_port =
                Some(arena.insert(Port::control(owner, 9, "Input Gain", 0.0, 4.0, 1.0)));
            fader.output_gain_port =
                Some(arena.insert(Port::control(owner, 10, "Output Gain", 0.0, 4.0, 1.0)));
            let mut mono = Port::control(owner, 11, "Mono Toggle", 0.0, 1.0, 0.0);
            mono.flags.toggle = true;
            fader.mono_port = Some(arena.insert(mono));
        }
        fader
    }

    /// Assemble a fader from already-created ports
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: FaderKind,
        track: Option<TrackId>,
        stereo_in: StereoPorts,
        stereo_out: StereoPorts,
        amp_port: PortId,
        balance_port: PortId,
        mute_port: PortId,
        solo_port: PortId,
        listen_port: PortId,
    ) -> Self {
        Self {
            kind,
            track,
            stereo_in,
            stereo_out,
            midi_in: None,
            midi_out: None,
            amp_port,
            balance_port,
            mute_port,
            solo_port,
            listen_port,
            input_gain_port: None,
            output_gain_port: None,
            mono_port: None,
            peak_l: AtomicU32::new(0),
            peak_r: AtomicU32::new(0),
        }
    }

    /// Last cycle's peak (absolute sample maximum) per channel
    pub fn peaks(&self) -> (f32, f32) {
        (
            f32::from_bits(self.peak_l.load(Ordering::Relaxed)),
            f32::from_bits(self.peak_r.load(Ordering::Relaxed)),
        )
    }

    /// All arena ports belonging to this fader
    pub fn all_ports(&self) -> Vec<PortId> {
        let mut ports = vec![
            self.stereo_in.l,
            self.stereo_in.r,
            self.stereo_out.l,
            self.stereo_out.r,
            self.amp_port,
            self.balance_port,
            self.mute_port,
            self.solo_port,
            self.listen_port,
        ];
        for p in [
            self.input_gain_port,
            self.output_gain_port,
            self.mono_port,
            self.midi_in,
            self.midi_out,
        ]
        .into_iter()
        .flatten()
        {
            ports.push(p);
        }
        ports
    }

    /// Process one window through the fader
    ///
    /// `fade` is an optional (start_gain, per_frame_step) ramp the engine
    /// applies around pause/resume on the monitor fader.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &self,
        arena: &PortArena,
        local_offset: u32,
        nframes: u32,
        gate: FaderGate,
        fade: Option<(f32, f32)>,
    ) {
        let start = local_offset as usize;
        let end = (local_offset + nframes) as usize;

        let amp = arena
            .get(self.amp_port)
            .map(|p| p.control)
            .unwrap_or(1.0);
        let balance = arena
            .get(self.balance_port)
            .map(|p| p.control)
            .unwrap_or(0.5);
        let (bal_l, bal_r) = balance_gains(balance);

        // Mute applies at the fader; a solo anywhere silences non-soloed
        // tracks here as well
        let silenced = gate.muted || (gate.any_solo && !gate.soloed && self.kind == FaderKind::Fader);

        let (mut gain_l, mut gain_r) = (amp * bal_l, amp * bal_r);
        if silenced {
            gain_l = 0.0;
            gain_r = 0.0;
        }

        // Prefader extras
        let mut pre_gain = 1.0;
        if let Some(p) = self.input_gain_port {
            pre_gain *= arena.get(p).map(|p| p.control).unwrap_or(1.0);
        }
        let mono = self
            .mono_port
            .and_then(|p| arena.get(p))
            .map(|p| p.is_toggled())
            .unwrap_or(false);
        let mut post_gain = 1.0;
        if let Some(p) = self.output_gain_port {
            post_gain *= arena.get(p).map(|p| p.control).unwrap_or(1.0);
        }

        let mut peak_l = 0.0f32;
        let mut peak_r = 0.0f32;

        // Single-writer discipline: this fader's node is the only writer of
        // its output ports this cycle
        let src_l = match arena.get(self.stereo_in.l) {
            Some(p) => p,
            None => return,
        };
        let src_r = match arena.get(self.stereo_in.r) {
            Some(p) => p,
            None => return,
        };
        let (Some(out_l), Some(out_r)) = (
            arena.get_mut(self.stereo_out.l),
            arena.get_mut(self.stereo_out.r),
        ) else {
            return;
        };

        let mut fade_gain = fade.map(|f| f.0).unwrap_or(1.0);
        let fade_step = fade.map(|f| f.1).unwrap_or(0.0);

        for i in start..end.min(out_l.buf.len()) {
            let mut l = src_l.buf[i] * pre_gain;
            let mut r = src_r.buf[i] * pre_gain;
            if mono {
                let m = (l + r) * 0.5;
                l = m;
                r = m;
            }
            let mut vl = l * gain_l * post_gain * fade_gain;
            let mut vr = r * gain_r * post_gain * fade_gain;
            if silenced && gate.listened && self.kind == FaderKind::Fader {
                // Listen overrides the gate at the dim gain; the monitor
                // routing picks this signal up downstream
                vl = l * amp * bal_l;
                vr = r * amp * bal_r;
            }
            out_l.buf[i] = vl;
            out_r.buf[i] = vr;
            peak_l = peak_l.max(vl.abs());
            peak_r = peak_r.max(vr.abs());
            fade_gain = (fade_gain + fade_step).clamp(0.0, 1.0);
        }

        // MIDI faders just forward events
        if let (Some(min), Some(mout)) = (self.midi_in, self.midi_out) {
            if let (Some(src), Some(dest)) = (arena.get(min), arena.get_mut(mout)) {
                if !silenced {
                    dest.midi_events
                        .append(&src.midi_events, local_offset, nframes);
                }
            }
        }

        self.peak_l.store(peak_l.to_bits(), Ordering::Relaxed);
        self.peak_r.store(peak_r.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::port::{Port, PortFlow, PortOwner, PortType};

    fn audio_port(arena: &mut PortArena, flow: PortFlow) -> PortId {
        let mut port = Port::new(PortType::Audio, flow, PortOwner::Engine, 0, "p");
        port.allocate_buffers(64);
        arena.insert(port)
    }

    fn control_port(arena: &mut PortArena, min: f32, max: f32, def: f32) -> PortId {
        let mut port = Port::control(PortOwner::Engine, 0, "c", min, max, def);
        port.allocate_buffers(64);
        arena.insert(port)
    }

    fn make_fader(arena: &mut PortArena, kind: FaderKind) -> Fader {
        let in_l = audio_port(arena, PortFlow::Input);
        let in_r = audio_port(arena, PortFlow::Input);
        let out_l = audio_port(arena, PortFlow::Output);
        let out_r = audio_port(arena, PortFlow::Output);
        let amp = control_port(arena, 0.0, 2.0, 1.0);
        let bal = control_port(arena, 0.0, 1.0, 0.5);
        let mute = control_port(arena, 0.0, 1.0, 0.0);
        let solo = control_port(arena, 0.0, 1.0, 0.0);
        let listen = control_port(arena, 0.0, 1.0, 0.0);
        Fader::new(
            kind,
            None,
            StereoPorts { l: in_l, r: in_r },
            StereoPorts { l: out_l, r: out_r },
            amp,
            bal,
            mute,
            solo,
            listen,
        )
    }

    fn fill_inputs(arena: &PortArena, fader: &Fader, value: f32, n: usize) {
        arena.get_mut(fader.stereo_in.l).unwrap().buf[..n].fill(value);
        arena.get_mut(fader.stereo_in.r).unwrap().buf[..n].fill(value);
    }

    #[test]
    fn test_unity_passthrough() {
        let mut arena = PortArena::new();
        let fader = make_fader(&mut arena, FaderKind::Fader);
        fill_inputs(&arena, &fader, 0.5, 16);
        fader.process(&arena, 0, 16, FaderGate::default(), None);
        assert_eq!(arena.get(fader.stereo_out.l).unwrap().buf[0], 0.5);
        assert_eq!(arena.get(fader.stereo_out.r).unwrap().buf[0], 0.5);
        let (pl, pr) = fader.peaks();
        assert_eq!((pl, pr), (0.5, 0.5));
    }

    #[test]
    fn test_amp_scales_output() {
        let mut arena = PortArena::new();
        let fader = make_fader(&mut arena, FaderKind::Fader);
        arena.get_mut(fader.amp_port).unwrap().set_control_value(0.5, true);
        fill_inputs(&arena, &fader, 1.0, 8);
        fader.process(&arena, 0, 8, FaderGate::default(), None);
        assert_eq!(arena.get(fader.stereo_out.l).unwrap().buf[0], 0.5);
    }

    #[test]
    fn test_mute_silences() {
        let mut arena = PortArena::new();
        let fader = make_fader(&mut arena, FaderKind::Fader);
        fill_inputs(&arena, &fader, 1.0, 8);
        fader.process(
            &arena,
            0,
            8,
            FaderGate {
                muted: true,
                ..Default::default()
            },
            None,
        );
        assert_eq!(arena.get(fader.stereo_out.l).unwrap().buf[0], 0.0);
    }

    #[test]
    fn test_solo_elsewhere_silences_non_soloed() {
        let mut arena = PortArena::new();
        let fader = make_fader(&mut arena, FaderKind::Fader);
        fill_inputs(&arena, &fader, 1.0, 8);
        fader.process(
            &arena,
            0,
            8,
            FaderGate {
                any_solo: true,
                soloed: false,
                ..Default::default()
            },
            None,
        );
        assert_eq!(arena.get(fader.stereo_out.l).unwrap().buf[0], 0.0);
    }

    #[test]
    fn test_balance_attenuates_opposite_side() {
        let mut arena = PortArena::new();
        let fader = make_fader(&mut arena, FaderKind::Fader);
        // Hard right
        arena
            .get_mut(fader.balance_port)
            .unwrap()
            .set_control_value(1.0, true);
        fill_inputs(&arena, &fader, 1.0, 8);
        fader.process(&arena, 0, 8, FaderGate::default(), None);
        assert_eq!(arena.get(fader.stereo_out.l).unwrap().buf[0], 0.0);
        assert_eq!(arena.get(fader.stereo_out.r).unwrap().buf[0], 1.0);
    }

    #[test]
    fn test_fade_ramp() {
        let mut arena = PortArena::new();
        let fader = make_fader(&mut arena, FaderKind::Monitor);
        fill_inputs(&arena, &fader, 1.0, 4);
        // Fade out over 4 frames
        fader.process(&arena, 0, 4, FaderGate::default(), Some((1.0, -0.25)));
        let out = &arena.get(fader.stereo_out.l).unwrap().buf;
        assert_eq!(out[0], 1.0);
        assert!(out[3] < out[1]);
    }

    #[test]
    fn test_pan_gains_center_law() {
        let (l, r) = pan_gains(0.5, PanLaw::Minus3Db, PanAlgorithm::SquareRoot);
        assert!((l - 0.7079458).abs() < 1e-3);
        assert!((l - r).abs() < 1e-6);

        // Hard left keeps everything on the left channel
        let (l0, r0) = pan_gains(0.0, PanLaw::ZeroDb, PanAlgorithm::Linear);
        assert_eq!(r0, 0.0);
        assert!(l0 > 0.0);
    }

    #[test]
    fn test_balance_gains() {
        assert_eq!(balance_gains(0.5), (1.0, 1.0));
        assert_eq!(balance_gains(0.0), (1.0, 0.0));
        assert_eq!(balance_gains(1.0), (0.0, 1.0));
    }
}
