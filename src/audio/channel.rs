use crate::audio::connections::PortConnections;
use crate::audio::fader::{Fader, FaderKind};
use crate::audio::plugin::{Plugin, PluginSlot, PluginSlotKey};
use crate::audio::port::{
    Port, PortArena, PortFlow, PortId, PortOwner, PortType, RtCell, StereoPorts,
};
use crate::audio::track::{TrackId, TrackKind};

/// MIDI-FX slots per channel
pub const MIDI_FX_SLOTS: usize = 9;
/// Insert slots per channel
pub const INSERT_SLOTS: usize = 9;
/// Sends per channel
pub const SEND_SLOTS: usize = 9;
/// The first sends tap before the fader, the rest after
pub const PREFADER_SENDS: usize = 6;

/// One send: a gain-scaled copy of the pre- or post-fader signal routed to
/// another channel's input
pub struct ChannelSend {
    pub index: u8,
    pub track: TrackId,
    /// Send gain, 0..2
    pub amount_port: PortId,
    /// Toggle; a disabled send is a no-op
    pub enabled_port: PortId,
    pub stereo_in: StereoPorts,
    pub stereo_out: StereoPorts,
    /// Destination track whose processor input receives the copy
    pub dest: Option<TrackId>,
}

impl ChannelSend {
    fn new(arena: &mut PortArena, track: TrackId, index: u8) -> Self {
        let owner = PortOwner::ChannelSend(track, index);
        let mut audio = |label: String, flow: PortFlow, idx: u32| {
            arena.insert(Port::new(PortType::Audio, flow, owner, idx, label))
        };
        let stereo_in = StereoPorts {
            l: audio(format!("Send {} In L", index + 1), PortFlow::Input, 0),
            r: audio(format!("Send {} In R", index + 1), PortFlow::Input, 1),
        };
        let stereo_out = StereoPorts {
            l: audio(format!("Send {} Out L", index + 1), PortFlow::Output, 2),
            r: audio(format!("Send {} Out R", index + 1), PortFlow::Output, 3),
        };
        let amount_port = arena.insert(Port::control(
            owner,
            4,
            format!("Send {} Amount", index + 1),
            0.0,
            2.0,
            1.0,
        ));
        let mut enabled = Port::control(owner, 5, format!("Send {} Enabled", index + 1), 0.0, 1.0, 0.0);
        enabled.flags.toggle = true;
        let enabled_port = arena.insert(enabled);
        Self {
            index,
            track,
            amount_port,
            enabled_port,
            stereo_in,
            stereo_out,
            dest: None,
        }
    }

    /// Whether this send taps before the fader
    pub fn is_prefader(&self) -> bool {
        (self.index as usize) < PREFADER_SENDS
    }

    /// A send with no destination is skipped entirely
    pub fn is_empty(&self) -> bool {
        self.dest.is_none()
    }

    /// All arena ports belonging to this send
    pub fn all_ports(&self) -> Vec<PortId> {
        vec![
            self.stereo_in.l,
            self.stereo_in.r,
            self.stereo_out.l,
            self.stereo_out.r,
            self.amount_port,
            self.enabled_port,
        ]
    }

    /// Copy the tapped signal to the output, scaled by the send amount
    pub fn process(&self, arena: &PortArena, local_offset: u32, nframes: u32) {
        let start = local_offset as usize;
        let end = (local_offset + nframes) as usize;

        let enabled = arena
            .get(self.enabled_port)
            .map(|p| p.is_toggled())
            .unwrap_or(false);
        let amount = arena
            .get(self.amount_port)
            .map(|p| p.control)
            .unwrap_or(1.0);

        let (Some(in_l), Some(in_r)) = (arena.get(self.stereo_in.l), arena.get(self.stereo_in.r))
        else {
            return;
        };
        let (Some(out_l), Some(out_r)) = (
            arena.get_mut(self.stereo_out.l),
            arena.get_mut(self.stereo_out.r),
        ) else {
            return;
        };
        for i in start..end.min(out_l.buf.len()) {
            if enabled && self.dest.is_some() {
                out_l.buf[i] = in_l.buf[i] * amount;
                out_r.buf[i] = in_r.buf[i] * amount;
            } else {
                out_l.buf[i] = 0.0;
                out_r.buf[i] = 0.0;
            }
        }
    }
}

/// A track's post-processor stage: MIDI-FX, instrument, inserts, pre-fader,
/// fader and sends, ending at the channel's output ports
pub struct Channel {
    pub track: TrackId,

    pub midi_fx: Vec<Option<PluginSlot>>,
    pub instrument: Option<PluginSlot>,
    pub inserts: Vec<Option<PluginSlot>>,
    pub sends: Vec<ChannelSend>,

    pub prefader: Fader,
    pub fader: Fader,

    /// End of the MIDI chain after wiring (None when an instrument or no
    /// MIDI path terminates it)
    pub wired_midi_out: Option<PortId>,

    /// Downstream channel; `None` only for the master track
    pub output: Option<TrackId>,
}

impl Channel {
    /// Create a channel and all of its ports for the given track kind
    pub fn new(arena: &mut PortArena, track: TrackId, _kind: TrackKind) -> Self {
        let mut midi_fx = Vec::with_capacity(MIDI_FX_SLOTS);
        midi_fx.resize_with(MIDI_FX_SLOTS, || None);
        let mut inserts = Vec::with_capacity(INSERT_SLOTS);
        inserts.resize_with(INSERT_SLOTS, || None);
        let sends = (0..SEND_SLOTS as u8)
            .map(|i| ChannelSend::new(arena, track, i))
            .collect();

        Self {
            track,
            midi_fx,
            instrument: None,
            inserts,
            sends,
            prefader: Fader::create(arena, FaderKind::Prefader, Some(track)),
            fader: Fader::create(arena, FaderKind::Fader, Some(track)),
            wired_midi_out: None,
            output: None,
        }
    }

    /// The channel's stereo output: the fader's output ports
    pub fn stereo_out(&self) -> StereoPorts {
        self.fader.stereo_out
    }

    /// Mount a plugin instance into a slot, materializing its ports
    ///
    /// An occupied slot is replaced; the caller is responsible for removing
    /// the old slot's ports from the arena.
    pub fn add_plugin(
        &mut self,
        arena: &mut PortArena,
        key: PluginSlotKey,
        instance: Box<dyn Plugin>,
    ) -> &PluginSlot {
        let owner = PortOwner::Plugin(self.track, key);
        let (wants_audio, wants_midi) = match key {
            PluginSlotKey::MidiFx(_) => (false, true),
            PluginSlotKey::Instrument => (true, true),
            PluginSlotKey::Insert(_) => (true, false),
        };

        let mut enabled = Port::control(owner, 0, "Enabled", 0.0, 1.0, 1.0);
        enabled.flags.toggle = true;
        enabled.flags.plugin_enabled = true;
        let enabled_port = arena.insert(enabled);

        let params = instance.params().to_vec();
        let mut param_ports = Vec::with_capacity(params.len());
        for (i, param) in params.iter().enumerate() {
            let mut port = Port::control(
                owner,
                10 + i as u32,
                param.name.clone(),
                param.min,
                param.max,
                param.default,
            );
            port.flags.automatable = true;
            param_ports.push(arena.insert(port));
        }

        let audio_in = wants_audio.then(|| StereoPorts {
            l: arena.insert(Port::new(PortType::Audio, PortFlow::Input, owner, 1000, "In L")),
            r: arena.insert(Port::new(PortType::Audio, PortFlow::Input, owner, 1001, "In R")),
        });
        let audio_out = wants_audio.then(|| StereoPorts {
            l: arena.insert(Port::new(
                PortType::Audio,
                PortFlow::Output,
                owner,
                1002,
                "Out L",
            )),
            r: arena.insert(Port::new(
                PortType::Audio,
                PortFlow::Output,
                owner,
                1003,
                "Out R",
            )),
        });
        let midi_in = wants_midi.then(|| {
            arena.insert(Port::new(PortType::Midi, PortFlow::Input, owner, 1004, "MIDI In"))
        });
        let midi_out = (wants_midi && !matches!(key, PluginSlotKey::Instrument)).then(|| {
            arena.insert(Port::new(
                PortType::Midi,
                PortFlow::Output,
                owner,
                1005,
                "MIDI Out",
            ))
        });

        // Instruments consume MIDI and produce audio; their midi_in comes
        // from the FX chain end
        let latency = instance.latency();
        let scratch = vec![0.0; params.len()];
        let slot = PluginSlot {
            key,
            instance: RtCell::new(instance),
            failed: false,
            enabled_port,
            param_ports,
            audio_in,
            audio_out,
            midi_in,
            midi_out,
            param_scratch: RtCell::new(scratch),
            midi_scratch: RtCell::new(crate::audio::midi::MidiEvents::new()),
            latency,
        };

        let slot_ref = match key {
            PluginSlotKey::MidiFx(i) => {
                self.midi_fx[i as usize] = Some(slot);
                self.midi_fx[i as usize].as_ref()
            }
            PluginSlotKey::Instrument => {
                self.instrument = Some(slot);
                self.instrument.as_ref()
            }
            PluginSlotKey::Insert(i) => {
                self.inserts[i as usize] = Some(slot);
                self.inserts[i as usize].as_ref()
            }
        };
        slot_ref.expect("slot was just filled")
    }

    /// Unmount a plugin, returning the slot so the caller can free its ports
    pub fn remove_plugin(&mut self, key: PluginSlotKey) -> Option<PluginSlot> {
        match key {
            PluginSlotKey::MidiFx(i) => self.midi_fx[i as usize].take(),
            PluginSlotKey::Instrument => self.instrument.take(),
            PluginSlotKey::Insert(i) => self.inserts[i as usize].take(),
        }
    }

    /// Slot accessor
    pub fn slot(&self, key: PluginSlotKey) -> Option<&PluginSlot> {
        match key {
            PluginSlotKey::MidiFx(i) => self.midi_fx.get(i as usize)?.as_ref(),
            PluginSlotKey::Instrument => self.instrument.as_ref(),
            PluginSlotKey::Insert(i) => self.inserts.get(i as usize)?.as_ref(),
        }
    }

    /// Iterate all mounted slots
    pub fn slots(&self) -> impl Iterator<Item = &PluginSlot> {
        self.midi_fx
            .iter()
            .chain(self.inserts.iter())
            .filter_map(|s| s.as_ref())
            .chain(self.instrument.as_ref())
    }

    /// All arena ports belonging to this channel (strip, faders, sends)
    pub fn all_ports(&self) -> Vec<PortId> {
        let mut ports = Vec::new();
        ports.extend(self.prefader.all_ports());
        ports.extend(self.fader.all_ports());
        for send in &self.sends {
            ports.extend(send.all_ports());
        }
        for slot in self.slots() {
            ports.extend(slot.all_ports());
        }
        ports
    }

    /// Rebuild the locked connections realizing the strip order:
    /// processor -> MIDI-FX -> instrument -> inserts -> pre-fader -> fader ->
    /// sends / stereo out
    ///
    /// Existing locked connections touching the strip are dropped first, so
    /// the method is safe to call after any slot change.
    pub fn wire(
        &mut self,
        processor_stereo_out: Option<StereoPorts>,
        processor_midi_out: Option<PortId>,
        arena: &PortArena,
        conns: &mut PortConnections,
    ) {
        let strip_ports: std::collections::HashSet<PortId> =
            self.all_ports().into_iter().collect();
        let stale: Vec<(PortId, PortId)> = conns
            .as_slice()
            .iter()
            .filter(|c| {
                c.locked && (strip_ports.contains(&c.src) || strip_ports.contains(&c.dest))
            })
            .map(|c| (c.src, c.dest))
            .collect();
        for (src, dest) in stale {
            let _ = conns.disconnect(src, dest);
        }

        let track = self.track;
        let link = |conns: &mut PortConnections, src: PortId, dest: PortId| {
            if let Err(e) = conns.connect(arena, &[], src, dest, true) {
                log::error!("channel {}: internal wiring failed: {}", track, e);
            }
        };

        // MIDI chain
        self.wired_midi_out = None;
        if let Some(mut midi_src) = processor_midi_out {
            for slot in self.midi_fx.iter().flatten() {
                if slot.failed {
                    continue;
                }
                if let (Some(min), Some(mout)) = (slot.midi_in, slot.midi_out) {
                    link(conns, midi_src, min);
                    midi_src = mout;
                }
            }
            if let Some(instrument) = &self.instrument {
                if let Some(min) = instrument.midi_in {
                    link(conns, midi_src, min);
                }
            } else {
                // Chain end is what downstream channels receive
                self.wired_midi_out = Some(midi_src);
            }
        }

        // Audio chain start: the instrument's output when present, otherwise
        // the processor's stereo out
        let mut audio_src = self
            .instrument
            .as_ref()
            .filter(|s| !s.failed)
            .and_then(|s| s.audio_out)
            .or(processor_stereo_out);

        if let Some(mut src) = audio_src {
            for slot in self.inserts.iter().flatten() {
                if slot.failed {
                    continue;
                }
                if let (Some(ain), Some(aout)) = (slot.audio_in, slot.audio_out) {
                    link(conns, src.l, ain.l);
                    link(conns, src.r, ain.r);
                    src = aout;
                }
            }
            audio_src = Some(src);
        }

        if let Some(src) = audio_src {
            link(conns, src.l, self.prefader.stereo_in.l);
            link(conns, src.r, self.prefader.stereo_in.r);
        }
        link(conns, self.prefader.stereo_out.l, self.fader.stereo_in.l);
        link(conns, self.prefader.stereo_out.r, self.fader.stereo_in.r);

        // Sends tap the pre-fader or fader output
        for send in &self.sends {
            let tap = if send.is_prefader() {
                self.prefader.stereo_out
            } else {
                self.fader.stereo_out
            };
            link(conns, tap.l, send.stereo_in.l);
            link(conns, tap.r, send.stereo_in.r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::plugin::GainPlugin;

    #[test]
    fn test_channel_has_all_slots() {
        let mut arena = PortArena::new();
        let channel = Channel::new(&mut arena, 1, TrackKind::Audio);
        assert_eq!(channel.midi_fx.len(), MIDI_FX_SLOTS);
        assert_eq!(channel.inserts.len(), INSERT_SLOTS);
        assert_eq!(channel.sends.len(), SEND_SLOTS);
        assert!(channel.sends[5].is_prefader());
        assert!(!channel.sends[6].is_prefader());
    }

    #[test]
    fn test_add_remove_plugin() {
        let mut arena = PortArena::new();
        let mut channel = Channel::new(&mut arena, 1, TrackKind::Audio);
        channel.add_plugin(
            &mut arena,
            PluginSlotKey::Insert(0),
            Box::new(GainPlugin::new()),
        );
        assert!(channel.slot(PluginSlotKey::Insert(0)).is_some());
        let slot = channel.slot(PluginSlotKey::Insert(0)).unwrap();
        assert!(slot.audio_in.is_some());
        assert!(slot.midi_in.is_none());
        assert_eq!(slot.param_ports.len(), 1);

        let removed = channel.remove_plugin(PluginSlotKey::Insert(0));
        assert!(removed.is_some());
        assert!(channel.slot(PluginSlotKey::Insert(0)).is_none());
    }

    #[test]
    fn test_wire_builds_strip_connections() {
        let mut arena = PortArena::new();
        let mut channel = Channel::new(&mut arena, 1, TrackKind::Audio);
        // Fake processor outs
        let tp_out = StereoPorts {
            l: arena.insert(Port::new(
                PortType::Audio,
                PortFlow::Output,
                PortOwner::TrackProcessor(1),
                0,
                "TP L",
            )),
            r: arena.insert(Port::new(
                PortType::Audio,
                PortFlow::Output,
                PortOwner::TrackProcessor(1),
                1,
                "TP R",
            )),
        };
        let mut conns = PortConnections::new();
        channel.wire(Some(tp_out), None, &arena, &mut conns);

        // TP -> prefader in (no inserts mounted)
        assert!(conns.find(tp_out.l, channel.prefader.stereo_in.l).is_some());
        // prefader -> fader; the channel's output is the fader's out
        assert!(conns
            .find(channel.prefader.stereo_out.l, channel.fader.stereo_in.l)
            .is_some());
        assert_eq!(channel.stereo_out().l, channel.fader.stereo_out.l);
        // Send 0 taps prefader, send 8 taps fader
        assert!(conns
            .find(channel.prefader.stereo_out.l, channel.sends[0].stereo_in.l)
            .is_some());
        assert!(conns
            .find(channel.fader.stereo_out.l, channel.sends[8].stereo_in.l)
            .is_some());

        // Mount an insert and rewire: the chain must now pass through it
        channel.add_plugin(
            &mut arena,
            PluginSlotKey::Insert(0),
            Box::new(GainPlugin::new()),
        );
        channel.wire(Some(tp_out), None, &arena, &mut conns);
        let slot_in = channel.slot(PluginSlotKey::Insert(0)).unwrap().audio_in.unwrap();
        let slot_out = channel.slot(PluginSlotKey::Insert(0)).unwrap().audio_out.unwrap();
        assert!(conns.find(tp_out.l, slot_in.l).is_some());
        assert!(conns.find(slot_out.l, channel.prefader.stereo_in.l).is_some());
        assert!(conns.find(tp_out.l, channel.prefader.stereo_in.l).is_none());
    }
}
