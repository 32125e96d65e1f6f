use crate::audio::automation::AutomationTracklist;
use crate::audio::channel::Channel;
use crate::audio::port::PortArena;
use crate::audio::position::Position;
use crate::audio::region::{Region, RegionId, TrackLane};
use crate::audio::track_processor::TrackProcessor;
use serde::{Deserialize, Serialize};

/// Track ID type
pub type TrackId = u32;

/// Concrete track kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    /// Audio regions on lanes, audio input recording
    Audio,
    /// MIDI regions on lanes, routed to external instruments
    Midi,
    /// MIDI regions driving a hosted instrument plugin
    Instrument,
    /// Audio pass-through bus
    AudioBus,
    /// MIDI pass-through bus
    MidiBus,
    /// Foldable audio group with summing
    AudioGroup,
    /// Foldable MIDI group
    MidiGroup,
    /// The terminal mix bus
    Master,
    /// Chord and scale lane
    Chord,
    /// Timeline markers
    Marker,
    /// Tempo and time signature lane
    Tempo,
    /// Modulator plugins for macro control
    Modulator,
    /// Pure visual grouping, no signal
    Folder,
}

impl TrackKind {
    /// Whether tracks of this kind own a channel strip
    pub fn has_channel(&self) -> bool {
        !matches!(
            self,
            TrackKind::Marker | TrackKind::Tempo | TrackKind::Modulator | TrackKind::Folder
        )
    }

    /// Whether the track processor carries stereo audio
    pub fn has_audio_signal(&self) -> bool {
        matches!(
            self,
            TrackKind::Audio
                | TrackKind::Instrument
                | TrackKind::AudioBus
                | TrackKind::AudioGroup
                | TrackKind::Master
        )
    }

    /// Whether the track plays MIDI notes from regions
    pub fn has_piano_roll(&self) -> bool {
        matches!(self, TrackKind::Midi | TrackKind::Instrument | TrackKind::Chord)
    }

    /// Whether the track forwards MIDI as a bus
    pub fn is_midi_bus_like(&self) -> bool {
        matches!(self, TrackKind::MidiBus | TrackKind::MidiGroup)
    }

    /// Whether the track holds lanes of regions
    pub fn has_lanes(&self) -> bool {
        matches!(
            self,
            TrackKind::Audio | TrackKind::Midi | TrackKind::Instrument | TrackKind::Chord
        )
    }

    /// Whether child tracks can be folded under this kind
    pub fn is_foldable(&self) -> bool {
        matches!(
            self,
            TrackKind::AudioGroup | TrackKind::MidiGroup | TrackKind::Folder
        )
    }

    /// Whether recording can be armed on this kind
    pub fn can_record(&self) -> bool {
        matches!(
            self,
            TrackKind::Audio | TrackKind::Midi | TrackKind::Instrument | TrackKind::Chord
        )
    }
}

/// A timeline marker on the marker track
#[derive(Debug, Clone)]
pub struct Marker {
    pub name: String,
    pub pos: Position,
}

/// A track: timeline material plus its processing front-end
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub kind: TrackKind,

    pub lanes: Vec<TrackLane>,
    pub processor: TrackProcessor,
    pub channel: Option<Channel>,
    pub automation: AutomationTracklist,
    /// Markers, populated only on the marker track
    pub markers: Vec<Marker>,

    /// Armed for recording
    pub armed: bool,
    /// Region currently growing under the recording manager
    pub recording_region: Option<RegionId>,
    pub recording_start_sent: bool,
    pub recording_stop_sent: bool,
    pub recording_paused: bool,

    /// Which MIDI channels pass from hardware input (None = all)
    pub midi_channel_filter: Option<[bool; 16]>,

    /// Pinned tracks render above the scrollable tracklist area
    pub pinned: bool,
    pub folded: bool,
    /// Number of following tracks inside this foldable track
    pub fold_size: usize,
}

impl Track {
    /// Create a track with its processor, channel and default lane
    pub fn new(id: TrackId, name: impl Into<String>, kind: TrackKind, arena: &mut PortArena) -> Self {
        let processor = TrackProcessor::new(arena, id, kind);
        let channel = kind.has_channel().then(|| Channel::new(arena, id, kind));
        let mut lanes = Vec::new();
        if kind.has_lanes() {
            lanes.push(TrackLane::new("Lane 1"));
        }
        Self {
            id,
            name: name.into(),
            kind,
            lanes,
            processor,
            channel,
            automation: AutomationTracklist::new(),
            markers: Vec::new(),
            armed: false,
            recording_region: None,
            recording_start_sent: false,
            recording_stop_sent: false,
            recording_paused: false,
            midi_channel_filter: None,
            pinned: false,
            folded: false,
            fold_size: 0,
        }
    }

    /// Hash of the track name, used for cross-thread track identification
    pub fn name_hash(&self) -> u64 {
        name_hash(&self.name)
    }

    /// Ensure at least `count` lanes exist
    pub fn ensure_lanes(&mut self, count: usize) {
        while self.lanes.len() < count {
            let n = self.lanes.len() + 1;
            self.lanes.push(TrackLane::new(format!("Lane {}", n)));
        }
    }

    /// Find a region by id across all lanes
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.lanes.iter().find_map(|l| l.region(id))
    }

    /// Find a mutable region by id across all lanes
    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.lanes.iter_mut().find_map(|l| l.region_mut(id))
    }

    /// Whether the solo toggle on this track's fader is on
    pub fn is_soloed(&self, arena: &PortArena) -> bool {
        self.channel
            .as_ref()
            .and_then(|c| arena.get(c.fader.solo_port))
            .map(|p| p.is_toggled())
            .unwrap_or(false)
    }

    /// Whether the mute toggle on this track's fader is on
    pub fn is_muted(&self, arena: &PortArena) -> bool {
        self.channel
            .as_ref()
            .and_then(|c| arena.get(c.fader.mute_port))
            .map(|p| p.is_toggled())
            .unwrap_or(false)
    }

    /// Whether the listen toggle on this track's fader is on
    pub fn is_listened(&self, arena: &PortArena) -> bool {
        self.channel
            .as_ref()
            .and_then(|c| arena.get(c.fader.listen_port))
            .map(|p| p.is_toggled())
            .unwrap_or(false)
    }

    /// All arena ports owned by this track (processor, channel, strip)
    pub fn all_ports(&self) -> Vec<crate::audio::port::PortId> {
        let mut ports = self.processor.all_ports();
        if let Some(channel) = &self.channel {
            ports.extend(channel.all_ports());
        }
        ports
    }
}

/// Stable hash of a track name
pub fn name_hash(name: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_predicates() {
        assert!(TrackKind::Audio.has_channel());
        assert!(!TrackKind::Marker.has_channel());
        assert!(TrackKind::Instrument.has_piano_roll());
        assert!(TrackKind::Instrument.has_audio_signal());
        assert!(!TrackKind::Midi.has_audio_signal());
        assert!(TrackKind::AudioGroup.is_foldable());
        assert!(!TrackKind::Master.can_record());
    }

    #[test]
    fn test_new_track_shape() {
        let mut arena = PortArena::new();
        let track = Track::new(1, "Guitar", TrackKind::Audio, &mut arena);
        assert_eq!(track.lanes.len(), 1);
        assert!(track.channel.is_some());
        assert!(track.processor.stereo_out.is_some());
        assert!(track.processor.midi_out.is_none());

        let midi = Track::new(2, "Keys", TrackKind::Midi, &mut arena);
        assert!(midi.processor.midi_out.is_some());
        assert!(midi.processor.stereo_out.is_none());
    }

    #[test]
    fn test_ensure_lanes() {
        let mut arena = PortArena::new();
        let mut track = Track::new(1, "T", TrackKind::Midi, &mut arena);
        track.ensure_lanes(3);
        assert_eq!(track.lanes.len(), 3);
        assert_eq!(track.lanes[2].name, "Lane 3");
        track.ensure_lanes(2);
        assert_eq!(track.lanes.len(), 3);
    }

    #[test]
    fn test_name_hash_is_stable() {
        assert_eq!(name_hash("Master"), name_hash("Master"));
        assert_ne!(name_hash("Master"), name_hash("master"));
    }
}
