use crate::audio::midi::{MidiEvent, MidiEvents};
use crate::audio::plugin::PluginSlotKey;
use crate::audio::track::TrackId;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Port ID type (index into the port arena)
pub type PortId = u32;

/// Samples held by a port's UI meter ring
pub const AUDIO_RING_SIZE: usize = 65536;

/// MIDI events held by a port's UI ring
pub const MIDI_RING_SIZE: usize = 11;

/// Signal type carried by a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    /// Audio-rate signal, nominally -1.0 to 1.0
    Audio,
    /// Control voltage, audio-rate modulation signal
    Cv,
    /// Control value, one scalar per cycle
    Control,
    /// MIDI event stream
    Midi,
}

/// Direction of a port relative to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFlow {
    Input,
    Output,
}

/// The object a port belongs to; owners create and destroy their ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOwner {
    TrackProcessor(TrackId),
    Track(TrackId),
    Plugin(TrackId, PluginSlotKey),
    Prefader(TrackId),
    Fader(TrackId),
    ChannelSend(TrackId, u8),
    SampleProcessor,
    MonitorFader,
    HardwareProcessor,
    Transport,
    Engine,
}

/// Transport function driven by an exposed control port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Roll,
    Stop,
    Backward,
    Forward,
    LoopToggle,
    RecToggle,
}

/// Stable identity of a port: owner, index within the owner, label
#[derive(Debug, Clone)]
pub struct PortIdentifier {
    pub owner: PortOwner,
    pub index: u32,
    pub label: String,
}

impl PortIdentifier {
    pub fn new(owner: PortOwner, index: u32, label: impl Into<String>) -> Self {
        Self {
            owner,
            index,
            label: label.into(),
        }
    }
}

/// Behavior flags for control ports
#[derive(Debug, Clone, Copy, Default)]
pub struct PortFlags {
    /// Toggles the owning plugin on/off (bypass convention)
    pub plugin_enabled: bool,
    /// Drives the project BPM
    pub bpm: bool,
    /// Drives the time signature numerator
    pub beats_per_bar: bool,
    /// Drives the time signature denominator
    pub beat_unit: bool,
    /// Fader amplitude
    pub amplitude: bool,
    /// Fader stereo balance
    pub stereo_balance: bool,
    /// Toggle behaves as boolean (>0.5 is on)
    pub toggle: bool,
    /// Value may be automated
    pub automatable: bool,
}

/// A connection source resolved to an arena index, cached for the cycle
///
/// Rebuilt from the `PortConnections` registry whenever the graph changes, so
/// the audio thread never walks the registry.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSource {
    pub src: PortId,
    pub multiplier: f32,
    pub enabled: bool,
}

/// A typed signal endpoint owned by exactly one engine object
pub struct Port {
    pub id: PortIdentifier,
    pub port_type: PortType,
    pub flow: PortFlow,

    /// Sample buffer, sized to the maximum block length (audio/CV/control)
    pub buf: Vec<f32>,
    /// Event list (MIDI ports)
    pub midi_events: MidiEvents,

    /// Minimum control value
    pub minf: f32,
    /// Maximum control value
    pub maxf: f32,
    /// Zero point for the control range
    pub zerof: f32,
    /// Default control value
    pub deff: f32,
    /// Current control value
    pub control: f32,
    /// User-set value before modulation is applied
    pub base_value: f32,
    /// Value last published to the UI
    pub last_control: f32,
    /// Set when the summed control value changed this cycle
    pub control_change_pending: bool,

    pub flags: PortFlags,
    pub transport_role: Option<TransportRole>,

    /// Connection sources resolved at graph rebuild
    pub srcs: Vec<ResolvedSource>,

    /// Whether the backend reads/writes this port directly
    pub exposed_to_backend: bool,

    /// Hardware-sourced MIDI seen recently (editor activity indicator)
    pub midi_activity: AtomicBool,

    audio_ring: Option<rtrb::Producer<f32>>,
    midi_ring: Option<rtrb::Producer<MidiEvent>>,
}

impl Port {
    /// Create a new port; buffers are allocated later by `allocate_buffers`
    pub fn new(
        port_type: PortType,
        flow: PortFlow,
        owner: PortOwner,
        index: u32,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id: PortIdentifier::new(owner, index, label),
            port_type,
            flow,
            buf: Vec::new(),
            midi_events: MidiEvents::new(),
            minf: 0.0,
            maxf: 1.0,
            zerof: 0.0,
            deff: 0.0,
            control: 0.0,
            base_value: 0.0,
            last_control: 0.0,
            control_change_pending: false,
            flags: PortFlags::default(),
            transport_role: None,
            srcs: Vec::new(),
            exposed_to_backend: false,
            midi_activity: AtomicBool::new(false),
            audio_ring: None,
            midi_ring: None,
        }
    }

    /// Create a control port with explicit bounds and default
    pub fn control(
        owner: PortOwner,
        index: u32,
        label: impl Into<String>,
        minf: f32,
        maxf: f32,
        deff: f32,
    ) -> Self {
        let mut port = Self::new(PortType::Control, PortFlow::Input, owner, index, label);
        port.minf = minf;
        port.maxf = maxf;
        port.zerof = minf;
        port.deff = deff;
        port.control = deff;
        port.base_value = deff;
        port.last_control = deff;
        port
    }

    /// Allocate the sample buffer for the given maximum block length
    pub fn allocate_buffers(&mut self, max_block_length: usize) {
        match self.port_type {
            PortType::Audio | PortType::Cv => {
                self.buf = vec![0.0; max_block_length];
            }
            PortType::Control => {
                // Control ports carry one scalar; a tiny buffer keeps the
                // audio/control code paths uniform
                self.buf = vec![0.0; 1];
            }
            PortType::Midi => {}
        }
    }

    /// Attach a UI meter ring and return the consumer half
    pub fn enable_audio_ring(&mut self) -> rtrb::Consumer<f32> {
        let (producer, consumer) = rtrb::RingBuffer::new(AUDIO_RING_SIZE);
        self.audio_ring = Some(producer);
        consumer
    }

    /// Attach a UI MIDI ring and return the consumer half
    pub fn enable_midi_ring(&mut self) -> rtrb::Consumer<MidiEvent> {
        let (producer, consumer) = rtrb::RingBuffer::new(MIDI_RING_SIZE);
        self.midi_ring = Some(producer);
        consumer
    }

    /// Mark the port as readable/writable by the backend; idempotent
    pub fn set_exposed_to_backend(&mut self, exposed: bool) {
        self.exposed_to_backend = exposed;
    }

    /// Zero the sample buffer and clear the event list
    pub fn clear_buffer(&mut self) {
        self.buf.fill(0.0);
        self.midi_events.clear();
    }

    /// Half the control range; CV contributions are scaled by this
    pub fn depth_range(&self) -> f32 {
        (self.maxf - self.minf) / 2.0
    }

    /// Set a control value directly (UI thread or automation consumer)
    pub fn set_control_value(&mut self, value: f32, set_base: bool) {
        let clamped = value.clamp(self.minf, self.maxf);
        self.control = clamped;
        if set_base {
            self.base_value = clamped;
        }
        if (self.control - self.last_control).abs() > f32::EPSILON {
            self.control_change_pending = true;
        }
    }

    /// Normalized 0..1 view of the control value
    pub fn control_normalized(&self) -> f32 {
        if self.maxf > self.minf {
            (self.control - self.minf) / (self.maxf - self.minf)
        } else {
            0.0
        }
    }

    /// Whether a toggle-flagged control reads as on
    pub fn is_toggled(&self) -> bool {
        self.control > 0.5
    }

    /// Sum all enabled incoming connections into this port for the window
    /// `[local_offset, local_offset + nframes)`
    ///
    /// With `no_roll`, audio/CV buffers are filled with the engine's denormal
    /// prevention value and MIDI lists stay empty, so silent routes still
    /// produce defined output.
    pub fn sum_inputs(
        &mut self,
        arena: &PortArena,
        local_offset: u32,
        nframes: u32,
        no_roll: bool,
        denormal_val: f32,
    ) {
        let start = local_offset as usize;
        let end = (local_offset + nframes) as usize;

        match self.port_type {
            PortType::Audio | PortType::Cv => {
                if no_roll {
                    let end = end.min(self.buf.len());
                    for sample in &mut self.buf[start.min(end)..end] {
                        *sample = denormal_val;
                    }
                    return;
                }
                for src_ref in &self.srcs {
                    if !src_ref.enabled {
                        continue;
                    }
                    let Some(src) = arena.get(src_ref.src) else {
                        continue;
                    };
                    for i in start..end.min(src.buf.len()).min(self.buf.len()) {
                        self.buf[i] += src.buf[i] * src_ref.multiplier;
                    }
                }
            }
            PortType::Control => {
                if no_roll {
                    return;
                }
                let mut first = true;
                let mut val = self.control;
                for src_ref in &self.srcs {
                    if !src_ref.enabled {
                        continue;
                    }
                    let Some(src) = arena.get(src_ref.src) else {
                        continue;
                    };
                    let contribution = match src.port_type {
                        // CV modulates around the base value, scaled into the
                        // destination's range
                        PortType::Cv => {
                            let cv = src.buf.get(start).copied().unwrap_or(0.0);
                            cv * self.depth_range() * src_ref.multiplier
                        }
                        PortType::Control => src.control * src_ref.multiplier,
                        _ => continue,
                    };
                    if first {
                        val = self.base_value + contribution;
                        first = false;
                    } else {
                        val += contribution;
                    }
                }
                if !first {
                    self.control = val.clamp(self.minf, self.maxf);
                }
                if (self.control - self.last_control).abs() > f32::EPSILON {
                    self.control_change_pending = true;
                }
            }
            PortType::Midi => {
                if no_roll {
                    self.midi_events.clear();
                    return;
                }
                for src_ref in &self.srcs {
                    if !src_ref.enabled {
                        continue;
                    }
                    let Some(src) = arena.get(src_ref.src) else {
                        continue;
                    };
                    let src_events = &src.midi_events;
                    self.midi_events.append(src_events, local_offset, nframes);
                }
                self.midi_events.sort();
            }
        }
    }

    /// Publish the final cycle contents into the UI rings, dropping the
    /// oldest data when the ring is full
    pub fn write_rings(&mut self, nframes: u32) {
        if let Some(ring) = &mut self.audio_ring {
            for i in 0..(nframes as usize).min(self.buf.len()) {
                // Overwrite-oldest: a full ring just skips; the UI reader
                // catches up on its own schedule
                let _ = ring.push(self.buf[i]);
            }
        }
        if let Some(ring) = &mut self.midi_ring {
            for ev in self.midi_events.as_slice() {
                let _ = ring.push(*ev);
            }
        }
        if !self.midi_events.is_empty()
            && matches!(self.id.owner, PortOwner::HardwareProcessor)
        {
            self.midi_activity.store(true, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("label", &self.id.label)
            .field("type", &self.port_type)
            .field("flow", &self.flow)
            .field("srcs", &self.srcs.len())
            .finish()
    }
}

/// Pair of arena ids for a stereo port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StereoPorts {
    pub l: PortId,
    pub r: PortId,
}

/// Interior-mutable cell for state the routing scheduler partitions per node
///
/// The scheduler guarantees each cell's contents are mutated by at most one
/// worker per cycle, with reads ordered after the writer through the node
/// refcount protocol; structural code touches cells only while the graph is
/// not running.
pub struct RtCell<T>(UnsafeCell<T>);

// SAFETY: access is partitioned by the scheduler as documented above.
unsafe impl<T: Send> Sync for RtCell<T> {}
unsafe impl<T: Send> Send for RtCell<T> {}

impl<T> RtCell<T> {
    pub fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Shared access; caller must not overlap with a writer for this cell
    #[allow(clippy::mut_from_ref)]
    pub fn get(&self) -> &T {
        // SAFETY: single-writer-per-cycle discipline, see type docs
        unsafe { &*self.0.get() }
    }

    /// Exclusive access; caller must be this cell's unique accessor
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut T {
        // SAFETY: single-writer-per-cycle discipline, see type docs
        unsafe { &mut *self.0.get() }
    }
}

/// Arena owning every port in the engine, addressed by stable `PortId`
///
/// Slots are reused through a free list so ids stay dense; structural
/// insert/remove happens only while the graph is stopped.
pub struct PortArena {
    slots: Vec<Option<RtCell<Port>>>,
    free: Vec<usize>,
}

impl PortArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Insert a port and return its id
    pub fn insert(&mut self, port: Port) -> PortId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(RtCell::new(port));
            idx as PortId
        } else {
            self.slots.push(Some(RtCell::new(port)));
            (self.slots.len() - 1) as PortId
        }
    }

    /// Remove a port, freeing its slot
    pub fn remove(&mut self, id: PortId) -> Option<Port> {
        let idx = id as usize;
        if idx >= self.slots.len() {
            return None;
        }
        let cell = self.slots[idx].take()?;
        self.free.push(idx);
        Some(cell.0.into_inner())
    }

    /// Shared read access to a port
    pub fn get(&self, id: PortId) -> Option<&Port> {
        self.slots.get(id as usize)?.as_ref().map(|c| c.get())
    }

    /// Mutable access to a port through the arena's cell
    ///
    /// Callers must respect the single-writer-per-cycle discipline: during a
    /// cycle only the node that owns the port may call this; outside a cycle
    /// only the structure-owning thread may.
    pub fn get_mut(&self, id: PortId) -> Option<&mut Port> {
        self.slots.get(id as usize)?.as_ref().map(|c| c.get_mut())
    }

    /// Number of live ports
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live port ids
    pub fn ids(&self) -> impl Iterator<Item = PortId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as PortId)
    }
}

impl Default for PortArena {
    fn default() -> Self {
        Self::new()
    }
}
