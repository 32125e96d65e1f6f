use crate::audio::midi::MidiEvent;
use crate::audio::port::{Port, PortArena, PortFlow, PortId, PortOwner, PortType};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How often the backend is asked for its current port list
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(7);

/// Signal type of an external hardware port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtPortType {
    Audio,
    Midi,
}

/// Persisted descriptor of an external backend port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtPortDescriptor {
    pub port_type: ExtPortType,
    /// Backend-assigned fully qualified name
    pub full_name: String,
    /// Inactive ports are kept in the list but not pulled from
    pub active: bool,
}

/// Bridges backend device ports into internal engine ports
///
/// One instance exists for inputs and one for outputs. The backend adapter
/// feeds samples/events through SPSC rings; each cycle the active ports are
/// drained into their internal counterparts before the graph runs.
pub struct HardwareProcessor {
    pub is_input: bool,
    descriptors: Vec<ExtPortDescriptor>,
    /// Internal ports parallel to `descriptors`
    ports: Vec<PortId>,
    audio_rings: Vec<Option<rtrb::Consumer<f32>>>,
    midi_rings: Vec<Option<rtrb::Consumer<MidiEvent>>>,
    /// Indices whose backend port disappeared; removal happens on pause
    pending_removals: Vec<usize>,
    last_rescan: Option<Instant>,
}

impl HardwareProcessor {
    pub fn new(is_input: bool) -> Self {
        Self {
            is_input,
            descriptors: Vec::new(),
            ports: Vec::new(),
            audio_rings: Vec::new(),
            midi_rings: Vec::new(),
            pending_removals: Vec::new(),
            last_rescan: None,
        }
    }

    /// Known descriptors
    pub fn descriptors(&self) -> &[ExtPortDescriptor] {
        &self.descriptors
    }

    /// Internal port for a descriptor index
    pub fn port(&self, idx: usize) -> Option<PortId> {
        self.ports.get(idx).copied()
    }

    /// Internal port for a backend port name
    pub fn port_by_name(&self, full_name: &str) -> Option<PortId> {
        self.descriptors
            .iter()
            .position(|d| d.full_name == full_name)
            .and_then(|i| self.port(i))
    }

    /// Whether a rescan is due
    pub fn rescan_due(&self, now: Instant) -> bool {
        match self.last_rescan {
            None => true,
            Some(t) => now.duration_since(t) >= RESCAN_INTERVAL,
        }
    }

    /// Merge the backend's current port list into the descriptor list
    ///
    /// New ports are appended with fresh internal ports; ports that vanished
    /// are queued for removal at the next engine pause. Returns the number
    /// of newly added ports.
    pub fn rescan(
        &mut self,
        arena: &mut PortArena,
        available: &[ExtPortDescriptor],
        max_block_length: usize,
        now: Instant,
    ) -> usize {
        self.last_rescan = Some(now);
        let mut added = 0;

        for ext in available {
            if self.descriptors.iter().any(|d| d.full_name == ext.full_name) {
                continue;
            }
            log::debug!(
                "hardware: new {} port '{}'",
                if self.is_input { "input" } else { "output" },
                ext.full_name
            );
            let flow = if self.is_input {
                // Inputs materialize as sources for the graph
                PortFlow::Output
            } else {
                PortFlow::Input
            };
            let port_type = match ext.port_type {
                ExtPortType::Audio => PortType::Audio,
                ExtPortType::Midi => PortType::Midi,
            };
            let mut port = Port::new(
                port_type,
                flow,
                PortOwner::HardwareProcessor,
                self.descriptors.len() as u32,
                ext.full_name.clone(),
            );
            port.allocate_buffers(max_block_length);
            port.set_exposed_to_backend(true);
            self.ports.push(arena.insert(port));
            self.descriptors.push(ext.clone());
            self.audio_rings.push(None);
            self.midi_rings.push(None);
            added += 1;
        }

        for (idx, desc) in self.descriptors.iter().enumerate() {
            let still_there = available.iter().any(|d| d.full_name == desc.full_name);
            if !still_there && !self.pending_removals.contains(&idx) {
                log::info!("hardware: port '{}' disappeared", desc.full_name);
                self.pending_removals.push(idx);
            }
        }
        added
    }

    /// Attach a sample ring for an audio descriptor; returns the producer
    /// half for the backend thread
    pub fn attach_audio_ring(&mut self, idx: usize, capacity: usize) -> Option<rtrb::Producer<f32>> {
        if idx >= self.descriptors.len() {
            return None;
        }
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        self.audio_rings[idx] = Some(consumer);
        Some(producer)
    }

    /// Attach an event ring for a MIDI descriptor
    pub fn attach_midi_ring(
        &mut self,
        idx: usize,
        capacity: usize,
    ) -> Option<rtrb::Producer<MidiEvent>> {
        if idx >= self.descriptors.len() {
            return None;
        }
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        self.midi_rings[idx] = Some(consumer);
        Some(producer)
    }

    /// Drop ports whose backend counterpart vanished (engine paused)
    pub fn apply_pending_removals(&mut self, arena: &mut PortArena) {
        self.pending_removals.sort_unstable_by(|a, b| b.cmp(a));
        for idx in self.pending_removals.drain(..) {
            if idx < self.descriptors.len() {
                self.descriptors.remove(idx);
                let port = self.ports.remove(idx);
                arena.remove(port);
                self.audio_rings.remove(idx);
                self.midi_rings.remove(idx);
            }
        }
    }

    /// Pull one cycle of backend data into the internal ports
    pub fn process(&mut self, arena: &PortArena, nframes: u32) {
        for (idx, desc) in self.descriptors.iter().enumerate() {
            if !desc.active {
                continue;
            }
            let Some(port_id) = self.ports.get(idx).copied() else {
                continue;
            };
            let Some(port) = arena.get_mut(port_id) else {
                continue;
            };
            match desc.port_type {
                ExtPortType::Audio => {
                    let n = (nframes as usize).min(port.buf.len());
                    port.buf[..n].fill(0.0);
                    if let Some(ring) = self.audio_rings.get_mut(idx).and_then(|r| r.as_mut()) {
                        for sample in port.buf[..n].iter_mut() {
                            match ring.pop() {
                                Ok(s) => *sample = s,
                                Err(_) => break,
                            }
                        }
                    }
                }
                ExtPortType::Midi => {
                    port.midi_events.clear();
                    if let Some(ring) = self.midi_rings.get_mut(idx).and_then(|r| r.as_mut()) {
                        while let Ok(mut ev) = ring.pop() {
                            // Clamp stale timestamps into the cycle
                            if ev.time >= nframes {
                                ev.time = nframes.saturating_sub(1);
                            }
                            port.midi_events.push(ev);
                        }
                    }
                    if !port.midi_events.is_empty() {
                        port.midi_activity
                            .store(true, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(name: &str, port_type: ExtPortType) -> ExtPortDescriptor {
        ExtPortDescriptor {
            port_type,
            full_name: name.to_string(),
            active: true,
        }
    }

    #[test]
    fn test_rescan_appends_new_ports() {
        let mut arena = PortArena::new();
        let mut hw = HardwareProcessor::new(true);
        let now = Instant::now();
        assert!(hw.rescan_due(now));

        let added = hw.rescan(
            &mut arena,
            &[ext("system:capture_1", ExtPortType::Audio)],
            256,
            now,
        );
        assert_eq!(added, 1);
        assert!(!hw.rescan_due(now));
        assert!(hw.rescan_due(now + RESCAN_INTERVAL));

        // Same list again: nothing new
        let added = hw.rescan(
            &mut arena,
            &[ext("system:capture_1", ExtPortType::Audio)],
            256,
            now,
        );
        assert_eq!(added, 0);
        assert!(hw.port_by_name("system:capture_1").is_some());
    }

    #[test]
    fn test_vanished_port_removed_on_pause() {
        let mut arena = PortArena::new();
        let mut hw = HardwareProcessor::new(true);
        let now = Instant::now();
        hw.rescan(
            &mut arena,
            &[
                ext("a", ExtPortType::Audio),
                ext("b", ExtPortType::Midi),
            ],
            256,
            now,
        );
        assert_eq!(hw.descriptors().len(), 2);

        // "a" disappears from the backend
        hw.rescan(&mut arena, &[ext("b", ExtPortType::Midi)], 256, now);
        // Still listed until the engine pauses
        assert_eq!(hw.descriptors().len(), 2);
        hw.apply_pending_removals(&mut arena);
        assert_eq!(hw.descriptors().len(), 1);
        assert_eq!(hw.descriptors()[0].full_name, "b");
    }

    #[test]
    fn test_audio_pull_from_ring() {
        let mut arena = PortArena::new();
        let mut hw = HardwareProcessor::new(true);
        let now = Instant::now();
        hw.rescan(&mut arena, &[ext("in", ExtPortType::Audio)], 64, now);
        let mut producer = hw.attach_audio_ring(0, 1024).unwrap();
        for i in 0..32 {
            producer.push(i as f32).unwrap();
        }

        hw.process(&arena, 64);
        let port = arena.get(hw.port(0).unwrap()).unwrap();
        assert_eq!(port.buf[0], 0.0);
        assert_eq!(port.buf[1], 1.0);
        assert_eq!(port.buf[31], 31.0);
        // Ring ran dry: remainder stays silent
        assert_eq!(port.buf[32], 0.0);
    }

    #[test]
    fn test_midi_pull_clamps_time() {
        let mut arena = PortArena::new();
        let mut hw = HardwareProcessor::new(true);
        let now = Instant::now();
        hw.rescan(&mut arena, &[ext("midi-in", ExtPortType::Midi)], 64, now);
        let mut producer = hw.attach_midi_ring(0, 16).unwrap();
        producer
            .push(MidiEvent::note_on(1000, 0, 60, 100))
            .unwrap();

        hw.process(&arena, 64);
        let port = arena.get(hw.port(0).unwrap()).unwrap();
        assert_eq!(port.midi_events.len(), 1);
        assert_eq!(port.midi_events.as_slice()[0].time, 63);
        assert!(port.midi_activity.load(std::sync::atomic::Ordering::Relaxed));
    }
}
