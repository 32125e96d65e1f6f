/// MIDI event representing a single MIDI message
///
/// The `time` field is the offset in frames from the start of the current
/// cycle; events produced by region playback or hardware capture are always
/// translated into cycle-local time before they enter a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    /// Frame offset within the current cycle
    pub time: u32,
    /// MIDI status byte (includes channel)
    pub status: u8,
    /// First data byte (note number, CC number, etc.)
    pub data1: u8,
    /// Second data byte (velocity, CC value, etc.)
    pub data2: u8,
}

impl MidiEvent {
    /// Create a new MIDI event
    pub fn new(time: u32, status: u8, data1: u8, data2: u8) -> Self {
        Self { time, status, data1, data2 }
    }

    /// Create a note on event
    pub fn note_on(time: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            time,
            status: 0x90 | (channel & 0x0F),
            data1: note,
            data2: velocity,
        }
    }

    /// Create a note off event
    pub fn note_off(time: u32, channel: u8, note: u8) -> Self {
        Self {
            time,
            status: 0x80 | (channel & 0x0F),
            data1: note,
            data2: 0,
        }
    }

    /// Create a control change event
    pub fn control_change(time: u32, channel: u8, controller: u8, value: u8) -> Self {
        Self {
            time,
            status: 0xB0 | (channel & 0x0F),
            data1: controller,
            data2: value,
        }
    }

    /// Create a pitch bend event from a 14-bit value (0..16384, center 8192)
    pub fn pitch_bend(time: u32, channel: u8, value: u16) -> Self {
        Self {
            time,
            status: 0xE0 | (channel & 0x0F),
            data1: (value & 0x7F) as u8,
            data2: ((value >> 7) & 0x7F) as u8,
        }
    }

    /// Create a channel pressure (aftertouch) event
    pub fn channel_pressure(time: u32, channel: u8, value: u8) -> Self {
        Self {
            time,
            status: 0xD0 | (channel & 0x0F),
            data1: value,
            data2: 0,
        }
    }

    /// Create a polyphonic key pressure event
    pub fn poly_pressure(time: u32, channel: u8, note: u8, value: u8) -> Self {
        Self {
            time,
            status: 0xA0 | (channel & 0x0F),
            data1: note,
            data2: value,
        }
    }

    /// Create an all-notes-off CC event
    pub fn all_notes_off(time: u32, channel: u8) -> Self {
        Self::control_change(time, channel, 123, 0)
    }

    /// Check if this is a note on event (with non-zero velocity)
    pub fn is_note_on(&self) -> bool {
        (self.status & 0xF0) == 0x90 && self.data2 > 0
    }

    /// Check if this is a note off event (or note on with zero velocity)
    pub fn is_note_off(&self) -> bool {
        (self.status & 0xF0) == 0x80 || ((self.status & 0xF0) == 0x90 && self.data2 == 0)
    }

    /// Get the MIDI channel (0-15)
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    /// Get the message type (upper 4 bits of status)
    pub fn message_type(&self) -> u8 {
        self.status & 0xF0
    }
}

/// Maximum events a port's list holds per cycle; extras are dropped
pub const MAX_MIDI_EVENTS_PER_CYCLE: usize = 128;

/// Cycle-scoped list of MIDI events owned by a port
///
/// The backing storage is allocated once; pushes beyond the capacity are
/// dropped and counted so the audio thread never allocates.
#[derive(Debug)]
pub struct MidiEvents {
    events: Vec<MidiEvent>,
    dropped: usize,
}

impl MidiEvents {
    /// Create an empty list with full capacity preallocated
    pub fn new() -> Self {
        Self {
            events: Vec::with_capacity(MAX_MIDI_EVENTS_PER_CYCLE),
            dropped: 0,
        }
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events queued this cycle
    pub fn as_slice(&self) -> &[MidiEvent] {
        &self.events
    }

    /// Events dropped since the last clear because the list was full
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Remove all events
    pub fn clear(&mut self) {
        self.events.clear();
        self.dropped = 0;
    }

    /// Push one event, dropping it if the list is full
    pub fn push(&mut self, ev: MidiEvent) {
        if self.events.len() < MAX_MIDI_EVENTS_PER_CYCLE {
            self.events.push(ev);
        } else {
            self.dropped += 1;
        }
    }

    /// Append events from another list that fall inside the given window
    ///
    /// Only events with `time` in `[local_offset, local_offset + nframes)` are
    /// taken, so a split cycle never duplicates or leaks events across the
    /// split point.
    pub fn append(&mut self, src: &MidiEvents, local_offset: u32, nframes: u32) {
        self.append_with_filter(src, None, local_offset, nframes);
    }

    /// Append with an optional per-channel filter (true = channel passes)
    pub fn append_with_filter(
        &mut self,
        src: &MidiEvents,
        channel_filter: Option<&[bool; 16]>,
        local_offset: u32,
        nframes: u32,
    ) {
        for ev in &src.events {
            if ev.time < local_offset || ev.time >= local_offset + nframes {
                continue;
            }
            if let Some(filter) = channel_filter {
                // System messages (0xF0..) carry no channel and always pass
                if ev.status < 0xF0 && !filter[ev.channel() as usize] {
                    continue;
                }
            }
            self.push(*ev);
        }
    }

    /// Sort events by time, ordering note-offs before note-ons at equal times
    /// so same-pitch retriggers do not swallow the new attack
    pub fn sort(&mut self) {
        self.events.sort_by(|a, b| {
            a.time
                .cmp(&b.time)
                .then_with(|| b.is_note_off().cmp(&a.is_note_off()))
        });
    }

    /// Queue all-notes-off on every channel at the given cycle offset
    pub fn panic(&mut self, time: u32) {
        for ch in 0..16 {
            self.push(MidiEvent::all_notes_off(time, ch));
        }
    }
}

impl Default for MidiEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_off_detection() {
        let on = MidiEvent::note_on(0, 0, 60, 100);
        let off = MidiEvent::note_off(0, 0, 60);
        let zero_vel = MidiEvent::note_on(0, 0, 60, 0);
        assert!(on.is_note_on());
        assert!(off.is_note_off());
        assert!(zero_vel.is_note_off());
        assert!(!zero_vel.is_note_on());
    }

    #[test]
    fn test_append_window() {
        let mut src = MidiEvents::new();
        src.push(MidiEvent::note_on(10, 0, 60, 100));
        src.push(MidiEvent::note_on(300, 0, 62, 100));

        let mut dest = MidiEvents::new();
        dest.append(&src, 0, 256);
        assert_eq!(dest.len(), 1);
        assert_eq!(dest.as_slice()[0].data1, 60);

        let mut tail = MidiEvents::new();
        tail.append(&src, 256, 256);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail.as_slice()[0].data1, 62);
    }

    #[test]
    fn test_channel_filter() {
        let mut src = MidiEvents::new();
        src.push(MidiEvent::note_on(0, 3, 60, 100));
        src.push(MidiEvent::note_on(0, 5, 61, 100));

        let mut filter = [false; 16];
        filter[5] = true;

        let mut dest = MidiEvents::new();
        dest.append_with_filter(&src, Some(&filter), 0, 64);
        assert_eq!(dest.len(), 1);
        assert_eq!(dest.as_slice()[0].channel(), 5);
    }

    #[test]
    fn test_overflow_drops() {
        let mut list = MidiEvents::new();
        for i in 0..(MAX_MIDI_EVENTS_PER_CYCLE + 4) {
            list.push(MidiEvent::note_on(i as u32, 0, 60, 100));
        }
        assert_eq!(list.len(), MAX_MIDI_EVENTS_PER_CYCLE);
        assert_eq!(list.dropped(), 4);
    }

    #[test]
    fn test_sort_off_before_on_at_same_time() {
        let mut list = MidiEvents::new();
        list.push(MidiEvent::note_on(5, 0, 60, 100));
        list.push(MidiEvent::note_off(5, 0, 60));
        list.sort();
        assert!(list.as_slice()[0].is_note_off());
        assert!(list.as_slice()[1].is_note_on());
    }
}
