use crate::audio::midi::MidiEvent;
use midir::{Ignore, MidiInput, MidiInputConnection};
use thiserror::Error;

/// Errors from hardware MIDI input
#[derive(Debug, Error)]
pub enum MidiInputError {
    #[error("failed to initialize MIDI input: {0}")]
    Init(String),
    #[error("failed to connect to '{0}'")]
    Connect(String),
}

/// One open hardware MIDI connection feeding an engine-side ring
struct OpenPort {
    name: String,
    _connection: MidiInputConnection<()>,
}

/// Manages midir input connections and forwards their events into SPSC
/// rings drained by the hardware processor each cycle
pub struct MidiInputManager {
    client_name: String,
    ports: Vec<OpenPort>,
}

impl MidiInputManager {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ports: Vec::new(),
        }
    }

    /// Names of MIDI input ports the backend currently exposes
    pub fn available_ports(&self) -> Result<Vec<String>, MidiInputError> {
        let midi_in = MidiInput::new(&self.client_name)
            .map_err(|e| MidiInputError::Init(e.to_string()))?;
        let mut names = Vec::new();
        for port in midi_in.ports() {
            if let Ok(name) = midi_in.port_name(&port) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Names of ports currently connected
    pub fn connected_ports(&self) -> Vec<&str> {
        self.ports.iter().map(|p| p.name.as_str()).collect()
    }

    /// Connect a hardware port, forwarding its messages into `producer`
    ///
    /// Events are timestamped at cycle start (time 0); the hardware
    /// processor clamps them into the running cycle.
    pub fn connect(
        &mut self,
        port_name: &str,
        mut producer: rtrb::Producer<MidiEvent>,
    ) -> Result<(), MidiInputError> {
        let mut midi_in = MidiInput::new(&self.client_name)
            .map_err(|e| MidiInputError::Init(e.to_string()))?;
        midi_in.ignore(Ignore::SysexAndTime);

        let port = midi_in
            .ports()
            .into_iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n == port_name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| MidiInputError::Connect(port_name.to_string()))?;

        let connection = midi_in
            .connect(
                &port,
                &self.client_name,
                move |_timestamp, message, _| {
                    if message.len() < 2 {
                        return;
                    }
                    let ev = MidiEvent::new(
                        0,
                        message[0],
                        message[1],
                        message.get(2).copied().unwrap_or(0),
                    );
                    // Full ring: the event is dropped, same as a hardware
                    // overrun
                    let _ = producer.push(ev);
                },
                (),
            )
            .map_err(|e| MidiInputError::Connect(format!("{}: {}", port_name, e)))?;

        self.ports.push(OpenPort {
            name: port_name.to_string(),
            _connection: connection,
        });
        log::info!("midi: connected input '{}'", port_name);
        Ok(())
    }

    /// Drop the connection to a hardware port
    pub fn disconnect(&mut self, port_name: &str) -> bool {
        let before = self.ports.len();
        self.ports.retain(|p| p.name != port_name);
        before != self.ports.len()
    }
}
