pub mod automation;
pub mod channel;
pub mod connections;
pub mod engine;
pub mod export;
pub mod fader;
pub mod graph;
pub mod hardware;
pub mod metronome;
pub mod midi;
pub mod plugin;
pub mod pool;
pub mod port;
pub mod position;
pub mod recording;
pub mod region;
pub mod track;
pub mod track_processor;
pub mod tracklist;
pub mod transport;

pub use engine::{AudioEngine, EngineHandle, EngineState};
pub use midi::{MidiEvent, MidiEvents};
pub use pool::{AudioClip, AudioPool, PoolId};
pub use port::{Port, PortArena, PortFlow, PortId, PortType};
pub use position::Position;
pub use region::{Region, RegionData, RegionId};
pub use track::{Track, TrackId, TrackKind};
pub use tracklist::Tracklist;
pub use transport::{PlayState, RecordingMode, Transport};
