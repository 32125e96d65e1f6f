// DAW audio engine core
//
// A real-time audio engine: a typed port/connection graph, per-track
// processors turning timeline material into buffers, channel strips with
// inserts and sends, a worker-pool routing scheduler with sample-accurate
// cycle splitting, a recording manager, and an audio clip pool backing
// recorded and imported media.
// Uses lock-free queues between threads, cpal/midir for device I/O, and
// symphonia for audio file decoding.

pub mod audio;
pub mod command;
pub mod config;
pub mod io;

// Re-export commonly used types
pub use audio::{
    AudioEngine, AudioPool, EngineHandle, MidiEvent, Position, RecordingMode, Track, TrackId,
    TrackKind, Transport,
};
pub use command::{AudioEvent, Command, EngineEvent};
pub use config::EngineConfig;
