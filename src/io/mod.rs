pub mod audio_file;
pub mod midi_input;
pub mod output;

pub use audio_file::{AudioFileData, AudioFileError, BitDepth};
pub use midi_input::MidiInputManager;
pub use output::{start_backend, BackendError, OutputStream};
