use crate::audio::fader::{PanAlgorithm, PanLaw};
use crate::audio::transport::RecordingMode;
use serde::{Deserialize, Serialize};

/// Audio I/O backends the engine knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioBackend {
    /// No device; a timer thread pumps the engine
    Dummy,
    Jack,
    Alsa,
    PulseAudio,
    PortAudio,
    Sdl,
    RtAudioAlsa,
    RtAudioJack,
    RtAudioPulse,
    RtAudioCoreAudio,
    RtAudioWasapi,
    RtAudioAsio,
}

impl AudioBackend {
    /// Whether this build can actually drive the backend
    ///
    /// The cpal adapter covers the hosts cpal supports on this platform;
    /// everything else demotes to Dummy.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            AudioBackend::Dummy | AudioBackend::Jack | AudioBackend::Alsa | AudioBackend::PulseAudio
        )
    }
}

/// MIDI input backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiBackend {
    Dummy,
    Jack,
    Alsa,
    WindowsMme,
    RtMidiAlsa,
    RtMidiJack,
    RtMidiMme,
    RtMidiCoreMidi,
    RtMidiUwp,
}

impl MidiBackend {
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            MidiBackend::Dummy
                | MidiBackend::Alsa
                | MidiBackend::Jack
                | MidiBackend::RtMidiAlsa
                | MidiBackend::RtMidiJack
        )
    }
}

/// Sample rates the engine accepts
pub const SUPPORTED_SAMPLE_RATES: [u32; 7] =
    [22050, 32000, 44100, 48000, 88200, 96000, 192000];

/// Block lengths the engine accepts
pub const SUPPORTED_BUFFER_SIZES: [u32; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Engine configuration, typically deserialized from user settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub audio_backend: AudioBackend,
    pub midi_backend: MidiBackend,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub pan_law: PanLaw,
    pub pan_algorithm: PanAlgorithm,
    pub recording_mode: RecordingMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio_backend: AudioBackend::Dummy,
            midi_backend: MidiBackend::Dummy,
            sample_rate: 44100,
            buffer_size: 256,
            pan_law: PanLaw::Minus3Db,
            pan_algorithm: PanAlgorithm::SineLaw,
            recording_mode: RecordingMode::Takes,
        }
    }
}

impl EngineConfig {
    /// Clamp the config to supported values, demoting unknown backends to
    /// Dummy with a one-time warning
    pub fn validated(mut self) -> Self {
        if !self.audio_backend.is_supported() {
            log::warn!(
                "audio backend {:?} is not available; falling back to Dummy",
                self.audio_backend
            );
            self.audio_backend = AudioBackend::Dummy;
        }
        if !self.midi_backend.is_supported() {
            log::warn!(
                "MIDI backend {:?} is not available; falling back to Dummy",
                self.midi_backend
            );
            self.midi_backend = MidiBackend::Dummy;
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            log::warn!("unsupported sample rate {}; using 44100", self.sample_rate);
            self.sample_rate = 44100;
        }
        if !SUPPORTED_BUFFER_SIZES.contains(&self.buffer_size) {
            log::warn!("unsupported buffer size {}; using 256", self.buffer_size);
            self.buffer_size = 256;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default().validated();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.buffer_size, 256);
    }

    #[test]
    fn test_unsupported_backend_demoted() {
        let config = EngineConfig {
            audio_backend: AudioBackend::RtAudioAsio,
            midi_backend: MidiBackend::RtMidiUwp,
            ..Default::default()
        }
        .validated();
        assert_eq!(config.audio_backend, AudioBackend::Dummy);
        assert_eq!(config.midi_backend, MidiBackend::Dummy);
    }

    #[test]
    fn test_bad_rates_clamped() {
        let config = EngineConfig {
            sample_rate: 12345,
            buffer_size: 100,
            ..Default::default()
        }
        .validated();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.buffer_size, 256);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sample_rate, config.sample_rate);
        assert_eq!(back.audio_backend, config.audio_backend);
    }
}
