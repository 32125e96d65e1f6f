use crate::audio::port::PortId;
use crate::audio::recording::RecordedAction;
use crate::audio::region::RegionId;
use crate::audio::track::TrackId;
use crate::audio::transport::RecordingMode;

/// Commands sent from the UI/control thread to the audio thread
///
/// Only RT-safe mutations belong here; structural changes (tracks, plugins,
/// connections) go through the engine's paused structural path instead.
#[derive(Debug, Clone)]
pub enum Command {
    // Transport
    /// Start rolling (with count-in/pre-roll when configured)
    Play,
    /// Pause and return the playhead to the session start
    Stop,
    /// Pause, keeping the playhead position
    Pause,
    /// Move the playhead to an absolute frame
    Seek(i64),
    /// Toggle the loop range on/off
    SetLoopEnabled(bool),
    /// Toggle punch in/out recording
    SetPunchEnabled(bool),
    /// Master record arm
    SetRecording(bool),
    /// Select what recording does to overlapping material
    SetRecordingMode(RecordingMode),
    /// Change tempo (re-derives every stored position)
    SetBpm(f32),
    /// Change the time signature (numerator, denominator)
    SetTimeSignature(u32, u32),
    /// Toggle the metronome
    SetMetronomeEnabled(bool),

    // Track controls
    /// Set a track fader's amplitude (0..2)
    SetTrackVolume(TrackId, f32),
    SetTrackBalance(TrackId, f32),
    SetTrackMute(TrackId, bool),
    SetTrackSolo(TrackId, bool),
    SetTrackListen(TrackId, bool),
    /// Arm or disarm a track for recording
    ArmTrack(TrackId, bool),

    // Generic control port access (hardware mappings, automation UI)
    /// Set a control port's value directly
    SetControlValue(PortId, f32),
}

/// Notifications from the audio thread to the UI
#[derive(Debug, Clone)]
pub enum AudioEvent {
    /// Periodic playhead position in seconds
    PlaybackPosition(f64),
    /// The transport changed state (rolling/paused/loop/record)
    TransportChanged,
    /// A summed control port changed value
    ControlChange(PortId, f32),
    /// A recording take grew (track, region, seconds)
    RecordingProgress(TrackId, RegionId, f64),
    /// A recording session finished; carries the undoable action
    RecordingFinished(RecordedAction),
    /// A recording-side file write failed; in-RAM audio is intact
    RecordingError(String),
    /// A backend was demoted or misbehaved
    BackendWarning(String),
}

/// Configuration change requests from backend threads
///
/// Consumed outside the audio callback; the engine pauses with a fade-out,
/// applies the change, rebuilds and resumes with a fade-in. Duplicate
/// requests are coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    BufferSizeChange(u32),
    SampleRateChange(u32),
}
