use serde::{Deserialize, Serialize};

/// Ticks per quarter note, fixed project-wide
pub const TICKS_PER_QUARTER_NOTE: u32 = 960;

/// Musical position stored as both a frame count and a tick count
///
/// Frames are authoritative for the audio thread; ticks are authoritative for
/// musical edits. Whenever the tempo map changes, frames are re-derived from
/// ticks (see `Transport::update_frames_per_tick`). Both representations are
/// always kept, never one alone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Position in samples (signed so pre-roll space before 1.1.1.0 exists)
    pub frames: i64,
    /// Position in ticks
    pub ticks: f64,
}

impl Position {
    /// Create a position at the project start
    pub fn zero() -> Self {
        Self { frames: 0, ticks: 0.0 }
    }

    /// Create a position from ticks, deriving frames
    pub fn from_ticks(ticks: f64, frames_per_tick: f64) -> Self {
        Self {
            frames: frames_from_ticks(ticks, frames_per_tick),
            ticks,
        }
    }

    /// Create a position from frames, deriving ticks
    pub fn from_frames(frames: i64, frames_per_tick: f64) -> Self {
        Self {
            frames,
            ticks: ticks_from_frames(frames, frames_per_tick),
        }
    }

    /// Re-derive the frame count from the stored ticks
    ///
    /// Called for every position in the project when BPM, time signature or
    /// sample rate changes.
    pub fn update_frames_from_ticks(&mut self, frames_per_tick: f64) {
        self.frames = frames_from_ticks(self.ticks, frames_per_tick);
    }

    /// Re-derive the tick count from the stored frames
    pub fn update_ticks_from_frames(&mut self, frames_per_tick: f64) {
        self.ticks = ticks_from_frames(self.frames, frames_per_tick);
    }

    /// Add a frame delta, keeping ticks in sync
    pub fn add_frames(&mut self, frames: i64, frames_per_tick: f64) {
        self.frames += frames;
        self.ticks = ticks_from_frames(self.frames, frames_per_tick);
    }

    /// Whether this position lies inside `[start, end)`
    pub fn is_between_frames_excl(&self, start: i64, end: i64) -> bool {
        self.frames >= start && self.frames < end
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::zero()
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.frames.cmp(&other.frames))
    }
}

/// Convert ticks to frames, rounding toward negative infinity
pub fn frames_from_ticks(ticks: f64, frames_per_tick: f64) -> i64 {
    (ticks * frames_per_tick).floor() as i64
}

/// Convert frames to ticks
pub fn ticks_from_frames(frames: i64, frames_per_tick: f64) -> f64 {
    if frames_per_tick == 0.0 {
        return 0.0;
    }
    frames as f64 / frames_per_tick
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_ticks() {
        // 44100 Hz, 120 BPM, 4/4 -> frames_per_tick = 44100 * 60 * 4 / (120 * 3840)
        let frames_per_tick = (44100.0 * 60.0 * 4.0) / (120.0 * 4.0 * TICKS_PER_QUARTER_NOTE as f64);
        let pos = Position::from_ticks(3840.0, frames_per_tick);
        // One 4/4 bar at 120 BPM is two seconds
        assert_eq!(pos.frames, 88200);

        let mut pos2 = Position::from_frames(88200, frames_per_tick);
        assert!((pos2.ticks - 3840.0).abs() < 1e-6);
        pos2.update_frames_from_ticks(frames_per_tick);
        assert_eq!(pos2.frames, 88200);
    }

    #[test]
    fn test_rederive_after_tempo_change() {
        let fpt_120 = (44100.0 * 60.0) / (120.0 * TICKS_PER_QUARTER_NOTE as f64);
        let fpt_60 = (44100.0 * 60.0) / (60.0 * TICKS_PER_QUARTER_NOTE as f64);

        let mut pos = Position::from_ticks(960.0, fpt_120);
        assert_eq!(pos.frames, 22050);
        pos.update_frames_from_ticks(fpt_60);
        assert_eq!(pos.frames, 44100);
        // Ticks are untouched by the tempo change
        assert!((pos.ticks - 960.0).abs() < 1e-9);
    }

    #[test]
    fn test_ordering_by_frames() {
        let fpt = 10.0;
        let a = Position::from_ticks(1.0, fpt);
        let b = Position::from_ticks(2.0, fpt);
        assert!(a < b);
    }
}
