use crate::audio::automation::AutomationPoint;
use crate::audio::pool::{ClipFrames, PoolId};
use crate::audio::position::Position;
use crate::audio::track::TrackId;
use std::sync::Arc;
use thiserror::Error;

/// Region ID type
pub type RegionId = u32;

/// Frames of the always-on fade at an audio region's absolute start and end
pub const BUILTIN_FADE_FRAMES: i64 = 10;

/// Errors from region validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("region end is not after start")]
    InvalidPosition,
    #[error("loop range exceeds the backing clip")]
    InvalidRange,
}

/// A note inside a MIDI region, positions relative to the region start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiNote {
    pub pitch: u8,
    pub velocity: u8,
    pub pos: Position,
    pub end: Position,
    /// False while a recording's note-off has not arrived yet
    pub ended: bool,
}

impl MidiNote {
    pub fn new(pitch: u8, velocity: u8, pos: Position, end: Position) -> Self {
        Self {
            pitch,
            velocity,
            pos,
            end,
            ended: true,
        }
    }

    /// Start a note whose end is unknown (live recording)
    pub fn unended(pitch: u8, velocity: u8, pos: Position) -> Self {
        Self {
            pitch,
            velocity,
            pos,
            end: pos,
            ended: false,
        }
    }
}

/// A chord inside a chord region; sounds until the next chord or region end
#[derive(Debug, Clone, PartialEq)]
pub struct ChordObject {
    pub pos: Position,
    /// MIDI pitches the chord sounds
    pub pitches: Vec<u8>,
}

/// Payload of an audio region
#[derive(Debug, Clone)]
pub struct AudioRegionData {
    /// Shared decoded frames; stable while this region exists
    pub clip: Arc<ClipFrames>,
    pub pool_id: PoolId,
    /// Region-level playback gain
    pub gain: f32,
    /// Track the project BPM by time-stretching on playback
    pub musical_mode: bool,
    /// BPM the backing clip was recorded/imported at
    pub clip_bpm: f32,
}

/// Payload of a MIDI region
#[derive(Debug, Clone, Default)]
pub struct MidiRegionData {
    pub notes: Vec<MidiNote>,
}

/// Payload of an automation region
#[derive(Debug, Clone, Default)]
pub struct AutomationRegionData {
    /// Sorted by position
    pub points: Vec<AutomationPoint>,
}

/// Payload of a chord region
#[derive(Debug, Clone, Default)]
pub struct ChordRegionData {
    pub chords: Vec<ChordObject>,
}

/// Type-specific content of a region
#[derive(Debug, Clone)]
pub enum RegionData {
    Audio(AudioRegionData),
    Midi(MidiRegionData),
    Automation(AutomationRegionData),
    Chord(ChordRegionData),
}

/// A bounded object on a track lane (or automation track)
///
/// `clip_start`, `loop_start` and `loop_end` describe the content window:
/// playback begins at `clip_start` and wraps from `loop_end` back to
/// `loop_start`. Fade positions are relative to the region start.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub track: TrackId,
    pub lane: usize,
    pub muted: bool,

    pub start: Position,
    pub end: Position,
    pub clip_start: Position,
    pub loop_start: Position,
    pub loop_end: Position,
    /// Fade-in length from the region start
    pub fade_in: Position,
    /// Where the fade-out begins, relative to the region start
    pub fade_out: Position,

    pub data: RegionData,
}

impl Region {
    /// Create a region spanning `[start, end)` with default loop points
    /// covering the whole span
    pub fn new(
        id: RegionId,
        name: impl Into<String>,
        track: TrackId,
        lane: usize,
        start: Position,
        end: Position,
        data: RegionData,
    ) -> Self {
        let length = end.frames - start.frames;
        let length_ticks = end.ticks - start.ticks;
        Self {
            id,
            name: name.into(),
            track,
            lane,
            muted: false,
            start,
            end,
            clip_start: Position::zero(),
            loop_start: Position::zero(),
            loop_end: Position {
                frames: length,
                ticks: length_ticks,
            },
            fade_in: Position::zero(),
            fade_out: Position {
                frames: length,
                ticks: length_ticks,
            },
            data,
        }
    }

    /// Timeline length in frames
    pub fn length_frames(&self) -> i64 {
        self.end.frames - self.start.frames
    }

    /// Loop window length in frames
    pub fn loop_length_frames(&self) -> i64 {
        self.loop_end.frames - self.loop_start.frames
    }

    /// Whether the region overlaps `[g_start, g_end)` on the timeline
    pub fn is_hit_by_range(&self, g_start: i64, g_end: i64) -> bool {
        self.start.frames < g_end && self.end.frames > g_start
    }

    /// Validate positional invariants
    ///
    /// For audio regions the loop window must fit in the backing clip; one
    /// frame of rounding slack is tolerated.
    pub fn validate(&self) -> Result<(), RegionError> {
        if self.end.frames <= self.start.frames {
            return Err(RegionError::InvalidPosition);
        }
        if self.loop_end.frames < self.loop_start.frames {
            return Err(RegionError::InvalidRange);
        }
        if let RegionData::Audio(data) = &self.data {
            if self.loop_length_frames() > data.clip.num_frames as i64 + 1 {
                return Err(RegionError::InvalidRange);
            }
        }
        Ok(())
    }

    /// Map a region-local timeline frame to a content (clip) frame
    ///
    /// Content playback starts at `clip_start` and wraps from `loop_end` to
    /// `loop_start`.
    pub fn content_frame_at(&self, region_local: i64) -> i64 {
        let loop_len = self.loop_length_frames();
        let first_pass = self.loop_end.frames - self.clip_start.frames;
        if region_local < first_pass || loop_len <= 0 {
            self.clip_start.frames + region_local
        } else {
            self.loop_start.frames + (region_local - first_pass) % loop_len
        }
    }

    /// Fade envelope value at a region-local frame
    ///
    /// Combines the user fade-in/fade-out with the fixed 10-frame fades at
    /// the absolute region edges.
    pub fn fade_gain(&self, region_local: i64) -> f32 {
        let length = self.length_frames();
        let mut gain = 1.0f32;

        // User fade-in
        if self.fade_in.frames > 0 && region_local < self.fade_in.frames {
            gain *= (region_local as f32 / self.fade_in.frames as f32).clamp(0.0, 1.0);
        }
        // User fade-out
        if self.fade_out.frames < length && region_local >= self.fade_out.frames {
            let span = (length - self.fade_out.frames) as f32;
            if span > 0.0 {
                gain *= (1.0 - (region_local - self.fade_out.frames) as f32 / span)
                    .clamp(0.0, 1.0);
            }
        }
        // Built-in edge fades mask clicks at the region boundaries
        if region_local < BUILTIN_FADE_FRAMES {
            gain *= region_local as f32 / BUILTIN_FADE_FRAMES as f32;
        }
        let fade_out_start = length - BUILTIN_FADE_FRAMES;
        if region_local >= fade_out_start {
            gain *= 1.0 - (region_local - fade_out_start) as f32 / BUILTIN_FADE_FRAMES as f32;
        }
        gain.clamp(0.0, 1.0)
    }

    /// Audio payload accessor
    pub fn audio(&self) -> Option<&AudioRegionData> {
        match &self.data {
            RegionData::Audio(d) => Some(d),
            _ => None,
        }
    }

    /// MIDI payload accessor
    pub fn midi(&self) -> Option<&MidiRegionData> {
        match &self.data {
            RegionData::Midi(d) => Some(d),
            _ => None,
        }
    }

    pub fn midi_mut(&mut self) -> Option<&mut MidiRegionData> {
        match &mut self.data {
            RegionData::Midi(d) => Some(d),
            _ => None,
        }
    }

    /// Automation payload accessor
    pub fn automation(&self) -> Option<&AutomationRegionData> {
        match &self.data {
            RegionData::Automation(d) => Some(d),
            _ => None,
        }
    }

    pub fn automation_mut(&mut self) -> Option<&mut AutomationRegionData> {
        match &mut self.data {
            RegionData::Automation(d) => Some(d),
            _ => None,
        }
    }

    /// Extend the region end, keeping the loop window covering the growth
    /// (used while a recording grows)
    pub fn grow_to(&mut self, end: Position) {
        if end.frames > self.end.frames {
            self.end = end;
            let length = self.length_frames();
            self.loop_end = Position {
                frames: length,
                ticks: end.ticks - self.start.ticks,
            };
            self.fade_out = self.loop_end;
        }
    }
}

/// An ordered sub-row of a track holding regions (takes, overlaps)
#[derive(Debug, Default)]
pub struct TrackLane {
    pub name: String,
    pub regions: Vec<Region>,
}

impl TrackLane {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regions: Vec::new(),
        }
    }

    /// Insert a region keeping start-position order
    pub fn add_region(&mut self, region: Region) {
        let idx = self
            .regions
            .partition_point(|r| r.start.frames <= region.start.frames);
        self.regions.insert(idx, region);
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.id == id)
    }

    pub fn remove_region(&mut self, id: RegionId) -> Option<Region> {
        let idx = self.regions.iter().position(|r| r.id == id)?;
        Some(self.regions.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: i64) -> Position {
        Position {
            frames: n,
            ticks: n as f64,
        }
    }

    fn audio_region(id: RegionId, start: i64, clip_frames: u64) -> Region {
        let clip = Arc::new(ClipFrames::from_interleaved(
            vec![0.5; clip_frames as usize * 2],
            2,
            44100,
        ));
        Region::new(
            id,
            "r",
            0,
            0,
            frames(start),
            frames(start + clip_frames as i64),
            RegionData::Audio(AudioRegionData {
                clip,
                pool_id: 0,
                gain: 1.0,
                musical_mode: false,
                clip_bpm: 120.0,
            }),
        )
    }

    #[test]
    fn test_validate_loop_within_clip() {
        let mut region = audio_region(1, 0, 100);
        assert!(region.validate().is_ok());
        region.loop_end = frames(200);
        assert_eq!(region.validate(), Err(RegionError::InvalidRange));
    }

    #[test]
    fn test_validate_positions() {
        let mut region = audio_region(1, 100, 50);
        region.end = frames(100);
        assert_eq!(region.validate(), Err(RegionError::InvalidPosition));
    }

    #[test]
    fn test_hit_by_range() {
        let region = audio_region(1, 100, 50);
        assert!(region.is_hit_by_range(120, 130));
        assert!(region.is_hit_by_range(90, 101));
        assert!(!region.is_hit_by_range(150, 200));
        assert!(!region.is_hit_by_range(0, 100));
    }

    #[test]
    fn test_content_frame_wraps_at_loop_end() {
        let mut region = audio_region(1, 0, 100);
        region.end = frames(250);
        region.loop_start = frames(20);
        region.loop_end = frames(100);
        // First pass runs clip_start(0)..loop_end(100)
        assert_eq!(region.content_frame_at(0), 0);
        assert_eq!(region.content_frame_at(99), 99);
        // Then wraps into [20, 100)
        assert_eq!(region.content_frame_at(100), 20);
        assert_eq!(region.content_frame_at(179), 99);
        assert_eq!(region.content_frame_at(180), 20);
    }

    #[test]
    fn test_builtin_edge_fades() {
        let region = audio_region(1, 0, 100);
        assert_eq!(region.fade_gain(0), 0.0);
        assert!(region.fade_gain(5) > 0.0 && region.fade_gain(5) < 1.0);
        assert_eq!(region.fade_gain(50), 1.0);
        assert!(region.fade_gain(95) < 1.0);
    }

    #[test]
    fn test_user_fade_in() {
        let mut region = audio_region(1, 0, 100);
        region.fade_in = frames(40);
        let quarter = region.fade_gain(20);
        assert!((quarter - 0.5).abs() < 0.01, "got {}", quarter);
    }

    #[test]
    fn test_lane_keeps_regions_sorted() {
        let mut lane = TrackLane::new("lane 1");
        lane.add_region(audio_region(1, 500, 10));
        lane.add_region(audio_region(2, 100, 10));
        lane.add_region(audio_region(3, 300, 10));
        let starts: Vec<i64> = lane.regions.iter().map(|r| r.start.frames).collect();
        assert_eq!(starts, vec![100, 300, 500]);
    }

    #[test]
    fn test_grow_to_extends_loop() {
        let mut region = audio_region(1, 0, 100);
        region.grow_to(frames(150));
        assert_eq!(region.end.frames, 150);
        assert_eq!(region.loop_end.frames, 150);
    }
}
