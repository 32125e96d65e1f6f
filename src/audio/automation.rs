use crate::audio::port::PortId;
use crate::audio::position::Position;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How long after the last value change Touch mode keeps recording
pub const TOUCH_RELEASE: Duration = Duration::from_millis(800);

/// Type of interpolation curve between automation points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CurveType {
    /// Linear interpolation (straight line)
    Linear,
    /// Exponential curve (smooth acceleration)
    Exponential,
    /// S-curve (ease in/out)
    SCurve,
    /// Step (no interpolation, jump to next value)
    Step,
}

/// A single automation point
///
/// `value` is normalized 0.0..1.0 against the bound port's range; `pos` is
/// relative to the owning region's start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    pub pos: Position,
    pub value: f32,
    pub curve: CurveType,
}

impl AutomationPoint {
    /// Create a new automation point
    pub fn new(pos: Position, value: f32, curve: CurveType) -> Self {
        Self { pos, value, curve }
    }
}

/// Interpolate between two automation points based on curve type
pub fn interpolate(p1: &AutomationPoint, p2: &AutomationPoint, ticks: f64) -> f32 {
    // Normalized position between points (0.0 to 1.0)
    let t = if p2.pos.ticks == p1.pos.ticks {
        0.0
    } else {
        ((ticks - p1.pos.ticks) / (p2.pos.ticks - p1.pos.ticks)) as f32
    };

    let curved_t = match p1.curve {
        CurveType::Linear => t,
        CurveType::Exponential => t * t,
        CurveType::SCurve => smoothstep(t),
        CurveType::Step => {
            // Hold value until the next point
            return p1.value;
        }
    };

    p1.value + (p2.value - p1.value) * curved_t
}

/// Smoothstep function for S-curve interpolation
#[inline]
fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Evaluate a sorted point list at a tick offset
///
/// Returns `None` when the list is empty; before the first point the first
/// value holds, after the last the last value holds.
pub fn evaluate_points(points: &[AutomationPoint], ticks: f64) -> Option<f32> {
    if points.is_empty() {
        return None;
    }
    if ticks <= points[0].pos.ticks {
        return Some(points[0].value);
    }
    let last = &points[points.len() - 1];
    if ticks >= last.pos.ticks {
        return Some(last.value);
    }
    for pair in points.windows(2) {
        if ticks >= pair[0].pos.ticks && ticks <= pair[1].pos.ticks {
            return Some(interpolate(&pair[0], &pair[1], ticks));
        }
    }
    None
}

/// Insert a point into a sorted list, replacing any point at the same tick
pub fn insert_point(points: &mut Vec<AutomationPoint>, point: AutomationPoint) {
    let pos = points.binary_search_by(|p| {
        p.pos
            .ticks
            .partial_cmp(&point.pos.ticks)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    match pos {
        Ok(idx) => points[idx] = point,
        Err(idx) => points.insert(idx, point),
    }
}

/// Recording behavior of an automation track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutomationRecordMode {
    /// Record only while the value is actively changing
    Touch,
    /// Keep recording from the first change until transport stops
    Latch,
}

/// An automation lane bound to exactly one control port
pub struct AutomationTrack {
    /// Index within the owning track's automation tracklist
    pub index: usize,
    /// The control port this lane drives
    pub port: PortId,
    /// Regions on this lane, ordered by start position
    pub regions: Vec<crate::audio::region::Region>,
    /// Whether recorded automation is applied during playback
    pub read_automation: bool,
    /// Whether this lane is armed for automation recording
    pub armed: bool,
    pub record_mode: AutomationRecordMode,

    /// Region currently being written by the recording consumer
    pub recording_region: Option<crate::audio::region::RegionId>,
    /// Last value written, for change detection
    pub last_recorded_value: f32,
    /// Region-local tick of the last recorded point
    pub last_recorded_ap_ticks: Option<f64>,
    pub recording_started: bool,
    pub recording_paused: bool,
    pub recording_start_sent: bool,
    /// When the bound port's value last moved
    pub last_change: Option<Instant>,
}

impl AutomationTrack {
    /// Create a lane bound to a control port
    pub fn new(index: usize, port: PortId) -> Self {
        Self {
            index,
            port,
            regions: Vec::new(),
            read_automation: true,
            armed: false,
            record_mode: AutomationRecordMode::Touch,
            recording_region: None,
            last_recorded_value: 0.0,
            last_recorded_ap_ticks: None,
            recording_started: false,
            recording_paused: false,
            recording_start_sent: false,
            last_change: None,
        }
    }

    /// Note that the bound port's value changed
    pub fn touch(&mut self, now: Instant) {
        self.last_change = Some(now);
    }

    /// Whether this lane should be producing recording events right now
    ///
    /// Touch mode records while the value changed within the release window;
    /// Latch keeps recording once started.
    pub fn should_be_recording(&self, now: Instant) -> bool {
        if !self.armed {
            return false;
        }
        let changed_recently = self
            .last_change
            .map(|t| now.duration_since(t) <= TOUCH_RELEASE)
            .unwrap_or(false);
        match self.record_mode {
            AutomationRecordMode::Touch => changed_recently,
            AutomationRecordMode::Latch => self.recording_started || changed_recently,
        }
    }

    /// Evaluate the lane at an absolute position, normalized 0..1
    pub fn evaluate(&self, pos: &Position) -> Option<f32> {
        if !self.read_automation {
            return None;
        }
        for region in &self.regions {
            if region.muted {
                continue;
            }
            if pos.frames >= region.start.frames && pos.frames < region.end.frames {
                let local_ticks = pos.ticks - region.start.ticks;
                if let crate::audio::region::RegionData::Automation(data) = &region.data {
                    return evaluate_points(&data.points, local_ticks);
                }
            }
        }
        None
    }

    /// Find a region on this lane by id
    pub fn region_mut(
        &mut self,
        id: crate::audio::region::RegionId,
    ) -> Option<&mut crate::audio::region::Region> {
        self.regions.iter_mut().find(|r| r.id == id)
    }

    /// Reset recording bookkeeping after a stop
    pub fn clear_recording_state(&mut self) {
        self.recording_region = None;
        self.recording_started = false;
        self.recording_paused = false;
        self.recording_start_sent = false;
        self.last_recorded_ap_ticks = None;
    }
}

/// The set of automation lanes on one track
pub struct AutomationTracklist {
    tracks: Vec<AutomationTrack>,
}

impl AutomationTracklist {
    pub fn new() -> Self {
        Self { tracks: Vec::new() }
    }

    /// Add a lane for a control port, returning its index
    pub fn add(&mut self, port: PortId) -> usize {
        let index = self.tracks.len();
        self.tracks.push(AutomationTrack::new(index, port));
        index
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AutomationTrack> {
        self.tracks.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut AutomationTrack> {
        self.tracks.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AutomationTrack> {
        self.tracks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AutomationTrack> {
        self.tracks.iter_mut()
    }

    /// Lane bound to the given port, if any
    pub fn for_port(&self, port: PortId) -> Option<&AutomationTrack> {
        self.tracks.iter().find(|t| t.port == port)
    }
}

impl Default for AutomationTracklist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ticks: f64, value: f32, curve: CurveType) -> AutomationPoint {
        AutomationPoint::new(Position { frames: 0, ticks }, value, curve)
    }

    #[test]
    fn test_insert_points_sorted() {
        let mut points = Vec::new();
        insert_point(&mut points, point(2.0, 0.5, CurveType::Linear));
        insert_point(&mut points, point(1.0, 0.3, CurveType::Linear));
        insert_point(&mut points, point(3.0, 0.8, CurveType::Linear));

        assert_eq!(points.len(), 3);
        assert_eq!(points[0].pos.ticks, 1.0);
        assert_eq!(points[1].pos.ticks, 2.0);
        assert_eq!(points[2].pos.ticks, 3.0);
    }

    #[test]
    fn test_replace_point_at_same_time() {
        let mut points = Vec::new();
        insert_point(&mut points, point(1.0, 0.3, CurveType::Linear));
        insert_point(&mut points, point(1.0, 0.5, CurveType::Linear));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 0.5);
    }

    #[test]
    fn test_linear_interpolation() {
        let mut points = Vec::new();
        insert_point(&mut points, point(0.0, 0.0, CurveType::Linear));
        insert_point(&mut points, point(1.0, 1.0, CurveType::Linear));

        assert_eq!(evaluate_points(&points, 0.0), Some(0.0));
        assert_eq!(evaluate_points(&points, 0.5), Some(0.5));
        assert_eq!(evaluate_points(&points, 1.0), Some(1.0));
    }

    #[test]
    fn test_step_interpolation() {
        let mut points = Vec::new();
        insert_point(&mut points, point(0.0, 0.5, CurveType::Step));
        insert_point(&mut points, point(1.0, 1.0, CurveType::Step));

        assert_eq!(evaluate_points(&points, 0.5), Some(0.5));
        assert_eq!(evaluate_points(&points, 0.99), Some(0.5));
        assert_eq!(evaluate_points(&points, 1.0), Some(1.0));
    }

    #[test]
    fn test_evaluate_outside_range() {
        let mut points = Vec::new();
        insert_point(&mut points, point(1.0, 0.5, CurveType::Linear));
        insert_point(&mut points, point(2.0, 1.0, CurveType::Linear));

        assert_eq!(evaluate_points(&points, 0.0), Some(0.5));
        assert_eq!(evaluate_points(&points, 3.0), Some(1.0));
    }

    #[test]
    fn test_touch_release_window() {
        let mut at = AutomationTrack::new(0, 0);
        at.armed = true;
        let now = Instant::now();
        assert!(!at.should_be_recording(now));

        at.touch(now);
        assert!(at.should_be_recording(now));
        assert!(!at.should_be_recording(now + TOUCH_RELEASE + Duration::from_millis(1)));
    }

    #[test]
    fn test_latch_keeps_recording() {
        let mut at = AutomationTrack::new(0, 0);
        at.armed = true;
        at.record_mode = AutomationRecordMode::Latch;
        let now = Instant::now();

        at.touch(now);
        at.recording_started = true;
        // Long after the touch window Latch still records
        assert!(at.should_be_recording(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_unarmed_never_records() {
        let mut at = AutomationTrack::new(0, 0);
        let now = Instant::now();
        at.touch(now);
        assert!(!at.should_be_recording(now));
    }
}
