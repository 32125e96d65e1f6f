use crate::audio::port::PortArena;
use crate::audio::track::{name_hash, Track, TrackId, TrackKind};
use std::collections::HashMap;

/// Ordered collection of all tracks in the project
///
/// Pinned tracks sort before unpinned ones; the chord, tempo, marker,
/// modulator and master tracks are singletons looked up by kind.
pub struct Tracklist {
    tracks: Vec<Track>,
    by_name_hash: HashMap<u64, TrackId>,
    next_id: TrackId,
}

impl Tracklist {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            by_name_hash: HashMap::new(),
            next_id: 0,
        }
    }

    /// Next unused track id
    pub fn allocate_id(&mut self) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Number of tracks
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Append a track at the given position (clamped), keeping pinned tracks
    /// at the front
    pub fn insert_track(&mut self, track: Track, pos: usize) -> TrackId {
        let id = track.id;
        self.by_name_hash.insert(track.name_hash(), id);
        let pinned_end = self.tracks.iter().take_while(|t| t.pinned).count();
        let pos = if track.pinned {
            pos.min(pinned_end)
        } else {
            pos.max(pinned_end).min(self.tracks.len())
        };
        self.tracks.insert(pos, track);
        id
    }

    /// Append a track at the end
    pub fn append_track(&mut self, track: Track) -> TrackId {
        let end = self.tracks.len();
        self.insert_track(track, end)
    }

    /// Remove a track by id
    pub fn remove_track(&mut self, id: TrackId) -> Option<Track> {
        let idx = self.tracks.iter().position(|t| t.id == id)?;
        let track = self.tracks.remove(idx);
        self.by_name_hash.remove(&track.name_hash());
        Some(track)
    }

    /// Move a track to a new index
    pub fn move_track(&mut self, id: TrackId, new_pos: usize) -> bool {
        let Some(idx) = self.tracks.iter().position(|t| t.id == id) else {
            return false;
        };
        let track = self.tracks.remove(idx);
        let new_pos = new_pos.min(self.tracks.len());
        self.tracks.insert(new_pos, track);
        true
    }

    /// Track by id
    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Mutable track by id
    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// Track by name hash (cross-thread identification)
    pub fn track_by_name_hash(&self, hash: u64) -> Option<&Track> {
        self.by_name_hash.get(&hash).and_then(|id| self.track(*id))
    }

    /// Track by name
    pub fn track_by_name(&self, name: &str) -> Option<&Track> {
        self.track_by_name_hash(name_hash(name))
    }

    /// Iterate tracks in tracklist order
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.iter_mut()
    }

    /// Iterate only pinned tracks
    pub fn pinned(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.pinned)
    }

    /// First track of the given kind (singleton lookup)
    pub fn singleton(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// The master track
    pub fn master(&self) -> Option<&Track> {
        self.singleton(TrackKind::Master)
    }

    /// Fold or unfold a foldable track
    pub fn set_folded(&mut self, id: TrackId, folded: bool) -> bool {
        match self.track_mut(id) {
            Some(track) if track.kind.is_foldable() => {
                track.folded = folded;
                true
            }
            _ => false,
        }
    }

    /// Whether any track's fader solo is on
    pub fn any_soloed(&self, arena: &PortArena) -> bool {
        self.tracks.iter().any(|t| t.is_soloed(arena))
    }

    /// Whether a track is soloed directly or feeds a path containing a solo
    ///
    /// Parents of a soloed track stay audible so the soloed signal reaches
    /// the master bus.
    pub fn effectively_soloed(&self, id: TrackId, arena: &PortArena) -> bool {
        let Some(track) = self.track(id) else {
            return false;
        };
        if track.is_soloed(arena) {
            return true;
        }
        // Upstream solo: any soloed track whose output chain passes through
        // this track
        self.tracks.iter().any(|t| {
            t.is_soloed(arena) && self.routes_through(t.id, id)
        })
    }

    /// Whether `src`'s channel output chain reaches `dest`
    pub fn routes_through(&self, src: TrackId, dest: TrackId) -> bool {
        let mut current = src;
        let mut hops = 0;
        while hops < self.tracks.len() {
            let Some(track) = self.track(current) else {
                return false;
            };
            let Some(out) = track.channel.as_ref().and_then(|c| c.output) else {
                return false;
            };
            if out == dest {
                return true;
            }
            current = out;
            hops += 1;
        }
        false
    }

    /// Rename a track, keeping the name-hash index in sync
    pub fn rename_track(&mut self, id: TrackId, name: impl Into<String>) -> bool {
        let Some(idx) = self.tracks.iter().position(|t| t.id == id) else {
            return false;
        };
        let old_hash = self.tracks[idx].name_hash();
        self.by_name_hash.remove(&old_hash);
        self.tracks[idx].name = name.into();
        self.by_name_hash.insert(self.tracks[idx].name_hash(), id);
        true
    }
}

impl Default for Tracklist {
    fn default() -> Self {
        Self::new()
    }
}
