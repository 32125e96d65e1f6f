use crate::io::audio_file::{self, AudioFileData, AudioFileError, BitDepth};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Pool clip ID type
pub type PoolId = u32;

/// Errors from audio pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audio file error: {0}")]
    File(#[from] AudioFileError),
    #[error("no clip with pool id {0}")]
    UnknownClip(PoolId),
    #[error("content hash mismatch reloading clip '{0}'")]
    HashMismatch(String),
    #[error("pool file missing: {0}")]
    MissingFile(PathBuf),
}

/// Immutable decoded sample data shared between the pool and regions
///
/// Regions keep an `Arc` to this so the audio thread reads stable buffers no
/// matter what the pool does with the clip's bookkeeping.
#[derive(Debug)]
pub struct ClipFrames {
    /// Interleaved samples, `frames[frame * channels + ch]`
    pub interleaved: Vec<f32>,
    /// Per-channel mirror of `interleaved`
    pub ch_frames: Vec<Vec<f32>>,
    /// Frames per channel
    pub num_frames: u64,
    pub channels: u32,
    /// Sample rate the decoded data is stored at
    pub samplerate: u32,
}

impl ClipFrames {
    /// Build from interleaved samples, generating the per-channel mirrors
    pub fn from_interleaved(interleaved: Vec<f32>, channels: u32, samplerate: u32) -> Self {
        let channels = channels.max(1);
        let num_frames = (interleaved.len() / channels as usize) as u64;
        let mut ch_frames = vec![Vec::with_capacity(num_frames as usize); channels as usize];
        for (i, sample) in interleaved.iter().enumerate() {
            ch_frames[i % channels as usize].push(*sample);
        }
        Self {
            interleaved,
            ch_frames,
            num_frames,
            channels,
            samplerate,
        }
    }

    /// Sample for a channel at a frame index, zero past the end
    pub fn sample(&self, channel: u32, frame: u64) -> f32 {
        if frame >= self.num_frames {
            return 0.0;
        }
        let ch = (channel % self.channels) as usize;
        self.ch_frames[ch][frame as usize]
    }
}

/// Audio clip owned by the pool
///
/// Bookkeeping (name, hash, write progress) is mutable pool state; the sample
/// data itself is frozen behind an `Arc` once created.
#[derive(Debug)]
pub struct AudioClip {
    /// Pool-unique name
    pub name: String,
    /// Decoded sample data
    pub frames: Arc<ClipFrames>,
    /// Sample rate of the source file when imported
    pub orig_samplerate: u32,
    pub bit_depth: BitDepth,
    /// Project BPM when the clip entered the pool
    pub bpm: f32,
    pub pool_id: PoolId,
    /// XXH3-64 of the file as last written/read
    pub file_hash: Option<u64>,
    /// Whether the pool file is FLAC rather than WAV
    pub use_flac: bool,
    /// Frames already flushed to the file during chunked recording
    pub frames_written: u64,
    /// Time of the last chunked write
    pub last_write: Option<Instant>,
}

impl AudioClip {
    /// Create a clip from a decoded file
    pub fn from_file<P: AsRef<Path>>(path: P, bpm: f32) -> Result<Self, AudioFileError> {
        let decoded = AudioFileData::load(path.as_ref())?;
        let name = path
            .as_ref()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("clip")
            .to_string();
        let use_flac = matches!(
            path.as_ref().extension().and_then(|e| e.to_str()),
            Some("flac") | Some("FLAC")
        ) && decoded.bit_depth != BitDepth::B32;
        Ok(Self {
            name,
            frames: Arc::new(ClipFrames::from_interleaved(
                decoded.data,
                decoded.channels,
                decoded.sample_rate,
            )),
            orig_samplerate: decoded.sample_rate,
            bit_depth: decoded.bit_depth,
            bpm,
            pool_id: 0,
            file_hash: None,
            use_flac,
            frames_written: 0,
            last_write: None,
        })
    }

    /// Create a clip from raw interleaved samples
    pub fn from_float_array(
        name: impl Into<String>,
        interleaved: Vec<f32>,
        channels: u32,
        samplerate: u32,
        bpm: f32,
        bit_depth: BitDepth,
    ) -> Self {
        Self {
            name: name.into(),
            frames: Arc::new(ClipFrames::from_interleaved(
                interleaved,
                channels,
                samplerate,
            )),
            orig_samplerate: samplerate,
            bit_depth,
            bpm,
            pool_id: 0,
            file_hash: None,
            use_flac: bit_depth != BitDepth::B32,
            frames_written: 0,
            last_write: None,
        }
    }

    /// Frames per channel
    pub fn num_frames(&self) -> u64 {
        self.frames.num_frames
    }

    /// File extension for this clip's pool file
    pub fn extension(&self) -> &'static str {
        if self.use_flac {
            "flac"
        } else {
            "wav"
        }
    }

    /// Replace the sample data (recording growth, reload)
    pub fn set_frames(&mut self, frames: Arc<ClipFrames>) {
        self.frames = frames;
    }
}

/// Filesystem-safe version of a clip name
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Pool of audio clips backing regions and recordings
///
/// Files live under `<project>/pool/`; a parallel `pool.backup/` directory
/// receives copies when project backups are taken. All pool mutation happens
/// on the UI thread; the audio thread only reads clip frames through region
/// `Arc`s.
pub struct AudioPool {
    clips: Vec<Option<AudioClip>>,
    pool_dir: PathBuf,
    backup_dir: PathBuf,
}

impl AudioPool {
    /// Create a pool rooted at the given project directory
    pub fn new<P: AsRef<Path>>(project_dir: P) -> Self {
        Self {
            clips: Vec::new(),
            pool_dir: project_dir.as_ref().join("pool"),
            backup_dir: project_dir.as_ref().join("pool.backup"),
        }
    }

    /// Directory holding the main pool files
    pub fn pool_dir(&self) -> &Path {
        &self.pool_dir
    }

    /// Full path for a clip's file
    pub fn clip_path(&self, clip: &AudioClip, backup: bool) -> PathBuf {
        let dir = if backup { &self.backup_dir } else { &self.pool_dir };
        dir.join(format!("{}.{}", sanitize_name(&clip.name), clip.extension()))
    }

    /// Number of live clips
    pub fn len(&self) -> usize {
        self.clips.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live clips
    pub fn clips(&self) -> impl Iterator<Item = &AudioClip> {
        self.clips.iter().filter_map(|c| c.as_ref())
    }

    /// Add a clip, renaming it to be unique within the pool
    pub fn add_clip(&mut self, mut clip: AudioClip) -> PoolId {
        clip.name = self.generate_unique_name(&clip.name);
        let id = self
            .clips
            .iter()
            .position(|c| c.is_none())
            .unwrap_or(self.clips.len());
        clip.pool_id = id as PoolId;
        log::debug!("pool: adding clip '{}' as id {}", clip.name, id);
        if id == self.clips.len() {
            self.clips.push(Some(clip));
        } else {
            self.clips[id] = Some(clip);
        }
        id as PoolId
    }

    /// Get a clip by id
    pub fn get_clip(&self, id: PoolId) -> Option<&AudioClip> {
        self.clips.get(id as usize)?.as_ref()
    }

    /// Get a mutable clip by id
    pub fn get_clip_mut(&mut self, id: PoolId) -> Option<&mut AudioClip> {
        self.clips.get_mut(id as usize)?.as_mut()
    }

    /// Duplicate a clip, optionally writing the copy's file immediately
    pub fn duplicate_clip(&mut self, id: PoolId, write_file: bool) -> Result<PoolId, PoolError> {
        let src = self
            .get_clip(id)
            .ok_or(PoolError::UnknownClip(id))?;
        let copy = AudioClip {
            name: src.name.clone(),
            frames: Arc::clone(&src.frames),
            orig_samplerate: src.orig_samplerate,
            bit_depth: src.bit_depth,
            bpm: src.bpm,
            pool_id: 0,
            file_hash: src.file_hash,
            use_flac: src.use_flac,
            frames_written: 0,
            last_write: None,
        };
        let new_id = self.add_clip(copy);
        if write_file {
            self.write_clip(new_id, false, false)?;
        }
        Ok(new_id)
    }

    /// Remove a clip, optionally deleting its file
    pub fn remove_clip(
        &mut self,
        id: PoolId,
        delete_file: bool,
        backup: bool,
    ) -> Result<(), PoolError> {
        let clip = self
            .clips
            .get_mut(id as usize)
            .and_then(|c| c.take())
            .ok_or(PoolError::UnknownClip(id))?;
        if delete_file {
            let path = self.clip_path(&clip, backup);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Remove every clip whose id is absent from `in_use`
    ///
    /// The caller assembles `in_use` from all regions across all tracks plus
    /// any pool ids still referenced by undo history. Returns the number of
    /// clips removed.
    pub fn remove_unused(
        &mut self,
        in_use: &HashSet<PoolId>,
        backup: bool,
    ) -> Result<usize, PoolError> {
        let unused: Vec<PoolId> = self
            .clips()
            .filter(|c| !in_use.contains(&c.pool_id))
            .map(|c| c.pool_id)
            .collect();
        for id in &unused {
            log::info!("pool: removing unused clip {}", id);
            self.remove_clip(*id, true, backup)?;
        }
        Ok(unused.len())
    }

    /// Write a clip's file
    ///
    /// With `parts`, only frames `[frames_written, num_frames)` are appended
    /// (chunked recording); otherwise the whole clip is written. Writes are
    /// skipped when the file already matches the stored content hash.
    pub fn write_clip(&mut self, id: PoolId, parts: bool, backup: bool) -> Result<(), PoolError> {
        let dir = if backup { &self.backup_dir } else { &self.pool_dir };
        std::fs::create_dir_all(dir)?;

        let main_path;
        let path;
        {
            let clip = self.get_clip(id).ok_or(PoolError::UnknownClip(id))?;
            main_path = self.clip_path(clip, false);
            path = self.clip_path(clip, backup);

            if !parts {
                // Identical content already on disk: skip the write
                if let (Some(stored), Ok(bytes)) = (clip.file_hash, std::fs::read(&path)) {
                    if xxhash_rust::xxh3::xxh3_64(&bytes) == stored {
                        return Ok(());
                    }
                }
                // Backup writes reuse the main pool file when it matches;
                // same-volume copies take the reflink path on capable
                // filesystems
                if backup && main_path.exists() {
                    if let (Some(stored), Ok(bytes)) =
                        (clip.file_hash, std::fs::read(&main_path))
                    {
                        if xxhash_rust::xxh3::xxh3_64(&bytes) == stored {
                            std::fs::copy(&main_path, &path)?;
                            return Ok(());
                        }
                    }
                }
            }
        }

        let clip = self
            .clips
            .get_mut(id as usize)
            .and_then(|c| c.as_mut())
            .ok_or(PoolError::UnknownClip(id))?;
        let frames = Arc::clone(&clip.frames);
        let channels = frames.channels;

        if parts {
            let start = (clip.frames_written * channels as u64) as usize;
            let end = (frames.num_frames * channels as u64) as usize;
            if start >= end {
                return Ok(());
            }
            let chunk = &frames.interleaved[start..end];
            if clip.use_flac {
                // FLAC cannot be appended to; rewrite the whole stream
                audio_file::write_flac(
                    &path,
                    &frames.interleaved[..end],
                    channels,
                    frames.samplerate,
                    clip.bit_depth,
                )?;
            } else if clip.frames_written == 0 || !path.exists() {
                audio_file::write_wav(&path, chunk, channels, frames.samplerate, clip.bit_depth)?;
            } else {
                audio_file::append_wav(&path, chunk, clip.bit_depth)?;
            }
            clip.frames_written = frames.num_frames;
            clip.last_write = Some(Instant::now());
        } else {
            if clip.use_flac {
                audio_file::write_flac(
                    &path,
                    &frames.interleaved,
                    channels,
                    frames.samplerate,
                    clip.bit_depth,
                )?;
            } else {
                audio_file::write_wav(
                    &path,
                    &frames.interleaved,
                    channels,
                    frames.samplerate,
                    clip.bit_depth,
                )?;
            }
            clip.frames_written = frames.num_frames;
            clip.last_write = Some(Instant::now());
        }

        // Refresh the content hash from what actually landed on disk
        let bytes = std::fs::read(&path)?;
        clip.file_hash = Some(xxhash_rust::xxh3::xxh3_64(&bytes));
        Ok(())
    }

    /// Re-read every clip's frames from its pool file
    ///
    /// A clip whose file hash no longer matches is reported (and the file
    /// kept); a missing file fails that clip but not the rest.
    pub fn reload_frame_bufs(&mut self) -> Vec<(PoolId, PoolError)> {
        let ids: Vec<PoolId> = self.clips().map(|c| c.pool_id).collect();
        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.reload_clip(id) {
                log::error!("pool: reload of clip {} failed: {}", id, e);
                failures.push((id, e));
            }
        }
        failures
    }

    fn reload_clip(&mut self, id: PoolId) -> Result<(), PoolError> {
        let (path, stored_hash, name) = {
            let clip = self.get_clip(id).ok_or(PoolError::UnknownClip(id))?;
            (
                self.clip_path(clip, false),
                clip.file_hash,
                clip.name.clone(),
            )
        };
        if !path.exists() {
            return Err(PoolError::MissingFile(path));
        }
        let bytes = std::fs::read(&path)?;
        let disk_hash = xxhash_rust::xxh3::xxh3_64(&bytes);

        let decoded = AudioFileData::load(&path)?;
        let clip = self
            .get_clip_mut(id)
            .ok_or(PoolError::UnknownClip(id))?;
        clip.set_frames(Arc::new(ClipFrames::from_interleaved(
            decoded.data,
            decoded.channels,
            decoded.sample_rate,
        )));
        clip.frames_written = clip.frames.num_frames;

        if let Some(stored) = stored_hash {
            if stored != disk_hash {
                clip.file_hash = Some(disk_hash);
                return Err(PoolError::HashMismatch(name));
            }
        } else {
            clip.file_hash = Some(disk_hash);
        }
        Ok(())
    }

    /// Append " (N)" until the name is unique within the pool
    fn generate_unique_name(&self, name: &str) -> String {
        let taken = |candidate: &str| self.clips().any(|c| c.name == candidate);
        if !taken(name) {
            return name.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{} ({})", name, n);
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_clip(name: &str) -> AudioClip {
        AudioClip::from_float_array(
            name,
            vec![0.0, 0.1, 0.2, 0.3],
            2,
            44100,
            120.0,
            BitDepth::B32,
        )
    }

    #[test]
    fn test_channel_mirrors() {
        let frames = ClipFrames::from_interleaved(vec![0.1, 0.2, 0.3, 0.4], 2, 44100);
        assert_eq!(frames.num_frames, 2);
        assert_eq!(frames.ch_frames[0], vec![0.1, 0.3]);
        assert_eq!(frames.ch_frames[1], vec![0.2, 0.4]);
        // Mono fanout wraps channel indices
        assert_eq!(frames.sample(3, 1), frames.sample(1, 1));
        // Past the end is silence
        assert_eq!(frames.sample(0, 2), 0.0);
    }

    #[test]
    fn test_unique_naming() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = AudioPool::new(dir.path());
        let a = pool.add_clip(test_clip("take"));
        let b = pool.add_clip(test_clip("take"));
        let c = pool.add_clip(test_clip("take"));
        assert_eq!(pool.get_clip(a).unwrap().name, "take");
        assert_eq!(pool.get_clip(b).unwrap().name, "take (1)");
        assert_eq!(pool.get_clip(c).unwrap().name, "take (2)");
    }

    #[test]
    fn test_remove_unused() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = AudioPool::new(dir.path());
        let a = pool.add_clip(test_clip("a"));
        let b = pool.add_clip(test_clip("b"));

        let mut in_use = HashSet::new();
        in_use.insert(a);
        let removed = pool.remove_unused(&in_use, false).unwrap();
        assert_eq!(removed, 1);
        assert!(pool.get_clip(a).is_some());
        assert!(pool.get_clip(b).is_none());
    }

    #[test]
    fn test_duplicate_shares_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = AudioPool::new(dir.path());
        let a = pool.add_clip(test_clip("dup"));
        let b = pool.duplicate_clip(a, false).unwrap();
        assert_ne!(a, b);
        let ca = pool.get_clip(a).unwrap();
        let cb = pool.get_clip(b).unwrap();
        assert_eq!(cb.name, "dup (1)");
        assert!(Arc::ptr_eq(&ca.frames, &cb.frames));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("kick/loop:2"), "kick_loop_2");
        assert_eq!(sanitize_name("plain name-1.old"), "plain name-1.old");
    }
}
