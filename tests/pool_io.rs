use daw_engine::audio::pool::{AudioClip, AudioPool};
use daw_engine::io::audio_file::{self, AudioFileData, BitDepth};
use std::collections::HashSet;
use std::sync::Arc;

fn sine(frames: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        let v = (i as f32 * 0.05).sin() * 0.8;
        data.push(v);
        data.push(v * 0.5);
    }
    data
}

#[test]
fn wav_32bit_pool_roundtrip_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = AudioPool::new(dir.path());
    let data = sine(1000);
    let id = pool.add_clip(AudioClip::from_float_array(
        "sine",
        data.clone(),
        2,
        44100,
        120.0,
        BitDepth::B32,
    ));

    pool.write_clip(id, false, false).unwrap();
    let failures = pool.reload_frame_bufs();
    assert!(failures.is_empty());

    let clip = pool.get_clip(id).unwrap();
    assert_eq!(clip.frames.interleaved, data);
    assert_eq!(clip.num_frames(), 1000);
}

#[test]
fn flac_pool_roundtrip_within_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = AudioPool::new(dir.path());
    let data = sine(2000);
    let id = pool.add_clip(AudioClip::from_float_array(
        "sine-flac",
        data.clone(),
        2,
        44100,
        120.0,
        BitDepth::B24,
    ));
    assert!(pool.get_clip(id).unwrap().use_flac);

    pool.write_clip(id, false, false).unwrap();
    let path = pool.clip_path(pool.get_clip(id).unwrap(), false);
    assert_eq!(path.extension().unwrap(), "flac");

    let failures = pool.reload_frame_bufs();
    assert!(failures.is_empty(), "{:?}", failures);
    let clip = pool.get_clip(id).unwrap();
    for (a, b) in data.iter().zip(clip.frames.interleaved.iter()) {
        assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
    }
}

#[test]
fn identical_content_write_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = AudioPool::new(dir.path());
    let id = pool.add_clip(AudioClip::from_float_array(
        "skip",
        sine(500),
        2,
        44100,
        120.0,
        BitDepth::B32,
    ));

    pool.write_clip(id, false, false).unwrap();
    let hash1 = pool.get_clip(id).unwrap().file_hash.unwrap();
    let path = pool.clip_path(pool.get_clip(id).unwrap(), false);
    let mtime1 = std::fs::metadata(&path).unwrap().modified().unwrap();

    // Unchanged content: the second write leaves the file untouched
    pool.write_clip(id, false, false).unwrap();
    let hash2 = pool.get_clip(id).unwrap().file_hash.unwrap();
    let mtime2 = std::fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(hash1, hash2);
    assert_eq!(mtime1, mtime2);
}

#[test]
fn chunked_parts_write_appends() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = AudioPool::new(dir.path());
    let first_half = sine(400);
    let id = pool.add_clip(AudioClip::from_float_array(
        "take",
        first_half.clone(),
        2,
        44100,
        120.0,
        BitDepth::B32,
    ));

    pool.write_clip(id, true, false).unwrap();
    assert_eq!(pool.get_clip(id).unwrap().frames_written, 400);

    // The clip grows (as during recording); a parts write appends the tail
    let full = sine(1000);
    pool.get_clip_mut(id).unwrap().set_frames(Arc::new(
        daw_engine::audio::pool::ClipFrames::from_interleaved(full.clone(), 2, 44100),
    ));
    pool.write_clip(id, true, false).unwrap();
    assert_eq!(pool.get_clip(id).unwrap().frames_written, 1000);

    let path = pool.clip_path(pool.get_clip(id).unwrap(), false);
    let loaded = AudioFileData::load(&path).unwrap();
    assert_eq!(loaded.frames, 1000);
    assert_eq!(loaded.data, full);
}

#[test]
fn duplicate_import_dedup_and_remove_unused() {
    let dir = tempfile::tempdir().unwrap();

    // An external file imported twice
    let src = dir.path().join("import.wav");
    audio_file::write_wav(&src, &sine(600), 2, 44100, BitDepth::B32).unwrap();

    let mut pool = AudioPool::new(dir.path());
    let a = pool.add_clip(AudioClip::from_file(&src, 120.0).unwrap());
    let b = pool.add_clip(AudioClip::from_file(&src, 120.0).unwrap());
    pool.write_clip(a, false, false).unwrap();
    pool.write_clip(b, false, false).unwrap();

    // Same content: identical hashes under distinct pool names
    let ca = pool.get_clip(a).unwrap();
    let cb = pool.get_clip(b).unwrap();
    assert_ne!(ca.name, cb.name);
    assert_eq!(ca.file_hash, cb.file_hash);
    let path_a = pool.clip_path(ca, false);
    let path_b = pool.clip_path(cb, false);

    // Removing one leaves the other alone
    pool.remove_clip(a, true, false).unwrap();
    assert!(!path_a.exists());
    assert!(path_b.exists());
    assert!(pool.get_clip(b).is_some());

    // Nothing references the rest: remove_unused clears the pool
    let removed = pool.remove_unused(&HashSet::new(), false).unwrap();
    assert_eq!(removed, 1);
    assert!(!path_b.exists());
    assert!(pool.is_empty());
}

#[test]
fn missing_file_fails_only_that_clip() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = AudioPool::new(dir.path());
    let good = pool.add_clip(AudioClip::from_float_array(
        "good",
        sine(100),
        2,
        44100,
        120.0,
        BitDepth::B32,
    ));
    let bad = pool.add_clip(AudioClip::from_float_array(
        "bad",
        sine(100),
        2,
        44100,
        120.0,
        BitDepth::B32,
    ));
    pool.write_clip(good, false, false).unwrap();
    pool.write_clip(bad, false, false).unwrap();

    let bad_path = pool.clip_path(pool.get_clip(bad).unwrap(), false);
    std::fs::remove_file(&bad_path).unwrap();

    let failures = pool.reload_frame_bufs();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, bad);
    // The good clip reloaded fine
    assert_eq!(pool.get_clip(good).unwrap().num_frames(), 100);
}

#[test]
fn backup_write_copies_main_pool_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = AudioPool::new(dir.path());
    let id = pool.add_clip(AudioClip::from_float_array(
        "c",
        sine(300),
        2,
        44100,
        120.0,
        BitDepth::B32,
    ));
    pool.write_clip(id, false, false).unwrap();
    pool.write_clip(id, false, true).unwrap();

    let main = pool.clip_path(pool.get_clip(id).unwrap(), false);
    let backup = pool.clip_path(pool.get_clip(id).unwrap(), true);
    assert!(main.exists());
    assert!(backup.exists());
    assert_eq!(
        std::fs::read(&main).unwrap(),
        std::fs::read(&backup).unwrap()
    );
}
