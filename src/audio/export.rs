use crate::audio::engine::AudioEngine;
use crate::io::audio_file::{AudioFileError, BitDepth};
use std::path::Path;

/// Render the project between two absolute frames into a stereo WAV file
///
/// Drives the engine offline with the backend bypassed; the engine must not
/// be attached to a live backend while this runs. The transport is restored
/// to its previous position afterwards.
pub fn render_to_file<P: AsRef<Path>>(
    engine: &mut AudioEngine,
    start_frame: i64,
    end_frame: i64,
    path: P,
    bit_depth: BitDepth,
) -> Result<(), AudioFileError> {
    let block = engine.block_length();
    let sample_rate = engine.sample_rate();
    let prev_playhead = engine.transport.playhead.frames;
    let prev_loop = engine.transport.loop_enabled;

    engine.transport.loop_enabled = false;
    engine.transport.set_playhead(start_frame.max(0));
    engine.transport.request_roll();

    let total_frames = (end_frame - start_frame).max(0) as u64;
    let mut interleaved = Vec::with_capacity((total_frames * 2) as usize);
    let mut scratch = vec![0.0f32; block as usize * 2];

    // Latency pre-roll at roll start produces frames before the playhead
    // moves, so render until the playhead reaches the end and trim after
    while engine.transport.playhead.frames < end_frame {
        let remaining = (end_frame - engine.transport.playhead.frames) as u32;
        let this_block = block.min(remaining.max(1));
        engine.process_cycle(this_block);
        engine.fill_output(&mut scratch[..this_block as usize * 2], 2);
        interleaved.extend_from_slice(&scratch[..this_block as usize * 2]);
    }
    // Drop the pre-roll head so the file starts at `start_frame`
    let head = interleaved.len().saturating_sub((total_frames * 2) as usize);
    let trimmed = &interleaved[head..];

    // Restore the transport
    engine.transport.request_pause();
    engine.transport.transition();
    engine.transport.set_playhead(prev_playhead);
    engine.transport.loop_enabled = prev_loop;

    crate::io::audio_file::write_wav(path, trimmed, 2, sample_rate, bit_depth)
}
