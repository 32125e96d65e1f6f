use crate::audio::engine::AudioEngine;
use crate::config::AudioBackend;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors from the backend adapter
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no output device available")]
    NoDevice,
    #[error("backend init failed: {0}")]
    InitFailed(String),
    #[error("stream error: {0}")]
    Stream(String),
}

/// A running audio backend driving the engine
///
/// The engine moves into the backend callback; stopping the stream returns
/// nothing (the engine lives as long as the stream).
pub enum OutputStream {
    Cpal(cpal::Stream),
    Dummy {
        stop: Arc<AtomicBool>,
        handle: Option<std::thread::JoinHandle<()>>,
    },
}

impl OutputStream {
    /// Stop the backend; the dummy thread is joined
    pub fn stop(&mut self) {
        match self {
            OutputStream::Cpal(stream) => {
                let _ = stream.pause();
            }
            OutputStream::Dummy { stop, handle } => {
                stop.store(true, Ordering::SeqCst);
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}

/// Start the configured backend, moving the engine into its callback
///
/// When no usable device is found the engine falls back to the dummy
/// driver with a one-time warning; a failure after the device was opened is
/// surfaced as an error.
pub fn start_backend(engine: AudioEngine) -> Result<OutputStream, BackendError> {
    let backend = engine.config.audio_backend;
    if backend == AudioBackend::Dummy {
        return Ok(start_dummy(engine));
    }

    // Probe the host before committing the engine to the callback
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        log::warn!(
            "audio backend {:?} has no output device; using Dummy",
            backend
        );
        return Ok(start_dummy(engine));
    };

    let sample_rate = engine.sample_rate();
    let block = engine.block_length();
    let config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Fixed(block),
    };

    let mut engine = engine;
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let frames = (data.len() / 2) as u32;
                engine.process_cycle(frames);
                engine.process_recording_events();
                engine.fill_output(data, 2);
            },
            |err| {
                log::error!("audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| BackendError::InitFailed(e.to_string()))?;
    stream
        .play()
        .map_err(|e| BackendError::Stream(e.to_string()))?;
    Ok(OutputStream::Cpal(stream))
}

/// Timer-driven dummy backend: pumps the engine at block-rate without a
/// device
fn start_dummy(mut engine: AudioEngine) -> OutputStream {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let block = engine.block_length();
    let sample_rate = engine.sample_rate();
    let period = std::time::Duration::from_secs_f64(block as f64 / sample_rate as f64);

    let handle = std::thread::Builder::new()
        .name("dummy-audio".to_string())
        .spawn(move || {
            let mut sink = vec![0.0f32; block as usize * 2];
            while !stop_flag.load(Ordering::SeqCst) {
                let started = std::time::Instant::now();
                engine.process_cycle(block);
                engine.process_recording_events();
                engine.fill_output(&mut sink, 2);
                let elapsed = started.elapsed();
                if elapsed < period {
                    std::thread::sleep(period - elapsed);
                }
            }
        })
        .expect("failed to spawn dummy audio thread");

    OutputStream::Dummy {
        stop,
        handle: Some(handle),
    }
}
