use serde::{Deserialize, Serialize};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

/// Errors from audio file decode/encode
#[derive(Debug, Error)]
pub enum AudioFileError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode {0}")]
    Decode(String),
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("failed to encode: {0}")]
    Encode(String),
}

/// Sample bit depth for pool files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitDepth {
    B16,
    B24,
    B32,
}

impl BitDepth {
    /// Bits per sample
    pub fn bits(&self) -> u16 {
        match self {
            BitDepth::B16 => 16,
            BitDepth::B24 => 24,
            BitDepth::B32 => 32,
        }
    }

    /// Closest supported depth for a bit count reported by a decoder
    pub fn from_bits(bits: u32) -> Self {
        match bits {
            0..=16 => BitDepth::B16,
            17..=24 => BitDepth::B24,
            _ => BitDepth::B32,
        }
    }
}

/// Decoded audio file: interleaved f32 samples plus stream parameters
pub struct AudioFileData {
    pub data: Vec<f32>,
    pub channels: u32,
    pub sample_rate: u32,
    pub frames: u64,
    pub bit_depth: BitDepth,
}

impl AudioFileData {
    /// Load an audio file from disk and decode it to interleaved f32 samples
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AudioFileError> {
        let path = path.as_ref();

        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Create a probe hint using the file extension
        let mut hint = Hint::new();
        if let Some(extension) = path.extension() {
            if let Some(ext_str) = extension.to_str() {
                hint.with_extension(ext_str);
            }
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioFileError::Decode(format!("probe failed: {}", e)))?;

        let mut format = probed.format;

        // Find the default audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
            .ok_or_else(|| AudioFileError::Decode("no audio tracks found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let channels = codec_params
            .channels
            .ok_or_else(|| AudioFileError::Decode("channel count not specified".to_string()))?
            .count() as u32;
        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| AudioFileError::Decode("sample rate not specified".to_string()))?;
        let bit_depth = BitDepth::from_bits(codec_params.bits_per_sample.unwrap_or(32));

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| AudioFileError::Decode(format!("decoder init failed: {}", e)))?;

        // Decode all packets
        let mut audio_data = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    return Err(AudioFileError::Decode(
                        "decoder reset required".to_string(),
                    ));
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => {
                    return Err(AudioFileError::Decode(format!("read failed: {}", e)));
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    if sample_buf.is_none() {
                        let spec = *decoded.spec();
                        let duration = decoded.capacity() as u64;
                        sample_buf = Some(SampleBuffer::<f32>::new(duration, spec));
                    }
                    if let Some(ref mut buf) = sample_buf {
                        buf.copy_interleaved_ref(decoded);
                        audio_data.extend_from_slice(buf.samples());
                    }
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Recoverable; skip the damaged packet
                    log::warn!("decode error in {}: {}", path.display(), e);
                    continue;
                }
                Err(e) => {
                    return Err(AudioFileError::Decode(format!("decode failed: {}", e)));
                }
            }
        }

        let frames = (audio_data.len() / channels as usize) as u64;
        Ok(Self {
            data: audio_data,
            channels,
            sample_rate,
            frames,
            bit_depth,
        })
    }
}

fn hound_spec(channels: u32, sample_rate: u32, bit_depth: BitDepth) -> hound::WavSpec {
    hound::WavSpec {
        channels: channels as u16,
        sample_rate,
        bits_per_sample: bit_depth.bits(),
        sample_format: match bit_depth {
            BitDepth::B32 => hound::SampleFormat::Float,
            _ => hound::SampleFormat::Int,
        },
    }
}

fn write_wav_samples<W: std::io::Write + std::io::Seek>(
    writer: &mut hound::WavWriter<W>,
    samples: &[f32],
    bit_depth: BitDepth,
) -> Result<(), AudioFileError> {
    match bit_depth {
        BitDepth::B16 => {
            for &s in samples {
                let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer
                    .write_sample(v)
                    .map_err(|e| AudioFileError::Encode(e.to_string()))?;
            }
        }
        BitDepth::B24 => {
            for &s in samples {
                let v = (s.clamp(-1.0, 1.0) * 8_388_607.0) as i32;
                writer
                    .write_sample(v)
                    .map_err(|e| AudioFileError::Encode(e.to_string()))?;
            }
        }
        BitDepth::B32 => {
            for &s in samples {
                writer
                    .write_sample(s)
                    .map_err(|e| AudioFileError::Encode(e.to_string()))?;
            }
        }
    }
    Ok(())
}

/// Write interleaved samples to a WAV file, replacing any existing file
pub fn write_wav<P: AsRef<Path>>(
    path: P,
    samples: &[f32],
    channels: u32,
    sample_rate: u32,
    bit_depth: BitDepth,
) -> Result<(), AudioFileError> {
    let spec = hound_spec(channels, sample_rate, bit_depth);
    let mut writer = hound::WavWriter::create(path.as_ref(), spec)
        .map_err(|e| AudioFileError::Encode(e.to_string()))?;
    write_wav_samples(&mut writer, samples, bit_depth)?;
    writer
        .finalize()
        .map_err(|e| AudioFileError::Encode(e.to_string()))?;
    Ok(())
}

/// Append interleaved samples to an existing WAV file (chunked recording)
pub fn append_wav<P: AsRef<Path>>(
    path: P,
    samples: &[f32],
    bit_depth: BitDepth,
) -> Result<(), AudioFileError> {
    let mut writer = hound::WavWriter::append(path.as_ref())
        .map_err(|e| AudioFileError::Encode(e.to_string()))?;
    write_wav_samples(&mut writer, samples, bit_depth)?;
    writer
        .finalize()
        .map_err(|e| AudioFileError::Encode(e.to_string()))?;
    Ok(())
}

/// Write interleaved samples to a FLAC file
///
/// FLAC caps at 24-bit; 32-bit input is narrowed to 24.
pub fn write_flac<P: AsRef<Path>>(
    path: P,
    samples: &[f32],
    channels: u32,
    sample_rate: u32,
    bit_depth: BitDepth,
) -> Result<(), AudioFileError> {
    use flacenc::component::BitRepr;
    use flacenc::error::Verify;

    let (bits, scale): (u8, f32) = match bit_depth {
        BitDepth::B16 => (16, i16::MAX as f32),
        _ => (24, 8_388_607.0),
    };

    let samples_i32: Vec<i32> = samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * scale) as i32)
        .collect();

    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|(_, e)| AudioFileError::Encode(format!("encoder config: {:?}", e)))?;

    let source = flacenc::source::MemSource::from_samples(
        &samples_i32,
        channels as usize,
        bits as usize,
        sample_rate as usize,
    );

    let flac_stream =
        flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
            .map_err(|e| AudioFileError::Encode(format!("{:?}", e)))?;

    let mut sink = flacenc::bitsink::ByteSink::new();
    flac_stream
        .write(&mut sink)
        .map_err(|e| AudioFileError::Encode(format!("{:?}", e)))?;
    std::fs::write(path.as_ref(), sink.as_slice())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_depth_mapping() {
        assert_eq!(BitDepth::from_bits(16), BitDepth::B16);
        assert_eq!(BitDepth::from_bits(24), BitDepth::B24);
        assert_eq!(BitDepth::from_bits(32), BitDepth::B32);
        assert_eq!(BitDepth::B24.bits(), 24);
    }

    #[test]
    fn test_wav_roundtrip_16bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        let samples: Vec<f32> = (0..256).map(|i| (i as f32 / 256.0) - 0.5).collect();

        write_wav(&path, &samples, 2, 44100, BitDepth::B16).unwrap();
        let loaded = AudioFileData::load(&path).unwrap();
        assert_eq!(loaded.channels, 2);
        assert_eq!(loaded.sample_rate, 44100);
        assert_eq!(loaded.frames, 128);
        for (a, b) in samples.iter().zip(loaded.data.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_wav_roundtrip_32bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test32.wav");
        let samples: Vec<f32> = vec![0.0, 0.25, -0.25, 1.0, -1.0, 0.5];

        write_wav(&path, &samples, 1, 48000, BitDepth::B32).unwrap();
        let loaded = AudioFileData::load(&path).unwrap();
        assert_eq!(loaded.data, samples);
    }

    #[test]
    fn test_wav_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.wav");
        write_wav(&path, &[0.1, 0.2], 1, 44100, BitDepth::B32).unwrap();
        append_wav(&path, &[0.3, 0.4], BitDepth::B32).unwrap();

        let loaded = AudioFileData::load(&path).unwrap();
        assert_eq!(loaded.frames, 4);
        assert!((loaded.data[3] - 0.4).abs() < 1e-6);
    }
}
