#![forbid(unsafe_code)]

// PCM WAV decoding and corpus discovery.
// Produces mono raw sample bytes plus the format needed for real-time pacing.

use crate::error::{StressError, StressResult};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symphonia::core::audio::{RawSample, RawSampleBuffer};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_F64LE};
use symphonia::core::conv::ConvertibleSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::{i24, Sample};
use tracing::{error, info, warn};

const RIFF_MAGIC: &[u8; 4] = b"RIFF";
const WAVE_MAGIC: &[u8; 4] = b"WAVE";
const FORMAT_PCM: u16 = 1;

/// Files longer than this are flagged during corpus validation
const LONG_AUDIO: Duration = Duration::from_secs(60);

/// Decoded audio, immutable once created.
#[derive(Debug, Clone)]
pub struct AudioRecord {
    pub samples: Vec<u8>,
    pub sample_rate: u32,
    /// Bytes per sample
    pub sample_width: u16,
    /// Always 1 after down-mixing
    pub channels: u16,
    pub duration: Duration,
}

impl AudioRecord {
    /// Builds a mono record from raw samples and derives its duration.
    pub fn mono(samples: Vec<u8>, sample_rate: u32, sample_width: u16) -> StressResult<Self> {
        if sample_rate == 0 || sample_width == 0 {
            return Err(StressError::Audio(format!(
                "invalid format: {sample_rate} Hz, {sample_width} bytes/sample"
            )));
        }
        let bytes_per_sec = sample_rate as u128 * sample_width as u128;
        let nanos = samples.len() as u128 * 1_000_000_000 / bytes_per_sec;
        let duration = Duration::from_nanos(nanos as u64);
        Ok(Self {
            samples,
            sample_rate,
            sample_width,
            channels: 1,
            duration,
        })
    }

    /// Bytes consumed per second of real-time audio
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.sample_width as u64
    }
}

/// Format problems flagged by the decoder. None of them stop a file from being used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioWarning {
    /// Source had more than one channel and was reduced to the first one
    DownMixed { channels: u16 },
    /// Multi-channel audio with a width the down-mixer does not handle
    UnsupportedDownmix { channels: u16, sample_width: u16 },
    /// Not 16-bit PCM
    NonStandardWidth { sample_width: u16 },
}

impl std::fmt::Display for AudioWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioWarning::DownMixed { channels } => {
                write!(f, "{channels} channels, down-mixed to mono (first channel)")
            }
            AudioWarning::UnsupportedDownmix { channels, sample_width } => write!(
                f,
                "{channels}-channel audio at {} bits cannot be down-mixed, sending as-is",
                sample_width * 8
            ),
            AudioWarning::NonStandardWidth { sample_width } => {
                write!(f, "{}-bit PCM may affect recognition", sample_width * 8)
            }
        }
    }
}

/// Output of the decoder: the record plus anything worth warning about
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub record: AudioRecord,
    pub source_channels: u16,
    pub warnings: Vec<AudioWarning>,
}

/// Decodes a WAV buffer into mono sample bytes at the source sample width.
pub fn decode_wav(bytes: Vec<u8>) -> StressResult<DecodedAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("wav");

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| StressError::Audio(format!("not a readable WAV file: {e}")))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| StressError::Audio("no audio track".into()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let sample_rate = params
        .sample_rate
        .ok_or_else(|| StressError::Audio("missing sample rate".into()))?;
    let channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);
    if channels == 0 {
        return Err(StressError::Audio("zero channels".into()));
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| StressError::Audio(format!("unsupported encoding, only PCM is supported: {e}")))?;

    // Interleaved bytes keep the width the file was written with
    let bits = params.bits_per_sample.unwrap_or(16);
    let (data, sample_width) = if params.codec == CODEC_TYPE_PCM_F32LE {
        (read_interleaved::<f32>(format.as_mut(), decoder.as_mut(), track_id)?, 4)
    } else if params.codec == CODEC_TYPE_PCM_F64LE {
        (read_interleaved::<f64>(format.as_mut(), decoder.as_mut(), track_id)?, 8)
    } else {
        match bits {
            8 => (read_interleaved::<u8>(format.as_mut(), decoder.as_mut(), track_id)?, 1),
            24 => (read_interleaved::<i24>(format.as_mut(), decoder.as_mut(), track_id)?, 3),
            32 => (read_interleaved::<i32>(format.as_mut(), decoder.as_mut(), track_id)?, 4),
            _ => (read_interleaved::<i16>(format.as_mut(), decoder.as_mut(), track_id)?, 2),
        }
    };

    let mut warnings = Vec::new();
    if sample_width != 2 {
        warnings.push(AudioWarning::NonStandardWidth { sample_width });
    }

    let samples = if channels == 1 {
        data
    } else if sample_width == 2 {
        warnings.push(AudioWarning::DownMixed { channels });
        first_channel_16bit(&data, channels)
    } else {
        warnings.push(AudioWarning::UnsupportedDownmix {
            channels,
            sample_width,
        });
        data
    };

    let record = AudioRecord::mono(samples, sample_rate, sample_width)?;
    Ok(DecodedAudio {
        record,
        source_channels: channels,
        warnings,
    })
}

/// Drains every packet of `track_id` into interleaved raw bytes of `S`.
fn read_interleaved<S>(format: &mut dyn FormatReader, decoder: &mut dyn Decoder, track_id: u32) -> StressResult<Vec<u8>>
where
    S: Sample + RawSample + ConvertibleSample,
{
    let mut out = Vec::new();
    let mut buf: Option<RawSampleBuffer<S>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // Truncated data chunks are common in streamed recordings; keep what was read.
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(StressError::Audio(format!("read failed: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(StressError::Audio(format!("decode failed: {e}"))),
        };

        let spec = *decoded.spec();
        let needed = decoded.capacity() * spec.channels.count();
        if buf.as_ref().map_or(true, |b| b.capacity() < needed) {
            buf = Some(RawSampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(b) = buf.as_mut() {
            b.copy_interleaved_ref(decoded);
            out.extend_from_slice(b.as_bytes());
        }
    }

    Ok(out)
}

/// Keeps the first channel of interleaved little-endian 16-bit frames.
fn first_channel_16bit(data: &[u8], channels: u16) -> Vec<u8> {
    let frame = 2 * channels as usize;
    let mut mono = Vec::with_capacity(data.len() / channels as usize + 2);
    for frame_bytes in data.chunks_exact(frame) {
        mono.extend_from_slice(&frame_bytes[..2]);
    }
    mono
}

/// Reads and decodes a WAV file.
pub async fn load_wav(path: &Path) -> StressResult<DecodedAudio> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| StressError::Audio(format!("{}: {e}", path.display())))?;
    decode_wav(bytes).map_err(|e| match e {
        StressError::Audio(msg) => StressError::Audio(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// A validated corpus file
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    pub path: PathBuf,
    pub duration: Duration,
    pub sample_rate: u32,
}

impl CorpusEntry {
    pub fn file_name(&self) -> String {
        file_label(&self.path)
    }
}

/// Short display name for a corpus path
pub fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Lists, sorts and validates every `.wav` file in `dir`.
///
/// Files that fail to decode are skipped. An empty result is a configuration
/// error since no worker would have anything to send.
pub async fn discover_corpus(dir: &Path) -> StressResult<Vec<CorpusEntry>> {
    let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|e| {
        StressError::Config(format!("audio directory {} is not readable: {e}", dir.display()))
    })?;

    let mut paths = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let is_wav = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if is_wav && entry.file_type().await?.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(StressError::Config(format!(
            "no .wav files found in {}",
            dir.display()
        )));
    }

    let mut corpus = Vec::with_capacity(paths.len());
    for path in paths {
        match load_wav(&path).await {
            Ok(decoded) => {
                let name = file_label(&path);
                for warning in &decoded.warnings {
                    warn!("{}: {}", name, warning);
                }
                if decoded.record.duration > LONG_AUDIO {
                    warn!(
                        "{}: long file ({:.1}s) may affect performance",
                        name,
                        decoded.record.duration.as_secs_f64()
                    );
                }
                corpus.push(CorpusEntry {
                    path,
                    duration: decoded.record.duration,
                    sample_rate: decoded.record.sample_rate,
                });
            }
            Err(e) => error!("Skipping unreadable audio file: {}", e),
        }
    }

    if corpus.is_empty() {
        return Err(StressError::Config(format!(
            "no valid audio files in {}",
            dir.display()
        )));
    }

    info!("Found {} valid audio files in {}", corpus.len(), dir.display());
    Ok(corpus)
}

/// Encodes interleaved PCM into a canonical 44-byte-header WAV buffer.
pub fn encode_wav(samples: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let block_align = channels * bits_per_sample.div_ceil(8);
    let byte_rate = sample_rate * block_align as u32;
    let data_len = samples.len() as u32;

    let mut out = Vec::with_capacity(44 + samples.len());
    out.extend_from_slice(RIFF_MAGIC);
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(WAVE_MAGIC);
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(samples);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_16bit(frames: &[(i16, i16)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (l, r) in frames {
            out.extend_from_slice(&l.to_le_bytes());
            out.extend_from_slice(&r.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_decode_mono_16bit() {
        // one second of 16 kHz silence
        let samples = vec![0u8; 32_000];
        let wav = encode_wav(&samples, 16_000, 1, 16);
        let decoded = decode_wav(wav).unwrap();

        assert_eq!(decoded.record.sample_rate, 16_000);
        assert_eq!(decoded.record.sample_width, 2);
        assert_eq!(decoded.record.channels, 1);
        assert_eq!(decoded.record.samples.len(), 32_000);
        assert_eq!(decoded.record.duration, Duration::from_secs(1));
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn test_stereo_keeps_left_channel() {
        let data = stereo_16bit(&[(1, -1), (2, -2), (3, -3)]);
        let wav = encode_wav(&data, 8_000, 2, 16);
        let decoded = decode_wav(wav).unwrap();

        let expected: Vec<u8> = [1i16, 2, 3].iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(decoded.record.samples, expected);
        assert_eq!(decoded.source_channels, 2);
        assert_eq!(decoded.warnings, vec![AudioWarning::DownMixed { channels: 2 }]);
    }

    #[test]
    fn test_8bit_stereo_bypasses_downmix() {
        let data = vec![10u8, 20, 30, 40];
        let wav = encode_wav(&data, 8_000, 2, 8);
        let decoded = decode_wav(wav).unwrap();

        assert_eq!(decoded.record.samples, data);
        assert!(decoded.warnings.contains(&AudioWarning::UnsupportedDownmix {
            channels: 2,
            sample_width: 1
        }));
        assert!(decoded
            .warnings
            .contains(&AudioWarning::NonStandardWidth { sample_width: 1 }));
    }

    #[test]
    fn test_skips_unknown_chunks() {
        let samples = vec![0u8; 8];
        let mut wav = encode_wav(&samples, 16_000, 1, 16);
        // splice a vendor chunk between fmt and data
        let mut extra = Vec::new();
        extra.extend_from_slice(b"junk");
        extra.extend_from_slice(&4u32.to_le_bytes());
        extra.extend_from_slice(b"abcd");
        wav.splice(36..36, extra);
        let riff_len = (wav.len() - 8) as u32;
        wav[4..8].copy_from_slice(&riff_len.to_le_bytes());

        let decoded = decode_wav(wav).unwrap();
        assert_eq!(decoded.record.samples.len(), 8);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decode_wav(b"definitely not audio".to_vec()).is_err());
        assert!(decode_wav(b"RIFF\0\0\0\0WAVE".to_vec()).is_err());
    }

    #[tokio::test]
    async fn test_discover_corpus_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let wav = encode_wav(&vec![0u8; 3_200], 16_000, 1, 16);
        std::fs::write(dir.path().join("b.wav"), &wav).unwrap();
        std::fs::write(dir.path().join("a.WAV"), &wav).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();
        std::fs::write(dir.path().join("broken.wav"), b"nope").unwrap();

        let corpus = discover_corpus(dir.path()).await.unwrap();
        let names: Vec<String> = corpus.iter().map(|c| c.file_name()).collect();
        assert_eq!(names, vec!["a.WAV".to_string(), "b.wav".to_string()]);
        assert_eq!(corpus[0].duration, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_discover_corpus_empty_dir_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = discover_corpus(dir.path()).await;
        assert!(matches!(result, Err(StressError::Config(_))));

        let missing = dir.path().join("missing");
        assert!(matches!(discover_corpus(&missing).await, Err(StressError::Config(_))));
    }
}
