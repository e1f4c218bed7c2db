//! Source audio provider.
//!
//! The engine is agnostic to how the source was produced: it either hands
//! a file path to the encoder or streams an in-memory byte buffer into the
//! encoder's standard input.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use hound::WavReader;

/// Audio to encode.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// File passed to the encoder as its input argument
    Path(PathBuf),

    /// Bytes written to the encoder's stdin
    Bytes(Bytes),
}

/// Header facts about a WAV source, used for logging and bounds checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
    // ---
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub duration: Duration,
}

impl AudioSource {
    // ---
    pub fn path(path: impl Into<PathBuf>) -> Self {
        // ---
        AudioSource::Path(path.into())
    }

    /// Encoder input argument for this source.
    pub fn input_arg(&self) -> String {
        // ---
        match self {
            AudioSource::Path(p) => p.display().to_string(),
            AudioSource::Bytes(_) => "pipe:0".to_string(),
        }
    }

    /// Bytes to feed on stdin, if any.
    pub fn stdin_bytes(&self) -> Option<Bytes> {
        // ---
        match self {
            AudioSource::Path(_) => None,
            AudioSource::Bytes(b) => Some(b.clone()),
        }
    }

    /// Reads WAV header information when the source is a WAV stream.
    ///
    /// Returns `None` for anything `hound` cannot parse; such sources are
    /// still streamed, they are just opaque to the engine.
    pub fn probe(&self) -> Option<SourceInfo> {
        // ---
        match self {
            AudioSource::Path(p) => probe_wav_file(p),
            AudioSource::Bytes(b) => WavReader::new(Cursor::new(b.as_ref()))
                .ok()
                .map(|r| info_from_reader(&r)),
        }
    }
}

fn probe_wav_file(path: &Path) -> Option<SourceInfo> {
    // ---
    WavReader::open(path).ok().map(|r| info_from_reader(&r))
}

fn info_from_reader<R: std::io::Read>(reader: &WavReader<R>) -> SourceInfo {
    // ---
    let spec = reader.spec();
    // duration() counts frames per channel
    let frames = reader.duration() as f64;
    let duration = if spec.sample_rate == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(frames / spec.sample_rate as f64)
    };
    SourceInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        duration,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};

    fn wav_bytes(sample_rate: u32, channels: u16, frames: u32) -> Bytes {
        // ---
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).expect("writer");
            for i in 0..frames * channels as u32 {
                writer.write_sample((i % 100) as i16).expect("sample");
            }
            writer.finalize().expect("finalize");
        }
        Bytes::from(cursor.into_inner())
    }

    #[test]
    fn probes_in_memory_wav() {
        // ---
        let source = AudioSource::Bytes(wav_bytes(16_000, 2, 8_000));
        let info = source.probe().expect("valid wav");
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.channels, 2);
        assert_eq!(info.duration, Duration::from_millis(500));
        assert_eq!(source.input_arg(), "pipe:0");
        assert!(source.stdin_bytes().is_some());
    }

    #[test]
    fn probes_wav_file() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, wav_bytes(44_100, 1, 44_100)).unwrap();

        let source = AudioSource::path(&path);
        assert_eq!(source.probe().unwrap().duration, Duration::from_secs(1));
        assert_eq!(source.input_arg(), path.display().to_string());
        assert!(source.stdin_bytes().is_none());
    }

    #[test]
    fn non_wav_is_opaque() {
        // ---
        let source = AudioSource::Bytes(Bytes::from_static(b"ID3 not a wav"));
        assert!(source.probe().is_none());
    }
}
