//! Shell-script stand-ins for ffmpeg.
//!
//! Output is a run of 8-byte records, each the requested bitrate as seven
//! digits plus a newline, so every received byte says which encoder
//! session produced it.

use std::path::{Path, PathBuf};

use sender::EncoderParams;

/// Size of one output record.
pub const RECORD_LEN: usize = 8;

const ARG_PARSER: &str = r#"br=0
ss=0
while [ $# -gt 0 ]; do
  case "$1" in
    -b:a) shift; br="$1" ;;
    -ss) shift; ss="$1" ;;
  esac
  shift
done
tag=$(printf '%07d' "$br")
ms=$(printf '%s' "$ss" | tr -d . | sed 's/^0*//')
ms=${ms:-0}
"#;

/// Encoder with the given script body, run through `sh`.
///
/// The body sees `$br` (bitrate), `$tag` (record text) and `$ms` (resume
/// offset in milliseconds).
pub fn scripted(dir: &Path, name: &str, body: &str) -> EncoderParams {
    // ---
    let script = dir.join(name);
    std::fs::write(&script, format!("{ARG_PARSER}{body}\n")).expect("write fake encoder");
    EncoderParams {
        program: PathBuf::from("sh"),
        program_args: vec![script.display().to_string()],
        ..EncoderParams::default()
    }
}

/// Encoder emitting `duration_ms` of output in real time, 50 ms per
/// write, honoring the `-ss` resume offset.
pub fn paced(dir: &Path, duration_ms: u64) -> EncoderParams {
    // ---
    let body = format!(
        r#"left=$(( ({duration_ms} - ms) / 50 ))
per=$(( br / 160 ))
while [ "$left" -gt 0 ]; do
  yes "$tag" | head -c "$per"
  sleep 0.05
  left=$((left - 1))
done"#
    );
    scripted(dir, "paced-encoder.sh", &body)
}

/// Bitrate tag shared by every record in `chunk`, or `None` if the chunk
/// mixes sessions or is malformed.
pub fn chunk_bitrate(chunk: &[u8]) -> Option<u32> {
    // ---
    if chunk.is_empty() || chunk.len() % RECORD_LEN != 0 {
        return None;
    }
    let first = &chunk[..RECORD_LEN];
    if !chunk.chunks(RECORD_LEN).all(|r| r == first) {
        return None;
    }
    std::str::from_utf8(&first[..RECORD_LEN - 1]).ok()?.parse().ok()
}
