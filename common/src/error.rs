//! Error taxonomy shared by both ends of a stream.
//!
//! Only lifecycle failures are represented here. Unexpected control strings
//! and probe timeouts are non-fatal: they are logged and counted, and the
//! stream carries on.

use std::io;

use thiserror::Error;

use crate::protocol::CodecError;

/// Failure of a streaming session.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The external encoder could not be started. Not retried.
    #[error("failed to spawn encoder `{program}`: {source}")]
    EncoderSpawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The encoder exited with a failure status while the stream was live.
    #[error("encoder exited unexpectedly mid-stream ({status})")]
    EncoderCrashed { status: String },

    /// The transport closed before the end-of-stream exchange finished.
    #[error("connection lost after {frames} frames: {reason}")]
    ConnectionLost { frames: u64, reason: String },

    /// The peer sent bytes that do not decode as a frame.
    #[error("frame decode failed: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    // ---
    pub fn connection_lost(frames: u64, reason: impl Into<String>) -> Self {
        // ---
        StreamError::ConnectionLost {
            frames,
            reason: reason.into(),
        }
    }

    /// Whether the error came from the encoder side of the pipeline.
    pub fn is_encoder_failure(&self) -> bool {
        // ---
        matches!(
            self,
            StreamError::EncoderSpawn { .. } | StreamError::EncoderCrashed { .. }
        )
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn spawn_error_names_the_program() {
        // ---
        let err = StreamError::EncoderSpawn {
            program: "ffmpeg".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().contains("ffmpeg"));
        assert!(err.is_encoder_failure());
    }

    #[test]
    fn connection_lost_reports_frame_count() {
        // ---
        let err = StreamError::connection_lost(2, "peer reset");
        assert_eq!(err.to_string(), "connection lost after 2 frames: peer reset");
        assert!(!err.is_encoder_failure());
    }
}
