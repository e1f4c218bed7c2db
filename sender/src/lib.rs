//! Adaptive-bitrate audio sender.
//!
//! Drives an external encoder subprocess, streams its output as ordered
//! chunks to a receiver, and restarts the encoder at a different bitrate
//! when probes show the network cannot keep up (or has headroom).

pub mod client;
pub mod encoder;
pub mod queue;
pub mod rate;
pub mod source;

pub use abr_stream_common::{StreamError, StreamResult};
pub use client::{ClientSession, StreamConfig, StreamReport};
pub use encoder::{EncoderParams, EncoderProcess, EncoderStatus};
pub use queue::{Chunk, ChunkQueue};
pub use rate::{BitrateLadder, BitrateLevel, RateConfig, RateController, Sample, ThroughputMeter};
pub use source::{AudioSource, SourceInfo};

use abr_stream_common::MetricsContext;

/// Connects to `config.server_uri` and streams `source` to completion.
///
/// # Errors
///
/// Returns the distinguishable [`StreamError`] kind of whatever ended the
/// session: configuration, connection, encoder spawn or crash, or a
/// connection lost before the receiver acknowledged.
pub async fn stream_source(
    config: StreamConfig,
    source: AudioSource,
    metrics: &MetricsContext,
) -> StreamResult<StreamReport> {
    // ---
    let mut session = ClientSession::connect(config, metrics.clone()).await?;
    session.send_stream(source).await
}
