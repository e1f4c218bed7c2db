//! Adaptive-bitrate audio sender - CLI binary.
//!
//! Encodes an audio file (or stdin) with an external encoder and streams
//! the output to a receiver, switching bitrate as network conditions
//! change.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::info;

use abr_stream_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use sender::{stream_source, AudioSource, EncoderParams, StreamConfig};

/// ABR Sender - Stream audio through an adaptive-bitrate encoder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Input audio file, or `-` to read the source from stdin
    #[arg(short, long)]
    input: String,

    /// Receiver address (`host:port` or `tcp://host:port`)
    #[arg(short, long, default_value = "127.0.0.1:8765")]
    server: String,

    /// Bytes per chunk read from encoder output
    #[arg(long, default_value_t = 4096)]
    chunk_size: usize,

    /// Starting bitrate in bits per second
    #[arg(long, default_value_t = 128_000)]
    initial_bitrate: u32,

    #[arg(long, default_value_t = 64_000)]
    min_bitrate: u32,

    #[arg(long, default_value_t = 320_000)]
    max_bitrate: u32,

    #[arg(long, default_value_t = 32_000)]
    bitrate_step: u32,

    /// Explicit bitrate ladder (comma separated); overrides min/max/step
    #[arg(long, value_delimiter = ',')]
    ladder: Option<Vec<u32>>,

    /// Chunks sent between bitrate evaluations
    #[arg(long, default_value_t = 10)]
    adaptation_interval: u64,

    /// Average RTT above this forces a step down
    #[arg(long, default_value_t = 200)]
    rtt_high_watermark_ms: u64,

    #[arg(long, default_value_t = 500)]
    probe_interval_ms: u64,

    /// Probes unanswered after this long count as this RTT
    #[arg(long, default_value_t = 2000)]
    probe_timeout_ms: u64,

    /// Encoded chunks buffered ahead of the network
    #[arg(long, default_value_t = 32)]
    queue_capacity: usize,

    /// Samples kept per adaptation window
    #[arg(long, default_value_t = 8)]
    window: usize,

    /// Weight decay per sample age step (1.0 = plain mean)
    #[arg(long, default_value_t = 1.0)]
    decay: f64,

    /// Encoder executable
    #[arg(long, default_value = "ffmpeg")]
    encoder: PathBuf,

    #[arg(long, default_value = "libmp3lame")]
    codec: String,

    #[arg(long, default_value_t = 44_100)]
    sample_rate: u32,

    #[arg(long, default_value_t = 2)]
    channels: u16,

    /// Output container format
    #[arg(long, default_value = "mp3")]
    format: String,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9100")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

impl Args {
    // ---
    fn stream_config(&self) -> StreamConfig {
        // ---
        StreamConfig {
            server_uri: self.server.clone(),
            chunk_size: self.chunk_size,
            initial_bitrate: self.initial_bitrate,
            min_bitrate: self.min_bitrate,
            max_bitrate: self.max_bitrate,
            bitrate_step: self.bitrate_step,
            ladder: self.ladder.clone(),
            adaptation_interval: self.adaptation_interval,
            rtt_high_watermark: Duration::from_millis(self.rtt_high_watermark_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            queue_capacity: self.queue_capacity,
            window: self.window,
            decay: self.decay,
            encoder: EncoderParams {
                program: self.encoder.clone(),
                program_args: Vec::new(),
                codec: self.codec.clone(),
                sample_rate: self.sample_rate,
                channels: self.channels,
                container_format: self.format.clone(),
            },
        }
    }
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    init_tracing(args.color)?;

    info!("Starting ABR sender v{VERSION}");
    info!("Input: {}", args.input);
    info!("Receiver: {}", args.server);
    info!("Encoder: {} ({}, {})", args.encoder.display(), args.codec, args.format);
    info!("Metrics bind: {}", args.metrics_bind);

    let config = args.stream_config();
    config.validate().context("invalid configuration")?;

    let metrics = MetricsContext::new("sender")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let source = if args.input == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .context("failed to read source from stdin")?;
        info!("Read {} bytes of source from stdin", buf.len());
        AudioSource::Bytes(Bytes::from(buf))
    } else {
        AudioSource::path(&args.input)
    };

    let report = stream_source(config, source, &metrics)
        .await
        .context("streaming failed")?;

    info!(
        "Transmission complete: {} chunks, {} bytes in {:.2}s, final bitrate {} bps, {} restarts",
        report.chunks_sent,
        report.bytes_sent,
        report.elapsed.as_secs_f64(),
        report.final_bitrate,
        report.restarts
    );

    Ok(())
}
