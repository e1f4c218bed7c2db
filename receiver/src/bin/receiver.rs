//! Chunk receiver - CLI binary.
//!
//! Listens for sender connections, writes each received chunk to disk and
//! reports completed transfers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use abr_stream_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use receiver::{ChunkServer, CommandHook, CompletionHandler, LogCompletion, ServerConfig, SessionLayout};

/// ABR Receiver - Persist streamed audio chunks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8765")]
    bind: String,

    /// Directory chunk files are written to
    #[arg(short, long, default_value = "received_chunks")]
    output_dir: PathBuf,

    /// Chunk file extension
    #[arg(short, long, default_value = "wav")]
    extension: String,

    /// Write every connection straight into the output directory instead
    /// of a `session_NNNN` subdirectory; connections are then handled one
    /// at a time
    #[arg(long)]
    flat: bool,

    /// Program run after each completed transfer with the output
    /// directory and the chunk paths as arguments
    #[arg(long)]
    on_complete: Option<PathBuf>,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

async fn run<H: CompletionHandler>(config: ServerConfig, handler: H, metrics: MetricsContext) -> Result<()> {
    // ---
    let server = Arc::new(
        ChunkServer::bind(config, handler, metrics)
            .await
            .context("failed to bind receiver")?,
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => warn!("Cannot listen for ctrl-c: {}", e),
        }
        shutdown.cancel();
    });

    server.serve_until(cancel).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color)?;
    info!("Starting ABR receiver v{VERSION}");
    info!("Listening on: {}", args.bind);
    info!("Output directory: {}", args.output_dir.display());
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("receiver")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let config = ServerConfig {
        bind: args.bind.parse().context("invalid bind address")?,
        output_dir: args.output_dir,
        extension: args.extension,
        layout: if args.flat {
            SessionLayout::Flat
        } else {
            SessionLayout::PerSession
        },
        ..ServerConfig::default()
    };

    match args.on_complete {
        Some(program) => {
            info!("Completion hook: {}", program.display());
            run(config, CommandHook::new(program), metrics).await
        }
        None => run(config, LogCompletion, metrics).await,
    }
}
