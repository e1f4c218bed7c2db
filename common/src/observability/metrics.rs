//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Each binary owns its
//! registry; the sender reports transmit-side and adaptation metrics, the
//! receiver reports persistence and completion metrics.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Thin wrapper so hot-path instrumentation is just counter increments,
/// gauge sets and histogram observations.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Transport counters
    pub chunks_sent_total: IntCounter,
    pub chunks_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub protocol_anomalies_total: IntCounter,
    pub probe_timeouts_total: IntCounter,

    // Session outcomes
    pub sessions_completed_total: IntCounter,
    pub sessions_incomplete_total: IntCounter,

    // Adaptation
    pub encoder_restarts_total: IntCounter,
    pub current_bitrate_bps: IntGauge,
    pub measured_throughput_bps: Gauge,
    pub chunk_queue_depth: IntGauge,

    // Latency histograms (seconds)
    pub rtt_seconds: Histogram,
    pub completion_callback_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("abr_streamer".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let chunks_sent_total = IntCounter::with_opts(Opts::new(
            "chunks_sent_total",
            "Total chunk frames handed to the transport",
        ))?;
        let chunks_received_total = IntCounter::with_opts(Opts::new(
            "chunks_received_total",
            "Total chunk frames persisted by the receiver",
        ))?;
        let bytes_sent_total = IntCounter::with_opts(Opts::new(
            "bytes_sent_total",
            "Total chunk payload bytes sent",
        ))?;
        let bytes_received_total = IntCounter::with_opts(Opts::new(
            "bytes_received_total",
            "Total chunk payload bytes received",
        ))?;
        let protocol_anomalies_total = IntCounter::with_opts(Opts::new(
            "protocol_anomalies_total",
            "Unexpected frames or control strings that were ignored",
        ))?;
        let probe_timeouts_total = IntCounter::with_opts(Opts::new(
            "probe_timeouts_total",
            "RTT probes that exceeded the probe timeout",
        ))?;

        let sessions_completed_total = IntCounter::with_opts(Opts::new(
            "sessions_completed_total",
            "Sessions that finished with an acknowledged end-of-stream",
        ))?;
        let sessions_incomplete_total = IntCounter::with_opts(Opts::new(
            "sessions_incomplete_total",
            "Sessions that ended without a completed end-of-stream exchange",
        ))?;

        let encoder_restarts_total = IntCounter::with_opts(Opts::new(
            "encoder_restarts_total",
            "Encoder restarts triggered by bitrate changes",
        ))?;
        let current_bitrate_bps = IntGauge::with_opts(Opts::new(
            "current_bitrate_bps",
            "Bitrate of the live encoder session",
        ))?;
        let measured_throughput_bps = Gauge::with_opts(Opts::new(
            "measured_throughput_bps",
            "Most recent probe-derived throughput estimate",
        ))?;
        let chunk_queue_depth = IntGauge::with_opts(Opts::new(
            "chunk_queue_depth",
            "Encoded chunks waiting to be sent",
        ))?;

        let rtt_seconds = Histogram::with_opts(
            HistogramOpts::new("rtt_seconds", "Probe round-trip time in seconds").buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.2, 0.4, 0.8, 1.6, 3.2,
            ]),
        )?;
        let completion_callback_seconds = Histogram::with_opts(HistogramOpts::new(
            "completion_callback_seconds",
            "Time spent in the completion callback (seconds)",
        ))?;

        // Register all metrics
        registry.register(Box::new(chunks_sent_total.clone()))?;
        registry.register(Box::new(chunks_received_total.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(protocol_anomalies_total.clone()))?;
        registry.register(Box::new(probe_timeouts_total.clone()))?;
        registry.register(Box::new(sessions_completed_total.clone()))?;
        registry.register(Box::new(sessions_incomplete_total.clone()))?;
        registry.register(Box::new(encoder_restarts_total.clone()))?;
        registry.register(Box::new(current_bitrate_bps.clone()))?;
        registry.register(Box::new(measured_throughput_bps.clone()))?;
        registry.register(Box::new(chunk_queue_depth.clone()))?;
        registry.register(Box::new(rtt_seconds.clone()))?;
        registry.register(Box::new(completion_callback_seconds.clone()))?;

        Ok(Self {
            registry,
            chunks_sent_total,
            chunks_received_total,
            bytes_sent_total,
            bytes_received_total,
            protocol_anomalies_total,
            probe_timeouts_total,
            sessions_completed_total,
            sessions_incomplete_total,
            encoder_restarts_total,
            current_bitrate_bps,
            measured_throughput_bps,
            chunk_queue_depth,
            rtt_seconds,
            completion_callback_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Callers decide whether to run it; tests usually don't.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::try_bind(&cfg.bind)?.serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    // ---
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        return Ok(plain(StatusCode::NOT_FOUND, "not found"));
    }

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        return Ok(plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode error: {e}"),
        ));
    }

    let mut resp = Response::new(Body::from(buffer));
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(resp)
}

fn plain(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    // ---
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp
}
