//! Client side of a streaming session.
//!
//! A [`ClientSession`] owns one framed TCP connection. While streaming,
//! four tasks cooperate:
//!
//! - the encoder read loop fills the [`ChunkQueue`]
//! - the send loop (the caller's task) pops chunks into binary frames and
//!   interleaves ping probes on a timer
//! - the reader task matches pongs to pings and picks up the final ack
//! - the adaptation task owns the [`RateController`] and restarts the
//!   encoder when the chosen rung changes
//!
//! Chunk order on the wire is pop order; nothing fans out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use abr_stream_common::{
    parse_server_uri, Frame, FrameCodec, MetricsContext, SessionState, StreamError, StreamResult,
    StreamSession, COMPLETION_ACK, END_OF_STREAM,
};

use crate::encoder::{EncoderParams, EncoderProcess};
use crate::queue::ChunkQueue;
use crate::rate::{BitrateLadder, BitrateLevel, RateConfig, RateController, ThroughputMeter};
use crate::source::AudioSource;

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;
type PendingProbes = Arc<Mutex<HashMap<u64, oneshot::Sender<Instant>>>>;

/// Client streaming configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    // ---
    /// Receiver address, `host:port` or `tcp://host:port`
    pub server_uri: String,

    /// Bytes per read from encoder output
    pub chunk_size: usize,

    pub initial_bitrate: BitrateLevel,
    pub min_bitrate: BitrateLevel,
    pub max_bitrate: BitrateLevel,
    pub bitrate_step: BitrateLevel,

    /// Explicit rungs; overrides the min/max/step range when set
    pub ladder: Option<Vec<BitrateLevel>>,

    /// Chunks sent between rate evaluations
    pub adaptation_interval: u64,

    pub rtt_high_watermark: Duration,

    /// Spacing of RTT probes
    pub probe_interval: Duration,

    /// Probe wait bound; an unanswered probe counts as this RTT
    pub probe_timeout: Duration,

    /// Encoded chunks buffered ahead of the network
    pub queue_capacity: usize,

    /// Samples per rate window
    pub window: usize,

    /// Sample age weighting, 1.0 for a plain mean
    pub decay: f64,

    pub encoder: EncoderParams,
}

impl Default for StreamConfig {
    fn default() -> Self {
        // ---
        let rate = RateConfig::default();
        Self {
            server_uri: format!("127.0.0.1:{}", abr_stream_common::protocol::DEFAULT_PORT),
            chunk_size: 4096,
            initial_bitrate: 128_000,
            min_bitrate: 64_000,
            max_bitrate: 320_000,
            bitrate_step: 32_000,
            ladder: None,
            adaptation_interval: 10,
            rtt_high_watermark: rate.rtt_high_watermark,
            probe_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
            queue_capacity: 32,
            window: rate.window,
            decay: rate.decay,
            encoder: EncoderParams::default(),
        }
    }
}

impl StreamConfig {
    // ---
    /// Bitrate ladder derived from `ladder` or the min/max/step range.
    pub fn bitrate_ladder(&self) -> StreamResult<BitrateLadder> {
        // ---
        match &self.ladder {
            Some(rungs) => BitrateLadder::new(rungs.clone()),
            None => BitrateLadder::from_range(self.min_bitrate, self.max_bitrate, self.bitrate_step),
        }
    }

    pub fn rate_config(&self) -> StreamResult<RateConfig> {
        // ---
        Ok(RateConfig {
            ladder: self.bitrate_ladder()?,
            window: self.window,
            decay: self.decay,
            rtt_high_watermark: self.rtt_high_watermark,
            ..RateConfig::default()
        })
    }

    /// Checks option consistency before anything is spawned or connected.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the offending option.
    pub fn validate(&self) -> StreamResult<()> {
        // ---
        parse_server_uri(&self.server_uri)?;
        if self.chunk_size == 0 {
            return Err(StreamError::Config("chunk_size must be positive".into()));
        }
        if self.chunk_size > abr_stream_common::protocol::MAX_PAYLOAD_LEN {
            return Err(StreamError::Config(format!(
                "chunk_size {} exceeds the frame limit",
                self.chunk_size
            )));
        }
        if self.adaptation_interval == 0 {
            return Err(StreamError::Config(
                "adaptation_interval must be at least 1 chunk".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(StreamError::Config("queue_capacity must be positive".into()));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(StreamError::Config(
                "probe interval and timeout must be positive".into(),
            ));
        }
        let ladder = self.bitrate_ladder()?;
        if self.initial_bitrate < ladder.min() || self.initial_bitrate > ladder.max() {
            return Err(StreamError::Config(format!(
                "initial bitrate {} outside [{}, {}]",
                self.initial_bitrate,
                ladder.min(),
                ladder.max()
            )));
        }
        self.rate_config()?.validate()
    }
}

/// Outcome of a completed stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    // ---
    pub elapsed: Duration,
    pub final_bitrate: BitrateLevel,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub restarts: u64,

    /// Acknowledgment text the receiver answered with
    pub ack: String,
}

enum AdaptEvent {
    Probe {
        sent_at: Instant,
        bytes_before: u64,
        pong_at: Option<Instant>,
    },
    Evaluate,
}

/// Aborts the wrapped task when dropped.
struct TaskGuard<T>(JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        // ---
        self.0.abort();
    }
}

/// One client connection to a receiver.
pub struct ClientSession {
    // ---
    config: StreamConfig,
    metrics: MetricsContext,
    sink: FrameSink,
    session: StreamSession,
    pending: PendingProbes,
    ack_rx: Option<oneshot::Receiver<String>>,
    peer_gone: CancellationToken,
    _reader: TaskGuard<()>,
    next_nonce: u64,
}

impl ClientSession {
    // ---
    /// Validates `config` and connects to `config.server_uri`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid options and `Io` if the connection
    /// cannot be established.
    pub async fn connect(config: StreamConfig, metrics: MetricsContext) -> StreamResult<Self> {
        // ---
        config.validate()?;
        let addr = parse_server_uri(&config.server_uri)?;

        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        info!("Connected to {}", peer);

        let (sink, stream) = Framed::new(stream, FrameCodec::new()).split();
        let pending: PendingProbes = Arc::new(Mutex::new(HashMap::new()));
        let (ack_tx, ack_rx) = oneshot::channel();
        let peer_gone = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&pending),
            ack_tx,
            peer_gone.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            config,
            metrics,
            sink,
            session: StreamSession::new(peer, Duration::from_secs(5)),
            pending,
            ack_rx: Some(ack_rx),
            peer_gone,
            _reader: TaskGuard(reader),
            next_nonce: 0,
        })
    }

    pub fn peer_address(&self) -> SocketAddr {
        // ---
        self.session.peer_address
    }

    pub fn state(&self) -> SessionState {
        // ---
        self.session.state()
    }

    /// Measures one round trip outside of streaming.
    ///
    /// Returns the probe timeout when no pong arrives in time.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` if the ping cannot be written.
    pub async fn probe_rtt(&mut self) -> StreamResult<Duration> {
        // ---
        let (rx, sent_at) = self.send_ping().await?;
        match tokio::time::timeout(self.config.probe_timeout, rx).await {
            Ok(Ok(pong_at)) => Ok(pong_at.saturating_duration_since(sent_at)),
            _ => {
                self.metrics.probe_timeouts_total.inc();
                Ok(self.config.probe_timeout)
            }
        }
    }

    /// Encodes `source`, streams every chunk, then runs the end-of-stream
    /// exchange.
    ///
    /// The encoder subprocess is shut down on every exit path.
    ///
    /// # Errors
    ///
    /// - `EncoderSpawn` if the encoder cannot be started
    /// - `EncoderCrashed` if it dies mid-stream
    /// - `ConnectionLost` if the receiver goes away before acknowledging
    pub async fn send_stream(&mut self, source: AudioSource) -> StreamResult<StreamReport> {
        // ---
        if let Some(info) = source.probe() {
            info!(
                "Source: {} Hz, {} ch, {} bit, {:.2}s",
                info.sample_rate,
                info.channels,
                info.bits_per_sample,
                info.duration.as_secs_f64()
            );
        }

        let started = Instant::now();
        let queue = Arc::new(ChunkQueue::new(self.config.queue_capacity));
        let encoder = Arc::new(EncoderProcess::new(
            self.config.encoder.clone(),
            source,
            self.config.chunk_size,
            queue,
            self.metrics.clone(),
        ));

        let result = self.stream_chunks(&encoder).await;
        encoder.shutdown().await;

        match result {
            Ok(ack) => {
                self.session.transition(SessionState::Closed);
                self.metrics.sessions_completed_total.inc();
                self.session.log();
                Ok(StreamReport {
                    elapsed: started.elapsed(),
                    final_bitrate: encoder.bitrate(),
                    chunks_sent: self.session.chunks,
                    bytes_sent: self.session.bytes_sent,
                    restarts: encoder.restarts(),
                    ack,
                })
            }
            Err(e) => {
                self.session.transition(SessionState::Failed);
                self.metrics.sessions_incomplete_total.inc();
                warn!("Stream to {} failed: {}", self.session.peer_address, e);
                Err(e)
            }
        }
    }

    async fn stream_chunks(&mut self, encoder: &Arc<EncoderProcess>) -> StreamResult<String> {
        // ---
        let controller = RateController::new(self.config.rate_config()?, self.config.initial_bitrate)?;
        encoder.start(controller.current()).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut adaptation = TaskGuard(tokio::spawn(adaptation_loop(
            controller,
            ThroughputMeter::new(self.config.probe_timeout),
            Arc::clone(encoder),
            events_rx,
            self.metrics.clone(),
        )));
        let mut adaptation_done = false;

        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let peer_gone = self.peer_gone.clone();
        let mut since_evaluation = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = peer_gone.cancelled() => {
                    return Err(StreamError::connection_lost(
                        self.session.chunks,
                        "receiver closed the connection",
                    ));
                }
                joined = &mut adaptation.0, if !adaptation_done => {
                    adaptation_done = true;
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(e) => return Err(StreamError::Io(std::io::Error::other(e))),
                    }
                }
                _ = ticker.tick() => {
                    self.spawn_probe(&events_tx).await?;
                }
                chunk = encoder.read_chunk() => {
                    let Some(chunk) = chunk? else {
                        break;
                    };
                    let len = chunk.len();
                    debug!(
                        index = chunk.index,
                        generation = chunk.generation,
                        bitrate = chunk.bitrate,
                        "Sending chunk ({} B)",
                        len
                    );
                    self.send_frame(Frame::Binary(chunk.payload)).await?;
                    self.session.record_sent(len);
                    self.metrics.chunks_sent_total.inc();
                    self.metrics.bytes_sent_total.inc_by(len as u64);

                    since_evaluation += 1;
                    if since_evaluation >= self.config.adaptation_interval {
                        since_evaluation = 0;
                        // The adaptation task outlives the loop, so the send cannot fail
                        let _ = events_tx.send(AdaptEvent::Evaluate);
                    }
                }
            }
        }

        // No restarts once the source is exhausted
        drop(adaptation);
        drop(events_tx);
        self.finish().await
    }

    /// Sends the end-of-stream marker and waits for the receiver's ack.
    async fn finish(&mut self) -> StreamResult<String> {
        // ---
        self.session.transition(SessionState::Finishing);
        info!(
            "All {} chunks sent, signalling end of stream",
            self.session.chunks
        );
        self.send_frame(Frame::Text(END_OF_STREAM.to_string())).await?;

        let ack_rx = self
            .ack_rx
            .take()
            .ok_or_else(|| StreamError::connection_lost(self.session.chunks, "ack already consumed"))?;
        let ack = ack_rx.await.map_err(|_| {
            StreamError::connection_lost(self.session.chunks, "closed before acknowledging")
        })?;

        if ack != COMPLETION_ACK {
            warn!("Unexpected completion acknowledgment {:?}", ack);
            self.metrics.protocol_anomalies_total.inc();
        }
        info!("Receiver acknowledged completion");

        if let Err(e) = self.sink.send(Frame::Close).await {
            debug!("Close frame not delivered: {}", e);
        }
        if let Err(e) = self.sink.close().await {
            debug!("Error closing connection: {}", e);
        }
        Ok(ack)
    }

    async fn send_frame(&mut self, frame: Frame) -> StreamResult<()> {
        // ---
        let chunks = self.session.chunks;
        self.sink
            .send(frame)
            .await
            .map_err(|e| StreamError::connection_lost(chunks, e.to_string()))
    }

    async fn send_ping(&mut self) -> StreamResult<(oneshot::Receiver<Instant>, Instant)> {
        // ---
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(nonce, tx);
        let sent_at = Instant::now();
        if let Err(e) = self.send_frame(Frame::Ping(nonce)).await {
            self.pending.lock().remove(&nonce);
            return Err(e);
        }
        self.session.touch();
        Ok((rx, sent_at))
    }

    /// Sends a ping and hands its outcome to the adaptation task later.
    async fn spawn_probe(&mut self, events: &mpsc::UnboundedSender<AdaptEvent>) -> StreamResult<()> {
        // ---
        let bytes_before = self.session.bytes_sent;
        let (rx, sent_at) = self.send_ping().await?;

        let timeout = self.config.probe_timeout;
        let pending = Arc::clone(&self.pending);
        let nonce = self.next_nonce.wrapping_sub(1);
        let events = events.clone();

        tokio::spawn(async move {
            // ---
            let pong_at = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(at)) => Some(at),
                _ => {
                    pending.lock().remove(&nonce);
                    None
                }
            };
            let _ = events.send(AdaptEvent::Probe {
                sent_at,
                bytes_before,
                pong_at,
            });
        });
        Ok(())
    }
}

/// Reads server frames until the connection ends.
async fn read_loop(
    mut stream: FrameStream,
    pending: PendingProbes,
    ack_tx: oneshot::Sender<String>,
    peer_gone: CancellationToken,
    metrics: MetricsContext,
) {
    // ---
    let mut ack_tx = Some(ack_tx);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Frame::Pong(nonce)) => {
                let arrived = Instant::now();
                match pending.lock().remove(&nonce) {
                    Some(tx) => {
                        let _ = tx.send(arrived);
                    }
                    None => debug!("Pong {} arrived after its probe timed out", nonce),
                }
            }
            Ok(Frame::Text(text)) => match ack_tx.take() {
                Some(tx) => {
                    let _ = tx.send(text);
                }
                None => {
                    warn!("Ignoring unexpected text frame {:?}", text);
                    metrics.protocol_anomalies_total.inc();
                }
            },
            Ok(Frame::Close) => {
                debug!("Receiver sent close");
                break;
            }
            Ok(other) => {
                warn!("Ignoring unexpected {:?} frame from receiver", other.kind());
                metrics.protocol_anomalies_total.inc();
            }
            Err(e) => {
                warn!("Receiver stream failed: {}", e);
                break;
            }
        }
    }

    peer_gone.cancel();
}

/// Owns the rate controller; the only place it is mutated.
async fn adaptation_loop(
    mut controller: RateController,
    mut meter: ThroughputMeter,
    encoder: Arc<EncoderProcess>,
    mut events: mpsc::UnboundedReceiver<AdaptEvent>,
    metrics: MetricsContext,
) -> StreamResult<()> {
    // ---
    while let Some(event) = events.recv().await {
        match event {
            AdaptEvent::Probe {
                sent_at,
                bytes_before,
                pong_at,
            } => {
                let sample = meter.record(sent_at, bytes_before, pong_at);
                if pong_at.is_none() {
                    warn!(
                        "RTT probe timed out, counting it as {} ms",
                        sample.rtt.as_millis()
                    );
                    metrics.probe_timeouts_total.inc();
                } else {
                    metrics.rtt_seconds.observe(sample.rtt.as_secs_f64());
                }
                if let Some(bps) = sample.throughput_bps {
                    metrics.measured_throughput_bps.set(bps);
                }
                debug!(
                    rtt_ms = sample.rtt.as_millis() as u64,
                    throughput_bps = ?sample.throughput_bps,
                    "Probe sample"
                );
                controller.observe(sample);
            }
            AdaptEvent::Evaluate => {
                let next = controller.next_bitrate();
                let live = encoder.bitrate();
                if next != live {
                    info!(
                        "Adapting bitrate {} -> {} (rtt {:?}, throughput {:?})",
                        live,
                        next,
                        controller.average_rtt(),
                        controller.average_throughput()
                    );
                    encoder.restart(next).await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn default_config_is_valid() {
        // ---
        let config = StreamConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(
            config.bitrate_ladder().unwrap().rungs(),
            &[64_000, 96_000, 128_000, 160_000, 192_000, 224_000, 256_000, 288_000, 320_000]
        );
    }

    #[test]
    fn validate_rejects_bad_options() {
        // ---
        let bad = [
            StreamConfig {
                chunk_size: 0,
                ..StreamConfig::default()
            },
            StreamConfig {
                adaptation_interval: 0,
                ..StreamConfig::default()
            },
            StreamConfig {
                initial_bitrate: 500_000,
                ..StreamConfig::default()
            },
            StreamConfig {
                min_bitrate: 320_000,
                max_bitrate: 64_000,
                ..StreamConfig::default()
            },
            StreamConfig {
                server_uri: "ws://localhost:1".into(),
                ..StreamConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(StreamError::Config(_))));
        }
    }

    #[test]
    fn explicit_ladder_overrides_range() {
        // ---
        let config = StreamConfig {
            ladder: Some(vec![96_000, 48_000, 128_000]),
            initial_bitrate: 96_000,
            ..StreamConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.bitrate_ladder().unwrap().rungs(), &[48_000, 96_000, 128_000]);
    }

    #[tokio::test]
    async fn probe_rtt_measures_a_pong() {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec::new());
            while let Some(Ok(frame)) = framed.next().await {
                if let Frame::Ping(nonce) = frame {
                    framed.send(Frame::Pong(nonce)).await.unwrap();
                }
            }
        });

        let config = StreamConfig {
            server_uri: addr.to_string(),
            ..StreamConfig::default()
        };
        let metrics = MetricsContext::new("client-test").unwrap();
        let mut client = ClientSession::connect(config, metrics).await.unwrap();

        let rtt = client.probe_rtt().await.unwrap();
        assert!(rtt < Duration::from_secs(2));
        assert_eq!(client.peer_address(), addr);
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_probe_counts_as_the_timeout() {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Read nothing, answer nothing
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let config = StreamConfig {
            server_uri: format!("tcp://{addr}"),
            probe_timeout: Duration::from_millis(100),
            ..StreamConfig::default()
        };
        let metrics = MetricsContext::new("client-test").unwrap();
        let mut client = ClientSession::connect(config, metrics.clone()).await.unwrap();

        assert_eq!(client.probe_rtt().await.unwrap(), Duration::from_millis(100));
        assert_eq!(metrics.probe_timeouts_total.get(), 1);
    }

    #[tokio::test]
    async fn connect_refused_is_an_io_error() {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = StreamConfig {
            server_uri: addr.to_string(),
            ..StreamConfig::default()
        };
        let metrics = MetricsContext::new("client-test").unwrap();
        let err = ClientSession::connect(config, metrics).await.err().unwrap();
        assert!(matches!(err, StreamError::Io(_)));
    }
}
