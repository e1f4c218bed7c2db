//! External encoder process lifecycle.
//!
//! [`EncoderProcess`] owns exactly one encoder subprocess at a time. A
//! dedicated read loop pumps the subprocess's stdout into the
//! [`ChunkQueue`] in `chunk_size` pieces. A restart swaps the subprocess
//! for one running at a new bitrate:
//!
//! ```text
//! Starting ──▶ Running ──▶ Draining ──▶ Terminated
//!                 ▲            │
//!                 └── restart ─┘
//! ```
//!
//! The swap happens under an async mutex: cancel the read loop, reap the
//! old child, clear the queue (new generation), spawn the replacement.
//! The replacement resumes at the source position already covered by
//! chunks the transport took, so the receiver does not get the start of
//! the source twice.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use abr_stream_common::{MetricsContext, StreamError, StreamResult};

use crate::queue::{Chunk, ChunkQueue};
use crate::rate::BitrateLevel;
use crate::source::AudioSource;

/// Encoder invocation parameters.
#[derive(Debug, Clone)]
pub struct EncoderParams {
    // ---
    /// Encoder executable
    pub program: PathBuf,

    /// Arguments placed before the generated ones, for wrapper launchers
    pub program_args: Vec<String>,

    /// Audio codec, e.g. `libmp3lame`
    pub codec: String,

    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Output channel count
    pub channels: u16,

    /// Output container, e.g. `mp3`
    pub container_format: String,
}

impl Default for EncoderParams {
    fn default() -> Self {
        // ---
        Self {
            program: PathBuf::from("ffmpeg"),
            program_args: Vec::new(),
            codec: "libmp3lame".into(),
            sample_rate: 44_100,
            channels: 2,
            container_format: "mp3".into(),
        }
    }
}

impl EncoderParams {
    // ---
    /// Builds the deterministic encoder argument list.
    ///
    /// # Arguments
    ///
    /// * `input` - Input path, or `pipe:0` for stdin
    /// * `bitrate` - Target bitrate in bits per second
    /// * `offset` - Source position to start encoding from
    pub fn args(&self, input: &str, bitrate: BitrateLevel, offset: Duration) -> Vec<String> {
        // ---
        let mut args = self.program_args.clone();
        args.extend(["-hide_banner", "-loglevel", "error"].map(String::from));
        if !offset.is_zero() {
            args.push("-ss".into());
            args.push(format!("{:.3}", offset.as_secs_f64()));
        }
        args.extend([
            "-i".to_string(),
            input.to_string(),
            "-f".to_string(),
            self.container_format.clone(),
            "-codec:a".to_string(),
            self.codec.clone(),
            "-b:a".to_string(),
            bitrate.to_string(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            self.channels.to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }

    fn program_name(&self) -> String {
        // ---
        self.program.display().to_string()
    }
}

/// Lifecycle state of the encoder subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderStatus {
    Starting,
    Running,
    Draining,
    Terminated,
}

/// Snapshot of the live encoder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    // ---
    pub pid: Option<u32>,
    pub bitrate: BitrateLevel,
    pub generation: u64,
}

struct EncoderSession {
    info: SessionInfo,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    feeder: Option<JoinHandle<()>>,
}

impl EncoderSession {
    // ---
    async fn stop(mut self) {
        // ---
        self.cancel.cancel();
        if let Err(e) = (&mut self.worker).await {
            warn!("Encoder read loop ended abnormally: {}", e);
        }
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        debug!(
            "Encoder pid={:?} at {} bps terminated",
            self.info.pid, self.info.bitrate
        );
    }
}

impl Drop for EncoderSession {
    // Covers sessions dropped without stop(); the read loop kills and reaps
    // its child once cancelled.
    fn drop(&mut self) {
        // ---
        self.cancel.cancel();
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

#[derive(Default)]
struct EncoderState {
    session: Option<EncoderSession>,
    /// Source position covered by chunks already taken by the transport
    offset: Duration,
}

/// Owner of the encoder subprocess and its read loop.
pub struct EncoderProcess {
    // ---
    params: EncoderParams,
    source: AudioSource,
    chunk_size: usize,
    queue: Arc<ChunkQueue>,
    metrics: MetricsContext,
    state: Mutex<EncoderState>,
    /// Lifecycle phase, readable while a transition holds `state`
    phase: parking_lot::Mutex<EncoderStatus>,
    next_index: Arc<AtomicU64>,
    live_bitrate: AtomicU32,
    restarts: AtomicU64,
}

impl EncoderProcess {
    // ---
    /// Creates the owner; no subprocess runs until [`start`](Self::start).
    pub fn new(
        params: EncoderParams,
        source: AudioSource,
        chunk_size: usize,
        queue: Arc<ChunkQueue>,
        metrics: MetricsContext,
    ) -> Self {
        // ---
        Self {
            params,
            source,
            chunk_size: chunk_size.max(1),
            queue,
            metrics,
            state: Mutex::new(EncoderState::default()),
            phase: parking_lot::Mutex::new(EncoderStatus::Terminated),
            next_index: Arc::new(AtomicU64::new(0)),
            live_bitrate: AtomicU32::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    /// Spawns the encoder at `bitrate`.
    ///
    /// Returns once the process is spawned; output arrives asynchronously.
    /// A session that is already alive is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `EncoderSpawn` if the executable cannot be started.
    pub async fn start(&self, bitrate: BitrateLevel) -> StreamResult<SessionInfo> {
        // ---
        let mut state = self.state.lock().await;
        if let Some(session) = &state.session {
            return Ok(session.info);
        }
        self.spawn_session(&mut state, bitrate)
    }

    /// Replaces the running encoder with one at `new_bitrate`.
    ///
    /// Returns `Ok(false)` when nothing was done: same bitrate, or the
    /// live stream already ended (its remaining chunks are kept).
    ///
    /// # Errors
    ///
    /// Returns `EncoderSpawn` if the replacement cannot be started.
    pub async fn restart(&self, new_bitrate: BitrateLevel) -> StreamResult<bool> {
        // ---
        let mut state = self.state.lock().await;

        let Some(session) = state.session.take() else {
            self.spawn_session(&mut state, new_bitrate)?;
            return Ok(true);
        };

        if session.info.bitrate == new_bitrate || self.queue.has_ended() {
            if session.info.bitrate != new_bitrate {
                debug!(
                    "Source fully encoded, keeping {} bps instead of {}",
                    session.info.bitrate, new_bitrate
                );
            }
            state.session = Some(session);
            return Ok(false);
        }

        let old_bitrate = session.info.bitrate;
        self.set_phase(EncoderStatus::Draining);
        session.stop().await;

        let cleared = self.queue.clear();
        state.offset += covered_duration(cleared.delivered_bytes, old_bitrate);
        self.metrics.chunk_queue_depth.set(0);

        info!(
            "Restarting encoder {} -> {} bps at {:.3}s ({} stale chunks discarded)",
            old_bitrate,
            new_bitrate,
            state.offset.as_secs_f64(),
            cleared.discarded
        );

        self.spawn_session(&mut state, new_bitrate)?;
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.metrics.encoder_restarts_total.inc();
        Ok(true)
    }

    /// Next chunk from the live encoder, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns `EncoderCrashed` if the encoder died mid-stream.
    pub async fn read_chunk(&self) -> StreamResult<Option<Chunk>> {
        // ---
        let chunk = self.queue.pop().await;
        self.metrics.chunk_queue_depth.set(self.queue.len() as i64);
        chunk
    }

    /// Terminates the live encoder, if any, and waits for its read loop.
    pub async fn shutdown(&self) {
        // ---
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.take() {
            self.set_phase(EncoderStatus::Draining);
            session.stop().await;
        }
        self.set_phase(EncoderStatus::Terminated);
    }

    /// Bitrate of the live (or last) encoder session.
    pub fn bitrate(&self) -> BitrateLevel {
        // ---
        self.live_bitrate.load(Ordering::Acquire)
    }

    /// Number of completed restarts.
    pub fn restarts(&self) -> u64 {
        // ---
        self.restarts.load(Ordering::Relaxed)
    }

    /// Current lifecycle phase.
    ///
    /// `Starting` and `Draining` are visible while a start or restart is in
    /// progress; a session whose process already exited reads `Terminated`.
    pub async fn status(&self) -> EncoderStatus {
        // ---
        let phase = *self.phase.lock();
        if phase != EncoderStatus::Running {
            return phase;
        }
        // A transition holding the lock updates the phase itself
        match self.state.try_lock() {
            Ok(state) => match &state.session {
                Some(s) if !s.worker.is_finished() => EncoderStatus::Running,
                _ => EncoderStatus::Terminated,
            },
            Err(_) => phase,
        }
    }

    fn set_phase(&self, phase: EncoderStatus) {
        // ---
        let mut current = self.phase.lock();
        if *current != phase {
            debug!("Encoder {:?} -> {:?}", *current, phase);
            *current = phase;
        }
    }

    /// Source position the current session started at.
    pub async fn offset(&self) -> Duration {
        // ---
        self.state.lock().await.offset
    }

    fn spawn_session(&self, state: &mut EncoderState, bitrate: BitrateLevel) -> StreamResult<SessionInfo> {
        // ---
        let generation = self.queue.generation();
        let args = self
            .params
            .args(&self.source.input_arg(), bitrate, state.offset);
        let stdin_bytes = self.source.stdin_bytes();

        self.set_phase(EncoderStatus::Starting);
        debug!("Encoder command: {} {}", self.params.program_name(), args.join(" "));

        let mut child = Command::new(&self.params.program)
            .args(&args)
            .stdin(if stdin_bytes.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                self.set_phase(EncoderStatus::Terminated);
                StreamError::EncoderSpawn {
                    program: self.params.program_name(),
                    source,
                }
            })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| {
            self.set_phase(EncoderStatus::Terminated);
            StreamError::EncoderSpawn {
                program: self.params.program_name(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout not captured"),
            }
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, pid));
        }

        let cancel = CancellationToken::new();
        let feeder = match (child.stdin.take(), stdin_bytes) {
            (Some(stdin), Some(bytes)) => Some(tokio::spawn(feed_stdin(stdin, bytes, cancel.clone()))),
            _ => None,
        };

        let read_loop = ReadLoop {
            child,
            stdout,
            queue: Arc::clone(&self.queue),
            generation,
            bitrate,
            chunk_size: self.chunk_size,
            next_index: Arc::clone(&self.next_index),
            cancel: cancel.clone(),
            metrics: self.metrics.clone(),
        };
        let worker = tokio::spawn(read_loop.run());

        let info = SessionInfo {
            pid,
            bitrate,
            generation,
        };
        state.session = Some(EncoderSession {
            info,
            cancel,
            worker,
            feeder,
        });
        self.set_phase(EncoderStatus::Running);
        self.live_bitrate.store(bitrate, Ordering::Release);
        self.metrics.current_bitrate_bps.set(bitrate as i64);

        info!(
            "Encoder running: pid={:?} bitrate={} generation={}",
            pid, bitrate, generation
        );
        Ok(info)
    }
}

/// Source duration represented by `bytes` of output at `bitrate`.
fn covered_duration(bytes: u64, bitrate: BitrateLevel) -> Duration {
    // ---
    if bitrate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(bytes as f64 * 8.0 / bitrate as f64)
}

/// Read loop of one encoder session; owns the child process.
struct ReadLoop {
    child: Child,
    stdout: ChildStdout,
    queue: Arc<ChunkQueue>,
    generation: u64,
    bitrate: BitrateLevel,
    chunk_size: usize,
    next_index: Arc<AtomicU64>,
    cancel: CancellationToken,
    metrics: MetricsContext,
}

impl ReadLoop {
    // ---
    async fn run(mut self) {
        // ---
        let cancel = self.cancel.clone();
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = read_full(&mut self.stdout, self.chunk_size) => Some(r),
            };

            let payload = match read {
                None => return self.terminate().await,
                Some(Ok(payload)) if payload.is_empty() => break,
                Some(Ok(payload)) => payload,
                Some(Err(e)) => {
                    warn!("Encoder output read failed: {}", e);
                    self.terminate().await;
                    self.queue
                        .finish(self.generation, Err(format!("output read failed: {e}")));
                    return;
                }
            };

            let chunk = Chunk {
                index: self.next_index.fetch_add(1, Ordering::Relaxed),
                generation: self.generation,
                bitrate: self.bitrate,
                payload,
            };
            let pushed = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                ok = self.queue.push(chunk) => ok,
            };
            if !pushed {
                return self.terminate().await;
            }
            self.metrics.chunk_queue_depth.set(self.queue.len() as i64);
        }

        // Output closed: the process exited or is about to
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.terminate().await,
            s = self.child.wait() => s,
        };

        match status {
            Ok(s) if s.success() => {
                debug!("Encoder generation {} finished cleanly", self.generation);
                self.queue.finish(self.generation, Ok(()));
            }
            Ok(s) => {
                warn!("Encoder generation {} exited with {}", self.generation, s);
                self.queue.finish(self.generation, Err(s.to_string()));
            }
            Err(e) => {
                warn!("Failed to reap encoder: {}", e);
                self.queue.finish(self.generation, Err(e.to_string()));
            }
        }
    }

    async fn terminate(&mut self) {
        // ---
        if let Err(e) = self.child.start_kill() {
            debug!("Encoder already gone: {}", e);
        }
        if let Err(e) = self.child.wait().await {
            warn!("Failed to reap encoder: {}", e);
        }
    }
}

/// Reads until `size` bytes or end of stream; an empty result means EOF.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> std::io::Result<Bytes> {
    // ---
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

async fn feed_stdin(mut stdin: ChildStdin, bytes: Bytes, cancel: CancellationToken) {
    // ---
    tokio::select! {
        _ = cancel.cancelled() => {}
        r = stdin.write_all(&bytes) => {
            if let Err(e) = r {
                debug!("Encoder stopped reading stdin: {}", e);
            }
        }
    }
    // Dropping stdin closes the pipe, which is the encoder's end of input
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    // ---
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("encoder[{:?}]: {}", pid, line);
    }
}
