//! TCP chunk server.
//!
//! Each accepted connection is one session: binary frames are persisted as
//! numbered chunk files, pings are answered, and the `"done"` marker fires
//! the completion callback before the ack is sent back.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use abr_stream_common::{
    CodecError, Frame, FrameCodec, MetricsContext, SessionState, StreamError, StreamResult,
    StreamSession, COMPLETION_ACK, END_OF_STREAM,
};

use crate::completion::{CompletionHandler, CompletionRecord};
use crate::store::ChunkStore;

/// Where a session's chunk files go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionLayout {
    /// Every session writes straight into the output directory. Sessions
    /// are handled one at a time; a later session overwrites the chunk
    /// files of an earlier one.
    Flat,

    /// Each session gets `session_NNNN/` under the output directory
    #[default]
    PerSession,
}

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // ---
    pub bind: SocketAddr,
    pub output_dir: PathBuf,

    /// Chunk file extension, without the dot
    pub extension: String,

    pub layout: SessionLayout,

    /// How often per-session progress is logged
    pub log_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        // ---
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], abr_stream_common::protocol::DEFAULT_PORT)),
            output_dir: PathBuf::from("received_chunks"),
            extension: "wav".into(),
            layout: SessionLayout::PerSession,
            log_interval: Duration::from_secs(5),
        }
    }
}

/// An accepted connection not yet handled.
pub struct ServerSession {
    // ---
    id: u64,
    framed: Framed<TcpStream, FrameCodec>,
    context: StreamSession,
    dir: PathBuf,
}

impl ServerSession {
    // ---
    pub fn id(&self) -> u64 {
        // ---
        self.id
    }

    pub fn peer_address(&self) -> SocketAddr {
        // ---
        self.context.peer_address
    }

    /// Directory this session persists into.
    pub fn output_dir(&self) -> &std::path::Path {
        // ---
        &self.dir
    }
}

/// Listening endpoint plus the per-connection handler.
pub struct ChunkServer {
    // ---
    listener: TcpListener,
    config: ServerConfig,
    handler: Arc<dyn CompletionHandler>,
    metrics: MetricsContext,
    next_session: AtomicU64,
    /// Held for the whole of a `Flat` session so two never share the files
    flat_writer: Mutex<()>,
}

impl ChunkServer {
    // ---
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the address cannot be bound.
    pub async fn bind(
        config: ServerConfig,
        handler: impl CompletionHandler,
        metrics: MetricsContext,
    ) -> StreamResult<Self> {
        // ---
        let listener = TcpListener::bind(config.bind).await?;
        info!(
            "Listening on {} (chunks under {})",
            listener.local_addr()?,
            config.output_dir.display()
        );
        Ok(Self {
            listener,
            config,
            handler: Arc::new(handler),
            metrics,
            next_session: AtomicU64::new(0),
            flat_writer: Mutex::new(()),
        })
    }

    pub fn local_addr(&self) -> StreamResult<SocketAddr> {
        // ---
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        // ---
        &self.config
    }

    /// Waits for the next connection.
    pub async fn accept(&self) -> StreamResult<ServerSession> {
        // ---
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let dir = match self.config.layout {
            SessionLayout::Flat => self.config.output_dir.clone(),
            SessionLayout::PerSession => self.config.output_dir.join(format!("session_{id:04}")),
        };
        info!("Session {} accepted from {}", id, peer);

        Ok(ServerSession {
            id,
            framed: Framed::new(stream, FrameCodec::new()),
            context: StreamSession::new(peer, self.config.log_interval),
            dir,
        })
    }

    /// Runs one session to completion.
    ///
    /// The completion callback fires only when the `"done"` marker arrives.
    ///
    /// # Errors
    ///
    /// - `ConnectionLost` if the peer disconnects or closes before `"done"`;
    ///   chunk files written so far stay on disk
    /// - `Codec` if the peer sends an undecodable frame
    /// - `Io` if a chunk file cannot be written
    pub async fn handle(&self, session: ServerSession) -> StreamResult<CompletionRecord> {
        // ---
        let ServerSession {
            id,
            mut framed,
            mut context,
            dir,
        } = session;

        let _exclusive = match self.config.layout {
            SessionLayout::Flat => match self.flat_writer.try_lock() {
                Ok(guard) => Some(guard),
                Err(_) => {
                    info!("Session {} waiting for the output directory", id);
                    Some(self.flat_writer.lock().await)
                }
            },
            SessionLayout::PerSession => None,
        };

        let result = self.receive(&mut framed, &mut context, dir).await;
        match result {
            Ok(store) => {
                let record = self.complete(&mut framed, &mut context, store).await;
                context.transition(SessionState::Closed);
                self.metrics.sessions_completed_total.inc();
                context.log();
                info!("Session {} complete", id);
                Ok(record)
            }
            Err((e, persisted)) => {
                context.transition(SessionState::Failed);
                self.metrics.sessions_incomplete_total.inc();
                warn!(
                    "Session {} incomplete, {} partial chunks kept: {}",
                    id, persisted, e
                );
                Err(e)
            }
        }
    }

    /// Reads frames until the end-of-stream marker.
    ///
    /// On failure also returns how many chunks were persisted.
    async fn receive(
        &self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        context: &mut StreamSession,
        dir: PathBuf,
    ) -> Result<ChunkStore, (StreamError, usize)> {
        // ---
        let mut store = ChunkStore::create(dir, &self.config.extension)
            .await
            .map_err(|e| (StreamError::Io(e), 0))?;

        loop {
            let persisted = store.len();
            let lost = |reason: String| {
                (
                    StreamError::connection_lost(persisted as u64, reason),
                    persisted,
                )
            };

            let frame = match framed.next().await {
                None => return Err(lost("peer disconnected before end of stream".into())),
                Some(Err(CodecError::Io(e))) => return Err(lost(e.to_string())),
                Some(Err(e)) => return Err((StreamError::Codec(e), persisted)),
                Some(Ok(frame)) => frame,
            };

            match frame {
                Frame::Binary(payload) => {
                    let path = store
                        .persist(&payload)
                        .await
                        .map_err(|e| (StreamError::Io(e), persisted))?;
                    context.record_received(payload.len());
                    self.metrics.chunks_received_total.inc();
                    self.metrics.bytes_received_total.inc_by(payload.len() as u64);
                    debug!("Chunk {} ({} B) -> {}", persisted, payload.len(), path.display());
                }
                Frame::Text(text) if text == END_OF_STREAM => {
                    context.transition(SessionState::Finishing);
                    return Ok(store);
                }
                Frame::Text(text) => {
                    warn!("Ignoring unexpected control text {:?}", text);
                    self.metrics.protocol_anomalies_total.inc();
                    context.touch();
                }
                Frame::Ping(nonce) => {
                    framed
                        .send(Frame::Pong(nonce))
                        .await
                        .map_err(|e| lost(e.to_string()))?;
                    context.touch();
                }
                Frame::Pong(_) => {
                    warn!("Ignoring unsolicited pong");
                    self.metrics.protocol_anomalies_total.inc();
                }
                Frame::Close => return Err(lost("peer closed before end of stream".into())),
            }
        }
    }

    /// Fires the callback, then acknowledges and closes.
    async fn complete(
        &self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        context: &mut StreamSession,
        store: ChunkStore,
    ) -> CompletionRecord {
        // ---
        let (output_dir, chunk_paths, total_bytes) = store.into_parts();
        let record = CompletionRecord {
            peer: context.peer_address,
            output_dir,
            chunk_paths,
            total_bytes,
            finished_at: SystemTime::now(),
        };

        let handler = Arc::clone(&self.handler);
        let callback_record = record.clone();
        let timer = self.metrics.completion_callback_seconds.start_timer();
        if let Err(e) = tokio::task::spawn_blocking(move || handler.on_complete(&callback_record)).await {
            error!("Completion callback failed: {}", e);
        }
        timer.observe_duration();

        if let Err(e) = framed.send(Frame::Text(COMPLETION_ACK.to_string())).await {
            warn!("Failed to send completion ack to {}: {}", record.peer, e);
        }
        if let Err(e) = framed.close().await {
            debug!("Error closing connection to {}: {}", record.peer, e);
        }
        record
    }

    /// Accepts and handles connections forever.
    pub async fn serve(self: Arc<Self>) -> StreamResult<()> {
        // ---
        self.serve_until(CancellationToken::new()).await
    }

    /// Accepts connections until `cancel` fires; sessions still running
    /// at that point are aborted.
    pub async fn serve_until(self: Arc<Self>, cancel: CancellationToken) -> StreamResult<()> {
        // ---
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = self.accept() => match accepted {
                    Ok(session) => {
                        let server = Arc::clone(&self);
                        sessions.spawn(async move {
                            // Outcome is already logged by handle
                            let _ = server.handle(session).await;
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }

        info!("Shutting down, aborting {} active sessions", sessions.len());
        sessions.shutdown().await;
        Ok(())
    }
}
