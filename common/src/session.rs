//! Per-connection session context.
//!
//! Tracks traffic counters and lifecycle state for one connection, on
//! either end. Counters are logged periodically for observability, the
//! same way on both sides.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport established, nothing exchanged yet
    Connected,

    /// Chunks are flowing
    Streaming,

    /// End-of-stream marker sent or received, waiting on the peer
    Finishing,

    /// Orderly close after a completed transfer
    Closed,

    /// Terminal error or premature disconnect
    Failed,
}

impl SessionState {
    // ---
    pub fn is_terminal(self) -> bool {
        // ---
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Connection context: peer, counters, last activity and state.
#[derive(Debug, Clone)]
pub struct StreamSession {
    // ---
    /// Remote endpoint
    pub peer_address: SocketAddr,

    /// Payload bytes written to the peer
    pub bytes_sent: u64,

    /// Payload bytes read from the peer
    pub bytes_received: u64,

    /// Chunk frames moved in either direction
    pub chunks: u64,

    /// Last time a frame was sent or received
    pub last_activity: Instant,

    state: SessionState,

    started_at: Instant,
    last_log_time: Instant,
    log_interval: Duration,
}

impl StreamSession {
    // ---
    /// Creates a session in the `Connected` state.
    ///
    /// # Arguments
    ///
    /// * `peer_address` - Remote endpoint of the connection
    /// * `log_interval` - How often progress is logged automatically
    pub fn new(peer_address: SocketAddr, log_interval: Duration) -> Self {
        // ---
        let now = Instant::now();
        Self {
            peer_address,
            bytes_sent: 0,
            bytes_received: 0,
            chunks: 0,
            last_activity: now,
            state: SessionState::Connected,
            started_at: now,
            last_log_time: now,
            log_interval,
        }
    }

    pub fn state(&self) -> SessionState {
        // ---
        self.state
    }

    /// Moves to `next`. Terminal states are sticky.
    pub fn transition(&mut self, next: SessionState) {
        // ---
        if self.state.is_terminal() {
            return;
        }
        self.state = next;
    }

    /// Records a chunk handed to the transport.
    pub fn record_sent(&mut self, bytes: usize) {
        // ---
        self.bytes_sent += bytes as u64;
        self.chunks += 1;
        self.touch();
    }

    /// Records a chunk read from the transport.
    pub fn record_received(&mut self, bytes: usize) {
        // ---
        self.bytes_received += bytes as u64;
        self.chunks += 1;
        self.touch();
    }

    /// Marks activity without moving payload (control frames, probes).
    pub fn touch(&mut self) {
        // ---
        self.last_activity = Instant::now();
        if self.state == SessionState::Connected {
            self.state = SessionState::Streaming;
        }
        self.maybe_log();
    }

    /// Time since the session was created.
    pub fn elapsed(&self) -> Duration {
        // ---
        self.started_at.elapsed()
    }

    /// Payload rate in bits per second over the whole session.
    pub fn average_bps(&self) -> f64 {
        // ---
        let secs = self.elapsed().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            (self.bytes_sent + self.bytes_received) as f64 * 8.0 / secs
        }
    }

    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current counters.
    pub fn log(&self) {
        // ---
        info!(
            "Session {}: {:?}, {} chunks, {} B sent, {} B received, {:.0} bit/s",
            self.peer_address,
            self.state,
            self.chunks,
            self.bytes_sent,
            self.bytes_received,
            self.average_bps()
        );
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn session() -> StreamSession {
        // ---
        StreamSession::new("127.0.0.1:9".parse().unwrap(), Duration::from_secs(60))
    }

    #[test]
    fn first_activity_starts_streaming() {
        // ---
        let mut s = session();
        assert_eq!(s.state(), SessionState::Connected);

        s.record_received(1000);
        s.record_received(500);

        assert_eq!(s.state(), SessionState::Streaming);
        assert_eq!(s.chunks, 2);
        assert_eq!(s.bytes_received, 1500);
        assert_eq!(s.bytes_sent, 0);
    }

    #[test]
    fn terminal_states_are_sticky() {
        // ---
        let mut s = session();
        s.transition(SessionState::Failed);
        s.transition(SessionState::Streaming);
        s.record_sent(10);

        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.bytes_sent, 10);
    }

    #[test]
    fn finishing_is_not_reset_by_activity() {
        // ---
        let mut s = session();
        s.record_sent(1);
        s.transition(SessionState::Finishing);
        s.touch();
        assert_eq!(s.state(), SessionState::Finishing);
    }
}
