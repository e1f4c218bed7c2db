//! Network simulator for end-to-end tests.
//!
//! A TCP proxy that delays every forwarded segment by the latency a
//! [`LatencyProvider`] hands out. Delivery is pipelined: a segment is
//! scheduled for `arrival + latency`, never before the segment ahead of
//! it, so the byte stream keeps its order and throughput is not capped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use abr_stream_common::LatencyProvider;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type SharedProvider = Arc<Mutex<Box<dyn LatencyProvider>>>;

/// Latency-injecting TCP proxy in front of one upstream address.
pub struct LatencyProxy {
    // ---
    addr: SocketAddr,
    forwarded: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl LatencyProxy {
    // ---
    /// Listens on an ephemeral local port and forwards to `upstream`.
    ///
    /// # Arguments
    ///
    /// * `to_upstream` - Latency for client-to-server segments
    /// * `to_client` - Latency for server-to-client segments
    pub async fn start(
        upstream: SocketAddr,
        to_upstream: impl LatencyProvider + 'static,
        to_client: impl LatencyProvider + 'static,
    ) -> std::io::Result<Self> {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let forwarded = Arc::new(AtomicU64::new(0));

        let up: SharedProvider = Arc::new(Mutex::new(Box::new(to_upstream)));
        let down: SharedProvider = Arc::new(Mutex::new(Box::new(to_client)));
        let counter = Arc::clone(&forwarded);

        let task = tokio::spawn(async move {
            while let Ok((client, _)) = listener.accept().await {
                let Ok(server) = TcpStream::connect(upstream).await else {
                    continue;
                };
                let (client_rx, client_tx) = client.into_split();
                let (server_rx, server_tx) = server.into_split();
                tokio::spawn(pump(client_rx, server_tx, Arc::clone(&up), Arc::clone(&counter)));
                tokio::spawn(pump(server_rx, client_tx, Arc::clone(&down), Arc::clone(&counter)));
            }
        });

        Ok(Self {
            addr,
            forwarded,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        // ---
        self.addr
    }

    /// Bytes forwarded in both directions so far.
    pub fn forwarded_bytes(&self) -> u64 {
        // ---
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl Drop for LatencyProxy {
    fn drop(&mut self) {
        // ---
        self.task.abort();
    }
}

async fn pump(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    latency: SharedProvider,
    forwarded: Arc<AtomicU64>,
) {
    // ---
    let (tx, mut rx) = mpsc::unbounded_channel::<(Instant, Bytes)>();

    let writer = tokio::spawn(async move {
        while let Some((deliver_at, segment)) = rx.recv().await {
            tokio::time::sleep_until(deliver_at).await;
            if to.write_all(&segment).await.is_err() {
                break;
            }
        }
        let _ = to.shutdown().await;
    });

    let mut last = Instant::now();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let delay = latency
            .lock()
            .next_latency()
            .map(|e| e.latency)
            .unwrap_or_default();
        last = last.max(Instant::now() + delay);
        forwarded.fetch_add(n as u64, Ordering::Relaxed);
        if tx.send((last, Bytes::copy_from_slice(&buf[..n]))).is_err() {
            break;
        }
    }

    drop(tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use abr_stream_common::ReplayLatency;
    use std::time::Duration;

    async fn echo_server() -> SocketAddr {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rx, mut tx) = socket.split();
                    let _ = tokio::io::copy(&mut rx, &mut tx).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_round_trip_includes_both_latencies() {
        // ---
        let upstream = echo_server().await;
        let proxy = LatencyProxy::start(
            upstream,
            ReplayLatency::new(vec![40.0], true),
            ReplayLatency::new(vec![60.0], true),
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
        let started = std::time::Instant::now();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();

        assert_eq!(&reply, b"ping");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(proxy.forwarded_bytes(), 8);
    }

    #[tokio::test]
    async fn test_order_survives_varying_latency() {
        // ---
        let upstream = echo_server().await;
        let proxy = LatencyProxy::start(
            upstream,
            ReplayLatency::new(vec![50.0, 1.0, 30.0, 0.0], true),
            ReplayLatency::new(vec![0.0], true),
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(proxy.local_addr()).await.unwrap();
        let mut expected = Vec::new();
        for i in 0..20u8 {
            stream.write_all(&[i; 3]).await.unwrap();
            expected.extend_from_slice(&[i; 3]);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut echoed = vec![0u8; expected.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, expected);
    }
}
