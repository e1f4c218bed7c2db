//! Bounded hand-off of encoded chunks from the encoder to the transport.
//!
//! Single producer (the encoder read loop), single consumer (the send
//! loop). Every chunk is tagged with the generation of the encoder session
//! that produced it; [`ChunkQueue::clear`] starts a new generation, and a
//! push carrying an older generation is refused. A read loop that loses the
//! race with a restart therefore cannot leak stale chunks to the network.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use abr_stream_common::{StreamError, StreamResult};

use crate::rate::BitrateLevel;

/// One unit of encoder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    // ---
    /// Encode-time sequence index, increasing across restarts
    pub index: u64,

    /// Encoder session epoch this chunk belongs to
    pub generation: u64,

    /// Bitrate the producing session encoded at
    pub bitrate: BitrateLevel,

    pub payload: Bytes,
}

impl Chunk {
    // ---
    pub fn len(&self) -> usize {
        // ---
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamEnd {
    Finished,
    Crashed(String),
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<Chunk>,
    generation: u64,
    end: Option<StreamEnd>,
    delivered_bytes: u64,
}

/// What [`ChunkQueue::clear`] threw away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleared {
    // ---
    /// Generation now accepted by `push`
    pub generation: u64,

    /// Chunks dropped from the queue
    pub discarded: usize,

    /// Bytes the consumer popped during the abandoned generation
    pub delivered_bytes: u64,
}

/// Bounded SPSC queue with generation fencing.
#[derive(Debug)]
pub struct ChunkQueue {
    // ---
    state: Mutex<QueueState>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl ChunkQueue {
    // ---
    /// Creates an empty queue at generation 0.
    pub fn new(capacity: usize) -> Self {
        // ---
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                generation: 0,
                end: None,
                delivered_bytes: 0,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        // ---
        self.capacity
    }

    pub fn len(&self) -> usize {
        // ---
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.len() == 0
    }

    /// Generation currently accepted by `push`.
    pub fn generation(&self) -> u64 {
        // ---
        self.state.lock().generation
    }

    /// Whether the live generation reached a clean end of stream.
    pub fn is_finished(&self) -> bool {
        // ---
        self.state.lock().end == Some(StreamEnd::Finished)
    }

    /// Whether the live generation ended, cleanly or not.
    pub fn has_ended(&self) -> bool {
        // ---
        self.state.lock().end.is_some()
    }

    /// Enqueues a chunk, waiting while the queue is full.
    ///
    /// Returns `false` without enqueueing if the chunk's generation is no
    /// longer live, including when a `clear` happens while waiting.
    pub async fn push(&self, chunk: Chunk) -> bool {
        // ---
        loop {
            let notified = self.not_full.notified();
            {
                let mut state = self.state.lock();
                if chunk.generation != state.generation || state.end.is_some() {
                    return false;
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(chunk);
                    drop(state);
                    self.not_empty.notify_one();
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Takes the next chunk, waiting until one is available.
    ///
    /// Returns `Ok(None)` once the live generation finished and every chunk
    /// was taken.
    ///
    /// # Errors
    ///
    /// Returns `EncoderCrashed` when the live encoder died before finishing.
    pub async fn pop(&self) -> StreamResult<Option<Chunk>> {
        // ---
        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = self.state.lock();
                if let Some(chunk) = state.items.pop_front() {
                    state.delivered_bytes += chunk.len() as u64;
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(Some(chunk));
                }
                match &state.end {
                    Some(StreamEnd::Finished) => return Ok(None),
                    Some(StreamEnd::Crashed(status)) => {
                        return Err(StreamError::EncoderCrashed {
                            status: status.clone(),
                        })
                    }
                    None => {}
                }
            }
            notified.await;
        }
    }

    /// Marks the end of `generation`'s output. Ignored for stale generations.
    ///
    /// `Err(status)` records an encoder crash that `pop` will surface once
    /// the remaining chunks are drained.
    pub fn finish(&self, generation: u64, outcome: Result<(), String>) {
        // ---
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.end.is_some() {
                return;
            }
            state.end = Some(match outcome {
                Ok(()) => StreamEnd::Finished,
                Err(status) => StreamEnd::Crashed(status),
            });
        }
        self.not_empty.notify_one();
    }

    /// Drops every queued chunk and starts a new generation.
    ///
    /// Only the encoder calls this, while holding its restart lock.
    pub fn clear(&self) -> Cleared {
        // ---
        let cleared = {
            let mut state = self.state.lock();
            let discarded = state.items.len();
            state.items.clear();
            state.generation += 1;
            state.end = None;
            let delivered_bytes = std::mem::take(&mut state.delivered_bytes);
            Cleared {
                generation: state.generation,
                discarded,
                delivered_bytes,
            }
        };
        // Wake a producer parked on a full queue so it sees the new generation
        self.not_full.notify_one();
        cleared
    }
}
