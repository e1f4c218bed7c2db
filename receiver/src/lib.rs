//! Chunk receiver library.
//!
//! Accepts sender connections, persists every binary frame as a numbered
//! chunk file and reports finished transfers to a [`CompletionHandler`].
//! Used by the receiver binary and by integration tests.

pub mod completion;
pub mod server;
pub mod store;

pub use completion::{CommandHook, CompletionHandler, CompletionRecord, LogCompletion};
pub use server::{ChunkServer, ServerConfig, ServerSession, SessionLayout};
pub use store::ChunkStore;
