//! Shared building blocks for the adaptive-bitrate audio streamer.
//!
//! The sender and receiver agree on the frame format defined in
//! [`protocol`], report failures through [`StreamError`], and share the
//! observability and CLI policy so both binaries behave the same.

pub mod cli;
pub mod error;
pub mod latency;
pub mod observability;
pub mod protocol;
pub mod session;

pub use cli::ColorWhen;
pub use error::{StreamError, StreamResult};
pub use latency::{
    AutoregressiveLatency, DistributionLatency, LatencyEstimate, LatencyProvider, ReplayLatency,
};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use protocol::{parse_server_uri, CodecError, Frame, FrameCodec, COMPLETION_ACK, END_OF_STREAM};
pub use session::{SessionState, StreamSession};
