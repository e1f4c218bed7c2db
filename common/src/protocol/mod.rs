//! Message framing between sender and receiver.
//!
//! A connection is an ordered TCP byte stream cut into discrete frames.
//! Chunks travel as binary frames, control signals as text frames, and
//! ping/pong frames carry RTT probes.

mod codec;
mod frame;

pub use codec::{CodecError, FrameCodec, MAX_PAYLOAD_LEN};
pub use frame::{Frame, FrameKind};

/// Text frame the sender emits once every chunk has been handed over.
pub const END_OF_STREAM: &str = "done";

/// Text frame the receiver answers with after the completion callback ran.
pub const COMPLETION_ACK: &str = "done";

/// Default listening port of the receiver.
pub const DEFAULT_PORT: u16 = 8765;

/// Strips an optional `tcp://` scheme and trailing slash from a server URI.
///
/// The result is a `host:port` string suitable for `TcpStream::connect`.
pub fn parse_server_uri(uri: &str) -> Result<String, crate::StreamError> {
    // ---
    let trimmed = uri.trim();
    let without_scheme = match trimmed.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(crate::StreamError::Config(format!(
                "unsupported scheme `{scheme}` in server uri `{uri}`"
            )))
        }
        None => trimmed,
    };
    let addr = without_scheme.trim_end_matches('/');

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(addr.to_string())
        }
        _ => Err(crate::StreamError::Config(format!(
            "server uri `{uri}` is not of the form [tcp://]host:port"
        ))),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn accepts_bare_and_tcp_uris() {
        // ---
        assert_eq!(parse_server_uri("127.0.0.1:8765").unwrap(), "127.0.0.1:8765");
        assert_eq!(
            parse_server_uri("tcp://example.org:9000/").unwrap(),
            "example.org:9000"
        );
    }

    #[test]
    fn rejects_foreign_schemes_and_missing_ports() {
        // ---
        assert!(parse_server_uri("ws://127.0.0.1:8765").is_err());
        assert!(parse_server_uri("localhost").is_err());
        assert!(parse_server_uri("localhost:http").is_err());
    }
}
