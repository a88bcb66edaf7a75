//! Error types.
//!
//! None of these are fatal: decode and protocol faults drop the offending
//! message, transport faults trigger a reconnect.

use thiserror::Error;

/// Chunk payload could not be decoded.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("payload length {actual} does not match expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unknown chunk encoding '{0}'")]
    UnknownEncoding(String),
}

/// Inbound frame could not be turned into an [`crate::protocol::ObserverMsg`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has no string `type` field")]
    MissingType,

    #[error("unrecognised message type '{0}'")]
    UnknownType(String),
}

/// Connection open/send/receive failure.
#[cfg(feature = "client")]
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("connection closed")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0}")]
    Other(String),
}

/// Umbrella error for callers that want a single type.
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[cfg(feature = "client")]
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
}
