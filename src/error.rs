// ABOUTME: Error types returned from every public, fallible operation on this crate
// ABOUTME: Protocol violations detected internally collapse into a plain closed/IO error here

use thiserror::Error;

use crate::apdu::CodecError;

/// The error type returned from `connect`, `Listener::bind`/`accept`,
/// `Connection::send`/`drain`/`receive`, and anywhere else this crate's
/// public API can fail.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is closed (or closed while the call was in flight).
    #[error("connection closed")]
    Closed,

    /// Underlying socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),

    /// An inbound I-frame's send sequence number did not match what was
    /// expected; fatal to the connection.
    #[error("sequence number gap: expected {expected}, got {actual}")]
    SequenceGap { expected: u16, actual: u16 },

    /// The peer acknowledged a sequence number that was never sent.
    #[error("peer acknowledged unsent sequence number {ssn}")]
    AckForUnsent { ssn: u16 },

    /// `connect()` did not see `STARTDT_CON` within `response_timeout`.
    #[error("handshake timed out waiting for STARTDT_CON")]
    HandshakeTimeout,

    /// `ConnectionConfig::validate()` rejected the configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors in a `ConnectionConfig`.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
    #[error("supervisory_timeout must be less than response_timeout")]
    SupervisoryNotLessThanResponse,

    #[error("send_window_size must be in 1..0x8000, got {0}")]
    InvalidSendWindow(u16),

    #[error("receive_window_size must be nonzero, got {0}")]
    InvalidReceiveWindow(u16),
}
