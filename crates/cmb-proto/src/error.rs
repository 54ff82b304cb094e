//! Error types for the protocol engine.

use thiserror::Error;

/// Errors raised while decoding a frame into a packet.
///
/// Frames failing these checks are dropped by callers; none of them is
/// fatal to a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The 16-bit magic does not name a known packet kind.
    #[error("unknown packet magic {0:#06x}")]
    UnknownMagic(u16),

    /// The frame ended before the fixed layout was satisfied.
    #[error("truncated frame: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The frame carries bytes beyond its fixed layout.
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    /// A block range with `start > end`.
    #[error("inconsistent block range [{start}, {end})")]
    InvalidRange { start: u64, end: u64 },

    /// An error packet carrying an unassigned code.
    #[error("unknown error code {0}")]
    UnknownErrorCode(u16),
}

/// Protocol engine error type.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A resource id string that is not 32 or 48 hex characters.
    #[error("invalid resource id: {0}")]
    InvalidResourceId(String),

    /// The peer reported that it does not hold the requested resource.
    #[error("resource not found on sender")]
    ResourceNotFound,

    /// No Data packet arrived within the handshake backoff schedule.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The connection went silent mid-transfer.
    #[error("connection inactive")]
    Inactivity,
}

/// Result type for protocol engine operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
