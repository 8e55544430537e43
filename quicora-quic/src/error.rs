//! Error types: wire-level transport error codes and internal statuses.

use thiserror::Error;

/// QUIC transport error codes carried in CONNECTION_CLOSE frames
/// (draft-23 Section 20).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No error (0x00).
    #[error("no error")]
    NoError,

    /// Internal error (0x01).
    #[error("internal error")]
    InternalError,

    /// Server busy (0x02).
    #[error("server busy")]
    ServerBusy,

    /// Flow control error (0x03).
    #[error("flow control error")]
    FlowControlError,

    /// Stream limit error (0x04).
    #[error("stream limit error")]
    StreamLimitError,

    /// Stream state error (0x05).
    #[error("stream state error")]
    StreamStateError,

    /// Final size error (0x06).
    #[error("final size error")]
    FinalSizeError,

    /// Frame encoding error (0x07).
    #[error("frame encoding error")]
    FrameEncodingError,

    /// Transport parameter error (0x08).
    #[error("transport parameter error")]
    TransportParameterError,

    /// Protocol violation (0x0A).
    #[error("protocol violation")]
    ProtocolViolation,

    /// Version negotiation error (0x0D).
    #[error("version negotiation error")]
    VersionNegotiationError,

    /// TLS alert propagated as a crypto error (0x0100-0x01FF).
    #[error("crypto error: {0:#x}")]
    Crypto(u8),
}

impl TransportError {
    /// Convert to the wire-format error code.
    pub fn to_wire(self) -> u64 {
        match self {
            TransportError::NoError => 0x00,
            TransportError::InternalError => 0x01,
            TransportError::ServerBusy => 0x02,
            TransportError::FlowControlError => 0x03,
            TransportError::StreamLimitError => 0x04,
            TransportError::StreamStateError => 0x05,
            TransportError::FinalSizeError => 0x06,
            TransportError::FrameEncodingError => 0x07,
            TransportError::TransportParameterError => 0x08,
            TransportError::ProtocolViolation => 0x0A,
            TransportError::VersionNegotiationError => 0x0D,
            TransportError::Crypto(alert) => 0x0100 + alert as u64,
        }
    }

    /// Convert a wire-format error code back to a known code.
    ///
    /// Unknown codes collapse to `InternalError`, matching the status
    /// mapping applied when surfacing remote closes to the application.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportError::NoError,
            0x01 => TransportError::InternalError,
            0x02 => TransportError::ServerBusy,
            0x03 => TransportError::FlowControlError,
            0x04 => TransportError::StreamLimitError,
            0x05 => TransportError::StreamStateError,
            0x06 => TransportError::FinalSizeError,
            0x07 => TransportError::FrameEncodingError,
            0x08 => TransportError::TransportParameterError,
            0x0A => TransportError::ProtocolViolation,
            0x0D => TransportError::VersionNegotiationError,
            0x0100..=0x01FF => TransportError::Crypto((code - 0x0100) as u8),
            _ => TransportError::InternalError,
        }
    }
}

/// Internal status codes surfaced through the API and shutdown events.
///
/// `Ok(())` stands in for the success status; every fallible entry point
/// returns `Result<_, Status>`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// An allocation or bounded-queue admission failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A caller-supplied argument was rejected.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The operation is not legal in the connection's current state.
    #[error("invalid state")]
    InvalidState,

    /// The supplied buffer is too small; carries the required length.
    #[error("buffer too small ({0} bytes required)")]
    BufferTooSmall(usize),

    /// The connection was aborted (e.g. by a stateless reset).
    #[error("aborted")]
    Aborted,

    /// The peer was unreachable during the handshake.
    #[error("unreachable")]
    Unreachable,

    /// The connection idle timeout elapsed.
    #[error("connection idle")]
    ConnectionIdle,

    /// The peer demanded a version we do not support.
    #[error("version negotiation error")]
    VersionNegotiationError,

    /// The peer is too busy to accept the connection.
    #[error("server busy")]
    ServerBusy,

    /// The peer committed a protocol violation.
    #[error("protocol error")]
    ProtocolError,

    /// An unrecoverable internal failure.
    #[error("internal error")]
    InternalError,
}

impl Status {
    /// Map a wire error code received from the peer to the status
    /// reported in `ShutdownInitiatedByTransport`.
    pub fn from_error_code(code: u64) -> Result<(), Status> {
        match TransportError::from_wire(code) {
            TransportError::NoError => Ok(()),
            TransportError::ServerBusy => Err(Status::ServerBusy),
            TransportError::ProtocolViolation => Err(Status::ProtocolError),
            _ => Err(Status::InternalError),
        }
    }
}
