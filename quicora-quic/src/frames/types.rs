//! QUIC frame types (draft-23 Section 19).
//!
//! Frame parsing is zero-copy: data-bearing frames borrow from the
//! decrypted packet payload.

use tinyvec::TinyVec;

use crate::crypto::EncryptionLevel;
use crate::types::{PacketNumber, VarInt};

// Frame type constants. 0x1e (HANDSHAKE_DONE) is the maximum.
pub const FRAME_TYPE_PADDING: u64 = 0x00;
pub const FRAME_TYPE_PING: u64 = 0x01;
pub const FRAME_TYPE_ACK: u64 = 0x02;
pub const FRAME_TYPE_ACK_ECN: u64 = 0x03;
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u64 = 0x05;
pub const FRAME_TYPE_CRYPTO: u64 = 0x06;
pub const FRAME_TYPE_NEW_TOKEN: u64 = 0x07;
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08; // 0x08-0x0f
pub const FRAME_TYPE_MAX_DATA: u64 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
pub const FRAME_TYPE_MAX_STREAMS_UNI: u64 = 0x13;
pub const FRAME_TYPE_DATA_BLOCKED: u64 = 0x14;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const FRAME_TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u64 = 0x18;
pub const FRAME_TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const FRAME_TYPE_PATH_CHALLENGE: u64 = 0x1a;
pub const FRAME_TYPE_PATH_RESPONSE: u64 = 0x1b;
pub const FRAME_TYPE_CONNECTION_CLOSE: u64 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: u64 = 0x1e;

/// Largest defined frame type.
pub const FRAME_TYPE_MAX: u64 = FRAME_TYPE_HANDSHAKE_DONE;

// STREAM type bits (0x08-0x0f).
pub const STREAM_BIT_FIN: u64 = 0x01;
pub const STREAM_BIT_LEN: u64 = 0x02;
pub const STREAM_BIT_OFF: u64 = 0x04;

/// One gap/length pair in an ACK frame (draft-23 Section 19.3.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckRange {
    pub gap: VarInt,
    pub length: VarInt,
}

/// ECN counts reported by ACK_ECN frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: VarInt,
    pub ect1: VarInt,
    pub ce: VarInt,
}

/// ACK frame (draft-23 Section 19.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acked: PacketNumber,
    /// Raw wire value; scale by the peer's ack-delay exponent.
    pub ack_delay: VarInt,
    pub first_ack_range: VarInt,
    pub ranges: TinyVec<[AckRange; 8]>,
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Expand the wire encoding into absolute inclusive `(low, high)`
    /// ranges, descending. `None` on arithmetic underflow, which the
    /// caller treats as a frame encoding error.
    pub fn decode_ranges(&self) -> Option<Vec<(PacketNumber, PacketNumber)>> {
        let mut decoded = Vec::with_capacity(1 + self.ranges.len());
        let mut high = self.largest_acked;
        let mut low = high.checked_sub(self.first_ack_range)?;
        decoded.push((low, high));
        for range in &self.ranges {
            high = low.checked_sub(range.gap)?.checked_sub(2)?;
            low = high.checked_sub(range.length)?;
            decoded.push((low, high));
        }
        Some(decoded)
    }
}

/// NEW_CONNECTION_ID frame body (draft-23 Section 19.15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence: VarInt,
    pub cid: crate::types::ConnectionId,
    pub reset_token: crate::types::StatelessResetToken,
}

/// CONNECTION_CLOSE frame, transport (0x1c) or application (0x1d)
/// variant (draft-23 Section 19.19).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame<'a> {
    pub error_code: VarInt,
    /// Frame type that provoked the close; `None` for the app variant.
    pub frame_type: Option<VarInt>,
    pub reason: &'a [u8],
}

/// A parsed frame, borrowing data from the packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A run of padding bytes.
    Padding { count: usize },
    Ping,
    Ack(AckFrame),
    ResetStream { stream_id: VarInt, error_code: VarInt, final_size: VarInt },
    StopSending { stream_id: VarInt, error_code: VarInt },
    Crypto { offset: VarInt, data: &'a [u8] },
    NewToken { token: &'a [u8] },
    Stream { stream_id: VarInt, offset: VarInt, fin: bool, data: &'a [u8] },
    MaxData { maximum: VarInt },
    MaxStreamData { stream_id: VarInt, maximum: VarInt },
    MaxStreams { unidirectional: bool, maximum: VarInt },
    DataBlocked { limit: VarInt },
    StreamDataBlocked { stream_id: VarInt, limit: VarInt },
    StreamsBlocked { unidirectional: bool, limit: VarInt },
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId { sequence: VarInt },
    PathChallenge { data: [u8; 8] },
    PathResponse { data: [u8; 8] },
    ConnectionClose { application: bool, frame: ConnectionCloseFrame<'a> },
    HandshakeDone,
}

impl Frame<'_> {
    /// The wire type this frame parsed from (STREAM collapses to its base).
    pub fn frame_type(&self) -> u64 {
        match self {
            Frame::Padding { .. } => FRAME_TYPE_PADDING,
            Frame::Ping => FRAME_TYPE_PING,
            Frame::Ack(frame) if frame.ecn.is_some() => FRAME_TYPE_ACK_ECN,
            Frame::Ack(_) => FRAME_TYPE_ACK,
            Frame::ResetStream { .. } => FRAME_TYPE_RESET_STREAM,
            Frame::StopSending { .. } => FRAME_TYPE_STOP_SENDING,
            Frame::Crypto { .. } => FRAME_TYPE_CRYPTO,
            Frame::NewToken { .. } => FRAME_TYPE_NEW_TOKEN,
            Frame::Stream { .. } => FRAME_TYPE_STREAM_BASE,
            Frame::MaxData { .. } => FRAME_TYPE_MAX_DATA,
            Frame::MaxStreamData { .. } => FRAME_TYPE_MAX_STREAM_DATA,
            Frame::MaxStreams { unidirectional: false, .. } => FRAME_TYPE_MAX_STREAMS_BIDI,
            Frame::MaxStreams { unidirectional: true, .. } => FRAME_TYPE_MAX_STREAMS_UNI,
            Frame::DataBlocked { .. } => FRAME_TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => FRAME_TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked { unidirectional: false, .. } => FRAME_TYPE_STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlocked { unidirectional: true, .. } => FRAME_TYPE_STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId(_) => FRAME_TYPE_NEW_CONNECTION_ID,
            Frame::RetireConnectionId { .. } => FRAME_TYPE_RETIRE_CONNECTION_ID,
            Frame::PathChallenge { .. } => FRAME_TYPE_PATH_CHALLENGE,
            Frame::PathResponse { .. } => FRAME_TYPE_PATH_RESPONSE,
            Frame::ConnectionClose { application: false, .. } => FRAME_TYPE_CONNECTION_CLOSE,
            Frame::ConnectionClose { application: true, .. } => FRAME_TYPE_CONNECTION_CLOSE_APP,
            Frame::HandshakeDone => FRAME_TYPE_HANDSHAKE_DONE,
        }
    }

    /// Whether this frame elicits an acknowledgement.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. } | Frame::Ack(_) | Frame::ConnectionClose { .. }
        )
    }
}

/// Whether `frame_type` may appear at `level`.
///
/// Initial and Handshake carry only PADDING, PING, ACK, CRYPTO, and the
/// transport CONNECTION_CLOSE. 0-RTT carries everything except ACK and
/// CONNECTION_CLOSE. 1-RTT carries all frames.
pub fn allowed_at_level(frame_type: u64, level: EncryptionLevel) -> bool {
    if frame_type > FRAME_TYPE_MAX {
        return false;
    }
    match level {
        EncryptionLevel::Initial | EncryptionLevel::Handshake => matches!(
            frame_type,
            FRAME_TYPE_PADDING
                | FRAME_TYPE_PING
                | FRAME_TYPE_ACK
                | FRAME_TYPE_ACK_ECN
                | FRAME_TYPE_CRYPTO
                | FRAME_TYPE_CONNECTION_CLOSE
        ),
        EncryptionLevel::ZeroRtt => !matches!(
            frame_type,
            FRAME_TYPE_ACK
                | FRAME_TYPE_ACK_ECN
                | FRAME_TYPE_CONNECTION_CLOSE
                | FRAME_TYPE_CONNECTION_CLOSE_APP
        ),
        EncryptionLevel::OneRtt => true,
    }
}
