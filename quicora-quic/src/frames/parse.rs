//! Frame decoding and encoding (draft-23 Section 19).

use tinyvec::TinyVec;

use crate::error::TransportError;
use crate::frames::types::*;
use crate::types::{decode_varint, put_varint, ConnectionId, StatelessResetToken, VarInt};

/// Iterator-style parser over a decrypted packet payload.
pub struct FrameParser<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> FrameParser<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { buf: payload, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn read_varint(&mut self) -> Result<VarInt, TransportError> {
        let (value, consumed) = decode_varint(&self.buf[self.offset..])
            .ok_or(TransportError::FrameEncodingError)?;
        self.offset += consumed;
        Ok(value)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], TransportError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(TransportError::FrameEncodingError)?;
        let slice = &self.buf[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Parse the next frame, or `None` at end of payload.
    pub fn next_frame(&mut self) -> Option<Result<Frame<'a>, TransportError>> {
        if self.offset >= self.buf.len() {
            return None;
        }
        Some(self.parse_one())
    }

    fn parse_one(&mut self) -> Result<Frame<'a>, TransportError> {
        let frame_type = self.read_varint()?;
        match frame_type {
            FRAME_TYPE_PADDING => {
                let mut count = 1;
                while self.offset < self.buf.len() && self.buf[self.offset] == 0 {
                    self.offset += 1;
                    count += 1;
                }
                Ok(Frame::Padding { count })
            }
            FRAME_TYPE_PING => Ok(Frame::Ping),
            FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => self.parse_ack(frame_type == FRAME_TYPE_ACK_ECN),
            FRAME_TYPE_RESET_STREAM => Ok(Frame::ResetStream {
                stream_id: self.read_varint()?,
                error_code: self.read_varint()?,
                final_size: self.read_varint()?,
            }),
            FRAME_TYPE_STOP_SENDING => Ok(Frame::StopSending {
                stream_id: self.read_varint()?,
                error_code: self.read_varint()?,
            }),
            FRAME_TYPE_CRYPTO => {
                let offset = self.read_varint()?;
                let len = self.read_varint()?;
                let data = self.read_bytes(len as usize)?;
                Ok(Frame::Crypto { offset, data })
            }
            FRAME_TYPE_NEW_TOKEN => {
                let len = self.read_varint()?;
                if len == 0 {
                    return Err(TransportError::FrameEncodingError);
                }
                Ok(Frame::NewToken { token: self.read_bytes(len as usize)? })
            }
            FRAME_TYPE_STREAM_BASE..=0x0f => self.parse_stream(frame_type),
            FRAME_TYPE_MAX_DATA => Ok(Frame::MaxData { maximum: self.read_varint()? }),
            FRAME_TYPE_MAX_STREAM_DATA => Ok(Frame::MaxStreamData {
                stream_id: self.read_varint()?,
                maximum: self.read_varint()?,
            }),
            FRAME_TYPE_MAX_STREAMS_BIDI | FRAME_TYPE_MAX_STREAMS_UNI => Ok(Frame::MaxStreams {
                unidirectional: frame_type == FRAME_TYPE_MAX_STREAMS_UNI,
                maximum: self.read_varint()?,
            }),
            FRAME_TYPE_DATA_BLOCKED => Ok(Frame::DataBlocked { limit: self.read_varint()? }),
            FRAME_TYPE_STREAM_DATA_BLOCKED => Ok(Frame::StreamDataBlocked {
                stream_id: self.read_varint()?,
                limit: self.read_varint()?,
            }),
            FRAME_TYPE_STREAMS_BLOCKED_BIDI | FRAME_TYPE_STREAMS_BLOCKED_UNI => {
                Ok(Frame::StreamsBlocked {
                    unidirectional: frame_type == FRAME_TYPE_STREAMS_BLOCKED_UNI,
                    limit: self.read_varint()?,
                })
            }
            FRAME_TYPE_NEW_CONNECTION_ID => {
                let sequence = self.read_varint()?;
                let cid_len = self.read_u8()? as usize;
                if cid_len == 0 || cid_len > crate::types::MAX_CID_LENGTH {
                    return Err(TransportError::FrameEncodingError);
                }
                let cid = ConnectionId::from_slice(self.read_bytes(cid_len)?)
                    .ok_or(TransportError::FrameEncodingError)?;
                let mut reset_token: StatelessResetToken = Default::default();
                reset_token.copy_from_slice(self.read_bytes(16)?);
                Ok(Frame::NewConnectionId(NewConnectionIdFrame { sequence, cid, reset_token }))
            }
            FRAME_TYPE_RETIRE_CONNECTION_ID => {
                Ok(Frame::RetireConnectionId { sequence: self.read_varint()? })
            }
            FRAME_TYPE_PATH_CHALLENGE | FRAME_TYPE_PATH_RESPONSE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(self.read_bytes(8)?);
                if frame_type == FRAME_TYPE_PATH_CHALLENGE {
                    Ok(Frame::PathChallenge { data })
                } else {
                    Ok(Frame::PathResponse { data })
                }
            }
            FRAME_TYPE_CONNECTION_CLOSE | FRAME_TYPE_CONNECTION_CLOSE_APP => {
                let application = frame_type == FRAME_TYPE_CONNECTION_CLOSE_APP;
                let error_code = self.read_varint()?;
                let offending_type = if application { None } else { Some(self.read_varint()?) };
                let reason_len = self.read_varint()?;
                let reason = self.read_bytes(reason_len as usize)?;
                Ok(Frame::ConnectionClose {
                    application,
                    frame: ConnectionCloseFrame { error_code, frame_type: offending_type, reason },
                })
            }
            FRAME_TYPE_HANDSHAKE_DONE => Ok(Frame::HandshakeDone),
            _ => Err(TransportError::FrameEncodingError),
        }
    }

    fn parse_ack(&mut self, ecn: bool) -> Result<Frame<'a>, TransportError> {
        let largest_acked = self.read_varint()?;
        let ack_delay = self.read_varint()?;
        let range_count = self.read_varint()?;
        let first_ack_range = self.read_varint()?;
        let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::default();
        for _ in 0..range_count {
            ranges.push(AckRange { gap: self.read_varint()?, length: self.read_varint()? });
        }
        let ecn = if ecn {
            Some(EcnCounts {
                ect0: self.read_varint()?,
                ect1: self.read_varint()?,
                ce: self.read_varint()?,
            })
        } else {
            None
        };
        Ok(Frame::Ack(AckFrame { largest_acked, ack_delay, first_ack_range, ranges, ecn }))
    }

    fn parse_stream(&mut self, frame_type: u64) -> Result<Frame<'a>, TransportError> {
        let stream_id = self.read_varint()?;
        let offset = if frame_type & STREAM_BIT_OFF != 0 { self.read_varint()? } else { 0 };
        let data = if frame_type & STREAM_BIT_LEN != 0 {
            let len = self.read_varint()?;
            self.read_bytes(len as usize)?
        } else {
            let rest = &self.buf[self.offset..];
            self.offset = self.buf.len();
            rest
        };
        Ok(Frame::Stream { stream_id, offset, fin: frame_type & STREAM_BIT_FIN != 0, data })
    }
}

// ============================================================================
// Encoders for the frames this endpoint emits
// ============================================================================

pub fn encode_padding(out: &mut Vec<u8>, count: usize) {
    out.resize(out.len() + count, 0);
}

pub fn encode_ping(out: &mut Vec<u8>) {
    put_varint(FRAME_TYPE_PING, out);
}

/// Encode an ACK frame from absolute inclusive ranges, ascending order
/// as stored by the ack tracker.
pub fn encode_ack(out: &mut Vec<u8>, ranges: &[(u64, u64)], ack_delay: u64) {
    debug_assert!(!ranges.is_empty());
    let &(first_low, largest) = ranges.last().unwrap();
    put_varint(FRAME_TYPE_ACK, out);
    put_varint(largest, out);
    put_varint(ack_delay, out);
    put_varint(ranges.len() as u64 - 1, out);
    put_varint(largest - first_low, out);
    let mut prev_low = first_low;
    for &(low, high) in ranges.iter().rev().skip(1) {
        put_varint(prev_low - high - 2, out);
        put_varint(high - low, out);
        prev_low = low;
    }
}

pub fn encode_crypto(out: &mut Vec<u8>, offset: u64, data: &[u8]) {
    put_varint(FRAME_TYPE_CRYPTO, out);
    put_varint(offset, out);
    put_varint(data.len() as u64, out);
    out.extend_from_slice(data);
}

pub fn encode_max_data(out: &mut Vec<u8>, maximum: u64) {
    put_varint(FRAME_TYPE_MAX_DATA, out);
    put_varint(maximum, out);
}

pub fn encode_max_streams(out: &mut Vec<u8>, unidirectional: bool, maximum: u64) {
    put_varint(
        if unidirectional { FRAME_TYPE_MAX_STREAMS_UNI } else { FRAME_TYPE_MAX_STREAMS_BIDI },
        out,
    );
    put_varint(maximum, out);
}

pub fn encode_new_connection_id(
    out: &mut Vec<u8>,
    sequence: u64,
    cid: &ConnectionId,
    reset_token: &StatelessResetToken,
) {
    put_varint(FRAME_TYPE_NEW_CONNECTION_ID, out);
    put_varint(sequence, out);
    out.push(cid.len() as u8);
    out.extend_from_slice(cid.as_bytes());
    out.extend_from_slice(reset_token);
}

pub fn encode_retire_connection_id(out: &mut Vec<u8>, sequence: u64) {
    put_varint(FRAME_TYPE_RETIRE_CONNECTION_ID, out);
    put_varint(sequence, out);
}

pub fn encode_path_response(out: &mut Vec<u8>, data: &[u8; 8]) {
    put_varint(FRAME_TYPE_PATH_RESPONSE, out);
    out.extend_from_slice(data);
}

pub fn encode_connection_close(
    out: &mut Vec<u8>,
    application: bool,
    error_code: u64,
    reason: &[u8],
) {
    if application {
        put_varint(FRAME_TYPE_CONNECTION_CLOSE_APP, out);
        put_varint(error_code, out);
    } else {
        put_varint(FRAME_TYPE_CONNECTION_CLOSE, out);
        put_varint(error_code, out);
        put_varint(0, out); // offending frame type: unknown
    }
    put_varint(reason.len() as u64, out);
    out.extend_from_slice(reason);
}

pub fn encode_handshake_done(out: &mut Vec<u8>) {
    put_varint(FRAME_TYPE_HANDSHAKE_DONE, out);
}
