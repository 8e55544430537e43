//! Transport parameter encoding, decoding, and validation
//! (draft-23 Section 18), plus the resumption-state blob layout.

use crate::error::{Status, TransportError};
use crate::types::{decode_varint, put_varint, varint_size, ConnectionId, StatelessResetToken};
use crate::version::QuicVersion;

// Parameter identifiers.
const PARAM_ORIGINAL_CONNECTION_ID: u64 = 0x00;
const PARAM_IDLE_TIMEOUT: u64 = 0x01;
const PARAM_STATELESS_RESET_TOKEN: u64 = 0x02;
const PARAM_MAX_PACKET_SIZE: u64 = 0x03;
const PARAM_INITIAL_MAX_DATA: u64 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const PARAM_ACK_DELAY_EXPONENT: u64 = 0x0a;
const PARAM_MAX_ACK_DELAY: u64 = 0x0b;
const PARAM_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;

/// Default ack-delay exponent when the parameter is absent.
pub const DEFAULT_ACK_DELAY_EXPONENT: u64 = 3;

/// Default max ack delay (milliseconds) when the parameter is absent.
pub const DEFAULT_MAX_ACK_DELAY_MS: u64 = 25;

/// A decoded transport parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    /// Echo of the pre-Retry destination CID (server only, post-Retry).
    pub original_connection_id: Option<ConnectionId>,
    /// Milliseconds; zero disables the peer-advertised idle timeout.
    pub idle_timeout_ms: u64,
    pub stateless_reset_token: Option<StatelessResetToken>,
    pub max_packet_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay_ms: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_connection_id: None,
            idle_timeout_ms: 0,
            stateless_reset_token: None,
            max_packet_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay_ms: DEFAULT_MAX_ACK_DELAY_MS,
            disable_active_migration: false,
            active_connection_id_limit: 0,
        }
    }
}

fn put_param_bytes(out: &mut Vec<u8>, id: u64, value: &[u8]) {
    put_varint(id, out);
    put_varint(value.len() as u64, out);
    out.extend_from_slice(value);
}

fn put_param_varint(out: &mut Vec<u8>, id: u64, value: u64) {
    put_varint(id, out);
    put_varint(varint_size(value).expect("parameter out of varint range") as u64, out);
    put_varint(value, out);
}

impl TransportParameters {
    /// Encode to the wire blob carried in the TLS handshake. Parameters
    /// matching their protocol default are omitted.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        if let Some(cid) = &self.original_connection_id {
            put_param_bytes(&mut out, PARAM_ORIGINAL_CONNECTION_ID, cid.as_bytes());
        }
        if self.idle_timeout_ms != 0 {
            put_param_varint(&mut out, PARAM_IDLE_TIMEOUT, self.idle_timeout_ms);
        }
        if let Some(token) = &self.stateless_reset_token {
            put_param_bytes(&mut out, PARAM_STATELESS_RESET_TOKEN, token);
        }
        if self.max_packet_size != 65527 {
            put_param_varint(&mut out, PARAM_MAX_PACKET_SIZE, self.max_packet_size);
        }
        if self.initial_max_data != 0 {
            put_param_varint(&mut out, PARAM_INITIAL_MAX_DATA, self.initial_max_data);
        }
        if self.initial_max_stream_data_bidi_local != 0 {
            put_param_varint(
                &mut out,
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                self.initial_max_stream_data_bidi_local,
            );
        }
        if self.initial_max_stream_data_bidi_remote != 0 {
            put_param_varint(
                &mut out,
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                self.initial_max_stream_data_bidi_remote,
            );
        }
        if self.initial_max_stream_data_uni != 0 {
            put_param_varint(
                &mut out,
                PARAM_INITIAL_MAX_STREAM_DATA_UNI,
                self.initial_max_stream_data_uni,
            );
        }
        if self.initial_max_streams_bidi != 0 {
            put_param_varint(&mut out, PARAM_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        }
        if self.initial_max_streams_uni != 0 {
            put_param_varint(&mut out, PARAM_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        }
        if self.ack_delay_exponent != DEFAULT_ACK_DELAY_EXPONENT {
            put_param_varint(&mut out, PARAM_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        }
        if self.max_ack_delay_ms != DEFAULT_MAX_ACK_DELAY_MS {
            put_param_varint(&mut out, PARAM_MAX_ACK_DELAY, self.max_ack_delay_ms);
        }
        if self.disable_active_migration {
            put_param_bytes(&mut out, PARAM_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if self.active_connection_id_limit != 0 {
            put_param_varint(
                &mut out,
                PARAM_ACTIVE_CONNECTION_ID_LIMIT,
                self.active_connection_id_limit,
            );
        }
        out
    }

    /// Decode a peer's parameter blob. Unknown parameters are skipped.
    pub fn decode(mut buf: &[u8]) -> Result<Self, TransportError> {
        let mut params = Self::default();
        let err = TransportError::TransportParameterError;

        while !buf.is_empty() {
            let (id, consumed) = decode_varint(buf).ok_or(err)?;
            buf = &buf[consumed..];
            let (len, consumed) = decode_varint(buf).ok_or(err)?;
            buf = &buf[consumed..];
            let len = len as usize;
            let value = buf.get(..len).ok_or(err)?;
            buf = &buf[len..];

            let varint_value = || -> Result<u64, TransportError> {
                let (v, consumed) = decode_varint(value).ok_or(err)?;
                if consumed != value.len() {
                    return Err(err);
                }
                Ok(v)
            };

            match id {
                PARAM_ORIGINAL_CONNECTION_ID => {
                    params.original_connection_id =
                        Some(ConnectionId::from_slice(value).ok_or(err)?);
                }
                PARAM_IDLE_TIMEOUT => params.idle_timeout_ms = varint_value()?,
                PARAM_STATELESS_RESET_TOKEN => {
                    let token: StatelessResetToken =
                        value.try_into().map_err(|_| err)?;
                    params.stateless_reset_token = Some(token);
                }
                PARAM_MAX_PACKET_SIZE => params.max_packet_size = varint_value()?,
                PARAM_INITIAL_MAX_DATA => params.initial_max_data = varint_value()?,
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = varint_value()?
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = varint_value()?
                }
                PARAM_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = varint_value()?
                }
                PARAM_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = varint_value()?
                }
                PARAM_INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = varint_value()?,
                PARAM_ACK_DELAY_EXPONENT => params.ack_delay_exponent = varint_value()?,
                PARAM_MAX_ACK_DELAY => params.max_ack_delay_ms = varint_value()?,
                PARAM_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(err);
                    }
                    params.disable_active_migration = true;
                }
                PARAM_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = varint_value()?
                }
                _ => {}
            }
        }

        params.validate()?;
        Ok(params)
    }

    /// Range checks from draft-23 Section 18.2.
    pub fn validate(&self) -> Result<(), TransportError> {
        let err = TransportError::TransportParameterError;
        if self.ack_delay_exponent > 20 {
            return Err(err);
        }
        if self.max_ack_delay_ms >= 1 << 14 {
            return Err(err);
        }
        if self.max_packet_size < 1200 || self.max_packet_size > 65527 {
            return Err(err);
        }
        Ok(())
    }
}

// ============================================================================
// Resumption state
// ============================================================================

/// Serialized client resumption state:
/// `version:u32 | tp_len:u16 | tp | name_len:u16 | name | ticket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionState {
    pub version: QuicVersion,
    pub transport_parameters: TransportParameters,
    pub server_name: String,
    pub ticket: Vec<u8>,
}

impl ResumptionState {
    pub fn encode(&self) -> Vec<u8> {
        let tp = self.transport_parameters.encode();
        let mut out = Vec::with_capacity(8 + tp.len() + self.server_name.len() + self.ticket.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(tp.len() as u16).to_be_bytes());
        out.extend_from_slice(&tp);
        out.extend_from_slice(&(self.server_name.len() as u16).to_be_bytes());
        out.extend_from_slice(self.server_name.as_bytes());
        out.extend_from_slice(&self.ticket);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Status> {
        let err = Status::InvalidParameter;
        if buf.len() < 6 {
            return Err(err);
        }
        let version = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let tp_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let mut offset = 6;
        let tp_bytes = buf.get(offset..offset + tp_len).ok_or(err)?;
        let transport_parameters = TransportParameters::decode(tp_bytes).map_err(|_| err)?;
        offset += tp_len;
        let name_len_bytes = buf.get(offset..offset + 2).ok_or(err)?;
        let name_len = u16::from_be_bytes([name_len_bytes[0], name_len_bytes[1]]) as usize;
        offset += 2;
        let name_bytes = buf.get(offset..offset + name_len).ok_or(err)?;
        let server_name = String::from_utf8(name_bytes.to_vec()).map_err(|_| err)?;
        offset += name_len;
        Ok(Self { version, transport_parameters, server_name, ticket: buf[offset..].to_vec() })
    }
}
