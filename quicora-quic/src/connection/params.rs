//! Typed parameter surface: set/get dispatch with per-parameter
//! preconditions, the statistics snapshot, and resumption-state
//! serialization.
//!
//! Sets arrive through the operation queue (`ApiCall::SetParameter`);
//! gets are synchronous reads with a probe-then-fill buffer contract.

use std::net::SocketAddr;
use std::sync::Arc;

use core::time::Duration;

use tracing::{debug, info};

use crate::binding::BindingTable;
use crate::crypto::{EncryptionLevel, KeyType};
use crate::error::Status;
use crate::transport::parameters::ResumptionState;
use crate::types::{Instant, MAX_CLOSE_REASON_LENGTH, MAX_DISCONNECT_TIMEOUT_MS};

use super::send::{SEND_FLAG_MAX_STREAMS_BIDI, SEND_FLAG_MAX_STREAMS_UNI, SEND_FLAG_PING,
    SEND_FLAG_RETIRE_CONNECTION_ID};
use super::timer::TimerType;
use super::{Connection, Lifecycle, Operation};

/// Settable parameters with their payloads.
#[derive(Debug)]
pub enum Parameter {
    QuicVersion(u32),
    /// Move to a new local address. The caller resolves the address to
    /// its UDP binding and hands it over; the connection migrates its
    /// CID registrations onto it.
    LocalAddress { address: SocketAddr, binding: Arc<BindingTable> },
    RemoteAddress(SocketAddr),
    IdleTimeoutMs(u64),
    PeerBidiStreamCount(u16),
    PeerUnidiStreamCount(u16),
    CloseReasonPhrase(String),
    CertValidationFlags(u32),
    KeepAliveIntervalMs(u64),
    DisconnectTimeoutMs(u64),
    /// Server security configuration became available; completes the
    /// handshake configuration and lets TLS run.
    SecConfig,
    SendBuffering(bool),
    SendPacing(bool),
    ShareUdpBinding(bool),
    ForceKeyUpdate,
    ForceCidUpdate,
}

/// Readable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterQuery {
    QuicVersion,
    LocalAddress,
    RemoteAddress,
    IdleTimeoutMs,
    CloseReasonPhrase,
    /// Counter snapshot with internal microsecond timestamps.
    Statistics,
    /// Counter snapshot with timestamps in platform milliseconds.
    StatisticsPlat,
    /// Client-only serialized resumption blob.
    ResumptionState,
}

impl Connection {
    /// Apply a queued parameter update. Runs on the drain thread.
    pub(crate) fn apply_parameter(
        &mut self,
        parameter: Parameter,
        now: Instant,
    ) -> Result<(), Status> {
        match parameter {
            Parameter::QuicVersion(version) => {
                if self.lifecycle >= Lifecycle::Started {
                    return Err(Status::InvalidState);
                }
                if !crate::version::is_supported(version) && !crate::version::is_reserved(version) {
                    return Err(Status::InvalidParameter);
                }
                self.version = version;
                self.stats.quic_version = version;
                Ok(())
            }

            Parameter::LocalAddress { address, binding } => {
                if self.side.is_server() {
                    return Err(Status::InvalidState);
                }
                self.local_address = Some(address);
                if !Arc::ptr_eq(&self.binding, &binding) {
                    // Migrate every CID registration onto the new
                    // path's binding, then adopt it.
                    self.binding.move_source_cids(&binding, self.correlation_id);
                    self.binding.remove_connection(self.correlation_id);
                    binding.on_connection_attached();
                    self.binding = binding;
                    if self.lifecycle >= Lifecycle::Connected {
                        // Probe the new path.
                        self.send.set_flag(SEND_FLAG_PING);
                        self.queue_operation(Operation::FlushSend);
                    }
                }
                Ok(())
            }

            Parameter::RemoteAddress(address) => {
                if self.side.is_server() || self.lifecycle >= Lifecycle::Started {
                    return Err(Status::InvalidState);
                }
                self.remote_address = Some(address);
                Ok(())
            }

            Parameter::IdleTimeoutMs(timeout) => {
                if self.lifecycle >= Lifecycle::Started {
                    return Err(Status::InvalidState);
                }
                self.config.idle_timeout_ms = timeout;
                Ok(())
            }

            Parameter::PeerBidiStreamCount(count) => {
                self.streams.set_max_remote_streams(false, count as u64);
                self.config.peer_bidi_stream_count = count;
                if self.lifecycle >= Lifecycle::Connected {
                    self.send.set_flag(SEND_FLAG_MAX_STREAMS_BIDI);
                    self.queue_operation(Operation::FlushSend);
                }
                Ok(())
            }

            Parameter::PeerUnidiStreamCount(count) => {
                self.streams.set_max_remote_streams(true, count as u64);
                self.config.peer_unidi_stream_count = count;
                if self.lifecycle >= Lifecycle::Connected {
                    self.send.set_flag(SEND_FLAG_MAX_STREAMS_UNI);
                    self.queue_operation(Operation::FlushSend);
                }
                Ok(())
            }

            Parameter::CloseReasonPhrase(reason) => {
                if reason.len() >= MAX_CLOSE_REASON_LENGTH {
                    return Err(Status::InvalidParameter);
                }
                self.close_reason = Some(reason);
                Ok(())
            }

            Parameter::CertValidationFlags(flags) => {
                if self.side.is_server() || self.lifecycle >= Lifecycle::Started {
                    return Err(Status::InvalidState);
                }
                self.config.cert_validation_flags = flags;
                Ok(())
            }

            Parameter::KeepAliveIntervalMs(interval) => {
                if self.is_closed() {
                    return Err(Status::InvalidState);
                }
                self.config.keep_alive_interval_ms = interval;
                if interval == 0 {
                    self.cancel_timer(TimerType::KeepAlive);
                } else {
                    self.set_timer(TimerType::KeepAlive, Duration::from_millis(interval), now);
                }
                Ok(())
            }

            Parameter::DisconnectTimeoutMs(timeout) => {
                if timeout == 0 || timeout > MAX_DISCONNECT_TIMEOUT_MS {
                    return Err(Status::InvalidParameter);
                }
                self.config.disconnect_timeout_ms = timeout;
                Ok(())
            }

            Parameter::SecConfig => self.apply_sec_config(now),

            Parameter::SendBuffering(enabled) => {
                if self.lifecycle >= Lifecycle::Started {
                    return Err(Status::InvalidState);
                }
                self.flags.use_send_buffer = enabled;
                self.config.use_send_buffering = enabled;
                Ok(())
            }

            Parameter::SendPacing(enabled) => {
                self.flags.use_pacing = enabled;
                self.config.use_pacing = enabled;
                Ok(())
            }

            Parameter::ShareUdpBinding(enabled) => {
                if self.lifecycle >= Lifecycle::Started {
                    return Err(Status::InvalidState);
                }
                self.flags.share_binding = enabled;
                self.config.share_binding = enabled;
                Ok(())
            }

            Parameter::ForceKeyUpdate => self.force_key_update(),

            Parameter::ForceCidUpdate => self.force_cid_update(),
        }
    }

    /// Server security configuration arrived: finish the handshake
    /// configuration and drive any buffered TLS data.
    fn apply_sec_config(&mut self, now: Instant) -> Result<(), Status> {
        if self.side.is_client() || self.flags.tls_configured {
            return Err(Status::InvalidState);
        }
        let local_tp = self.build_local_transport_parameters().encode();
        self.crypto.configure_server(&local_tp)?;
        self.flags.tls_configured = true;
        if self.lifecycle < Lifecycle::Started {
            self.lifecycle = Lifecycle::Started;
            self.stats.timing_start = now.as_micros();
            self.binding.on_handshake_started();
        }
        info!(correlation_id = self.correlation_id, "security configuration installed");
        self.process_crypto_events(now);
        self.reset_idle_timeout(now);
        Ok(())
    }

    fn force_key_update(&mut self) -> Result<(), Status> {
        if self.lifecycle < Lifecycle::HandshakeConfirmed
            || self.crypto.awaiting_key_phase_confirmation
            || self.crypto.read_key(KeyType::OneRtt).is_none()
        {
            return Err(Status::InvalidState);
        }
        self.crypto.prepare_key_update()?;
        self.crypto.update_key_phase(true);
        let space = self.spaces[EncryptionLevel::OneRtt as usize]
            .as_mut()
            .ok_or(Status::InvalidState)?;
        space.current_key_phase = !space.current_key_phase;
        space.write_key_phase_start = Some(space.next_send_packet_number);
        self.stats.key_update_count += 1;
        debug!(correlation_id = self.correlation_id, "local key update initiated");
        Ok(())
    }

    fn force_cid_update(&mut self) -> Result<(), Status> {
        if self.lifecycle < Lifecycle::HandshakeConfirmed {
            return Err(Status::InvalidState);
        }
        if !self.cids.retire_current_dest() {
            // No spare CID from the peer to rotate onto.
            return Err(Status::InvalidState);
        }
        self.flags.initiated_cid_update = true;
        self.stats.dest_cid_update_count += 1;
        self.send.set_flag(SEND_FLAG_RETIRE_CONNECTION_ID);
        self.queue_operation(Operation::FlushSend);
        Ok(())
    }

    /// Read a parameter with the probe-then-fill contract: `None` probes
    /// the required size, a short buffer reports it, otherwise the value
    /// is copied and its length returned.
    pub fn get_parameter(
        &self,
        query: ParameterQuery,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let data = match query {
            ParameterQuery::QuicVersion => self.version.to_be_bytes().to_vec(),
            ParameterQuery::LocalAddress => {
                let address = self.local_address.ok_or(Status::InvalidState)?;
                address.to_string().into_bytes()
            }
            ParameterQuery::RemoteAddress => {
                let address = self.remote_address.ok_or(Status::InvalidState)?;
                address.to_string().into_bytes()
            }
            ParameterQuery::IdleTimeoutMs => self.config.idle_timeout_ms.to_le_bytes().to_vec(),
            ParameterQuery::CloseReasonPhrase => {
                let reason = self.close_reason.as_ref().ok_or(Status::InvalidState)?;
                let mut bytes = reason.clone().into_bytes();
                bytes.push(0);
                bytes
            }
            ParameterQuery::Statistics => serialize_statistics(&self.statistics(), false),
            ParameterQuery::StatisticsPlat => serialize_statistics(&self.statistics(), true),
            ParameterQuery::ResumptionState => self.serialize_resumption_state()?,
        };

        match buf {
            None => Ok(data.len()),
            Some(buf) if buf.len() < data.len() => Err(Status::BufferTooSmall(data.len())),
            Some(buf) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
        }
    }

    /// `version | peer-TPs | name-length | name | ticket` (client only,
    /// requires a resolved server name and a TLS-issued ticket).
    fn serialize_resumption_state(&self) -> Result<Vec<u8>, Status> {
        if self.side.is_server() {
            return Err(Status::InvalidState);
        }
        let server_name = self.server_name.clone().ok_or(Status::InvalidState)?;
        let transport_parameters =
            self.peer_transport_params.clone().ok_or(Status::InvalidState)?;
        let ticket = self.crypto.ticket().ok_or(Status::InvalidState)?.to_vec();
        Ok(ResumptionState { version: self.version, transport_parameters, server_name, ticket }
            .encode())
    }
}

/// Fixed little-endian u64 layout; `plat` converts the internal
/// microsecond timestamps to platform milliseconds.
fn serialize_statistics(stats: &super::Statistics, plat: bool) -> Vec<u8> {
    let time = |us: u64| if plat { us / 1_000 } else { us };
    let fields = [
        stats.correlation_id,
        stats.quic_version as u64,
        time(stats.timing_start),
        time(stats.timing_connected),
        stats.smoothed_rtt_us,
        stats.min_rtt_us,
        stats.max_rtt_us,
        stats.send.total_packets,
        stats.send.total_bytes,
        stats.recv.total_packets,
        stats.recv.total_bytes,
        stats.recv.valid_packets,
        stats.recv.dropped_packets,
        stats.recv.duplicate_packets,
        stats.recv.decryption_failures,
        stats.key_update_count,
        stats.dest_cid_update_count,
        stats.operation_count,
        stats.drain_count,
    ];
    let mut out = Vec::with_capacity(fields.len() * 8);
    for field in fields {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out
}
