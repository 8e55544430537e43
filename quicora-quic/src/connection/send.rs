//! Outbound intent: send flags, the anti-amplification allowance, and
//! the flush-send operation that materializes flags into packets.
//!
//! Send flags accumulate monotonically within a drain; flush-send turns
//! them into at most one packet per invocation and reports whether more
//! remains, in which case the drain loop re-queues the operation.

use std::net::SocketAddr;

use tracing::trace;

use crate::crypto::{EncryptionLevel, KeyType, ENCRYPTION_OVERHEAD};
use crate::frames::parse as frame;
use crate::packet::{header, number, protection};
use crate::types::{Instant, MIN_INITIAL_PACKET_SIZE};

use super::Connection;

pub const SEND_FLAG_ACK: u32 = 1 << 0;
pub const SEND_FLAG_CRYPTO: u32 = 1 << 1;
pub const SEND_FLAG_CONNECTION_CLOSE: u32 = 1 << 2;
pub const SEND_FLAG_APPLICATION_CLOSE: u32 = 1 << 3;
pub const SEND_FLAG_PING: u32 = 1 << 4;
pub const SEND_FLAG_PATH_RESPONSE: u32 = 1 << 5;
pub const SEND_FLAG_NEW_CONNECTION_ID: u32 = 1 << 6;
pub const SEND_FLAG_RETIRE_CONNECTION_ID: u32 = 1 << 7;
pub const SEND_FLAG_MAX_DATA: u32 = 1 << 8;
pub const SEND_FLAG_MAX_STREAMS_BIDI: u32 = 1 << 9;
pub const SEND_FLAG_MAX_STREAMS_UNI: u32 = 1 << 10;
pub const SEND_FLAG_HANDSHAKE_DONE: u32 = 1 << 11;

/// A datagram ready for the datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub data: Vec<u8>,
    pub remote: SocketAddr,
}

/// Send-side connection state.
#[derive(Debug)]
pub struct Send {
    flags: u32,
    /// Anti-amplification allowance in bytes; `u64::MAX` once the
    /// source address is validated.
    allowance: u64,
    /// Retry token to echo in subsequent Initial packets.
    pub initial_token: Vec<u8>,
    /// Payload for a pending PATH_RESPONSE.
    pub path_response_data: [u8; 8],
    /// Connection flow-control limit advertised to the peer.
    pub local_max_data: u64,
    /// Peer's connection flow-control limit.
    pub peer_max_data: u64,
    /// Blocked on connection-level flow control.
    pub conn_flow_blocked: bool,
    transmits: Vec<Transmit>,
}

impl Send {
    pub fn new(local_max_data: u64) -> Self {
        Self {
            flags: 0,
            allowance: 0,
            initial_token: Vec::new(),
            path_response_data: [0u8; 8],
            local_max_data,
            peer_max_data: 0,
            conn_flow_blocked: false,
            transmits: Vec::new(),
        }
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_close_flag(&mut self, application: bool) {
        self.set_flag(if application {
            SEND_FLAG_APPLICATION_CLOSE
        } else {
            SEND_FLAG_CONNECTION_CLOSE
        });
    }

    /// Grow the allowance as unvalidated-path datagrams arrive.
    pub fn increase_allowance(&mut self, bytes: u64) {
        if self.allowance != u64::MAX {
            self.allowance = self.allowance.saturating_add(bytes);
        }
    }

    /// Source address validated: spending becomes unlimited.
    pub fn set_unlimited_allowance(&mut self) {
        self.allowance = u64::MAX;
    }

    pub fn allowance(&self) -> u64 {
        self.allowance
    }

    /// Spend allowance for one datagram. A non-zero balance admits the
    /// datagram even if it overshoots, so a fully built packet is never
    /// discarded; a zero balance blocks sending entirely.
    fn spend_allowance(&mut self, bytes: u64) -> bool {
        if self.allowance == u64::MAX {
            return true;
        }
        if self.allowance == 0 {
            return false;
        }
        self.allowance = self.allowance.saturating_sub(bytes);
        true
    }

    /// Raise the peer's MAX_DATA limit; returns `true` if it grew.
    pub fn update_peer_max_data(&mut self, maximum: u64) -> bool {
        if maximum > self.peer_max_data {
            self.peer_max_data = maximum;
            self.conn_flow_blocked = false;
            return true;
        }
        false
    }

    /// Drain datagrams produced by flush-send.
    pub fn take_transmits(&mut self) -> Vec<Transmit> {
        std::mem::take(&mut self.transmits)
    }
}

impl Connection {
    /// Materialize accumulated send flags into at most one packet.
    ///
    /// Returns `true` when more remains to send, in which case the
    /// caller re-queues the flush operation.
    pub fn flush_send(&mut self, now: Instant) -> bool {
        if self.flags.handle_closed || self.remote_address.is_none() {
            return false;
        }

        // Once closing, the only packet left to send is the close frame.
        if self.is_closed()
            && !self
                .send
                .has_flag(SEND_FLAG_CONNECTION_CLOSE | SEND_FLAG_APPLICATION_CLOSE)
        {
            return false;
        }

        // Drop a stale ACK flag once every writable level's ACKs went out
        // (e.g. a space discarded with acknowledgements still pending).
        if self.send.has_flag(SEND_FLAG_ACK) {
            let any_pending = self.spaces.iter().flatten().any(|space| {
                space.ack_tracker.has_packets_to_ack()
                    && self.crypto.write_key(space.level.key_type()).is_some()
            });
            if !any_pending {
                self.send.clear_flag(SEND_FLAG_ACK);
            }
        }

        let mut produced = false;
        for level in [EncryptionLevel::Initial, EncryptionLevel::Handshake, EncryptionLevel::OneRtt]
        {
            if self.spaces[level as usize].is_none() {
                continue;
            }
            if self.crypto.write_key(level.key_type()).is_none() {
                continue;
            }
            if self.build_packet(level, now) {
                produced = true;
                break;
            }
        }

        // Report more-to-send only when this call made progress; stalled
        // intent (missing keys, amplification limit) is retried by the
        // next receive or key install rather than busy-looping.
        produced && self.has_send_work()
    }

    fn has_send_work(&self) -> bool {
        if self.crypto.has_pending_send() {
            return true;
        }
        // Pending ACKs only count while the level is still writable.
        let pending_acks = self.spaces.iter().flatten().any(|space| {
            space.ack_tracker.has_packets_to_ack()
                && self.crypto.write_key(space.level.key_type()).is_some()
        });
        pending_acks || self.send.flags() != 0
    }

    /// Build, protect, and queue one packet at `level`.
    ///
    /// Returns `true` if a packet was produced.
    fn build_packet(&mut self, level: EncryptionLevel, now: Instant) -> bool {
        let remote = self.remote_address.expect("checked by flush_send");
        let Some(dest_cid) = self.cids.current_dest().map(|entry| entry.cid) else {
            return false;
        };
        let closing = self.is_closed();

        let mut payload = Vec::with_capacity(256);
        let mut ack_eliciting = false;
        let mut sent_ack = false;

        // ACKs ride along with anything else pending at this level.
        if !closing {
            if let Some(space) = self.space(level) {
                if space.ack_tracker.has_packets_to_ack() {
                    frame::encode_ack(&mut payload, space.ack_tracker.ranges(), 0);
                    sent_ack = true;
                }
            }
        }

        if !closing {
            if let Some((offset, data)) = self.crypto.take_pending_send_at(level) {
                frame::encode_crypto(&mut payload, offset, &data);
                ack_eliciting = true;
            }
            if !self.crypto.has_pending_send() {
                self.send.clear_flag(SEND_FLAG_CRYPTO);
            }

            if self.send.has_flag(SEND_FLAG_PING) && level == self.highest_writable_level() {
                frame::encode_ping(&mut payload);
                self.send.clear_flag(SEND_FLAG_PING);
                ack_eliciting = true;
            }

            if level == EncryptionLevel::OneRtt {
                ack_eliciting |= self.build_one_rtt_control_frames(&mut payload);
            }
        }

        // The close frame goes out at the highest level with write keys,
        // so a peer that already discarded lower-level keys can still
        // read it. The application variant is restricted to 1-RTT and
        // degrades to a transport close below it.
        if self.send.has_flag(SEND_FLAG_CONNECTION_CLOSE | SEND_FLAG_APPLICATION_CLOSE)
            && level == self.highest_writable_level()
        {
            let application =
                self.send.has_flag(SEND_FLAG_APPLICATION_CLOSE) && level == EncryptionLevel::OneRtt;
            let reason = self.close_reason.clone().unwrap_or_default();
            frame::encode_connection_close(
                &mut payload,
                application,
                self.close_error_code,
                reason.as_bytes(),
            );
            self.send.clear_flag(SEND_FLAG_CONNECTION_CLOSE | SEND_FLAG_APPLICATION_CLOSE);
        }

        if payload.is_empty() {
            return false;
        }

        // Keep enough ciphertext past the packet number for HP sampling.
        if payload.len() < 4 {
            let pad_len = 4 - payload.len();
            frame::encode_padding(&mut payload, pad_len);
        }

        let space = self.spaces[level as usize].as_mut().expect("space exists");
        let pn = space.next_packet_number();
        let pn_len = number::encoded_len(pn, space.largest_acked_packet_number);
        let key_phase = space.current_key_phase;

        let mut packet = Vec::with_capacity(payload.len() + 64);
        let (mut pn_offset, is_short) = match level {
            EncryptionLevel::OneRtt => {
                (header::encode_short(&mut packet, &dest_cid, key_phase, pn, pn_len), true)
            }
            _ => {
                let ty = match level {
                    EncryptionLevel::Initial => header::LongPacketType::Initial,
                    EncryptionLevel::ZeroRtt => header::LongPacketType::ZeroRtt,
                    _ => header::LongPacketType::Handshake,
                };
                let token = if level == EncryptionLevel::Initial {
                    self.send.initial_token.clone()
                } else {
                    Vec::new()
                };
                let src_cid =
                    self.cids.source.first().map(|e| e.cid).unwrap_or_else(crate::types::ConnectionId::empty);
                let offset = header::encode_long(
                    &mut packet,
                    ty,
                    self.version,
                    &dest_cid,
                    &src_cid,
                    &token,
                    pn,
                    pn_len,
                    payload.len() + ENCRYPTION_OVERHEAD,
                );
                (offset, false)
            }
        };

        // A client Initial must fill the minimum datagram size; pad the
        // plaintext and rewrite the header's length field accordingly.
        if level == EncryptionLevel::Initial && self.side.is_client() {
            let projected = packet.len() + payload.len() + ENCRYPTION_OVERHEAD;
            if projected < MIN_INITIAL_PACKET_SIZE {
                let pad = MIN_INITIAL_PACKET_SIZE - projected;
                frame::encode_padding(&mut payload, pad);
                packet.truncate(0);
                let src_cid = self
                    .cids
                    .source
                    .first()
                    .map(|e| e.cid)
                    .unwrap_or_else(crate::types::ConnectionId::empty);
                // The wider length varint moves the packet number field.
                pn_offset = header::encode_long(
                    &mut packet,
                    header::LongPacketType::Initial,
                    self.version,
                    &dest_cid,
                    &src_cid,
                    &self.send.initial_token.clone(),
                    pn,
                    pn_len,
                    payload.len() + ENCRYPTION_OVERHEAD,
                );
            }
        }

        let key_type = match level {
            EncryptionLevel::OneRtt => KeyType::OneRtt,
            other => other.key_type(),
        };
        let keys = self.crypto.write_key(key_type).expect("checked by flush_send").clone();
        let header_bytes = packet.clone();
        self.crypto.protection().seal(&keys, pn, &header_bytes, &mut payload);
        packet.extend_from_slice(&payload);

        if self.flags.header_protection_enabled {
            if let Some(sample) = protection::sample(&packet, pn_offset) {
                let mask = self.crypto.protection().hp_mask(&keys.header_key, &sample);
                protection::apply(&mut packet, pn_offset, pn_len, &mask, is_short);
            }
        }

        let datagram_len = packet.len() as u64;
        if !self.flags.source_address_validated && !self.send.spend_allowance(datagram_len) {
            // Over the amplification budget: hold this packet's intent
            // by leaving flags set; the next validated receive retries.
            trace!(correlation_id = self.correlation_id, "amplification limit reached");
            return false;
        }

        if sent_ack {
            if let Some(space) = self.space_mut(level) {
                space.ack_tracker.on_ack_sent();
            }
            self.send.clear_flag(SEND_FLAG_ACK);
            self.cancel_timer(super::timer::TimerType::AckDelay);
        }

        self.loss_detection.on_packet_sent(level, pn, packet.len(), ack_eliciting, now);
        self.congestion.on_packet_sent(packet.len(), now);
        self.stats.send.total_packets += 1;
        self.stats.send.total_bytes += packet.len() as u64;
        trace!(
            correlation_id = self.correlation_id,
            ?level,
            pn,
            bytes = packet.len(),
            "packet sent"
        );

        self.send.transmits.push(Transmit { data: packet, remote });
        true
    }

    /// 1-RTT-only control frames. Returns whether any were ack-eliciting.
    fn build_one_rtt_control_frames(&mut self, payload: &mut Vec<u8>) -> bool {
        let mut ack_eliciting = false;

        if self.send.has_flag(SEND_FLAG_PATH_RESPONSE) {
            frame::encode_path_response(payload, &self.send.path_response_data);
            self.send.clear_flag(SEND_FLAG_PATH_RESPONSE);
            ack_eliciting = true;
        }

        if self.send.has_flag(SEND_FLAG_HANDSHAKE_DONE) {
            frame::encode_handshake_done(payload);
            self.send.clear_flag(SEND_FLAG_HANDSHAKE_DONE);
            ack_eliciting = true;
        }

        if self.send.has_flag(SEND_FLAG_NEW_CONNECTION_ID) {
            for entry in self.cids.source.iter_mut().filter(|entry| entry.needs_send) {
                let token = self.binding.generate_stateless_reset_token(&entry.cid);
                frame::encode_new_connection_id(payload, entry.sequence, &entry.cid, &token);
                entry.needs_send = false;
                ack_eliciting = true;
            }
            self.send.clear_flag(SEND_FLAG_NEW_CONNECTION_ID);
        }

        if self.send.has_flag(SEND_FLAG_RETIRE_CONNECTION_ID) {
            for entry in self.cids.dest.iter_mut().filter(|entry| entry.retired && entry.needs_send)
            {
                frame::encode_retire_connection_id(payload, entry.sequence);
                entry.needs_send = false;
                ack_eliciting = true;
            }
            self.send.clear_flag(SEND_FLAG_RETIRE_CONNECTION_ID);
        }

        if self.send.has_flag(SEND_FLAG_MAX_DATA) {
            frame::encode_max_data(payload, self.send.local_max_data);
            self.send.clear_flag(SEND_FLAG_MAX_DATA);
            ack_eliciting = true;
        }

        if self.send.has_flag(SEND_FLAG_MAX_STREAMS_BIDI) {
            frame::encode_max_streams(payload, false, self.streams.max_remote_streams(false));
            self.send.clear_flag(SEND_FLAG_MAX_STREAMS_BIDI);
            ack_eliciting = true;
        }

        if self.send.has_flag(SEND_FLAG_MAX_STREAMS_UNI) {
            frame::encode_max_streams(payload, true, self.streams.max_remote_streams(true));
            self.send.clear_flag(SEND_FLAG_MAX_STREAMS_UNI);
            ack_eliciting = true;
        }

        ack_eliciting
    }

    fn highest_writable_level(&self) -> EncryptionLevel {
        self.crypto.write_key_level()
    }

    /// Datagrams produced since the last call, for the datapath.
    pub fn take_transmits(&mut self) -> Vec<Transmit> {
        self.send.take_transmits()
    }
}
