//! The receive pipeline: queue intake, header parse, header-protection
//! removal, packet-number decompression, payload decrypt/auth, the frame
//! loop, and post-processing.
//!
//! Processing is a per-datagram outer loop over the detached receive
//! chain and a per-packet inner loop over coalesced packets. A packet
//! that arrives before its read key defers its whole datagram onto the
//! packet space; a non-decryptable leading long-header packet ends the
//! datagram.

use tracing::{debug, info, trace};

use crate::crypto::{EncryptionLevel, KeyType, ENCRYPTION_OVERHEAD};
use crate::error::{Status, TransportError};
use crate::frames::{allowed_at_level, Frame, FrameParser};
use crate::packet::{header, number, protection, ParsedHeader};
use crate::stream::StreamResolution;
use crate::types::{
    ConnectionId, Instant, RecvDatagram, AMPLIFICATION_RATIO, MIN_STATELESS_RESET_PACKET_LENGTH,
    STATELESS_RESET_TOKEN_LENGTH,
};

use super::send::{SEND_FLAG_ACK, SEND_FLAG_MAX_DATA, SEND_FLAG_NEW_CONNECTION_ID,
    SEND_FLAG_PATH_RESPONSE, SEND_FLAG_RETIRE_CONNECTION_ID};
use super::timer::TimerType;
use super::{
    CloseCause, Connection, ConnectionEvent, Lifecycle, Operation, CLOSE_APPLICATION,
    CLOSE_INTERNAL_SILENT, CLOSE_REMOTE, CLOSE_SEND_NOTIFICATION,
};

/// Why a packet was dropped without closing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    HeaderParse,
    VersionMismatch,
    KeyUnavailable,
    KeyDiscarded,
    InvalidToken,
    DecryptionFailure,
    Duplicate,
    PayloadTooShort,
    NotAllowedYet,
}

/// Per-packet outcome, driving the coalesced-packet loop.
enum PacketOutcome {
    /// Packet fully processed; `consumed` bytes belong to it.
    Processed { consumed: usize },
    /// Packet dropped; skip `consumed` bytes and continue if possible.
    Dropped { consumed: usize, fatal_for_datagram: bool },
    /// Datagram deferred onto a packet space awaiting keys.
    Deferred,
    /// Connection state changed such that processing must stop.
    Stop,
}

impl Connection {
    /// Drain the detached receive chain through the pipeline.
    pub(crate) fn flush_recv(&mut self, now: Instant) {
        let mut chain = self.detach_recv_queue();
        while let Some(datagram) = chain.pop_front() {
            self.process_datagram(datagram, now);
            if self.flags.handle_closed {
                break;
            }
        }
        // Consumed buffers return to the datapath by drop; deferred
        // queues are the only place they outlive this drain.
    }

    pub(crate) fn process_datagram(&mut self, datagram: RecvDatagram, now: Instant) {
        self.stats.recv.total_bytes += datagram.buffer.len() as u64;

        // No path migration: a different remote address drops the
        // datagram outright.
        if self.remote_address.is_some() && Some(datagram.remote) != self.remote_address {
            self.stats.recv.dropped_packets += 1;
            trace!(correlation_id = self.correlation_id, "dropped datagram from unknown address");
            return;
        }

        if !self.flags.source_address_validated {
            self.send
                .increase_allowance(AMPLIFICATION_RATIO * datagram.buffer.len() as u64);
        }

        let mut buf = datagram.buffer.to_vec();
        let mut offset = 0;
        let mut any_packet_valid = false;

        while offset < buf.len() {
            match self.recv_packet(&mut buf, offset, &datagram, now) {
                PacketOutcome::Processed { consumed } => {
                    any_packet_valid = true;
                    self.stats.recv.total_packets += 1;
                    offset += consumed;
                }
                PacketOutcome::Dropped { consumed, fatal_for_datagram } => {
                    self.stats.recv.total_packets += 1;
                    self.stats.recv.dropped_packets += 1;
                    if fatal_for_datagram || consumed == 0 {
                        break;
                    }
                    offset += consumed;
                }
                PacketOutcome::Deferred | PacketOutcome::Stop => break,
            }
            if self.flags.handle_closed {
                break;
            }
        }

        if any_packet_valid {
            self.reset_idle_timeout(now);
        }

        // Keys may have arrived mid-datagram; replay anything parked.
        self.flush_deferred(now);
    }

    /// Reprocess deferred datagrams for every level whose read key is
    /// now installed.
    fn flush_deferred(&mut self, now: Instant) {
        for index in 0..self.spaces.len() {
            let Some(level) = EncryptionLevel::from_index(index) else { continue };
            if self.crypto.read_key(level.key_type()).is_none() {
                continue;
            }
            let deferred = match self.spaces[index].as_mut() {
                Some(space) if space.deferred_len() > 0 => space.take_deferred(),
                _ => continue,
            };
            debug!(
                correlation_id = self.correlation_id,
                ?level,
                count = deferred.len(),
                "replaying deferred datagrams"
            );
            for datagram in deferred {
                self.process_datagram(datagram, now);
            }
        }
    }

    /// Process one (possibly coalesced) packet starting at `offset`.
    fn recv_packet(
        &mut self,
        buf: &mut Vec<u8>,
        offset: usize,
        datagram: &RecvDatagram,
        now: Instant,
    ) -> PacketOutcome {
        let local_cid_len = self.cids.source.first().map(|e| e.cid.len()).unwrap_or(0);

        let parsed = match header::parse(&buf[offset..], local_cid_len) {
            Ok(parsed) => parsed,
            Err(error) => {
                trace!(correlation_id = self.correlation_id, ?error, "header parse failed");
                return self.drop_packet(DropReason::HeaderParse, 0, true);
            }
        };

        match parsed {
            ParsedHeader::VersionNegotiation { .. } => {
                // Single-version endpoint: a Version Negotiation packet
                // during the handshake is fatal, with no close frame.
                if self.side.is_client()
                    && !self.flags.got_first_server_response
                    && self.lifecycle < Lifecycle::Connected
                {
                    info!(correlation_id = self.correlation_id, "version negotiation received");
                    self.try_close(
                        CLOSE_INTERNAL_SILENT,
                        CloseCause::InternalStatus(Err(Status::VersionNegotiationError)),
                        None,
                        now,
                    );
                }
                PacketOutcome::Stop
            }

            ParsedHeader::Retry { src_cid, orig_dest_cid, token, .. } => {
                self.process_retry(src_cid, orig_dest_cid, token, now);
                PacketOutcome::Stop
            }

            ParsedHeader::Long { ty, version, dest_cid, src_cid, token, pn_offset, packet_length } => {
                if version != self.version {
                    return self.drop_packet(DropReason::VersionMismatch, 0, true);
                }
                self.recv_protected_packet(
                    buf,
                    offset,
                    LongOrShort::Long { ty, src_cid, token },
                    dest_cid,
                    pn_offset,
                    packet_length,
                    datagram,
                    now,
                )
            }

            ParsedHeader::Short { dest_cid, pn_offset } => {
                if self.lifecycle < Lifecycle::Started {
                    // No version agreed yet; a short header cannot be
                    // valid.
                    return self.drop_packet(DropReason::NotAllowedYet, 0, true);
                }
                let packet_length = buf.len() - offset;
                self.recv_protected_packet(
                    buf,
                    offset,
                    LongOrShort::Short,
                    dest_cid,
                    pn_offset,
                    packet_length,
                    datagram,
                    now,
                )
            }
        }
    }

    fn drop_packet(
        &mut self,
        reason: DropReason,
        consumed: usize,
        fatal_for_datagram: bool,
    ) -> PacketOutcome {
        trace!(correlation_id = self.correlation_id, ?reason, "packet dropped");
        PacketOutcome::Dropped { consumed, fatal_for_datagram }
    }

    /// Retry packet handling (client only; draft-23 Section 17.2.5).
    fn process_retry(
        &mut self,
        src_cid: ConnectionId,
        orig_dest_cid: ConnectionId,
        token: Vec<u8>,
        now: Instant,
    ) {
        if self.side.is_server()
            || self.flags.got_first_server_response
            || self.flags.received_retry
            || token.is_empty()
        {
            self.stats.recv.dropped_packets += 1;
            return;
        }
        let Some(current_dest) = self.cids.current_dest().map(|entry| entry.cid) else {
            self.stats.recv.dropped_packets += 1;
            return;
        };
        // The embedded original-destination CID must match the CID we
        // actually sent to.
        if orig_dest_cid != current_dest {
            self.stats.recv.dropped_packets += 1;
            return;
        }

        info!(correlation_id = self.correlation_id, "retry received; restarting handshake");
        self.send.initial_token = token;
        self.orig_dest_cid = Some(current_dest);
        self.cids.update_dest_cid(src_cid);
        self.flags.got_first_server_response = true;
        self.flags.received_retry = true;

        // Initial keys regenerate from the new destination CID inside
        // restart; RTT state survives.
        self.restart(false, now);
    }

    #[allow(clippy::too_many_arguments)]
    fn recv_protected_packet(
        &mut self,
        buf: &mut Vec<u8>,
        offset: usize,
        kind: LongOrShort,
        dest_cid: ConnectionId,
        pn_offset: usize,
        packet_length: usize,
        datagram: &RecvDatagram,
        now: Instant,
    ) -> PacketOutcome {
        let is_short = matches!(kind, LongOrShort::Short);

        // Server-side Initial tokens resolve to the original destination
        // CID and validate the source address.
        if let LongOrShort::Long { ty: header::LongPacketType::Initial, ref token, .. } = kind {
            if !token.is_empty() && self.side.is_server() && self.orig_dest_cid.is_none() {
                match self.open_retry_token(token) {
                    Some(orig_cid) => {
                        self.orig_dest_cid = Some(orig_cid);
                        if !self.flags.source_address_validated {
                            self.flags.source_address_validated = true;
                            self.send.set_unlimited_allowance();
                            info!(
                                correlation_id = self.correlation_id,
                                "source address validated via retry token"
                            );
                        }
                    }
                    None => return self.drop_packet(DropReason::InvalidToken, packet_length, false),
                }
            }
        }

        let base_key_type = match kind {
            LongOrShort::Long { ty: header::LongPacketType::Initial, .. } => KeyType::Initial,
            LongOrShort::Long { ty: header::LongPacketType::ZeroRtt, .. } => {
                if self.side.is_client() {
                    return self.drop_packet(DropReason::NotAllowedYet, packet_length, false);
                }
                KeyType::ZeroRtt
            }
            LongOrShort::Long { .. } => KeyType::Handshake,
            LongOrShort::Short => KeyType::OneRtt,
        };
        let level = base_key_type.encrypt_level();

        if self.spaces[level as usize].is_none() {
            return self.drop_packet(DropReason::KeyUnavailable, packet_length, false);
        }

        // Key availability: defer if the key may still arrive, drop if
        // it was discarded.
        if self.crypto.read_key(base_key_type).is_none() {
            if self.crypto.keys_discarded(level) {
                return self.drop_packet(DropReason::KeyDiscarded, packet_length, false);
            }
            if level > self.crypto.read_key_level() {
                let space = self.spaces[level as usize].as_mut().unwrap();
                if space.defer_datagram(datagram.clone()) {
                    trace!(correlation_id = self.correlation_id, ?level, "datagram deferred");
                    return PacketOutcome::Deferred;
                }
            }
            return self.drop_packet(DropReason::KeyUnavailable, packet_length, false);
        }

        // Header-protection removal.
        let packet_end = offset + packet_length;
        let packet = &mut buf[offset..packet_end];
        let pn_len;
        if self.flags.header_protection_enabled {
            let Some(sample) = protection::sample(packet, pn_offset) else {
                return self.drop_packet(DropReason::PayloadTooShort, packet_length, false);
            };
            let hp_key = self
                .crypto
                .read_key(base_key_type)
                .expect("checked above")
                .header_key
                .clone();
            let mask = self.crypto.protection().hp_mask(&hp_key, &sample);
            pn_len = protection::remove(packet, pn_offset, &mask, is_short);
        } else {
            pn_len = (packet[0] & 0x03) as usize + 1;
        }
        let first_byte = packet[0];

        // Packet-number decompression against the space's expectation.
        let Some(truncated) = number::read_truncated(&packet[pn_offset..], pn_len) else {
            return self.drop_packet(DropReason::PayloadTooShort, packet_length, false);
        };
        let expected = self.spaces[level as usize].as_ref().unwrap().next_recv_packet_number;
        let pn = number::decompress(expected, truncated, pn_len * 8);

        // 1-RTT key phase: a flipped phase bit selects the old key for
        // reordered packets or derives the next-generation key.
        let mut key_type = base_key_type;
        if is_short {
            let phase = protection::key_phase(first_byte);
            let space = self.spaces[level as usize].as_ref().unwrap();
            if phase != space.current_key_phase {
                let before_phase_start =
                    space.read_key_phase_start.map_or(false, |start| pn < start);
                if self.crypto.awaiting_key_phase_confirmation || before_phase_start {
                    key_type = KeyType::OneRttOld;
                    if self.crypto.read_key(key_type).is_none() {
                        return self.drop_packet(DropReason::KeyUnavailable, packet_length, false);
                    }
                } else {
                    if self.crypto.read_key(KeyType::OneRttNew).is_none()
                        && self.crypto.prepare_key_update().is_err()
                    {
                        return self.drop_packet(DropReason::KeyUnavailable, packet_length, false);
                    }
                    key_type = KeyType::OneRttNew;
                }
            }
        }

        // Snapshot the possible stateless-reset token before decryption
        // can trash the payload.
        let mut reset_token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        let can_check_reset = self.side.is_client()
            && is_short
            && packet_length >= MIN_STATELESS_RESET_PACKET_LENGTH;
        if can_check_reset {
            reset_token
                .copy_from_slice(&packet[packet_length - STATELESS_RESET_TOKEN_LENGTH..]);
        }

        // AEAD open. The payload must hold more than the tag.
        let payload_start = pn_offset + pn_len;
        if packet_length <= payload_start + ENCRYPTION_OVERHEAD {
            return self.drop_packet(DropReason::PayloadTooShort, packet_length, false);
        }
        let keys = self.crypto.read_key(key_type).expect("checked above").clone();
        let (aad, payload) = packet.split_at_mut(payload_start);
        let plain_len = if self.flags.encryption_enabled {
            match self.crypto.protection().open(&keys, pn, aad, payload) {
                Ok(len) => len,
                Err(()) => {
                    if can_check_reset && self.cids.matches_reset_token(&reset_token) {
                        info!(correlation_id = self.correlation_id, "stateless reset received");
                        self.try_close(
                            CLOSE_INTERNAL_SILENT,
                            CloseCause::InternalStatus(Err(Status::Aborted)),
                            None,
                            now,
                        );
                        return PacketOutcome::Stop;
                    }
                    self.stats.recv.decryption_failures += 1;
                    return self.drop_packet(
                        DropReason::DecryptionFailure,
                        packet_length,
                        !is_short,
                    );
                }
            }
        } else {
            payload.len()
        };

        // Reserved bits only validate on an authenticated packet.
        if protection::reserved_bits(first_byte, is_short) != 0 {
            self.transport_error(TransportError::ProtocolViolation, now);
            return PacketOutcome::Stop;
        }

        if plain_len == 0 {
            return self.drop_packet(DropReason::PayloadTooShort, packet_length, false);
        }

        // Commit or adjust the key phase now that the packet is real.
        if is_short {
            let space = self.spaces[level as usize].as_mut().unwrap();
            match key_type {
                KeyType::OneRttNew => {
                    self.crypto.update_key_phase(false);
                    space.current_key_phase = !space.current_key_phase;
                    space.read_key_phase_start = Some(pn);
                    self.stats.key_update_count += 1;
                    debug!(correlation_id = self.correlation_id, pn, "read key phase advanced");
                }
                KeyType::OneRtt => {
                    if space.read_key_phase_start.map_or(false, |start| pn < start) {
                        // Reordered packet from before the phase start.
                        space.read_key_phase_start = Some(pn);
                    }
                }
                _ => {}
            }
        }

        // Duplicate detection happens before the frame loop, making
        // ack-eliciting tracking idempotent.
        {
            let space = self.spaces[level as usize].as_mut().unwrap();
            if space.ack_tracker.add_packet_number(pn) {
                self.stats.recv.duplicate_packets += 1;
                return self.drop_packet(DropReason::Duplicate, packet_length, false);
            }
        }

        // Frame loop over the authenticated plaintext.
        let plaintext_start = offset + payload_start;
        let plaintext: Vec<u8> = buf[plaintext_start..plaintext_start + plain_len].to_vec();
        match self.process_frames(level, pn, &plaintext, now) {
            Ok(()) => {}
            Err(error) => {
                self.transport_error(error, now);
                return PacketOutcome::Stop;
            }
        }

        {
            let space = self.spaces[level as usize].as_mut().unwrap();
            space.on_packet_processed(pn);
        }
        self.stats.recv.valid_packets += 1;
        trace!(correlation_id = self.correlation_id, ?level, pn, "packet processed");

        self.recv_post_processing(&kind, dest_cid, now);
        PacketOutcome::Processed { consumed: packet_length }
    }

    /// CID tracking and key-discard side effects of a valid packet.
    fn recv_post_processing(&mut self, kind: &LongOrShort, dest_cid: ConnectionId, now: Instant) {
        // Server: first Handshake-key decrypt discards Initial keys and
        // validates the source address.
        if let LongOrShort::Long { ty: header::LongPacketType::Handshake, .. } = kind {
            if self.side.is_server() {
                self.discard_level_state(EncryptionLevel::Initial);
                if !self.flags.source_address_validated {
                    self.flags.source_address_validated = true;
                    self.send.set_unlimited_allowance();
                    info!(
                        correlation_id = self.correlation_id,
                        "source address validated via handshake packet"
                    );
                }
            }
        }

        // Client: the server's first Initial supplies the server-chosen
        // destination CID.
        if let LongOrShort::Long { ty: header::LongPacketType::Initial, src_cid, .. } = kind {
            if self.side.is_client() && !self.flags.got_first_server_response {
                self.cids.update_dest_cid(*src_cid);
                self.flags.got_first_server_response = true;
            }
        }

        // Track first use of each local CID; a switch to a fresh CID
        // retires leftovers and answers an uninitiated peer rotation by
        // rotating our destination CID too.
        let mut peer_switched_cid = false;
        let mut newly_used_non_initial = false;
        if let Some(entry) = self.cids.find_source_by_cid(&dest_cid) {
            if !entry.used_by_peer {
                entry.used_by_peer = true;
                if !entry.is_initial {
                    newly_used_non_initial = true;
                    peer_switched_cid = true;
                }
            }
        }
        if newly_used_non_initial {
            let binding = self.binding.clone();
            self.cids.source.retain(|entry| {
                if entry.is_initial && !entry.used_by_peer {
                    binding.remove_source_cid(&entry.cid);
                    false
                } else {
                    true
                }
            });
        }
        if peer_switched_cid {
            if self.flags.initiated_cid_update {
                self.flags.initiated_cid_update = false;
            } else if self.cids.retire_current_dest() {
                self.send.set_flag(SEND_FLAG_RETIRE_CONNECTION_ID);
                self.stats.dest_cid_update_count += 1;
                self.queue_operation(Operation::FlushSend);
            }
        }
        let _ = now;
    }

    /// The frame loop (draft-23 Section 12.4). Returns a transport error
    /// that closes the connection, or unit on success.
    fn process_frames(
        &mut self,
        level: EncryptionLevel,
        pn: u64,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), TransportError> {
        let mut ack_eliciting = false;
        let mut ack_immediately = false;

        let mut parser = FrameParser::new(payload);
        while let Some(result) = parser.next_frame() {
            let frame = result?;
            if !allowed_at_level(frame.frame_type(), level) {
                return Err(TransportError::FrameEncodingError);
            }
            ack_eliciting |= frame.is_ack_eliciting();

            // Re-evaluated per frame: an earlier frame in this packet may
            // have closed the connection.
            if self.is_closed() && !matches!(&frame, Frame::ConnectionClose { .. }) {
                // Closing connections parse but ignore everything except
                // the peer's close.
                continue;
            }

            match &frame {
                Frame::Padding { .. } => {}

                Frame::Ping => {
                    ack_immediately = true;
                }

                Frame::Ack(ack) => {
                    let ranges =
                        ack.decode_ranges().ok_or(TransportError::FrameEncodingError)?;
                    let exponent = self
                        .peer_transport_params
                        .as_ref()
                        .map(|params| params.ack_delay_exponent)
                        .unwrap_or(crate::transport::parameters::DEFAULT_ACK_DELAY_EXPONENT);
                    let delay_us = ack.ack_delay.saturating_mul(1u64 << exponent.min(20));
                    let outcome =
                        self.loss_detection.on_ack_received(level, &ranges, delay_us, now);
                    if outcome.acked_bytes > 0 {
                        self.congestion.on_packets_acked(outcome.acked_bytes, now);
                    }
                    if let Some(largest) = outcome.largest_newly_acked {
                        let space = self.spaces[level as usize].as_mut().unwrap();
                        if space.largest_acked_packet_number.map_or(true, |cur| largest > cur) {
                            space.largest_acked_packet_number = Some(largest);
                        }
                        // An acked packet in the new phase confirms a
                        // locally-initiated key update.
                        if self.crypto.awaiting_key_phase_confirmation
                            && space.write_key_phase_start.map_or(false, |start| largest >= start)
                        {
                            self.crypto.confirm_key_phase();
                        }
                    }
                }

                Frame::Crypto { offset, data } => {
                    self.crypto.process_frame(level, *offset, data)?;
                    self.process_crypto_events(now);
                    if self.flags.handle_closed {
                        return Ok(());
                    }
                    ack_immediately = true;
                }

                Frame::NewToken { .. } => {
                    // Accepted and ignored; token storage is reserved.
                    ack_immediately = true;
                }

                Frame::ResetStream { stream_id, .. }
                | Frame::StopSending { stream_id, .. }
                | Frame::Stream { stream_id, .. }
                | Frame::MaxStreamData { stream_id, .. }
                | Frame::StreamDataBlocked { stream_id, .. } => {
                    let stream_id = *stream_id;
                    let frame_type = frame.frame_type();
                    match self.streams.resolve_recv(stream_id, frame_type)? {
                        StreamResolution::Deliver => {
                            // Stream payload handling belongs to the
                            // stream set's buffers.
                            if let Frame::Stream { fin: true, .. } = &frame {
                                self.streams.close_stream(stream_id);
                            }
                        }
                        StreamResolution::Skip => {}
                    }
                    ack_immediately = true;
                }

                Frame::MaxData { maximum } => {
                    if self.send.update_peer_max_data(*maximum) {
                        self.queue_operation(Operation::FlushSend);
                    }
                }

                Frame::MaxStreams { unidirectional, maximum } => {
                    self.streams.update_max_local_streams(*unidirectional, *maximum);
                }

                Frame::DataBlocked { .. } => {
                    self.send.set_flag(SEND_FLAG_MAX_DATA);
                    self.queue_operation(Operation::FlushSend);
                }

                Frame::StreamsBlocked { unidirectional, .. } => {
                    let event = ConnectionEvent::PeerNeedsStreams {
                        unidirectional: *unidirectional,
                    };
                    self.indicate_event(&event);
                }

                Frame::NewConnectionId(ncid) => {
                    if (self.cids.dest_count() as u64) < self.config.active_cid_limit {
                        self.cids.add_dest_cid(ncid.sequence, ncid.cid, ncid.reset_token);
                    }
                    // Over the limit: ignored, not an error.
                    ack_immediately = true;
                }

                Frame::RetireConnectionId { sequence } => {
                    let last_remaining = self.cids.source.len() <= 1;
                    if self
                        .cids
                        .retire_source_by_sequence(&self.binding, *sequence)
                        .is_some()
                    {
                        if last_remaining {
                            // The peer retired our only active CID; no
                            // route back to us remains, so tear down
                            // without putting a close frame on the wire.
                            self.try_close(
                                CLOSE_INTERNAL_SILENT,
                                CloseCause::WireError(
                                    TransportError::ProtocolViolation.to_wire(),
                                ),
                                None,
                                now,
                            );
                            return Ok(());
                        }
                        if self
                            .cids
                            .generate_source_cid(&self.binding, self.correlation_id, false)
                            .is_ok()
                        {
                            self.send.set_flag(SEND_FLAG_NEW_CONNECTION_ID);
                            self.queue_operation(Operation::FlushSend);
                        }
                    }
                    ack_immediately = true;
                }

                Frame::PathChallenge { data } => {
                    if *data != self.send.path_response_data {
                        self.send.path_response_data = *data;
                    }
                    self.send.set_flag(SEND_FLAG_PATH_RESPONSE);
                    self.queue_operation(Operation::FlushSend);
                    ack_immediately = true;
                }

                Frame::PathResponse { .. } => {
                    // Response matching is deliberately not performed in
                    // this revision.
                    ack_immediately = true;
                }

                Frame::ConnectionClose { application, frame: close } => {
                    let mut flags = CLOSE_REMOTE | CLOSE_SEND_NOTIFICATION;
                    if *application {
                        flags |= CLOSE_APPLICATION;
                    }
                    let reason = String::from_utf8_lossy(close.reason).into_owned();
                    self.try_close(
                        flags,
                        CloseCause::WireError(close.error_code),
                        Some(&reason),
                        now,
                    );
                    if self.flags.handle_closed {
                        return Ok(());
                    }
                }

                Frame::HandshakeDone => {
                    if self.side.is_server() {
                        return Err(TransportError::ProtocolViolation);
                    }
                    self.on_handshake_confirmed(now);
                    ack_immediately = true;
                }
            }
        }

        if ack_eliciting && !self.is_closed() {
            let max_ack_delay = self.config.max_ack_delay_ms;
            let space = self.spaces[level as usize].as_mut().unwrap();
            space.ack_tracker.on_ack_eliciting();
            if ack_immediately || space.ack_tracker.ack_immediately() {
                space.ack_tracker.request_immediate_ack();
                self.send.set_flag(SEND_FLAG_ACK);
                self.queue_operation(Operation::FlushSend);
            } else if !self.timers.is_armed(TimerType::AckDelay) {
                self.set_timer(
                    TimerType::AckDelay,
                    core::time::Duration::from_millis(max_ack_delay),
                    now,
                );
            }
        } else if self.is_closed() && !self.flags.handle_closed {
            // Closing period: every arriving packet re-elicits the
            // CONNECTION_CLOSE frame. The armed shutdown timer is what
            // distinguishes a closing period from a silent close, which
            // must stay off the wire.
            if self.flags.closed_locally
                && !self.flags.closed_remotely
                && self.timers.is_armed(TimerType::Shutdown)
            {
                self.send.set_close_flag(self.flags.app_closed);
                self.queue_operation(Operation::FlushSend);
            }
        }

        let _ = pn;
        Ok(())
    }
}

/// Which header family a protected packet carried.
enum LongOrShort {
    Long { ty: header::LongPacketType, src_cid: ConnectionId, token: Vec<u8> },
    Short,
}
