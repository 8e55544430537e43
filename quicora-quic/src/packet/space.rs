//! Per-encryption-level packet space state.
//!
//! A space tracks the next expected receive packet number, the ack
//! tracker, the deferred-datagram queue for packets that arrived before
//! their read key, and 1-RTT key-phase bookkeeping.

use std::collections::VecDeque;

use crate::crypto::EncryptionLevel;
use crate::packet::ack_tracker::AckTracker;
use crate::types::{PacketNumber, RecvDatagram, MAX_DEFERRED_DATAGRAMS};

#[derive(Debug)]
pub struct PacketSpace {
    pub level: EncryptionLevel,

    /// Next packet number for outgoing packets in this space.
    pub next_send_packet_number: PacketNumber,

    /// Largest packet number acknowledged by the peer, if any.
    pub largest_acked_packet_number: Option<PacketNumber>,

    /// One past the largest packet number successfully processed.
    pub next_recv_packet_number: PacketNumber,

    pub ack_tracker: AckTracker,

    /// Datagrams received before this space's read key was available.
    /// Buffers stay owned by the datapath; the cap bounds how many we
    /// hold hostage.
    deferred: VecDeque<RecvDatagram>,

    /// Current 1-RTT read key phase bit.
    pub current_key_phase: bool,

    /// Packet number at which the current read key phase began.
    /// Reordered packets may retroactively lower it.
    pub read_key_phase_start: Option<PacketNumber>,

    /// Packet number at which the current write key phase began.
    pub write_key_phase_start: Option<PacketNumber>,
}

impl PacketSpace {
    pub fn new(level: EncryptionLevel) -> Self {
        Self {
            level,
            next_send_packet_number: 0,
            largest_acked_packet_number: None,
            next_recv_packet_number: 0,
            ack_tracker: AckTracker::default(),
            deferred: VecDeque::new(),
            current_key_phase: false,
            read_key_phase_start: None,
            write_key_phase_start: None,
        }
    }

    /// Record a fully processed packet number.
    pub fn on_packet_processed(&mut self, pn: PacketNumber) {
        if pn + 1 > self.next_recv_packet_number {
            self.next_recv_packet_number = pn + 1;
        }
    }

    /// Queue a datagram until this space's read key arrives.
    ///
    /// Returns `false` (datagram dropped) once the cap is reached.
    pub fn defer_datagram(&mut self, datagram: RecvDatagram) -> bool {
        if self.deferred.len() >= MAX_DEFERRED_DATAGRAMS {
            return false;
        }
        self.deferred.push_back(datagram);
        true
    }

    /// Drain deferred datagrams for reprocessing after a key install.
    pub fn take_deferred(&mut self) -> Vec<RecvDatagram> {
        self.deferred.drain(..).collect()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Allocate the next outgoing packet number.
    pub fn next_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_send_packet_number;
        self.next_send_packet_number += 1;
        pn
    }
}
