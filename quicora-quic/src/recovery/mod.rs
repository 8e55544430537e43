//! Loss-detection and congestion-control seams.
//!
//! The full recovery machinery lives outside the connection core; this
//! module carries the contract the core depends on: RTT estimation,
//! probe-timeout computation, sent-packet bookkeeping for RTT samples
//! and key-update confirmation, and congestion hooks.

pub mod rtt;

use std::collections::VecDeque;

use crate::crypto::EncryptionLevel;
use crate::types::{Instant, PacketNumber};

pub use rtt::RttEstimator;

/// Congestion-controller hooks invoked by the connection core.
pub trait CongestionControl: Send {
    fn on_packet_sent(&mut self, bytes: usize, now: Instant);
    fn on_packets_acked(&mut self, bytes: usize, now: Instant);
    fn on_packets_lost(&mut self, bytes: usize, now: Instant);
    fn congestion_window(&self) -> usize;
    fn bytes_in_flight(&self) -> usize;
}

/// Window-accounting-only controller used until a real algorithm is
/// plugged in.
#[derive(Debug, Default)]
pub struct PassthroughCongestionControl {
    in_flight: usize,
}

impl CongestionControl for PassthroughCongestionControl {
    fn on_packet_sent(&mut self, bytes: usize, _now: Instant) {
        self.in_flight += bytes;
    }

    fn on_packets_acked(&mut self, bytes: usize, _now: Instant) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
    }

    fn on_packets_lost(&mut self, bytes: usize, _now: Instant) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
    }

    fn congestion_window(&self) -> usize {
        usize::MAX
    }

    fn bytes_in_flight(&self) -> usize {
        self.in_flight
    }
}

/// A sent packet awaiting acknowledgement.
#[derive(Debug, Clone, Copy)]
struct SentPacket {
    level: EncryptionLevel,
    pn: PacketNumber,
    sent_time: Instant,
    bytes: usize,
    ack_eliciting: bool,
}

/// Sent packets retained per connection for RTT sampling.
const MAX_SENT_HISTORY: usize = 256;

/// Loss-detection state owned by the connection.
#[derive(Debug, Default)]
pub struct LossDetection {
    pub rtt: RttEstimator,
    pto_count: u32,
    sent: VecDeque<SentPacket>,
}

/// Result of processing one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Bytes newly acknowledged.
    pub acked_bytes: usize,
    /// Largest packet number newly acknowledged, if any.
    pub largest_newly_acked: Option<PacketNumber>,
    /// Whether an RTT sample was taken from this ACK.
    pub rtt_updated: bool,
}

impl LossDetection {
    /// Record a sent packet for later RTT sampling.
    pub fn on_packet_sent(
        &mut self,
        level: EncryptionLevel,
        pn: PacketNumber,
        bytes: usize,
        ack_eliciting: bool,
        now: Instant,
    ) {
        if self.sent.len() >= MAX_SENT_HISTORY {
            self.sent.pop_front();
        }
        self.sent.push_back(SentPacket { level, pn, sent_time: now, bytes, ack_eliciting });
    }

    /// Apply an ACK frame's ranges (absolute, inclusive).
    ///
    /// The RTT sample comes from the largest newly-acked ack-eliciting
    /// packet, with the peer-reported delay subtracted.
    pub fn on_ack_received(
        &mut self,
        level: EncryptionLevel,
        ranges: &[(PacketNumber, PacketNumber)],
        ack_delay_us: u64,
        now: Instant,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let mut newly_acked_sample: Option<SentPacket> = None;

        self.sent.retain(|packet| {
            if packet.level != level {
                return true;
            }
            let acked = ranges.iter().any(|&(low, high)| packet.pn >= low && packet.pn <= high);
            if acked {
                outcome.acked_bytes += packet.bytes;
                if outcome.largest_newly_acked.map_or(true, |largest| packet.pn > largest) {
                    outcome.largest_newly_acked = Some(packet.pn);
                    if packet.ack_eliciting {
                        newly_acked_sample = Some(*packet);
                    }
                }
            }
            !acked
        });

        if let Some(packet) = newly_acked_sample {
            // Only the overall largest acked yields a sample.
            if Some(packet.pn) == ranges.iter().map(|&(_, high)| high).max() {
                let elapsed = now.saturating_duration_since(packet.sent_time).as_micros() as u64;
                let sample = elapsed.saturating_sub(ack_delay_us.min(elapsed));
                self.rtt.update(sample.max(1));
                outcome.rtt_updated = true;
            }
        }

        if outcome.largest_newly_acked.is_some() {
            self.pto_count = 0;
        }
        outcome
    }

    /// Drop sent-packet state for a discarded packet space.
    pub fn discard_level(&mut self, level: EncryptionLevel) {
        self.sent.retain(|packet| packet.level != level);
    }

    /// Probe timeout for the given probe count, in microseconds.
    pub fn compute_probe_timeout(&self, max_ack_delay_us: u64, pto_count: u32) -> u64 {
        self.rtt.probe_timeout(max_ack_delay_us, pto_count)
    }

    pub fn on_probe_timeout(&mut self) {
        self.pto_count += 1;
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }
}
