//! Received-packet tracking for duplicate detection and ACK generation.

use crate::types::PacketNumber;

/// Maximum number of disjoint received ranges kept per packet space.
/// The oldest range is evicted first; a peer that needs the evicted
/// range re-elicits it through retransmission.
const MAX_TRACKED_RANGES: usize = 32;

/// Tracks packet numbers received in one packet space.
///
/// Duplicate detection happens before frame processing, which is what
/// makes ack-eliciting tracking idempotent: a duplicate never reaches
/// the frame loop, so a packet enters the tracker at most once.
#[derive(Debug, Clone, Default)]
pub struct AckTracker {
    /// Disjoint inclusive ranges, sorted ascending.
    ranges: Vec<(PacketNumber, PacketNumber)>,
    /// Ack-eliciting packets received since the last ACK was sent.
    ack_eliciting_since_last_ack: usize,
    /// Set when an ACK must bypass the delayed-ack timer.
    ack_immediately: bool,
}

impl AckTracker {
    /// Record a received packet number.
    ///
    /// Returns `true` if the number was already present (duplicate).
    pub fn add_packet_number(&mut self, pn: PacketNumber) -> bool {
        let mut idx = self.ranges.len();
        for (i, &(lo, hi)) in self.ranges.iter().enumerate() {
            if pn >= lo && pn <= hi {
                return true;
            }
            if pn < lo {
                idx = i;
                break;
            }
        }

        // Extend a neighbor if adjacent, otherwise insert a new range.
        let extends_prev = idx > 0 && self.ranges[idx - 1].1 + 1 == pn;
        let extends_next = idx < self.ranges.len() && pn + 1 == self.ranges[idx].0;
        match (extends_prev, extends_next) {
            (true, true) => {
                self.ranges[idx - 1].1 = self.ranges[idx].1;
                self.ranges.remove(idx);
            }
            (true, false) => self.ranges[idx - 1].1 = pn,
            (false, true) => self.ranges[idx].0 = pn,
            (false, false) => {
                self.ranges.insert(idx, (pn, pn));
                if self.ranges.len() > MAX_TRACKED_RANGES {
                    self.ranges.remove(0);
                }
            }
        }
        false
    }

    /// Note that the packet carrying `pn` was ack-eliciting.
    pub fn on_ack_eliciting(&mut self) {
        self.ack_eliciting_since_last_ack += 1;
        // Two ack-eliciting packets force an ACK without further delay.
        if self.ack_eliciting_since_last_ack >= 2 {
            self.ack_immediately = true;
        }
    }

    /// Request that the next flush sends an ACK immediately.
    pub fn request_immediate_ack(&mut self) {
        self.ack_immediately = true;
    }

    pub fn ack_immediately(&self) -> bool {
        self.ack_immediately
    }

    /// Whether any ack-eliciting packet awaits acknowledgement.
    pub fn has_packets_to_ack(&self) -> bool {
        self.ack_eliciting_since_last_ack > 0
    }

    /// Largest packet number seen so far.
    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.ranges.last().map(|&(_, hi)| hi)
    }

    /// Tracked ranges, ascending, for ACK frame construction.
    pub fn ranges(&self) -> &[(PacketNumber, PacketNumber)] {
        &self.ranges
    }

    /// Reset pending-ack state after an ACK frame was emitted.
    pub fn on_ack_sent(&mut self) {
        self.ack_eliciting_since_last_ack = 0;
        self.ack_immediately = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_duplicates() {
        let mut tracker = AckTracker::default();
        assert!(!tracker.add_packet_number(5));
        assert!(tracker.add_packet_number(5));
        assert!(!tracker.add_packet_number(6));
        assert!(tracker.add_packet_number(5));
        assert!(tracker.add_packet_number(6));
    }

    #[test]
    fn merges_adjacent_ranges() {
        let mut tracker = AckTracker::default();
        tracker.add_packet_number(1);
        tracker.add_packet_number(3);
        assert_eq!(tracker.ranges(), &[(1, 1), (3, 3)]);
        tracker.add_packet_number(2);
        assert_eq!(tracker.ranges(), &[(1, 3)]);
        assert_eq!(tracker.largest_received(), Some(3));
    }

    #[test]
    fn out_of_order_insertion() {
        let mut tracker = AckTracker::default();
        for pn in [10, 2, 7, 3, 9] {
            assert!(!tracker.add_packet_number(pn));
        }
        assert_eq!(tracker.ranges(), &[(2, 3), (7, 7), (9, 10)]);
    }

    #[test]
    fn evicts_oldest_range_at_cap() {
        let mut tracker = AckTracker::default();
        for i in 0..(MAX_TRACKED_RANGES as u64 + 1) {
            tracker.add_packet_number(i * 2);
        }
        assert_eq!(tracker.ranges().len(), MAX_TRACKED_RANGES);
        assert_eq!(tracker.ranges()[0].0, 2);
        // The evicted number now reads as new; the cap trades a
        // possible duplicate-ACK for bounded memory.
        assert!(!tracker.add_packet_number(0));
    }

    #[test]
    fn two_ack_eliciting_packets_force_immediate_ack() {
        let mut tracker = AckTracker::default();
        tracker.add_packet_number(0);
        tracker.on_ack_eliciting();
        assert!(!tracker.ack_immediately());
        tracker.add_packet_number(1);
        tracker.on_ack_eliciting();
        assert!(tracker.ack_immediately());
        tracker.on_ack_sent();
        assert!(!tracker.ack_immediately());
        assert!(!tracker.has_packets_to_ack());
    }
}
