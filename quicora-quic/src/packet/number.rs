//! Packet number truncation and reconstruction (draft-23 Appendix A).

use crate::types::{PacketNumber, MAX_PACKET_NUMBER};

/// Reconstruct a full packet number from its truncated wire form.
///
/// `expected` is the next packet number the space expects to receive
/// (largest processed + 1); `pn_bits` is the truncated width in bits.
pub fn decompress(expected: PacketNumber, truncated: u32, pn_bits: usize) -> PacketNumber {
    let pn_win = 1u64 << pn_bits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated as u64;
    if candidate + pn_hwin <= expected && candidate + pn_win <= MAX_PACKET_NUMBER {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

/// Bytes needed to encode `full_pn` given the peer's largest-acked.
pub fn encoded_len(full_pn: PacketNumber, largest_acked: Option<PacketNumber>) -> usize {
    let num_unacked = match largest_acked {
        Some(acked) => full_pn.saturating_sub(acked),
        None => full_pn + 1,
    };
    if num_unacked < 1 << 7 {
        1
    } else if num_unacked < 1 << 15 {
        2
    } else if num_unacked < 1 << 23 {
        3
    } else {
        4
    }
}

/// Write the low `len` bytes of `full_pn` big-endian into `out`.
pub fn encode(full_pn: PacketNumber, len: usize, out: &mut [u8]) {
    debug_assert!((1..=4).contains(&len) && out.len() >= len);
    for i in 0..len {
        out[i] = (full_pn >> ((len - 1 - i) * 8)) as u8;
    }
}

/// Read a truncated packet number of `len` bytes from `buf`.
pub fn read_truncated(buf: &[u8], len: usize) -> Option<u32> {
    if buf.len() < len || !(1..=4).contains(&len) {
        return None;
    }
    let mut value = 0u32;
    for byte in &buf[..len] {
        value = (value << 8) | *byte as u32;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pn: PacketNumber, largest_acked: Option<PacketNumber>, expected: PacketNumber) {
        let len = encoded_len(pn, largest_acked);
        let mut buf = [0u8; 4];
        encode(pn, len, &mut buf);
        let truncated = read_truncated(&buf, len).unwrap();
        assert_eq!(decompress(expected, truncated, len * 8), pn);
    }

    #[test]
    fn decode_encode_round_trip() {
        round_trip(0, None, 0);
        round_trip(1, Some(0), 1);
        round_trip(0xff, Some(0xf0), 0x100);
        round_trip(0xa82f_30ea, Some(0xa82f_30e0), 0xa82f_9b32);
    }

    #[test]
    fn appendix_a_example() {
        // draft-23 A.3: expected 0xa82f30eb, 16-bit truncated 0x9b32.
        assert_eq!(decompress(0xa82f_30eb, 0x9b32, 16), 0xa82f_9b32);
    }

    #[test]
    fn wraps_forward_and_backward() {
        // Candidate far below the expected value reconstructs a window up.
        assert_eq!(decompress(0x1_00ff, 0x01, 8), 0x1_0101);
        // Candidate far above the expected value steps a window back.
        assert_eq!(decompress(0x100, 0xff, 8), 0xff);
    }

    #[test]
    fn encoded_len_grows_with_unacked_range() {
        assert_eq!(encoded_len(5, Some(4)), 1);
        assert_eq!(encoded_len(0x8000, Some(0)), 2);
        assert_eq!(encoded_len(0x80_0000, Some(0)), 3);
        assert_eq!(encoded_len(0x8000_0000, Some(0)), 4);
        assert_eq!(encoded_len(0, None), 1);
    }
}
