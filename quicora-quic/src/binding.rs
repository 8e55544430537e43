//! Binding seam: the CID lookup table shared by every connection on a
//! local address, plus binding-scoped secrets and counters.
//!
//! The real datapath owns one of these per UDP socket. All mutation goes
//! through this API; connections never touch the table directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::crypto::RETRY_TOKEN_KEY_LENGTH;
use crate::types::{ConnectionId, StatelessResetToken, STATELESS_RESET_TOKEN_LENGTH};

/// Per-local-address binding state.
#[derive(Debug)]
pub struct BindingTable {
    /// Source CID -> connection correlation ID.
    lookup: Mutex<HashMap<ConnectionId, u64>>,
    /// Key for stateless-reset token derivation.
    reset_secret: [u8; 32],
    /// Key for retry-token sealing.
    retry_token_key: [u8; RETRY_TOKEN_KEY_LENGTH],
    /// Connections currently in handshake (atomic add on start/close).
    handshaking_connections: AtomicI64,
    /// Total connections attached to this binding.
    connections: AtomicI64,
}

impl BindingTable {
    pub fn new(reset_secret: [u8; 32], retry_token_key: [u8; RETRY_TOKEN_KEY_LENGTH]) -> Self {
        Self {
            lookup: Mutex::new(HashMap::new()),
            reset_secret,
            retry_token_key,
            handshaking_connections: AtomicI64::new(0),
            connections: AtomicI64::new(0),
        }
    }

    /// Register a source CID. Returns `false` on collision, leaving the
    /// existing registration untouched.
    pub fn add_source_cid(&self, cid: ConnectionId, correlation_id: u64) -> bool {
        let mut lookup = self.lookup.lock().unwrap();
        match lookup.entry(cid) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(correlation_id);
                true
            }
        }
    }

    pub fn remove_source_cid(&self, cid: &ConnectionId) {
        self.lookup.lock().unwrap().remove(cid);
    }

    /// Move every CID owned by `correlation_id` to another binding
    /// (local-address change).
    pub fn move_source_cids(&self, target: &BindingTable, correlation_id: u64) {
        let mut lookup = self.lookup.lock().unwrap();
        let moved: Vec<ConnectionId> = lookup
            .iter()
            .filter(|(_, &owner)| owner == correlation_id)
            .map(|(cid, _)| *cid)
            .collect();
        for cid in moved {
            lookup.remove(&cid);
            target.add_source_cid(cid, correlation_id);
        }
    }

    /// Resolve a destination CID from an incoming packet.
    pub fn lookup(&self, cid: &ConnectionId) -> Option<u64> {
        self.lookup.lock().unwrap().get(cid).copied()
    }

    /// Drop every registration owned by `correlation_id`.
    pub fn remove_connection(&self, correlation_id: u64) {
        self.lookup.lock().unwrap().retain(|_, &mut owner| owner != correlation_id);
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_connection_attached(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_handshake_started(&self) {
        self.handshaking_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_handshake_ended(&self) {
        self.handshaking_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshaking_connections(&self) -> i64 {
        self.handshaking_connections.load(Ordering::Relaxed)
    }

    /// Derive the stateless reset token for a CID this binding offered.
    pub fn generate_stateless_reset_token(&self, cid: &ConnectionId) -> StatelessResetToken {
        let mut state = 0xcbf2_9ce4_8422_2325u64;
        for chunk in [&self.reset_secret[..], cid.as_bytes()] {
            for byte in chunk {
                state ^= *byte as u64;
                state = state.wrapping_mul(0x1000_0000_01b3);
            }
        }
        let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        token[..8].copy_from_slice(&state.to_be_bytes());
        token[8..].copy_from_slice(
            &state.rotate_left(29).wrapping_mul(0x9e37_79b9_7f4a_7c15).to_be_bytes(),
        );
        token
    }

    pub fn retry_token_key(&self) -> &[u8; RETRY_TOKEN_KEY_LENGTH] {
        &self.retry_token_key
    }
}

impl Default for BindingTable {
    fn default() -> Self {
        let mut reset_secret = [0u8; 32];
        let mut retry_key = [0u8; RETRY_TOKEN_KEY_LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut reset_secret[..]);
        rand::Rng::fill(&mut rand::thread_rng(), &mut retry_key[..]);
        Self::new(reset_secret, retry_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    #[test]
    fn add_lookup_remove() {
        let binding = BindingTable::default();
        assert!(binding.add_source_cid(cid(&[1; 8]), 7));
        assert!(!binding.add_source_cid(cid(&[1; 8]), 8));
        assert_eq!(binding.lookup(&cid(&[1; 8])), Some(7));
        binding.remove_source_cid(&cid(&[1; 8]));
        assert_eq!(binding.lookup(&cid(&[1; 8])), None);
    }

    #[test]
    fn remove_connection_clears_all_cids() {
        let binding = BindingTable::default();
        binding.add_source_cid(cid(&[1; 8]), 7);
        binding.add_source_cid(cid(&[2; 8]), 7);
        binding.add_source_cid(cid(&[3; 8]), 9);
        binding.remove_connection(7);
        assert_eq!(binding.lookup(&cid(&[1; 8])), None);
        assert_eq!(binding.lookup(&cid(&[2; 8])), None);
        assert_eq!(binding.lookup(&cid(&[3; 8])), Some(9));
    }

    #[test]
    fn move_cids_between_bindings() {
        let old = BindingTable::default();
        let new = BindingTable::default();
        old.add_source_cid(cid(&[1; 8]), 7);
        old.add_source_cid(cid(&[2; 8]), 8);
        old.move_source_cids(&new, 7);
        assert_eq!(old.lookup(&cid(&[1; 8])), None);
        assert_eq!(old.lookup(&cid(&[2; 8])), Some(8));
        assert_eq!(new.lookup(&cid(&[1; 8])), Some(7));
    }

    #[test]
    fn reset_tokens_are_stable_per_cid_and_binding() {
        let binding = BindingTable::new([1u8; 32], [2u8; RETRY_TOKEN_KEY_LENGTH]);
        let token_a = binding.generate_stateless_reset_token(&cid(&[1; 8]));
        let token_b = binding.generate_stateless_reset_token(&cid(&[1; 8]));
        let token_c = binding.generate_stateless_reset_token(&cid(&[2; 8]));
        assert_eq!(token_a, token_b);
        assert_ne!(token_a, token_c);
        let other = BindingTable::new([9u8; 32], [2u8; RETRY_TOKEN_KEY_LENGTH]);
        assert_ne!(other.generate_stateless_reset_token(&cid(&[1; 8])), token_a);
    }

    #[test]
    fn handshake_counters() {
        let binding = BindingTable::default();
        binding.on_handshake_started();
        binding.on_handshake_started();
        binding.on_handshake_ended();
        assert_eq!(binding.handshaking_connections(), 1);
    }
}
