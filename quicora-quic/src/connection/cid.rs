//! Source and destination connection ID tables.
//!
//! Both lists are owned sequences; the binding holds back-references
//! (CID bytes -> correlation ID) that never extend an entry's lifetime.

use rand::RngCore;

use crate::binding::BindingTable;
use crate::error::Status;
use crate::types::{
    ConnectionId, StatelessResetToken, CONNECTION_ID_LENGTH, MAX_CID_COLLISION_RETRY,
};

/// A CID this endpoint offered to the peer.
#[derive(Debug, Clone)]
pub struct SourceCid {
    pub sequence: u64,
    pub cid: ConnectionId,
    /// Observed in the destination field of an incoming packet.
    pub used_by_peer: bool,
    /// Peer retired it; awaiting removal.
    pub retired: bool,
    /// The CID the handshake started with.
    pub is_initial: bool,
    /// A NEW_CONNECTION_ID frame for this entry still needs to go out.
    pub needs_send: bool,
}

/// A CID the peer offered to this endpoint.
#[derive(Debug, Clone)]
pub struct DestCid {
    pub sequence: u64,
    pub cid: ConnectionId,
    pub reset_token: Option<StatelessResetToken>,
    /// Locally rotated away; a RETIRE_CONNECTION_ID still needs to go out.
    pub retired: bool,
    pub needs_send: bool,
}

/// Both CID tables plus issuance counters.
#[derive(Debug, Default)]
pub struct CidTables {
    /// Ordered by issuance; the initial CID sits at the head.
    pub source: Vec<SourceCid>,
    /// Ordered by peer issuance.
    pub dest: Vec<DestCid>,
    pub next_source_sequence: u64,
}

impl CidTables {
    /// Generate, register, and record a fresh source CID.
    ///
    /// Collisions in the binding are retried a bounded number of times;
    /// exhaustion maps to an internal error.
    pub fn generate_source_cid(
        &mut self,
        binding: &BindingTable,
        correlation_id: u64,
        is_initial: bool,
    ) -> Result<&SourceCid, Status> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CID_COLLISION_RETRY {
            let mut bytes = [0u8; CONNECTION_ID_LENGTH];
            rng.fill_bytes(&mut bytes);
            let cid = ConnectionId::from_slice(&bytes).unwrap();
            if !binding.add_source_cid(cid, correlation_id) {
                continue;
            }
            let sequence = self.next_source_sequence;
            self.next_source_sequence += 1;
            let entry = SourceCid {
                sequence,
                cid,
                used_by_peer: false,
                retired: false,
                is_initial,
                needs_send: sequence > 0,
            };
            if is_initial {
                self.source.insert(0, entry);
                return Ok(&self.source[0]);
            }
            self.source.push(entry);
            return Ok(self.source.last().unwrap());
        }
        Err(Status::InternalError)
    }

    pub fn find_source_by_cid(&mut self, cid: &ConnectionId) -> Option<&mut SourceCid> {
        self.source.iter_mut().find(|entry| entry.cid == *cid)
    }

    /// Remove a peer-retired source CID by sequence number, unhooking it
    /// from the binding. `None` if the sequence is unknown.
    pub fn retire_source_by_sequence(
        &mut self,
        binding: &BindingTable,
        sequence: u64,
    ) -> Option<SourceCid> {
        let index = self.source.iter().position(|entry| entry.sequence == sequence)?;
        let entry = self.source.remove(index);
        binding.remove_source_cid(&entry.cid);
        Some(entry)
    }

    /// The destination CID packets are currently sent to.
    pub fn current_dest(&self) -> Option<&DestCid> {
        self.dest.iter().find(|entry| !entry.retired)
    }

    /// Record the peer's first CID (from an Initial or Retry packet).
    pub fn set_initial_dest(&mut self, cid: ConnectionId) {
        self.dest.clear();
        self.dest.push(DestCid {
            sequence: 0,
            cid,
            reset_token: None,
            retired: false,
            needs_send: false,
        });
    }

    /// Append a peer-issued CID from NEW_CONNECTION_ID.
    pub fn add_dest_cid(&mut self, sequence: u64, cid: ConnectionId, token: StatelessResetToken) {
        if self.dest.iter().any(|entry| entry.sequence == sequence) {
            return; // retransmitted frame
        }
        self.dest.push(DestCid {
            sequence,
            cid,
            reset_token: Some(token),
            retired: false,
            needs_send: false,
        });
    }

    /// Rotate away from the current destination CID. Returns `false`
    /// when no unretired replacement exists.
    pub fn retire_current_dest(&mut self) -> bool {
        let Some(index) = self.dest.iter().position(|entry| !entry.retired) else {
            return false;
        };
        if !self.dest.iter().skip(index + 1).any(|entry| !entry.retired) {
            return false;
        }
        let entry = &mut self.dest[index];
        entry.retired = true;
        entry.needs_send = true;
        true
    }

    /// Replace the current destination CID in place (client reacting to
    /// the server-chosen CID in its first Initial, or to a Retry).
    pub fn update_dest_cid(&mut self, cid: ConnectionId) {
        match self.dest.iter_mut().find(|entry| !entry.retired) {
            Some(entry) => entry.cid = cid,
            None => self.set_initial_dest(cid),
        }
    }

    /// Store the peer's stateless reset token on the current dest CID.
    pub fn set_current_dest_reset_token(&mut self, token: StatelessResetToken) {
        if let Some(entry) = self.dest.iter_mut().find(|entry| !entry.retired) {
            entry.reset_token = Some(token);
        }
    }

    /// Match a suspected stateless-reset token against every stored
    /// destination token.
    pub fn matches_reset_token(&self, token: &StatelessResetToken) -> bool {
        self.dest
            .iter()
            .any(|entry| entry.reset_token.as_ref() == Some(token))
    }

    pub fn dest_count(&self) -> usize {
        self.dest.len()
    }

    /// Drop every source registration (teardown).
    pub fn unregister_all(&mut self, binding: &BindingTable) {
        for entry in self.source.drain(..) {
            binding.remove_source_cid(&entry.cid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    #[test]
    fn generated_cid_registers_and_resolves() {
        let binding = BindingTable::default();
        let mut tables = CidTables::default();
        let generated = tables.generate_source_cid(&binding, 42, true).unwrap().cid;
        assert_eq!(generated.len(), CONNECTION_ID_LENGTH);
        assert_eq!(binding.lookup(&generated), Some(42));
        assert!(!tables.source[0].needs_send);
    }

    #[test]
    fn sequences_increase_and_non_initial_goes_to_tail() {
        let binding = BindingTable::default();
        let mut tables = CidTables::default();
        tables.generate_source_cid(&binding, 1, true).unwrap();
        let second = tables.generate_source_cid(&binding, 1, false).unwrap();
        assert_eq!(second.sequence, 1);
        assert!(second.needs_send);
        assert_eq!(tables.source[0].sequence, 0);
        assert_eq!(tables.source[1].sequence, 1);
    }

    #[test]
    fn retire_source_unhooks_binding() {
        let binding = BindingTable::default();
        let mut tables = CidTables::default();
        tables.generate_source_cid(&binding, 1, true).unwrap();
        let second = tables.generate_source_cid(&binding, 1, false).unwrap().cid;
        let removed = tables.retire_source_by_sequence(&binding, 1).unwrap();
        assert_eq!(removed.cid, second);
        assert_eq!(binding.lookup(&second), None);
        assert!(tables.retire_source_by_sequence(&binding, 9).is_none());
    }

    #[test]
    fn dest_rotation_requires_spare() {
        let mut tables = CidTables::default();
        tables.set_initial_dest(cid(&[1; 8]));
        assert!(!tables.retire_current_dest());
        tables.add_dest_cid(1, cid(&[2; 8]), [9u8; 16]);
        assert!(tables.retire_current_dest());
        assert_eq!(tables.current_dest().unwrap().cid, cid(&[2; 8]));
        assert!(tables.dest[0].needs_send);
    }

    #[test]
    fn duplicate_dest_sequence_is_ignored() {
        let mut tables = CidTables::default();
        tables.set_initial_dest(cid(&[1; 8]));
        tables.add_dest_cid(1, cid(&[2; 8]), [0u8; 16]);
        tables.add_dest_cid(1, cid(&[3; 8]), [0u8; 16]);
        assert_eq!(tables.dest_count(), 2);
    }

    #[test]
    fn reset_token_matching() {
        let mut tables = CidTables::default();
        tables.set_initial_dest(cid(&[1; 8]));
        tables.set_current_dest_reset_token([5u8; 16]);
        assert!(tables.matches_reset_token(&[5u8; 16]));
        assert!(!tables.matches_reset_token(&[6u8; 16]));
    }
}
