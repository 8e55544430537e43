//! Deterministic TLS engine and cipher backend for tests.
//!
//! Implements the [`TlsEngine`] and [`PacketProtection`] contracts with a
//! scripted two-flight handshake and a keyed-checksum "AEAD". Key material
//! is derived deterministically from the initial destination CID, so two
//! endpoints sharing it agree on every key without exchanging secrets.
//! Nothing here is cryptographically secure.

use crate::crypto::{
    EncryptionLevel, KeyDirection, PacketKeys, PacketProtection, TlsEngine, TlsOutput,
    ENCRYPTION_OVERHEAD, IV_LENGTH,
};
use crate::error::{Status, TransportError};
use crate::types::{ConnectionId, Side};

// Message tags for the scripted handshake.
const TAG_CLIENT_HELLO: &[u8; 4] = b"QCH1";
const TAG_SERVER_HELLO: &[u8; 4] = b"QSH1";
const TAG_ENCRYPTED_EXT: &[u8; 4] = b"QEE1";
const TAG_FINISHED: &[u8; 4] = b"QFN1";

fn fnv_stream(seed: &[&[u8]], out: &mut [u8]) {
    let mut state = 0xcbf2_9ce4_8422_2325u64;
    for part in seed {
        for byte in *part {
            state ^= *byte as u64;
            state = state.wrapping_mul(0x1000_0000_01b3);
        }
    }
    for (i, byte) in out.iter_mut().enumerate() {
        if i % 8 == 0 {
            state ^= i as u64 + 1;
            state = state.wrapping_mul(0x1000_0000_01b3);
        }
        *byte = (state >> ((i % 8) * 8)) as u8;
    }
}

fn derive_keys(label: &[u8], context: &[u8], phase: u8, writer: Side) -> PacketKeys {
    let writer_label: &[u8] = match writer {
        Side::Client => b"client",
        Side::Server => b"server",
    };
    let mut packet_key = vec![0u8; 16];
    fnv_stream(&[label, context, &[phase], writer_label, b"key"], &mut packet_key);
    let mut header_key = vec![0u8; 16];
    fnv_stream(&[label, context, &[phase], writer_label, b"hp"], &mut header_key);
    let mut iv = [0u8; IV_LENGTH];
    fnv_stream(&[label, context, &[phase], writer_label, b"iv"], &mut iv);
    PacketKeys { packet_key, header_key, iv }
}

/// Keyed-checksum cipher backend. The "ciphertext" is the plaintext; the
/// appended tag binds key, nonce, header, and payload.
#[derive(Debug, Default, Clone)]
pub struct NullProtection;

impl NullProtection {
    fn tag(keys: &PacketKeys, pn: u64, header: &[u8], payload: &[u8]) -> [u8; ENCRYPTION_OVERHEAD] {
        let nonce = super::combine_iv_and_packet_number(&keys.iv, pn);
        let mut tag = [0u8; ENCRYPTION_OVERHEAD];
        fnv_stream(&[&keys.packet_key, &nonce, header, payload], &mut tag);
        tag
    }
}

impl PacketProtection for NullProtection {
    fn hp_mask(&self, header_key: &[u8], sample: &[u8; 16]) -> [u8; 5] {
        let mut mask = [0u8; 5];
        fnv_stream(&[header_key, sample], &mut mask);
        mask
    }

    fn seal(&self, keys: &PacketKeys, pn: u64, header: &[u8], payload: &mut Vec<u8>) {
        let tag = Self::tag(keys, pn, header, payload);
        payload.extend_from_slice(&tag);
    }

    fn open(
        &self,
        keys: &PacketKeys,
        pn: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, ()> {
        if payload.len() < ENCRYPTION_OVERHEAD {
            return Err(());
        }
        let plain_len = payload.len() - ENCRYPTION_OVERHEAD;
        let tag = Self::tag(keys, pn, header, &payload[..plain_len]);
        if payload[plain_len..] != tag {
            return Err(());
        }
        Ok(plain_len)
    }
}

/// Scripted handshake engine.
///
/// Flights: client `CH(tp)` at Initial; server `SH` at Initial plus
/// `EE(tp[, ticket])` at Handshake; client `FIN` at Handshake. Handshake
/// and 1-RTT keys derive from the initial destination CID recorded at
/// `initial_keys` time.
pub struct NullTlsEngine {
    side: Side,
    protection: NullProtection,
    context: Vec<u8>,
    local_tp: Option<Vec<u8>>,
    configured: bool,
    key_phase_counter: u8,
    issue_ticket: Option<Vec<u8>>,
    inbuf: [Vec<u8>; 2],
}

impl NullTlsEngine {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            protection: NullProtection,
            context: Vec::new(),
            local_tp: None,
            configured: false,
            key_phase_counter: 0,
            issue_ticket: None,
            inbuf: [Vec::new(), Vec::new()],
        }
    }

    /// Server variant that hands the client a resumption ticket.
    pub fn with_ticket(side: Side, ticket: Vec<u8>) -> Self {
        let mut engine = Self::new(side);
        engine.issue_ticket = Some(ticket);
        engine
    }

    fn peer(&self) -> Side {
        match self.side {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    fn level_keys(&self, label: &[u8], writer: Side) -> PacketKeys {
        derive_keys(label, &self.context, 0, writer)
    }

    fn install_level(&self, label: &[u8], level: EncryptionLevel, out: &mut TlsOutput) {
        out.keys.push((KeyDirection::Read, level, self.level_keys(label, self.peer())));
        out.keys.push((KeyDirection::Write, level, self.level_keys(label, self.side)));
    }

    /// Split complete `tag | len:u16 | body` messages out of the buffer.
    fn take_messages(&mut self, level: EncryptionLevel) -> Result<Vec<([u8; 4], Vec<u8>)>, TransportError> {
        let buf_index = match level {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            _ => return Err(TransportError::ProtocolViolation),
        };
        let buf = &mut self.inbuf[buf_index];
        let mut messages = Vec::new();
        loop {
            if buf.len() < 6 {
                break;
            }
            let len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            if buf.len() < 6 + len {
                break;
            }
            let mut tag = [0u8; 4];
            tag.copy_from_slice(&buf[..4]);
            let body = buf[6..6 + len].to_vec();
            buf.drain(..6 + len);
            messages.push((tag, body));
        }
        Ok(messages)
    }
}

fn message(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + body.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

impl TlsEngine for NullTlsEngine {
    fn initial_keys(&mut self, dcid: &ConnectionId, side: Side) -> (PacketKeys, PacketKeys) {
        self.context = dcid.as_bytes().to_vec();
        let read = derive_keys(b"initial", &self.context, 0, match side {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        });
        let write = derive_keys(b"initial", &self.context, 0, side);
        (read, write)
    }

    fn start_client(&mut self, transport_params: &[u8], out: &mut TlsOutput) -> Result<(), Status> {
        if self.side.is_server() {
            return Err(Status::InvalidState);
        }
        self.local_tp = Some(transport_params.to_vec());
        out.data
            .push((EncryptionLevel::Initial, message(TAG_CLIENT_HELLO, transport_params)));
        Ok(())
    }

    fn configure_server(&mut self, transport_params: &[u8]) -> Result<(), Status> {
        if self.side.is_client() || self.configured {
            return Err(Status::InvalidState);
        }
        self.local_tp = Some(transport_params.to_vec());
        self.configured = true;
        Ok(())
    }

    fn process_data(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
        out: &mut TlsOutput,
    ) -> Result<(), TransportError> {
        let buf_index = match level {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            _ => return Err(TransportError::ProtocolViolation),
        };
        self.inbuf[buf_index].extend_from_slice(data);

        for (tag, body) in self.take_messages(level)? {
            match (&tag, self.side) {
                (TAG_CLIENT_HELLO, Side::Server) => {
                    if !self.configured {
                        return Err(TransportError::InternalError);
                    }
                    out.peer_transport_params = Some(body);
                    out.data.push((EncryptionLevel::Initial, message(TAG_SERVER_HELLO, b"")));
                    self.install_level(b"handshake", EncryptionLevel::Handshake, out);
                    let mut ee = self.local_tp.clone().unwrap_or_default();
                    let ee = {
                        let mut framed = (ee.len() as u16).to_be_bytes().to_vec();
                        framed.append(&mut ee);
                        if let Some(ticket) = &self.issue_ticket {
                            framed.extend_from_slice(ticket);
                        }
                        framed
                    };
                    out.data.push((EncryptionLevel::Handshake, message(TAG_ENCRYPTED_EXT, &ee)));
                    self.install_level(b"1rtt", EncryptionLevel::OneRtt, out);
                }
                (TAG_SERVER_HELLO, Side::Client) => {
                    self.install_level(b"handshake", EncryptionLevel::Handshake, out);
                }
                (TAG_ENCRYPTED_EXT, Side::Client) => {
                    if body.len() < 2 {
                        return Err(TransportError::Crypto(0x32));
                    }
                    let tp_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    if body.len() < 2 + tp_len {
                        return Err(TransportError::Crypto(0x32));
                    }
                    out.peer_transport_params = Some(body[2..2 + tp_len].to_vec());
                    if body.len() > 2 + tp_len {
                        out.ticket = Some(body[2 + tp_len..].to_vec());
                    }
                    self.install_level(b"1rtt", EncryptionLevel::OneRtt, out);
                    out.data.push((EncryptionLevel::Handshake, message(TAG_FINISHED, b"")));
                    out.handshake_complete = true;
                }
                (TAG_FINISHED, Side::Server) => {
                    out.handshake_complete = true;
                }
                _ => return Err(TransportError::Crypto(0x0a)),
            }
        }
        Ok(())
    }

    fn restart(&mut self) {
        self.inbuf = [Vec::new(), Vec::new()];
        self.key_phase_counter = 0;
    }

    fn next_key_phase_keys(&mut self) -> Option<(PacketKeys, PacketKeys)> {
        self.key_phase_counter = self.key_phase_counter.checked_add(1)?;
        let read = derive_keys(b"1rtt", &self.context, self.key_phase_counter, self.peer());
        let write = derive_keys(b"1rtt", &self.context, self.key_phase_counter, self.side);
        Some((read, write))
    }

    fn protection(&self) -> &dyn PacketProtection {
        &self.protection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HP_SAMPLE_LENGTH;

    #[test]
    fn derivation_is_deterministic_and_side_mirrored() {
        let dcid = ConnectionId::from_slice(&[9; 8]).unwrap();
        let mut client = NullTlsEngine::new(Side::Client);
        let mut server = NullTlsEngine::new(Side::Server);
        let (client_read, client_write) = client.initial_keys(&dcid, Side::Client);
        let (server_read, server_write) = server.initial_keys(&dcid, Side::Server);
        assert_eq!(client_read, server_write);
        assert_eq!(client_write, server_read);
        assert_ne!(client_read, client_write);
    }

    #[test]
    fn seal_open_round_trip_and_tamper_detection() {
        let keys = derive_keys(b"initial", b"ctx", 0, Side::Client);
        let protection = NullProtection;
        let header = [0x40u8, 1, 2, 3];
        let mut payload = b"hello".to_vec();
        protection.seal(&keys, 7, &header, &mut payload);
        assert_eq!(payload.len(), 5 + ENCRYPTION_OVERHEAD);

        let mut good = payload.clone();
        assert_eq!(protection.open(&keys, 7, &header, &mut good), Ok(5));

        let mut bad_pn = payload.clone();
        assert!(protection.open(&keys, 8, &header, &mut bad_pn).is_err());

        payload[0] ^= 0x01;
        assert!(protection.open(&keys, 7, &header, &mut payload).is_err());
    }

    #[test]
    fn hp_mask_depends_on_sample() {
        let protection = NullProtection;
        let key = [3u8; 16];
        let mask_a = protection.hp_mask(&key, &[0u8; HP_SAMPLE_LENGTH]);
        let mask_b = protection.hp_mask(&key, &[1u8; HP_SAMPLE_LENGTH]);
        assert_ne!(mask_a, mask_b);
    }

    #[test]
    fn scripted_handshake_completes() {
        let dcid = ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut client = NullTlsEngine::new(Side::Client);
        let mut server = NullTlsEngine::new(Side::Server);
        client.initial_keys(&dcid, Side::Client);
        server.initial_keys(&dcid, Side::Server);
        server.configure_server(b"server-tp").unwrap();

        let mut flight1 = TlsOutput::default();
        client.start_client(b"client-tp", &mut flight1).unwrap();
        assert_eq!(flight1.data.len(), 1);

        let mut server_out = TlsOutput::default();
        server
            .process_data(EncryptionLevel::Initial, &flight1.data[0].1, &mut server_out)
            .unwrap();
        assert_eq!(server_out.peer_transport_params.as_deref(), Some(&b"client-tp"[..]));
        assert!(!server_out.handshake_complete);
        assert_eq!(server_out.data.len(), 2);
        assert_eq!(server_out.keys.len(), 4);

        let mut client_out = TlsOutput::default();
        for (level, data) in &server_out.data {
            client.process_data(*level, data, &mut client_out).unwrap();
        }
        assert!(client_out.handshake_complete);
        assert_eq!(client_out.peer_transport_params.as_deref(), Some(&b"server-tp"[..]));
        let fin = client_out
            .data
            .iter()
            .find(|(level, _)| *level == EncryptionLevel::Handshake)
            .unwrap();

        let mut server_fin = TlsOutput::default();
        server.process_data(EncryptionLevel::Handshake, &fin.1, &mut server_fin).unwrap();
        assert!(server_fin.handshake_complete);
    }

    #[test]
    fn key_phase_derivation_advances_in_step() {
        let dcid = ConnectionId::from_slice(&[5; 8]).unwrap();
        let mut client = NullTlsEngine::new(Side::Client);
        let mut server = NullTlsEngine::new(Side::Server);
        client.initial_keys(&dcid, Side::Client);
        server.initial_keys(&dcid, Side::Server);

        let (client_read, client_write) = client.next_key_phase_keys().unwrap();
        let (server_read, server_write) = server.next_key_phase_keys().unwrap();
        assert_eq!(client_read, server_write);
        assert_eq!(client_write, server_read);
    }
}
