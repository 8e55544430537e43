//! Cryptographic contracts: the TLS engine, packet-protection keys, and
//! the handshake-byte plumbing between CRYPTO frames and the engine.
//!
//! The core never implements a cipher. It drives a pluggable [`TlsEngine`]
//! that produces handshake bytes and derives packet-protection key
//! material, and a [`PacketProtection`] backend that performs AEAD and
//! header-protection operations with that material. [`null`] provides a
//! deterministic backend for tests.

pub mod null;

use std::collections::BTreeMap;

use crate::error::{Status, TransportError};
use crate::types::{ConnectionId, Side};

// ============================================================================
// Key types and encryption levels
// ============================================================================

/// Read/write key slots, ordered by handshake progression. The 1-RTT
/// old/new slots exist only around a key-phase update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyType {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
    /// Previous-phase 1-RTT key, kept until the update is confirmed.
    OneRttOld = 4,
    /// Next-phase 1-RTT key, derived speculatively on a phase flip.
    OneRttNew = 5,
}

/// Number of key slots.
pub const KEY_TYPE_COUNT: usize = 6;

/// Encryption levels, one packet space each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncryptionLevel {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

/// Number of encryption levels / packet spaces.
pub const ENCRYPT_LEVEL_COUNT: usize = 4;

impl KeyType {
    pub fn encrypt_level(self) -> EncryptionLevel {
        match self {
            KeyType::Initial => EncryptionLevel::Initial,
            KeyType::ZeroRtt => EncryptionLevel::ZeroRtt,
            KeyType::Handshake => EncryptionLevel::Handshake,
            KeyType::OneRtt | KeyType::OneRttOld | KeyType::OneRttNew => EncryptionLevel::OneRtt,
        }
    }
}

impl EncryptionLevel {
    pub fn key_type(self) -> KeyType {
        match self {
            EncryptionLevel::Initial => KeyType::Initial,
            EncryptionLevel::ZeroRtt => KeyType::ZeroRtt,
            EncryptionLevel::Handshake => KeyType::Handshake,
            EncryptionLevel::OneRtt => KeyType::OneRtt,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(EncryptionLevel::Initial),
            1 => Some(EncryptionLevel::ZeroRtt),
            2 => Some(EncryptionLevel::Handshake),
            3 => Some(EncryptionLevel::OneRtt),
            _ => None,
        }
    }
}

// ============================================================================
// Key material
// ============================================================================

/// AEAD overhead appended to every protected payload.
pub const ENCRYPTION_OVERHEAD: usize = 16;

/// Nonce length.
pub const IV_LENGTH: usize = 12;

/// Header-protection sample length.
pub const HP_SAMPLE_LENGTH: usize = 16;

/// One direction's packet-protection material for a single key slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketKeys {
    /// Opaque AEAD key, interpreted only by the protection backend.
    pub packet_key: Vec<u8>,
    /// Header-protection key.
    pub header_key: Vec<u8>,
    /// Static IV combined with the packet number per packet.
    pub iv: [u8; IV_LENGTH],
}

/// XOR the packet number into the static IV (draft-23 Section 5.3).
pub fn combine_iv_and_packet_number(iv: &[u8; IV_LENGTH], pn: u64) -> [u8; IV_LENGTH] {
    let mut nonce = *iv;
    let pn_bytes = pn.to_be_bytes();
    for i in 0..8 {
        nonce[IV_LENGTH - 8 + i] ^= pn_bytes[i];
    }
    nonce
}

/// Cipher backend performing AEAD and header-protection operations.
pub trait PacketProtection: Send {
    /// Compute the 5-byte header-protection mask from a 16-byte sample.
    fn hp_mask(&self, header_key: &[u8], sample: &[u8; HP_SAMPLE_LENGTH]) -> [u8; 5];

    /// Protect `payload` in place, appending the authentication tag.
    fn seal(&self, keys: &PacketKeys, pn: u64, header: &[u8], payload: &mut Vec<u8>);

    /// Authenticate and decrypt `payload` (which includes the tag).
    ///
    /// Returns the plaintext length, or `Err(())` on authentication
    /// failure. The payload contents are unspecified after a failure.
    fn open(&self, keys: &PacketKeys, pn: u64, header: &[u8], payload: &mut [u8])
        -> Result<usize, ()>;
}

// ============================================================================
// TLS engine contract
// ============================================================================

/// Key install direction, from this endpoint's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Read,
    Write,
}

/// Everything a `TlsEngine` call may produce.
#[derive(Debug, Default)]
pub struct TlsOutput {
    /// Handshake bytes to transmit, per level, in emission order.
    pub data: Vec<(EncryptionLevel, Vec<u8>)>,
    /// Newly derived key material to install.
    pub keys: Vec<(KeyDirection, EncryptionLevel, PacketKeys)>,
    /// Set once the TLS handshake has finished.
    pub handshake_complete: bool,
    /// The peer's encoded transport parameters, once seen.
    pub peer_transport_params: Option<Vec<u8>>,
    /// An opaque resumption ticket issued by the peer (client side).
    pub ticket: Option<Vec<u8>>,
}

/// The external TLS engine.
///
/// Implementations own all secret state. The connection core feeds
/// ordered handshake bytes in and installs whatever keys come out.
pub trait TlsEngine: Send {
    /// Derive Initial packet-protection keys from a destination CID.
    /// Returns `(read, write)` keys for this endpoint's side. Called at
    /// connection start and again after a Retry changes the CID.
    fn initial_keys(&mut self, dcid: &ConnectionId, side: Side) -> (PacketKeys, PacketKeys);

    /// Begin a client handshake, emitting the first flight.
    /// `transport_params` is this endpoint's encoded TP blob.
    fn start_client(&mut self, transport_params: &[u8], out: &mut TlsOutput)
        -> Result<(), Status>;

    /// Install the server-side configuration and local TPs. Until this
    /// is called a server connection cannot process handshake bytes.
    fn configure_server(&mut self, transport_params: &[u8]) -> Result<(), Status>;

    /// Consume ordered handshake bytes received at `level`.
    fn process_data(&mut self, level: EncryptionLevel, data: &[u8], out: &mut TlsOutput)
        -> Result<(), TransportError>;

    /// Drop all handshake progress so the handshake can run again
    /// (client restart after a Retry).
    fn restart(&mut self);

    /// Derive the next key-phase 1-RTT `(read, write)` keys.
    fn next_key_phase_keys(&mut self) -> Option<(PacketKeys, PacketKeys)>;

    /// The cipher backend paired with this engine's key material.
    fn protection(&self) -> &dyn PacketProtection;
}

// ============================================================================
// Crypto state owned by the connection
// ============================================================================

/// Bytes of out-of-order CRYPTO data buffered per level before the
/// connection gives up on reassembly.
const MAX_CRYPTO_BUFFER: usize = 64 * 1024;

/// In-order reassembly for one level's CRYPTO stream.
#[derive(Debug, Default)]
struct CryptoRecvBuffer {
    next_offset: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    buffered: usize,
}

impl CryptoRecvBuffer {
    /// Insert a segment; drain and return the in-order prefix.
    fn push(&mut self, offset: u64, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        if offset.saturating_add(data.len() as u64) <= self.next_offset {
            return Ok(Vec::new()); // wholly retransmitted
        }
        if self.buffered + data.len() > MAX_CRYPTO_BUFFER {
            return Err(TransportError::InternalError);
        }
        self.buffered += data.len();
        if let Some(replaced) = self.pending.insert(offset, data.to_vec()) {
            self.buffered -= replaced.len();
        }

        let mut ready = Vec::new();
        while let Some(&offset) = self.pending.keys().next() {
            if offset > self.next_offset {
                break;
            }
            let segment = self.pending.remove(&offset).unwrap();
            self.buffered -= segment.len();
            let skip = (self.next_offset - offset) as usize;
            if skip < segment.len() {
                ready.extend_from_slice(&segment[skip..]);
                self.next_offset = offset + segment.len() as u64;
            }
        }
        Ok(ready)
    }
}

/// Handshake state container: the engine, installed keys, reassembly
/// buffers, and outbound handshake bytes awaiting a flush.
pub struct Crypto {
    engine: Box<dyn TlsEngine>,
    read_keys: [Option<PacketKeys>; KEY_TYPE_COUNT],
    write_keys: [Option<PacketKeys>; KEY_TYPE_COUNT],
    /// Highest level for which a read key was ever installed.
    read_key_level: EncryptionLevel,
    recv_buffers: [CryptoRecvBuffer; ENCRYPT_LEVEL_COUNT],
    /// Outbound handshake bytes per level, drained by flush-send.
    send_pending: Vec<(EncryptionLevel, Vec<u8>)>,
    /// Next CRYPTO-stream send offset per level.
    send_offsets: [u64; ENCRYPT_LEVEL_COUNT],
    handshake_complete: bool,
    peer_transport_params: Option<Vec<u8>>,
    ticket: Option<Vec<u8>>,
    /// Set while a locally-initiated key update awaits peer confirmation.
    pub awaiting_key_phase_confirmation: bool,
    /// The engine can accept handshake bytes (client started, or server
    /// configuration installed). Until then in-order bytes are held.
    engine_ready: bool,
    held: [Vec<u8>; ENCRYPT_LEVEL_COUNT],
}

impl Crypto {
    pub fn new(engine: Box<dyn TlsEngine>) -> Self {
        Self {
            engine,
            read_keys: Default::default(),
            write_keys: Default::default(),
            read_key_level: EncryptionLevel::Initial,
            recv_buffers: Default::default(),
            send_pending: Vec::new(),
            send_offsets: [0; ENCRYPT_LEVEL_COUNT],
            handshake_complete: false,
            peer_transport_params: None,
            ticket: None,
            awaiting_key_phase_confirmation: false,
            engine_ready: false,
            held: Default::default(),
        }
    }

    /// Drop all handshake and key state for a handshake restart.
    pub fn restart(&mut self) {
        self.engine.restart();
        self.read_keys = Default::default();
        self.write_keys = Default::default();
        self.read_key_level = EncryptionLevel::Initial;
        self.recv_buffers = Default::default();
        self.send_pending.clear();
        self.send_offsets = [0; ENCRYPT_LEVEL_COUNT];
        self.handshake_complete = false;
        self.peer_transport_params = None;
        self.awaiting_key_phase_confirmation = false;
        self.engine_ready = false;
        self.held = Default::default();
    }

    /// (Re)derive Initial keys from `dcid`. Called at start and after
    /// a Retry rewrites the destination CID.
    pub fn install_initial_keys(&mut self, dcid: &ConnectionId, side: Side) {
        let (read, write) = self.engine.initial_keys(dcid, side);
        self.read_keys[KeyType::Initial as usize] = Some(read);
        self.write_keys[KeyType::Initial as usize] = Some(write);
    }

    pub fn start_client(&mut self, transport_params: &[u8]) -> Result<(), Status> {
        let mut out = TlsOutput::default();
        self.engine.start_client(transport_params, &mut out)?;
        self.engine_ready = true;
        self.absorb(out);
        self.replay_held()
    }

    /// Install the server configuration and feed it any handshake bytes
    /// that arrived before it.
    pub fn configure_server(&mut self, transport_params: &[u8]) -> Result<(), Status> {
        self.engine.configure_server(transport_params)?;
        self.engine_ready = true;
        self.replay_held()
    }

    fn replay_held(&mut self) -> Result<(), Status> {
        let held = std::mem::take(&mut self.held);
        for (index, bytes) in held.into_iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let level = EncryptionLevel::from_index(index).unwrap();
            let mut out = TlsOutput::default();
            self.engine
                .process_data(level, &bytes, &mut out)
                .map_err(|_| Status::InternalError)?;
            self.absorb(out);
        }
        Ok(())
    }

    /// Feed one CRYPTO frame's bytes through reassembly into the engine.
    pub fn process_frame(
        &mut self,
        level: EncryptionLevel,
        offset: u64,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let ready = self.recv_buffers[level as usize].push(offset, data)?;
        if ready.is_empty() {
            return Ok(());
        }
        if !self.engine_ready {
            // Server connections hold handshake bytes until the
            // application installs the security configuration.
            self.held[level as usize].extend_from_slice(&ready);
            return Ok(());
        }
        let mut out = TlsOutput::default();
        self.engine.process_data(level, &ready, &mut out)?;
        self.absorb(out);
        Ok(())
    }

    fn absorb(&mut self, out: TlsOutput) {
        for (direction, level, keys) in out.keys {
            let slot = level.key_type() as usize;
            match direction {
                KeyDirection::Read => {
                    self.read_keys[slot] = Some(keys);
                    if level > self.read_key_level {
                        self.read_key_level = level;
                    }
                }
                KeyDirection::Write => self.write_keys[slot] = Some(keys),
            }
        }
        self.send_pending.extend(out.data);
        if out.handshake_complete {
            self.handshake_complete = true;
        }
        if out.peer_transport_params.is_some() {
            self.peer_transport_params = out.peer_transport_params;
        }
        if out.ticket.is_some() {
            self.ticket = out.ticket;
        }
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// Take the peer's TP blob the first time it becomes available.
    pub fn take_peer_transport_params(&mut self) -> Option<Vec<u8>> {
        self.peer_transport_params.take()
    }

    pub fn ticket(&self) -> Option<&[u8]> {
        self.ticket.as_deref()
    }

    /// Outbound handshake bytes waiting to be packetized.
    pub fn has_pending_send(&self) -> bool {
        !self.send_pending.is_empty()
    }

    pub fn has_pending_send_at(&self, level: EncryptionLevel) -> bool {
        self.send_pending.iter().any(|(l, _)| *l == level)
    }

    /// Take every pending handshake byte for `level`, returning the
    /// CRYPTO-stream offset it starts at.
    pub fn take_pending_send_at(&mut self, level: EncryptionLevel) -> Option<(u64, Vec<u8>)> {
        let mut data = Vec::new();
        self.send_pending.retain(|(l, bytes)| {
            if *l == level {
                data.extend_from_slice(bytes);
                false
            } else {
                true
            }
        });
        if data.is_empty() {
            return None;
        }
        let offset = self.send_offsets[level as usize];
        self.send_offsets[level as usize] += data.len() as u64;
        Some((offset, data))
    }

    pub fn read_key(&self, key_type: KeyType) -> Option<&PacketKeys> {
        self.read_keys[key_type as usize].as_ref()
    }

    pub fn write_key(&self, key_type: KeyType) -> Option<&PacketKeys> {
        self.write_keys[key_type as usize].as_ref()
    }

    /// Highest level for which read keys were installed. A packet whose
    /// key type is above this level may still become decryptable.
    pub fn read_key_level(&self) -> EncryptionLevel {
        self.read_key_level
    }

    /// Highest level currently usable for sending.
    pub fn write_key_level(&self) -> EncryptionLevel {
        if self.write_keys[KeyType::OneRtt as usize].is_some() {
            EncryptionLevel::OneRtt
        } else if self.write_keys[KeyType::Handshake as usize].is_some() {
            EncryptionLevel::Handshake
        } else {
            EncryptionLevel::Initial
        }
    }

    /// Discard all key material for `level` (draft-23 Section 4.9).
    pub fn discard_keys(&mut self, level: EncryptionLevel) {
        let slot = level.key_type() as usize;
        self.read_keys[slot] = None;
        self.write_keys[slot] = None;
    }

    /// Whether keys for `level` were discarded after having existed.
    pub fn keys_discarded(&self, level: EncryptionLevel) -> bool {
        self.read_key_level > level && self.read_keys[level.key_type() as usize].is_none()
    }

    /// Derive next-phase 1-RTT keys into the `OneRttNew` slots.
    pub fn prepare_key_update(&mut self) -> Result<(), Status> {
        let (read, write) = self
            .engine
            .next_key_phase_keys()
            .ok_or(Status::InvalidState)?;
        self.read_keys[KeyType::OneRttNew as usize] = Some(read);
        self.write_keys[KeyType::OneRttNew as usize] = Some(write);
        Ok(())
    }

    /// Commit a key-phase change: current keys become old, the prepared
    /// new keys become current. `local` marks a locally-initiated update
    /// that must await confirmation before the next one.
    pub fn update_key_phase(&mut self, local: bool) {
        let current_r = self.read_keys[KeyType::OneRtt as usize].take();
        let current_w = self.write_keys[KeyType::OneRtt as usize].take();
        self.read_keys[KeyType::OneRttOld as usize] = current_r;
        self.write_keys[KeyType::OneRttOld as usize] = current_w;
        self.read_keys[KeyType::OneRtt as usize] =
            self.read_keys[KeyType::OneRttNew as usize].take();
        self.write_keys[KeyType::OneRtt as usize] =
            self.write_keys[KeyType::OneRttNew as usize].take();
        self.awaiting_key_phase_confirmation = local;
    }

    /// The peer acknowledged a packet in the new phase.
    pub fn confirm_key_phase(&mut self) {
        self.awaiting_key_phase_confirmation = false;
        self.read_keys[KeyType::OneRttOld as usize] = None;
        self.write_keys[KeyType::OneRttOld as usize] = None;
    }

    pub fn protection(&self) -> &dyn PacketProtection {
        self.engine.protection()
    }
}

impl std::fmt::Debug for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypto")
            .field("read_key_level", &self.read_key_level)
            .field("handshake_complete", &self.handshake_complete)
            .field("pending_send", &self.send_pending.len())
            .finish()
    }
}

// ============================================================================
// Retry tokens
// ============================================================================

/// Length of the key a server uses to seal retry tokens.
pub const RETRY_TOKEN_KEY_LENGTH: usize = 32;

/// Server-sealed retry token embedding the original destination CID.
///
/// The sealing here is an obfuscation + integrity check over the token
/// body; a deployment substitutes its own AEAD through the same layout:
/// `len:u8 | cid[20] | tag[16]`, all XOR-mixed with the key stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryToken {
    pub orig_dest_cid: ConnectionId,
}

impl RetryToken {
    pub const ENCODED_LENGTH: usize = 1 + 20 + 16;

    pub fn seal(&self, key: &[u8; RETRY_TOKEN_KEY_LENGTH]) -> Vec<u8> {
        let mut body = vec![0u8; Self::ENCODED_LENGTH];
        body[0] = self.orig_dest_cid.len() as u8;
        body[1..1 + self.orig_dest_cid.len()].copy_from_slice(self.orig_dest_cid.as_bytes());
        let tag = token_tag(key, &body[..21]);
        body[21..].copy_from_slice(&tag);
        for (i, byte) in body.iter_mut().enumerate() {
            *byte ^= key[i % RETRY_TOKEN_KEY_LENGTH];
        }
        body
    }

    pub fn open(sealed: &[u8], key: &[u8; RETRY_TOKEN_KEY_LENGTH]) -> Option<Self> {
        if sealed.len() != Self::ENCODED_LENGTH {
            return None;
        }
        let mut body: Vec<u8> = sealed
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ key[i % RETRY_TOKEN_KEY_LENGTH])
            .collect();
        let tag = token_tag(key, &body[..21]);
        if body[21..] != tag {
            return None;
        }
        let len = body[0] as usize;
        if len > 20 {
            return None;
        }
        let cid = ConnectionId::from_slice(&body[1..1 + len])?;
        body.fill(0);
        Some(Self { orig_dest_cid: cid })
    }
}

fn token_tag(key: &[u8; RETRY_TOKEN_KEY_LENGTH], body: &[u8]) -> [u8; 16] {
    let mut state = 0xcbf2_9ce4_8422_2325u64;
    for chunk in [key as &[u8], body] {
        for byte in chunk {
            state ^= *byte as u64;
            state = state.wrapping_mul(0x1000_0000_01b3);
        }
    }
    let mut tag = [0u8; 16];
    tag[..8].copy_from_slice(&state.to_be_bytes());
    tag[8..].copy_from_slice(&state.rotate_left(31).wrapping_mul(0x9e37_79b9_7f4a_7c15).to_be_bytes());
    tag
}
