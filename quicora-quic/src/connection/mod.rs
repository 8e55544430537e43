//! The per-connection core: an operation-serialized state machine owning
//! one QUIC connection's entire lifetime.
//!
//! All externally-initiated events (API calls, received datagrams, timer
//! expirations, TLS completions) become operations on a per-connection
//! FIFO. A single worker drains the queue, so all state mutation happens
//! on one logical execution context; the only shared entry points are
//! the locked receive and operation queues.

pub mod cid;
pub mod oper;
pub mod params;
pub mod recv;
pub mod send;
pub mod timer;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use core::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::binding::BindingTable;
use crate::crypto::{Crypto, EncryptionLevel, RetryToken, TlsEngine, ENCRYPT_LEVEL_COUNT};
use crate::error::{Status, TransportError};
use crate::packet::space::PacketSpace;
use crate::recovery::{CongestionControl, LossDetection, PassthroughCongestionControl};
use crate::stream::StreamSet;
use crate::transport::parameters::TransportParameters;
use crate::types::{
    ConnectionId, Instant, RecvDatagram, Side, CLOSE_PTO_COUNT, MAX_RECEIVE_QUEUE_COUNT,
};
use crate::version::{QuicVersion, DEFAULT_VERSION};
use crate::worker::Scheduler;

use cid::CidTables;
use oper::{ApiCall, Operation, OperationQueue, MAX_OPERATIONS_PER_DRAIN};
use send::{Send as SendState, SEND_FLAG_ACK, SEND_FLAG_CONNECTION_CLOSE, SEND_FLAG_CRYPTO,
    SEND_FLAG_HANDSHAKE_DONE, SEND_FLAG_PING};
use timer::{TimerTable, TimerType};

// ============================================================================
// Close flags
// ============================================================================

/// The close was initiated silently: no CONNECTION_CLOSE is sent and no
/// closing/draining period runs.
pub const CLOSE_SILENT: u32 = 0x01;
/// Deliver a shutdown-initiated event to the application.
pub const CLOSE_SEND_NOTIFICATION: u32 = 0x02;
/// The close carries an application error code (0x1d variant).
pub const CLOSE_APPLICATION: u32 = 0x04;
/// The close was initiated by the peer.
pub const CLOSE_REMOTE: u32 = 0x08;
/// The error value is an internal status, not a wire error code.
pub const CLOSE_QUIC_STATUS: u32 = 0x10;
/// Internally-triggered close that still notifies the application.
pub const CLOSE_INTERNAL: u32 = CLOSE_SEND_NOTIFICATION | CLOSE_QUIC_STATUS;
/// Internally-triggered close with no wire activity.
pub const CLOSE_INTERNAL_SILENT: u32 = CLOSE_INTERNAL | CLOSE_SILENT;

/// What a close carries: a wire error code or an internal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// A QUIC error code (transport or application, per flags).
    WireError(u64),
    /// An internal status; `Ok(())` is the success status.
    InternalStatus(Result<(), Status>),
}

// ============================================================================
// Configuration and events
// ============================================================================

/// Connection-level policy knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle timeout in milliseconds; zero disables it.
    pub idle_timeout_ms: u64,
    /// Keep-alive PING interval in milliseconds; zero disables it.
    pub keep_alive_interval_ms: u64,
    /// Cap on the disconnect (loss-detection) timeout.
    pub disconnect_timeout_ms: u64,
    pub max_ack_delay_ms: u64,
    pub ack_delay_exponent: u64,
    /// Caps advertised to the peer for streams it may open.
    pub peer_bidi_stream_count: u16,
    pub peer_unidi_stream_count: u16,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    /// Advertised max packet size, normally the local MTU.
    pub max_packet_size: u64,
    pub active_cid_limit: u64,
    /// Whether the client shares its UDP binding (and therefore offers a
    /// non-empty source CID).
    pub share_binding: bool,
    pub use_send_buffering: bool,
    pub use_pacing: bool,
    pub cert_validation_flags: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            keep_alive_interval_ms: 0,
            disconnect_timeout_ms: 32_000,
            max_ack_delay_ms: 25,
            ack_delay_exponent: 3,
            peer_bidi_stream_count: 0,
            peer_unidi_stream_count: 0,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 16,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 16,
            max_packet_size: 1280,
            active_cid_limit: 4,
            share_binding: false,
            use_send_buffering: true,
            use_pacing: true,
            cert_validation_flags: 0,
        }
    }
}

/// Events surfaced to the application handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake finished.
    Connected,
    /// The transport closed the connection; carries the mapped status.
    ShutdownInitiatedByTransport { status: Result<(), Status>, error_code: u64 },
    /// The peer's application closed the connection.
    ShutdownInitiatedByPeer { error_code: u64 },
    /// Terminal event; delivered exactly once.
    ShutdownComplete { peer_acknowledged: bool },
    /// Reserved: path migration is rejected, so this is never raised.
    PeerAddressChanged { remote: SocketAddr },
    /// The peer wants more streams than current limits allow.
    PeerNeedsStreams { unidirectional: bool },
}

/// Application callback. May re-enter the API; every API entry point
/// enqueues an operation, which makes that safe.
pub type EventHandler = Box<dyn FnMut(&ConnectionEvent) -> Result<(), Status> + std::marker::Send>;

// ============================================================================
// Lifecycle and flags
// ============================================================================

/// Forward-progress lifecycle. Closing is tracked by the orthogonal
/// `closed_locally` / `closed_remotely` flags since the two directions
/// advance independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Allocated,
    Initialized,
    Started,
    Connected,
    HandshakeConfirmed,
}

/// Orthogonal state bits.
#[derive(Debug, Default)]
pub struct StateFlags {
    pub closed_locally: bool,
    pub closed_remotely: bool,
    /// Application released its handle; no further events indicated.
    pub handle_closed: bool,
    pub uninitialized: bool,
    /// The close carried an application error code.
    pub app_closed: bool,
    pub source_address_validated: bool,
    pub share_binding: bool,
    pub encryption_enabled: bool,
    pub header_protection_enabled: bool,
    pub use_pacing: bool,
    pub use_send_buffer: bool,
    pub received_retry: bool,
    /// Client saw any server response (disqualifies further Retries).
    pub got_first_server_response: bool,
    /// A local CID rotation is in flight; cleared on the next observed
    /// peer CID change.
    pub initiated_cid_update: bool,
    pub shutdown_complete_timed_out: bool,
    pub send_shutdown_complete_notif: bool,
    /// Shutdown-complete already indicated (exactly-once latch).
    pub handle_shutdown: bool,
    /// The application owns a handle to this connection.
    pub external_owner: bool,
    /// Server TLS configuration installed.
    pub tls_configured: bool,
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStatistics {
    pub total_packets: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecvStatistics {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub valid_packets: u64,
    pub dropped_packets: u64,
    pub duplicate_packets: u64,
    pub decryption_failures: u64,
}

/// Counter snapshot exposed through the parameter surface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub correlation_id: u64,
    pub quic_version: u32,
    /// Microsecond timestamps on the connection's clock.
    pub timing_start: u64,
    pub timing_connected: u64,
    pub smoothed_rtt_us: u64,
    pub min_rtt_us: u64,
    pub max_rtt_us: u64,
    pub send: SendStatistics,
    pub recv: RecvStatistics,
    pub key_update_count: u64,
    pub dest_cid_update_count: u64,
    pub operation_count: u64,
    pub drain_count: u64,
}

// ============================================================================
// Shared (cross-thread) state
// ============================================================================

/// The only parts of a connection touched off the worker thread.
#[derive(Debug)]
pub struct SharedState {
    pub oper_queue: OperationQueue,
    recv_queue: Mutex<VecDeque<RecvDatagram>>,
    /// Handle owner + internal holders.
    ref_count: AtomicU32,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            oper_queue: OperationQueue::default(),
            recv_queue: Mutex::new(VecDeque::new()),
            ref_count: AtomicU32::new(1),
        }
    }
}

impl SharedState {
    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` when the last reference dropped.
    pub fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct Connection {
    pub(crate) side: Side,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) flags: StateFlags,
    pub(crate) version: QuicVersion,
    pub(crate) correlation_id: u64,

    pub(crate) local_address: Option<SocketAddr>,
    pub(crate) remote_address: Option<SocketAddr>,

    pub(crate) cids: CidTables,
    /// Original destination CID when a Retry occurred (client) or when
    /// recovered from a token (server); echoed/validated in the TPs.
    pub(crate) orig_dest_cid: Option<ConnectionId>,

    pub(crate) spaces: [Option<Box<PacketSpace>>; ENCRYPT_LEVEL_COUNT],
    pub(crate) crypto: Crypto,
    pub(crate) send: SendState,
    pub(crate) streams: StreamSet,
    pub(crate) congestion: Box<dyn CongestionControl>,
    pub(crate) loss_detection: LossDetection,
    pub(crate) timers: TimerTable,

    pub(crate) shared: Arc<SharedState>,
    pub(crate) binding: Arc<BindingTable>,
    pub(crate) scheduler: Arc<dyn Scheduler>,

    pub(crate) config: ConnectionConfig,
    pub(crate) peer_transport_params: Option<TransportParameters>,
    /// Peer TPs came from the resumption cache, not the live handshake.
    pub(crate) peer_params_from_cache: bool,
    pub(crate) server_name: Option<String>,

    pub(crate) close_status: Result<(), Status>,
    pub(crate) close_error_code: u64,
    pub(crate) close_reason: Option<String>,

    pub(crate) event_handler: Option<EventHandler>,
    pub(crate) stats: Statistics,
}

impl Connection {
    /// Allocate a client connection. The handshake starts when the
    /// `Start` API operation drains.
    pub fn new_client(
        config: ConnectionConfig,
        engine: Box<dyn TlsEngine>,
        binding: Arc<BindingTable>,
        scheduler: Arc<dyn Scheduler>,
        correlation_id: u64,
        remote_address: SocketAddr,
    ) -> Self {
        let mut conn = Self::new_common(
            Side::Client,
            config,
            engine,
            binding,
            scheduler,
            correlation_id,
        );
        conn.remote_address = Some(remote_address);
        conn.initialize();
        conn
    }

    /// Allocate a server connection for a datagram the binding could not
    /// route. `client_dest_cid` (the packet's destination) becomes this
    /// endpoint's initial source CID; `client_src_cid` the destination.
    pub fn new_server(
        config: ConnectionConfig,
        engine: Box<dyn TlsEngine>,
        binding: Arc<BindingTable>,
        scheduler: Arc<dyn Scheduler>,
        correlation_id: u64,
        local_address: SocketAddr,
        remote_address: SocketAddr,
        client_dest_cid: ConnectionId,
        client_src_cid: ConnectionId,
    ) -> Self {
        let mut conn = Self::new_common(
            Side::Server,
            config,
            engine,
            binding,
            scheduler,
            correlation_id,
        );
        conn.local_address = Some(local_address);
        conn.remote_address = Some(remote_address);

        binding_register(&conn.binding, &mut conn.cids, client_dest_cid, conn.correlation_id);
        conn.cids.set_initial_dest(client_src_cid);
        conn.crypto.install_initial_keys(&client_dest_cid, Side::Server);
        conn.flags.encryption_enabled = true;
        conn.flags.header_protection_enabled = true;
        // The lazy remainder of initialization runs on the first drain.
        conn
    }

    fn new_common(
        side: Side,
        config: ConnectionConfig,
        engine: Box<dyn TlsEngine>,
        binding: Arc<BindingTable>,
        scheduler: Arc<dyn Scheduler>,
        correlation_id: u64,
    ) -> Self {
        let stats = Statistics { correlation_id, quic_version: DEFAULT_VERSION, ..Default::default() };
        binding.on_connection_attached();
        let mut conn = Self {
            side,
            lifecycle: Lifecycle::Allocated,
            flags: StateFlags {
                share_binding: config.share_binding,
                use_pacing: config.use_pacing,
                use_send_buffer: config.use_send_buffering,
                ..Default::default()
            },
            version: DEFAULT_VERSION,
            correlation_id,
            local_address: None,
            remote_address: None,
            cids: CidTables::default(),
            orig_dest_cid: None,
            spaces: Default::default(),
            crypto: Crypto::new(engine),
            send: SendState::new(config.initial_max_data),
            streams: StreamSet::new(side),
            congestion: Box::new(PassthroughCongestionControl::default()),
            loss_detection: LossDetection::default(),
            timers: TimerTable::default(),
            shared: Arc::new(SharedState::default()),
            binding,
            scheduler,
            config,
            peer_transport_params: None,
            peer_params_from_cache: false,
            server_name: None,
            close_status: Ok(()),
            close_error_code: 0,
            close_reason: None,
            event_handler: None,
            stats,
        };
        conn.streams.set_max_remote_streams(false, conn.config.peer_bidi_stream_count as u64);
        conn.streams.set_max_remote_streams(true, conn.config.peer_unidi_stream_count as u64);
        debug!(correlation_id, side = ?side, "connection allocated");
        conn
    }

    /// Create the packet spaces. Client side runs this at allocation;
    /// server side lazily on its first drain.
    pub(crate) fn initialize(&mut self) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Allocated);
        for level in [EncryptionLevel::Initial, EncryptionLevel::Handshake, EncryptionLevel::OneRtt]
        {
            self.spaces[level as usize] = Some(Box::new(PacketSpace::new(level)));
        }
        self.lifecycle = Lifecycle::Initialized;
        trace!(correlation_id = self.correlation_id, "connection initialized");
    }

    pub(crate) fn space_mut(&mut self, level: EncryptionLevel) -> Option<&mut PacketSpace> {
        self.spaces[level as usize].as_deref_mut()
    }

    pub(crate) fn space(&self, level: EncryptionLevel) -> Option<&PacketSpace> {
        self.spaces[level as usize].as_deref()
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = self.stats;
        stats.smoothed_rtt_us = self.loss_detection.rtt.smoothed_rtt();
        stats.min_rtt_us = self.loss_detection.rtt.min_rtt();
        stats.max_rtt_us = self.loss_detection.rtt.max_rtt();
        stats.quic_version = self.version;
        stats
    }

    pub fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    pub fn set_event_handler(&mut self, handler: EventHandler) {
        self.event_handler = Some(handler);
        self.flags.external_owner = true;
    }

    pub fn close_status(&self) -> Result<(), Status> {
        self.close_status
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed_locally || self.flags.closed_remotely
    }

    // ========================================================================
    // API surface (enqueue-only; reentrancy-safe)
    // ========================================================================

    /// Queue an operation and notify the scheduler on the empty->non-empty
    /// transition.
    pub fn queue_operation(&self, operation: Operation) {
        if self.shared.oper_queue.enqueue(operation) {
            self.scheduler.queue_connection(self.correlation_id);
        }
    }

    pub(crate) fn queue_priority_operation(&self, operation: Operation) {
        if self.shared.oper_queue.enqueue_front(operation) {
            self.scheduler.queue_connection(self.correlation_id);
        }
    }

    /// Begin the client handshake.
    pub fn api_start(&self, server_name: &str) {
        self.queue_operation(Operation::ApiCall(ApiCall::Start {
            server_name: server_name.to_owned(),
        }));
    }

    /// Typed parameter update; applied when the operation drains.
    pub fn api_set_parameter(&self, parameter: params::Parameter) {
        self.queue_operation(Operation::ApiCall(ApiCall::SetParameter(parameter)));
    }

    /// Application shutdown request. Shutdown preempts other queued
    /// work, so it goes to the head of the queue.
    pub fn api_shutdown(&self, application: bool, silent: bool, error_code: u64) {
        self.queue_priority_operation(Operation::ApiCall(ApiCall::Shutdown {
            application,
            silent,
            error_code,
        }));
    }

    /// Datapath unreachable notification.
    pub fn queue_unreachable(&self, remote: SocketAddr) {
        self.queue_operation(Operation::Unreachable { remote });
    }

    /// Chain received datagrams onto the connection (any thread).
    ///
    /// Returns `false` if the queue is full; the caller keeps ownership
    /// of the datagrams and returns them to the datapath.
    pub fn queue_datagrams(&self, datagrams: Vec<RecvDatagram>) -> bool {
        let transitioned;
        {
            let mut queue = self.shared.recv_queue.lock().unwrap();
            if queue.len() + datagrams.len() > MAX_RECEIVE_QUEUE_COUNT {
                return false;
            }
            transitioned = queue.is_empty();
            queue.extend(datagrams);
        }
        if transitioned {
            self.queue_operation(Operation::FlushRecv);
        }
        true
    }

    pub(crate) fn detach_recv_queue(&self) -> VecDeque<RecvDatagram> {
        std::mem::take(&mut *self.shared.recv_queue.lock().unwrap())
    }

    // ========================================================================
    // Drain loop
    // ========================================================================

    /// Execute up to `MAX_OPERATIONS_PER_DRAIN` operations.
    ///
    /// Returns `true` if more work remains and the worker should queue
    /// this connection again.
    pub fn drain(&mut self, now: Instant) -> bool {
        self.stats.drain_count += 1;
        let mut has_more_work = true;

        if self.lifecycle == Lifecycle::Allocated {
            // Server connections finish initialization on their first
            // drain, once the listener has handed them over.
            debug_assert!(self.side.is_server());
            self.initialize();
        }

        let mut operation_count = 0;
        while !self.flags.handle_closed && operation_count < MAX_OPERATIONS_PER_DRAIN {
            operation_count += 1;
            let Some(operation) = self.shared.oper_queue.dequeue() else {
                has_more_work = false;
                break;
            };
            trace!(correlation_id = self.correlation_id, ?operation, "executing operation");

            match operation {
                Operation::ApiCall(call) => self.process_api_call(call, now),
                Operation::FlushRecv => self.flush_recv(now),
                Operation::Unreachable { remote } => self.process_unreachable(remote, now),
                Operation::FlushStreamRecv { stream_id: _ } => {
                    // Stream receive flushing lives in the stream set.
                }
                Operation::FlushSend => {
                    if self.flush_send(now) {
                        // More packets to send; run again next drain.
                        self.shared.oper_queue.enqueue(Operation::FlushSend);
                    }
                }
                Operation::TlsComplete => self.process_crypto_events(now),
                Operation::TimerExpired { timer } => self.process_expired_timer(timer, now),
                Operation::TraceRundown => self.trace_rundown(),
            }

            self.validate();
            self.stats.operation_count += 1;
        }

        if operation_count >= MAX_OPERATIONS_PER_DRAIN
            && self.send.has_flag(SEND_FLAG_ACK)
            && !self.flags.handle_closed
        {
            // The drain budget is exhausted but an immediate ACK is
            // pending; one forced flush keeps ACK latency flat.
            self.flush_send(now);
        }

        if self.flags.send_shutdown_complete_notif && !self.flags.handle_closed {
            self.flags.send_shutdown_complete_notif = false;
            self.on_shutdown_complete();
        }

        if self.flags.handle_closed {
            if !self.flags.uninitialized {
                self.uninitialize();
            }
            has_more_work = false;
        }

        self.streams.drain_closed();
        self.validate();
        has_more_work
    }

    fn process_api_call(&mut self, call: ApiCall, now: Instant) {
        match call {
            ApiCall::Start { server_name } => {
                if let Err(status) = self.start(server_name, now) {
                    self.fatal_error(status, now);
                }
            }
            ApiCall::Shutdown { application, silent, error_code } => {
                let mut flags = 0;
                if application {
                    flags |= CLOSE_APPLICATION;
                }
                if silent {
                    flags |= CLOSE_SILENT;
                }
                self.try_close(flags, CloseCause::WireError(error_code), None, now);
            }
            ApiCall::SetParameter(parameter) => {
                if let Err(status) = self.apply_parameter(parameter, now) {
                    warn!(correlation_id = self.correlation_id, ?status, "set parameter failed");
                }
            }
        }
    }

    // ========================================================================
    // Handshake lifecycle
    // ========================================================================

    /// Client handshake start. Runs on the drain thread.
    fn start(&mut self, server_name: String, now: Instant) -> Result<(), Status> {
        if self.side.is_server() || self.lifecycle >= Lifecycle::Started || self.is_closed() {
            return Err(Status::InvalidState);
        }
        self.server_name = Some(server_name);
        self.stats.timing_start = now.as_micros();

        // Random destination CID stands in for the server's until its
        // first response replaces it.
        let mut dcid_bytes = [0u8; crate::types::CONNECTION_ID_LENGTH];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut dcid_bytes);
        let initial_dcid = ConnectionId::from_slice(&dcid_bytes).unwrap();
        self.cids.set_initial_dest(initial_dcid);

        // A client that shares its binding must offer a routable CID; a
        // dedicated binding keeps the zero-length CID.
        if self.flags.share_binding {
            self.cids
                .generate_source_cid(&self.binding, self.correlation_id, true)
                .map(|_| ())?;
        } else {
            binding_register(
                &self.binding,
                &mut self.cids,
                ConnectionId::empty(),
                self.correlation_id,
            );
        }

        self.flags.encryption_enabled = true;
        self.flags.header_protection_enabled = true;
        // Clients are not subject to amplification limits.
        self.flags.source_address_validated = true;
        self.send.set_unlimited_allowance();
        self.crypto.install_initial_keys(&initial_dcid, Side::Client);

        // Resumption: pre-install cached peer TPs before TLS runs.
        self.try_install_cached_peer_params();

        let local_tp = self.build_local_transport_parameters().encode();
        self.crypto.start_client(&local_tp)?;

        self.lifecycle = Lifecycle::Started;
        self.binding.on_handshake_started();
        info!(correlation_id = self.correlation_id, "handshake started");

        self.send.set_flag(SEND_FLAG_CRYPTO);
        self.reset_idle_timeout(now);
        self.queue_operation(Operation::FlushSend);
        Ok(())
    }

    /// Restart the handshake after a Retry. RTT state survives; packet
    /// spaces and crypto state reset.
    pub(crate) fn restart(&mut self, complete_reset: bool, now: Instant) {
        debug_assert!(self.side.is_client());
        if complete_reset {
            self.peer_transport_params = None;
            self.peer_params_from_cache = false;
        }
        for slot in self.spaces.iter_mut().flatten() {
            let level = slot.level;
            **slot = PacketSpace::new(level);
        }
        self.crypto.restart();
        let dcid = match self.cids.current_dest() {
            Some(entry) => entry.cid,
            None => return,
        };
        self.crypto.install_initial_keys(&dcid, Side::Client);
        let local_tp = self.build_local_transport_parameters().encode();
        if let Err(status) = self.crypto.start_client(&local_tp) {
            self.fatal_error(status, now);
            return;
        }
        self.send.set_flag(SEND_FLAG_CRYPTO);
        self.queue_operation(Operation::FlushSend);
    }

    /// Pull completed TLS work into connection state: peer TPs,
    /// handshake completion, tickets.
    pub(crate) fn process_crypto_events(&mut self, now: Instant) {
        if let Some(raw) = self.crypto.take_peer_transport_params() {
            match TransportParameters::decode(&raw) {
                Ok(params) => {
                    if let Err(error) = self.apply_peer_transport_params(params, false) {
                        self.transport_error(error, now);
                        return;
                    }
                }
                Err(error) => {
                    self.transport_error(error, now);
                    return;
                }
            }
        }

        if self.crypto.has_pending_send() {
            self.send.set_flag(SEND_FLAG_CRYPTO);
            self.queue_operation(Operation::FlushSend);
        }

        if self.crypto.handshake_complete() && self.lifecycle < Lifecycle::Connected {
            self.on_handshake_complete(now);
        }
    }

    fn on_handshake_complete(&mut self, now: Instant) {
        self.lifecycle = Lifecycle::Connected;
        self.stats.timing_connected = now.as_micros();
        self.binding.on_handshake_ended();
        info!(correlation_id = self.correlation_id, "connected");

        if self.side.is_server() {
            // The server confirms on completion and tells the client.
            self.lifecycle = Lifecycle::HandshakeConfirmed;
            self.send.set_flag(SEND_FLAG_HANDSHAKE_DONE);
            self.discard_level_state(EncryptionLevel::Handshake);
            self.queue_operation(Operation::FlushSend);
        }
        self.indicate_event(&ConnectionEvent::Connected);
        self.reset_idle_timeout(now);
    }

    /// HANDSHAKE_DONE received (client side).
    pub(crate) fn on_handshake_confirmed(&mut self, now: Instant) {
        if self.lifecycle >= Lifecycle::HandshakeConfirmed || self.side.is_server() {
            return;
        }
        self.lifecycle = Lifecycle::HandshakeConfirmed;
        self.discard_level_state(EncryptionLevel::Initial);
        self.discard_level_state(EncryptionLevel::Handshake);
        let _ = now;
        debug!(correlation_id = self.correlation_id, "handshake confirmed");
    }

    /// Discard a level's keys, recovery state, and any unsent ACKs.
    pub(crate) fn discard_level_state(&mut self, level: EncryptionLevel) {
        self.crypto.discard_keys(level);
        self.loss_detection.discard_level(level);
        if let Some(space) = self.space_mut(level) {
            space.ack_tracker.on_ack_sent();
        }
    }

    // ========================================================================
    // Transport parameters
    // ========================================================================

    pub(crate) fn build_local_transport_parameters(&mut self) -> TransportParameters {
        let mut params = TransportParameters {
            initial_max_data: self.config.initial_max_data,
            initial_max_stream_data_bidi_local: self.config.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.config.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.config.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.config.peer_bidi_stream_count as u64,
            initial_max_streams_uni: self.config.peer_unidi_stream_count as u64,
            max_packet_size: self.config.max_packet_size,
            active_connection_id_limit: self.config.active_cid_limit,
            disable_active_migration: true,
            idle_timeout_ms: self.config.idle_timeout_ms,
            max_ack_delay_ms: self.config.max_ack_delay_ms,
            ack_delay_exponent: self.config.ack_delay_exponent,
            ..Default::default()
        };
        if self.side.is_server() {
            if let Some(entry) = self.cids.source.first() {
                params.stateless_reset_token =
                    Some(self.binding.generate_stateless_reset_token(&entry.cid));
            }
            // Echo the original destination CID if a Retry happened.
            params.original_connection_id = self.orig_dest_cid;
        }
        params
    }

    /// Ingest the peer's transport parameters.
    ///
    /// `from_cache` marks resumption-cache installs, which skip the
    /// Retry/OrigCID validation and stream-limit propagation.
    pub(crate) fn apply_peer_transport_params(
        &mut self,
        params: TransportParameters,
        from_cache: bool,
    ) -> Result<(), TransportError> {
        if !from_cache && self.side.is_client() {
            // Retry invariant: a Retry must be echoed exactly; absent a
            // Retry the parameter must be absent.
            match (self.orig_dest_cid, params.original_connection_id) {
                (Some(expected), Some(echoed)) if expected == echoed => {}
                (None, None) => {}
                _ => return Err(TransportError::TransportParameterError),
            }
        }

        if let Some(token) = params.stateless_reset_token {
            self.cids.set_current_dest_reset_token(token);
        }

        self.send.update_peer_max_data(params.initial_max_data);
        if !from_cache {
            self.streams.update_max_local_streams(false, params.initial_max_streams_bidi);
            self.streams.update_max_local_streams(true, params.initial_max_streams_uni);
        }

        self.peer_params_from_cache = from_cache;
        self.peer_transport_params = Some(params);
        Ok(())
    }

    fn try_install_cached_peer_params(&mut self) {
        // The session cache lookup is owned by the API layer; a cached
        // ResumptionState lands here through `set_resumption_state`.
        if let Some(params) = self.peer_transport_params.take() {
            let _ = self.apply_peer_transport_params(params, true);
        }
    }

    /// Install client resumption state ahead of `start`.
    pub fn set_resumption_state(
        &mut self,
        state: crate::transport::parameters::ResumptionState,
    ) -> Result<(), Status> {
        if self.side.is_server() || self.lifecycle >= Lifecycle::Started {
            return Err(Status::InvalidState);
        }
        if !crate::version::is_supported(state.version) {
            return Err(Status::VersionNegotiationError);
        }
        self.version = state.version;
        self.server_name = Some(state.server_name);
        self.peer_transport_params = Some(state.transport_parameters);
        self.peer_params_from_cache = true;
        Ok(())
    }

    // ========================================================================
    // Timers
    // ========================================================================

    pub(crate) fn set_timer(&mut self, timer: TimerType, delay: Duration, now: Instant) {
        if self.timers.set(timer, delay, now) {
            self.scheduler.update_timer_wheel(self.correlation_id, self.timers.earliest());
        }
    }

    pub(crate) fn cancel_timer(&mut self, timer: TimerType) {
        if self.timers.cancel(timer) {
            self.scheduler.update_timer_wheel(self.correlation_id, self.timers.earliest());
        }
    }

    /// Re-arm idle and keep-alive after a fully valid packet.
    pub(crate) fn reset_idle_timeout(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }
        if self.config.idle_timeout_ms != 0 {
            // Never fire before a PTO would; losing a race with loss
            // recovery would close a live connection.
            let pto_ms = self
                .loss_detection
                .compute_probe_timeout(self.config.max_ack_delay_ms * 1_000, CLOSE_PTO_COUNT)
                / 1_000;
            let delay = self.config.idle_timeout_ms.max(pto_ms);
            self.set_timer(TimerType::Idle, Duration::from_millis(delay), now);
        }
        if self.config.keep_alive_interval_ms != 0 {
            self.set_timer(
                TimerType::KeepAlive,
                Duration::from_millis(self.config.keep_alive_interval_ms),
                now,
            );
        }
    }

    /// Worker callback when the timer wheel fires.
    ///
    /// AckDelay and Pacing run inline with a deferred flush; the rest
    /// become operations. The flush happens after the sweep so timer
    /// insertions cannot corrupt the iteration.
    pub fn on_timer_wheel_fired(&mut self, now: Instant) {
        let expired = self.timers.take_expired(now);
        if expired.is_empty() {
            return;
        }
        let mut flush_immediately = false;
        for timer in expired {
            trace!(correlation_id = self.correlation_id, ?timer, "timer expired");
            match timer {
                TimerType::AckDelay => {
                    self.process_delayed_ack_timer();
                    flush_immediately = true;
                }
                TimerType::Pacing => flush_immediately = true,
                other => {
                    self.queue_operation(Operation::TimerExpired { timer: other });
                }
            }
        }
        self.scheduler.update_timer_wheel(self.correlation_id, self.timers.earliest());
        if flush_immediately {
            self.flush_send(now);
        }
    }

    fn process_delayed_ack_timer(&mut self) {
        for slot in self.spaces.iter_mut().flatten() {
            if slot.ack_tracker.has_packets_to_ack() {
                slot.ack_tracker.request_immediate_ack();
            }
        }
        self.send.set_flag(SEND_FLAG_ACK);
    }

    pub(crate) fn process_expired_timer(&mut self, timer: TimerType, now: Instant) {
        match timer {
            TimerType::Idle => {
                self.try_close(
                    CLOSE_INTERNAL_SILENT,
                    CloseCause::InternalStatus(Err(Status::ConnectionIdle)),
                    None,
                    now,
                );
            }
            TimerType::KeepAlive => {
                self.send.set_flag(SEND_FLAG_PING);
                self.set_timer(
                    TimerType::KeepAlive,
                    Duration::from_millis(self.config.keep_alive_interval_ms.max(1)),
                    now,
                );
                self.queue_operation(Operation::FlushSend);
            }
            TimerType::LossDetection => {
                self.loss_detection.on_probe_timeout();
                self.send.set_flag(SEND_FLAG_PING);
                self.queue_operation(Operation::FlushSend);
            }
            TimerType::Shutdown => self.process_shutdown_timer(),
            TimerType::AckDelay | TimerType::Pacing => {
                // Handled inline by the wheel callback.
            }
        }
    }

    // ========================================================================
    // Close / shutdown machine
    // ========================================================================

    /// A peer protocol violation: close with a transport error code.
    pub(crate) fn transport_error(&mut self, error: TransportError, now: Instant) {
        self.try_close(
            CLOSE_INTERNAL,
            CloseCause::WireError(error.to_wire()),
            None,
            now,
        );
    }

    /// An unrecoverable internal failure: silent close with a status.
    pub(crate) fn fatal_error(&mut self, status: Status, now: Instant) {
        self.try_close(
            CLOSE_INTERNAL_SILENT,
            CloseCause::InternalStatus(Err(status)),
            None,
            now,
        );
    }

    /// The close/shutdown state machine. Drives Idle -> ClosedLocally /
    /// ClosedRemotely -> both-closed -> shutdown-complete notification.
    pub(crate) fn try_close(
        &mut self,
        flags: u32,
        cause: CloseCause,
        remote_reason: Option<&str>,
        now: Instant,
    ) {
        let closed_remotely = flags & CLOSE_REMOTE != 0;
        let mut silent = flags & CLOSE_SILENT != 0;

        if (closed_remotely && self.flags.closed_remotely)
            || (!closed_remotely && self.flags.closed_locally)
        {
            // Already closed in this direction.
            if silent && self.flags.closed_locally && !self.flags.closed_remotely {
                // A forced silent close after a graceful one started.
                self.flags.send_shutdown_complete_notif = true;
            }
            return;
        }

        let mut is_first_close = true;

        if closed_remotely && !self.flags.closed_locally {
            // Peer closed first. A client whose connection attempt is
            // rejected skips the draining period entirely.
            if self.lifecycle < Lifecycle::Connected && self.side.is_client() {
                silent = true;
            }
            if !silent {
                let drain_ms = 15u64.max(self.loss_detection.rtt.smoothed_rtt() * 2 / 1_000);
                self.set_timer(TimerType::Shutdown, Duration::from_millis(drain_ms), now);
                self.send.set_flag(SEND_FLAG_CONNECTION_CLOSE);
                self.queue_operation(Operation::FlushSend);
            }
        } else if !closed_remotely && !self.flags.closed_remotely {
            // Locally closed first: closing period of one PTO.
            if !silent {
                let pto_ms = self
                    .loss_detection
                    .compute_probe_timeout(self.config.max_ack_delay_ms * 1_000, CLOSE_PTO_COUNT)
                    / 1_000;
                self.set_timer(TimerType::Shutdown, Duration::from_millis(pto_ms.max(1)), now);
                self.send.set_close_flag(flags & CLOSE_APPLICATION != 0);
                self.queue_operation(Operation::FlushSend);
            }
        } else {
            // The second direction closed: the close is complete. The
            // server waits out a draining period; the client can tear
            // down as soon as its socket closes.
            info!(correlation_id = self.correlation_id, "connection close complete");
            if self.side.is_server() && !silent {
                let drain_ms = 15u64.max(self.loss_detection.rtt.smoothed_rtt() * 2 / 1_000);
                self.set_timer(TimerType::Shutdown, Duration::from_millis(drain_ms), now);
            }
            is_first_close = false;
        }

        if closed_remotely {
            self.flags.closed_remotely = true;
        } else {
            self.flags.closed_locally = true;
        }

        if is_first_close {
            // Default to the timed-out state; an acknowledged close
            // clears it below or when the peer responds.
            self.flags.shutdown_complete_timed_out = true;

            for timer in [
                TimerType::Pacing,
                TimerType::AckDelay,
                TimerType::LossDetection,
                TimerType::KeepAlive,
                TimerType::Idle,
            ] {
                self.cancel_timer(timer);
            }

            match cause {
                CloseCause::WireError(code) => {
                    self.close_status = Status::from_error_code(code);
                    self.close_error_code = code;
                }
                CloseCause::InternalStatus(status) => {
                    self.close_status = status;
                    self.close_error_code = TransportError::InternalError.to_wire();
                }
            }
            if flags & CLOSE_APPLICATION != 0 {
                self.flags.app_closed = true;
            }
            self.close_reason = remote_reason.map(truncate_reason);

            if flags & CLOSE_SEND_NOTIFICATION != 0 && self.flags.external_owner {
                self.indicate_shutdown_begin();
            }

            if self.lifecycle >= Lifecycle::Started {
                self.log_statistics();
                if self.lifecycle < Lifecycle::Connected {
                    self.binding.on_handshake_ended();
                }
            }

            self.streams.shutdown();
        }

        if silent || (self.flags.closed_remotely && self.flags.closed_locally) {
            // Timed-out stays set when the peer never participated in
            // the close (idle timeout, stateless reset); an observed
            // remote close counts as acknowledgement.
            if self.flags.closed_remotely {
                self.flags.shutdown_complete_timed_out = false;
            }
            self.flags.send_shutdown_complete_notif = true;
        }
    }

    /// Shutdown timer expiry: consider the peer closed regardless.
    fn process_shutdown_timer(&mut self) {
        self.flags.closed_remotely = true;
        self.flags.send_shutdown_complete_notif = true;
    }

    fn indicate_shutdown_begin(&mut self) {
        let event = if self.flags.app_closed {
            ConnectionEvent::ShutdownInitiatedByPeer { error_code: self.close_error_code }
        } else {
            ConnectionEvent::ShutdownInitiatedByTransport {
                status: self.close_status,
                error_code: self.close_error_code,
            }
        };
        self.indicate_event(&event);
    }

    /// Terminal notification; fires exactly once.
    fn on_shutdown_complete(&mut self) {
        if self.flags.handle_shutdown {
            return;
        }
        self.flags.handle_shutdown = true;
        self.cancel_timer(TimerType::Shutdown);

        info!(
            correlation_id = self.correlation_id,
            timed_out = self.flags.shutdown_complete_timed_out,
            "shutdown complete"
        );

        if self.flags.external_owner {
            let event = ConnectionEvent::ShutdownComplete {
                peer_acknowledged: !self.flags.shutdown_complete_timed_out,
            };
            self.indicate_event(&event);
        } else {
            // Never surfaced to the application; finish the teardown
            // ourselves.
            self.flags.handle_closed = true;
            self.shared.release();
        }

        self.binding.remove_connection(self.correlation_id);
    }

    /// The application released its handle.
    pub fn handle_close(&mut self) {
        self.flags.handle_closed = true;
        self.flags.external_owner = false;
        self.event_handler = None;
    }

    fn uninitialize(&mut self) {
        debug_assert!(self.flags.handle_closed);
        self.flags.uninitialized = true;
        self.cids.unregister_all(&self.binding);
        self.shared.oper_queue.clear();
        for timer in [
            TimerType::Pacing,
            TimerType::AckDelay,
            TimerType::LossDetection,
            TimerType::KeepAlive,
            TimerType::Idle,
            TimerType::Shutdown,
        ] {
            self.timers.cancel(timer);
        }
        self.scheduler.update_timer_wheel(self.correlation_id, None);
        debug!(correlation_id = self.correlation_id, "connection uninitialized");
    }

    // ========================================================================
    // Events & misc
    // ========================================================================

    pub(crate) fn indicate_event(&mut self, event: &ConnectionEvent) {
        if self.flags.handle_closed {
            return;
        }
        match self.event_handler.as_mut() {
            Some(handler) => {
                if let Err(status) = handler(event) {
                    trace!(
                        correlation_id = self.correlation_id,
                        ?status,
                        "event handler returned failure"
                    );
                }
            }
            None => {
                trace!(correlation_id = self.correlation_id, ?event, "event dropped: no handler");
            }
        }
    }

    fn process_unreachable(&mut self, remote: SocketAddr, now: Instant) {
        if self.lifecycle >= Lifecycle::Connected {
            // Unreachable events are only trusted during the handshake.
            return;
        }
        if Some(remote) != self.remote_address {
            return;
        }
        info!(correlation_id = self.correlation_id, "peer unreachable during handshake");
        self.try_close(
            CLOSE_INTERNAL_SILENT,
            CloseCause::InternalStatus(Err(Status::Unreachable)),
            None,
            now,
        );
    }

    fn trace_rundown(&self) {
        info!(
            correlation_id = self.correlation_id,
            side = ?self.side,
            lifecycle = ?self.lifecycle,
            version = self.version,
            source_cids = self.cids.source.len(),
            dest_cids = self.cids.dest_count(),
            closed_locally = self.flags.closed_locally,
            closed_remotely = self.flags.closed_remotely,
            "connection rundown"
        );
    }

    fn log_statistics(&self) {
        let stats = self.statistics();
        info!(
            correlation_id = self.correlation_id,
            recv_packets = stats.recv.total_packets,
            send_packets = stats.send.total_packets,
            duplicate_packets = stats.recv.duplicate_packets,
            decryption_failures = stats.recv.decryption_failures,
            smoothed_rtt_us = stats.smoothed_rtt_us,
            "connection statistics"
        );
    }

    /// Invariant checks executed after every operation.
    fn validate(&self) {
        debug_assert!(self.timers.validate(), "timer table lost sorted-prefix invariant");
        if self.is_closed() {
            // Only the shutdown timer may remain armed once closing.
            for timer in [
                TimerType::Pacing,
                TimerType::AckDelay,
                TimerType::LossDetection,
                TimerType::KeepAlive,
                TimerType::Idle,
            ] {
                debug_assert!(!self.timers.is_armed(timer), "{timer:?} armed while closed");
            }
        }
    }

    /// Decode a server retry token back to the original destination CID
    /// (server side, validating an Initial's token).
    pub(crate) fn open_retry_token(&self, token: &[u8]) -> Option<ConnectionId> {
        RetryToken::open(token, self.binding.retry_token_key()).map(|token| token.orig_dest_cid)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.flags.uninitialized {
            self.cids.unregister_all(&self.binding);
        }
    }
}

/// Register a caller-chosen source CID (server initial CID, or a client's
/// empty CID) without random generation.
fn binding_register(
    binding: &BindingTable,
    cids: &mut CidTables,
    cid: ConnectionId,
    correlation_id: u64,
) {
    if !cid.is_empty() {
        binding.add_source_cid(cid, correlation_id);
    }
    let sequence = cids.next_source_sequence;
    cids.next_source_sequence += 1;
    cids.source.insert(
        0,
        cid::SourceCid {
            sequence,
            cid,
            used_by_peer: false,
            retired: false,
            is_initial: true,
            needs_send: false,
        },
    );
}

fn truncate_reason(reason: &str) -> String {
    let limit = crate::types::MAX_CLOSE_REASON_LENGTH - 1;
    let mut end = reason.len().min(limit);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_owned()
}
