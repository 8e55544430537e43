//! Connection state-machine tests: handshake, retry, stateless reset,
//! duplicate suppression, idle timeout, key updates, and the close
//! machine, driven end-to-end through the operation queue with the
//! deterministic crypto backend.

#![cfg(test)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::binding::BindingTable;
use crate::connection::params::{Parameter, ParameterQuery};
use crate::connection::send::Transmit;
use crate::connection::{Connection, ConnectionConfig, ConnectionEvent, Lifecycle};
use crate::crypto::null::NullTlsEngine;
use crate::crypto::{EncryptionLevel, RetryToken};
use crate::error::{Status, TransportError};
use crate::packet::header;
use crate::packet::ParsedHeader;
use crate::transport::parameters::{ResumptionState, TransportParameters};
use crate::types::{ConnectionId, Instant, RecvDatagram, Side};
use crate::version::VERSION_DRAFT_23;
use crate::worker::RecordingScheduler;

const CLIENT_ADDR: &str = "127.0.0.1:5000";
const SERVER_ADDR: &str = "127.0.0.1:4433";

fn client_addr() -> SocketAddr {
    CLIENT_ADDR.parse().unwrap()
}

fn server_addr() -> SocketAddr {
    SERVER_ADDR.parse().unwrap()
}

type EventLog = Arc<Mutex<Vec<ConnectionEvent>>>;

fn event_recorder(conn: &mut Connection) -> EventLog {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    conn.set_event_handler(Box::new(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    }));
    log
}

/// Drain until the operation queue runs dry; bounded to catch loops.
fn run(conn: &mut Connection, now: Instant) {
    for _ in 0..32 {
        if !conn.drain(now) {
            return;
        }
    }
    panic!("drain did not settle");
}

fn datagrams_from(transmits: Vec<Transmit>, sender: SocketAddr, local: SocketAddr, now: Instant)
    -> Vec<RecvDatagram>
{
    transmits
        .into_iter()
        .map(|transmit| RecvDatagram {
            buffer: Bytes::from(transmit.data),
            remote: sender,
            local,
            recv_time: now,
        })
        .collect()
}

struct Pair {
    client: Connection,
    client_events: EventLog,
    server: Connection,
    server_events: EventLog,
    server_binding: Arc<BindingTable>,
    now: Instant,
}

impl Pair {
    /// Client allocated and started; its first flight is pending.
    fn client_only(config: ConnectionConfig) -> (Connection, EventLog, Instant) {
        let binding = Arc::new(BindingTable::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut client = Connection::new_client(
            config,
            Box::new(NullTlsEngine::new(Side::Client)),
            binding,
            scheduler,
            1,
            server_addr(),
        );
        let events = event_recorder(&mut client);
        let now = Instant::from_micros(1_000_000);
        client.api_start("example.com");
        run(&mut client, now);
        (client, events, now)
    }

    /// Build a server for the client's first Initial packet, the way the
    /// binding would after a lookup miss.
    fn accept(
        initial: &[u8],
        server_engine: NullTlsEngine,
        config: ConnectionConfig,
    ) -> (Connection, EventLog, Arc<BindingTable>) {
        let (dest_cid, src_cid) = match header::parse(initial, 0).unwrap() {
            ParsedHeader::Long { dest_cid, src_cid, .. } => (dest_cid, src_cid),
            other => panic!("expected client initial, got {other:?}"),
        };
        let binding = Arc::new(BindingTable::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut server = Connection::new_server(
            config,
            Box::new(server_engine),
            binding.clone(),
            scheduler,
            2,
            server_addr(),
            client_addr(),
            dest_cid,
            src_cid,
        );
        let events = event_recorder(&mut server);
        (server, events, binding)
    }

    /// Run a full handshake and return the established pair.
    fn establish_with(
        client_config: ConnectionConfig,
        server_config: ConnectionConfig,
        server_engine: NullTlsEngine,
    ) -> Pair {
        let (mut client, client_events, now) = Self::client_only(client_config);
        let first_flight = client.take_transmits();
        assert!(!first_flight.is_empty(), "client produced no initial flight");

        let (mut server, server_events, server_binding) =
            Self::accept(&first_flight[0].data, server_engine, server_config);

        assert!(server.queue_datagrams(datagrams_from(
            first_flight,
            client_addr(),
            server_addr(),
            now
        )));
        server.api_set_parameter(Parameter::SecConfig);
        run(&mut server, now);

        let mut pair = Pair { client, client_events, server, server_events, server_binding, now };
        pair.pump();
        pair
    }

    fn establish() -> Pair {
        Self::establish_with(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            NullTlsEngine::new(Side::Server),
        )
    }

    /// Shuttle transmits both ways until the network is quiet.
    fn pump(&mut self) {
        for _ in 0..16 {
            let to_server = self.server_bound();
            let to_client = self.client_bound();
            if to_server.is_empty() && to_client.is_empty() {
                return;
            }
            if !to_server.is_empty() {
                self.server.queue_datagrams(to_server);
                run(&mut self.server, self.now);
            }
            if !to_client.is_empty() {
                self.client.queue_datagrams(to_client);
                run(&mut self.client, self.now);
            }
        }
        panic!("network did not settle");
    }

    fn server_bound(&mut self) -> Vec<RecvDatagram> {
        datagrams_from(self.client.take_transmits(), client_addr(), server_addr(), self.now)
    }

    fn client_bound(&mut self) -> Vec<RecvDatagram> {
        datagrams_from(self.server.take_transmits(), server_addr(), client_addr(), self.now)
    }
}

// ============================================================================
// Handshake
// ============================================================================

mod handshake_tests {
    use super::*;

    #[test]
    fn client_first_flight_is_padded_initial() {
        let (mut client, _events, _now) = Pair::client_only(ConnectionConfig::default());
        let flight = client.take_transmits();
        assert_eq!(flight.len(), 1);
        assert!(flight[0].data.len() >= 1200);
        match header::parse(&flight[0].data, 0).unwrap() {
            ParsedHeader::Long { ty, version, token, .. } => {
                assert_eq!(ty, header::LongPacketType::Initial);
                assert_eq!(version, VERSION_DRAFT_23);
                assert!(token.is_empty());
            }
            other => panic!("unexpected header {other:?}"),
        }
        assert_eq!(client.lifecycle(), Lifecycle::Started);
    }

    #[test]
    fn full_handshake_connects_both_sides() {
        let pair = Pair::establish();
        assert_eq!(pair.server.lifecycle(), Lifecycle::HandshakeConfirmed);
        assert_eq!(pair.client.lifecycle(), Lifecycle::HandshakeConfirmed);
        assert!(pair.client_events.lock().unwrap().contains(&ConnectionEvent::Connected));
        assert!(pair.server_events.lock().unwrap().contains(&ConnectionEvent::Connected));
        // The server validated the client's address via a handshake
        // packet, and RTT samples were taken.
        assert!(pair.server.flags.source_address_validated);
    }

    #[test]
    fn peer_params_install_reset_token_on_dest_cid() {
        let pair = Pair::establish();
        let dest = pair.client.cids.current_dest().unwrap();
        assert!(dest.reset_token.is_some());
    }

    #[test]
    fn orig_cid_echo_required_after_retry() {
        let (mut client, _events, _now) = Pair::client_only(ConnectionConfig::default());
        client.orig_dest_cid = ConnectionId::from_slice(&[1; 8]);

        // Peer omits the echo entirely.
        let params = TransportParameters::default();
        assert_eq!(
            client.apply_peer_transport_params(params, false),
            Err(TransportError::TransportParameterError)
        );

        // Peer echoes the wrong CID.
        let params = TransportParameters {
            original_connection_id: ConnectionId::from_slice(&[2; 8]),
            ..Default::default()
        };
        assert_eq!(
            client.apply_peer_transport_params(params, false),
            Err(TransportError::TransportParameterError)
        );

        // Exact echo is accepted.
        let params = TransportParameters {
            original_connection_id: ConnectionId::from_slice(&[1; 8]),
            ..Default::default()
        };
        assert!(client.apply_peer_transport_params(params, false).is_ok());
    }

    #[test]
    fn unexpected_orig_cid_without_retry_is_rejected() {
        let (mut client, _events, _now) = Pair::client_only(ConnectionConfig::default());
        let params = TransportParameters {
            original_connection_id: ConnectionId::from_slice(&[3; 8]),
            ..Default::default()
        };
        assert_eq!(
            client.apply_peer_transport_params(params, false),
            Err(TransportError::TransportParameterError)
        );
    }
}

// ============================================================================
// Version negotiation (boundary scenario 1)
// ============================================================================

mod version_negotiation_tests {
    use super::*;

    #[test]
    fn version_negotiation_aborts_silently() {
        let (mut client, events, now) = Pair::client_only(ConnectionConfig::default());
        let initial = client.take_transmits().remove(0);
        let (dest_cid, src_cid) = match header::parse(&initial.data, 0).unwrap() {
            ParsedHeader::Long { dest_cid, src_cid, .. } => (dest_cid, src_cid),
            other => panic!("unexpected {other:?}"),
        };

        let mut vn = Vec::new();
        header::encode_version_negotiation(&mut vn, &src_cid, &dest_cid, &[0x1a2a_3a4a]);
        client.queue_datagrams(vec![RecvDatagram {
            buffer: Bytes::from(vn),
            remote: server_addr(),
            local: client_addr(),
            recv_time: now,
        }]);
        run(&mut client, now);

        assert_eq!(client.close_status(), Err(Status::VersionNegotiationError));
        // Silent: no CONNECTION_CLOSE goes out.
        assert!(client.take_transmits().is_empty());

        let events = events.lock().unwrap();
        assert!(events.iter().any(|event| matches!(
            event,
            ConnectionEvent::ShutdownInitiatedByTransport {
                status: Err(Status::VersionNegotiationError),
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ShutdownComplete { peer_acknowledged: false })));
    }
}

// ============================================================================
// Retry (boundary scenario 2)
// ============================================================================

mod retry_tests {
    use super::*;

    #[test]
    fn retry_restarts_with_token_and_new_dest_cid() {
        let (mut client, _events, now) = Pair::client_only(ConnectionConfig::default());
        let initial = client.take_transmits().remove(0);
        let orig_dcid = match header::parse(&initial.data, 0).unwrap() {
            ParsedHeader::Long { dest_cid, .. } => dest_cid,
            other => panic!("unexpected {other:?}"),
        };
        let rtt_before = client.loss_detection.rtt.smoothed_rtt();

        let new_server_cid = ConnectionId::from_slice(&[7; 8]).unwrap();
        let mut retry = Vec::new();
        header::encode_retry(
            &mut retry,
            VERSION_DRAFT_23,
            &ConnectionId::empty(),
            &new_server_cid,
            &orig_dcid,
            b"retry-token-1",
        );
        client.queue_datagrams(vec![RecvDatagram {
            buffer: Bytes::from(retry),
            remote: server_addr(),
            local: client_addr(),
            recv_time: now,
        }]);
        run(&mut client, now);

        assert!(client.flags.received_retry);
        assert_eq!(client.orig_dest_cid, Some(orig_dcid));
        assert_eq!(client.send.initial_token, b"retry-token-1");
        // RTT state survives the restart.
        assert_eq!(client.loss_detection.rtt.smoothed_rtt(), rtt_before);

        let second = client.take_transmits().remove(0);
        match header::parse(&second.data, 0).unwrap() {
            ParsedHeader::Long { ty, dest_cid, token, .. } => {
                assert_eq!(ty, header::LongPacketType::Initial);
                assert_eq!(dest_cid, new_server_cid);
                assert_eq!(token, b"retry-token-1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn second_retry_is_ignored() {
        let (mut client, _events, now) = Pair::client_only(ConnectionConfig::default());
        let initial = client.take_transmits().remove(0);
        let orig_dcid = match header::parse(&initial.data, 0).unwrap() {
            ParsedHeader::Long { dest_cid, .. } => dest_cid,
            other => panic!("unexpected {other:?}"),
        };

        for cid_byte in [7u8, 8] {
            let mut retry = Vec::new();
            header::encode_retry(
                &mut retry,
                VERSION_DRAFT_23,
                &ConnectionId::empty(),
                &ConnectionId::from_slice(&[cid_byte; 8]).unwrap(),
                &orig_dcid,
                b"tok",
            );
            client.queue_datagrams(vec![RecvDatagram {
                buffer: Bytes::from(retry),
                remote: server_addr(),
                local: client_addr(),
                recv_time: now,
            }]);
            run(&mut client, now);
        }

        // Only the first retry took effect.
        assert_eq!(
            client.cids.current_dest().unwrap().cid,
            ConnectionId::from_slice(&[7; 8]).unwrap()
        );
    }

    #[test]
    fn handshake_completes_after_retry_with_token_validation() {
        let (mut client, client_events, now) = Pair::client_only(ConnectionConfig::default());
        let initial = client.take_transmits().remove(0);
        let orig_dcid = match header::parse(&initial.data, 0).unwrap() {
            ParsedHeader::Long { dest_cid, .. } => dest_cid,
            other => panic!("unexpected {other:?}"),
        };

        // The server binding that will eventually accept; its key seals
        // the retry token.
        let server_binding = Arc::new(BindingTable::default());
        let token = RetryToken { orig_dest_cid: orig_dcid }.seal(server_binding.retry_token_key());

        let new_server_cid = ConnectionId::from_slice(&[9; 8]).unwrap();
        let mut retry = Vec::new();
        header::encode_retry(
            &mut retry,
            VERSION_DRAFT_23,
            &ConnectionId::empty(),
            &new_server_cid,
            &orig_dcid,
            &token,
        );
        client.queue_datagrams(vec![RecvDatagram {
            buffer: Bytes::from(retry),
            remote: server_addr(),
            local: client_addr(),
            recv_time: now,
        }]);
        run(&mut client, now);

        let second_flight = client.take_transmits();
        let (dest_cid, src_cid) = match header::parse(&second_flight[0].data, 0).unwrap() {
            ParsedHeader::Long { dest_cid, src_cid, .. } => (dest_cid, src_cid),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(dest_cid, new_server_cid);

        let scheduler = Arc::new(RecordingScheduler::default());
        let mut server = Connection::new_server(
            ConnectionConfig::default(),
            Box::new(NullTlsEngine::new(Side::Server)),
            server_binding.clone(),
            scheduler,
            2,
            server_addr(),
            client_addr(),
            dest_cid,
            src_cid,
        );
        let server_events = event_recorder(&mut server);
        assert!(server.queue_datagrams(datagrams_from(
            second_flight,
            client_addr(),
            server_addr(),
            now,
        )));
        server.api_set_parameter(Parameter::SecConfig);
        run(&mut server, now);

        // The token recovered the original destination CID, so the
        // server echoes it and the client's validation passes.
        assert_eq!(server.orig_dest_cid, Some(orig_dcid));
        assert!(server.flags.source_address_validated);

        let mut pair = Pair {
            client,
            client_events,
            server,
            server_events,
            server_binding,
            now,
        };
        pair.pump();
        assert_eq!(pair.client.lifecycle(), Lifecycle::HandshakeConfirmed);
        assert_eq!(pair.server.lifecycle(), Lifecycle::HandshakeConfirmed);
    }
}

// ============================================================================
// Stateless reset (boundary scenario 3)
// ============================================================================

mod stateless_reset_tests {
    use super::*;

    #[test]
    fn stateless_reset_closes_silently() {
        let mut pair = Pair::establish();

        // The token the server advertised for its CID during the
        // handshake, as an out-of-state peer would replay it.
        let server_cid = pair.server.cids.source.first().unwrap().cid;
        let token = pair.server_binding.generate_stateless_reset_token(&server_cid);

        let mut packet = vec![0x40u8];
        packet.extend_from_slice(&[0xab; 12]);
        packet.extend_from_slice(&token);
        pair.client.queue_datagrams(vec![RecvDatagram {
            buffer: Bytes::from(packet),
            remote: server_addr(),
            local: client_addr(),
            recv_time: pair.now,
        }]);
        run(&mut pair.client, pair.now);

        assert_eq!(pair.client.close_status(), Err(Status::Aborted));
        assert!(pair.client.take_transmits().is_empty());
        let events = pair.client_events.lock().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ShutdownComplete { peer_acknowledged: false })));
    }

    #[test]
    fn unmatched_garbage_counts_as_decryption_failure() {
        let mut pair = Pair::establish();
        let mut packet = vec![0x40u8];
        packet.extend_from_slice(&[0xcd; 28]);
        pair.client.queue_datagrams(vec![RecvDatagram {
            buffer: Bytes::from(packet),
            remote: server_addr(),
            local: client_addr(),
            recv_time: pair.now,
        }]);
        run(&mut pair.client, pair.now);

        assert_eq!(pair.client.close_status(), Ok(()));
        assert_eq!(pair.client.stats.recv.decryption_failures, 1);
    }
}

// ============================================================================
// Duplicate packets (boundary scenario 4)
// ============================================================================

mod duplicate_packet_tests {
    use super::*;
    use crate::connection::send::SEND_FLAG_PING;
    use crate::connection::oper::Operation;

    #[test]
    fn duplicate_packet_is_dropped_once() {
        let mut pair = Pair::establish();

        pair.server.send.set_flag(SEND_FLAG_PING);
        pair.server.queue_operation(Operation::FlushSend);
        run(&mut pair.server, pair.now);
        let ping = pair.server.take_transmits().remove(0);

        let datagram = RecvDatagram {
            buffer: Bytes::from(ping.data),
            remote: server_addr(),
            local: client_addr(),
            recv_time: pair.now,
        };

        pair.client.queue_datagrams(vec![datagram.clone()]);
        run(&mut pair.client, pair.now);
        let valid_after_first = pair.client.stats.recv.valid_packets;
        let ranges_after_first = pair.client.spaces[EncryptionLevel::OneRtt as usize]
            .as_ref()
            .unwrap()
            .ack_tracker
            .ranges()
            .to_vec();
        assert_eq!(pair.client.stats.recv.duplicate_packets, 0);

        pair.client.queue_datagrams(vec![datagram]);
        run(&mut pair.client, pair.now);

        assert_eq!(pair.client.stats.recv.duplicate_packets, 1);
        assert_eq!(pair.client.stats.recv.valid_packets, valid_after_first);
        // The ack tracker is untouched by the duplicate.
        let ranges_after_second = pair.client.spaces[EncryptionLevel::OneRtt as usize]
            .as_ref()
            .unwrap()
            .ack_tracker
            .ranges()
            .to_vec();
        assert_eq!(ranges_after_first, ranges_after_second);
    }
}

// ============================================================================
// Idle timeout (boundary scenario 5)
// ============================================================================

mod idle_timeout_tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn idle_timeout_closes_silently() {
        let config = ConnectionConfig { idle_timeout_ms: 1_000, ..Default::default() };
        let mut pair =
            Pair::establish_with(config, ConnectionConfig::default(), NullTlsEngine::new(Side::Server));

        let later = pair.now.saturating_add(Duration::from_millis(5_000));
        pair.client.on_timer_wheel_fired(later);
        run(&mut pair.client, later);

        assert_eq!(pair.client.close_status(), Err(Status::ConnectionIdle));
        assert!(pair.client.take_transmits().is_empty());
        let events = pair.client_events.lock().unwrap();
        assert!(events.iter().any(|event| matches!(
            event,
            ConnectionEvent::ShutdownInitiatedByTransport { status: Err(Status::ConnectionIdle), .. }
        )));
    }

    #[test]
    fn traffic_rearms_the_idle_timer() {
        let config = ConnectionConfig { idle_timeout_ms: 1_000, ..Default::default() };
        let mut pair =
            Pair::establish_with(config, ConnectionConfig::default(), NullTlsEngine::new(Side::Server));

        let before = pair.client.timers.expiration(super::super::timer::TimerType::Idle).unwrap();

        // A PING from the server 500ms in re-arms the timer.
        pair.now = pair.now.saturating_add(Duration::from_millis(500));
        pair.server.send.set_flag(crate::connection::send::SEND_FLAG_PING);
        pair.server.queue_operation(crate::connection::oper::Operation::FlushSend);
        run(&mut pair.server, pair.now);
        let to_client = pair.client_bound();
        pair.client.queue_datagrams(to_client);
        run(&mut pair.client, pair.now);

        let after = pair.client.timers.expiration(super::super::timer::TimerType::Idle).unwrap();
        assert!(after > before);
    }
}

// ============================================================================
// Key updates (boundary scenario 6)
// ============================================================================

mod key_update_tests {
    use super::*;
    use crate::connection::oper::Operation;
    use crate::connection::send::SEND_FLAG_PING;

    #[test]
    fn peer_initiated_key_update_derives_new_keys() {
        let mut pair = Pair::establish();

        pair.server.api_set_parameter(Parameter::ForceKeyUpdate);
        run(&mut pair.server, pair.now);
        assert!(pair.server.crypto.awaiting_key_phase_confirmation);

        pair.server.send.set_flag(SEND_FLAG_PING);
        pair.server.queue_operation(Operation::FlushSend);
        run(&mut pair.server, pair.now);

        let to_client = pair.client_bound();
        assert!(!to_client.is_empty());
        pair.client.queue_datagrams(to_client);
        run(&mut pair.client, pair.now);

        // The client followed the phase flip.
        let space = pair.client.spaces[EncryptionLevel::OneRtt as usize].as_ref().unwrap();
        assert!(space.current_key_phase);
        assert!(space.read_key_phase_start.is_some());
        assert_eq!(pair.client.stats.key_update_count, 1);

        // The client's ACK confirms the server's update.
        let to_server = pair.server_bound();
        assert!(!to_server.is_empty());
        pair.server.queue_datagrams(to_server);
        run(&mut pair.server, pair.now);
        assert!(!pair.server.crypto.awaiting_key_phase_confirmation);
    }

    #[test]
    fn force_key_update_requires_confirmed_handshake() {
        let (mut client, _events, now) = Pair::client_only(ConnectionConfig::default());
        assert_eq!(
            client.apply_parameter(Parameter::ForceKeyUpdate, now),
            Err(Status::InvalidState)
        );
    }
}

// ============================================================================
// Close / shutdown machine
// ============================================================================

mod close_tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn app_shutdown_notifies_peer_and_completes() {
        let mut pair = Pair::establish();

        pair.client.api_shutdown(true, false, 77);
        run(&mut pair.client, pair.now);
        assert!(pair.client.flags.closed_locally);

        // The CONNECTION_CLOSE reaches the server.
        let to_server = pair.server_bound();
        assert!(!to_server.is_empty());
        pair.server.queue_datagrams(to_server);
        run(&mut pair.server, pair.now);

        let server_events = pair.server_events.lock().unwrap();
        assert!(server_events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ShutdownInitiatedByPeer { error_code: 77 })));
        drop(server_events);

        // The server's reciprocal close completes the client's shutdown.
        let to_client = pair.client_bound();
        assert!(!to_client.is_empty());
        pair.client.queue_datagrams(to_client);
        run(&mut pair.client, pair.now);

        let client_events = pair.client_events.lock().unwrap();
        let completions = client_events
            .iter()
            .filter(|event| matches!(event, ConnectionEvent::ShutdownComplete { .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(client_events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ShutdownComplete { peer_acknowledged: true })));
    }

    #[test]
    fn shutdown_timer_expiry_forces_completion() {
        let mut pair = Pair::establish();

        pair.client.api_shutdown(false, false, 0);
        run(&mut pair.client, pair.now);
        pair.client.take_transmits();

        // Nothing from the peer; the closing period lapses.
        let later = pair.now.saturating_add(Duration::from_secs(60));
        pair.client.on_timer_wheel_fired(later);
        run(&mut pair.client, later);

        let events = pair.client_events.lock().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ShutdownComplete { peer_acknowledged: false })));
    }

    #[test]
    fn shutdown_complete_fires_exactly_once() {
        let mut pair = Pair::establish();
        pair.client.api_shutdown(true, true, 0);
        run(&mut pair.client, pair.now);
        // A second shutdown must not replay the notification.
        pair.client.api_shutdown(true, true, 0);
        run(&mut pair.client, pair.now);

        let events = pair.client_events.lock().unwrap();
        let completions = events
            .iter()
            .filter(|event| matches!(event, ConnectionEvent::ShutdownComplete { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn close_frame_uses_highest_writable_level() {
        // A server right after its first flight still holds Initial,
        // Handshake, and 1-RTT write keys; the close must go out at
        // 1-RTT, not the lowest level the send loop visits first.
        let (mut client, _events, now) = Pair::client_only(ConnectionConfig::default());
        let first_flight = client.take_transmits();
        let (mut server, _server_events, _binding) = Pair::accept(
            &first_flight[0].data,
            NullTlsEngine::new(Side::Server),
            ConnectionConfig::default(),
        );
        server.queue_datagrams(datagrams_from(first_flight, client_addr(), server_addr(), now));
        server.api_set_parameter(Parameter::SecConfig);
        run(&mut server, now);
        server.take_transmits();

        server.api_shutdown(false, false, 0);
        run(&mut server, now);

        let transmits = server.take_transmits();
        assert!(!transmits.is_empty());
        match header::parse(&transmits.last().unwrap().data, 0).unwrap() {
            ParsedHeader::Short { .. } => {}
            other => panic!("close frame not sent at 1-RTT: {other:?}"),
        }
    }

    #[test]
    fn retiring_the_last_source_cid_closes_silently() {
        let mut pair = Pair::establish();

        // Rotate the client onto a spare destination CID so it emits
        // RETIRE_CONNECTION_ID for the server's only source CID.
        pair.client.cids.add_dest_cid(
            1,
            ConnectionId::from_slice(&[0x66; 8]).unwrap(),
            [2u8; 16],
        );
        pair.client.apply_parameter(Parameter::ForceCidUpdate, pair.now).unwrap();
        run(&mut pair.client, pair.now);

        let to_server = pair.server_bound();
        assert!(!to_server.is_empty());
        pair.server.queue_datagrams(to_server);
        run(&mut pair.server, pair.now);

        assert_eq!(pair.server.close_status(), Err(Status::ProtocolError));
        // Silent close: nothing goes on the wire.
        assert!(pair.server.take_transmits().is_empty());
        let events = pair.server_events.lock().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ShutdownComplete { .. })));
    }

    #[test]
    fn closing_period_retransmits_close_on_incoming_packets() {
        let mut pair = Pair::establish();

        pair.client.api_shutdown(true, false, 5);
        run(&mut pair.client, pair.now);
        pair.client.take_transmits();

        // The server, oblivious, keeps talking.
        pair.server.send.set_flag(crate::connection::send::SEND_FLAG_PING);
        pair.server.queue_operation(crate::connection::oper::Operation::FlushSend);
        run(&mut pair.server, pair.now);
        let to_client = pair.client_bound();
        pair.client.queue_datagrams(to_client);
        run(&mut pair.client, pair.now);

        // The client answers with another CONNECTION_CLOSE, not an ACK.
        let retransmits = pair.client.take_transmits();
        assert!(!retransmits.is_empty());
    }
}

// ============================================================================
// Parameter surface
// ============================================================================

mod parameter_tests {
    use super::*;

    #[test]
    fn get_parameter_probe_then_fill() {
        let pair = Pair::establish();
        let required = pair.client.get_parameter(ParameterQuery::Statistics, None).unwrap();
        assert!(required > 0);

        let mut small = vec![0u8; required - 1];
        assert_eq!(
            pair.client.get_parameter(ParameterQuery::Statistics, Some(&mut small)),
            Err(Status::BufferTooSmall(required))
        );

        let mut buf = vec![0u8; required];
        assert_eq!(
            pair.client.get_parameter(ParameterQuery::Statistics, Some(&mut buf)),
            Ok(required)
        );
    }

    #[test]
    fn version_set_rejected_after_start() {
        let (mut client, _events, now) = Pair::client_only(ConnectionConfig::default());
        assert_eq!(
            client.apply_parameter(Parameter::QuicVersion(VERSION_DRAFT_23), now),
            Err(Status::InvalidState)
        );
    }

    #[test]
    fn unsupported_version_rejected() {
        let binding = Arc::new(BindingTable::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut client = Connection::new_client(
            ConnectionConfig::default(),
            Box::new(NullTlsEngine::new(Side::Client)),
            binding,
            scheduler,
            1,
            server_addr(),
        );
        let now = Instant::from_micros(0);
        assert_eq!(
            client.apply_parameter(Parameter::QuicVersion(0x0000_0005), now),
            Err(Status::InvalidParameter)
        );
        // Reserved versions are allowed for testing failure paths.
        assert!(client.apply_parameter(Parameter::QuicVersion(0x1a2a_3a4a), now).is_ok());
    }

    #[test]
    fn close_reason_length_is_bounded() {
        let (mut client, _events, now) = Pair::client_only(ConnectionConfig::default());
        let too_long = "x".repeat(513);
        assert_eq!(
            client.apply_parameter(Parameter::CloseReasonPhrase(too_long), now),
            Err(Status::InvalidParameter)
        );
        assert!(client
            .apply_parameter(Parameter::CloseReasonPhrase("done".into()), now)
            .is_ok());
    }

    #[test]
    fn local_address_change_rebinds_and_probes() {
        // A binding-sharing client has a real source CID to migrate.
        let client_config = ConnectionConfig { share_binding: true, ..Default::default() };
        let mut pair = Pair::establish_with(
            client_config,
            ConnectionConfig::default(),
            NullTlsEngine::new(Side::Server),
        );
        let cid = pair.client.cids.source.first().unwrap().cid;
        assert!(!cid.is_empty());

        let new_binding = Arc::new(BindingTable::default());
        pair.client
            .apply_parameter(
                Parameter::LocalAddress {
                    address: "127.0.0.1:6000".parse().unwrap(),
                    binding: new_binding.clone(),
                },
                pair.now,
            )
            .unwrap();

        // Registrations moved to the new path's binding, which the
        // connection now owns.
        assert!(Arc::ptr_eq(&pair.client.binding, &new_binding));
        assert_eq!(new_binding.lookup(&cid), Some(1));

        // The new path gets probed.
        run(&mut pair.client, pair.now);
        assert!(!pair.client.take_transmits().is_empty());
    }

    #[test]
    fn local_address_is_rejected_on_server_connections() {
        let mut pair = Pair::establish();
        let binding = Arc::new(BindingTable::default());
        assert_eq!(
            pair.server.apply_parameter(
                Parameter::LocalAddress {
                    address: "127.0.0.1:6001".parse().unwrap(),
                    binding,
                },
                pair.now,
            ),
            Err(Status::InvalidState)
        );
    }

    #[test]
    fn force_cid_update_needs_spare_dest_cid() {
        let mut pair = Pair::establish();
        // The peer never issued NEW_CONNECTION_ID, so rotation fails.
        assert_eq!(
            pair.client.apply_parameter(Parameter::ForceCidUpdate, pair.now),
            Err(Status::InvalidState)
        );
        // Give the client a spare and retry.
        pair.client.cids.add_dest_cid(
            1,
            ConnectionId::from_slice(&[0x55; 8]).unwrap(),
            [1u8; 16],
        );
        assert!(pair.client.apply_parameter(Parameter::ForceCidUpdate, pair.now).is_ok());
        assert!(pair.client.flags.initiated_cid_update);
    }

    #[test]
    fn resumption_state_round_trips_via_ticket() {
        let pair = Pair::establish_with(
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            NullTlsEngine::with_ticket(Side::Server, b"resume-me".to_vec()),
        );

        let required = pair.client.get_parameter(ParameterQuery::ResumptionState, None).unwrap();
        let mut buf = vec![0u8; required];
        pair.client
            .get_parameter(ParameterQuery::ResumptionState, Some(&mut buf))
            .unwrap();

        let state = ResumptionState::decode(&buf).unwrap();
        assert_eq!(state.version, VERSION_DRAFT_23);
        assert_eq!(state.server_name, "example.com");
        assert_eq!(state.ticket, b"resume-me");

        // A fresh client pre-installs the cached state.
        let binding = Arc::new(BindingTable::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut resumed = Connection::new_client(
            ConnectionConfig::default(),
            Box::new(NullTlsEngine::new(Side::Client)),
            binding,
            scheduler,
            9,
            server_addr(),
        );
        resumed.set_resumption_state(state).unwrap();
        resumed.api_start("example.com");
        run(&mut resumed, Instant::from_micros(0));
        assert!(resumed.peer_transport_params.is_some());
        assert!(resumed.peer_params_from_cache);
    }

    #[test]
    fn resumption_state_requires_ticket() {
        let pair = Pair::establish();
        assert_eq!(
            pair.client.get_parameter(ParameterQuery::ResumptionState, None),
            Err(Status::InvalidState)
        );
    }
}

// ============================================================================
// Lifecycle, teardown, and queue bounds
// ============================================================================

mod lifecycle_tests {
    use super::*;
    use crate::connection::oper::Operation;
    use crate::types::MAX_RECEIVE_QUEUE_COUNT;

    #[test]
    fn handle_close_uninitializes_on_next_drain() {
        let mut pair = Pair::establish();
        pair.client.api_shutdown(true, true, 0);
        run(&mut pair.client, pair.now);

        let server_cid_count = pair.client.cids.source.len();
        assert!(server_cid_count >= 1);

        pair.client.handle_close();
        run(&mut pair.client, pair.now);
        assert!(pair.client.flags.uninitialized);
        assert!(pair.client.cids.source.is_empty());
        // No events after the handle is gone.
        let before = pair.client_events.lock().unwrap().len();
        pair.client.indicate_event(&ConnectionEvent::Connected);
        assert_eq!(pair.client_events.lock().unwrap().len(), before);
    }

    #[test]
    fn ref_count_reaches_zero_after_uninitialize() {
        let (client, _events, _now) = Pair::client_only(ConnectionConfig::default());
        let shared = client.shared();
        assert_eq!(shared.ref_count(), 1);
        shared.add_ref();
        assert!(!shared.release());
        assert!(shared.release());
    }

    #[test]
    fn receive_queue_is_bounded() {
        let (client, _events, now) = Pair::client_only(ConnectionConfig::default());
        let datagram = RecvDatagram {
            buffer: Bytes::from_static(&[0u8; 8]),
            remote: server_addr(),
            local: client_addr(),
            recv_time: now,
        };
        let chain: Vec<RecvDatagram> =
            std::iter::repeat(datagram.clone()).take(MAX_RECEIVE_QUEUE_COUNT).collect();
        assert!(client.queue_datagrams(chain));
        // The chain that would overflow is refused wholesale.
        assert!(!client.queue_datagrams(vec![datagram]));
    }

    #[test]
    fn trace_rundown_operation_executes() {
        let (mut client, _events, now) = Pair::client_only(ConnectionConfig::default());
        client.queue_operation(Operation::TraceRundown);
        run(&mut client, now);
        assert!(client.shared.oper_queue.is_empty());
    }

    #[test]
    fn close_reason_phrase_round_trips_through_get() {
        let (mut client, _events, now) = Pair::client_only(ConnectionConfig::default());
        client
            .apply_parameter(Parameter::CloseReasonPhrase("going away".into()), now)
            .unwrap();
        let required = client.get_parameter(ParameterQuery::CloseReasonPhrase, None).unwrap();
        let mut buf = vec![0u8; required];
        client.get_parameter(ParameterQuery::CloseReasonPhrase, Some(&mut buf)).unwrap();
        // Null-terminated phrase.
        assert_eq!(&buf[..required - 1], b"going away");
        assert_eq!(buf[required - 1], 0);
    }
}

// ============================================================================
// CID management
// ============================================================================

mod cid_tests {
    use super::*;

    #[test]
    fn new_connection_id_frames_extend_dest_table() {
        let mut pair = Pair::establish();

        // The server rotates its CIDs by issuing a fresh one.
        pair.server
            .cids
            .generate_source_cid(&pair.server_binding, 2, false)
            .unwrap();
        pair.server.send.set_flag(crate::connection::send::SEND_FLAG_NEW_CONNECTION_ID);
        pair.server.queue_operation(crate::connection::oper::Operation::FlushSend);
        run(&mut pair.server, pair.now);

        let to_client = pair.client_bound();
        pair.client.queue_datagrams(to_client);
        run(&mut pair.client, pair.now);

        assert_eq!(pair.client.cids.dest_count(), 2);
        let spare = &pair.client.cids.dest[1];
        assert!(spare.reset_token.is_some());
    }

    #[test]
    fn source_cids_resolve_through_binding() {
        let pair = Pair::establish();
        let server_cid = pair.server.cids.source.first().unwrap().cid;
        assert_eq!(pair.server_binding.lookup(&server_cid), Some(2));
    }

    #[test]
    fn unreachable_before_connect_closes_silently() {
        let (mut client, events, now) = Pair::client_only(ConnectionConfig::default());
        client.queue_unreachable(server_addr());
        run(&mut client, now);
        assert_eq!(client.close_status(), Err(Status::Unreachable));
        let events = events.lock().unwrap();
        assert!(events.iter().any(|event| matches!(
            event,
            ConnectionEvent::ShutdownInitiatedByTransport { status: Err(Status::Unreachable), .. }
        )));
    }

    #[test]
    fn unreachable_after_connect_is_ignored() {
        let mut pair = Pair::establish();
        pair.client.queue_unreachable(server_addr());
        run(&mut pair.client, pair.now);
        assert_eq!(pair.client.close_status(), Ok(()));
        assert!(!pair.client.is_closed());
    }

    #[test]
    fn datagram_from_unknown_address_is_dropped() {
        let mut pair = Pair::establish();
        let dropped_before = pair.client.stats.recv.dropped_packets;
        pair.client.queue_datagrams(vec![RecvDatagram {
            buffer: Bytes::from_static(&[0x40, 1, 2, 3]),
            remote: "10.0.0.9:9999".parse().unwrap(),
            local: client_addr(),
            recv_time: pair.now,
        }]);
        run(&mut pair.client, pair.now);
        assert_eq!(pair.client.stats.recv.dropped_packets, dropped_before + 1);
        assert!(!pair.client.is_closed());
    }
}
