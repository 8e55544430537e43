//! Stream-set seam: stream resolution, direction/origin validation, and
//! stream-count limits.
//!
//! Per-stream send/receive buffering lives outside the connection core.
//! What the core needs from the stream set is frame admission: given a
//! stream ID and a frame type, decide whether the frame is legal, whether
//! it creates a stream, and whether it refers to an already-closed stream
//! that should be skipped silently.

use std::collections::BTreeMap;

use crate::error::TransportError;
use crate::frames::types::*;
use crate::types::{Side, MAX_MAX_STREAMS};

/// Stream ID bit 0: initiator (0 = client). Bit 1: 1 = unidirectional.
fn initiator(stream_id: u64) -> Side {
    if stream_id & 0x01 == 0 {
        Side::Client
    } else {
        Side::Server
    }
}

fn is_unidirectional(stream_id: u64) -> bool {
    stream_id & 0x02 != 0
}

/// Index into per-direction tables: 0 = bidirectional, 1 = unidirectional.
fn direction_index(stream_id: u64) -> usize {
    (is_unidirectional(stream_id)) as usize
}

/// Whether the frame type travels sender-to-receiver on the stream.
/// STREAM, RESET_STREAM and STREAM_DATA_BLOCKED originate at the data
/// sender; MAX_STREAM_DATA and STOP_SENDING originate at the receiver.
fn is_sender_side_frame(frame_type: u64) -> bool {
    matches!(
        frame_type,
        FRAME_TYPE_RESET_STREAM | FRAME_TYPE_STREAM_DATA_BLOCKED
    ) || (FRAME_TYPE_STREAM_BASE..=0x0f).contains(&frame_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Closed,
}

/// Outcome of resolving a stream for an incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResolution {
    /// Deliver the frame to this (possibly just-created) stream.
    Deliver,
    /// The stream existed and is gone; drop the frame silently.
    Skip,
}

/// Minimal stream set: lifecycle states and stream-count limits.
#[derive(Debug)]
pub struct StreamSet {
    side: Side,
    streams: BTreeMap<u64, StreamState>,
    /// Peer-imposed caps on locally-initiated streams, by direction.
    max_local: [u64; 2],
    /// Locally-imposed caps on peer-initiated streams, by direction.
    max_remote: [u64; 2],
    /// Peer-initiated streams opened so far, by direction.
    remote_opened: [u64; 2],
    /// Locally-initiated streams opened so far, by direction.
    local_opened: [u64; 2],
    shut_down: bool,
}

impl StreamSet {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            streams: BTreeMap::new(),
            max_local: [0; 2],
            max_remote: [0; 2],
            remote_opened: [0; 2],
            local_opened: [0; 2],
            shut_down: false,
        }
    }

    /// Raise the cap on peer-initiated streams (local configuration).
    pub fn set_max_remote_streams(&mut self, unidirectional: bool, count: u64) {
        self.max_remote[unidirectional as usize] = count.min(MAX_MAX_STREAMS);
    }

    /// Apply a peer MAX_STREAMS frame or transport parameter. The cap
    /// only ever grows and saturates at the protocol maximum.
    pub fn update_max_local_streams(&mut self, unidirectional: bool, count: u64) -> bool {
        let clamped = count.min(MAX_MAX_STREAMS);
        let slot = &mut self.max_local[unidirectional as usize];
        if clamped > *slot {
            *slot = clamped;
            return true;
        }
        false
    }

    pub fn max_remote_streams(&self, unidirectional: bool) -> u64 {
        self.max_remote[unidirectional as usize]
    }

    pub fn max_local_streams(&self, unidirectional: bool) -> u64 {
        self.max_local[unidirectional as usize]
    }

    /// Validate direction/origin and resolve the target stream of a
    /// received frame, creating peer-initiated streams as needed.
    pub fn resolve_recv(
        &mut self,
        stream_id: u64,
        frame_type: u64,
    ) -> Result<StreamResolution, TransportError> {
        let from_peer = initiator(stream_id) != self.side;

        if is_unidirectional(stream_id) {
            // On a unidirectional stream only the data sender emits
            // sender-side frames, and only the receiver emits
            // receiver-side frames. The peer sent us this frame.
            let peer_is_sender = from_peer;
            if is_sender_side_frame(frame_type) != peer_is_sender {
                return Err(TransportError::StreamStateError);
            }
        }

        if let Some(state) = self.streams.get(&stream_id) {
            return Ok(match state {
                StreamState::Open => StreamResolution::Deliver,
                StreamState::Closed => StreamResolution::Skip,
            });
        }

        if from_peer {
            // Implicitly opens every lower peer stream of the same type.
            let index = direction_index(stream_id);
            let ordinal = stream_id / 4 + 1;
            if ordinal > self.max_remote[index] {
                return Err(TransportError::StreamLimitError);
            }
            if self.shut_down {
                return Ok(StreamResolution::Skip);
            }
            self.streams.insert(stream_id, StreamState::Open);
            if ordinal > self.remote_opened[index] {
                self.remote_opened[index] = ordinal;
            }
            Ok(StreamResolution::Deliver)
        } else {
            // A frame for a locally-initiated stream we never opened is
            // a violation; one for an opened-then-forgotten stream is a
            // stale retransmit.
            let index = direction_index(stream_id);
            if stream_id / 4 + 1 > self.local_opened[index] {
                return Err(TransportError::StreamStateError);
            }
            Ok(StreamResolution::Skip)
        }
    }

    /// Open a locally-initiated stream, respecting the peer's cap.
    pub fn open_local(&mut self, unidirectional: bool) -> Result<u64, TransportError> {
        let index = unidirectional as usize;
        if self.local_opened[index] >= self.max_local[index] {
            return Err(TransportError::StreamLimitError);
        }
        let ordinal = self.local_opened[index];
        self.local_opened[index] += 1;
        let mut stream_id = ordinal * 4;
        if self.side.is_server() {
            stream_id |= 0x01;
        }
        if unidirectional {
            stream_id |= 0x02;
        }
        self.streams.insert(stream_id, StreamState::Open);
        Ok(stream_id)
    }

    /// Mark a stream closed; it lingers until the next drain.
    pub fn close_stream(&mut self, stream_id: u64) {
        if let Some(state) = self.streams.get_mut(&stream_id) {
            *state = StreamState::Closed;
        }
    }

    /// Shut down every stream (first close for the connection).
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        for state in self.streams.values_mut() {
            *state = StreamState::Closed;
        }
    }

    /// Release closed streams; invoked at the end of each drain.
    pub fn drain_closed(&mut self) {
        self.streams.retain(|_, state| *state != StreamState::Closed);
    }

    pub fn open_count(&self) -> usize {
        self.streams.values().filter(|s| **s == StreamState::Open).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_stream_creation_respects_limit() {
        let mut set = StreamSet::new(Side::Server);
        set.set_max_remote_streams(false, 2);
        // Client bidi streams: 0, 4, 8.
        assert_eq!(set.resolve_recv(0, FRAME_TYPE_STREAM_BASE), Ok(StreamResolution::Deliver));
        assert_eq!(set.resolve_recv(4, FRAME_TYPE_STREAM_BASE), Ok(StreamResolution::Deliver));
        assert_eq!(
            set.resolve_recv(8, FRAME_TYPE_STREAM_BASE),
            Err(TransportError::StreamLimitError)
        );
    }

    #[test]
    fn unidirectional_direction_enforcement() {
        let mut set = StreamSet::new(Side::Server);
        set.set_max_remote_streams(true, 4);
        // Stream 2: client-initiated unidirectional; the client is the
        // sender, so STREAM is legal but MAX_STREAM_DATA is not.
        assert_eq!(set.resolve_recv(2, FRAME_TYPE_STREAM_BASE), Ok(StreamResolution::Deliver));
        assert_eq!(
            set.resolve_recv(2, FRAME_TYPE_MAX_STREAM_DATA),
            Err(TransportError::StreamStateError)
        );
        // A server-initiated uni stream (id 3): the peer is the
        // receiver, so STOP_SENDING is legal, STREAM is not.
        let mut set = StreamSet::new(Side::Server);
        set.update_max_local_streams(true, 1);
        let id = set.open_local(true).unwrap();
        assert_eq!(id, 3);
        assert_eq!(set.resolve_recv(3, FRAME_TYPE_STOP_SENDING), Ok(StreamResolution::Deliver));
        assert_eq!(
            set.resolve_recv(3, FRAME_TYPE_STREAM_BASE),
            Err(TransportError::StreamStateError)
        );
    }

    #[test]
    fn unknown_closed_local_stream_is_skipped() {
        let mut set = StreamSet::new(Side::Client);
        set.update_max_local_streams(false, 8);
        let id = set.open_local(false).unwrap();
        assert_eq!(id, 0);
        set.close_stream(id);
        set.drain_closed();
        // Stale retransmit for the closed stream: silent skip.
        assert_eq!(set.resolve_recv(0, FRAME_TYPE_MAX_STREAM_DATA), Ok(StreamResolution::Skip));
        // Never-opened local stream: violation.
        assert_eq!(
            set.resolve_recv(4, FRAME_TYPE_MAX_STREAM_DATA),
            Err(TransportError::StreamStateError)
        );
    }

    #[test]
    fn max_streams_updates_are_monotonic_and_clamped() {
        let mut set = StreamSet::new(Side::Client);
        assert!(set.update_max_local_streams(false, 10));
        assert!(!set.update_max_local_streams(false, 5));
        assert!(set.update_max_local_streams(false, u64::MAX));
        assert_eq!(set.max_local_streams(false), MAX_MAX_STREAMS);
    }

    #[test]
    fn shutdown_closes_everything() {
        let mut set = StreamSet::new(Side::Server);
        set.set_max_remote_streams(false, 4);
        set.resolve_recv(0, FRAME_TYPE_STREAM_BASE).unwrap();
        assert_eq!(set.open_count(), 1);
        set.shutdown();
        assert_eq!(set.open_count(), 0);
        assert_eq!(set.resolve_recv(0, FRAME_TYPE_STREAM_BASE), Ok(StreamResolution::Skip));
        set.drain_closed();
        // New peer streams after shutdown are not tracked.
        assert_eq!(set.resolve_recv(4, FRAME_TYPE_STREAM_BASE), Ok(StreamResolution::Skip));
    }
}
