//! Per-connection operation queue.
//!
//! Every externally-initiated event becomes a tagged operation on a
//! FIFO drained by the owning worker. Enqueue reports whether the queue
//! went non-empty so the caller knows to schedule the connection.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::connection::params::Parameter;
use crate::connection::timer::TimerType;

/// Operations a drain executes before yielding the worker.
pub const MAX_OPERATIONS_PER_DRAIN: usize = 16;

/// An application API call, serialized through the queue so callbacks
/// can re-enter the API without touching connection state inline.
#[derive(Debug)]
pub enum ApiCall {
    /// Begin the handshake (client).
    Start { server_name: String },
    /// Application-initiated shutdown.
    Shutdown { application: bool, silent: bool, error_code: u64 },
    /// Typed parameter update.
    SetParameter(Parameter),
}

/// A tagged work item.
#[derive(Debug)]
pub enum Operation {
    ApiCall(ApiCall),
    /// The receive queue went non-empty.
    FlushRecv,
    /// Datapath reported the peer unreachable.
    Unreachable { remote: SocketAddr },
    /// A stream's receive path asked to be flushed.
    FlushStreamRecv { stream_id: u64 },
    /// Materialize accumulated send flags into packets.
    FlushSend,
    /// The TLS engine finished asynchronous work.
    TlsComplete,
    /// A non-inline timer fired.
    TimerExpired { timer: TimerType },
    /// Log a full state rundown for tracing.
    TraceRundown,
}

/// FIFO of pending operations. The lock spans single push/pop calls
/// only, keeping the critical section short.
#[derive(Debug, Default)]
pub struct OperationQueue {
    inner: Mutex<VecDeque<Operation>>,
}

impl OperationQueue {
    /// Append an operation. Returns `true` if the queue was empty, in
    /// which case the caller must schedule the connection on its worker.
    pub fn enqueue(&self, operation: Operation) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(operation);
        was_empty
    }

    /// Insert at the head; reserved for shutdown-critical work.
    pub fn enqueue_front(&self, operation: Operation) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_front(operation);
        was_empty
    }

    pub fn dequeue(&self) -> Option<Operation> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Drop all pending operations (teardown).
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}
