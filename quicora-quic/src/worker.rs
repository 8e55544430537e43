//! Worker seam: how a connection tells its scheduler about pending work
//! and its earliest timer deadline.
//!
//! The worker owns the drain loop's invocation and the timer wheel; the
//! connection only signals. Exactly one worker drains a given connection
//! at a time, which is the basis of the single-threaded execution model.

use std::sync::Mutex;

use crate::types::Instant;

/// Scheduler contract implemented by the worker pool.
pub trait Scheduler: Send + Sync {
    /// The connection's operation queue went non-empty; schedule a drain.
    fn queue_connection(&self, correlation_id: u64);

    /// The connection's earliest timer changed. `None` removes the
    /// connection from the wheel.
    fn update_timer_wheel(&self, correlation_id: u64, earliest: Option<Instant>);
}

/// Recording scheduler used by tests and by harnesses that drive the
/// connection manually.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    inner: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    queued: Vec<u64>,
    timer_updates: Vec<(u64, Option<Instant>)>,
}

impl RecordingScheduler {
    pub fn queued(&self) -> Vec<u64> {
        self.inner.lock().unwrap().queued.clone()
    }

    pub fn take_queued(&self) -> Vec<u64> {
        std::mem::take(&mut self.inner.lock().unwrap().queued)
    }

    pub fn last_timer_update(&self, correlation_id: u64) -> Option<Option<Instant>> {
        self.inner
            .lock()
            .unwrap()
            .timer_updates
            .iter()
            .rev()
            .find(|(id, _)| *id == correlation_id)
            .map(|(_, earliest)| *earliest)
    }
}

impl Scheduler for RecordingScheduler {
    fn queue_connection(&self, correlation_id: u64) {
        self.inner.lock().unwrap().queued.push(correlation_id);
    }

    fn update_timer_wheel(&self, correlation_id: u64, earliest: Option<Instant>) {
        self.inner.lock().unwrap().timer_updates.push((correlation_id, earliest));
    }
}
