//! Six-slot sorted timer table.
//!
//! A small fixed array beats a heap at this size. The invariant: entries
//! with finite expirations form a sorted non-decreasing prefix; the rest
//! hold the infinite sentinel. The first entry drives the worker's timer
//! wheel registration.

use core::time::Duration;

use crate::types::Instant;

/// Timer slots, one per logical activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    Pacing = 0,
    AckDelay = 1,
    LossDetection = 2,
    KeepAlive = 3,
    Idle = 4,
    Shutdown = 5,
}

/// Number of timer slots.
pub const TIMER_COUNT: usize = 6;

const INFINITE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    timer: TimerType,
    /// Expiration in microseconds; `INFINITE` when disarmed.
    expiration: u64,
}

#[derive(Debug)]
pub struct TimerTable {
    entries: [TimerEntry; TIMER_COUNT],
}

impl Default for TimerTable {
    fn default() -> Self {
        let timers = [
            TimerType::Pacing,
            TimerType::AckDelay,
            TimerType::LossDetection,
            TimerType::KeepAlive,
            TimerType::Idle,
            TimerType::Shutdown,
        ];
        Self {
            entries: timers.map(|timer| TimerEntry { timer, expiration: INFINITE }),
        }
    }
}

impl TimerTable {
    /// Arm `timer` to fire `delay` after `now`.
    ///
    /// Returns `true` if the earliest entry changed, meaning the timer
    /// wheel registration must be refreshed.
    pub fn set(&mut self, timer: TimerType, delay: Duration, now: Instant) -> bool {
        let expiration = now.saturating_add(delay).as_micros();

        let mut cur_index = 0;
        let mut new_index = TIMER_COUNT;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.timer == timer {
                cur_index = i;
            }
            if i < new_index && expiration < entry.expiration {
                new_index = i;
            }
        }

        if new_index < cur_index {
            // Shift the intervening entries back and drop ours in front.
            self.entries.copy_within(new_index..cur_index, new_index + 1);
            self.entries[new_index] = TimerEntry { timer, expiration };
        } else if new_index > cur_index + 1 {
            self.entries.copy_within(cur_index + 1..new_index, cur_index);
            self.entries[new_index - 1] = TimerEntry { timer, expiration };
            new_index -= 1;
        } else {
            self.entries[cur_index].expiration = expiration;
            new_index = cur_index;
        }
        // The wheel registration is stale if the head entry changed,
        // whether this timer landed there or vacated it.
        new_index == 0 || cur_index == 0
    }

    /// Disarm `timer`, moving it past the valid prefix.
    ///
    /// Returns `true` if the earliest entry changed.
    pub fn cancel(&mut self, timer: TimerType) -> bool {
        for i in 0..TIMER_COUNT {
            if self.entries[i].expiration == INFINITE {
                break;
            }
            if self.entries[i].timer != timer {
                continue;
            }
            // Find the end of the armed prefix and compact over us.
            let mut end = i + 1;
            while end < TIMER_COUNT && self.entries[end].expiration != INFINITE {
                end += 1;
            }
            self.entries.copy_within(i + 1..end, i);
            self.entries[end - 1] = TimerEntry { timer, expiration: INFINITE };
            return i == 0;
        }
        false
    }

    /// Sweep every timer with `expiration <= now`, disarm it, and return
    /// the expired types in firing order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerType> {
        let now = now.as_micros();
        let mut expired_count = 0;
        while expired_count < TIMER_COUNT && self.entries[expired_count].expiration <= now {
            expired_count += 1;
        }
        if expired_count == 0 {
            return Vec::new();
        }

        let expired: Vec<TimerType> =
            self.entries[..expired_count].iter().map(|entry| entry.timer).collect();
        // Rotate the fired entries, now infinite, behind the survivors.
        let fired: Vec<TimerEntry> = self.entries[..expired_count]
            .iter()
            .map(|entry| TimerEntry { timer: entry.timer, expiration: INFINITE })
            .collect();
        self.entries.copy_within(expired_count.., 0);
        self.entries[TIMER_COUNT - expired_count..].copy_from_slice(&fired);
        expired
    }

    /// Earliest armed expiration, for the timer wheel.
    pub fn earliest(&self) -> Option<Instant> {
        let first = self.entries[0];
        (first.expiration != INFINITE).then(|| Instant::from_micros(first.expiration))
    }

    pub fn is_armed(&self, timer: TimerType) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.timer == timer && entry.expiration != INFINITE)
    }

    pub fn expiration(&self, timer: TimerType) -> Option<Instant> {
        self.entries
            .iter()
            .find(|entry| entry.timer == timer && entry.expiration != INFINITE)
            .map(|entry| Instant::from_micros(entry.expiration))
    }

    /// Sorted-prefix invariant check, used by drain-time validation.
    pub fn validate(&self) -> bool {
        let mut prev = 0u64;
        let mut seen_infinite = false;
        for entry in &self.entries {
            if entry.expiration == INFINITE {
                seen_infinite = true;
            } else {
                if seen_infinite || entry.expiration < prev {
                    return false;
                }
                prev = entry.expiration;
            }
        }
        true
    }
}
