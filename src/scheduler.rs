//! Deterministic virtual-time event queue.
//!
//! Events are kept in a `BTreeMap` keyed by (virtual timestamp, insertion
//! sequence), so events scheduled for the same instant fire in the order they
//! were scheduled. Virtual time only moves when an event is popped; nothing
//! here looks at the host clock, which keeps runs with identical inputs
//! identical.
//!
//! Cancellation removes the entry from the queue, so a cancelled event can
//! never be delivered afterwards.

use embassy_time::{Duration, Instant};
use std::collections::BTreeMap;

/// Handle to a scheduled event, usable with [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerHandle {
    at: Instant,
    seq: u64,
}

impl TimerHandle {
    pub fn deadline(&self) -> Instant {
        self.at
    }
}

#[derive(Debug)]
pub struct Scheduler<E> {
    now: Instant,
    next_seq: u64,
    queue: BTreeMap<TimerHandle, E>,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            now: Instant::from_ticks(0),
            next_seq: 0,
            queue: BTreeMap::new(),
        }
    }

    /// Current virtual time: the timestamp of the last popped event.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Schedule `event` at `at`. Deadlines in the past are clamped to `now`.
    pub fn schedule_at(&mut self, at: Instant, event: E) -> TimerHandle {
        let at = at.max(self.now);
        let handle = TimerHandle { at, seq: self.next_seq };
        self.next_seq += 1;
        self.queue.insert(handle, event);
        handle
    }

    pub fn schedule_in(&mut self, delay: Duration, event: E) -> TimerHandle {
        self.schedule_at(self.now + delay, event)
    }

    /// Remove a pending event. Returns it if it had not fired yet.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<E> {
        self.queue.remove(&handle)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Pop the earliest event if it is due at or before `until`, advancing the clock to it.
    pub fn pop_until(&mut self, until: Instant) -> Option<(Instant, E)> {
        let (&handle, _) = self.queue.iter().next()?;
        if handle.at > until {
            return None;
        }
        let event = self.queue.remove(&handle)?;
        self.now = handle.at;
        Some((handle.at, event))
    }

    /// Move the clock forward to `to` without firing anything (used at end of run).
    pub fn advance_to(&mut self, to: Instant) {
        if to > self.now {
            self.now = to;
        }
    }
}
