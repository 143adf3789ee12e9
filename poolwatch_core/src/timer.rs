//! One-shot cancellable deadlines.
//!
//! Timers are plain values stored next to the state they govern and polled by
//! the owning device worker, so arming, cancelling and firing are all
//! serialized with the rest of that device's events.

use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OneShot {
    deadline: Option<Instant>,
}

impl OneShot {
    /// Arm (or re-arm) to fire `after` from `now`. Replaces any pending
    /// deadline. A deadline past what `Instant` can represent never fires.
    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.deadline = now.checked_add(after);
    }

    pub fn arm_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Returns whether a pending deadline was discarded. Cancelling a fired
    /// or never-armed timer is a no-op.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True exactly once, on the first poll at or after the deadline.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}
