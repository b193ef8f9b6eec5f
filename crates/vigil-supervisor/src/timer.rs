//! One-shot hard-kill timing.

use std::time::{Duration, Instant};

/// An armed hard-kill deadline, owned by the process it was armed for.
///
/// The handle lives only between a graceful-stop request and the process's
/// confirmed death, and is consumed (taken out of its `Option`) exactly
/// once, by whichever of timer expiry or the death notification happens
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillTimer {
    deadline: Instant,
}

impl KillTimer {
    /// Arms a timer that is due `grace` after `now`.
    #[must_use]
    pub fn arm(now: Instant, grace: Duration) -> Self {
        Self {
            deadline: now + grace,
        }
    }

    /// When the timer fires.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the timer is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}
