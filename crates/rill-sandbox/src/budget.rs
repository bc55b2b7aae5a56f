//! Cooperative execution budget
//!
//! Guest code opts in by calling `__checkBudget()` from long-running loops.
//! Only every [`BUDGET_POLL_INTERVAL`]th poll reads the clock. A loop that
//! never polls cannot be stopped this way; use a hard interrupt for that.

use rill_core::clock::SharedClock;

/// Polls between clock reads
pub const BUDGET_POLL_INTERVAL: u64 = 100;

/// Per-context time budget
pub struct Budget {
    clock: SharedClock,
    timeout_ms: Option<u64>,
    start_ms: u64,
    polls: u64,
    exceeded: bool,
}

impl Budget {
    /// A budget with no timeout
    pub fn new(clock: SharedClock) -> Self {
        let start_ms = clock.now_ms();
        Self {
            clock,
            timeout_ms: None,
            start_ms,
            polls: 0,
            exceeded: false,
        }
    }

    /// Change the timeout and restart the budget
    pub fn set_timeout(&mut self, timeout_ms: Option<u64>) {
        self.timeout_ms = timeout_ms;
        self.restart();
    }

    /// Configured timeout
    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    /// Start a new guest turn
    pub fn restart(&mut self) {
        self.start_ms = self.clock.now_ms();
        self.polls = 0;
        self.exceeded = false;
    }

    /// Record one poll; true once the budget is spent.
    ///
    /// Once exceeded, the budget stays exceeded until the next restart.
    pub fn poll(&mut self) -> bool {
        let Some(timeout_ms) = self.timeout_ms else {
            return false;
        };
        if self.exceeded {
            return true;
        }
        self.polls += 1;
        if self.polls % BUDGET_POLL_INTERVAL != 0 {
            return false;
        }
        let elapsed = self.clock.now_ms().saturating_sub(self.start_ms);
        if elapsed > timeout_ms {
            tracing::debug!(elapsed, timeout_ms, polls = self.polls, "execution budget exceeded");
            self.exceeded = true;
        }
        self.exceeded
    }

    /// Polls since the last restart
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Has the budget run out?
    pub fn is_exceeded(&self) -> bool {
        self.exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::ManualClock;

    #[test]
    fn test_budget_trips_after_timeout() {
        let clock = ManualClock::shared(1_000);
        let mut budget = Budget::new(clock.clone());
        budget.set_timeout(Some(1));
        clock.advance(5);

        let tripped = (0..1_000).filter(|_| budget.poll()).count();
        assert!(tripped > 0);
        assert!(budget.is_exceeded());
        // The first 99 polls never read the clock.
        assert_eq!(tripped, 1_000 - (BUDGET_POLL_INTERVAL as usize - 1));
    }

    #[test]
    fn test_budget_without_timeout_never_trips() {
        let clock = ManualClock::shared(0);
        let mut budget = Budget::new(clock.clone());
        clock.advance(1_000_000);
        assert!((0..10_000).all(|_| !budget.poll()));
    }

    #[test]
    fn test_budget_within_time_does_not_trip() {
        let clock = ManualClock::shared(0);
        let mut budget = Budget::new(clock.clone());
        budget.set_timeout(Some(50));
        clock.advance(50);
        assert!((0..1_000).all(|_| !budget.poll()));
        clock.advance(1);
        assert!((0..100).any(|_| budget.poll()));
    }

    #[test]
    fn test_restart_clears_exceeded() {
        let clock = ManualClock::shared(0);
        let mut budget = Budget::new(clock.clone());
        budget.set_timeout(Some(1));
        clock.advance(10);
        for _ in 0..BUDGET_POLL_INTERVAL {
            budget.poll();
        }
        assert!(budget.is_exceeded());
        budget.restart();
        assert!(!budget.is_exceeded());
        assert_eq!(budget.polls(), 0);
    }
}
