//! Hard interrupts
//!
//! The interpreter calls [`InterruptState::should_interrupt`] at safe points.
//! It aborts the running script when the per-turn deadline has passed, when
//! the context's interrupt handler asks for it, or when the owner is
//! tearing the interpreter down.

use parking_lot::Mutex;
use rill_core::clock::SharedClock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Predicate polled by the interpreter; returning true aborts the script
pub type InterruptHandler = Arc<dyn Fn() -> bool + Send + Sync>;

/// Interrupt handler slot of one context
pub type HandlerSlot = Arc<Mutex<Option<InterruptHandler>>>;

/// Interrupt bookkeeping for one interpreter
pub(crate) struct InterruptState {
    clock: SharedClock,
    active: Mutex<Option<InterruptHandler>>,
    /// Absolute deadline in ms, 0 when unarmed
    deadline_ms: AtomicU64,
    fired: AtomicBool,
    terminated: AtomicBool,
}

impl InterruptState {
    pub(crate) fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            active: Mutex::new(None),
            deadline_ms: AtomicU64::new(0),
            fired: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        })
    }

    /// Arm for one guest turn; disarmed when the guard drops
    pub(crate) fn begin(&self, handler: Option<InterruptHandler>, timeout_ms: Option<u64>) -> TurnGuard<'_> {
        *self.active.lock() = handler;
        let deadline = timeout_ms.map_or(0, |ms| self.clock.now_ms().saturating_add(ms).max(1));
        self.deadline_ms.store(deadline, Ordering::SeqCst);
        self.fired.store(false, Ordering::SeqCst);
        TurnGuard { state: self }
    }

    /// Called by the interpreter at safe points
    pub(crate) fn should_interrupt(&self) -> bool {
        if self.terminated.load(Ordering::Relaxed) {
            self.fired.store(true, Ordering::SeqCst);
            return true;
        }
        let deadline = self.deadline_ms.load(Ordering::Relaxed);
        if deadline != 0 && self.clock.now_ms() >= deadline {
            self.fired.store(true, Ordering::SeqCst);
            return true;
        }
        // Clone out so the handler can touch the slot without deadlocking.
        let handler = self.active.lock().clone();
        if handler.is_some_and(|h| h()) {
            self.fired.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Did an interrupt abort the current turn?
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Abort whatever runs now and anything that runs later
    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn end(&self) {
        self.active.lock().take();
        self.deadline_ms.store(0, Ordering::SeqCst);
    }
}

/// Disarms the interpreter when dropped
pub(crate) struct TurnGuard<'a> {
    state: &'a InterruptState,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.state.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::ManualClock;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_deadline_fires_after_timeout() {
        let clock = ManualClock::shared(100);
        let state = InterruptState::new(clock.clone());
        let _turn = state.begin(None, Some(10));
        assert!(!state.should_interrupt());
        clock.advance(10);
        assert!(state.should_interrupt());
        assert!(state.is_fired());
    }

    #[test]
    fn test_handler_is_consulted_and_dropped_after_turn() {
        let clock = ManualClock::shared(0);
        let state = InterruptState::new(clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: InterruptHandler = Arc::new(move || counter.fetch_add(1, Ordering::SeqCst) >= 2);

        {
            let _turn = state.begin(Some(handler), None);
            assert!(!state.should_interrupt());
            assert!(!state.should_interrupt());
            assert!(state.should_interrupt());
        }
        assert!(!state.should_interrupt());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_begin_clears_previous_fire() {
        let clock = ManualClock::shared(0);
        let state = InterruptState::new(clock);
        {
            let _turn = state.begin(Some(Arc::new(|| true)), None);
            assert!(state.should_interrupt());
        }
        let _turn = state.begin(None, None);
        assert!(!state.is_fired());
    }

    #[test]
    fn test_terminate_always_interrupts() {
        let state = InterruptState::new(ManualClock::shared(0));
        state.terminate();
        assert!(state.should_interrupt());
    }
}
