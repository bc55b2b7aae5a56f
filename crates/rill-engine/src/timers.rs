//! Guest timers
//!
//! `setTimeout` / `setInterval` entries keyed by id, with a min-heap of due
//! times. Cancelling only forgets the entry; stale heap entries are skipped
//! when they surface.

use rill_core::{FunctionValue, RuntimeValue};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Timer id handed to the guest
pub type TimerId = u32;

struct Timer {
    callback: FunctionValue,
    args: Vec<RuntimeValue>,
    interval_ms: Option<u64>,
    /// Matches the heap entry that may fire this timer
    generation: u64,
}

/// Entry in the due heap
struct DueEntry {
    due_ms: u64,
    seq: u64,
    id: TimerId,
    generation: u64,
}

// Reversed for a min-heap: earliest due time first, then schedule order.
impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due_ms.cmp(&self.due_ms).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for DueEntry {}

/// A timer that is due now
pub struct DueTimer {
    /// Timer id
    pub id: TimerId,
    /// Guest callback
    pub callback: FunctionValue,
    /// Extra arguments given at scheduling time
    pub args: Vec<RuntimeValue>,
}

/// Pending guest timers
#[derive(Default)]
pub struct TimerQueue {
    timers: FxHashMap<TimerId, Timer>,
    due: BinaryHeap<DueEntry>,
    next_id: TimerId,
    next_seq: u64,
}

impl TimerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a callback; `interval_ms` makes it repeat
    pub fn schedule(
        &mut self,
        callback: FunctionValue,
        args: Vec<RuntimeValue>,
        delay_ms: u64,
        interval_ms: Option<u64>,
        now_ms: u64,
    ) -> TimerId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        self.timers.insert(
            id,
            Timer {
                callback,
                args,
                interval_ms,
                generation: 0,
            },
        );
        self.push_due(id, 0, now_ms.saturating_add(delay_ms));
        id
    }

    /// Cancel a timer; false if it was unknown or already fired
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    /// Remove and return every timer due at `now_ms`, earliest first.
    ///
    /// Intervals are re-armed relative to `now_ms`; a zero interval waits
    /// at least one millisecond so a single pass always terminates.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<DueTimer> {
        let mut fired = Vec::new();
        let mut rearm = Vec::new();
        while let Some(entry) = self.due.peek() {
            if entry.due_ms > now_ms {
                break;
            }
            let Some(entry) = self.due.pop() else {
                break;
            };
            let Some(timer) = self
                .timers
                .get_mut(&entry.id)
                .filter(|t| t.generation == entry.generation)
            else {
                continue;
            };
            fired.push(DueTimer {
                id: entry.id,
                callback: timer.callback.clone(),
                args: timer.args.clone(),
            });
            match timer.interval_ms {
                Some(interval) => {
                    timer.generation += 1;
                    rearm.push((entry.id, timer.generation, now_ms.saturating_add(interval.max(1))));
                }
                None => {
                    self.timers.remove(&entry.id);
                }
            }
        }
        for (id, generation, due_ms) in rearm {
            self.push_due(id, generation, due_ms);
        }
        fired
    }

    /// Is a timer still pending?
    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Earliest due time among live timers
    pub fn next_due(&self) -> Option<u64> {
        self.due
            .iter()
            .filter(|e| self.timers.get(&e.id).is_some_and(|t| t.generation == e.generation))
            .map(|e| e.due_ms)
            .min()
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// No pending timers?
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Cancel everything
    pub fn clear(&mut self) {
        self.timers.clear();
        self.due.clear();
    }

    fn push_due(&mut self, id: TimerId, generation: u64, due_ms: u64) {
        self.next_seq += 1;
        self.due.push(DueEntry {
            due_ms,
            seq: self.next_seq,
            id,
            generation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> FunctionValue {
        match RuntimeValue::function("noop", |_| Ok(RuntimeValue::Undefined)) {
            RuntimeValue::Function(f) => f,
            _ => unreachable!(),
        }
    }

    fn ids(due: &[DueTimer]) -> Vec<TimerId> {
        due.iter().map(|t| t.id).collect()
    }

    #[test]
    fn test_timeouts_fire_in_due_order() {
        let mut queue = TimerQueue::new();
        let late = queue.schedule(noop(), vec![], 20, None, 0);
        let early = queue.schedule(noop(), vec![], 10, None, 0);
        let same = queue.schedule(noop(), vec![], 10, None, 0);

        assert!(queue.take_due(9).is_empty());
        assert_eq!(ids(&queue.take_due(15)), vec![early, same]);
        assert_eq!(ids(&queue.take_due(20)), vec![late]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut queue = TimerQueue::new();
        let id = queue.schedule(noop(), vec![], 5, None, 0);
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.take_due(100).is_empty());
        assert_eq!(queue.next_due(), None);
    }

    #[test]
    fn test_interval_rearms_until_cancelled() {
        let mut queue = TimerQueue::new();
        let id = queue.schedule(noop(), vec![RuntimeValue::from(1)], 10, Some(10), 0);
        assert_eq!(ids(&queue.take_due(10)), vec![id]);
        assert_eq!(queue.next_due(), Some(20));
        assert_eq!(ids(&queue.take_due(20)), vec![id]);
        assert!(queue.contains(id));
        queue.cancel(id);
        assert!(queue.take_due(1000).is_empty());
    }

    #[test]
    fn test_zero_interval_fires_once_per_pass() {
        let mut queue = TimerQueue::new();
        queue.schedule(noop(), vec![], 0, Some(0), 0);
        assert_eq!(queue.take_due(0).len(), 1);
        assert_eq!(queue.take_due(0).len(), 0);
        assert_eq!(queue.take_due(1).len(), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut queue = TimerQueue::new();
        queue.schedule(noop(), vec![], 1, None, 0);
        queue.schedule(noop(), vec![], 1, Some(5), 0);
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.take_due(100).is_empty());
    }
}
