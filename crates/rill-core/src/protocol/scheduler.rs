//! Throttled batching of operations
//!
//! Operations accumulate until either the batch is full, which flushes
//! immediately, or the throttle window since the last flush has elapsed
//! and the owner polls. Time is passed in by the caller so the scheduler
//! stays deterministic under a manual clock.

use super::merge::OperationMerger;
use super::{Operation, OperationBatch};

/// Default operations per batch before a synchronous flush
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Default throttle window (one frame at 60 Hz)
pub const DEFAULT_THROTTLE_MS: u64 = 16;

/// Scheduler settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Flush as soon as this many operations are pending
    pub max_batch_size: usize,
    /// Minimum time between timed flushes
    pub throttle_ms: u64,
    /// Coalesce operations on flush
    pub merge: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            throttle_ms: DEFAULT_THROTTLE_MS,
            merge: true,
        }
    }
}

/// Batches operations and stamps batch ids
#[derive(Debug)]
pub struct ThrottledScheduler<V> {
    config: SchedulerConfig,
    pending: Vec<Operation<V>>,
    last_flush_ms: u64,
    next_batch_id: u64,
}

impl<V> ThrottledScheduler<V> {
    /// Create a scheduler whose throttle window starts at `now_ms`
    pub fn new(config: SchedulerConfig, now_ms: u64) -> Self {
        Self {
            config,
            pending: Vec::new(),
            last_flush_ms: now_ms,
            next_batch_id: 1,
        }
    }

    /// Current settings
    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Replace settings; pending operations are kept
    pub fn set_config(&mut self, config: SchedulerConfig) {
        self.config = config;
    }

    /// Number of operations waiting
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue an operation; returns a batch if this filled it
    pub fn enqueue(&mut self, op: Operation<V>, now_ms: u64) -> Option<OperationBatch<V>> {
        self.pending.push(op);
        if self.pending.len() >= self.config.max_batch_size.max(1) {
            return self.flush(now_ms);
        }
        None
    }

    /// Flush if the throttle window has elapsed
    pub fn poll(&mut self, now_ms: u64) -> Option<OperationBatch<V>> {
        if self.pending.is_empty() {
            return None;
        }
        if now_ms.saturating_sub(self.last_flush_ms) >= self.config.throttle_ms {
            return self.flush(now_ms);
        }
        None
    }

    /// Milliseconds until the next timed flush is due, if anything is pending
    pub fn due_in(&self, now_ms: u64) -> Option<u64> {
        if self.pending.is_empty() {
            return None;
        }
        let elapsed = now_ms.saturating_sub(self.last_flush_ms);
        Some(self.config.throttle_ms.saturating_sub(elapsed))
    }

    /// Flush unconditionally; `None` when nothing is pending
    pub fn flush(&mut self, now_ms: u64) -> Option<OperationBatch<V>> {
        if self.pending.is_empty() {
            return None;
        }
        let ops = std::mem::take(&mut self.pending);
        let ops = if self.config.merge {
            OperationMerger::merge(ops)
        } else {
            ops
        };
        self.last_flush_ms = now_ms;
        Some(OperationBatch::new(self.allocate_batch_id(), ops))
    }

    /// Reserve a batch id for a batch built outside the scheduler
    pub fn allocate_batch_id(&mut self) -> u64 {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        id
    }

    /// Make sure future ids are greater than `batch_id`
    pub fn observe_batch_id(&mut self, batch_id: u64) {
        if batch_id >= self.next_batch_id {
            self.next_batch_id = batch_id + 1;
        }
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
