//! Worker pool interface: the engine only needs `time_ms`,
//! the least-loaded worker, and the ability to move a listener. A fixed
//! pool of I/O worker threads is assumed to exist outside this crate in
//! production; `WorkerPool` here is a minimal, directly testable stand-in
//! that the throttled sender's rebalancing logic drives.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u32);

#[derive(Debug)]
struct WorkerState {
    id: WorkerId,
    load: AtomicI64,
    move_allocations: AtomicI64,
}

/// Difference in listener count that triggers a rebalance.
const REBALANCE_THRESHOLD: i64 = 10;
/// Starting move-allocation budget per worker; exhaust-then-refill.
const DEFAULT_MOVE_ALLOCATIONS: i64 = 25;

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<WorkerState>,
}

impl WorkerPool {
    pub fn new(worker_count: u32) -> Self {
        let workers = (0..worker_count)
            .map(|i| WorkerState {
                id: WorkerId(i),
                load: AtomicI64::new(0),
                move_allocations: AtomicI64::new(DEFAULT_MOVE_ALLOCATIONS),
            })
            .collect();
        WorkerPool { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn load(&self, id: WorkerId) -> i64 {
        self.workers[id.0 as usize].load.load(Ordering::Relaxed)
    }

    pub fn assign(&self, id: WorkerId) {
        self.workers[id.0 as usize].load.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unassign(&self, id: WorkerId) {
        self.workers[id.0 as usize].load.fetch_sub(1, Ordering::Relaxed);
    }

    /// The least-loaded worker, used both for initial placement and for
    /// rebalancing decisions.
    pub fn least_loaded(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .min_by_key(|w| w.load.load(Ordering::Relaxed))
            .map(|w| w.id)
    }

    /// Opportunistic rebalance: if `current` has a move-allocation budget
    /// left and the least-loaded worker is more than `REBALANCE_THRESHOLD`
    /// listeners lighter, move the listener there. Returns the destination
    /// worker on success. Mirrors `fserve_change_worker`.
    pub fn try_rebalance(&self, current: WorkerId) -> Option<WorkerId> {
        let current_state = &self.workers[current.0 as usize];
        if current_state.move_allocations.load(Ordering::Relaxed) <= 0 {
            return None;
        }
        let target = self.least_loaded()?;
        if target == current {
            return None;
        }
        let diff = self.load(current) - self.load(target);
        if diff > REBALANCE_THRESHOLD {
            current_state.move_allocations.fetch_sub(1, Ordering::Relaxed);
            self.unassign(current);
            self.assign(target);
            Some(target)
        } else {
            None
        }
    }

    /// Refill a worker's move-allocation budget (e.g. on a periodic timer
    /// driven by the caller). Not invoked automatically: the original
    /// exhausts the budget and relies on the caller to refill it.
    pub fn refill_allocations(&self, id: WorkerId, amount: i64) {
        self.workers[id.0 as usize]
            .move_allocations
            .store(amount, Ordering::Relaxed);
    }
}
