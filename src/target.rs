//! Per-target mutual exclusion for the dependency-graph layer.
//!
//! The graph walk needs at-most-one concurrent build action per (action,
//! target) pair while unrelated targets proceed fully in parallel. Rather
//! than a mutex per target, a target carries a busy marker that doubles as a
//! completion counter: acquiring is a compare-and-set, and a thread that
//! loses the race suspends on the counter instead of spinning. The holder
//! decrements and resumes on release, waking every contender; one wins the
//! next compare-and-set and the rest go back to waiting.

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::wait::Counter;

const IDLE: usize = 0;
const BUSY: usize = 1;

/// A busy marker guaranteeing at-most-one concurrent build action on the
/// target it is embedded in.
#[derive(Debug)]
pub struct TargetLock {
    state: Counter,
}

impl TargetLock {
    /// Creates an unlocked target.
    pub const fn new() -> TargetLock {
        TargetLock {
            state: Counter::new(IDLE),
        }
    }

    /// Acquires the target, suspending on its completion counter while
    /// another thread holds it. Returns [`Error::Canceled`](crate::Error) if
    /// the scheduler shuts down while waiting.
    ///
    /// The calling thread must be active, and must not already hold this
    /// target (the lock is not reentrant).
    pub fn acquire(&self, sched: &'static Scheduler) -> Result<TargetGuard<'_>> {
        loop {
            if self.state.compare_set(IDLE, BUSY) {
                return Ok(TargetGuard { lock: self, sched });
            }
            sched.wait(IDLE, &self.state)?;
        }
    }

    /// Acquires the target only if it is free right now.
    pub fn try_acquire(&self, sched: &'static Scheduler) -> Option<TargetGuard<'_>> {
        if self.state.compare_set(IDLE, BUSY) {
            Some(TargetGuard { lock: self, sched })
        } else {
            None
        }
    }
}

impl Default for TargetLock {
    fn default() -> TargetLock {
        TargetLock::new()
    }
}

/// Holds a [`TargetLock`] until dropped; dropping releases the target and
/// resumes every thread suspended on it.
pub struct TargetGuard<'a> {
    lock: &'a TargetLock,
    sched: &'static Scheduler,
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.decrement();
        self.sched.resume(&self.lock.state);
    }
}
