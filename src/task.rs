//! The deferred unit of work that gets queued on the scheduler.
//!
//! A task pairs a closure with the completion counter its submitter will
//! block on. Executing the task runs the closure, decrements the counter,
//! and resumes the counter's waiters; that sequence is the scheduler's one
//! delivery guarantee (exactly once, wherever the task ends up running).

use std::mem;
use std::sync::Arc;

use crate::scheduler::Scheduler;
use crate::unwind::AbortOnDrop;
use crate::wait::Counter;

/// A deferred closure plus the counter that tracks its completion.
///
/// Tasks are stored by value in queue slots; the struct itself is small and
/// fixed-size, with the closure body behind a single heap allocation.
pub(crate) struct Task {
    counter: Arc<Counter>,
    thunk: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub fn new<F>(counter: Arc<Counter>, f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            counter,
            thunk: Box::new(f),
        }
    }

    /// Runs the task to completion on the calling thread.
    ///
    /// A panic in the closure would leave the counter stranded and every
    /// dependent blocked forever, so panics are converted into an abort.
    pub fn execute(self, sched: &Scheduler) {
        let guard = AbortOnDrop("task panicked");
        (self.thunk)();
        mem::forget(guard);

        self.counter.decrement();
        sched.resume(&self.counter);
    }
}
