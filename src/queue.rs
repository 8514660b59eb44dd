//! Bounded per-thread task queues.
//!
//! Every thread that submits deferred work gets its own queue, created lazily
//! and registered with the scheduler. The owner pushes to the back; helpers
//! (or any other thread looking for work) pop from the front, so each queue
//! drains in submission order. An owner that is stalling on a counter may
//! also pop from its own back, preferring locally-produced work over the
//! globally-queued backlog.
//!
//! The ring is bounded: a full queue rejects the push and the submitter runs
//! the task inline instead, which is both the overflow policy and the natural
//! throttle on runaway fan-out.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::task::Task;

struct QueueState {
    ring: VecDeque<Task>,
    shutdown: bool,
}

/// A bounded ring of deferred tasks with owner/helper ends.
pub(crate) struct TaskQueue {
    depth: usize,
    state: Mutex<QueueState>,
    /// The scheduler-wide queued-task count. Updated under the queue mutex so
    /// that phase snapshots (which swap whole queue bodies) can keep it exact.
    queued: &'static AtomicUsize,
    /// Overflow events across the scheduler, for the shutdown statistics.
    overflows: &'static AtomicU64,
}

impl TaskQueue {
    pub fn new(
        depth: usize,
        queued: &'static AtomicUsize,
        overflows: &'static AtomicU64,
    ) -> TaskQueue {
        TaskQueue {
            depth,
            state: Mutex::new(QueueState {
                ring: VecDeque::with_capacity(depth),
                shutdown: false,
            }),
            queued,
            overflows,
        }
    }

    /// Pushes a task onto the owner end. On overflow or shutdown the task is
    /// handed back and the caller executes it inline.
    pub fn push_back(&self, task: Task) -> Result<(), Task> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(task);
        }
        if state.ring.len() >= self.depth {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            return Err(task);
        }
        state.ring.push_back(task);
        self.queued.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Pops the oldest task (the helper end).
    pub fn pop_front(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return None;
        }
        let task = state.ring.pop_front()?;
        self.queued.fetch_sub(1, Ordering::Release);
        Some(task)
    }

    /// Pops the newest task (the owner end). Only the owning thread calls
    /// this, while it is stalled waiting on one of its own counters.
    pub fn pop_back(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return None;
        }
        let task = state.ring.pop_back()?;
        self.queued.fetch_sub(1, Ordering::Release);
        Some(task)
    }

    /// Swaps the queue body out for an empty one, subtracting its length from
    /// the global queued count. Used by phase transitions to hide one phase's
    /// backlog from another phase's helpers.
    pub fn take_body(&self) -> VecDeque<Task> {
        let mut state = self.state.lock().unwrap();
        let body = std::mem::take(&mut state.ring);
        if !body.is_empty() {
            self.queued.fetch_sub(body.len(), Ordering::Release);
        }
        body
    }

    /// Restores a body saved by [`take_body`](Self::take_body).
    pub fn restore_body(&self, body: VecDeque<Task>) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.ring.is_empty());
        if !body.is_empty() {
            self.queued.fetch_add(body.len(), Ordering::Release);
        }
        state.ring = body;
    }

    /// Marks the queue shut down; subsequent pops return `None` and pushes
    /// are rejected. Returns the number of tasks abandoned in the ring, after
    /// removing them from the global queued count.
    pub fn mark_shutdown(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        let remain = state.ring.len();
        if remain > 0 {
            self.queued.fetch_sub(remain, Ordering::Release);
        }
        remain
    }
}
