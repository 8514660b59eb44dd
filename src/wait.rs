//! Completion counters and the hashed wait-slot table.
//!
//! A [`Counter`] tracks outstanding work: submitting a task increments it,
//! finishing one decrements it, and a thread that needs the work done blocks
//! until the counter falls back to a starting value. Rather than giving every
//! counter its own mutex and condition variable, blocking goes through a
//! fixed table of shared slots selected by hashing the counter's address.
//! Two unrelated counters may land on the same slot; that only costs a
//! spurious wakeup (and a collision tick in the statistics), never a missed
//! one.

use std::ptr;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::error::Error;
use crate::error::Result;

// -----------------------------------------------------------------------------
// Counter

/// A completion counter: the value a thread waits on when it blocks on the
/// outcome of submitted work.
///
/// The scheduler increments it on [`spawn`](crate::Scheduler::spawn) and
/// decrements it when the task finishes. Consumers building their own
/// protocols on top (such as a target busy/again marker) may also adjust it
/// directly; whoever decrements a counter is responsible for calling
/// [`resume`](crate::Scheduler::resume) on it afterwards.
#[derive(Debug)]
pub struct Counter {
    value: AtomicUsize,
}

impl Counter {
    /// Creates a counter with the given starting value.
    pub const fn new(value: usize) -> Counter {
        Counter {
            value: AtomicUsize::new(value),
        }
    }

    /// Returns the current value.
    pub fn load(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    /// Increments the counter, returning the previous value.
    pub fn increment(&self) -> usize {
        self.value.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the counter, returning the previous value. The caller is
    /// expected to follow up with [`resume`](crate::Scheduler::resume).
    pub fn decrement(&self) -> usize {
        self.value.fetch_sub(1, Ordering::AcqRel)
    }

    /// Compare-and-set, used by busy-marker protocols.
    pub fn compare_set(&self, current: usize, new: usize) -> bool {
        self.value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The address identity used for slot hashing.
    fn addr(&self) -> usize {
        ptr::from_ref(self) as usize
    }
}

// -----------------------------------------------------------------------------
// Wait slots

struct SlotState {
    /// Number of threads currently blocked on this slot.
    waiters: usize,
    /// Address of the counter the most recent waiter is watching. Used only
    /// to detect collisions between unrelated counters.
    watched: usize,
    /// Set during teardown; waiters unwind with `Error::Canceled`.
    shutdown: bool,
}

struct WaitSlot {
    state: Mutex<SlotState>,
    resumed: Condvar,
}

impl WaitSlot {
    fn new() -> WaitSlot {
        WaitSlot {
            state: Mutex::new(SlotState {
                waiters: 0,
                watched: 0,
                shutdown: false,
            }),
            resumed: Condvar::new(),
        }
    }
}

/// The fixed-size hashed array of wait slots, allocated once per startup.
pub(crate) struct SlotTable {
    slots: Box<[WaitSlot]>,
}

impl SlotTable {
    /// Allocates a table sized for the given helper ceiling. The size is
    /// rounded to a power of two so slot selection is a multiply and a shift.
    pub fn new(max_threads: usize) -> SlotTable {
        let len = (max_threads * 4).max(16).next_power_of_two();
        let slots = (0..len).map(|_| WaitSlot::new()).collect();
        SlotTable { slots }
    }

    /// Number of slots in the table.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, counter: &Counter) -> &WaitSlot {
        // Fibonacci hash of the counter address; counters are word-aligned so
        // the low bits carry nothing.
        let h = (counter.addr() >> 3).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let index = h >> (usize::BITS - self.slots.len().trailing_zeros());
        &self.slots[index]
    }

    /// Blocks until the counter's value drops to `start_count` or below, or
    /// the table is shut down. Returns the observed value.
    ///
    /// The slot mutex is deliberately held across the check-then-wait
    /// sequence: a `resume` issued between our value check and the condvar
    /// wait has to take the same mutex, which closes the lost-wakeup window.
    pub fn wait(
        &self,
        start_count: usize,
        counter: &Counter,
        collisions: &AtomicU64,
    ) -> Result<usize> {
        let slot = self.slot(counter);
        let mut state = slot.state.lock().unwrap();

        if state.waiters > 0 && state.watched != counter.addr() {
            collisions.fetch_add(1, Ordering::Relaxed);
        }
        state.watched = counter.addr();
        state.waiters += 1;

        let outcome = loop {
            if state.shutdown {
                break Err(Error::Canceled);
            }
            let value = counter.load();
            if value <= start_count {
                break Ok(value);
            }
            state = slot.resumed.wait(state).unwrap();
        };

        state.waiters -= 1;
        outcome
    }

    /// Wakes every thread blocked on the counter's slot. Must be called after
    /// the counter has been decremented.
    ///
    /// This broadcasts rather than signalling one waiter: unrelated counters
    /// can share the slot, and several threads may be waiting on different
    /// start counts of the same counter. Each woken thread re-checks its own
    /// condition.
    pub fn resume(&self, counter: &Counter) -> bool {
        let slot = self.slot(counter);
        let state = slot.state.lock().unwrap();
        if state.waiters > 0 {
            slot.resumed.notify_all();
            true
        } else {
            false
        }
    }

    /// Marks every slot shut down and wakes all waiters.
    pub fn mark_shutdown(&self) {
        for slot in &self.slots {
            let mut state = slot.state.lock().unwrap();
            state.shutdown = true;
            slot.resumed.notify_all();
        }
    }
}
