//! This module contains the scheduler core: thread accounting, the helper
//! pool, phase transitions, and the deadlock monitor.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::process;
use std::ptr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::trace_span;

use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::jobserver;
use crate::queue::TaskQueue;
use crate::task::Task;
use crate::wait::Counter;
use crate::wait::SlotTable;

// -----------------------------------------------------------------------------
// Scheduler types

/// Helpers get a fixed stack unless the configuration says otherwise; the
/// platform default is unbounded on some systems and tiny on others.
const DEFAULT_HELPER_STACK: usize = 8 << 20;

/// The concurrent task scheduler driving parallel build-graph execution.
///
/// # Creating a scheduler
///
/// Schedulers are static and const-constructed; all the real resources are
/// allocated by [`Scheduler::startup`] and released by
/// [`Scheduler::shutdown`], after which the same object may be started again.
///
/// ```no_run
/// # use gantry::{Config, Scheduler};
/// static SCHED: Scheduler = Scheduler::new();
///
/// fn main() -> gantry::Result<()> {
///     SCHED.startup(Config::new(4))?;
///     // ... submit work ...
///     let _stats = SCHED.shutdown();
///     Ok(())
/// }
/// ```
///
/// # Thread accounting
///
/// Threads are tracked by counters, not per-thread tags: *active* threads are
/// running (or about to run) graph work under the `max_active` ceiling;
/// *waiting* threads are blocked on a counter; *ready* threads are blocked
/// waiting for a free active slot; *idle* threads are helpers with nothing to
/// do. Every transition goes through a named method on the internal state so
/// the bookkeeping lives in one place.
///
/// The thread that calls `startup` is counted active from the start (see
/// [`Config::init_active`]); helper threads are created on demand as deferred
/// work queues up, up to [`Config::max_threads`].
pub struct Scheduler {
    state: Mutex<State>,
    /// Signalled when an active slot may have been freed; threads in the
    /// ready state block here.
    slot_free: Condvar,
    /// Signalled when deferred work arrives; idle helpers block here.
    work_ready: Condvar,
    /// Signalled when the pool may have stalled; the deadlock monitor blocks
    /// here.
    stalled: Condvar,

    /// Tasks queued across every live queue of the current phase.
    queued: AtomicUsize,
    /// Monotonic counter bumped around every wait/wake transition. The
    /// deadlock monitor uses it to tell a thread caught mid-transition from a
    /// genuine stall.
    progress: AtomicU64,
    /// Unrelated counters observed sharing a wait slot.
    collisions: AtomicU64,
    /// Tasks executed inline because the submitter's queue was full.
    overflows: AtomicU64,
    /// Fast-path check for whether a progress monitor is installed.
    has_monitor: AtomicBool,
}

struct State {
    running: bool,
    shutdown: bool,

    orig_max_active: usize,
    max_active: usize,
    init_active: usize,
    max_threads: usize,
    queue_depth: usize,
    max_stack: Option<usize>,

    active: usize,
    waiting: usize,
    ready: usize,
    idle: usize,
    external: usize,
    helpers: usize,
    helpers_created: u64,

    slots: Option<Arc<SlotTable>>,
    queues: Vec<Arc<TaskQueue>>,
    phases: Vec<PhaseSnapshot>,
    monitor: Option<Arc<ProgressMonitor>>,

    helper_handles: Vec<JoinHandle<()>>,
    stall_handle: Option<JoinHandle<()>>,
    jobserver_handle: Option<JoinHandle<()>>,

    max_active_seen: usize,
    max_waiting_seen: usize,
    max_helpers_seen: usize,
}

impl State {
    fn stall_suspected(&self) -> bool {
        self.running && self.active == 0 && self.external == 0 && self.waiting > 0
    }
}

/// One pushed phase: the queue bodies hidden from the new phase's helpers,
/// plus the concurrency ceiling to restore on pop.
struct PhaseSnapshot {
    saved: Vec<(Arc<TaskQueue>, VecDeque<Task>)>,
    ceiling: usize,
}

/// An installed progress-threshold observer (see [`Scheduler::monitor`]).
struct ProgressMonitor {
    counter: Arc<Counter>,
    threshold: AtomicUsize,
    callback: Box<dyn Fn(usize) -> usize + Send + Sync>,
}

/// Aggregate statistics returned by [`Scheduler::shutdown`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    /// Most threads ever active at once.
    pub thread_max_active: usize,
    /// Most pool threads that ever existed at once (initial plus helpers).
    pub thread_max_total: usize,
    /// Most threads ever blocked on counters at once.
    pub thread_max_waiting: usize,
    /// Capacity of each per-thread task queue.
    pub task_queue_depth: usize,
    /// Tasks executed inline because a queue was full.
    pub task_queue_full: u64,
    /// Tasks abandoned in queues at shutdown. Zero for a drained run.
    pub task_queue_remain: usize,
    /// Number of wait slots in the hashed table.
    pub wait_slot_count: usize,
    /// Times two unrelated counters shared a wait slot.
    pub wait_slot_collisions: u64,
}

// -----------------------------------------------------------------------------
// Per-thread queue lookup

thread_local! {
    /// The calling thread's task queue, keyed by the owning scheduler's
    /// address so that two schedulers (or two runs of one) never share a
    /// queue. Strong references live in the scheduler's registry; after
    /// shutdown the upgrade fails and the thread gets a fresh queue.
    static LOCAL_QUEUE: RefCell<(usize, Weak<TaskQueue>)> =
        const { RefCell::new((0, Weak::new())) };
}

// -----------------------------------------------------------------------------
// Lifecycle

#[allow(clippy::new_without_default)]
impl Scheduler {
    /// Creates a new scheduler. No resources are allocated and no threads are
    /// spawned until [`Scheduler::startup`].
    pub const fn new() -> Scheduler {
        Scheduler {
            state: Mutex::new(State {
                running: false,
                shutdown: false,
                orig_max_active: 0,
                max_active: 0,
                init_active: 0,
                max_threads: 0,
                queue_depth: 0,
                max_stack: None,
                active: 0,
                waiting: 0,
                ready: 0,
                idle: 0,
                external: 0,
                helpers: 0,
                helpers_created: 0,
                slots: None,
                queues: Vec::new(),
                phases: Vec::new(),
                monitor: None,
                helper_handles: Vec::new(),
                stall_handle: None,
                jobserver_handle: None,
                max_active_seen: 0,
                max_waiting_seen: 0,
                max_helpers_seen: 0,
            }),
            slot_free: Condvar::new(),
            work_ready: Condvar::new(),
            stalled: Condvar::new(),
            queued: AtomicUsize::new(0),
            progress: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            has_monitor: AtomicBool::new(false),
        }
    }

    /// Brings the scheduler up: allocates the wait-slot table, spawns the
    /// deadlock monitor and (when configured) the jobserver monitor, and
    /// counts the calling thread(s) as active.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler is already running.
    pub fn startup(&'static self, config: Config) -> Result<()> {
        let cfg = config.resolved();
        debug!(
            max_active = cfg.max_active,
            max_threads = cfg.max_threads,
            queue_depth = cfg.queue_depth,
            "starting scheduler"
        );

        let mut s = self.state.lock().unwrap();
        assert!(!s.running, "scheduler is already running");

        s.running = true;
        s.shutdown = false;
        s.orig_max_active = cfg.max_active;
        s.max_active = cfg.max_active;
        s.init_active = cfg.init_active;
        s.max_threads = cfg.max_threads;
        s.queue_depth = cfg.queue_depth;
        s.max_stack = cfg.max_stack;
        s.active = cfg.init_active;
        s.max_active_seen = cfg.init_active;
        s.slots = Some(Arc::new(SlotTable::new(cfg.max_threads)));

        let retries = cfg.stall_probe_retries;
        let sleep = cfg.stall_probe_sleep;
        let stall = thread::Builder::new()
            .name("gantry-stall".into())
            .spawn(move || self.stall_monitor(retries, sleep));
        match stall {
            Ok(handle) => s.stall_handle = Some(handle),
            Err(e) => {
                Self::reset(&mut s);
                return Err(Error::Spawn(e));
            }
        }

        if let Some(path) = cfg.jobserver {
            let channel = match jobserver::Channel::open(&path) {
                Ok(channel) => channel,
                Err(source) => {
                    self.unwind_startup(s);
                    return Err(Error::Jobserver { path, source });
                }
            };
            let monitor = thread::Builder::new()
                .name("gantry-jobserver".into())
                .spawn(move || jobserver::monitor(self, channel));
            match monitor {
                Ok(handle) => s.jobserver_handle = Some(handle),
                Err(e) => {
                    self.unwind_startup(s);
                    return Err(Error::Spawn(e));
                }
            }
        }

        debug!("scheduler started");
        Ok(())
    }

    /// Tears down a partially-started scheduler after a startup failure.
    #[cold]
    fn unwind_startup(&self, mut s: MutexGuard<'_, State>) {
        s.shutdown = true;
        self.stalled.notify_all();
        let stall = s.stall_handle.take();
        Self::reset(&mut s);
        drop(s);
        if let Some(handle) = stall {
            let _ = handle.join();
        }
    }

    /// Shuts the scheduler down: cancels queued tasks and blocked waits,
    /// signals and joins every helper and both monitor threads, releases the
    /// queue and slot storage, and returns the run's aggregate statistics.
    /// The scheduler may be started again afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler is not running.
    pub fn shutdown(&'static self) -> Stats {
        debug!("shutting down scheduler");

        let mut s = self.state.lock().unwrap();
        assert!(s.running, "scheduler is not running");
        s.shutdown = true;

        let mut remain = 0;
        for queue in &s.queues {
            remain += queue.mark_shutdown();
        }
        if let Some(slots) = &s.slots {
            slots.mark_shutdown();
        }

        // Wake everything so the shutdown flag is observed.
        self.slot_free.notify_all();
        self.work_ready.notify_all();
        self.stalled.notify_all();

        let helpers = mem::take(&mut s.helper_handles);
        let stall = s.stall_handle.take();
        let jobserver = s.jobserver_handle.take();
        drop(s);

        for handle in helpers {
            let _ = handle.join();
        }
        if let Some(handle) = stall {
            let _ = handle.join();
        }
        if let Some(handle) = jobserver {
            let _ = handle.join();
        }

        let mut s = self.state.lock().unwrap();
        let stats = Stats {
            thread_max_active: s.max_active_seen,
            thread_max_total: s.init_active + s.max_helpers_seen,
            thread_max_waiting: s.max_waiting_seen,
            task_queue_depth: s.queue_depth,
            task_queue_full: self.overflows.load(Ordering::Relaxed),
            task_queue_remain: remain,
            wait_slot_count: s.slots.as_ref().map_or(0, |t| t.len()),
            wait_slot_collisions: self.collisions.load(Ordering::Relaxed),
        };
        Self::reset(&mut s);
        drop(s);

        self.queued.store(0, Ordering::Relaxed);
        self.collisions.store(0, Ordering::Relaxed);
        self.overflows.store(0, Ordering::Relaxed);
        self.has_monitor.store(false, Ordering::Relaxed);

        debug!(
            max_active = stats.thread_max_active,
            remain = stats.task_queue_remain,
            "scheduler stopped"
        );
        stats
    }

    /// Restores the state to its pre-startup defaults.
    fn reset(s: &mut State) {
        s.running = false;
        s.shutdown = false;
        s.active = 0;
        s.waiting = 0;
        s.ready = 0;
        s.idle = 0;
        s.external = 0;
        s.helpers = 0;
        s.helpers_created = 0;
        s.slots = None;
        s.queues.clear();
        s.phases.clear();
        s.monitor = None;
        s.max_active_seen = 0;
        s.max_waiting_seen = 0;
        s.max_helpers_seen = 0;
    }

    /// Adjusts the concurrency ceiling, waiting first for the pool to go
    /// idle. Passing `0` restores the original ceiling. The new value is
    /// clamped between `init_active` and the original ceiling. Returns the
    /// previous effective ceiling.
    pub fn tune(&'static self, max_active: usize) -> usize {
        self.wait_idle();
        let mut s = self.state.lock().unwrap();
        let previous = s.max_active;
        s.max_active = if max_active == 0 {
            s.orig_max_active
        } else {
            max_active.clamp(s.init_active, s.orig_max_active)
        };
        if s.max_active > previous {
            self.slot_free.notify_all();
        }
        trace!(from = previous, to = s.max_active, "tuned concurrency ceiling");
        previous
    }

    /// Installs a progress observer on `counter`: whenever a decrement brings
    /// the value to `threshold` or below, `callback` is invoked with the
    /// observed value and returns the next threshold. Used by progress
    /// reporting; only one observer is installed at a time.
    pub fn monitor<F>(&'static self, counter: Arc<Counter>, threshold: usize, callback: F)
    where
        F: Fn(usize) -> usize + Send + Sync + 'static,
    {
        self.wait_idle();
        let mut s = self.state.lock().unwrap();
        s.monitor = Some(Arc::new(ProgressMonitor {
            counter,
            threshold: AtomicUsize::new(threshold),
            callback: Box::new(callback),
        }));
        self.has_monitor.store(true, Ordering::Release);
    }

    /// Busy-waits for the pool to settle. Administrative operations (`tune`,
    /// `monitor`, phase changes) are rare cold paths; a bounded-yield spin is
    /// simpler than threading another condition variable through every
    /// transition.
    fn wait_idle(&self) {
        let mut spins = 0u32;
        loop {
            {
                let s = self.state.lock().unwrap();
                let settled = !s.running
                    || s.shutdown
                    || (self.queued.load(Ordering::Acquire) == 0
                        && s.active <= s.init_active
                        && s.waiting == 0
                        && s.ready == 0);
                if settled {
                    break;
                }
            }
            spins += 1;
            if spins < 64 {
                thread::yield_now();
            } else {
                thread::sleep(Duration::from_micros(100));
            }
        }
    }

    /// An opaque identity for this scheduler, used to key thread-local queue
    /// lookups.
    fn id(&self) -> usize {
        // A static ref, so the address is stable for the program's lifetime.
        ptr::from_ref(self) as usize
    }
}

// -----------------------------------------------------------------------------
// Active-slot accounting

impl Scheduler {
    /// Reserves up to `n` active slots for a caller that wants to run work
    /// itself, without going through a task queue. Returns the number
    /// actually granted, which is zero whenever the scheduler is serial
    /// (`max_active == 1`).
    pub fn allocate(&'static self, n: usize) -> usize {
        let mut s = self.state.lock().unwrap();
        if s.max_active == 1 {
            return 0;
        }
        let free = s.max_active.saturating_sub(s.active);
        let granted = free.min(n);
        if granted > 0 {
            s.active += granted;
            if s.active > s.max_active_seen {
                s.max_active_seen = s.active;
            }
        }
        granted
    }

    /// Releases `n` slots previously obtained with [`Scheduler::allocate`],
    /// waking ready threads or idle helpers to use the freed capacity.
    pub fn deallocate(&'static self, n: usize) {
        if n == 0 {
            return;
        }
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.active >= n);
        s.active -= n;
        self.progress.fetch_add(1, Ordering::Relaxed);
        self.capacity_freed(&mut s, n);
    }

    /// Moves the calling thread out of the active state. With
    /// `external = true` the thread is about to block on something outside
    /// the scheduler's knowledge (typically a subprocess), and is excluded
    /// from deadlock detection; otherwise it counts as waiting on a counter.
    pub fn deactivate(&'static self, external: bool) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.shutdown {
            return Err(Error::Canceled);
        }
        debug_assert!(s.active > 0);
        s.active -= 1;
        if external {
            s.external += 1;
        } else {
            s.waiting += 1;
            if s.waiting > s.max_waiting_seen {
                s.max_waiting_seen = s.waiting;
            }
        }
        self.progress.fetch_add(1, Ordering::Relaxed);
        self.capacity_freed(&mut s, 1);
        Ok(())
    }

    /// Moves the calling thread back into the active state, competing for a
    /// slot like any newly-readying thread. The `external` flag must match
    /// the preceding [`Scheduler::deactivate`].
    pub fn activate(&'static self, external: bool) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if external {
            debug_assert!(s.external > 0);
            s.external -= 1;
        } else {
            debug_assert!(s.waiting > 0);
            s.waiting -= 1;
        }
        let (mut s, ok) = self.acquire_slot(s);
        if !ok {
            // Teardown. Keep the caller booked active anyway so that its
            // unwind path, which will deactivate or retire, stays balanced;
            // the ceiling no longer matters.
            s.active += 1;
            return Err(Error::Canceled);
        }
        drop(s);
        Ok(())
    }

    /// Blocks until an active slot is free, then takes it. Returns `false`
    /// if shutdown was observed instead.
    fn acquire_slot<'a>(
        &'a self,
        mut s: MutexGuard<'a, State>,
    ) -> (MutexGuard<'a, State>, bool) {
        while !s.shutdown && s.active >= s.max_active {
            s.ready += 1;
            s = self.slot_free.wait(s).unwrap();
            s.ready -= 1;
        }
        if s.shutdown {
            return (s, false);
        }
        s.active += 1;
        if s.active > s.max_active_seen {
            s.max_active_seen = s.active;
        }
        self.progress.fetch_add(1, Ordering::Relaxed);
        (s, true)
    }

    /// Called after active capacity is released: wakes threads that can use
    /// it and alerts the deadlock monitor if nothing can run at all.
    fn capacity_freed(&self, s: &mut State, n: usize) {
        if s.ready > 0 {
            if n > 1 {
                self.slot_free.notify_all();
            } else {
                self.slot_free.notify_one();
            }
        }
        if s.idle > 0 && self.queued.load(Ordering::Acquire) > 0 {
            if n > 1 {
                self.work_ready.notify_all();
            } else {
                self.work_ready.notify_one();
            }
        }
        if s.stall_suspected() {
            self.stalled.notify_one();
        }
    }

    /// Reserves one active slot on behalf of an external jobserver client,
    /// if one is free right now.
    pub(crate) fn try_reserve_slot(&'static self) -> bool {
        let mut s = self.state.lock().unwrap();
        if !s.running || s.shutdown || s.max_active == 1 {
            return false;
        }
        if s.active < s.max_active {
            s.active += 1;
            if s.active > s.max_active_seen {
                s.max_active_seen = s.active;
            }
            true
        } else {
            false
        }
    }

    /// Releases a slot reserved with [`Scheduler::try_reserve_slot`].
    pub(crate) fn release_reserved_slot(&'static self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.active > 0);
        s.active -= 1;
        self.progress.fetch_add(1, Ordering::Relaxed);
        self.capacity_freed(&mut s, 1);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.shutdown || !s.running
    }

    pub(crate) fn is_serial(&self) -> bool {
        self.state.lock().unwrap().max_active == 1
    }
}

// -----------------------------------------------------------------------------
// Task submission and completion waits

impl Scheduler {
    /// Submits deferred work against a completion counter.
    ///
    /// The counter is incremented immediately. The closure either runs inline
    /// on the calling thread (serial mode, shutdown, or the thread's queue is
    /// full) or is pushed onto the calling thread's queue for a helper to
    /// pick up; in both cases finishing the closure decrements the counter
    /// and resumes its waiters. Returns `true` if the task was queued,
    /// `false` if it ran inline.
    ///
    /// Must be called from a thread counted active (the startup thread, or
    /// inside a task already running on the pool).
    pub fn spawn<F>(&'static self, counter: &Arc<Counter>, f: F) -> Result<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        counter.increment();
        let task = Task::new(counter.clone(), f);

        let task = {
            let mut s = self.state.lock().unwrap();
            if s.running && !s.shutdown && s.max_active > 1 {
                let queue = self.local_queue(&mut s);
                match queue.push_back(task) {
                    Ok(()) => {
                        self.notify_work(&mut s)?;
                        return Ok(true);
                    }
                    // Queue full; fall back to synchronous execution.
                    Err(task) => task,
                }
            } else {
                task
            }
        };

        task.execute(self);
        Ok(false)
    }

    /// Wakes or creates a helper for freshly queued work.
    fn notify_work(&'static self, s: &mut State) -> Result<()> {
        if s.idle > 0 {
            self.work_ready.notify_one();
        } else if s.helpers < s.max_threads {
            self.create_helper(s)?;
        }
        Ok(())
    }

    /// Blocks until `counter` drops to `start_count` or below, helping with
    /// the calling thread's own backlog first. Returns the observed value.
    ///
    /// While stalled, the thread pops from the *back* of its own queue,
    /// preferring locally-produced work over the globally-queued backlog;
    /// only when its queue runs dry does it suspend on the counter.
    pub fn wait(&'static self, start_count: usize, counter: &Counter) -> Result<usize> {
        let value = counter.load();
        if value <= start_count {
            return Ok(value);
        }

        if let Some(queue) = self.thread_queue() {
            while counter.load() > start_count {
                let Some(task) = queue.pop_back() else { break };
                task.execute(self);
            }
        }

        self.suspend(start_count, counter)
    }

    /// Blocks until `counter` drops to `start_count` or below, without
    /// helping with queued work. The calling thread deactivates, parks on the
    /// counter's wait slot, and on wakeup competes for an active slot again.
    /// Returns the observed value.
    pub fn suspend(&'static self, start_count: usize, counter: &Counter) -> Result<usize> {
        let value = counter.load();
        if value <= start_count {
            return Ok(value);
        }

        let slots = {
            let s = self.state.lock().unwrap();
            match &s.slots {
                Some(table) => table.clone(),
                None => return Err(Error::Canceled),
            }
        };

        self.deactivate(false)?;
        let outcome = slots.wait(start_count, counter, &self.collisions);
        match &outcome {
            Ok(_) => self.activate(false)?,
            Err(_) => {
                // Canceled mid-wait. Re-book as active without competing for
                // a slot so the caller's own accounting stays balanced while
                // it unwinds.
                let mut s = self.state.lock().unwrap();
                s.waiting -= 1;
                s.active += 1;
            }
        }
        outcome
    }

    /// Wakes the threads suspended on `counter`. Called by whoever just
    /// decremented it; tasks submitted through [`Scheduler::spawn`] do this
    /// automatically.
    pub fn resume(&self, counter: &Counter) {
        self.progress.fetch_add(1, Ordering::Relaxed);
        if self.has_monitor.load(Ordering::Acquire) {
            self.check_monitor(counter);
        }
        let slots = self.state.lock().unwrap().slots.clone();
        if let Some(slots) = slots {
            slots.resume(counter);
        }
    }

    fn check_monitor(&self, counter: &Counter) {
        let monitor = self.state.lock().unwrap().monitor.clone();
        let Some(monitor) = monitor else { return };
        if !ptr::eq(Arc::as_ptr(&monitor.counter), ptr::from_ref(counter)) {
            return;
        }
        let value = counter.load();
        if value <= monitor.threshold.load(Ordering::Relaxed) {
            let next = (monitor.callback)(value);
            monitor.threshold.store(next, Ordering::Relaxed);
        }
    }

    /// The calling thread's registered queue, if it has one for this
    /// scheduler.
    fn thread_queue(&self) -> Option<Arc<TaskQueue>> {
        LOCAL_QUEUE.with(|slot| {
            let (owner, weak) = &*slot.borrow();
            if *owner == self.id() { weak.upgrade() } else { None }
        })
    }

    /// The calling thread's queue, creating and registering it on first use.
    fn local_queue(&'static self, s: &mut State) -> Arc<TaskQueue> {
        if let Some(queue) = self.thread_queue() {
            return queue;
        }
        let queue = Arc::new(TaskQueue::new(s.queue_depth, &self.queued, &self.overflows));
        s.queues.push(queue.clone());
        LOCAL_QUEUE.with(|slot| {
            *slot.borrow_mut() = (self.id(), Arc::downgrade(&queue));
        });
        trace!(queues = s.queues.len(), "registered task queue");
        queue
    }
}

// -----------------------------------------------------------------------------
// Phase transitions

impl Scheduler {
    /// Enters a new phase of the graph walk, hiding the current phase's
    /// queued backlog from the helpers that will serve the new phase.
    ///
    /// Queues are FIFO, so leftover old-phase tasks sit at the front and
    /// would be dequeued first by helpers woken for the new phase, yet an
    /// old-phase task cannot make progress until its phase resumes. Each
    /// queue's body is therefore swapped out (an O(1) move, not a copy) and
    /// its length subtracted from the queued-task total. The effective
    /// concurrency ceiling is also raised by the number of threads currently
    /// in transit between states, so those old-phase threads are not starved
    /// either.
    ///
    /// Phase transitions are globally serialized by the caller; this call
    /// must not race another `push_phase`/`pop_phase` or a submission.
    pub fn push_phase(&'static self) {
        let mut s = self.state.lock().unwrap();
        let mut saved = Vec::new();
        for queue in &s.queues {
            let body = queue.take_body();
            if !body.is_empty() {
                saved.push((queue.clone(), body));
            }
        }
        assert_eq!(
            self.queued.load(Ordering::Acquire),
            0,
            "tasks queued across a phase boundary"
        );
        let ceiling = s.max_active;
        let boost = s.ready;
        if boost > 0 {
            s.max_active += boost;
            self.slot_free.notify_all();
        }
        s.phases.push(PhaseSnapshot { saved, ceiling });
        trace!(depth = s.phases.len(), boost, "pushed phase");
    }

    /// Leaves the current phase, restoring the saved queue bodies and the
    /// previous concurrency ceiling. The new phase must have drained its own
    /// work completely before popping.
    pub fn pop_phase(&'static self) {
        let mut s = self.state.lock().unwrap();
        let snapshot = s
            .phases
            .pop()
            .expect("pop_phase without a matching push_phase");
        assert_eq!(
            self.queued.load(Ordering::Acquire),
            0,
            "tasks queued across a phase boundary"
        );
        for (queue, body) in snapshot.saved {
            queue.restore_body(body);
        }
        s.max_active = snapshot.ceiling;
        if s.idle > 0 && self.queued.load(Ordering::Acquire) > 0 {
            self.work_ready.notify_all();
        }
        trace!(depth = s.phases.len(), "popped phase");
    }
}

// -----------------------------------------------------------------------------
// Helper threads

impl Scheduler {
    /// Spawns one helper thread. On failure the reservation counters are
    /// rolled back and the error is propagated; the pool keeps running at its
    /// current size.
    fn create_helper(&'static self, s: &mut State) -> Result<()> {
        s.helpers += 1;
        s.helpers_created += 1;
        if s.helpers > s.max_helpers_seen {
            s.max_helpers_seen = s.helpers;
        }
        let index = s.helpers_created;
        let stack = s.max_stack.unwrap_or(DEFAULT_HELPER_STACK);
        let result = thread::Builder::new()
            .name(format!("gantry-helper-{index}"))
            .stack_size(stack)
            .spawn(move || self.helper_loop(index));
        match result {
            Ok(handle) => {
                trace!(index, "spawned helper");
                s.helper_handles.push(handle);
                Ok(())
            }
            Err(e) => {
                s.helpers -= 1;
                s.helpers_created -= 1;
                debug!("helper spawn failed: {e}");
                Err(Error::Spawn(e))
            }
        }
    }

    /// The main loop of a helper thread: become active when a slot is free,
    /// drain queue fronts until the queued-task count reaches zero, then park
    /// idle. Exits when shutdown is observed while idle.
    fn helper_loop(&'static self, index: u64) {
        let span = trace_span!("helper", index);
        let _enter = span.enter();
        trace!("starting helper");

        let mut s = self.state.lock().unwrap();
        loop {
            while !s.shutdown && self.queued.load(Ordering::Acquire) == 0 {
                s.idle += 1;
                s = self.work_ready.wait(s).unwrap();
                s.idle -= 1;
            }
            if s.shutdown {
                break;
            }

            let (guard, ok) = self.acquire_slot(s);
            s = guard;
            if !ok {
                break;
            }
            drop(s);

            self.drain();

            s = self.state.lock().unwrap();
            debug_assert!(s.active > 0);
            s.active -= 1;
            self.progress.fetch_add(1, Ordering::Relaxed);
            self.capacity_freed(&mut s, 1);
        }
        s.helpers -= 1;
        drop(s);

        trace!("exiting helper");
    }

    /// Executes queued tasks until the global queued count reaches zero.
    fn drain(&'static self) {
        while self.queued.load(Ordering::Acquire) > 0 {
            let Some(task) = self.steal() else { break };
            task.execute(self);
        }
    }

    /// Pops the front of any registered queue. Submission order is preserved
    /// within one queue; nothing is guaranteed across queues.
    fn steal(&'static self) -> Option<Task> {
        let queues = self.state.lock().unwrap().queues.clone();
        for queue in queues {
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
        }
        None
    }
}

// -----------------------------------------------------------------------------
// Deadlock monitor

impl Scheduler {
    /// The main loop of the deadlock monitor thread.
    ///
    /// The monitor sleeps until a transition leaves the pool with zero active
    /// and zero external threads while something waits. Because thread-state
    /// transitions are not atomic as a whole, that observation is only a
    /// *suspicion*: a thread moving waiting→ready→active passes through
    /// exactly this window. The monitor therefore samples the progress
    /// counter and re-checks over a bounded probe; only if the counts stay
    /// stalled and progress never advances is the situation declared a
    /// genuine cycle.
    fn stall_monitor(&'static self, retries: usize, sleep: Duration) {
        trace!("starting deadlock monitor");

        let mut s = self.state.lock().unwrap();
        'monitor: loop {
            while !s.shutdown && !s.stall_suspected() {
                s = self.stalled.wait(s).unwrap();
            }
            if s.shutdown {
                break;
            }
            let progress = self.progress.load(Ordering::Relaxed);
            drop(s);

            let mut benign = false;
            for attempt in 0..retries {
                if attempt < 16 {
                    thread::yield_now();
                } else {
                    thread::sleep(sleep);
                }
                let g = self.state.lock().unwrap();
                if g.shutdown {
                    s = g;
                    break 'monitor;
                }
                let resolved = !g.stall_suspected()
                    || self.progress.load(Ordering::Relaxed) != progress;
                drop(g);
                if resolved {
                    benign = true;
                    break;
                }
            }

            s = self.state.lock().unwrap();
            if s.shutdown {
                break;
            }
            if !benign
                && s.stall_suspected()
                && self.progress.load(Ordering::Relaxed) == progress
            {
                error!(
                    waiting = s.waiting,
                    queued = self.queued.load(Ordering::Relaxed),
                    "no thread can make progress"
                );
                eprintln!(
                    "gantry: {} thread(s) waiting with no runnable work; \
                     this is likely a dependency cycle; aborting",
                    s.waiting
                );
                process::abort();
            }
        }
        drop(s);

        trace!("exiting deadlock monitor");
    }
}
