//! Suspend/resume correctness: no missed wakeups, shared-slot broadcast,
//! deadlock-monitor false-positive resistance, and target locking.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use gantry::Config;
use gantry::Counter;
use gantry::Scheduler;
use gantry::TargetLock;

fn scheduler() -> &'static Scheduler {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .without_time()
        .try_init();
    Box::leak(Box::new(Scheduler::new()))
}

#[test]
fn one_resume_wakes_every_waiter() {
    let sched = scheduler();
    sched.startup(Config::new(3)).unwrap();

    // Two tasks suspend on the same counter; by construction they share a
    // wait slot, and a single resume must wake both.
    let gate = Arc::new(Counter::new(1));
    let done = Arc::new(Counter::new(0));
    let woken = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let gate = gate.clone();
        let woken = woken.clone();
        sched
            .spawn(&done, move || {
                if sched.suspend(0, &gate).is_ok() {
                    woken.fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
    }

    // Let both park, then release once.
    thread::sleep(Duration::from_millis(100));
    gate.decrement();
    sched.resume(&gate);

    sched.wait(0, &done).unwrap();
    assert_eq!(woken.load(Ordering::Relaxed), 2);

    sched.shutdown();
}

#[test]
fn wakeups_are_never_missed() {
    let sched = scheduler();
    sched.startup(Config::new(2)).unwrap();

    // A tight producer/consumer race: the helper's decrement-and-resume
    // races the waiter's check-then-suspend. A missed wakeup hangs the test.
    for _ in 0..5_000 {
        let c = Arc::new(Counter::new(0));
        sched.spawn(&c, || {}).unwrap();
        assert_eq!(sched.wait(0, &c).unwrap(), 0);
    }

    sched.shutdown();
}

#[test]
fn churn_does_not_trip_the_deadlock_monitor() {
    let sched = scheduler();
    // Default probe constants: the monitor is armed and must stay quiet.
    sched.startup(Config::new(2)).unwrap();

    // Constant suspend/resume churn drives the pool through the
    // zero-active window over and over; none of it is a real stall, so a
    // single false positive aborts the test binary.
    for _ in 0..10_000 {
        let c = Arc::new(Counter::new(0));
        sched.spawn(&c, || {}).unwrap();
        sched.suspend(0, &c).unwrap();
    }

    let stats = sched.shutdown();
    assert_eq!(stats.task_queue_remain, 0);
}

#[test]
fn target_lock_excludes_concurrent_actions() {
    let sched = scheduler();
    sched.startup(Config::new(4)).unwrap();

    let lock: &'static TargetLock = Box::leak(Box::new(TargetLock::new()));
    let done = Arc::new(Counter::new(0));
    let in_section = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let in_section = in_section.clone();
        let max_seen = max_seen.clone();
        sched
            .spawn(&done, move || {
                let _guard = lock.acquire(sched).unwrap();
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                in_section.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    sched.wait(0, &done).unwrap();
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);

    sched.shutdown();
}

#[test]
fn try_acquire_reports_a_busy_target() {
    let sched = scheduler();
    sched.startup(Config::new(2)).unwrap();

    let lock = TargetLock::new();
    let first = lock.try_acquire(sched);
    assert!(first.is_some());
    assert!(lock.try_acquire(sched).is_none());
    drop(first);
    assert!(lock.try_acquire(sched).is_some());

    sched.shutdown();
}
