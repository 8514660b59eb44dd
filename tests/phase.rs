//! Phase transitions: one phase's queued backlog must be invisible to the
//! helpers serving another phase, and must come back intact and in order.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;

use gantry::Config;
use gantry::Counter;
use gantry::Scheduler;

fn scheduler() -> &'static Scheduler {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .without_time()
        .try_init();
    Box::leak(Box::new(Scheduler::new()))
}

#[test]
fn pushed_phase_hides_the_backlog() {
    let sched = scheduler();
    let mut cfg = Config::new(2);
    // Exactly one helper, which we plug for the duration of the phase.
    cfg.max_threads = Some(1);
    sched.startup(cfg).unwrap();

    let gate = Arc::new(Counter::new(1));
    let plug_done = Arc::new(Counter::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    {
        let gate = gate.clone();
        let started = started.clone();
        sched
            .spawn(&plug_done, move || {
                started.fetch_add(1, Ordering::Relaxed);
                let _ = sched.wait(0, &gate);
            })
            .unwrap();
    }
    while started.load(Ordering::Relaxed) == 0 {
        thread::yield_now();
    }

    // Queue the old-phase backlog; the helper is plugged, so it stays put.
    let old_done = Arc::new(Counter::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let order = order.clone();
        sched
            .spawn(&old_done, move || {
                order.lock().unwrap().push(i);
            })
            .unwrap();
    }

    sched.push_phase();

    // Submit and fully drain unrelated work in the new phase. None of the
    // old tasks may run here.
    let new_done = Arc::new(Counter::new(0));
    let new_hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let new_hits = new_hits.clone();
        sched
            .spawn(&new_done, move || {
                new_hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }
    sched.wait(0, &new_done).unwrap();
    assert_eq!(new_hits.load(Ordering::Relaxed), 3);
    assert!(order.lock().unwrap().is_empty());

    sched.pop_phase();

    // Unplug the helper. Suspend (rather than wait) so the helper alone
    // drains the restored backlog, which makes the order deterministic.
    gate.decrement();
    sched.resume(&gate);
    sched.suspend(0, &plug_done).unwrap();
    sched.suspend(0, &old_done).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    let stats = sched.shutdown();
    assert_eq!(stats.task_queue_remain, 0);
}

#[test]
fn nested_phases_restore_in_reverse() {
    let sched = scheduler();
    let mut cfg = Config::new(2);
    cfg.max_threads = Some(1);
    sched.startup(cfg).unwrap();

    let gate = Arc::new(Counter::new(1));
    let plug_done = Arc::new(Counter::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    {
        let gate = gate.clone();
        let started = started.clone();
        sched
            .spawn(&plug_done, move || {
                started.fetch_add(1, Ordering::Relaxed);
                let _ = sched.wait(0, &gate);
            })
            .unwrap();
    }
    while started.load(Ordering::Relaxed) == 0 {
        thread::yield_now();
    }

    let outer_done = Arc::new(Counter::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let hits = hits.clone();
        sched
            .spawn(&outer_done, move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    sched.push_phase();

    let inner_done = Arc::new(Counter::new(0));
    for _ in 0..2 {
        let hits = hits.clone();
        sched
            .spawn(&inner_done, move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    // Nest once more; the inner backlog disappears in turn.
    sched.push_phase();
    sched.pop_phase();

    // Drain the middle phase before popping back to the outer one.
    sched.wait(0, &inner_done).unwrap();
    sched.pop_phase();

    gate.decrement();
    sched.resume(&gate);
    sched.suspend(0, &plug_done).unwrap();
    sched.suspend(0, &outer_done).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 4);

    let stats = sched.shutdown();
    assert_eq!(stats.task_queue_remain, 0);
}
