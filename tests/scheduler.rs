//! Integration tests for the scheduler core: lifecycle, task submission,
//! slot accounting, and tuning.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use gantry::Config;
use gantry::Counter;
use gantry::Error;
use gantry::Scheduler;

fn scheduler() -> &'static Scheduler {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .without_time()
        .try_init();
    Box::leak(Box::new(Scheduler::new()))
}

#[test]
fn startup_and_shutdown() {
    let sched = scheduler();
    sched.startup(Config::new(4)).unwrap();
    let stats = sched.shutdown();
    assert_eq!(stats.task_queue_remain, 0);
    assert_eq!(stats.task_queue_full, 0);
}

#[test]
fn restart_after_shutdown() {
    let sched = scheduler();
    for _ in 0..3 {
        sched.startup(Config::new(2)).unwrap();
        let done = Arc::new(Counter::new(0));
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits = hits.clone();
            sched
                .spawn(&done, move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        assert_eq!(sched.wait(0, &done).unwrap(), 0);
        assert_eq!(hits.load(Ordering::Relaxed), 10);
        sched.shutdown();
    }
}

#[test]
fn hundred_independent_tasks() {
    let sched = scheduler();
    sched.startup(Config::new(4)).unwrap();

    let done = Arc::new(Counter::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let hits = hits.clone();
        sched
            .spawn(&done, move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }
    assert_eq!(sched.wait(0, &done).unwrap(), 0);
    assert_eq!(hits.load(Ordering::Relaxed), 100);

    let stats = sched.shutdown();
    assert_eq!(stats.task_queue_remain, 0);
    assert!(stats.thread_max_active <= 4);
}

#[test]
fn serial_mode_runs_inline() {
    let sched = scheduler();
    sched.startup(Config::serial()).unwrap();

    let done = Arc::new(Counter::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let queued = sched
        .spawn(&done, move || {
            h.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    // Serial mode never defers: the closure has already run by the time
    // spawn returns.
    assert!(!queued);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert_eq!(done.load(), 0);

    // And there are no extra slots to hand out.
    assert_eq!(sched.allocate(4), 0);

    let stats = sched.shutdown();
    assert_eq!(stats.thread_max_total, 1);
}

#[test]
fn recursive_fan_out_observed_exactly_once() {
    let sched = scheduler();
    sched.startup(Config::new(4)).unwrap();

    // Eight producers each submit sixteen consumers against the same
    // counter; the final sum proves every task ran exactly once.
    let done = Arc::new(Counter::new(0));
    let sum = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let inner_done = done.clone();
        let sum = sum.clone();
        sched
            .spawn(&done, move || {
                for _ in 0..16 {
                    let sum = sum.clone();
                    sched
                        .spawn(&inner_done, move || {
                            sum.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                }
            })
            .unwrap();
    }
    assert_eq!(sched.wait(0, &done).unwrap(), 0);
    assert_eq!(sum.load(Ordering::Relaxed), 128);

    let stats = sched.shutdown();
    assert_eq!(stats.task_queue_remain, 0);
}

#[test]
fn allocate_respects_the_ceiling() {
    let sched = scheduler();
    sched.startup(Config::new(4)).unwrap();

    // The startup thread holds one of the four slots.
    let granted = sched.allocate(16);
    assert_eq!(granted, 3);
    assert_eq!(sched.allocate(1), 0);

    sched.deallocate(granted);
    assert_eq!(sched.allocate(2), 2);
    sched.deallocate(2);

    sched.shutdown();
}

#[test]
fn tune_clamps_and_returns_previous() {
    let sched = scheduler();
    sched.startup(Config::new(4)).unwrap();

    assert_eq!(sched.tune(2), 4);
    // Raising past the original ceiling clamps back to it.
    assert_eq!(sched.tune(64), 2);
    // Zero restores the original ceiling.
    assert_eq!(sched.tune(0), 4);

    sched.shutdown();
}

#[test]
fn external_deactivation_round_trip() {
    let sched = scheduler();
    sched.startup(Config::new(2)).unwrap();

    // What a caller does around blocking on a subprocess.
    sched.deactivate(true).unwrap();
    sched.activate(true).unwrap();

    sched.shutdown();
}

#[test]
fn shutdown_cancels_blocked_waits() {
    let sched = scheduler();
    sched.startup(Config::new(2)).unwrap();

    let never = Arc::new(Counter::new(1));
    let done = Arc::new(Counter::new(0));
    let canceled = Arc::new(AtomicUsize::new(0));
    {
        let never = never.clone();
        let canceled = canceled.clone();
        sched
            .spawn(&done, move || {
                if matches!(sched.wait(0, &never), Err(Error::Canceled)) {
                    canceled.fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
    }

    // Give the task time to block on the counter, then tear down.
    thread::sleep(Duration::from_millis(100));
    sched.shutdown();
    assert_eq!(canceled.load(Ordering::Relaxed), 1);
}

#[test]
fn full_queue_falls_back_to_inline() {
    let sched = scheduler();
    let mut cfg = Config::new(2);
    cfg.max_threads = Some(1);
    cfg.queue_depth = Some(4);
    sched.startup(cfg).unwrap();

    // Plug the only helper so nothing drains the queue.
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

    let done = Arc::new(Counter::new(0));
    let mut queued = 0;
    let mut inline = 0;
    for _ in 0..10 {
        if sched.spawn(&done, || {}).unwrap() {
            queued += 1;
        } else {
            inline += 1;
        }
    }
    assert_eq!(queued, 4);
    assert_eq!(inline, 6);

    gate.decrement();
    sched.resume(&gate);
    sched.wait(0, &plug_done).unwrap();
    sched.wait(0, &done).unwrap();

    let stats = sched.shutdown();
    assert_eq!(stats.task_queue_full, 6);
    assert_eq!(stats.task_queue_remain, 0);
    assert_eq!(stats.task_queue_depth, 4);
}

#[test]
fn progress_monitor_fires_on_threshold() {
    let sched = scheduler();
    sched.startup(Config::new(2)).unwrap();

    let work = Arc::new(Counter::new(0));
    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    sched.monitor(work.clone(), 50, move |value| {
        observed.fetch_add(1, Ordering::Relaxed);
        value.saturating_sub(10)
    });

    for _ in 0..100 {
        sched.spawn(&work, || {}).unwrap();
    }
    sched.wait(0, &work).unwrap();
    assert!(fired.load(Ordering::Relaxed) >= 1);

    sched.shutdown();
}
