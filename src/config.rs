//! Scheduler configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration consumed by [`Scheduler::startup`](crate::Scheduler::startup).
///
/// Only `max_active` is required; everything else has a derived default.
/// Unset options are resolved against `max_active` at startup, so a plain
/// `Config::new(n)` is the common case.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of threads simultaneously permitted to run graph work.
    /// This is the concurrency ceiling that `tune` adjusts at runtime; it can
    /// never be raised above this original value.
    pub max_active: usize,

    /// Number of threads already counted as active at startup, normally 1
    /// (the thread that calls `startup` and will drive the graph walk).
    pub init_active: usize,

    /// Ceiling on helper threads. Helpers routinely block on prerequisites,
    /// so the pool over-subscribes: the default is `max_active` multiplied by
    /// the pointer width in bytes (8 on 64-bit targets).
    pub max_threads: Option<usize>,

    /// Capacity of each per-thread task queue. Defaults to `8 * max_active`.
    pub queue_depth: Option<usize>,

    /// Stack size for helper threads. When unset, helpers get a fixed 8 MiB
    /// stack rather than inheriting whatever the platform default happens to
    /// be.
    pub max_stack: Option<usize>,

    /// Path of a named pipe (FIFO) on which to run the jobserver monitor.
    /// When set, single-byte concurrency tokens are exchanged with external
    /// coordinators over this pipe, make-jobserver style.
    pub jobserver: Option<PathBuf>,

    /// Number of probe iterations the deadlock monitor performs before
    /// declaring a stall fatal. The probe exists to filter out threads caught
    /// mid-transition; the exact value is an empirical tuning knob, not a
    /// provable bound, which is why it is configuration rather than a
    /// constant.
    pub stall_probe_retries: usize,

    /// Sleep between the later probe iterations (the first few just yield).
    pub stall_probe_sleep: Duration,
}

impl Config {
    /// Creates a configuration with the given concurrency ceiling and
    /// defaults for everything else.
    pub fn new(max_active: usize) -> Config {
        Config {
            max_active,
            init_active: 1,
            max_threads: None,
            queue_depth: None,
            max_stack: None,
            jobserver: None,
            stall_probe_retries: 64,
            stall_probe_sleep: Duration::from_millis(2),
        }
    }

    /// Creates a serial (single-threaded) configuration. Work submitted to a
    /// serial scheduler executes inline and no helpers are ever spawned.
    pub fn serial() -> Config {
        Config::new(1)
    }

    /// Resolves derived defaults. Called once at startup.
    pub(crate) fn resolved(&self) -> Resolved {
        let max_active = self.max_active.max(1);
        let init_active = self.init_active.clamp(1, max_active);
        let max_threads = match self.max_threads {
            Some(n) => n,
            // Helpers spend most of their life blocked on prerequisites, so
            // allow considerably more of them than can run at once.
            None => max_active * size_of::<usize>(),
        };
        let queue_depth = match self.queue_depth {
            Some(n) => n.max(1),
            None => 8 * max_active,
        };
        Resolved {
            max_active,
            init_active,
            max_threads,
            queue_depth,
            max_stack: self.max_stack,
            jobserver: self.jobserver.clone(),
            stall_probe_retries: self.stall_probe_retries,
            stall_probe_sleep: self.stall_probe_sleep,
        }
    }
}

/// A configuration with every default filled in.
#[derive(Clone, Debug)]
pub(crate) struct Resolved {
    pub max_active: usize,
    pub init_active: usize,
    pub max_threads: usize,
    pub queue_depth: usize,
    pub max_stack: Option<usize>,
    pub jobserver: Option<PathBuf>,
    pub stall_probe_retries: usize,
    pub stall_probe_sleep: Duration,
}
