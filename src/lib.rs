//! A concurrent task scheduler for parallel build-graph execution.
//!
//! Gantry drives the parallel walk of a build dependency graph: a pool of
//! native threads cooperating through explicit thread accounting (active,
//! waiting, ready, idle), per-thread bounded work queues, phase-scoped queue
//! isolation, a fuzzy deadlock monitor, and an optional token-over-pipe
//! protocol compatible with the make jobserver convention.
//!
//! This is not a general-purpose thread pool. It is purpose-built for one
//! producer/consumer pattern: recursive fan-out/fan-in execution of graph
//! nodes, where a thread submits work against a completion counter with
//! [`Scheduler::spawn`] and later blocks on that counter with
//! [`Scheduler::wait`]. There is no fair scheduling, no priorities, and no
//! preemption. All blocking is real OS-thread blocking on mutexes and
//! condition variables.
//!
//! # Usage
//!
//! A [`Scheduler`] is const-constructed, brought up with [`Scheduler::startup`]
//! and torn down (returning aggregate [`Stats`]) with [`Scheduler::shutdown`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use gantry::{Config, Counter, Scheduler};
//!
//! static SCHED: Scheduler = Scheduler::new();
//!
//! fn main() -> gantry::Result<()> {
//!     SCHED.startup(Config::new(4))?;
//!
//!     let done = Arc::new(Counter::new(0));
//!     for _ in 0..100 {
//!         SCHED.spawn(&done, || { /* build something */ })?;
//!     }
//!     SCHED.wait(0, &done)?;
//!
//!     let stats = SCHED.shutdown();
//!     assert_eq!(stats.task_queue_remain, 0);
//!     Ok(())
//! }
//! ```
//!
//! Higher layers (rule matching, compilation, install) never manage threads
//! themselves; they submit work, block on counters, and bracket mutually
//! exclusive stages of the graph walk with [`Scheduler::push_phase`] /
//! [`Scheduler::pop_phase`].

// -----------------------------------------------------------------------------
// Modules

mod config;
mod error;
mod jobserver;
mod queue;
mod scheduler;
mod target;
mod task;
mod unwind;
mod wait;

// -----------------------------------------------------------------------------
// Top-level exports

pub use config::Config;
pub use error::Error;
pub use error::Result;
pub use scheduler::Scheduler;
pub use scheduler::Stats;
pub use target::TargetGuard;
pub use target::TargetLock;
pub use wait::Counter;
