//! Error types for scheduler operations.
//!
//! Nothing in this crate is silently retried. Thread-creation failure is
//! rolled back and surfaced to the caller that asked for more parallelism;
//! a shutdown observed mid-wait is reported as [`Error::Canceled`] so that
//! callers can tell intentional teardown apart from an actual fault.

use std::io;
use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error returned by a scheduler operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The scheduler was shut down while the operation was blocked or in
    /// progress. This is the cancellation signal, not a fault: every blocking
    /// wait observes the shutdown flag and unwinds with this error instead of
    /// silently returning success.
    #[error("scheduler shut down while the operation was in progress")]
    Canceled,

    /// A helper thread could not be created. The reservation counters have
    /// already been rolled back; the pool itself is still healthy and the
    /// caller may continue at the current level of parallelism.
    #[error("failed to spawn a helper thread")]
    Spawn(#[source] io::Error),

    /// The jobserver pipe could not be opened at startup.
    #[error("failed to open jobserver pipe {path}")]
    Jobserver {
        /// Path of the FIFO that was passed in the configuration.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
}
