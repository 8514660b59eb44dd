//! Panic containment for task execution.

use std::process::abort;

/// Aborts the program when dropped.
///
/// A task closure that panics would otherwise unwind through the helper loop
/// with its completion counter never decremented, leaving every dependent
/// blocked. There is no owner to report that to, so the executing thread arms
/// one of these before calling into the closure and forgets it on the way
/// out.
pub struct AbortOnDrop(pub &'static str);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        eprintln!("gantry: {}; aborting", self.0);
        abort();
    }
}
