//! Cooperation with an external concurrency coordinator over a named pipe.
//!
//! The wire format is the make jobserver convention: one arbitrary byte in
//! the pipe represents one unit of permitted concurrency, a client claims a
//! unit by reading a byte and returns it by writing one back. There is no
//! framing and no handshake, so any third-party coordinator that speaks the
//! convention interoperates.
//!
//! The monitor keeps exactly one "advance" token sitting in the pipe whenever
//! it is not in debt. A client consuming that token is asking for one unit of
//! our budget: the monitor backs it by reserving a local active slot and
//! writes the next advance token. If no slot is free the monitor records a
//! *debt* (a consumed token it could not back) and stops advancing tokens
//! until the debt is paid (a slot frees up) or cancelled (the client returns
//! the token). Surplus bytes in the pipe are returned tokens; each one
//! releases the corresponding reserved slot and is withdrawn.
//!
//! Accounting invariant: `active <= issued <= active + 1`, and a debt implies
//! `active == issued - 1`. A violation still present after the final drain
//! means a client leaked a token, which cannot be recovered mid-run; it is
//! reported and the process is deliberately terminated.

use std::ffi::CString;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process;
use std::thread;
use std::time::Duration;

use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::scheduler::Scheduler;

/// The byte we place in the pipe. Clients may write any byte back; only the
/// count matters.
const TOKEN: u8 = b'+';

/// Poll backoff: immediately after activity the monitor re-polls at once to
/// catch fast consume/return cycles, otherwise it backs off linearly.
const POLL_STEP: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(50);

// -----------------------------------------------------------------------------
// Pipe access

/// A non-blocking handle on the jobserver FIFO.
pub(crate) struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Opens the FIFO at `path` for both ends without blocking. Opening a
    /// FIFO read-write means the open itself never blocks waiting for a peer
    /// and the pipe never reports EOF while we hold it.
    pub fn open(path: &Path) -> io::Result<Channel> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: `cpath` is a valid NUL-terminated string and the flags are
        // a plain open; no buffers are involved.
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by a successful `open` and is owned
        // by no one else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Channel { fd })
    }

    /// Reads one token, or `None` when the pipe is empty.
    fn read_token(&self) -> io::Result<Option<u8>> {
        let mut byte = 0u8;
        // SAFETY: the fd is valid for the lifetime of `self` and the buffer
        // is a valid, writable single byte.
        let n = unsafe { libc::read(self.fd.as_raw_fd(), (&raw mut byte).cast(), 1) };
        match n {
            1 => Ok(Some(byte)),
            0 => Ok(None),
            _ => {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Writes one token into the pipe.
    fn write_token(&self) -> io::Result<()> {
        let byte = TOKEN;
        // SAFETY: the fd is valid for the lifetime of `self` and the buffer
        // is a valid single byte.
        let n = unsafe { libc::write(self.fd.as_raw_fd(), (&raw const byte).cast(), 1) };
        if n == 1 {
            Ok(())
        } else if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Err(io::Error::from(io::ErrorKind::WriteZero))
        }
    }
}

// -----------------------------------------------------------------------------
// Token accounting

#[derive(Debug)]
struct Tokens {
    /// Tokens written to the pipe and not yet withdrawn by us.
    issued: usize,
    /// Tokens held by clients that are backed by a reserved active slot.
    active: usize,
    /// A consumed token that could not be granted a slot.
    debt: bool,
}

impl Tokens {
    fn consistent(&self) -> bool {
        self.active <= self.issued
            && self.issued <= self.active + 1
            && (!self.debt || self.active + 1 == self.issued)
    }
}

// -----------------------------------------------------------------------------
// Monitor loop

/// The main loop of the jobserver monitor thread.
pub(crate) fn monitor(sched: &'static Scheduler, channel: Channel) {
    trace!("starting jobserver monitor");

    let mut tokens = Tokens {
        issued: 0,
        active: 0,
        debt: false,
    };

    if let Err(e) = channel.write_token() {
        error!("jobserver pipe write failed: {e}");
        return;
    }
    tokens.issued += 1;

    let mut delay = Duration::ZERO;
    loop {
        if sched.is_shutting_down() {
            break;
        }

        // Withdraw whatever is in the pipe, one byte at a time.
        let mut withdrawn = 0usize;
        loop {
            match channel.read_token() {
                Ok(Some(_)) => withdrawn += 1,
                Ok(None) => break,
                Err(e) => {
                    error!("jobserver pipe read failed: {e}");
                    return;
                }
            }
        }

        let mut activity = false;
        if withdrawn == 0 {
            if !tokens.debt {
                if tokens.issued > tokens.active {
                    // The advance token is gone: a client claimed a unit of
                    // our budget. Back it with a local slot, or go into debt.
                    if sched.try_reserve_slot() {
                        tokens.active += 1;
                        if place_token(&channel, &mut tokens).is_err() {
                            return;
                        }
                        trace!(active = tokens.active, "granted token to client");
                    } else {
                        tokens.debt = true;
                        debug!("jobserver token consumed with no free slot; in debt");
                    }
                    activity = true;
                }
            } else if sched.try_reserve_slot() {
                // A local slot freed up; the debt is paid.
                tokens.active += 1;
                tokens.debt = false;
                if place_token(&channel, &mut tokens).is_err() {
                    return;
                }
                debug!(active = tokens.active, "jobserver debt paid");
                activity = true;
            }
        } else {
            tokens.issued -= withdrawn;
            let mut returned = withdrawn;
            if tokens.debt {
                // The unbacked token came home unconsumed; debt cancelled.
                tokens.debt = false;
                returned -= 1;
                debug!("jobserver debt cancelled by returned token");
                activity = true;
            } else {
                // One of the withdrawn bytes was our own advance token.
                returned -= 1;
            }
            for _ in 0..returned {
                debug_assert!(tokens.active > 0);
                tokens.active -= 1;
                sched.release_reserved_slot();
                trace!(active = tokens.active, "client returned token");
                activity = true;
            }
            if place_token(&channel, &mut tokens).is_err() {
                return;
            }
        }

        debug_assert!(tokens.consistent(), "jobserver accounting drifted");

        // A debt that persists while the scheduler is serial can never be
        // paid locally; that is an accounting violation, not a wait.
        if tokens.debt && sched.is_serial() {
            violation(&tokens, "token consumed while tuned serial");
        }

        if activity {
            delay = Duration::ZERO;
            thread::yield_now();
        } else {
            delay = (delay + POLL_STEP).min(POLL_MAX);
            thread::sleep(delay);
        }
    }

    settle(sched, &channel, &mut tokens);
    trace!("exiting jobserver monitor");
}

/// Puts the advance token back in the pipe.
fn place_token(channel: &Channel, tokens: &mut Tokens) -> io::Result<()> {
    match channel.write_token() {
        Ok(()) => {
            tokens.issued += 1;
            Ok(())
        }
        Err(e) => {
            error!("jobserver pipe write failed: {e}");
            Err(e)
        }
    }
}

/// Reclaims every outstanding token at shutdown. Clients are expected to
/// have returned everything; the pipe is drained with a short grace period
/// and the books must balance to exactly the withdrawn advance token.
fn settle(sched: &'static Scheduler, channel: &Channel, tokens: &mut Tokens) {
    for _ in 0..20 {
        loop {
            match channel.read_token() {
                Ok(Some(_)) => {
                    debug_assert!(tokens.issued > 0);
                    tokens.issued -= 1;
                    if tokens.debt {
                        tokens.debt = false;
                    } else if tokens.issued < tokens.active {
                        // More came back than the advance token: a client
                        // returned a granted unit.
                        tokens.active -= 1;
                        sched.release_reserved_slot();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("jobserver pipe read failed during settle: {e}");
                    return;
                }
            }
        }
        if tokens.issued == 0 && tokens.active == 0 && !tokens.debt {
            debug!("jobserver settled cleanly");
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    violation(tokens, "tokens leaked at shutdown");
}

/// Reports a broken token invariant and terminates. A leaked external token
/// cannot be safely recovered mid-run.
fn violation(tokens: &Tokens, what: &str) -> ! {
    error!(
        issued = tokens.issued,
        active = tokens.active,
        debt = tokens.debt,
        "jobserver protocol violation: {what}"
    );
    eprintln!(
        "gantry: jobserver protocol violation ({what}): \
         {} issued, {} active, debt {}; aborting",
        tokens.issued, tokens.active, tokens.debt
    );
    process::abort();
}
