//! Signal dispositions for the master and its connection workers.
//!
//! The termination flag is process-global because a signal handler can reach
//! nothing else. It is written only from the handler and read only between
//! accepts in the master and once at worker start.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static TERMINATE: AtomicBool = AtomicBool::new(false);
static FATAL_SIGNAL: AtomicI32 = AtomicI32::new(0);

const SEGV_MESSAGE: &[u8] = b"ceod: segmentation fault\n";

#[allow(unsafe_code)]
extern "C" fn on_signal(sig: libc::c_int) {
    match sig {
        libc::SIGINT | libc::SIGTERM => {
            FATAL_SIGNAL.store(sig, Ordering::SeqCst);
            TERMINATE.store(true, Ordering::SeqCst);
            // A second signal of the same kind kills the process outright.
            // SAFETY: `signal` is async-signal-safe.
            unsafe {
                libc::signal(sig, libc::SIG_DFL);
            }
        },
        // SAFETY: `write`, `signal` and `raise` are async-signal-safe and
        // the message is a static buffer.
        libc::SIGSEGV => unsafe {
            libc::write(
                libc::STDERR_FILENO,
                SEGV_MESSAGE.as_ptr().cast(),
                SEGV_MESSAGE.len(),
            );
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        },
        _ => {},
    }
}

#[allow(unsafe_code)]
fn set(signal: Signal, handler: SigHandler) -> io::Result<()> {
    // No SA_RESTART: a blocked accept must return EINTR so the master can
    // observe the termination flag.
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: `on_signal` only touches atomics and async-signal-safe libc
    // calls.
    unsafe { sigaction(signal, &action) }.map_err(io::Error::from)?;
    Ok(())
}

/// Install the master's dispositions.
///
/// Interrupt and terminate request shutdown. Child exits and broken pipes
/// are ignored; with `SIGCHLD` ignored the kernel reaps workers.
///
/// # Errors
///
/// Returns the `sigaction` error.
pub fn install_master() -> io::Result<()> {
    set(Signal::SIGINT, SigHandler::Handler(on_signal))?;
    set(Signal::SIGTERM, SigHandler::Handler(on_signal))?;
    set(Signal::SIGSEGV, SigHandler::Handler(on_signal))?;
    set(Signal::SIGPIPE, SigHandler::SigIgn)?;
    set(Signal::SIGCHLD, SigHandler::SigIgn)?;
    Ok(())
}

/// Install a freshly forked worker's dispositions.
///
/// If the master had already been asked to terminate when this worker was
/// forked, the recorded signal is re-raised with its default action and
/// this function does not return.
///
/// # Errors
///
/// Returns the `sigaction` or `raise` error.
pub fn install_worker() -> io::Result<()> {
    set(Signal::SIGINT, SigHandler::SigDfl)?;
    set(Signal::SIGTERM, SigHandler::SigDfl)?;
    set(Signal::SIGSEGV, SigHandler::Handler(on_signal))?;
    set(Signal::SIGPIPE, SigHandler::SigIgn)?;
    // Operation subprocesses are waited for explicitly.
    set(Signal::SIGCHLD, SigHandler::SigDfl)?;

    if let Some(signal) = termination_signal() {
        nix::sys::signal::raise(signal).map_err(io::Error::from)?;
    }
    Ok(())
}

/// The signal that requested shutdown, if any.
#[must_use]
pub fn termination_signal() -> Option<Signal> {
    if !TERMINATE.load(Ordering::SeqCst) {
        return None;
    }
    Signal::try_from(FATAL_SIGNAL.load(Ordering::SeqCst)).ok()
}

/// Human-readable shutdown reason for a termination signal.
#[must_use]
pub const fn shutdown_reason(signal: Signal) -> &'static str {
    match signal {
        Signal::SIGINT => "interrupt",
        Signal::SIGTERM => "terminated",
        _ => "signal",
    }
}
