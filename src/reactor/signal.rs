//! SIGINT/SIGTERM latch.
//!
//! The handler itself may only perform an async-signal-safe store; the latch
//! is a single `AtomicI32`, written once by whichever of the two signals
//! arrives first and read by the loop. Installed on the first step, not at
//! construction, matching the original C reactor's `installHandler` calls.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static LATCH: AtomicI32 = AtomicI32::new(0);

/// Whether the latch's current trip has already been logged, so
/// `is_tripped` reports a signal once per trip instead of once per poll
/// step.
static REPORTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(signum: c_int) {
    LATCH.store(signum, Ordering::SeqCst);
}

/// Installs SIGINT and SIGTERM handlers that set the process-wide latch.
///
/// Safe to call more than once; `libc::signal` simply reinstalls the same
/// handler each time.
pub(crate) fn install() {
    log::debug!(target: "reactor::signal", "Installing SIGINT/SIGTERM handlers");
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

/// Whether a captured signal is pending.
///
/// Logs the first time a trip is observed, not on every call, since this is
/// polled once per step.
pub(crate) fn is_tripped() -> bool {
    let signum = LATCH.load(Ordering::SeqCst);
    let tripped = signum != 0;
    if tripped && !REPORTED.swap(true, Ordering::SeqCst) {
        log::info!(target: "reactor::signal", "Caught signal {signum}");
    }
    tripped
}

/// Resets the latch to zero.
pub(crate) fn clear() {
    LATCH.store(0, Ordering::SeqCst);
    REPORTED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests share process-wide signal state with each other, and with
    // `reactor::tests`, which also installs/clears this latch via `iterate`;
    // both test modules serialize on the same lock rather than relying on
    // test-runner isolation.
    use crate::reactor::TEST_SERIAL;

    #[test]
    fn latch_starts_clear() {
        let _guard = TEST_SERIAL.lock().unwrap();
        clear();
        assert!(!is_tripped());
    }

    #[test]
    fn raising_sigint_trips_the_latch() {
        let _guard = TEST_SERIAL.lock().unwrap();
        clear();
        install();
        unsafe {
            libc::raise(libc::SIGINT);
        }
        assert!(is_tripped());
        clear();
        assert!(!is_tripped());
    }
}
