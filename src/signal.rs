//! Unix signal handling (SIGINT).
//!
//! The first SIGINT only flips a flag that the build delegate reports as
//! cancellation: running tasks finish, their results are discarded, and the
//! process can still write out traces.  A second SIGINT gets the default
//! behavior and kills the process.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn sigint_handler(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
    // SA_RESETHAND restores the default handler.
}

#[cfg(unix)]
pub fn register_sigint() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigint_handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESETHAND;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
pub fn register_sigint() {}

pub fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}
