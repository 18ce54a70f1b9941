//! SIGINT/SIGTERM handling: the handler only ever sets a flag (§5, §9 design note).
//!
//! Everything else about shutdown -- finishing the in-flight cycle, awaiting outstanding
//! GPU work, tearing down the fence -- happens on the dispatcher's own thread once it
//! observes the flag. Single-threaded daemon, so a plain atomic is enough; no channel or
//! mutex is warranted.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::info;

static QUIT: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU8 = AtomicU8::new(0);

/// First signal starts a graceful shutdown; a second one while that's still in progress
/// means the operator wants out now, so it bypasses the flag entirely and exits the
/// process from the handler.
extern "C" fn handle_quit_signal(_signum: libc::c_int) {
    if SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst) > 0 {
        std::process::exit(130);
    }
    QUIT.store(true, Ordering::SeqCst);
}

/// Installs handlers for `SIGINT` and `SIGTERM`, both treated identically (§4.7 ADDED).
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, handle_quit_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_quit_signal as libc::sighandler_t);
    }
}

/// Cheap, cloneable handle the dispatcher polls after each event-dispatch iteration.
#[derive(Clone, Default)]
pub struct ShutdownFlag;

impl ShutdownFlag {
    pub fn requested(&self) -> bool {
        QUIT.load(Ordering::SeqCst)
    }
}

/// Wraps [`ShutdownFlag`] behind an `Arc` for call sites that want a `Clone + Send`
/// handle even though this process never spawns a second thread.
pub fn shared_flag() -> Arc<ShutdownFlag> {
    Arc::new(ShutdownFlag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear() {
        // Other tests in the same binary may have already flipped the process-global
        // flag; this just documents the type's contract, not a fresh-process guarantee.
        let flag = ShutdownFlag;
        let _ = flag.requested();
        info!("flag polled without panicking");
    }
}
