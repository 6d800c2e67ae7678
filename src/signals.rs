//! Signal Handling for Graceful Shutdown
//!
//! SIGINT, SIGTERM and SIGQUIT all request shutdown. The runner polls the
//! flag between tasks and while waiting on a task, and kills the running
//! task's process group when it flips.
//!
//! The signal thread is a daemon: it dies with the main thread.

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Shared shutdown request. Cloning shares the same flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Install signal handlers and return the flag they set.
pub fn install_signal_handlers() -> std::io::Result<ShutdownFlag> {
    let flag = ShutdownFlag::new();
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;

    let handle = flag.clone();
    thread::spawn(move || {
        for sig in signals.forever() {
            warn!(signal = sig, "received signal, shutting down");
            handle.request();
        }
    });

    Ok(flag)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_requested());
        flag.request();
        assert!(flag.is_requested());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();
        other.request();
        assert!(flag.is_requested());
    }
}
