//! Emergency flush on fatal signals
//!
//! When the traced program receives SIGINT, SIGABRT or SIGSEGV its buffered
//! records would be lost with it. The handler below writes out the signaling
//! thread's channels and syncs the session files under the global lock. The
//! host then delivers the signal to the program unchanged.
//!
//! This is best effort: a SIGKILL never reaches the tracer, and whatever the
//! other threads still hold in their buffers is lost.

use nix::sys::signal::Signal;

use crate::lifecycle::{ThreadTrace, TracerContext};
use crate::regfile::RegisterFile;
use crate::session::lock;

/// Signals that trigger an emergency flush
pub const FLUSH_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGABRT, Signal::SIGSEGV];

pub fn is_flush_signal(signal: Signal) -> bool {
    FLUSH_SIGNALS.contains(&signal)
}

impl<R: RegisterFile> TracerContext<R> {
    /// Handle a signal about to be delivered to `thread`
    ///
    /// Returns the number of records written for a flush signal, `None`
    /// for any other signal. Write errors are logged, never returned: the
    /// signal must be delivered regardless.
    pub fn on_signal(&self, thread: &mut ThreadTrace<R>, signal: Signal) -> Option<usize> {
        if !is_flush_signal(signal) {
            return None;
        }
        println!("[insntrace: Signal {} caught]", signal as i32);

        let shared = lock(&self.shared);
        let records = match thread.flush_all() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Emergency flush on {} failed: {}", signal, e);
                0
            }
        };
        if let Err(e) = thread.session().sync_all() {
            tracing::warn!("Syncing session files on {} failed: {}", signal, e);
        }
        if let Some(root) = shared.root.as_ref() {
            if let Err(e) = root.sync() {
                tracing::warn!("Syncing byte map on {} failed: {}", signal, e);
            }
        }
        Some(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_signals() {
        assert!(is_flush_signal(Signal::SIGINT));
        assert!(is_flush_signal(Signal::SIGABRT));
        assert!(is_flush_signal(Signal::SIGSEGV));
        assert!(!is_flush_signal(Signal::SIGCHLD));
        assert!(!is_flush_signal(Signal::SIGTERM));
    }
}
