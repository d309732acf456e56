//! Shutdown coordination for the server.

use std::time::Duration;

use crate::lifecycle::cancel::CancelSignal;

/// How a running server should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop accepting, let in-flight streams finish, escalate to `Hard`
    /// once `timeout` elapses.
    Graceful { timeout: Duration },
    /// Cancel every active call and close connections now.
    Hard,
}

/// Coordinator for graceful and hard shutdown.
///
/// `drain` asks connections to stop taking new streams; `terminate` cancels
/// everything still running. Both are latches all long-running tasks can wait on.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    drain: CancelSignal,
    terminate: CancelSignal,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal a graceful drain.
    pub fn drain(&self) {
        self.drain.cancel();
    }

    /// Signal hard termination. Implies drain.
    pub fn terminate(&self) {
        self.drain.cancel();
        self.terminate.cancel();
    }

    pub fn drain_signal(&self) -> &CancelSignal {
        &self.drain
    }

    pub fn terminate_signal(&self) -> &CancelSignal {
        &self.terminate
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_implies_drain() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_draining());

        coordinator.terminate();
        assert!(coordinator.is_draining());
        assert!(coordinator.terminate_signal().is_cancelled());
    }

    #[test]
    fn drain_does_not_terminate() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.drain();
        assert!(coordinator.drain_signal().is_cancelled());
        assert!(!coordinator.terminate_signal().is_cancelled());
    }
}
