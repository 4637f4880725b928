//! # Task lifecycle signalling
//!
//! A single shutdown broadcast shared by every task in the process. The
//! supervisor owns the [`ShutdownHandle`]; tasks hold a [`ShutdownSignal`]
//! and select on [`ShutdownSignal::wait_for_shutdown`] next to their work.

use tokio::sync::watch;

/// Sending half of the shutdown broadcast, owned by the supervisor.
#[derive(Debug)]
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Create a handle with no shutdown requested yet.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Subscribe a task to the broadcast.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Request shutdown. Idempotent; safe to call from several places.
    pub fn signal(&self) {
        // send only errs when every receiver is gone, which is fine here.
        let _ = self.sender.send(true);
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of the shutdown broadcast.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown is requested. Also resolves if the
    /// supervisor dropped the handle, since no more work is coming then.
    pub async fn wait_for_shutdown(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn signal_reaches_subscribers() {
        let handle = ShutdownHandle::new();
        let mut signal = handle.subscribe();

        assert!(!signal.is_shutdown());
        handle.signal();
        handle.signal();

        tokio::time::timeout(Duration::from_secs(1), signal.wait_for_shutdown())
            .await
            .expect("shutdown was signalled");
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn subscribing_after_signal_still_observes_it() {
        let handle = ShutdownHandle::new();
        handle.signal();

        let mut signal = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(1), signal.wait_for_shutdown())
            .await
            .expect("late subscriber sees shutdown");
    }

    #[tokio::test]
    async fn dropped_handle_releases_waiters() {
        let handle = ShutdownHandle::new();
        let mut signal = handle.subscribe();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), signal.wait_for_shutdown())
            .await
            .expect("waiter resolves once the handle is gone");
    }
}
