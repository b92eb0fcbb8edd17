//! Cancellation primitive propagated into every concurrent unit: the engine
//! loop, each orchestrator, and the confirmation tracker (`SPEC_FULL.md`
//! §5). Backed by a `watch` channel so clones are cheap and every holder
//! observes the same transition exactly once.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::warn;

#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
    grace_period: Duration,
}

impl Shutdown {
    /// Creates a shutdown handle. `grace_period` bounds how long
    /// [`Shutdown::wait_with_grace`] waits for in-flight work (e.g. a
    /// broadcast deadline) after shutdown begins.
    #[must_use]
    pub fn new(grace_period: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver, grace_period }
    }

    /// Begins shutdown. Idempotent: later calls are no-ops.
    pub fn shutdown(&self) {
        // Only fails if every receiver has been dropped, which cannot
        // happen while `self` still holds one.
        let _ = self.sender.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has begun. Safe to drop and re-await.
    pub async fn await_shutdown_begin(&self) {
        let mut receiver = self.receiver.clone();
        if *receiver.borrow_and_update() {
            return;
        }
        if receiver.changed().await.is_err() {
            warn!("shutdown sender dropped without signalling shutdown");
        }
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Waits for shutdown, then sleeps the grace period so in-flight
    /// broadcasts and confirmations have a chance to land before the
    /// process exits.
    pub async fn wait_with_grace(&self) {
        self.await_shutdown_begin().await;
        sleep(self.grace_period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn await_shutdown_begin_resolves_after_shutdown() {
        let shutdown = Shutdown::new(Duration::from_millis(10));
        let waiter = shutdown.clone();

        let start = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waiter.shutdown();
        });

        shutdown.await_shutdown_begin().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn await_shutdown_begin_resolves_immediately_if_already_shutting_down() {
        let shutdown = Shutdown::new(Duration::from_millis(10));
        shutdown.shutdown();

        let start = Instant::now();
        shutdown.await_shutdown_begin().await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
