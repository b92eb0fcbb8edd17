//! Task-spawning helpers shared by the engine and the confirmation tracker.

use std::future::Future;
use std::time::Duration;

use tokio::select;
use tokio::task::JoinHandle;
use tracing::error;

use crate::shutdown::Shutdown;

pub mod async_queue;

/// Spawns a future that retries on failure with a fixed backoff, cancelling
/// immediately when shutdown begins rather than waiting for the in-flight
/// attempt to finish. Used for units with no cleanup of their own to run
/// (the engine's poll loop, the confirmation tracker's block subscription).
pub fn spawn_with_backoff_cancel_on_shutdown<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        select! {
            () = retry_future(future_spawner, backoff_duration, shutdown.clone()) => {}
            () = shutdown.await_shutdown_begin() => {}
        }
    })
}

async fn retry_future<S, F>(future_spawner: S, backoff_duration: Duration, shutdown: Shutdown)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    loop {
        match future_spawner().await {
            Ok(()) => return,
            Err(error) => {
                error!(?error, "task failed");

                if shutdown.is_shutting_down() {
                    return;
                }

                tokio::time::sleep(backoff_duration).await;
            }
        }
    }
}

/// Exponential backoff with a cap, used by the store's retry loop
/// (`SPEC_FULL.md` §4.1): initial delay, doubling (by default) up to a
/// maximum, forever until shutdown.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self { next: initial, max, factor }
    }

    /// Sleeps for the current delay, then advances it toward `max`.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next).await;
        let scaled = self.next.mul_f64(self.factor);
        self.next = scaled.min(self.max);
    }
}

/// Runs `attempt` until it returns `Ok`, retrying transient failures with
/// `backoff` and returning early if `shutdown` begins. This is the "any
/// database error is retried indefinitely until context cancellation"
/// policy from `SPEC_FULL.md` §4.1, factored out so the store and other
/// long-lived callers share one implementation.
pub async fn retry_until_shutdown<T, E, F, Fut>(
    mut attempt: F,
    mut backoff: Backoff,
    shutdown: &Shutdown,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    loop {
        match attempt().await {
            Ok(value) => return Some(value),
            Err(error) => {
                error!(%error, "retrying after transient error");
                if shutdown.is_shutting_down() {
                    return None;
                }
                backoff.wait().await;
                if shutdown.is_shutting_down() {
                    return None;
                }
            }
        }
    }
}
