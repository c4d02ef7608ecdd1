//! Signal-driven cooperative shutdown (§4.10).
//!
//! The only module in this crate that installs signal handlers, per §4.10's
//! invariant. Grounded on the standard `tokio::signal::unix` idiom for
//! handling SIGINT/SIGTERM as independent async streams, composed with a
//! [`CancellationToken`] propagated to every long-running task (the
//! orchestrator's pipeline stages, the MCP server's request loop) and a
//! [`JoinSet`]-based task registry so shutdown can wait for a bounded drain
//! instead of just dropping everything.
//!
//! Every method takes `&self`: the task registry lives behind a
//! [`tokio::sync::Mutex`] so one `ResourceManager` can be shared behind an
//! `Arc` between the signal-listening loop and whatever else needs to
//! trigger or observe shutdown (the MCP server's tool dispatcher, §4.12).

use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Coordinates cooperative shutdown across every long-running task in the
/// process. Cheap to share behind an `Arc`: the cancellation token is itself
/// `Arc`-backed and the task registry is behind a mutex.
pub struct ResourceManager {
    cancel: CancellationToken,
    drain_deadline: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl ResourceManager {
    /// Create a manager with the given drain deadline (§6 `orchestrator.drain_deadline_s`).
    pub fn new(drain_deadline: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            drain_deadline,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// The cancellation token every long-running task should poll/select on.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a task so shutdown can await its completion.
    pub async fn track<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.spawn(future);
    }

    /// Install SIGINT/SIGTERM handlers and run until either:
    /// - both signal streams end (platform shutdown), or
    /// - a shutdown is triggered and every tracked task drains (or times out).
    ///
    /// First signal: cancels the token and starts the drain-deadline timer.
    /// A second signal of either kind before the deadline elapses forces
    /// `std::process::exit(1)` (§4.10).
    pub async fn run_until_shutdown(&self) {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT, starting graceful shutdown"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, starting graceful shutdown"),
            _ = self.cancel.cancelled() => tracing::info!("shutdown requested, starting graceful shutdown"),
        }
        self.cancel.cancel();

        let hard_abort = async {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            tracing::warn!("second shutdown signal received, forcing exit");
            std::process::exit(1);
        };

        tokio::select! {
            _ = self.drain() => {}
            _ = hard_abort => {}
        }
    }

    /// Trigger shutdown programmatically (used by the MCP `shutdown` method, §4.12).
    pub fn trigger_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for tracked tasks to finish, up to `drain_deadline`.
    pub async fn drain(&self) {
        let deadline = self.drain_deadline;
        let mut tasks = self.tasks.lock().await;
        let joined = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            tracing::warn!(?deadline, "drain deadline elapsed with tasks still running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_completes_once_all_tracked_tasks_finish() {
        let manager = ResourceManager::new(Duration::from_secs(1));
        manager
            .track(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
            })
            .await;
        manager.track(async {}).await;
        manager.drain().await;
    }

    #[tokio::test]
    async fn drain_times_out_when_a_task_outlives_the_deadline() {
        let manager = ResourceManager::new(Duration::from_millis(20));
        manager
            .track(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        let start = tokio::time::Instant::now();
        manager.drain().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn trigger_shutdown_cancels_the_token() {
        let manager = ResourceManager::new(Duration::from_secs(1));
        let token = manager.cancellation_token();
        assert!(!token.is_cancelled());
        manager.trigger_shutdown();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn run_until_shutdown_returns_promptly_on_programmatic_trigger() {
        let manager = std::sync::Arc::new(ResourceManager::new(Duration::from_secs(1)));
        let trigger = std::sync::Arc::clone(&manager);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger_shutdown();
        });
        let start = tokio::time::Instant::now();
        manager.run_until_shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
