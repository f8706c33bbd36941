//! Stopping the listener and the session task together.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long [`ShutdownCoordinator::drain`] waits per task before aborting it.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the background tasks of a running bridge and the token that tells
/// them to stop.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a task to be awaited on drain.
    pub fn track(&mut self, name: &'static str, task: JoinHandle<()>) {
        self.tasks.push((name, task));
    }

    /// Cancel the token and join every tracked task in registration order.
    /// A task still running after `timeout` is aborted. Returns the names of
    /// aborted tasks.
    pub async fn drain(self, timeout: Duration) -> Vec<&'static str> {
        self.token.cancel();
        info!(tasks = self.tasks.len(), ?timeout, "draining bridge tasks");

        let mut aborted = Vec::new();
        for (name, mut task) in self.tasks {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "task did not stop in time, aborting");
                    task.abort();
                    aborted.push(name);
                }
            }
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_cancels_token_and_joins_tasks() {
        let mut coord = ShutdownCoordinator::new();
        let token = coord.token();
        let waiter = token.clone();
        coord.track("waiter", tokio::spawn(async move { waiter.cancelled().await }));
        assert!(!token.is_cancelled());

        let aborted = coord.drain(Duration::from_secs(5)).await;
        assert!(aborted.is_empty());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn drain_with_no_tasks_is_immediate() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        assert!(coord.drain(Duration::from_millis(1)).await.is_empty());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn stuck_task_is_aborted_and_named() {
        let mut coord = ShutdownCoordinator::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        coord.track(
            "stuck",
            tokio::spawn(async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            }),
        );
        coord.track("quick", tokio::spawn(async {}));

        let aborted = coord.drain(Duration::from_millis(100)).await;
        assert_eq!(aborted, vec!["stuck"]);
        // the aborted task dropped its sender
        assert!(tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().is_err());
    }
}
