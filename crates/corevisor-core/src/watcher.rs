use async_trait::async_trait;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::SupervisorError;
use crate::process::ProcessError;

fn check_failed(name: &str, error: &ProcessError) -> SupervisorError {
    SupervisorError::DependencyCheckFailed {
        name: name.to_string(),
        reason: error.to_string(),
    }
}

/// Name-based liveness checks for processes the supervisor did not spawn.
///
/// Realisations are platform specific; supervisor code only sees this trait.
#[async_trait]
pub trait ProcessWatcher: Send + Sync {
    /// Whether any process with this name is alive. Absence is `Ok(false)`.
    async fn check_running(&self, name: &str) -> Result<bool, ProcessError>;

    /// Signal every process with this name to terminate, returning how many were signalled
    async fn terminate_by_name(&self, name: &str) -> Result<usize, ProcessError>;

    /// Like `check_running`, but a failed query reads as not running
    async fn is_running(&self, name: &str) -> bool {
        match self.check_running(name).await {
            Ok(running) => running,
            Err(e) => {
                let e = check_failed(name, &e);
                warn!(process = name, error = %e, "Process query failed, assuming not running");
                false
            }
        }
    }

    /// Completes once, the first time `name` is positively observed absent.
    ///
    /// Failed queries are logged and retried on the next tick; they never
    /// count as a disappearance. Call again to re-arm.
    async fn watch_until_down(&self, name: &str, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.check_running(name).await {
                Ok(false) => {
                    info!(process = name, "Watched process is no longer running");
                    return;
                }
                Ok(true) => {}
                Err(e) => {
                    let e = check_failed(name, &e);
                    warn!(process = name, error = %e, kind = ?e.kind(), "State unknown, retrying");
                }
            }
        }
    }
}
