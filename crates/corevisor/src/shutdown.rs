//! Process-wide shutdown, run at most once.

use corevisor_core::{SupervisorConfig, SupervisorError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::supervisor::Supervisor;

/// What triggered the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An explicit `exit` command
    Exit,
    /// SIGINT, SIGTERM, SIGQUIT or Ctrl-C
    Signal,
    /// A companion with the exit-all policy disappeared
    Dependency(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Exit => f.write_str("exit command"),
            ShutdownReason::Signal => f.write_str("signal"),
            ShutdownReason::Dependency(name) => write!(f, "dependency {name} down"),
        }
    }
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    claimed: Arc<Mutex<bool>>,
    /// Cancelled once shutdown begins; command sources stop on it
    accepting: CancellationToken,
    /// Cancelled when the process should terminate
    terminated: CancellationToken,
    stop_timeout: Duration,
    exit_grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            claimed: Arc::new(Mutex::new(false)),
            accepting: CancellationToken::new(),
            terminated: CancellationToken::new(),
            stop_timeout: config.shutdown_timeout(),
            exit_grace: config.exit_grace(),
        }
    }

    /// Token cancelled when command intake must stop
    pub fn token(&self) -> CancellationToken {
        self.accepting.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.accepting.is_cancelled()
    }

    /// Completes when the process should terminate
    pub async fn terminated(&self) {
        self.terminated.cancelled().await
    }

    fn delay_for(&self, reason: &ShutdownReason) -> Duration {
        match reason {
            ShutdownReason::Exit => self.exit_grace,
            ShutdownReason::Signal | ShutdownReason::Dependency(_) => Duration::ZERO,
        }
    }

    /// Run the shutdown sequence. Concurrent and repeated calls wait for the
    /// first one and return `false`.
    pub async fn run(&self, supervisor: &Supervisor, reason: ShutdownReason) -> bool {
        let mut claimed = self.claimed.lock().await;
        if *claimed {
            debug!(reason = %reason, "Shutdown already in progress");
            return false;
        }
        *claimed = true;
        info!(reason = %reason, "Shutting down");

        self.accepting.cancel();

        match tokio::time::timeout(self.stop_timeout, supervisor.stop()).await {
            Ok(Ok(())) | Ok(Err(SupervisorError::NotRunning)) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to stop managed process during shutdown"),
            Err(_) => error!(
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "Timed out stopping managed process during shutdown"
            ),
        }

        supervisor.terminate_companions().await;
        supervisor.bus().close();

        let delay = self.delay_for(&reason);
        let terminated = self.terminated.clone();
        if delay.is_zero() {
            terminated.cancel();
        } else {
            debug!(delay_ms = delay.as_millis() as u64, "Termination scheduled");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                terminated.cancel();
            });
        }
        true
    }
}

/// Completes when the process receives a termination signal
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Run the shutdown sequence when a termination signal arrives
pub fn spawn_signal_listener(supervisor: Supervisor) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let token = supervisor.shutdown_coordinator().token();
        tokio::select! {
            _ = token.cancelled() => {}
            result = wait_for_shutdown_signal() => {
                match result {
                    Ok(()) => {
                        supervisor.shutdown(ShutdownReason::Signal).await;
                    }
                    Err(e) => warn!(error = %e, "Failed to install signal handlers"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_by_reason() {
        let config = SupervisorConfig {
            exit_grace_ms: 750,
            ..Default::default()
        };
        let coordinator = ShutdownCoordinator::new(&config);
        assert_eq!(
            coordinator.delay_for(&ShutdownReason::Exit),
            Duration::from_millis(750)
        );
        assert_eq!(coordinator.delay_for(&ShutdownReason::Signal), Duration::ZERO);
        assert_eq!(
            coordinator.delay_for(&ShutdownReason::Dependency("oblivion-desktop".into())),
            Duration::ZERO
        );
    }
}
