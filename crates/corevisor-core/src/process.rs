use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

/// How long a force-killed process is given to be reaped
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a managed process ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExitResult {
    /// Process exited with status information
    Exited(ExitStatus),
    /// The exit status could not be collected
    WaitFailed(String),
}

impl ExitResult {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitResult::Exited(status) => status.code(),
            ExitResult::WaitFailed(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitResult::Exited(status) if status.success())
    }
}

impl fmt::Display for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitResult::Exited(status) => write!(f, "{status}"),
            ExitResult::WaitFailed(reason) => write!(f, "wait failed: {reason}"),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process exited within the grace period
    Success,
    /// Process ignored the polite request and was killed
    ForcedKill,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Polite termination is not available on this platform
    Unsupported,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Whether the process is gone after this result
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success
                | TerminationResult::ForcedKill
                | TerminationResult::ProcessNotFound
        )
    }
}

/// Error types for process operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Process query failed: {0}")]
    QueryFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Immutable description of one start attempt
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<S: ToString, I: IntoIterator<Item = S>>(mut self, iter: I) -> Self {
        self.args = iter.into_iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env<T: ToString>(mut self, key: T, value: T) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Program path as a display string
    pub fn command(&self) -> String {
        self.program.display().to_string()
    }
}

/// Handle to a spawned process.
///
/// The OS child is owned by a reaper task; handles are cheap clones that
/// observe its exit and can ask it to be killed. Several tasks may wait on
/// the same process without contending for the child.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<ProcessId>,
    command: Arc<str>,
    args: Arc<[String]>,
    exit: watch::Receiver<Option<ExitResult>>,
    kill_request: Arc<Notify>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ProcessHandle {
    /// Take ownership of a freshly spawned child and start reaping it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_child(mut child: Child, command: impl Into<String>, args: Vec<String>) -> Self {
        let pid = child.id().map(ProcessId::from);
        let command: Arc<str> = Arc::from(command.into());
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_request = Arc::new(Notify::new());

        let kill_signal = kill_request.clone();
        let reaped = command.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    if let Err(e) = child.start_kill() {
                        warn!(command = %reaped, error = %e, "Failed to kill process");
                    }
                    child.wait().await
                }
            };
            let result = match status {
                Ok(status) => ExitResult::Exited(status),
                Err(e) => ExitResult::WaitFailed(e.to_string()),
            };
            debug!(command = %reaped, result = %result, "Process reaped");
            let _ = exit_tx.send(Some(result));
        });

        Self {
            pid,
            command,
            args: Arc::from(args),
            exit: exit_rx,
            kill_request,
        }
    }

    /// Get the process ID (None if the OS did not report one)
    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    /// Get the command that started this process
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Get the arguments passed to this process
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Check whether the process has been reaped (non-blocking)
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Exit result if the process has already exited
    pub fn exit_result(&self) -> Option<ExitResult> {
        self.exit.borrow().clone()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> ExitResult {
        let mut exit = self.exit.clone();
        let result = exit
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        result.unwrap_or_else(|| ExitResult::WaitFailed("reaper task ended unexpectedly".into()))
    }

    /// Wait for the process to exit, giving up after `timeout`
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ExitResult> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Ask the reaper to kill the process. Returns false if it already exited.
    pub fn kill(&self) -> bool {
        if self.has_exited() {
            return false;
        }
        self.kill_request.notify_one();
        true
    }
}

/// Spawning side of process management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn a new process described by `spec`
    async fn spawn_process(&self, spec: &ProcessSpec) -> Result<ProcessHandle, ProcessError>;
}

/// Trait for process termination with a grace period
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask the process to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &ProcessHandle) -> TerminationResult;

    /// Force kill the process and whatever it spawned (SIGKILL on Unix)
    async fn force_kill(&self, handle: &ProcessHandle) -> TerminationResult;

    /// Polite request, bounded wait, then forced kill
    async fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> TerminationResult {
        if handle.has_exited() {
            return TerminationResult::ProcessNotFound;
        }

        match self.terminate_gracefully(handle).await {
            TerminationResult::Success => {
                if handle.wait_timeout(grace).await.is_some() {
                    return TerminationResult::Success;
                }
                warn!(
                    command = handle.command(),
                    grace_ms = grace.as_millis() as u64,
                    "Process did not exit within grace period, force killing"
                );
            }
            TerminationResult::ProcessNotFound => return TerminationResult::ProcessNotFound,
            TerminationResult::Unsupported => {
                debug!(command = handle.command(), "Graceful termination unsupported");
            }
            other => {
                warn!(command = handle.command(), result = ?other, "Graceful termination failed");
            }
        }

        match self.force_kill(handle).await {
            TerminationResult::Success | TerminationResult::ForcedKill => {
                match handle.wait_timeout(KILL_REAP_TIMEOUT).await {
                    Some(_) => {
                        info!(command = handle.command(), "Process force killed");
                        TerminationResult::ForcedKill
                    }
                    None => TerminationResult::Failed("process survived forced kill".into()),
                }
            }
            TerminationResult::ProcessNotFound => TerminationResult::ProcessNotFound,
            other => other,
        }
    }
}

/// High-level process manager trait that combines lifecycle and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {}

impl<T: ProcessLifecycle + ProcessTermination> ProcessManager for T {}

/// Factory trait for creating platform-specific process collaborators
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager + 'static;
    /// The type of name-based watcher this factory creates
    type Watcher: crate::ProcessWatcher + 'static;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Create a process watcher for the current platform
    fn create_process_watcher() -> Self::Watcher;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = ProcessSpec::new("/opt/core/sing-box")
            .args(["run", "-c", "sbConfig.json"])
            .working_dir("/opt/core")
            .env("ENABLE_DEPRECATED", "1");
        assert_eq!(spec.args, vec!["run", "-c", "sbConfig.json"]);
        assert_eq!(spec.working_dir, Some(PathBuf::from("/opt/core")));
        assert_eq!(spec.command(), "/opt/core/sing-box");
        assert_eq!(spec.env.get("ENABLE_DEPRECATED").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_termination_result_is_stopped() {
        assert!(TerminationResult::Success.is_stopped());
        assert!(TerminationResult::ForcedKill.is_stopped());
        assert!(TerminationResult::ProcessNotFound.is_stopped());
        assert!(!TerminationResult::AccessDenied.is_stopped());
        assert!(!TerminationResult::Failed("x".into()).is_stopped());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handle_observes_exit() {
        let child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let handle = ProcessHandle::from_child(child, "/bin/sh", vec![]);
        let waiter = handle.clone();

        let result = waiter.wait().await;
        assert_eq!(result.code(), Some(3));
        assert!(handle.has_exited());
        assert_eq!(handle.exit_result(), Some(result));
        assert!(!handle.kill());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handle_kill_request() {
        let child = tokio::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let handle = ProcessHandle::from_child(child, "/bin/sleep", vec!["30".into()]);
        assert!(handle.pid().is_some());
        assert!(handle.wait_timeout(Duration::from_millis(100)).await.is_none());

        assert!(handle.kill());
        let result = handle.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(result, Some(r) if !r.success()));
    }
}
