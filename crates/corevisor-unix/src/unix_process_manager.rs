use async_trait::async_trait;
use corevisor_core::{
    ProcessError, ProcessHandle, ProcessId, ProcessLifecycle, ProcessSpec, ProcessTermination,
    TerminationResult,
};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::process::Stdio;
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
    use tokio::process::Command;
    use tracing::{info, warn};

    /// Unix process manager: own process group per child, SIGTERM then SIGKILL
    pub struct UnixProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UnixProcessManager {
        pub fn new() -> Self {
            info!("Initializing Unix process manager");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }

        /// Find all descendants of a process, deepest first
        pub fn find_child_processes(&self, parent: ProcessId) -> Vec<ProcessId> {
            let mut system = match self.system.lock() {
                Ok(system) => system,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent.0, &mut children);
            children.into_iter().map(ProcessId::from).collect()
        }

        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().map(|ppid| ppid.as_u32()) == Some(parent_pid) {
                    let child_pid = pid.as_u32();
                    // Grandchildren first so the tree is torn down bottom-up
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }

        fn send_signal(pid: ProcessId, sig: Signal) -> TerminationResult {
            match signal::kill(NixPid::from_raw(pid.0 as i32), sig) {
                Ok(()) => {
                    info!(pid = %pid, signal = %sig, "Sent signal to process");
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!(pid = %pid, "Process not found (already terminated)");
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pid = %pid, signal = %sig, "Permission denied to signal process");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!(pid = %pid, signal = %sig, error = %e, "Failed to signal process");
                    TerminationResult::Failed(format!("{sig} failed: {e}"))
                }
            }
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        async fn spawn_process(&self, spec: &ProcessSpec) -> Result<ProcessHandle, ProcessError> {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .envs(&spec.env)
                .stdin(Stdio::null())
                .kill_on_drop(true);

            if let Some(dir) = &spec.working_dir {
                cmd.current_dir(dir);
            }

            // Own process group so terminal signals aimed at the supervisor
            // do not reach the core before the supervisor decides to stop it
            cmd.process_group(0);

            let child = cmd.spawn().map_err(|e| {
                ProcessError::SpawnFailed(format!("{}: {e}", spec.program.display()))
            })?;

            if let Some(pid) = child.id() {
                info!(
                    pid = pid,
                    command = %spec.program.display(),
                    args = ?spec.args,
                    "Spawned Unix process"
                );
            }

            Ok(ProcessHandle::from_child(
                child,
                spec.command(),
                spec.args.clone(),
            ))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &ProcessHandle) -> TerminationResult {
            match handle.pid() {
                Some(pid) if !handle.has_exited() => Self::send_signal(pid, Signal::SIGTERM),
                _ => TerminationResult::ProcessNotFound,
            }
        }

        async fn force_kill(&self, handle: &ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.pid() else {
                return TerminationResult::ProcessNotFound;
            };
            if handle.has_exited() {
                return TerminationResult::ProcessNotFound;
            }

            for child in self.find_child_processes(pid) {
                match Self::send_signal(child, Signal::SIGKILL) {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                    result => warn!(pid = %child, result = ?result, "Failed to kill child process"),
                }
            }

            match Self::send_signal(pid, Signal::SIGKILL) {
                TerminationResult::Success => {
                    // Let the reaper collect it
                    handle.kill();
                    TerminationResult::ForcedKill
                }
                other => other,
            }
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::UnixProcessManager;

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
