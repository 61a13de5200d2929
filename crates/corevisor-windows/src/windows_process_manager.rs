use async_trait::async_trait;
use corevisor_core::{
    ProcessError, ProcessHandle, ProcessLifecycle, ProcessSpec, ProcessTermination,
    TerminationResult,
};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Windows process manager. There is no polite termination signal to send to
/// a console-less child, so termination kills the process tree immediately.
#[derive(Default)]
pub struct WindowsProcessManager;

impl WindowsProcessManager {
    pub fn new() -> Self {
        info!("Initializing Windows process manager");
        Self
    }

    /// Use taskkill with /T to terminate a process tree
    async fn taskkill_tree(&self, pid: u32) -> std::io::Result<bool> {
        let output = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output()
            .await?;

        Ok(output.status.success())
    }
}

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
    async fn spawn_process(&self, spec: &ProcessSpec) -> Result<ProcessHandle, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // CREATE_NO_WINDOW (0x08000000) - Creates a process without a console window
        #[cfg(windows)]
        cmd.creation_flags(0x08000000);

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{}: {e}", spec.program.display())))?;

        if let Some(pid) = child.id() {
            info!(
                pid = %pid,
                command = %spec.program.display(),
                args = ?spec.args,
                "Spawned Windows process"
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
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, handle: &ProcessHandle) -> TerminationResult {
        if handle.has_exited() {
            TerminationResult::ProcessNotFound
        } else {
            TerminationResult::Unsupported
        }
    }

    async fn force_kill(&self, handle: &ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.pid() else {
            return TerminationResult::ProcessNotFound;
        };
        if handle.has_exited() {
            return TerminationResult::ProcessNotFound;
        }

        match self.taskkill_tree(pid.0).await {
            Ok(true) => info!(pid = %pid, "Force killed process tree"),
            Ok(false) => warn!(pid = %pid, "taskkill reported failure, killing handle directly"),
            Err(e) => warn!(pid = %pid, error = %e, "Failed to run taskkill"),
        }

        // The reaper's kill covers the root even when taskkill failed
        handle.kill();
        TerminationResult::ForcedKill
    }
}
