use async_trait::async_trait;
use corevisor_core::{ProcessError, ProcessWatcher};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use sysinfo::{Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Finds processes by name in the process table.
///
/// A process matches when its short name or the file name of its
/// executable equals the requested name.
#[derive(Clone)]
pub struct UnixProcessWatcher {
    system: Arc<Mutex<System>>,
}

impl Default for UnixProcessWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixProcessWatcher {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Pids of every live process matching `name`
    pub async fn find_by_name(&self, name: &str) -> Result<Vec<u32>, ProcessError> {
        let system = self.system.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let mut system = system
                .lock()
                .map_err(|_| ProcessError::QueryFailed("process table lock poisoned".into()))?;
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
            );
            let own_pid = std::process::id();
            Ok(system
                .processes()
                .iter()
                .filter(|(pid, process)| pid.as_u32() != own_pid && matches_name(process, &name))
                .map(|(pid, _)| pid.as_u32())
                .collect())
        })
        .await
        .map_err(|e| ProcessError::QueryFailed(format!("process query task failed: {e}")))?
    }
}

fn matches_name(process: &Process, name: &str) -> bool {
    if process.name() == OsStr::new(name) {
        return true;
    }
    process
        .exe()
        .and_then(Path::file_name)
        .is_some_and(|file| file == OsStr::new(name))
}

#[async_trait]
impl ProcessWatcher for UnixProcessWatcher {
    async fn check_running(&self, name: &str) -> Result<bool, ProcessError> {
        Ok(!self.find_by_name(name).await?.is_empty())
    }

    #[cfg(unix)]
    async fn terminate_by_name(&self, name: &str) -> Result<usize, ProcessError> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid as NixPid;

        let mut signalled = 0;
        for pid in self.find_by_name(name).await? {
            match signal::kill(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    tracing::info!(process = name, pid = pid, "Sent SIGTERM to companion process");
                    signalled += 1;
                }
                Err(nix::errno::Errno::ESRCH) => {}
                Err(nix::errno::Errno::EPERM) => {
                    return Err(ProcessError::PermissionDenied(format!(
                        "cannot signal {name} (pid {pid})"
                    )));
                }
                Err(e) => {
                    tracing::warn!(process = name, pid = pid, error = %e, "Failed to signal companion process");
                }
            }
        }
        Ok(signalled)
    }

    #[cfg(not(unix))]
    async fn terminate_by_name(&self, name: &str) -> Result<usize, ProcessError> {
        let pids = self.find_by_name(name).await?;
        let system = self
            .system
            .lock()
            .map_err(|_| ProcessError::QueryFailed("process table lock poisoned".into()))?;
        Ok(pids
            .into_iter()
            .filter_map(|pid| system.process(sysinfo::Pid::from_u32(pid)))
            .filter(|process| process.kill())
            .count())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// Writes an executable script whose process name is unique to this test run
    fn unique_script(dir: &Path, tag: &str, seconds: u32) -> (std::path::PathBuf, String) {
        let name = format!("cv{tag}{}", std::process::id());
        let path = dir.join(&name);
        std::fs::write(&path, format!("#!/bin/sh\nsleep {seconds}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (path, name)
    }

    #[tokio::test]
    async fn test_absent_process_is_not_running() {
        let watcher = UnixProcessWatcher::new();
        let running = watcher
            .check_running("corevisor-no-such-process-7f3a")
            .await
            .unwrap();
        assert!(!running);
        assert!(!watcher.is_running("corevisor-no-such-process-7f3a").await);
    }

    #[tokio::test]
    async fn test_terminate_absent_by_name() {
        let watcher = UnixProcessWatcher::new();
        let count = watcher
            .terminate_by_name("corevisor-no-such-process-7f3a")
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_watch_until_named_process_exits() {
        let dir = tempfile::tempdir().unwrap();
        let (script, name) = unique_script(dir.path(), "w", 1);
        let mut child = tokio::process::Command::new(&script).spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let watcher = UnixProcessWatcher::new();
        assert!(watcher.check_running(&name).await.unwrap());

        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            watcher.watch_until_down(&name, Duration::from_millis(50)),
        )
        .await;
        assert!(outcome.is_ok());
        assert!(!watcher.check_running(&name).await.unwrap());
        reaper.await.unwrap().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_by_name_signals_companion() {
        let dir = tempfile::tempdir().unwrap();
        let (script, name) = unique_script(dir.path(), "t", 30);
        let mut child = tokio::process::Command::new(&script).spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let watcher = UnixProcessWatcher::new();
        let count = watcher.terminate_by_name(&name).await.unwrap();
        assert_eq!(count, 1);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
