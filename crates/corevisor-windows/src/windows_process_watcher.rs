use async_trait::async_trait;
use corevisor_core::{ProcessError, ProcessWatcher};
use std::sync::{Arc, Mutex};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::info;

/// Process-table watcher. Names are compared case-insensitively with the
/// `.exe` suffix added when missing.
#[derive(Clone)]
pub struct WindowsProcessWatcher {
    system: Arc<Mutex<System>>,
}

impl Default for WindowsProcessWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsProcessWatcher {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

/// `warp-plus` and `warp-plus.exe` both become `warp-plus.exe`
pub fn image_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".exe") {
        lower
    } else {
        format!("{lower}.exe")
    }
}

#[async_trait]
impl ProcessWatcher for WindowsProcessWatcher {
    async fn check_running(&self, name: &str) -> Result<bool, ProcessError> {
        let system = self.system.clone();
        let wanted = image_name(name);
        tokio::task::spawn_blocking(move || {
            let mut system = system
                .lock()
                .map_err(|_| ProcessError::QueryFailed("process table lock poisoned".into()))?;
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing(),
            );
            Ok(system
                .processes()
                .values()
                .any(|process| process.name().to_string_lossy().to_ascii_lowercase() == wanted))
        })
        .await
        .map_err(|e| ProcessError::QueryFailed(format!("process query task failed: {e}")))?
    }

    async fn terminate_by_name(&self, name: &str) -> Result<usize, ProcessError> {
        if !self.check_running(name).await? {
            return Ok(0);
        }

        let output = Command::new("taskkill")
            .args(["/F", "/IM", &image_name(name)])
            .output()
            .await?;

        if output.status.success() {
            info!(process = name, "Companion process killed");
            Ok(1)
        } else {
            Err(ProcessError::QueryFailed(format!(
                "taskkill failed for {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}
