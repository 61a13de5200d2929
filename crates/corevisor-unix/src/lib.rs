mod unix_process_manager;
mod unix_process_watcher;

pub use unix_process_manager::UnixProcessManager;
pub use unix_process_watcher::UnixProcessWatcher;

use corevisor_core::ProcessManagerFactory;

pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;
    type Watcher = UnixProcessWatcher;

    fn create_process_manager() -> UnixProcessManager {
        UnixProcessManager::new()
    }

    fn create_process_watcher() -> UnixProcessWatcher {
        UnixProcessWatcher::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
