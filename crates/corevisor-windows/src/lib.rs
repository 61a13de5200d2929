//! Windows-specific process management implementation

mod windows_process_manager;
mod windows_process_watcher;

pub use windows_process_manager::WindowsProcessManager;
pub use windows_process_watcher::{WindowsProcessWatcher, image_name};

use corevisor_core::ProcessManagerFactory;

/// Windows-specific process manager factory
pub struct WindowsProcessManagerFactory;

impl ProcessManagerFactory for WindowsProcessManagerFactory {
    type Manager = WindowsProcessManager;
    type Watcher = WindowsProcessWatcher;

    fn create_process_manager() -> WindowsProcessManager {
        WindowsProcessManager::new()
    }

    fn create_process_watcher() -> WindowsProcessWatcher {
        WindowsProcessWatcher::new()
    }

    fn platform_name() -> &'static str {
        "Windows"
    }
}
