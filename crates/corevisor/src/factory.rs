use corevisor_core::{ProcessManager, ProcessManagerFactory, ProcessWatcher};
use std::sync::Arc;
use tracing::info;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    #[cfg(unix)]
    type Manager = corevisor_unix::UnixProcessManager;
    #[cfg(unix)]
    type Watcher = corevisor_unix::UnixProcessWatcher;

    #[cfg(windows)]
    type Manager = corevisor_windows::WindowsProcessManager;
    #[cfg(windows)]
    type Watcher = corevisor_windows::WindowsProcessWatcher;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return corevisor_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return corevisor_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn create_process_watcher() -> Self::Watcher {
        #[cfg(unix)]
        return corevisor_unix::UnixProcessManagerFactory::create_process_watcher();

        #[cfg(windows)]
        return corevisor_windows::WindowsProcessManagerFactory::create_process_watcher();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return corevisor_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return corevisor_windows::WindowsProcessManagerFactory::platform_name();
    }
}

#[cfg(not(any(unix, windows)))]
compile_error!("Unsupported platform: only Unix and Windows are currently supported");

/// Process manager for the current platform, ready to share between tasks
pub fn platform_process_manager() -> Arc<dyn ProcessManager> {
    info!(
        platform = PlatformProcessManagerFactory::platform_name(),
        "Creating process manager"
    );
    Arc::new(PlatformProcessManagerFactory::create_process_manager())
}

/// Name-based process watcher for the current platform
pub fn platform_process_watcher() -> Arc<dyn ProcessWatcher> {
    Arc::new(PlatformProcessManagerFactory::create_process_watcher())
}
