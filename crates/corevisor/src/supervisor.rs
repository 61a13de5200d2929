use async_trait::async_trait;
use corevisor_core::{
    Command, DependencyAction, DependencyPolicy, ManagedState, ProcessHandle, ProcessId,
    ProcessManager, ProcessWatcher, ProfileResolver, SpecResolver, StatusEvent,
    SupervisorConfig, SupervisorError,
};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::StatusBus;
use crate::factory::{platform_process_manager, platform_process_watcher};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

/// Work that must succeed before every start attempt
#[async_trait]
pub trait Preflight: Send + Sync {
    async fn prepare(&self) -> anyhow::Result<()>;

    /// Whether `preparing` is announced while this runs
    fn announces(&self) -> bool {
        true
    }
}

/// Preflight that does nothing and announces nothing
pub struct NoPreflight;

#[async_trait]
impl Preflight for NoPreflight {
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn announces(&self) -> bool {
        false
    }
}

/// Owns the managed process and every transition of its lifecycle.
///
/// Cloning is cheap; all clones drive the same process. Transitions are
/// serialised by one async mutex, while [`Supervisor::state`] reads a
/// snapshot without waiting for it.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    manager: Arc<dyn ProcessManager>,
    watcher: Arc<dyn ProcessWatcher>,
    resolver: Arc<dyn SpecResolver>,
    preflight: Arc<dyn Preflight>,
    bus: StatusBus,
    shutdown: ShutdownCoordinator,
    state: watch::Sender<ManagedState>,
    slot: Mutex<Slot>,
}

/// The running instance, guarded by the transition lock
#[derive(Default)]
struct Slot {
    handle: Option<ProcessHandle>,
    generation: u64,
    watchers: Option<CancellationToken>,
}

impl Slot {
    fn release(&mut self) {
        self.handle = None;
        if let Some(watchers) = self.watchers.take() {
            watchers.cancel();
        }
    }
}

pub struct SupervisorBuilder {
    config: SupervisorConfig,
    manager: Option<Arc<dyn ProcessManager>>,
    watcher: Option<Arc<dyn ProcessWatcher>>,
    resolver: Option<Arc<dyn SpecResolver>>,
    preflight: Arc<dyn Preflight>,
}

impl SupervisorBuilder {
    pub fn manager(mut self, manager: Arc<dyn ProcessManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn watcher(mut self, watcher: Arc<dyn ProcessWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn SpecResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn preflight(mut self, preflight: Arc<dyn Preflight>) -> Self {
        self.preflight = preflight;
        self
    }

    /// Unset collaborators default to the platform implementations and the
    /// configured core profile
    pub fn build(self) -> Supervisor {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(ProfileResolver::from_config(&self.config)));
        let manager = self.manager.unwrap_or_else(platform_process_manager);
        let watcher = self.watcher.unwrap_or_else(platform_process_watcher);
        let bus = StatusBus::new(self.config.status_capacity);
        let shutdown = ShutdownCoordinator::new(&self.config);
        let (state, _) = watch::channel(ManagedState::Stopped);

        Supervisor {
            inner: Arc::new(Inner {
                config: self.config,
                manager,
                watcher,
                resolver,
                preflight: self.preflight,
                bus,
                shutdown,
                state,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }
}

impl Supervisor {
    pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            manager: None,
            watcher: None,
            resolver: None,
            preflight: Arc::new(NoPreflight),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &StatusBus {
        &self.inner.bus
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.inner.shutdown
    }

    /// Current lifecycle state
    pub fn state(&self) -> ManagedState {
        *self.inner.state.borrow()
    }

    /// Current state as the status value streamed to subscribers
    pub fn status(&self) -> StatusEvent {
        self.state().into()
    }

    /// Pid of the live managed process, if any
    pub async fn pid(&self) -> Option<ProcessId> {
        let slot = self.inner.slot.lock().await;
        slot.handle.as_ref().and_then(ProcessHandle::pid)
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ManagedState> {
        self.inner.state.subscribe()
    }

    fn transition(&self, state: ManagedState) {
        let previous = self.inner.state.send_replace(state);
        debug!(from = %previous, to = %state, "Managed state changed");
        self.inner.bus.publish(state.into());
    }

    /// Apply one control command
    pub async fn execute(&self, command: Command) -> Result<(), SupervisorError> {
        info!(command = %command, "Executing command");
        match command {
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::Exit => {
                self.exit().await;
                Ok(())
            }
        }
    }

    /// Launch the managed process
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut slot = self.inner.slot.lock().await;
        if self.state().is_active() {
            return Err(SupervisorError::AlreadyRunning);
        }

        if self.inner.preflight.announces() {
            self.inner.bus.publish(StatusEvent::Preparing);
        }
        if let Err(e) = self.inner.preflight.prepare().await {
            error!(error = %e, "Preparation before start failed");
            self.inner.bus.publish(StatusEvent::DownloadFailed);
            return Err(SupervisorError::PreflightFailed(e));
        }

        let spec = match self.inner.resolver.resolve().await {
            Ok(spec) => spec,
            Err(e) => {
                warn!(error = %e, "Managed process configuration unusable");
                // Retract `preparing`
                if self.inner.preflight.announces() {
                    self.inner.bus.publish(self.status());
                }
                return Err(e);
            }
        };

        self.transition(ManagedState::Starting);
        let handle = match self.inner.manager.spawn_process(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(command = %spec.command(), error = %e, "Failed to spawn managed process");
                self.transition(ManagedState::Stopped);
                return Err(SupervisorError::SpawnFailed(e));
            }
        };

        slot.generation += 1;
        let generation = slot.generation;
        let watchers = CancellationToken::new();
        slot.handle = Some(handle.clone());
        slot.watchers = Some(watchers.clone());
        self.transition(ManagedState::Running);
        info!(
            pid = ?handle.pid().map(|pid| pid.0),
            command = handle.command(),
            generation,
            "Managed process started"
        );

        tokio::spawn(self.clone().observe_exit(handle, generation));
        for policy in self.inner.config.dependencies.iter().filter(|p| p.monitor) {
            tokio::spawn(
                self.clone()
                    .watch_dependency(policy.clone(), watchers.child_token()),
            );
        }
        Ok(())
    }

    /// Terminate the managed process, politely first
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut slot = self.inner.slot.lock().await;
        let handle = match (self.state(), slot.handle.clone()) {
            (ManagedState::Running, Some(handle)) => handle,
            _ => return Err(SupervisorError::NotRunning),
        };

        self.transition(ManagedState::Stopping);
        let result = self
            .inner
            .manager
            .terminate(&handle, self.inner.config.grace_period())
            .await;

        if result.is_stopped() {
            slot.release();
            self.transition(ManagedState::Stopped);
            info!(command = handle.command(), result = ?result, "Managed process stopped");
            Ok(())
        } else {
            error!(command = handle.command(), result = ?result, "Failed to stop managed process");
            self.transition(ManagedState::Running);
            Err(SupervisorError::StopFailed(format!("{result:?}")))
        }
    }

    /// Begin process-wide shutdown. Later calls are no-ops.
    pub async fn exit(&self) {
        self.shutdown(ShutdownReason::Exit).await;
    }

    /// Run the shutdown sequence for `reason`, returning whether this call ran it
    pub async fn shutdown(&self, reason: ShutdownReason) -> bool {
        self.inner.shutdown.run(self, reason).await
    }

    /// Signal companions flagged `terminate_on_exit` that are still alive
    pub(crate) async fn terminate_companions(&self) {
        for policy in self
            .inner
            .config
            .dependencies
            .iter()
            .filter(|p| p.terminate_on_exit)
        {
            if !self.inner.watcher.is_running(&policy.name).await {
                continue;
            }
            match self.inner.watcher.terminate_by_name(&policy.name).await {
                Ok(count) => info!(process = %policy.name, count, "Terminated companion process"),
                Err(e) => warn!(process = %policy.name, error = %e, "Failed to terminate companion"),
            }
        }
    }

    async fn observe_exit(self, handle: ProcessHandle, generation: u64) {
        let result = handle.wait().await;

        let mut slot = self.inner.slot.lock().await;
        if slot.generation != generation || self.state() != ManagedState::Running {
            debug!(generation, result = %result, "Exit of a stopped instance ignored");
            return;
        }
        slot.release();
        warn!(
            command = handle.command(),
            code = ?result.code(),
            result = %result,
            "Managed process exited unexpectedly"
        );
        self.transition(ManagedState::Terminated);
        drop(slot);

        self.terminate_companions().await;
    }

    async fn watch_dependency(self, policy: DependencyPolicy, token: CancellationToken) {
        let poll = self.inner.config.poll_interval();
        tokio::select! {
            _ = token.cancelled() => {
                debug!(process = %policy.name, "Dependency watch cancelled");
                return;
            }
            _ = self.inner.watcher.watch_until_down(&policy.name, poll) => {}
        }

        match policy.on_down {
            DependencyAction::StopManaged => {
                info!(process = %policy.name, "Dependency is down, stopping managed process");
                match self.stop().await {
                    Ok(()) | Err(SupervisorError::NotRunning) => {}
                    Err(e) => warn!(process = %policy.name, error = %e, "Stop after dependency loss failed"),
                }
            }
            DependencyAction::ExitSupervisor => {
                info!(process = %policy.name, "Dependency is down, shutting down");
                self.shutdown(ShutdownReason::Dependency(policy.name.clone()))
                    .await;
            }
        }
    }
}
