#![allow(dead_code)]

use async_trait::async_trait;
use corevisor::{ManagedState, ProcessError, ProcessSpec, ProcessWatcher, Supervisor, SupervisorConfig};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

/// Settings with short timings for tests
pub fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        command_file: None,
        rpc: false,
        grace_period_ms: 1_000,
        exit_grace_ms: 50,
        poll_interval_ms: 20,
        command_poll_ms: 20,
        ..Default::default()
    }
}

pub fn sleeper() -> Arc<ProcessSpec> {
    Arc::new(ProcessSpec::new("/bin/sleep").args(["30"]))
}

pub fn shell(script: &str) -> Arc<ProcessSpec> {
    Arc::new(ProcessSpec::new("/bin/sh").args(["-c", script]))
}

/// Process table stand-in: names are running until removed
#[derive(Default)]
pub struct FakeWatcher {
    running: Mutex<HashSet<String>>,
    terminated: Mutex<Vec<String>>,
}

impl FakeWatcher {
    pub fn with_running<I: IntoIterator<Item = &'static str>>(names: I) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(names.into_iter().map(String::from).collect()),
            terminated: Mutex::default(),
        })
    }

    pub fn set_running(&self, name: &str, running: bool) {
        let mut table = self.running.lock().unwrap();
        if running {
            table.insert(name.to_string());
        } else {
            table.remove(name);
        }
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessWatcher for FakeWatcher {
    async fn check_running(&self, name: &str) -> Result<bool, ProcessError> {
        Ok(self.running.lock().unwrap().contains(name))
    }

    async fn terminate_by_name(&self, name: &str) -> Result<usize, ProcessError> {
        let removed = self.running.lock().unwrap().remove(name);
        if removed {
            self.terminated.lock().unwrap().push(name.to_string());
        }
        Ok(usize::from(removed))
    }
}

pub async fn wait_for_state(supervisor: &Supervisor, state: ManagedState) {
    let mut states = supervisor.watch_state();
    tokio::time::timeout(Duration::from_secs(10), states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}

pub async fn wait_for_termination(supervisor: &Supervisor) {
    tokio::time::timeout(
        Duration::from_secs(10),
        supervisor.shutdown_coordinator().terminated(),
    )
    .await
    .expect("supervisor did not terminate");
}
