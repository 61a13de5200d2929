use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of the managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The process exited without being asked to
    Terminated,
}

impl ManagedState {
    /// Whether a start request must be refused in this state
    pub fn is_active(self) -> bool {
        matches!(self, ManagedState::Starting | ManagedState::Running)
    }
}

impl fmt::Display for ManagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagedState::Stopped => "stopped",
            ManagedState::Starting => "starting",
            ManagedState::Running => "running",
            ManagedState::Stopping => "stopping",
            ManagedState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Status values pushed to stream subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusEvent {
    Preparing,
    Starting,
    Started,
    Stopping,
    Stopped,
    Terminated,
    DownloadFailed,
}

impl StatusEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusEvent::Preparing => "preparing",
            StatusEvent::Starting => "starting",
            StatusEvent::Started => "started",
            StatusEvent::Stopping => "stopping",
            StatusEvent::Stopped => "stopped",
            StatusEvent::Terminated => "terminated",
            StatusEvent::DownloadFailed => "download-failed",
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event = match s {
            "preparing" => StatusEvent::Preparing,
            "starting" => StatusEvent::Starting,
            "started" => StatusEvent::Started,
            "stopping" => StatusEvent::Stopping,
            "stopped" => StatusEvent::Stopped,
            "terminated" => StatusEvent::Terminated,
            "download-failed" => StatusEvent::DownloadFailed,
            other => return Err(format!("unknown status: {other}")),
        };
        Ok(event)
    }
}

impl From<ManagedState> for StatusEvent {
    fn from(state: ManagedState) -> Self {
        match state {
            ManagedState::Stopped => StatusEvent::Stopped,
            ManagedState::Starting => StatusEvent::Starting,
            ManagedState::Running => StatusEvent::Started,
            ManagedState::Stopping => StatusEvent::Stopping,
            ManagedState::Terminated => StatusEvent::Terminated,
        }
    }
}
