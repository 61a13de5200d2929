use async_trait::async_trait;
use corevisor_core::Command;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

/// Anything that produces control commands
#[async_trait]
pub trait CommandSource: Send {
    /// Next command, or `None` once the source is exhausted
    async fn next_command(&mut self) -> Option<Command>;
}

/// Polls a side-channel file for commands.
///
/// A command is taken from the first line of the file, and only when the
/// file's modification time has moved past the last accepted one. An empty
/// file is left for the next tick.
pub struct FileCommandSource {
    path: PathBuf,
    ticker: Interval,
    last_seen: Option<SystemTime>,
}

impl FileCommandSource {
    pub fn new(path: impl Into<PathBuf>, poll: Duration) -> Self {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            path: path.into(),
            ticker,
            last_seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn poll_once(&mut self) -> Option<Command> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to stat command file");
                return None;
            }
        };
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Command file has no modification time");
                return None;
            }
        };
        if self.last_seen.is_some_and(|seen| modified <= seen) {
            return None;
        }

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read command file");
                return None;
            }
        };
        let line = content.lines().next().unwrap_or_default().trim();
        if line.is_empty() {
            return None;
        }

        self.last_seen = Some(modified);
        match line.parse::<Command>() {
            Ok(command) => {
                debug!(command = %command, "Command read from file");
                Some(command)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unknown command");
                None
            }
        }
    }
}

#[async_trait]
impl CommandSource for FileCommandSource {
    async fn next_command(&mut self) -> Option<Command> {
        loop {
            self.ticker.tick().await;
            if let Some(command) = self.poll_once().await {
                return Some(command);
            }
        }
    }
}

/// Apply commands from `source` until it ends or `token` is cancelled
pub async fn pump<S: CommandSource>(mut source: S, supervisor: Supervisor, token: CancellationToken) {
    loop {
        let command = tokio::select! {
            _ = token.cancelled() => break,
            command = source.next_command() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match supervisor.execute(command).await {
            Ok(()) => {}
            Err(e) if e.is_state_conflict() => {
                debug!(command = %command, error = %e, "Command not applicable");
            }
            Err(e) => warn!(command = %command, error = %e, kind = ?e.kind(), "Command failed"),
        }
    }
    info!("Command source stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_at(path: &Path, content: &str, modified: SystemTime) {
        std::fs::write(path, content).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(modified).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileCommandSource::new(dir.path().join("cmd.obv"), Duration::from_millis(10));
        assert_eq!(source.poll_once().await, None);
    }

    #[tokio::test]
    async fn test_command_accepted_once_per_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.obv");
        let base = SystemTime::now();
        let mut source = FileCommandSource::new(&path, Duration::from_millis(10));

        write_at(&path, "start\n", base);
        assert_eq!(source.poll_once().await, Some(Command::Start));
        assert_eq!(source.poll_once().await, None);

        // Same mtime, different content: still ignored
        write_at(&path, "stop\n", base);
        assert_eq!(source.poll_once().await, None);

        write_at(&path, "  STOP \nexit\n", base + Duration::from_secs(5));
        assert_eq!(source.poll_once().await, Some(Command::Stop));
    }

    #[tokio::test]
    async fn test_empty_file_is_not_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.obv");
        let modified = SystemTime::now();
        let mut source = FileCommandSource::new(&path, Duration::from_millis(10));

        write_at(&path, "", modified);
        assert_eq!(source.poll_once().await, None);

        write_at(&path, "exit", modified);
        assert_eq!(source.poll_once().await, Some(Command::Exit));
    }

    #[tokio::test]
    async fn test_unknown_token_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.obv");
        let modified = SystemTime::now();
        let mut source = FileCommandSource::new(&path, Duration::from_millis(10));

        write_at(&path, "restart", modified);
        assert_eq!(source.poll_once().await, None);

        write_at(&path, "start", modified);
        assert_eq!(source.poll_once().await, None);
    }

    #[tokio::test]
    async fn test_next_command_waits_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.obv");
        let mut source = FileCommandSource::new(&path, Duration::from_millis(10));

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tokio::fs::write(&path, "start\n").await.unwrap();
            })
        };

        let command = tokio::time::timeout(Duration::from_secs(5), source.next_command())
            .await
            .unwrap();
        assert_eq!(command, Some(Command::Start));
        writer.await.unwrap();
    }
}
