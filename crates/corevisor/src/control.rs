//! Loopback control surface: one JSON object per line over TCP.
//!
//! A connection sends requests such as `{"method":"start"}` and receives one
//! reply line for each. `{"method":"stream_status"}` turns the connection
//! into a stream of `{"status":"started"}` lines that lasts until the client
//! disconnects or the status bus closes.

use anyhow::{Context, Result};
use corevisor_core::{Command, ErrorKind, StatusEvent, SupervisorError};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

/// Longest request line accepted from a client
const MAX_LINE_LENGTH: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlRequest {
    Start,
    Stop,
    Exit,
    StreamStatus,
}

impl ControlRequest {
    /// The supervisor command behind a unary request
    pub fn command(self) -> Option<Command> {
        match self {
            ControlRequest::Start => Some(Command::Start),
            ControlRequest::Stop => Some(Command::Stop),
            ControlRequest::Exit => Some(Command::Exit),
            ControlRequest::StreamStatus => None,
        }
    }
}

impl From<Command> for ControlRequest {
    fn from(command: Command) -> Self {
        match command {
            Command::Start => ControlRequest::Start,
            Command::Stop => ControlRequest::Stop,
            Command::Exit => ControlRequest::Exit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl ControlReply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: None,
            error: Some(ReplyError {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Error kind if this reply reports a failure
    pub fn kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

impl From<&SupervisorError> for ControlReply {
    fn from(error: &SupervisorError) -> Self {
        ControlReply::failure(error.kind(), error.to_string())
    }
}

/// One line of a status stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLine {
    pub status: StatusEvent,
}

type LineStream = Framed<TcpStream, LinesCodec>;

async fn send_json<T: Serialize>(framed: &mut LineStream, value: &T) -> Result<()> {
    let line = serde_json::to_string(value).context("Failed to encode reply")?;
    framed.send(line).await.context("Failed to write reply")?;
    Ok(())
}

pub struct ControlServer {
    listener: TcpListener,
    supervisor: Supervisor,
    streams: Arc<AtomicUsize>,
}

impl ControlServer {
    /// Bind the control listener
    pub async fn bind(addr: impl ToSocketAddrs, supervisor: Supervisor) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("Failed to bind control listener")?;
        Ok(Self {
            listener,
            supervisor,
            streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Control listener has no local address")
    }

    /// Accept connections until `token` is cancelled
    pub async fn serve(self, token: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Control surface listening"),
            Err(e) => warn!(error = %e, "Control surface listening on unknown address"),
        }

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Control connection accepted");
                    let connection = Connection {
                        framed: Framed::new(
                            stream,
                            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
                        ),
                        peer,
                        supervisor: self.supervisor.clone(),
                        streams: self.streams.clone(),
                    };
                    tokio::spawn(connection.run(token.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept control connection"),
            }
        }
        info!("Control surface stopped");
    }
}

struct Connection {
    framed: LineStream,
    peer: SocketAddr,
    supervisor: Supervisor,
    streams: Arc<AtomicUsize>,
}

impl Connection {
    async fn run(mut self, token: CancellationToken) {
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = self.framed.next() => line,
            };
            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(peer = %self.peer, error = %e, "Unreadable control request");
                    break;
                }
                None => break,
            };

            let request = match serde_json::from_str::<ControlRequest>(&line) {
                Ok(request) => request,
                Err(e) => {
                    let reply = ControlReply::failure(ErrorKind::InvalidRequest, e.to_string());
                    if send_json(&mut self.framed, &reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let Some(command) = request.command() else {
                self.stream_status().await;
                break;
            };

            let reply = match self.supervisor.execute(command).await {
                Ok(()) => ControlReply::success(accepted_message(command)),
                Err(e) => {
                    if e.is_state_conflict() {
                        debug!(peer = %self.peer, command = %command, error = %e, "Control command not applicable");
                    } else {
                        warn!(peer = %self.peer, command = %command, error = %e, "Control command failed");
                    }
                    ControlReply::from(&e)
                }
            };
            if let Err(e) = send_json(&mut self.framed, &reply).await {
                debug!(peer = %self.peer, error = %e, "Control client went away");
                break;
            }
        }
        debug!(peer = %self.peer, "Control connection closed");
    }

    async fn stream_status(&mut self) {
        let mut subscription = self.supervisor.bus().subscribe();
        self.streams.fetch_add(1, Ordering::SeqCst);
        info!(peer = %self.peer, "Status stream opened");

        let mut client_gone = false;
        loop {
            tokio::select! {
                event = subscription.next() => {
                    let Some(status) = event else { break };
                    if send_json(&mut self.framed, &StatusLine { status }).await.is_err() {
                        client_gone = true;
                        break;
                    }
                }
                incoming = self.framed.next() => {
                    match incoming {
                        Some(Ok(_)) => debug!(peer = %self.peer, "Ignoring input on status stream"),
                        Some(Err(_)) | None => {
                            client_gone = true;
                            break;
                        }
                    }
                }
            }
        }

        let remaining = self.streams.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(peer = %self.peer, remaining, "Status stream closed");

        let shutting_down = self.supervisor.shutdown_coordinator().is_shutting_down();
        if client_gone
            && remaining == 0
            && !shutting_down
            && self.supervisor.config().stop_on_stream_disconnect
        {
            info!("Last status stream disconnected, stopping managed process");
            match self.supervisor.stop().await {
                Ok(()) | Err(SupervisorError::NotRunning) => {}
                Err(e) => warn!(error = %e, "Stop after stream disconnect failed"),
            }
        }
    }
}

fn accepted_message(command: Command) -> &'static str {
    match command {
        Command::Start => "started",
        Command::Stop => "stopped",
        Command::Exit => "exiting",
    }
}

/// Minimal client for the control surface
pub struct ControlClient {
    framed: LineStream,
}

impl ControlClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect to control surface")?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        })
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        match self.framed.next().await {
            Some(line) => Ok(Some(line.context("Failed to read from control surface")?)),
            None => Ok(None),
        }
    }

    /// Send one unary request and wait for its reply
    pub async fn request(&mut self, command: Command) -> Result<ControlReply> {
        send_json(&mut self.framed, &ControlRequest::from(command)).await?;
        let line = self
            .read_line()
            .await?
            .context("Control surface closed the connection")?;
        serde_json::from_str(&line).context("Malformed control reply")
    }

    /// Send a raw line, returning the reply line
    pub async fn request_raw(&mut self, line: &str) -> Result<Option<String>> {
        self.framed
            .send(line)
            .await
            .context("Failed to write request")?;
        self.read_line().await
    }

    /// Switch this connection to status streaming
    pub async fn stream_status(mut self) -> Result<StatusStream> {
        send_json(&mut self.framed, &ControlRequest::StreamStatus).await?;
        Ok(StatusStream {
            framed: self.framed,
        })
    }
}

pub struct StatusStream {
    framed: LineStream,
}

impl StatusStream {
    /// Next status, or `None` once the server ends the stream
    pub async fn next_status(&mut self) -> Result<Option<StatusEvent>> {
        match self.framed.next().await {
            Some(line) => {
                let line = line.context("Failed to read status line")?;
                let status: StatusLine =
                    serde_json::from_str(&line).context("Malformed status line")?;
                Ok(Some(status.status))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: ControlRequest = serde_json::from_str(r#"{"method":"stream_status"}"#).unwrap();
        assert_eq!(request, ControlRequest::StreamStatus);
        assert_eq!(request.command(), None);

        let json = serde_json::to_string(&ControlRequest::Stop).unwrap();
        assert_eq!(json, r#"{"method":"stop"}"#);
        assert!(serde_json::from_str::<ControlRequest>(r#"{"method":"restart"}"#).is_err());
    }

    #[test]
    fn test_reply_wire_format() {
        let json = serde_json::to_string(&ControlReply::success("started")).unwrap();
        assert_eq!(json, r#"{"ok":true,"message":"started"}"#);

        let reply = ControlReply::from(&SupervisorError::NotRunning);
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(
            json,
            r#"{"ok":false,"error":{"kind":"NotRunning","message":"managed process is not running"}}"#
        );

        let line = serde_json::to_string(&StatusLine {
            status: StatusEvent::DownloadFailed,
        })
        .unwrap();
        assert_eq!(line, r#"{"status":"download-failed"}"#);
    }
}
