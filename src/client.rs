//! Client for daemon communication.

use crate::ipc::messages::{DaemonCommand, DaemonResponse, HookPayload, StateMessage};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon is not running (no socket at {0})")]
    NotRunning(PathBuf),
    #[error("daemon I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed daemon message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("daemon closed the connection")]
    Closed,
    #[error("daemon error: {0}")]
    Daemon(String),
    #[error("unexpected daemon response: {0:?}")]
    Unexpected(Box<DaemonResponse>),
}

/// Blocking client over the daemon socket
pub struct DaemonClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl DaemonClient {
    /// Connect to the daemon listening on `socket_path`
    pub fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        if !socket_path.exists() {
            return Err(ClientError::NotRunning(socket_path.to_path_buf()));
        }

        let stream = UnixStream::connect(socket_path).map_err(|err| match err.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
                ClientError::NotRunning(socket_path.to_path_buf())
            }
            _ => ClientError::Io(err),
        })?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
        })
    }

    fn send(&mut self, command: &DaemonCommand) -> Result<(), ClientError> {
        let json = serde_json::to_string(command)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<DaemonResponse, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Closed);
        }
        match serde_json::from_str(&line)? {
            DaemonResponse::Error { message } => Err(ClientError::Daemon(message)),
            response => Ok(response),
        }
    }

    /// Send a command and receive a response
    pub fn send_command(&mut self, command: &DaemonCommand) -> Result<DaemonResponse, ClientError> {
        self.send(command)?;
        self.recv()
    }

    fn expect_ok(&mut self, command: &DaemonCommand) -> Result<(), ClientError> {
        match self.send_command(command)? {
            DaemonResponse::Ok => Ok(()),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Forward a hook event
    pub fn send_hook(&mut self, payload: HookPayload) -> Result<(), ClientError> {
        self.expect_ok(&DaemonCommand::Hook(payload))
    }

    /// Current snapshot; a pending finish is left for subscribers
    pub fn get_state(&mut self) -> Result<StateMessage, ClientError> {
        match self.send_command(&DaemonCommand::GetState)? {
            DaemonResponse::State(state) => Ok(state),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Check daemon status
    pub fn status(&mut self) -> Result<DaemonStatus, ClientError> {
        match self.send_command(&DaemonCommand::Status)? {
            DaemonResponse::Status {
                session_count,
                subscriber_count,
                uptime_secs,
                ..
            } => Ok(DaemonStatus {
                session_count,
                subscriber_count,
                uptime_secs,
            }),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Ping daemon for health check
    pub fn ping(&mut self) -> bool {
        matches!(self.send_command(&DaemonCommand::Ping), Ok(DaemonResponse::Pong))
    }

    /// Ask the daemon to stop
    pub fn shutdown(&mut self) -> Result<(), ClientError> {
        self.expect_ok(&DaemonCommand::Shutdown)
    }

    /// Stream snapshots; the first item is the current state
    pub fn subscribe(mut self) -> Result<Snapshots, ClientError> {
        // Pushes arrive only when something changes
        self.reader.get_ref().set_read_timeout(None)?;
        self.send(&DaemonCommand::Subscribe)?;
        Ok(Snapshots { client: self })
    }
}

/// Snapshots pushed by the daemon after [`DaemonClient::subscribe`]
pub struct Snapshots {
    client: DaemonClient,
}

impl Iterator for Snapshots {
    type Item = Result<StateMessage, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.client.recv() {
                Ok(DaemonResponse::State(state)) => return Some(Ok(state)),
                // Stray pong replies are skipped
                Ok(DaemonResponse::Pong) => {}
                Ok(other) => return Some(Err(ClientError::Unexpected(Box::new(other)))),
                Err(ClientError::Closed) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub session_count: usize,
    pub subscriber_count: usize,
    pub uptime_secs: u64,
}

/// Check if daemon is available (socket exists and responds to ping)
pub fn is_daemon_available(socket_path: &Path) -> bool {
    DaemonClient::connect(socket_path)
        .map(|mut client| client.ping())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::daemon::server::DaemonServer;
    use crate::daemon::tracker::SessionTracker;
    use crate::ipc::messages::HookEventKind;

    #[test]
    fn test_connect_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        assert!(matches!(
            DaemonClient::connect(&socket_path),
            Err(ClientError::NotRunning(_))
        ));
        assert!(!is_daemon_available(&socket_path));
    }

    #[test]
    fn test_client_round_trip_against_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let server = DaemonServer::new(
            SessionTracker::new(TrackerConfig::default()),
            socket_path.clone(),
        );
        let daemon = runtime.spawn(async move { server.run().await });

        let mut connected = None;
        for _ in 0..100 {
            if let Ok(client) = DaemonClient::connect(&socket_path) {
                connected = Some(client);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut client = connected.expect("daemon did not start");
        assert!(client.ping());

        let mut stream = DaemonClient::connect(&socket_path)
            .unwrap()
            .subscribe()
            .unwrap();
        let initial = stream.next().unwrap().unwrap();
        assert!(initial.blocked);

        client
            .send_hook(HookPayload::new("s1", HookEventKind::UserPromptSubmit).with_prompt("go"))
            .unwrap();
        let update = stream.next().unwrap().unwrap();
        assert_eq!(update.working, 1);

        let state = client.get_state().unwrap();
        assert!(!state.blocked);
        assert_eq!(state.sessions[0].last_prompt.as_deref(), Some("go"));

        let status = client.status().unwrap();
        assert_eq!(status.session_count, 1);
        assert_eq!(status.subscriber_count, 1);

        client.shutdown().unwrap();
        runtime.block_on(daemon).unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
