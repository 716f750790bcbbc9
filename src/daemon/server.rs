//! Unix socket server for the daemon.

use crate::daemon::hub::DeliveryError;
use crate::daemon::tracker::SessionTracker;
use crate::ipc::messages::{get_pid_file_path, DaemonCommand, DaemonResponse, StateMessage};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Per-subscriber queue depth before snapshots are dropped
const SUBSCRIBER_QUEUE: usize = 64;

/// Daemon server exposing the session tracker over a Unix socket
pub struct DaemonServer {
    tracker: Arc<SessionTracker>,
    socket_path: PathBuf,
    start_time: Instant,
    shutdown: Arc<Notify>,
}

/// What the connection loop should do after a command
enum Flow {
    Continue,
    Close,
}

impl DaemonServer {
    pub fn new(tracker: Arc<SessionTracker>, socket_path: PathBuf) -> Self {
        Self {
            tracker,
            socket_path,
            start_time: Instant::now(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle that stops [`DaemonServer::run`] when notified
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Bind the socket, start the expiry sweep and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        info!(path = %self.socket_path.display(), "Daemon listening");

        self.tracker.start_expiry();

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => break Err(err).context("Failed to accept connection"),
                    };
                    let ctx = ConnectionContext {
                        tracker: self.tracker.clone(),
                        start_time: self.start_time,
                        shutdown: self.shutdown.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, ctx).await {
                            debug!(error = %err, "Connection error");
                        }
                    });
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown requested");
                    break Ok(());
                }
            }
        };

        self.tracker.shutdown();
        self.cleanup();
        result
    }

    fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        if is_daemon_running(&self.socket_path) {
            anyhow::bail!(
                "Another daemon is already listening on {}",
                self.socket_path.display()
            );
        }
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path).context("Failed to remove stale socket")?;
        }

        let pid_path = get_pid_file_path(&self.socket_path);
        fs::write(&pid_path, std::process::id().to_string())
            .context("Failed to write PID file")?;

        UnixListener::bind(&self.socket_path).context("Failed to bind to socket")
    }

    fn cleanup(&self) {
        for path in [
            self.socket_path.clone(),
            get_pid_file_path(&self.socket_path),
        ] {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "Failed to remove runtime file");
                }
            }
        }
    }
}

struct ConnectionContext {
    tracker: Arc<SessionTracker>,
    start_time: Instant,
    shutdown: Arc<Notify>,
}

/// Handle a single client connection
async fn handle_connection(stream: UnixStream, ctx: ConnectionContext) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Read commands line by line (newline-delimited JSON) until the client hangs up
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line, &mut writer).await? else {
            continue;
        };

        if command == DaemonCommand::Subscribe {
            match stream_snapshots(&ctx.tracker, &mut lines, &mut writer).await? {
                Flow::Continue => continue,
                Flow::Close => break,
            }
        }

        let response = handle_command(command, &ctx);
        send_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Parse one line; blank lines yield `None`, malformed ones an error response
async fn parse_command(
    line: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<Option<DaemonCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    match serde_json::from_str(line) {
        Ok(command) => Ok(Some(command)),
        Err(e) => {
            let response = DaemonResponse::Error {
                message: format!("Invalid command: {}", e),
            };
            send_response(writer, &response).await?;
            Ok(None)
        }
    }
}

/// Handle a single request/response command
fn handle_command(command: DaemonCommand, ctx: &ConnectionContext) -> DaemonResponse {
    match command {
        DaemonCommand::Hook(payload) => {
            debug!(
                session_id = %payload.session_id,
                event = ?payload.hook_event_name,
                tool = ?payload.tool_name,
                "Hook event received"
            );
            ctx.tracker.handle_event(&payload);
            DaemonResponse::Ok
        }

        DaemonCommand::GetState => DaemonResponse::State(ctx.tracker.snapshot(false)),

        DaemonCommand::GetSessions => DaemonResponse::Sessions {
            sessions: ctx.tracker.sessions(),
        },

        DaemonCommand::Status => DaemonResponse::Status {
            running: true,
            session_count: ctx.tracker.session_count(),
            subscriber_count: ctx.tracker.subscriber_count(),
            uptime_secs: ctx.start_time.elapsed().as_secs(),
        },

        DaemonCommand::Shutdown => {
            info!("Shutdown command received");
            ctx.shutdown.notify_one();
            DaemonResponse::Ok
        }

        DaemonCommand::Ping => DaemonResponse::Pong,

        // Only meaningful while streaming
        DaemonCommand::Unsubscribe => DaemonResponse::Ok,

        DaemonCommand::Subscribe => DaemonResponse::Error {
            message: "subscribe is handled by the connection loop".to_string(),
        },
    }
}

/// Push snapshots to this connection until it disconnects or unsubscribes
async fn stream_snapshots(
    tracker: &Arc<SessionTracker>,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
) -> Result<Flow> {
    let (tx, mut rx) = mpsc::channel::<StateMessage>(SUBSCRIBER_QUEUE);
    let subscription = tracker.subscribe(move |message: &StateMessage| {
        tx.try_send(message.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagged,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    });
    debug!(subscriber = subscription.id(), "Client subscribed");

    let flow = loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    // Tracker shut down and dropped this subscriber
                    break Ok(Flow::Close);
                };
                if let Err(err) = send_response(writer, &DaemonResponse::State(message)).await {
                    break Err(err);
                }
            }
            // next_line is cancel safe: a partial line survives a snapshot write
            read = lines.next_line() => {
                let line = match read {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(Flow::Close),
                    Err(err) => break Err(err.into()),
                };
                match serde_json::from_str::<DaemonCommand>(line.trim()).ok() {
                    Some(DaemonCommand::Unsubscribe) => {
                        if let Err(err) = send_response(writer, &DaemonResponse::Ok).await {
                            break Err(err);
                        }
                        break Ok(Flow::Continue);
                    }
                    Some(DaemonCommand::Ping) => {
                        if let Err(err) = send_response(writer, &DaemonResponse::Pong).await {
                            break Err(err);
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    subscription.unsubscribe();
    debug!(subscriber = subscription.id(), "Client unsubscribed");
    flow
}

/// Send a response to a client
async fn send_response(writer: &mut OwnedWriteHalf, response: &DaemonResponse) -> Result<()> {
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Stop the daemon on Ctrl-C or SIGTERM
pub fn spawn_signal_handler(shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "Failed to install SIGTERM handler");
                    if ctrl_c.await.is_ok() {
                        shutdown.notify_one();
                    }
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl-C"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        shutdown.notify_one();
    });
}

/// Check if a daemon is listening on `socket_path`
pub fn is_daemon_running(socket_path: &Path) -> bool {
    socket_path.exists() && std::os::unix::net::UnixStream::connect(socket_path).is_ok()
}
