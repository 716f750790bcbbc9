mod client;
mod common;
mod config;
mod daemon;
mod ipc;

use crate::client::DaemonClient;
use crate::common::{git, logging, truncate};
use crate::config::TrackerConfig;
use crate::daemon::notifier;
use crate::daemon::server::{self, DaemonServer};
use crate::daemon::tracker::SessionTracker;
use crate::ipc::messages::{get_socket_path, HookPayload, SessionStatus, StateMessage};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use serde_json::json;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Hook events `claude-blocker hook` must be registered for
const HOOK_EVENTS: [&str; 5] = [
    "SessionStart",
    "SessionEnd",
    "UserPromptSubmit",
    "PreToolUse",
    "Stop",
];

#[derive(Parser, Debug)]
#[command(name = "claude-blocker")]
#[command(about = "Tracks Claude Code sessions from hook events and reports when work is blocked")]
struct Cli {
    /// Daemon socket path
    #[arg(long, global = true, env = "CLAUDE_BLOCKER_SOCKET")]
    socket: Option<PathBuf>,

    /// Verbose logging, also written to the debug log file
    #[arg(long, global = true, env = "CLAUDE_BLOCKER_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Daemon(DaemonArgs),
    /// Forward a hook payload from stdin to the daemon
    Hook,
    /// Show the current state
    Status {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print every state update as a JSON line
    Watch,
    /// Check that the daemon is responding
    Ping,
    /// Stop the daemon
    Stop,
    /// Print the hooks settings snippet for Claude Code
    HooksConfig,
}

#[derive(Args, Debug)]
struct DaemonArgs {
    /// Expire sessions idle for this long
    #[arg(long, env = "CLAUDE_BLOCKER_SESSION_TIMEOUT_MS", default_value_t = 300_000)]
    session_timeout_ms: u64,

    /// Ignore follow-up events this soon after a session starts waiting for input
    #[arg(long, env = "CLAUDE_BLOCKER_DEBOUNCE_MS", default_value_t = 500)]
    debounce_ms: u64,

    /// How often to look for expired sessions
    #[arg(long, env = "CLAUDE_BLOCKER_SWEEP_INTERVAL_MS", default_value_t = 30_000)]
    sweep_interval_ms: u64,

    /// Tool that means the assistant is waiting for the user (repeatable)
    #[arg(
        long = "input-tool",
        env = "CLAUDE_BLOCKER_INPUT_TOOLS",
        value_delimiter = ','
    )]
    input_tools: Vec<String>,

    /// Don't send desktop notifications
    #[arg(long, env = "CLAUDE_BLOCKER_NO_NOTIFY")]
    no_notify: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(cli.debug);
    let socket_path = cli.socket.unwrap_or_else(get_socket_path);

    match cli.command {
        Command::Daemon(args) => run_daemon(socket_path, args),
        Command::Hook => {
            // Never fail the hook: the assistant must not be held up by us
            if let Err(err) = run_hook(&socket_path) {
                debug!(error = %err, "Hook event not delivered");
            }
            Ok(())
        }
        Command::Status { json } => run_status(&socket_path, json),
        Command::Watch => run_watch(&socket_path),
        Command::Ping => run_ping(&socket_path),
        Command::Stop => run_stop(&socket_path),
        Command::HooksConfig => {
            println!("{}", serde_json::to_string_pretty(&hooks_config())?);
            Ok(())
        }
    }
}

fn run_daemon(socket_path: PathBuf, args: DaemonArgs) -> Result<()> {
    let config = TrackerConfig::from_millis(
        args.session_timeout_ms,
        args.debounce_ms,
        args.sweep_interval_ms,
        &args.input_tools,
    )
    .context("Invalid daemon configuration")?;

    info!(
        session_timeout_ms = args.session_timeout_ms,
        debounce_ms = args.debounce_ms,
        sweep_interval_ms = args.sweep_interval_ms,
        input_tools = ?config.input_tools,
        notify = !args.no_notify,
        "Starting daemon"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let tracker = SessionTracker::new(config);

        let _notifications = if args.no_notify {
            None
        } else {
            let (tx, rx) = notifier::channel();
            tokio::spawn(notifier::run_notifier(rx));
            Some(tracker.subscribe(notifier::subscriber(tx)))
        };

        let server = DaemonServer::new(tracker, socket_path);
        server::spawn_signal_handler(server.shutdown_handle());
        server.run().await
    })
}

fn run_hook(socket_path: &Path) -> Result<()> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read hook payload")?;
    let payload = enrich_payload(serde_json::from_str(&input).context("Invalid hook payload")?);

    DaemonClient::connect(socket_path)?.send_hook(payload)?;
    Ok(())
}

/// Fill in the git repo name when the payload carries a cwd but no repo
fn enrich_payload(mut payload: HookPayload) -> HookPayload {
    if payload.git_repo.is_none() {
        payload.git_repo = payload.cwd.as_deref().and_then(git::repo_name);
    }
    payload
}

fn run_status(socket_path: &Path, json: bool) -> Result<()> {
    let mut client = DaemonClient::connect(socket_path)?;
    let state = client.get_state()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let status = client.status()?;
    println!(
        "{} - up {}s, {} session(s), {} subscriber(s)",
        "claude-blocker".bold(),
        status.uptime_secs,
        status.session_count,
        status.subscriber_count
    );
    print_state(&state);
    Ok(())
}

fn print_state(state: &StateMessage) {
    let headline = if state.blocked {
        "BLOCKED".red().bold()
    } else {
        "WORKING".green().bold()
    };
    println!(
        "{}  {} working, {} waiting for input",
        headline, state.working, state.waiting_for_input
    );

    if state.sessions.is_empty() {
        println!("{}", "No active sessions".dimmed());
        return;
    }

    println!();
    for session in &state.sessions {
        let label = format!("{:<17}", session.status.as_str());
        let status = match session.status {
            SessionStatus::Working => label.as_str().green(),
            SessionStatus::WaitingForInput => label.as_str().yellow(),
            SessionStatus::Idle => label.as_str().dimmed(),
        };
        let location = session
            .git_repo
            .as_deref()
            .or(session.cwd.as_deref())
            .unwrap_or("-");
        println!(
            "  {} {:<12} {}",
            status,
            truncate(&session.id, 12),
            location.cyan()
        );
        if let Some(prompt) = &session.last_prompt {
            println!("  {:<17} {}", "", truncate(prompt, 70).as_str().dimmed());
        }
    }
}

fn run_watch(socket_path: &Path) -> Result<()> {
    for state in DaemonClient::connect(socket_path)?.subscribe()? {
        println!("{}", serde_json::to_string(&state?)?);
    }
    Ok(())
}

fn run_ping(socket_path: &Path) -> Result<()> {
    if client::is_daemon_available(socket_path) {
        println!("{}", "pong".green());
        Ok(())
    } else {
        anyhow::bail!("Daemon is not responding on {}", socket_path.display())
    }
}

fn run_stop(socket_path: &Path) -> Result<()> {
    DaemonClient::connect(socket_path)?.shutdown()?;
    println!("Daemon stopped");
    Ok(())
}

/// Settings snippet registering `claude-blocker hook` for every consumed event
fn hooks_config() -> serde_json::Value {
    let handler = json!([{
        "matcher": "",
        "hooks": [{ "type": "command", "command": "claude-blocker hook" }]
    }]);
    let hooks: serde_json::Map<String, serde_json::Value> = HOOK_EVENTS
        .iter()
        .map(|event| (event.to_string(), handler.clone()))
        .collect();
    json!({ "hooks": hooks })
}
