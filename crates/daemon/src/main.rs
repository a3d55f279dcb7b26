//! TermHub Daemon
//!
//! Browser terminal sessions over WebSocket.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::auth::hash_token;
use daemon::config::Config;
use daemon::ipc::{
    get_daemon_pid, get_pid_file_path, get_socket_path, is_daemon_running, IpcClient,
    IpcResponse, IpcSessionInfo,
};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// TermHub - browser terminal sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "termhub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage active sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Print the SHA-256 digest of a client token for `[[auth.tokens]]`
    HashToken {
        /// Plaintext token
        token: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all active sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Close a session; its client receives a close frame
    Kill {
        /// Session ID to kill
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Hashing needs neither config nor logging.
    if let Commands::HashToken { token } = &cli.command {
        println!("{}", hash_token(token));
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let _log_guard = init_logging(&config, cli.verbose)?;
    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }

    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Start => {
            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  termhub stop");
                std::process::exit(1);
            }

            let mut orchestrator = DaemonOrchestrator::new(config).await?;
            run_foreground(&mut orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            let result = if force {
                force_stop_daemon()
            } else {
                graceful_stop_daemon(timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: termhub stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match query_status().await {
            Ok(IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                sessions_created,
                backend,
                bind_addr,
            }) => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "stopped" }
                );
                println!("  Listening: {}", bind_addr);
                println!("  Backend:   {}", backend);
                println!("  Uptime:    {}", format_duration(uptime_secs));
                println!("  Sessions:  {} ({} created)", session_count, sessions_created);
            }
            Ok(_) => {
                eprintln!("Unexpected response from daemon");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(SessionsCommands::List { json }) => match query_sessions().await {
            Ok(sessions) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
            }
            Err(e) => {
                eprintln!("Failed to list sessions: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(SessionsCommands::Kill { session_id }) => {
            match kill_session(&session_id).await {
                Ok(()) => println!("Session {} closed", session_id),
                Err(e) => {
                    eprintln!("Failed to kill session {}: {}", session_id, e);
                    std::process::exit(1);
                }
            }
        }
        Commands::HashToken { .. } => {}
    }

    Ok(())
}

/// Set up `tracing`. `--verbose` wins over `RUST_LOG`, which wins over the
/// configured level. With `daemon.log_dir` set, logs go to a daily file.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
    };

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "termhub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

async fn run_foreground(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    let mut events = orchestrator.subscribe();
    orchestrator.start().await?;

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::info!("Accepting WebSocket clients on ws://{}", addr);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = orchestrator.stop_requested() => {}
    }
    orchestrator.stop().await?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

async fn query_status() -> anyhow::Result<IpcResponse> {
    let response = connect().await?.status().await?;
    match response {
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        other => Ok(other),
    }
}

async fn query_sessions() -> anyhow::Result<Vec<IpcSessionInfo>> {
    match connect().await?.list_sessions().await? {
        IpcResponse::Sessions { sessions } => Ok(sessions),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

async fn kill_session(session_id: &str) -> anyhow::Result<()> {
    match connect().await?.kill_session(session_id.to_string()).await? {
        IpcResponse::SessionKilled { session_id: killed } if killed == session_id => Ok(()),
        IpcResponse::SessionKilled { session_id: killed } => {
            anyhow::bail!("Unexpected session killed: {}", killed)
        }
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Ask the daemon to stop, then wait for its socket to disappear.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    match client.stop().await? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
    drop(client);

    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);
    while std::time::Instant::now() < deadline {
        if !socket_path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// SIGKILL the daemon named in the PID file and clean up after it.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_daemon_pid()
        .ok_or_else(|| anyhow::anyhow!("No running daemon found (PID file missing or stale)"))?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    // A killed daemon cannot remove these itself.
    let _ = std::fs::remove_file(get_pid_file_path());
    let _ = std::fs::remove_file(get_socket_path());
    Ok(())
}

fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = column_width(sessions.iter().map(|s| s.id.len()), 2);
    let target_width = column_width(sessions.iter().map(|s| s.target.len()), 6);
    let user_width = column_width(sessions.iter().map(|s| s.principal.len()), 4);

    println!(
        "{:<id_width$}  {:<target_width$}  {:<user_width$}  {:<9}  {:<7}  {:>8}  {:>8}",
        "ID", "TARGET", "USER", "STATE", "BACKEND", "CREATED", "IDLE",
    );
    println!(
        "{}",
        "-".repeat(id_width + target_width + user_width + 9 + 7 + 8 + 8 + 12)
    );

    let now = unix_now();
    for session in sessions {
        println!(
            "{:<id_width$}  {:<target_width$}  {:<user_width$}  {:<9}  {:<7}  {:>8}  {:>8}",
            session.id,
            session.target,
            session.principal,
            session.state,
            session.backend,
            format_age(now.saturating_sub(session.created_at)),
            format_age(now.saturating_sub(session.last_activity)),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn column_width(lengths: impl Iterator<Item = usize>, header: usize) -> usize {
    lengths.max().unwrap_or(header).max(header)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Compact age such as "42s", "5m", "3h", "2d".
fn format_age(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["termhub", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
    }

    #[test]
    fn test_stop_defaults() {
        let cli = Cli::try_parse_from(["termhub", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(!force);
                assert_eq!(timeout, 30);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_force_with_timeout() {
        let cli = Cli::try_parse_from(["termhub", "stop", "-f", "--timeout", "5"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(force);
                assert_eq!(timeout, 5);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["termhub", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_kill() {
        let cli = Cli::try_parse_from(["termhub", "sessions", "kill", "alice-1"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Kill { session_id }) => {
                assert_eq!(session_id, "alice-1");
            }
            _ => panic!("Expected Sessions Kill command"),
        }
    }

    #[test]
    fn test_sessions_kill_requires_id() {
        assert!(Cli::try_parse_from(["termhub", "sessions", "kill"]).is_err());
    }

    #[test]
    fn test_hash_token() {
        let cli = Cli::try_parse_from(["termhub", "hash-token", "s3cret"]).unwrap();
        match cli.command {
            Commands::HashToken { token } => assert_eq!(token, "s3cret"),
            _ => panic!("Expected HashToken command"),
        }
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli =
            Cli::try_parse_from(["termhub", "status", "-v", "--config", "/etc/termhub.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termhub.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["termhub"]).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(42), "42s");
        assert_eq!(format_age(300), "5m");
        assert_eq!(format_age(7200), "2h");
        assert_eq!(format_age(172_800), "2d");
    }
}
