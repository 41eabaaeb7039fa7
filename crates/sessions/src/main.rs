//! VivyTerm CLI
//!
//! Headless front end for the session core.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sessions::config::{default_config_path, Config};
use sessions::{
    ConnectionState, LogicalSession, MultiplexerChoice, OpenOptions, Orchestrator, OrchestratorEvent,
    OrchestratorHandle, OrchestratorSettings, SessionId, SessionStore, SshConnector,
    StaticCredentials,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;
use transport::{ConnectTarget, Credentials};

/// VivyTerm - SSH terminal sessions from the command line.
#[derive(Parser, Debug)]
#[command(name = "vivy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open an interactive shell on a server
    Connect {
        /// Target as user@host[:port]
        target: String,

        /// Private key file
        #[arg(short, long, value_name = "FILE")]
        identity: Option<PathBuf>,

        /// Environment variable holding the key passphrase
        #[arg(long, value_name = "VAR", requires = "identity")]
        passphrase_env: Option<String>,

        /// Environment variable holding the password
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,

        /// Run the shell inside tmux
        #[arg(long)]
        tmux: bool,
    },

    /// List saved sessions
    Sessions,

    /// Print the effective configuration
    Config {
        /// Write a default configuration file instead
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let _guard = init_logging(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Connect {
            target,
            identity,
            passphrase_env,
            password_env,
            tmux,
        } => {
            let target = ConnectTarget::parse(&target)
                .with_context(|| format!("Invalid target '{target}', expected user@host[:port]"))?;
            let credentials =
                load_credentials(identity.as_deref(), passphrase_env.as_deref(), password_env.as_deref())?;
            run_connect(&config, target, credentials, tmux).await?;
        }
        Commands::Sessions => {
            let store = SessionStore::new(config.sessions_path());
            let snapshot = store.load()?;
            print_sessions_table(&snapshot.sessions, snapshot.selected);
        }
        Commands::Config { init } => {
            if init {
                if config_path.exists() {
                    bail!("Config file already exists: {}", config_path.display());
                }
                Config::default().save(&config_path)?;
                println!("Wrote default configuration to {}", config_path.display());
            } else {
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}

/// Installs the tracing subscriber. The returned guard must live until
/// exit so buffered file logs are flushed.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    let filter = EnvFilter::try_new(level).context("Invalid log level")?;
    let stderr = fmt::layer().with_writer(std::io::stderr);

    if !config.general.log_to_file {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(config.log_dir(), "vivy.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn load_credentials(
    identity: Option<&Path>,
    passphrase_env: Option<&str>,
    password_env: Option<&str>,
) -> anyhow::Result<Credentials> {
    let read_env = |var: &str| {
        std::env::var(var).with_context(|| format!("Environment variable {var} is not set"))
    };

    if let Some(path) = identity {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity file {}", path.display()))?;
        let passphrase = passphrase_env.map(read_env).transpose()?;
        return Ok(Credentials::PrivateKey { pem, passphrase });
    }
    if let Some(var) = password_env {
        return Ok(Credentials::Password(read_env(var)?));
    }
    bail!("No credentials given, use --identity or --password-env")
}

async fn run_connect(
    config: &Config,
    target: ConnectTarget,
    credentials: Credentials,
    tmux: bool,
) -> anyhow::Result<()> {
    let connector = SshConnector::from_config(
        config,
        Arc::new(StaticCredentials::new().with_fallback(credentials)),
    );
    let store = SessionStore::new(config.sessions_path());
    let (handle, task) = Orchestrator::spawn(connector, OrchestratorSettings::from(config), Some(store));
    let mut events = handle.subscribe();

    let session = handle
        .open(
            target.clone(),
            OpenOptions {
                multiplexer: tmux.then_some(true),
                ..OpenOptions::default()
            },
        )
        .await?;
    // A restored session comes back disconnected.
    let restored = handle
        .sessions()
        .get(session)
        .is_some_and(|s| !s.state.is_active());
    if restored {
        handle.reconnect(session).await?;
    }
    eprintln!("Connecting to {target}...");

    let result = pump_terminal(&handle, session, &mut events).await;

    handle.shutdown().await?;
    task.await.context("Orchestrator task failed")?;
    result
}

/// Copies stdin lines to the shell and shell output to stdout until the
/// session ends, stdin closes or Ctrl-C.
async fn pump_terminal(
    handle: &OrchestratorHandle,
    session: SessionId,
    events: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
) -> anyhow::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(());
            }
            line = stdin.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = handle.send_text(session, format!("{line}\n")).await {
                        eprintln!("{e}");
                    }
                }
                None => return Ok(()),
            },
            event = events.recv() => match event {
                Ok(OrchestratorEvent::Output { session: id, data }) if id == session => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Ok(OrchestratorEvent::StateChanged { session: id, state }) if id == session => {
                    eprintln!("[{state}]");
                    match state {
                        ConnectionState::Disconnected => return Ok(()),
                        ConnectionState::Failed(reason) => bail!("Connection failed: {reason}"),
                        _ => {}
                    }
                }
                Ok(OrchestratorEvent::MultiplexerPrompt { session: id, candidates }) if id == session => {
                    eprintln!("Existing tmux sessions: {}", candidates.join(", "));
                    eprintln!("Starting a new one.");
                    handle.resolve_multiplexer(session, MultiplexerChoice::CreateNew).await?;
                }
                Ok(OrchestratorEvent::Error { session: Some(id), message }) if id == session => {
                    eprintln!("Error: {message}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped terminal events");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[LogicalSession], selected: Option<SessionId>) {
    if sessions.is_empty() {
        println!("No saved sessions.");
        return;
    }

    let target_width = sessions
        .iter()
        .map(|s| s.target.to_string().len())
        .max()
        .unwrap_or(6)
        .max(6);
    let title_width = sessions
        .iter()
        .map(|s| s.title.len())
        .max()
        .unwrap_or(5)
        .clamp(5, 24);

    println!(
        "  {:<8}  {:<target_width$}  {:<title_width$}  {:>10}  CWD",
        "ID", "TARGET", "TITLE", "ACTIVE",
    );
    println!("{}", "-".repeat(target_width + title_width + 34));

    for session in sessions {
        let marker = if selected == Some(session.id) { '*' } else { ' ' };
        let id = session.id.simple().to_string();
        println!(
            "{marker} {:<8}  {:<target_width$}  {:<title_width$}  {:>10}  {}",
            &id[..8],
            session.target.to_string(),
            truncate_str(&session.title, title_width),
            format_relative_time(session.last_active_at),
            session.working_directory.as_deref().unwrap_or("-"),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: SystemTime) -> String {
    let elapsed = SystemTime::now()
        .duration_since(timestamp)
        .unwrap_or_default()
        .as_secs();

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
