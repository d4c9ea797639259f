//! Intercom: a message bus for autonomous coding agents.
//!
//! Exit codes: 0 success, 1 configuration or I/O error, 2 authentication
//! error.

mod tool_server;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use intercom_types::{IntercomConfig, IntercomError, Mode};

#[derive(Parser, Debug)]
#[command(name = "intercom", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "~/.config/intercom/config.yml")]
    config: String,

    /// Increase logging verbosity (RUST_LOG=debug)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the central hub
    Hub,

    /// Run a machine daemon
    Daemon,

    /// Run hub and daemon in one process
    Standalone,

    /// Run the per-agent session shim (registers presence and an inbox
    /// with the local daemon)
    ToolServer,

    /// Drain unread inbox messages and print them
    CheckInbox {
        /// Output format
        #[arg(long, value_enum, default_value_t = InboxFormat::Hook)]
        format: InboxFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum InboxFormat {
    /// Human-readable, for system-reminder injection
    Hook,
    /// Machine-readable JSON
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &IntercomError) -> u8 {
    match e {
        IntercomError::AuthStale
        | IntercomError::AuthBadSignature
        | IntercomError::AuthUnknownMachine(_) => 2,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<(), IntercomError> {
    let config_path = expand_tilde(&cli.config);
    let mut config = IntercomConfig::load(&config_path)?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| IntercomError::Internal(e.to_string()))?;

    match cli.command {
        Commands::Hub => {
            config.mode = Mode::Hub;
            runtime.block_on(intercom_hub::run_hub(config))
        }
        Commands::Daemon => {
            config.mode = Mode::Daemon;
            runtime.block_on(intercom_daemon::run_daemon(config))
        }
        Commands::Standalone => {
            config.mode = Mode::Standalone;
            runtime.block_on(run_standalone(config))
        }
        Commands::ToolServer => runtime.block_on(tool_server::run(config)),
        Commands::CheckInbox { format } => check_inbox(&config, format),
    }
}

/// Hub and daemon side by side: the hub on the configured port, the
/// daemon on the next one, with the local machine pre-approved so no
/// operator round-trip is needed to talk to yourself.
async fn run_standalone(config: IntercomConfig) -> Result<(), IntercomError> {
    let machine_id = config.machine_id().to_string();
    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| IntercomError::Config(format!("{}: {e}", state_dir.display())))?;

    let hub_port: u16 = config
        .hub
        .listen
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7700);
    let daemon_listen = format!("0.0.0.0:{}", hub_port + 1);

    let token = if config.auth.token.is_empty() {
        intercom_hub::generate_token(&machine_id)
    } else {
        config.auth.token.clone()
    };

    // Self-approve the local machine so routing works immediately.
    {
        let registry = intercom_registry::Registry::open(&state_dir.join("registry.db"))?;
        registry.register_machine(
            &machine_id,
            &config.machine.display_name,
            "127.0.0.1",
            &format!("http://127.0.0.1:{}", hub_port + 1),
            &token,
            intercom_types::MachineStatus::Approved,
        )?;
    }

    let mut daemon_config = config.clone();
    daemon_config.auth.token = token;
    daemon_config.hub.url = format!("http://127.0.0.1:{hub_port}");

    tokio::try_join!(
        intercom_hub::run_hub(config),
        intercom_daemon::run_daemon_on(daemon_config, &daemon_listen),
    )?;
    Ok(())
}

/// Drain every inbox file under the state dir and print unread messages.
fn check_inbox(config: &IntercomConfig, format: InboxFormat) -> Result<(), IntercomError> {
    let inbox_dir = config.inbox_dir();
    if !inbox_dir.is_dir() {
        return Ok(());
    }

    let mut unread = Vec::new();
    for entry in std::fs::read_dir(&inbox_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            unread.extend(intercom_daemon::inbox::drain_unread(&path)?);
        }
    }

    if unread.is_empty() {
        return Ok(());
    }

    match format {
        InboxFormat::Json => {
            println!(
                "{}",
                serde_json::json!({"messages": unread, "count": unread.len()})
            );
        }
        InboxFormat::Hook => {
            println!("Pending intercom messages ({}):\n", unread.len());
            for msg in &unread {
                println!("[{}] {} ({}):", msg.thread_id, msg.from_agent, msg.timestamp);
                println!("  \"{}\"\n", msg.message);
            }
            println!("-> Use reply with the thread id to answer.");
        }
    }
    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
