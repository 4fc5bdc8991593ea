//! CLI entry point - the composition root.
//!
//! This is the only place where infrastructure is wired together: the
//! config file, the supervisor, and signal handling. The tray UI drives the
//! same supervisor surface (`start`/`stop`/`reconfigure`/`status`); this
//! binary is the reference caller.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use llamalink_core::Config;
use llamalink_runtime::ServiceSupervisor;

#[derive(Parser)]
#[command(
    name = "llamalink",
    version,
    about = "OpenAI-compatible proxy for a local Ollama server"
)]
struct Cli {
    /// Path to the JSON config file (created with defaults if missing).
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy in the foreground until Ctrl-C.
    Run {
        /// Override the configured listen port for this run only.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect or edit the persisted configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the active configuration.
    Show,
    /// Set the listen port. Applies on the next start.
    SetPort { port: u16 },
    /// Set the upstream Ollama base URL.
    SetUrl { url: url::Url },
    /// Set the upstream timeout in seconds.
    SetTimeout { seconds: f64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run { port: None }) {
        Commands::Run { port } => run(&cli.config, port).await,
        Commands::Config { command } => handle_config(&cli.config, command),
    }
}

async fn run(config_path: &Path, port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::load(config_path);
    if let Some(port) = port_override {
        config.port = port;
    }
    config.validate()?;

    let upstream = config.ollama_base_url.clone();
    let supervisor = ServiceSupervisor::new(config);
    let addr = supervisor.start().await?;

    println!();
    println!("  llamalink proxy running");
    println!();
    println!("  OpenAI endpoint: http://{addr}/v1");
    println!("  Upstream Ollama: {upstream}");
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    tokio::signal::ctrl_c().await?;
    supervisor.stop().await?;

    Ok(())
}

fn handle_config(path: &Path, command: ConfigCommands) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = Config::load(path);
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigCommands::SetPort { port } => update_config(path, |c| c.port = port),
        ConfigCommands::SetUrl { url } => update_config(path, |c| c.ollama_base_url = url),
        ConfigCommands::SetTimeout { seconds } => update_config(path, |c| c.timeout = seconds),
    }
}

fn update_config(path: &Path, apply: impl FnOnce(&mut Config)) -> anyhow::Result<()> {
    let mut config = Config::load(path);
    apply(&mut config);
    config.validate()?;
    config.save(path)?;
    println!("Saved {}. Restart the service to apply.", path.display());
    Ok(())
}
