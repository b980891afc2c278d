//! comrelay - interactive relay front end
//!
//! Starts the relay with the configured clients, then reads administrative
//! commands from stdin until `quit` or Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use comrelay_relay::{Relay, RelayConfig};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod shell;

use shell::{Command, Flow};

/// Relay OSC, MIDI and UDP input to persistent TCP command streams
#[derive(Parser)]
#[command(name = "comrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML); defaults apply when omitted
    #[arg(short, long, env = "COMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };

    if cli.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    setup_logging(&cli.log_level, cli.json_logs)?;

    let relay = Relay::new(config);
    relay.start().await.context("Failed to start relay")?;

    println!("{} relay running", "COMRELAY".cyan().bold());
    shell::print_help();

    let result = run_shell(&relay).await;

    relay.shutdown();
    println!("Goodbye!");
    result
}

async fn run_shell(relay: &Relay) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    // stdin closed
                    return Ok(());
                };
                let Some(command) = Command::parse(&line) else {
                    continue;
                };
                if shell::execute(relay, command).await == Flow::Quit {
                    return Ok(());
                }
            }
        }
    }
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}
