#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use warden_cli::app::{self, Overrides};
use warden_cli::commands;
use warden_common::logging::init_logging;
use warden_tools::security::join_words;

/// Exit status of a turn that was denied.
const DENIED_EXIT: u8 = 2;

/// `warden` - deterministic approval and audit for side-effecting actions.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Propose, approve, execute and audit governed actions.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.warden/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the journals
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Capability registry file
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Session id used to resolve `approve`/`deny` without a proposal id
    #[arg(long, global = true, default_value = "cli")]
    session: String,

    /// Print artifacts as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit one turn command, e.g. `warden turn approve <id>`
    Turn {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },

    /// Read turn commands from stdin, one per line
    Repl,

    /// List registered capabilities
    Registry,

    /// Inspect the audit trail
    Audit {
        #[command(subcommand)]
        audit_command: AuditCommands,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    /// Show the most recent events
    Tail {
        /// Number of events
        #[arg(short = 'n', long, default_value = "20")]
        lines: usize,

        /// Only events for this proposal
        #[arg(long)]
        proposal: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = app::load_config(&Overrides {
        config: cli.config.clone(),
        data_dir: cli.data_dir.clone(),
        registry: cli.registry.clone(),
    })?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Turn { words } => {
            let protocol = app::open_protocol(&config)?;
            let line = join_words(&words);
            let accepted =
                commands::run_turn(&protocol, &cli.session, &line, cli.json, &mut out).await?;
            Ok(if accepted {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(DENIED_EXIT)
            })
        }

        Commands::Repl => {
            let protocol = app::open_protocol(&config)?;
            let stdin = std::io::stdin();
            commands::repl(&protocol, &cli.session, stdin.lock(), cli.json, &mut out).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Registry => {
            let registry = app::load_registry(&config)?;
            commands::list_registry(&registry, cli.json, &mut out)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Audit {
            audit_command: AuditCommands::Tail { lines, proposal },
        } => {
            let audit = app::open_audit(&config)?;
            commands::audit_tail(&audit, lines, proposal.as_deref(), cli.json, &mut out)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
