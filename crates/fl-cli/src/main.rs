//! flowlink CLI
//!
//! Thin command-line collaborator over the fl-client engine: connect
//! to an execution daemon, submit flows, watch output, end or kill
//! jobs. The daemon address defaults to the local machine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fl_core::ClientConfig;

mod commands;

#[derive(Parser)]
#[command(name = "flowlink")]
#[command(author, version, about = "Remote flow execution client")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a flow for execution and stream its output
    Run {
        /// File containing the serialized flow
        flow: PathBuf,
        /// Daemon address to run on
        #[arg(short, long, default_value = "127.0.0.1")]
        address: String,
        /// Return after submission instead of streaming output
        #[arg(short, long)]
        detach: bool,
    },

    /// List the jobs a daemon is tracking
    Jobs {
        /// Daemon address to query
        #[arg(short, long, default_value = "127.0.0.1")]
        address: String,
    },

    /// Ask the daemon to end a job after its current step
    End {
        /// Job id, as shown by `jobs`
        job: String,
        /// Daemon address the job runs on
        #[arg(short, long, default_value = "127.0.0.1")]
        address: String,
    },

    /// Ask the daemon to kill a job immediately
    Kill {
        /// Job id, as shown by `jobs`
        job: String,
        /// Daemon address the job runs on
        #[arg(short, long, default_value = "127.0.0.1")]
        address: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = ClientConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            flow,
            address,
            detach,
        } => commands::run(config, &address, &flow, detach).await,
        Commands::Jobs { address } => commands::jobs(config, &address).await,
        Commands::End { job, address } => commands::end(config, &address, &job).await,
        Commands::Kill { job, address } => commands::kill(config, &address, &job).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let rendered =
                    toml::to_string_pretty(&config).context("Failed to render configuration")?;
                print!("{rendered}");
                Ok(())
            }
            ConfigAction::Path => {
                println!("{}", fl_core::config::default_config_path().display());
                Ok(())
            }
        },
    }
}
