pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::commands::SubmitRequest;
use crate::cli::config::ShooterConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, instead of the one in the platform config directory
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a screenshot group and queue its tasks
    Submit {
        /// Site URLs, each inheriting the default config
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        urls: Vec<String>,

        /// Request file with `sites` and `default_config` (YAML or JSON)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Block until every task settled
        #[arg(short, long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },

    /// Show the aggregate status of a group
    Status {
        /// Group ID to check status for
        #[arg(required = true)]
        group_id: String,
    },

    /// Package a group's artifacts into a zip archive
    Archive {
        /// Group ID to package
        #[arg(required = true)]
        group_id: String,

        /// Package whatever is on disk even if tasks are still running
        #[arg(short, long)]
        partial: bool,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Consume tasks from the queue until interrupted
    Worker {
        /// Requeue unacknowledged tasks left by a crashed worker first
        #[arg(long)]
        recover: bool,
    },

    /// Run a request end to end in this process and archive the result
    Run {
        /// Request file with `sites` and `default_config` (YAML or JSON)
        #[arg(short, long, required = true)]
        file: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = ShooterConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Submit { urls, file, wait, timeout } => {
            let request = match file {
                Some(path) => SubmitRequest::load(&path)?,
                None => SubmitRequest::from_urls(urls),
            };
            info!("Submitting {} site(s)", request.sites.len());
            commands::submit(&config, request, wait, timeout).await
        }
        Commands::Status { group_id } => {
            info!("Checking status for group {}", group_id);
            commands::status(&config, &group_id).await
        }
        Commands::Archive { group_id, partial, output } => {
            info!("Archiving group {}", group_id);
            commands::archive(&config, &group_id, partial, output).await
        }
        Commands::Worker { recover } => {
            info!("Starting worker");
            commands::worker(&config, recover).await
        }
        Commands::Run { file, output } => {
            let request = SubmitRequest::load(&file)?;
            info!("Running {} site(s) from {}", request.sites.len(), file.display());
            commands::run(&config, request, output).await
        }
        Commands::Config => {
            info!("Showing current configuration");
            commands::show_config(&config, cli.config.as_deref())
        }
    }
}
