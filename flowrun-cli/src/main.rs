mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowrun")]
#[command(about = "Run flow scripts in an isolated worker process")]
#[command(version)]
pub struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a flow against one message instance
    Run {
        /// Flow definition (JSON)
        #[arg(short, long)]
        flow: PathBuf,

        /// Message instance (JSON)
        #[arg(short, long)]
        message: PathBuf,

        /// Transaction id forwarded to the script
        #[arg(short, long)]
        transaction_id: Option<String>,

        /// Runner configuration (TOML). Defaults to $FLOWRUN_CONFIG.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker executable, overriding the configuration
        #[arg(short, long)]
        worker: Option<PathBuf>,
    },
    /// Compile a flow's script without running it
    Check {
        /// Flow definition (JSON)
        #[arg(short, long)]
        flow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Commands::Run {
            flow,
            message,
            transaction_id,
            config,
            worker,
        } => commands::execute_run(&flow, &message, transaction_id, config.as_deref(), worker)
            .await?
            .map(|success| commands::success_report(&success)),
        Commands::Check { flow } => commands::execute_check(&flow).await?.map(|_| {
            serde_json::json!({ "ok": true })
        }),
    };

    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(error) => {
            eprintln!("{}", serde_json::to_string_pretty(&commands::error_report(&error))?);
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr; stdout carries the result.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
