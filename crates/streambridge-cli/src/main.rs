mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "streambridge",
    version,
    about = "Relay a partitioned message queue into an append-only stream"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline until the source is exhausted or Ctrl-C is pressed
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Stop polling after this many messages, then drain
        #[arg(long)]
        max_messages: Option<u64>,
    },
    /// Validate pipeline configuration and collaborator reachability
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Validate a pipeline file, optionally running its rules over a sample
    Validate {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// JSON-lines sample of source payloads to check against the rules
        sample: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    let result = match cli.command {
        Commands::Run {
            pipeline,
            max_messages,
        } => commands::run::execute(&pipeline, max_messages).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Validate { pipeline, sample } => {
            commands::validate::execute(&pipeline, sample.as_deref())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
