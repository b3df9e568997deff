//! Docent binary.
//!
//! Entry point for asking an on-device model about an artwork from the
//! command line.

use anyhow::Result;
use clap::Parser;
use docent_core::{
    cli::commands::Commands,
    cli::handlers::{handle_ask, handle_chat, handle_config},
    config::{DocentConfig, LoggingConfig},
};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::time::ChronoUtc, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Log to stderr, or to daily files when a log directory is configured.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "docent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_timer(ChronoUtc::rfc_3339())
                .with_target(true)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DocentConfig::load(cli.command.config_args())?;
    let _log_guard = init_logging(&config.logging);

    info!("Docent starting up");

    match cli.command {
        Commands::Ask(cmd) => handle_ask(config, cmd).await,
        Commands::Chat(cmd) => handle_chat(config, cmd).await,
        Commands::Config(_) => handle_config(config).await,
    }
}
