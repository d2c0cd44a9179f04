use clap::Parser;
use dotenv::dotenv;

mod cli;
mod config;
mod discovery;
mod error;
mod logging;
mod models;
mod utils;

use cli::Cli;
use config::Config;
use discovery::{PhaseReport, RelayPool, Scanner};
use error::AppError;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize environment
    dotenv().ok();

    // Parse command-line arguments
    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;

    // Console plus master log file
    logging::init(&config.log_file)?;

    let source = RelayPool::from_config(&config);
    tracing::info!("Adding {} relays...", source.relays().len());
    for relay in source.relays() {
        tracing::info!("Added relay: {}", relay);
    }

    let scanner = Scanner::new(config, source);
    tracing::info!(
        "Using vendor registry at {}",
        scanner.store().path().display()
    );

    match scanner.scan().await {
        Ok((registry, report)) => {
            if registry.is_empty() {
                tracing::warn!("No DVM vendors discovered");
            }
            log_phase("announcement", &report.announcements);
            log_phase("result", &report.results);
            log_phase("request", &report.requests);
            tracing::info!("Scan finished with {} vendors", report.vendors);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Scan failed: {}", e);
            Err(e)
        }
    }
}

fn log_phase(name: &str, report: &PhaseReport) {
    tracing::info!(
        "{} phase: {} queries ({} failed), {} events fetched, {} merged, {} skipped",
        name,
        report.queries,
        report.failed_queries,
        report.fetched,
        report.applied,
        report.skipped
    );
}
