mod allocation;
mod audit;
mod config;
mod distribution;
mod error;
mod execution;
mod input;
mod oracle;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::audit::{run_stem, AuditSink};
use crate::config::Settings;
use crate::error::AppResult;
use crate::distribution::{DistributionConfig, Orchestrator, RunSummary};
use crate::execution::{ContractClient, SorobanConfig, SorobanRpcGateway};
use crate::input::read_distribution_file;

/// Distribute vault share tokens to the recipients listed in a CSV file
#[derive(Parser, Debug)]
#[command(name = "distributor", version, about)]
struct Cli {
    /// CSV with asset, vault, user and amount columns
    input: PathBuf,

    /// Also print the run summary as JSON
    #[arg(long)]
    json: bool,
}

// Stdout plus a plain-text run log next to the audit CSV
fn init_tracing(log_path: &Path) -> anyhow::Result<()> {
    let log_file = File::create(log_path)
        .with_context(|| format!("Cannot create log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,distributor=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();

    Ok(())
}

fn load_settings() -> AppResult<Settings> {
    dotenv::dotenv().ok();
    Ok(Settings::from_env()?)
}

/// Load the input, distribute every vault and write the audit trail.
/// `None` when the input holds nothing to distribute.
async fn run(
    cli: &Cli,
    settings: &Settings,
    started: DateTime<Utc>,
    run_id: Uuid,
    log_path: &Path,
) -> AppResult<Option<RunSummary>> {
    let ingested = read_distribution_file(&cli.input, settings.mode)?;
    if ingested.groups.is_empty() {
        warn!("⚠️ Nothing to distribute in {}", cli.input.display());
        return Ok(None);
    }

    let gateway = SorobanRpcGateway::new(SorobanConfig::from(settings), &settings.distributor_secret)?;
    let contracts = ContractClient::new(
        Arc::new(gateway),
        settings.relay_contract.clone(),
        settings.relay_method.clone(),
    );
    let sink = AuditSink::create(&settings.output_dir, started, run_id)?;
    info!("📝 Audit trail: {}", sink.path().display());

    let mut orchestrator = Orchestrator::new(DistributionConfig::from(settings), contracts, sink, run_id);
    let summary = orchestrator.run(&ingested.groups).await?;

    print_summary(&summary, orchestrator.sink(), log_path);
    Ok(Some(summary))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let settings = load_settings().context("Invalid distributor configuration")?;

    let started = Utc::now();
    let run_id = Uuid::new_v4();
    fs::create_dir_all(&settings.output_dir)
        .with_context(|| format!("Cannot create output dir {}", settings.output_dir.display()))?;
    let log_path = settings.output_dir.join(format!("{}.log", run_stem(started)));
    init_tracing(&log_path)?;

    info!("🚀 Starting dfToken distributor (run {})", run_id);
    debug!("{:?}", settings);

    let summary = run(&cli, &settings, started, run_id, &log_path)
        .await
        .with_context(|| format!("Distribution of {} aborted", cli.input.display()))?;

    if let (Some(summary), true) = (summary, cli.json) {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}

fn print_summary(summary: &RunSummary, sink: &AuditSink, log_path: &Path) {
    info!(
        "🏁 Run {} finished: {} paid, {} failed, {} mismatches, discrepancy {}",
        summary.run_id,
        summary.paid(),
        summary.failed(),
        summary.mismatches(),
        summary.discrepancy()
    );

    println!("Run {}", summary.run_id);
    for vault in &summary.vaults {
        println!(
            "  {}: batches {}/{} ok, paid {}, failed {}, confirmed {}, delta {}, discrepancy {}{}{}",
            vault.vault,
            vault.batches_attempted - vault.batches_failed,
            vault.batches_attempted,
            vault.paid,
            vault.failed,
            vault.total_confirmed,
            vault.total_delta,
            vault.discrepancy,
            vault.dust.map(|d| format!(", dust {}", d)).unwrap_or_default(),
            if vault.split_deviations > 0 {
                format!(", {} split deviation(s)", vault.split_deviations)
            } else {
                String::new()
            }
        );
    }
    println!(
        "Total discrepancy {} over {} mismatch(es), dust kept {}",
        summary.discrepancy(),
        summary.mismatches(),
        summary.dust()
    );
    println!("Audit: {} ({} rows)", sink.path().display(), sink.rows_written());
    println!("Log:   {}", log_path.display());

    let failed = summary.failed_batches();
    if !failed.is_empty() {
        warn!("⚠️ {} batch(es) failed:", failed.len());
        for (vault, batch, reason) in failed {
            warn!("   {} batch {}: {}", vault, batch, reason);
        }
    }
}
