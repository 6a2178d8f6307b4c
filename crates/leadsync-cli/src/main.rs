use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use leadsync_sync::{report_recent_markdown, run_sync_once, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Pause leads whose plan has ended and sync their end dates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass (the default).
    Sync(SyncArgs),
    /// Print the resolved settings with secrets masked.
    CheckConfig,
    /// Summarize recent run reports as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        /// Reports directory; defaults to LEADSYNC_REPORTS_DIR.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Treat this date as today (YYYY-MM-DD).
    #[arg(long)]
    as_of: Option<NaiveDate>,
    /// Apply every update, then roll the transaction back.
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await,
        Commands::CheckConfig => check_config(),
        Commands::Report { runs, dir } => report(runs, dir),
    }
}

async fn sync(args: SyncArgs) -> Result<()> {
    let mut config = SyncConfig::from_env().context("loading settings")?;
    config.dry_run |= args.dry_run;

    let summary = run_sync_once(&config, args.as_of).await?;

    println!("sync complete: run_id={} outcome={}", summary.run_id, summary.outcome);
    println!(
        "transactions fetched: {} (skipped {})",
        summary.fetched_records, summary.skipped_records
    );
    println!("unique identities processed: {}", summary.identities);
    println!("leads updated with end date: {}", summary.updated);
    println!("leads moved to {}: {}", config.pause.to_status, summary.paused);
    if let Some(path) = &summary.report_path {
        println!("report: {}", path.display());
    }
    Ok(())
}

fn check_config() -> Result<()> {
    let config = SyncConfig::from_env().context("loading settings")?;
    for (key, value) in config.describe() {
        println!("{key:<28} {value}");
    }
    Ok(())
}

fn report(runs: usize, dir: Option<PathBuf>) -> Result<()> {
    let root = match dir {
        Some(dir) => dir,
        None => std::env::var("LEADSYNC_REPORTS_DIR")
            .map(PathBuf::from)
            .context("pass --dir or set LEADSYNC_REPORTS_DIR")?,
    };
    println!("{}", report_recent_markdown(&root, runs)?);
    Ok(())
}
