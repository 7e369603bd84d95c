use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use burghfeed_adapters::BatchIngestor;
use burghfeed_core::{Period, TableKind, TableProfile};
use burghfeed_sync::{build_scheduler, PipelineConfig, RunOptions, RunSummary, SyncPipeline, TableStatus};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "burghfeed")]
#[command(about = "Normalize BigBurgh feed extracts and publish them to the open-data datastore")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest, archive and publish every table once.
    Sync(SyncArgs),
    /// Run the sync on the configured cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        env: Option<String>,
    },
    /// Ingest and normalize one extract without publishing.
    Validate { table: TableKind, path: PathBuf },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Download extracts from the configured source URLs.
    #[arg(long)]
    fetch: bool,
    /// Target environment from burghfeed.yaml.
    #[arg(long)]
    env: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    safe_places: Option<PathBuf>,
    #[arg(long)]
    services: Option<PathBuf>,
    /// Archive period as YYYYMM; defaults to the current month.
    #[arg(long)]
    period: Option<Period>,
}

impl SyncArgs {
    fn run_options(&self) -> RunOptions {
        let local_paths = [
            (TableKind::Events, &self.events),
            (TableKind::SafePlaces, &self.safe_places),
            (TableKind::Services, &self.services),
        ]
        .into_iter()
        .filter_map(|(kind, path)| path.clone().map(|p| (kind, p)))
        .collect::<BTreeMap<_, _>>();
        RunOptions {
            fetch_remote: self.fetch,
            local_paths,
            tables: Vec::new(),
            period: self.period,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let config = PipelineConfig::from_env()?;
            let pipeline = SyncPipeline::from_config(config, args.env.as_deref())?;
            let summary = pipeline.run_once(&args.run_options()).await?;
            print_summary(&summary);
            let failed = summary.failed_tables();
            if !failed.is_empty() {
                bail!(
                    "{} of {} tables failed: {}",
                    failed.len(),
                    summary.tables.len(),
                    failed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                );
            }
        }
        Commands::Schedule { env } => {
            let config = PipelineConfig::from_env()?;
            let cron = config.schedule_cron.clone();
            let pipeline = Arc::new(SyncPipeline::from_config(config, env.as_deref())?);
            let options = RunOptions {
                fetch_remote: true,
                ..Default::default()
            };
            let mut sched = build_scheduler(pipeline, options).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Validate { table, path } => {
            let config = PipelineConfig::from_env()?;
            let report = BatchIngestor::new(TableProfile::for_kind(table), config.malformed_rows).ingest_path(&path)?;
            println!(
                "{table}: {} records, {} quarantined, {} rejected",
                report.records.len(),
                report.quarantined.len(),
                report.rejected.len()
            );
            for row in report.quarantined.iter().chain(&report.rejected) {
                println!("  line {}: {}", row.line, row.reason);
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("sync run {} for period {}", summary.run_id, summary.period);
    for outcome in &summary.tables {
        match outcome.status {
            TableStatus::Succeeded => println!(
                "  {}: ok, {} records, archived={}",
                outcome.table,
                outcome.records,
                outcome.archive.as_ref().is_some_and(|d| d.should_archive)
            ),
            TableStatus::Skipped => println!("  {}: skipped, no extract", outcome.table),
            TableStatus::Failed => println!(
                "  {}: FAILED: {}",
                outcome.table,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    for alert in &summary.alerts {
        println!("  alert: {}", alert.message);
    }
    println!("report: {}", summary.report_path.display());
}
