use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dhc_storage::PgEventStore;
use dhc_sync::{CollectorConfig, SourceRunSummary, SyncOptions};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dhc")]
#[command(about = "Daily highlights collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect every enabled source once.
    Sync {
        /// Only run these source ids (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Reconcile against an in-memory store and write no snapshots.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply the database migrations.
    Migrate,
    /// Run syncs on the configured cron schedule until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dhc=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_summary(summary: &SourceRunSummary) {
    let outcome = &summary.outcome;
    let date = summary
        .target_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{label} {date}: fetched={} duplicates={} mapping_errors={} inserted={} updated={} unchanged={} skipped={} snapshot={}",
        summary.fetched,
        summary.duplicates_dropped,
        summary.mapping_errors,
        outcome.inserted,
        outcome.updated,
        outcome.unchanged,
        outcome.skipped,
        summary.snapshot.as_deref().unwrap_or("-"),
        label = summary.label,
    );
    for day in &summary.fetch_days {
        println!(
            "  {}: pages={}/{} {:?}",
            day.day,
            day.pages_fetched,
            day.total_pages.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            day.termination
        );
    }
    if let Some(err) = &summary.error {
        println!("  error: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = CollectorConfig::from_env();
    tracing::debug!(?config, "configuration loaded");

    match cli.command.unwrap_or(Commands::Sync {
        sources: Vec::new(),
        dry_run: false,
    }) {
        Commands::Sync { sources, dry_run } => {
            let options = SyncOptions {
                sources,
                dry_run,
                today: None,
            };
            let summaries = dhc_sync::run_sync(&config, &options).await?;
            for summary in &summaries {
                print_summary(summary);
            }
            let failed = summaries.iter().filter(|s| !s.is_success()).count();
            println!("sync complete: sources={} failed={failed}", summaries.len());
        }
        Commands::Migrate => {
            let store = PgEventStore::connect(&config.database_url)
                .await
                .context("connecting to the event store")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            if !dhc_sync::run_scheduled(&config, SyncOptions::default()).await? {
                eprintln!("scheduler disabled; set DHC_SCHEDULER_ENABLED=1 to enable it");
            }
        }
    }

    Ok(())
}
