//! Ingestion engine: label registry, dedup, reconciliation and the per-source
//! pipeline that drives them, plus the configuration and scheduling around it.

pub mod config;
pub mod dedupe;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod sources;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use dhc_storage::postgres::redact_database_url;
use dhc_storage::{BlobStore, EventStore, FsBlobStore, MemoryEventStore, PgEventStore};
use tracing::info;

pub use config::CollectorConfig;
pub use dedupe::dedupe;
pub use pipeline::{IngestionPipeline, SourceJob, SourceRunSummary};
pub use reconcile::{reconcile, ReconcileError};
pub use registry::{LabelRegistry, LabelResolutionError};
pub use scheduler::{maybe_build_scheduler, run_scheduled};
pub use sources::{build_jobs, load_source_registry, FetchOverrides, SourceConfig, SourceRegistry};

pub const CRATE_NAME: &str = "dhc-sync";

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Restrict the run to these source ids; empty runs every enabled source.
    pub sources: Vec<String>,
    /// Reconcile against an in-memory store and write no snapshots.
    pub dry_run: bool,
    /// Collection day; today's local date when unset.
    pub today: Option<NaiveDate>,
}

/// One full collection run over the configured sources.
pub async fn run_sync(config: &CollectorConfig, options: &SyncOptions) -> Result<Vec<SourceRunSummary>> {
    let registry = load_source_registry(&config.workspace_root).await?;
    let jobs = build_jobs(config, &registry, &options.sources)?;

    let store: Arc<dyn EventStore> = if options.dry_run {
        info!("dry run: reconciling against an in-memory store");
        Arc::new(MemoryEventStore::new())
    } else {
        let store = PgEventStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", redact_database_url(&config.database_url)))?;
        Arc::new(store)
    };
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.blob_dir.clone()));
    let pipeline = IngestionPipeline::new(store, blobs).with_snapshots(!options.dry_run);

    let today = options.today.unwrap_or_else(|| Local::now().date_naive());
    Ok(pipeline.run_all(&jobs, today).await)
}
