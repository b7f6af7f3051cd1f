use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use dhc_adapters::{AdapterContext, SnapshotContent, SourceAdapter};
use dhc_core::{Event, ReconciliationOutcome};
use dhc_storage::{latest_json, put_json, snapshot_key, BlobStore, DayReport, EventStore};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedupe::dedupe;
use crate::reconcile::reconcile;
use crate::registry::LabelRegistry;

/// An adapter together with the label its events are filed under.
pub struct SourceJob {
    pub adapter: Box<dyn SourceAdapter>,
    pub label: String,
}

impl SourceJob {
    pub fn new(adapter: Box<dyn SourceAdapter>) -> Self {
        let label = adapter.label_name().to_string();
        Self { adapter, label }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub label: String,
    pub target_date: Option<NaiveDate>,
    /// Raw records returned by the fetch.
    pub fetched: usize,
    pub duplicates_dropped: usize,
    pub mapping_errors: usize,
    pub outcome: ReconciliationOutcome,
    pub snapshot: Option<String>,
    pub fetch_days: Vec<DayReport>,
    pub error: Option<String>,
}

impl SourceRunSummary {
    fn new(run_id: Uuid, job: &SourceJob) -> Self {
        Self {
            run_id,
            source_id: job.adapter.source_id().to_string(),
            label: job.label.clone(),
            target_date: None,
            fetched: 0,
            duplicates_dropped: 0,
            mapping_errors: 0,
            outcome: ReconciliationOutcome::default(),
            snapshot: None,
            fetch_days: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct IngestionPipeline {
    store: Arc<dyn EventStore>,
    blobs: Arc<dyn BlobStore>,
    registry: LabelRegistry,
    write_snapshots: bool,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn EventStore>, blobs: Arc<dyn BlobStore>) -> Self {
        let registry = LabelRegistry::new(store.clone());
        Self {
            store,
            blobs,
            registry,
            write_snapshots: true,
        }
    }

    pub fn with_snapshots(mut self, write_snapshots: bool) -> Self {
        self.write_snapshots = write_snapshots;
        self
    }

    /// Sources run one after the other; a failing source does not stop the rest.
    pub async fn run_all(&self, jobs: &[SourceJob], today: NaiveDate) -> Vec<SourceRunSummary> {
        let mut summaries = Vec::with_capacity(jobs.len());
        for job in jobs {
            summaries.push(self.run_source(job, today).await);
        }
        summaries
    }

    pub async fn run_source(&self, job: &SourceJob, today: NaiveDate) -> SourceRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "source_run",
            source = job.adapter.source_id(),
            label = %job.label,
            %run_id,
            %today
        );
        let mut summary = SourceRunSummary::new(run_id, job);
        if let Err(err) = self.drive(job, today, &mut summary).instrument(span.clone()).await {
            let err = format!("{err:#}");
            span.in_scope(|| warn!(error = %err, "source run ended early"));
            summary.error = Some(err);
        }
        let outcome = summary.outcome;
        span.in_scope(|| {
            info!(
                total = outcome.total(),
                inserted = outcome.inserted,
                updated = outcome.updated,
                unchanged = outcome.unchanged,
                skipped = outcome.skipped,
                mapping_errors = summary.mapping_errors,
                "source run finished"
            )
        });
        summary
    }

    async fn drive(
        &self,
        job: &SourceJob,
        today: NaiveDate,
        summary: &mut SourceRunSummary,
    ) -> anyhow::Result<()> {
        let adapter = job.adapter.as_ref();
        let label_id = self.registry.resolve(&job.label).await?;

        let mut ctx = AdapterContext::new(summary.run_id, today);
        if adapter.uses_previous_snapshot() {
            ctx.previous_snapshot = self.previous_snapshot(&job.label).await;
        }

        let batch = adapter.fetch(&ctx).await.context("fetch failed")?;
        summary.target_date = Some(batch.target_date);
        summary.fetch_days = batch.fetch_reports;
        summary.fetched = batch.records.len();

        let records = dedupe(batch.records, |record| adapter.dedupe_key(record));
        summary.duplicates_dropped = summary.fetched - records.len();

        let mut events = Vec::with_capacity(records.len());
        for record in &records {
            match adapter.canonicalize(&ctx, record, label_id).await {
                Ok(event) => events.push(event),
                Err(err) => {
                    summary.mapping_errors += 1;
                    warn!(record = %adapter.dedupe_key(record), error = %err, "record skipped");
                }
            }
        }

        if events.is_empty() {
            info!("no data available for this run");
            return Ok(());
        }

        let equal = |existing: &Event, fetched: &Event| adapter.already_same(existing, fetched);
        match reconcile(self.store.as_ref(), &events, label_id, &equal).await {
            Ok(outcome) => summary.outcome = outcome,
            Err(err) => {
                summary.outcome = err.outcome;
                return Err(err.into());
            }
        }

        if self.write_snapshots {
            let key = snapshot_key(&job.label, batch.target_date);
            let stored = match (adapter.snapshot_content(), &batch.raw_snapshot) {
                (SnapshotContent::Raw, Some(rows)) => put_json(self.blobs.as_ref(), &key, rows).await,
                (SnapshotContent::Raw, None) => put_json(self.blobs.as_ref(), &key, &records).await,
                (SnapshotContent::Canonical, _) => put_json(self.blobs.as_ref(), &key, &events).await,
            }
            .with_context(|| format!("writing snapshot {key}"))?;
            info!(key = %stored.key, bytes = stored.byte_size, unchanged = stored.unchanged, "snapshot written");
            summary.snapshot = Some(stored.key);
        }
        Ok(())
    }

    async fn previous_snapshot(&self, label: &str) -> Option<JsonValue> {
        match latest_json(self.blobs.as_ref(), &format!("{label}/")).await {
            Ok(Some((key, value))) => {
                info!(%key, "previous snapshot loaded");
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "previous snapshot unreadable; continuing without it");
                None
            }
        }
    }
}
