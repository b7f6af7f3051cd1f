//! Source adapter contract and the built-in sources.
//!
//! An adapter knows how to pull one source's raw payload and how to map a raw
//! record onto a canonical [`Event`]. Everything else (dedup, reconciliation,
//! snapshots) happens in the sync pipeline.

pub mod movies;
pub mod nyt;
pub mod wikipedia;
pub mod youtube;

use async_trait::async_trait;
use chrono::NaiveDate;
use dhc_core::{same_mutable_fields, Event, LabelId, RecordMappingError};
use dhc_storage::{DayReport, FetchError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use movies::MoviesAdapter;
pub use nyt::NytAdapter;
pub use wikipedia::WikipediaAdapter;
pub use youtube::{MediaLinks, YouTubeLookup};

pub const CRATE_NAME: &str = "dhc-adapters";

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Day the run is collecting for.
    pub today: NaiveDate,
    /// Most recent snapshot of this source, when the adapter asked for it.
    pub previous_snapshot: Option<JsonValue>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, today: NaiveDate) -> Self {
        Self {
            run_id,
            today,
            previous_snapshot: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// What the pipeline writes to the object store for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotContent {
    /// The deduplicated raw records.
    Raw,
    /// The canonical events.
    Canonical,
}

/// Raw output of one source fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    /// Date the snapshot of this run is filed under.
    pub target_date: NaiveDate,
    pub records: Vec<JsonValue>,
    /// Per-day pagination reports, for paginated sources.
    pub fetch_reports: Vec<DayReport>,
    /// Rows a raw snapshot keeps instead of `records`, for sources that
    /// reconcile only part of what they fetched.
    pub raw_snapshot: Option<Vec<JsonValue>>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Label the events of this source are filed under.
    fn label_name(&self) -> &'static str;

    fn uses_previous_snapshot(&self) -> bool {
        false
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<SourceBatch, AdapterError>;

    /// Key two raw records share when they describe the same story.
    fn dedupe_key(&self, record: &JsonValue) -> String {
        record.to_string()
    }

    async fn canonicalize(
        &self,
        ctx: &AdapterContext,
        record: &JsonValue,
        label_id: LabelId,
    ) -> Result<Event, RecordMappingError>;

    /// Whether an already stored event is up to date with a fetched one.
    fn already_same(&self, existing: &Event, fetched: &Event) -> bool {
        same_mutable_fields(existing, fetched)
    }

    fn snapshot_content(&self) -> SnapshotContent {
        SnapshotContent::Raw
    }
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

pub(crate) fn required_str<'a>(
    value: &'a JsonValue,
    key: &'static str,
) -> Result<&'a str, RecordMappingError> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .ok_or(RecordMappingError::MissingField(key))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    pub fn fixture(rel: &str) -> String {
        let path = workspace_root().join("fixtures").join(rel);
        std::fs::read_to_string(&path)
            .unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_paths_resolve_nested_strings_only() {
        let value = json!({ "headline": { "main": "Hello", "n": 3 } });
        assert_eq!(json_str(&value, &["headline", "main"]), Some("Hello"));
        assert_eq!(json_str(&value, &["headline", "n"]), None);
        assert_eq!(json_str(&value, &["missing", "main"]), None);
        assert_eq!(
            required_str(&value, "snippet"),
            Err(RecordMappingError::MissingField("snippet"))
        );
    }
}
