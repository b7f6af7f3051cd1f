use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dhc_adapters::nyt;
use dhc_adapters::{AdapterContext, AdapterError, SourceAdapter, SourceBatch};
use dhc_core::{Event, LabelId, RecordMappingError};
use dhc_storage::{FsBlobStore, MemoryEventStore};
use dhc_sync::{IngestionPipeline, SourceJob};
use serde_json::Value as JsonValue;

/// Article search mapping, served from a recorded page instead of the API.
struct RecordedArticleSearch {
    body: JsonValue,
}

impl RecordedArticleSearch {
    fn load() -> Self {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures/nyt/articlesearch_page.json");
        let text = std::fs::read_to_string(&path).unwrap();
        Self {
            body: serde_json::from_str(&text).unwrap(),
        }
    }
}

#[async_trait]
impl SourceAdapter for RecordedArticleSearch {
    fn source_id(&self) -> &'static str {
        nyt::SOURCE_ID
    }

    fn label_name(&self) -> &'static str {
        nyt::LABEL_NAME
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        let page = nyt::parse_search_response(&self.body)
            .map_err(|err| AdapterError::Message(err.to_string()))?;
        Ok(SourceBatch {
            target_date: ctx.today,
            records: page.items,
            fetch_reports: Vec::new(),
            raw_snapshot: None,
        })
    }

    fn dedupe_key(&self, record: &JsonValue) -> String {
        nyt::headline(record).unwrap_or_default().to_string()
    }

    async fn canonicalize(
        &self,
        _ctx: &AdapterContext,
        record: &JsonValue,
        label_id: LabelId,
    ) -> Result<Event, RecordMappingError> {
        nyt::map_doc(record, label_id)
    }
}

#[tokio::test]
async fn recorded_page_is_ingested_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = IngestionPipeline::new(store.clone(), Arc::new(FsBlobStore::new(dir.path())));
    let job = SourceJob::new(Box::new(RecordedArticleSearch::load()));
    let today = NaiveDate::from_ymd_opt(2018, 6, 15).unwrap();

    let first = pipeline.run_source(&job, today).await;
    assert!(first.is_success(), "{:?}", first.error);
    assert_eq!(first.fetched, 4);
    assert_eq!(first.duplicates_dropped, 1);
    assert_eq!(first.outcome.inserted, 3);
    assert_eq!(
        first.snapshot.as_deref(),
        Some("New-York-Times/2018-06-15.json")
    );

    let events = store.events().await;
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .all(|e| e.image_link.starts_with("https://www.nytimes.com/images/2018/06/15/")));

    let second = pipeline.run_source(&job, today).await;
    assert_eq!(second.outcome.unchanged, 3);
    assert_eq!(second.outcome.inserted + second.outcome.updated, 0);
    assert_eq!(store.labels().await.len(), 1);
}
