//! Box-office chart: the number one movie of the current week.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use dhc_core::{parse_timestamp, Event, LabelId, RecordMappingError};
use dhc_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Map, Value as JsonValue};
use tracing::info;
use uuid::Uuid;

use crate::youtube::{VideoFilter, YouTubeLookup};
use crate::{required_str, AdapterContext, AdapterError, SourceAdapter, SourceBatch};

pub const SOURCE_ID: &str = "movies";
pub const LABEL_NAME: &str = "Movies";
pub const CHART_BASE_URL: &str = "https://www.the-numbers.com/box-office-chart/";
const IMDB_SEARCH_PREFIX: &str = "https://www.imdb.com/find?q=";
const CHART_COLUMNS: [&str; 10] = [
    "current_week_rank",
    "previous_week_rank",
    "movie",
    "distributor",
    "gross",
    "change",
    "num_theaters",
    "per_theater",
    "total_gross",
    "days",
];
const TRAILER: VideoFilter = VideoFilter {
    title_contains: Some("Trailer"),
    thumbnail: "high",
};

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector {css}: {e}")))
}

/// Rows of the chart table keyed by column name; the heading row is skipped.
pub fn parse_chart(html: &str) -> Result<Vec<Map<String, JsonValue>>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector("#page_filling_chart table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Ok(Vec::new());
    };
    let rows = table
        .select(&row_sel)
        .skip(1)
        .map(|row| {
            row.select(&cell_sel)
                .zip(CHART_COLUMNS)
                .map(|(cell, key)| {
                    let text = cell.text().collect::<String>().trim().to_string();
                    (key.to_string(), JsonValue::String(text))
                })
                .collect::<Map<_, _>>()
        })
        .filter(|row| !row.is_empty())
        .collect();
    Ok(rows)
}

/// Search-friendly form of a title: non-word characters become `+`.
pub fn search_query(title: &str) -> String {
    static NON_WORD: OnceLock<Option<Regex>> = OnceLock::new();
    let cleaned = match NON_WORD.get_or_init(|| Regex::new(r"[^\w]").ok()) {
        Some(re) => re.replace_all(title, " ").into_owned(),
        None => title.to_string(),
    };
    cleaned.replace(' ', "+")
}

fn clean_title(raw: &str) -> String {
    raw.replace("â€™", "'").trim().to_string()
}

pub struct MoviesAdapter {
    http: Arc<HttpFetcher>,
    youtube: YouTubeLookup,
    base_url: String,
}

impl MoviesAdapter {
    pub fn new(http: Arc<HttpFetcher>, youtube: YouTubeLookup) -> Self {
        Self {
            http,
            youtube,
            base_url: CHART_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn chart_url(&self, kind: &str, date: NaiveDate) -> String {
        format!(
            "{}{kind}/{}/{}/{}",
            self.base_url,
            date.year(),
            date.month(),
            date.day()
        )
    }

    async fn fetch_chart(
        &self,
        run_id: Uuid,
        kind: &str,
        date: NaiveDate,
    ) -> Result<Vec<Map<String, JsonValue>>, AdapterError> {
        let url = self.chart_url(kind, date);
        match self.http.fetch_bytes(run_id, SOURCE_ID, &url).await {
            Ok(resp) => parse_chart(&resp.text()),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Only the top row is reconciled; the snapshot keeps the whole chart.
fn chart_batch(chart: Vec<Map<String, JsonValue>>, date: NaiveDate) -> SourceBatch {
    let rows: Vec<JsonValue> = chart
        .into_iter()
        .map(|mut row| {
            row.insert(
                "chart_date".into(),
                JsonValue::String(date.format("%Y-%m-%d").to_string()),
            );
            JsonValue::Object(row)
        })
        .collect();
    SourceBatch {
        target_date: date,
        records: rows.iter().take(1).cloned().collect(),
        fetch_reports: Vec::new(),
        raw_snapshot: (!rows.is_empty()).then_some(rows),
    }
}

#[async_trait]
impl SourceAdapter for MoviesAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn label_name(&self) -> &'static str {
        LABEL_NAME
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        let mut chart = self.fetch_chart(ctx.run_id, "weekly", ctx.today).await?;
        if chart.is_empty() {
            chart = self.fetch_chart(ctx.run_id, "weekend", ctx.today).await?;
        }
        info!(date = %ctx.today, rows = chart.len(), "box-office chart fetched");
        Ok(chart_batch(chart, ctx.today))
    }

    fn dedupe_key(&self, record: &JsonValue) -> String {
        record
            .get("movie")
            .and_then(JsonValue::as_str)
            .map(clean_title)
            .unwrap_or_else(|| record.to_string())
    }

    async fn canonicalize(
        &self,
        ctx: &AdapterContext,
        record: &JsonValue,
        label_id: LabelId,
    ) -> Result<Event, RecordMappingError> {
        let title = clean_title(required_str(record, "movie")?);
        if title.is_empty() {
            return Err(RecordMappingError::Filtered("empty movie title".into()));
        }
        let total_gross = required_str(record, "total_gross")?;
        let timestamp = parse_timestamp(required_str(record, "chart_date")?)?;
        let media = self
            .youtube
            .lookup(
                ctx.run_id,
                &search_query(&format!("{title} official movie trailer")),
                TRAILER,
            )
            .await;
        Ok(Event {
            timestamp,
            title: format!("#1 Movie: {title}"),
            text: format!("{title} grossed a total of {total_gross}."),
            link: format!("{IMDB_SEARCH_PREFIX}{}", search_query(&title)),
            label_id,
            image_link: media.image_link,
            media_link: media.media_link,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;
    use dhc_storage::HttpClientConfig;
    use serde_json::json;

    fn adapter() -> MoviesAdapter {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        MoviesAdapter::new(http.clone(), YouTubeLookup::new(http, None))
    }

    #[test]
    fn chart_rows_are_keyed_by_column() {
        let rows = parse_chart(&fixture("movies/weekly_chart.html")).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["current_week_rank"], "1");
        assert_eq!(rows[0]["movie"], "Incredibles 2");
        assert_eq!(rows[0]["total_gross"], "$182,687,905");
        assert_eq!(rows[2]["movie"], "Tag");
    }

    #[test]
    fn pages_without_a_chart_yield_no_rows() {
        let rows = parse_chart("<html><body><p>No chart</p></body></html>").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn search_queries_replace_punctuation() {
        assert_eq!(search_query("Ocean's 8"), "Ocean+s+8");
        assert_eq!(search_query("Solo: A Star Wars Story"), "Solo++A+Star+Wars+Story");
    }

    #[test]
    fn chart_urls_use_unpadded_dates() {
        let date = NaiveDate::from_ymd_opt(2018, 6, 5).unwrap();
        assert_eq!(
            adapter().chart_url("weekly", date),
            "https://www.the-numbers.com/box-office-chart/weekly/2018/6/5"
        );
    }

    #[tokio::test]
    async fn the_top_row_becomes_a_number_one_event() {
        let ctx = AdapterContext::new(Uuid::nil(), NaiveDate::from_ymd_opt(2018, 6, 15).unwrap());
        let record = json!({
            "movie": "Ocean’s 8",
            "total_gross": "$41,607,378",
            "chart_date": "2018-06-15"
        });
        let event = adapter()
            .canonicalize(&ctx, &record, LabelId(2))
            .await
            .unwrap();
        assert_eq!(event.title, "#1 Movie: Ocean’s 8");
        assert_eq!(event.text, "Ocean’s 8 grossed a total of $41,607,378.");
        assert_eq!(event.link, "https://www.imdb.com/find?q=Ocean+s+8");
        assert_eq!(event.timestamp.to_string(), "2018-06-15 00:00:00");
        assert_eq!(event.media_link, "");
    }

    #[test]
    fn the_chart_is_snapshotted_whole_but_only_the_top_row_is_reconciled() {
        let rows = parse_chart(&fixture("movies/weekly_chart.html")).unwrap();
        let batch = chart_batch(rows, NaiveDate::from_ymd_opt(2018, 6, 15).unwrap());
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0]["movie"], "Incredibles 2");
        assert_eq!(batch.records[0]["chart_date"], "2018-06-15");
        let snapshot = batch.raw_snapshot.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|row| row["chart_date"] == "2018-06-15"));
        assert_eq!(snapshot[2]["movie"], "Tag");
    }

    #[test]
    fn an_empty_chart_has_no_snapshot() {
        let batch = chart_batch(Vec::new(), NaiveDate::from_ymd_opt(2018, 6, 15).unwrap());
        assert!(batch.records.is_empty());
        assert!(batch.raw_snapshot.is_none());
    }

    #[test]
    fn a_new_trailer_is_an_update() {
        let a = Event {
            timestamp: dhc_core::midnight(NaiveDate::from_ymd_opt(2018, 6, 15).unwrap()),
            title: "#1 Movie: Tag".into(),
            text: "t".into(),
            link: "l".into(),
            label_id: LabelId(2),
            image_link: "i".into(),
            media_link: "m1".into(),
        };
        let mut b = a.clone();
        b.media_link = "m2".into();
        assert!(!adapter().already_same(&a, &b));
    }
}
