//! New York Times article search: front-page articles of the last few days.

use std::sync::OnceLock;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use dhc_core::{parse_timestamp, Event, LabelId, RecordMappingError};
use dhc_storage::{
    BackoffPolicy, CredentialPool, FetchError, FetchPolicy, HttpClientConfig, HttpFetcher,
    PageBody, PageClient, PageError, PageRequest, ResilientPaginatedFetcher,
};
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use crate::{json_str, required_str, AdapterContext, AdapterError, SourceAdapter, SourceBatch};

pub const SOURCE_ID: &str = "nyt";
pub const LABEL_NAME: &str = "New-York-Times";
pub const ARTICLE_SEARCH_ENDPOINT: &str = "https://api.nytimes.com/svc/search/v2/articlesearch.json";
const IMAGE_HOST: &str = "https://www.nytimes.com/";
const FILTERED_TITLES: &[&str] = &["-- No Title$"];

fn filtered_titles() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        FILTERED_TITLES
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// `YYYYMMDD`, the date format of the search API.
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Turn an article search response into a page, or a rejection when the
/// envelope is missing (rate-limit and auth faults come back that way).
pub fn parse_search_response(body: &JsonValue) -> Result<PageBody, PageError> {
    let Some(response) = body.get("response") else {
        let reason = json_str(body, &["fault", "faultstring"])
            .or_else(|| json_str(body, &["message"]))
            .unwrap_or("response envelope missing");
        return Err(PageError::Rejected(reason.to_string()));
    };
    let hits = response
        .get("meta")
        .and_then(|m| m.get("hits"))
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| PageError::Rejected("meta.hits missing".into()))?;
    let docs = response
        .get("docs")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(PageBody {
        total_hits: hits,
        items: docs,
    })
}

struct ArticleSearchClient<'a> {
    http: &'a HttpFetcher,
    endpoint: &'a str,
    run_id: Uuid,
}

#[async_trait]
impl PageClient for ArticleSearchClient<'_> {
    async fn request_page(&self, request: PageRequest<'_>) -> Result<PageBody, PageError> {
        let end = request
            .day
            .checked_add_days(Days::new(1))
            .ok_or_else(|| anyhow!("date overflow after {}", request.day))?;
        let query = [
            ("api-key", request.credential.to_string()),
            ("begin_date", compact_date(request.day)),
            ("end_date", compact_date(end)),
            ("page", request.page.to_string()),
            ("fq", "print_page:1".to_string()),
        ];
        let response = match self
            .http
            .fetch_with_query(self.run_id, SOURCE_ID, self.endpoint, &query)
            .await
        {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status, .. }) if matches!(status, 401 | 403 | 429) => {
                return Err(PageError::Rejected(format!("http status {status}")));
            }
            Err(err) => return Err(PageError::Unexpected(err.into())),
        };
        let body = response
            .json()
            .map_err(|err| PageError::Unexpected(anyhow!("decoding article search page: {err}")))?;
        parse_search_response(&body)
    }
}

pub struct NytAdapter {
    http: HttpFetcher,
    endpoint: String,
    credentials: CredentialPool,
    policy: FetchPolicy,
    lookback_days: u64,
}

impl NytAdapter {
    /// The fetch loop owns retrying, so the HTTP layer underneath does not retry.
    pub fn new(
        http: HttpClientConfig,
        credentials: CredentialPool,
        policy: FetchPolicy,
        lookback_days: u64,
    ) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            ..http
        })?;
        Ok(Self {
            http,
            endpoint: ARTICLE_SEARCH_ENDPOINT.to_string(),
            credentials,
            policy,
            lookback_days,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn window(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = today
            .checked_sub_days(Days::new(self.lookback_days))
            .unwrap_or(today);
        (start, today)
    }
}

/// Print headline when present, the main headline otherwise.
pub fn headline(doc: &JsonValue) -> Option<&str> {
    json_str(doc, &["headline", "print_headline"])
        .filter(|t| !t.trim().is_empty())
        .or_else(|| json_str(doc, &["headline", "main"]))
}

pub fn title_from_doc(doc: &JsonValue) -> Result<String, RecordMappingError> {
    let title = headline(doc)
        .ok_or(RecordMappingError::MissingField("headline"))?
        .trim();
    if title.is_empty() {
        return Err(RecordMappingError::Filtered("empty title".into()));
    }
    if filtered_titles().iter().any(|re| re.is_match(title)) {
        return Err(RecordMappingError::Filtered(title.to_string()));
    }
    Ok(title.to_string())
}

fn thumbnail_link(doc: &JsonValue) -> Result<String, RecordMappingError> {
    let url = doc
        .get("multimedia")
        .and_then(JsonValue::as_array)
        .and_then(|items| {
            items
                .iter()
                .find(|m| m.get("subtype").and_then(JsonValue::as_str) == Some("thumbnail"))
        })
        .and_then(|m| m.get("url"))
        .and_then(JsonValue::as_str)
        .ok_or(RecordMappingError::MissingField("multimedia.thumbnail"))?;
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.to_string())
    } else {
        Ok(format!("{IMAGE_HOST}{}", url.trim_start_matches('/')))
    }
}

pub fn map_doc(doc: &JsonValue, label_id: LabelId) -> Result<Event, RecordMappingError> {
    let title = title_from_doc(doc)?;
    Ok(Event {
        timestamp: parse_timestamp(required_str(doc, "pub_date")?)?,
        title,
        text: required_str(doc, "snippet")?.to_string(),
        link: required_str(doc, "web_url")?.to_string(),
        label_id,
        image_link: thumbnail_link(doc)?,
        media_link: String::new(),
    })
}

#[async_trait]
impl SourceAdapter for NytAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn label_name(&self) -> &'static str {
        LABEL_NAME
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        let (start, end) = self.window(ctx.today);
        let client = ArticleSearchClient {
            http: &self.http,
            endpoint: &self.endpoint,
            run_id: ctx.run_id,
        };
        let fetcher =
            ResilientPaginatedFetcher::new(client, self.credentials.clone(), self.policy.clone());
        let fetched = fetcher.fetch_window(start, end).await;
        let reports = fetched.reports.clone();
        let records = fetched.into_items();
        info!(%start, %end, docs = records.len(), "article search window fetched");
        Ok(SourceBatch {
            target_date: start,
            records,
            fetch_reports: reports,
            raw_snapshot: None,
        })
    }

    fn dedupe_key(&self, record: &JsonValue) -> String {
        headline(record)
            .or_else(|| json_str(record, &["web_url"]))
            .map(str::to_string)
            .unwrap_or_else(|| record.to_string())
    }

    async fn canonicalize(
        &self,
        _ctx: &AdapterContext,
        record: &JsonValue,
        label_id: LabelId,
    ) -> Result<Event, RecordMappingError> {
        map_doc(record, label_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;
    use serde_json::json;

    fn doc(print: Option<&str>, main: &str) -> JsonValue {
        let mut headline = json!({ "main": main });
        if let Some(print) = print {
            headline["print_headline"] = json!(print);
        }
        json!({
            "headline": headline,
            "pub_date": "2018-06-15T04:00:00+0000",
            "snippet": "Snippet.",
            "web_url": "https://www.nytimes.com/2018/06/15/a.html",
            "multimedia": [
                { "subtype": "xlarge", "url": "images/x.jpg" },
                { "subtype": "thumbnail", "url": "images/t.jpg" }
            ]
        })
    }

    #[test]
    fn fixture_page_parses_hits_and_docs() {
        let body: JsonValue = serde_json::from_str(&fixture("nyt/articlesearch_page.json")).unwrap();
        let page = parse_search_response(&body).unwrap();
        assert_eq!(page.total_hits, 25);
        assert_eq!(page.items.len(), 4);
    }

    #[test]
    fn fault_payloads_are_rejections() {
        let fault = json!({ "fault": { "faultstring": "Rate limit quota violation" } });
        assert!(matches!(
            parse_search_response(&fault),
            Err(PageError::Rejected(reason)) if reason.contains("quota")
        ));
        let no_meta = json!({ "response": { "docs": [] } });
        assert!(matches!(parse_search_response(&no_meta), Err(PageError::Rejected(_))));
    }

    #[test]
    fn docs_map_onto_events() {
        let event = map_doc(&doc(Some("Print Title"), "Main Title"), LabelId(3)).unwrap();
        assert_eq!(event.title, "Print Title");
        assert_eq!(event.timestamp.to_string(), "2018-06-15 04:00:00");
        assert_eq!(event.image_link, "https://www.nytimes.com/images/t.jpg");
        assert_eq!(event.media_link, "");
        assert_eq!(event.label_id, LabelId(3));

        let fallback = map_doc(&doc(None, "Main Title"), LabelId(3)).unwrap();
        assert_eq!(fallback.title, "Main Title");
    }

    #[test]
    fn placeholder_titles_are_filtered() {
        assert!(matches!(
            map_doc(&doc(Some("Corrections -- No Title"), "x"), LabelId(1)),
            Err(RecordMappingError::Filtered(_))
        ));
        assert!(matches!(
            map_doc(&doc(None, "  "), LabelId(1)),
            Err(RecordMappingError::Filtered(_))
        ));
    }

    #[test]
    fn docs_without_a_thumbnail_are_mapping_errors() {
        let mut d = doc(Some("T"), "T");
        d["multimedia"] = json!([]);
        assert_eq!(
            map_doc(&d, LabelId(1)),
            Err(RecordMappingError::MissingField("multimedia.thumbnail"))
        );
    }

    #[test]
    fn the_window_reaches_back_lookback_days() {
        let adapter = NytAdapter::new(
            HttpClientConfig::default(),
            CredentialPool::from_delimited("k").unwrap(),
            FetchPolicy::default(),
            2,
        )
        .unwrap();
        let today = NaiveDate::from_ymd_opt(2018, 6, 15).unwrap();
        let (start, end) = adapter.window(today);
        assert_eq!(start, NaiveDate::from_ymd_opt(2018, 6, 13).unwrap());
        assert_eq!(end, today);
        assert_eq!(compact_date(start), "20180613");
    }

    #[test]
    fn dedupe_key_prefers_the_print_headline() {
        let adapter = NytAdapter::new(
            HttpClientConfig::default(),
            CredentialPool::from_delimited("k").unwrap(),
            FetchPolicy::default(),
            2,
        )
        .unwrap();
        assert_eq!(adapter.dedupe_key(&doc(Some("P"), "M")), "P");
        assert_eq!(adapter.dedupe_key(&doc(None, "M")), "M");
    }
}
