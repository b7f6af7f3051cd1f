//! "On this day" events and births from the encyclopedia's day pages.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use dhc_core::{parse_timestamp, Event, LabelId, RecordMappingError};
use dhc_storage::HttpFetcher;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    required_str, AdapterContext, AdapterError, SnapshotContent, SourceAdapter, SourceBatch,
};

pub const SOURCE_ID: &str = "wikipedia";
pub const LABEL_NAME: &str = "Wikipedia";
pub const WIKI_BASE_URL: &str = "https://en.wikipedia.org";
const BIRTH_SUFFIX: &str = " was born on this day.";
/// Entries after this year get an image from their first linked article.
const IMAGE_YEAR_THRESHOLD: i32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Events,
    Births,
}

/// One list item of a day page, already shaped like a canonical event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayEntry {
    pub date: String,
    pub title: String,
    pub text: String,
    pub link: String,
    pub image_link: String,
    pub media_link: String,
    #[serde(skip)]
    pub year: i32,
    #[serde(skip)]
    pub article_paths: Vec<String>,
}

fn dash_splitter() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new("-|–|－").ok()).as_ref()
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector {css}: {e}")))
}

/// `March_6` style page name.
pub fn day_page_name(date: NaiveDate) -> String {
    date.format("%B_%-d").to_string()
}

fn has_class(el: &ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn section_of(heading: &str) -> Option<Section> {
    let heading = heading.trim();
    if heading.starts_with("Events") {
        Some(Section::Events)
    } else if heading.starts_with("Births") {
        Some(Section::Births)
    } else {
        None
    }
}

fn direct_children<'a>(el: ElementRef<'a>, name: &'a str) -> impl Iterator<Item = ElementRef<'a>> {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(move |child| child.value().name() == name)
}

/// Parse the Events and Births lists of a day page for `month`/`day`.
pub fn parse_day_page(html: &str, month: u32, day: u32) -> Result<Vec<DayEntry>, AdapterError> {
    let document = Html::parse_document(html);
    let content_sel = selector(".mw-parser-output")?;
    let h2_sel = selector("h2")?;
    let nested_sel = selector("ul")?;
    let link_sel = selector("a[href]")?;

    let Some(content) = document.select(&content_sel).next() else {
        return Ok(Vec::new());
    };

    let mut current: Option<Section> = None;
    let mut entries = Vec::new();
    for child in content.children().filter_map(ElementRef::wrap) {
        let lists: Vec<ElementRef<'_>> = match child.value().name() {
            "h2" => {
                current = section_of(&child.text().collect::<String>());
                continue;
            }
            "div" if has_class(&child, "mw-heading2") => {
                if let Some(h2) = child.select(&h2_sel).next() {
                    current = section_of(&h2.text().collect::<String>());
                }
                continue;
            }
            "div" if has_class(&child, "div-col") => direct_children(child, "ul").collect(),
            "ul" => vec![child],
            _ => continue,
        };
        let Some(section) = current else {
            continue;
        };
        for list in lists {
            for item in direct_children(list, "li") {
                if item.select(&nested_sel).next().is_some() {
                    debug!(month, day, "skipping nested list entry");
                    continue;
                }
                if let Some(entry) = parse_entry(item, &link_sel, section, month, day) {
                    entries.push(entry);
                }
            }
        }
    }
    Ok(entries)
}

fn parse_entry(
    item: ElementRef<'_>,
    link_sel: &Selector,
    section: Section,
    month: u32,
    day: u32,
) -> Option<DayEntry> {
    let raw_text = item.text().collect::<String>();
    let raw_text = raw_text.trim();
    let mut parts = dash_splitter()?.splitn(raw_text, 2);
    let year_text = parts.next()?.trim();
    let Some(description) = parts.next().map(str::trim) else {
        debug!(month, day, entry = raw_text, "no dash in entry");
        return None;
    };
    let year: i32 = year_text.parse().ok()?;
    let Some(date) = NaiveDate::from_ymd_opt(year, month, day).filter(|_| year > 0) else {
        debug!(month, day, year_text, "entry date not representable");
        return None;
    };

    let mut article_paths: Vec<String> = Vec::new();
    for link in item.select(link_sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let path = href.split('#').next().unwrap_or(href);
        if path.starts_with("/wiki/") && !path.contains(':') && !article_paths.iter().any(|p| p == path)
        {
            article_paths.push(path.to_string());
        }
    }

    let text = if article_paths.is_empty() {
        raw_text.to_string()
    } else {
        let anchors: Vec<String> = article_paths
            .iter()
            .map(|path| {
                let name = path.rsplit('/').next().unwrap_or(path).replace('_', " ");
                format!(r#"<a href="{WIKI_BASE_URL}{path}">{name}</a>"#)
            })
            .collect();
        format!("Learn more: {}", anchors.join(", "))
    };

    let title = match section {
        Section::Events => description.to_string(),
        Section::Births => format!("{description}{BIRTH_SUFFIX}"),
    };

    Some(DayEntry {
        date: date.format("%Y-%m-%d").to_string(),
        title,
        text,
        link: String::new(),
        image_link: String::new(),
        media_link: String::new(),
        year,
        article_paths,
    })
}

/// `title -> image_link` of previously snapshotted entries that had an image.
pub fn cached_images(previous: Option<&JsonValue>) -> HashMap<String, String> {
    previous
        .and_then(JsonValue::as_array)
        .map(|records| {
            records
                .iter()
                .filter_map(|r| {
                    let title = r.get("title")?.as_str()?;
                    let image = r.get("image_link")?.as_str()?;
                    (!image.is_empty()).then(|| (title.to_string(), image.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct WikipediaAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    fetch_images: bool,
}

impl WikipediaAdapter {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: WIKI_BASE_URL.to_string(),
            fetch_images: true,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_images(mut self, fetch_images: bool) -> Self {
        self.fetch_images = fetch_images;
        self
    }

    async fn summary_image(&self, run_id: Uuid, article_path: &str) -> String {
        let article = article_path.trim_start_matches("/wiki/");
        let url = format!("{}/api/rest_v1/page/summary/{article}", self.base_url);
        match self.http.fetch_bytes(run_id, SOURCE_ID, &url).await {
            Ok(resp) => resp
                .json()
                .ok()
                .and_then(|v| v.pointer("/thumbnail/source").and_then(JsonValue::as_str).map(str::to_string))
                .unwrap_or_default(),
            Err(err) => {
                warn!(article, error = %err, "summary lookup failed");
                String::new()
            }
        }
    }

    async fn attach_images(&self, run_id: Uuid, entries: &mut [DayEntry], cache: &HashMap<String, String>) {
        let mut reused = 0usize;
        for entry in entries.iter_mut().filter(|e| e.year > IMAGE_YEAR_THRESHOLD) {
            if let Some(image) = cache.get(&entry.title) {
                entry.image_link = image.clone();
                reused += 1;
                continue;
            }
            let year_path = format!("/wiki/{}", entry.year);
            let Some(article) = entry.article_paths.iter().find(|p| **p != year_path) else {
                continue;
            };
            entry.image_link = self.summary_image(run_id, article).await;
        }
        debug!(reused, "images reused from the previous snapshot");
    }
}

#[async_trait]
impl SourceAdapter for WikipediaAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn label_name(&self) -> &'static str {
        LABEL_NAME
    }

    fn uses_previous_snapshot(&self) -> bool {
        true
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        let url = format!("{}/wiki/{}", self.base_url, day_page_name(ctx.today));
        let resp = self.http.fetch_bytes(ctx.run_id, SOURCE_ID, &url).await?;
        let mut entries = parse_day_page(&resp.text(), ctx.today.month(), ctx.today.day())?;
        if self.fetch_images {
            let cache = cached_images(ctx.previous_snapshot.as_ref());
            self.attach_images(ctx.run_id, &mut entries, &cache).await;
        }
        info!(page = %day_page_name(ctx.today), entries = entries.len(), "day page parsed");

        let records = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(anyhow::Error::from)?;
        Ok(SourceBatch {
            target_date: ctx.today,
            records,
            fetch_reports: Vec::new(),
            raw_snapshot: None,
        })
    }

    fn dedupe_key(&self, record: &JsonValue) -> String {
        record
            .get("title")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| record.to_string())
    }

    async fn canonicalize(
        &self,
        _ctx: &AdapterContext,
        record: &JsonValue,
        label_id: LabelId,
    ) -> Result<Event, RecordMappingError> {
        let optional = |key: &str| {
            record
                .get(key)
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(Event {
            timestamp: parse_timestamp(required_str(record, "date")?)?,
            title: required_str(record, "title")?.to_string(),
            text: required_str(record, "text")?.to_string(),
            link: optional("link"),
            label_id,
            image_link: optional("image_link"),
            media_link: optional("media_link"),
        })
    }

    fn snapshot_content(&self) -> SnapshotContent {
        SnapshotContent::Canonical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;
    use serde_json::json;

    fn march_6() -> Vec<DayEntry> {
        parse_day_page(&fixture("wikipedia/march_6.html"), 3, 6).unwrap()
    }

    #[test]
    fn page_names_use_month_and_unpadded_day() {
        let date = NaiveDate::from_ymd_opt(2019, 3, 6).unwrap();
        assert_eq!(day_page_name(date), "March_6");
    }

    #[test]
    fn events_and_births_are_parsed_and_the_rest_skipped() {
        let entries = march_6();
        let titles: Vec<&str> = entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "The Alamo falls after a thirteen-day siege.",
                "The Dred Scott decision is handed down.",
                "The Office of the Mayor reopens.",
                "Michelangelo, Italian painter was born on this day.",
                "Shaquille O'Neal, American basketball player was born on this day.",
            ]
        );
        assert_eq!(entries[0].date, "1836-03-06");
        assert_eq!(entries[2].year, 2004);
    }

    #[test]
    fn linked_entries_get_a_learn_more_text() {
        let entries = march_6();
        assert_eq!(
            entries[0].text,
            r#"Learn more: <a href="https://en.wikipedia.org/wiki/1836">1836</a>, <a href="https://en.wikipedia.org/wiki/Battle_of_the_Alamo">Battle of the Alamo</a>"#
        );
        assert_eq!(
            entries[1].text,
            r#"Learn more: <a href="https://en.wikipedia.org/wiki/1857">1857</a>, <a href="https://en.wikipedia.org/wiki/Dred_Scott_v._Sandford">Dred Scott v. Sandford</a>"#
        );
        // no links: the item text itself
        assert_eq!(entries[2].text, "2004 – The Office of the Mayor reopens.");
    }

    #[test]
    fn previous_snapshots_feed_the_image_cache() {
        let previous = json!([
            { "title": "A", "image_link": "https://upload.example/a.jpg" },
            { "title": "B", "image_link": "" },
            { "title": 3 }
        ]);
        let cache = cached_images(Some(&previous));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache["A"], "https://upload.example/a.jpg");
        assert!(cached_images(None).is_empty());
    }

    #[tokio::test]
    async fn entries_canonicalize_with_empty_links() {
        let http = Arc::new(HttpFetcher::new(dhc_storage::HttpClientConfig::default()).unwrap());
        let adapter = WikipediaAdapter::new(http);
        let ctx = AdapterContext::new(Uuid::nil(), NaiveDate::from_ymd_opt(2019, 3, 6).unwrap());
        let record = serde_json::to_value(&march_6()[3]).unwrap();
        let event = adapter.canonicalize(&ctx, &record, LabelId(4)).await.unwrap();
        assert_eq!(event.timestamp.to_string(), "1475-03-06 00:00:00");
        assert_eq!(event.link, "");
        assert_eq!(event.media_link, "");
        assert!(record.get("year").is_none());
    }
}
