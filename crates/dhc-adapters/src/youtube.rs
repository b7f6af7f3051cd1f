//! Video lookup used to attach a thumbnail and a watch link to chart events.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use dhc_storage::HttpFetcher;

pub const SEARCH_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3/search";
pub const WATCH_PREFIX: &str = "https://www.youtube.com/watch?v=";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaLinks {
    pub image_link: String,
    pub media_link: String,
}

/// Which search hit counts, and which thumbnail size to take from it.
#[derive(Debug, Clone, Copy)]
pub struct VideoFilter {
    pub title_contains: Option<&'static str>,
    pub thumbnail: &'static str,
}

pub fn pick_video(body: &JsonValue, filter: VideoFilter) -> MediaLinks {
    let items = body
        .get("items")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let winner = items.iter().find(|item| {
        let is_video = item.pointer("/id/kind").and_then(JsonValue::as_str) == Some("youtube#video");
        let title_ok = filter.title_contains.map_or(true, |needle| {
            item.pointer("/snippet/title")
                .and_then(JsonValue::as_str)
                .is_some_and(|t| t.contains(needle))
        });
        is_video && title_ok
    });
    let Some(winner) = winner else {
        return MediaLinks::default();
    };
    let image_link = winner
        .pointer(&format!("/snippet/thumbnails/{}/url", filter.thumbnail))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let media_link = winner
        .pointer("/id/videoId")
        .and_then(JsonValue::as_str)
        .map(|id| format!("{WATCH_PREFIX}{id}"))
        .unwrap_or_default();
    MediaLinks {
        image_link,
        media_link,
    }
}

/// Memoized search. Without an API key every lookup yields empty links.
pub struct YouTubeLookup {
    http: Arc<HttpFetcher>,
    api_key: Option<String>,
    memo: Mutex<HashMap<String, MediaLinks>>,
}

impl YouTubeLookup {
    pub fn new(http: Arc<HttpFetcher>, api_key: Option<String>) -> Self {
        Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, run_id: Uuid, query: &str, filter: VideoFilter) -> MediaLinks {
        let Some(api_key) = &self.api_key else {
            return MediaLinks::default();
        };
        if let Some(hit) = self.memo.lock().await.get(query) {
            return hit.clone();
        }

        let params = [
            ("q", query.to_string()),
            ("maxResults", "5".to_string()),
            ("part", "snippet".to_string()),
            ("key", api_key.clone()),
        ];
        let body = match self
            .http
            .fetch_with_query(run_id, "youtube", SEARCH_ENDPOINT, &params)
            .await
        {
            Ok(resp) => resp.json(),
            Err(err) => {
                warn!(query, error = %err, "video search failed; leaving media links empty");
                return MediaLinks::default();
            }
        };
        let links = match body {
            Ok(body) => pick_video(&body, filter),
            Err(err) => {
                warn!(query, error = %err, "video search returned invalid json");
                return MediaLinks::default();
            }
        };
        self.memo
            .lock()
            .await
            .insert(query.to_string(), links.clone());
        links
    }
}
