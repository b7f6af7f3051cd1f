use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dhc_adapters::{nyt, movies, wikipedia, MoviesAdapter, NytAdapter, WikipediaAdapter, YouTubeLookup};
use dhc_storage::{CredentialPool, FetchPolicy, HttpFetcher};
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};

use crate::config::CollectorConfig;
use crate::pipeline::SourceJob;

const DEFAULT_LOOKBACK_DAYS: u64 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    /// Label override; the adapter's own label name otherwise.
    #[serde(default)]
    pub label: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub lookback_days: Option<u64>,
    #[serde(default)]
    pub fetch: Option<FetchOverrides>,
}

/// Paginated fetch settings a source may override. `0` for `max_pool_cycles`
/// or `max_pages` lifts that limit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchOverrides {
    pub page_size: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub backoff_ms: Option<u64>,
    pub failures_before_rotation: Option<u32>,
    pub max_pool_cycles: Option<u32>,
    pub max_pages: Option<u32>,
}

impl FetchOverrides {
    pub fn apply(&self, mut policy: FetchPolicy) -> FetchPolicy {
        if let Some(page_size) = self.page_size {
            policy.page_size = page_size.max(1);
        }
        if let Some(ms) = self.cooldown_ms {
            policy.cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = self.backoff_ms {
            policy.backoff = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.failures_before_rotation {
            policy.failures_before_rotation = threshold.max(1);
        }
        if let Some(cycles) = self.max_pool_cycles {
            policy.max_pool_cycles = (cycles > 0).then_some(cycles);
        }
        if let Some(pages) = self.max_pages {
            policy.max_pages = (pages > 0).then_some(pages);
        }
        policy
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        let source = |source_id: &str| SourceConfig {
            source_id: source_id.to_string(),
            label: None,
            enabled: true,
            lookback_days: None,
            fetch: None,
        };
        Self {
            sources: vec![
                source(nyt::SOURCE_ID),
                source(movies::SOURCE_ID),
                source(wikipedia::SOURCE_ID),
            ],
        }
    }
}

/// `sources.yaml` under `root`, or the built-in registry when there is none.
pub async fn load_source_registry(root: &Path) -> Result<SourceRegistry> {
    let path = root.join("sources.yaml");
    let text = match fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no source registry; using built-in sources");
            return Ok(SourceRegistry::default());
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Adapters for the enabled sources, restricted to `only` when it is not empty.
pub fn build_jobs(
    config: &CollectorConfig,
    registry: &SourceRegistry,
    only: &[String],
) -> Result<Vec<SourceJob>> {
    for wanted in only {
        if !registry.sources.iter().any(|s| &s.source_id == wanted) {
            bail!("source `{wanted}` is not in the source registry");
        }
    }

    let http_config = config.http_client_config();
    let http = Arc::new(HttpFetcher::new(http_config.clone()).context("building http client")?);
    let mut jobs = Vec::new();
    for source in &registry.sources {
        let selected = if only.is_empty() {
            source.enabled
        } else {
            only.contains(&source.source_id)
        };
        if !selected {
            continue;
        }

        let job = match source.source_id.as_str() {
            nyt::SOURCE_ID => {
                let Ok(credentials) = CredentialPool::from_delimited(&config.nyt_api_keys) else {
                    warn!(source = nyt::SOURCE_ID, "NYT_API_KEYS is empty; source disabled");
                    continue;
                };
                let policy = source
                    .fetch
                    .as_ref()
                    .map(|o| o.apply(FetchPolicy::default()))
                    .unwrap_or_default();
                let adapter = NytAdapter::new(
                    http_config.clone(),
                    credentials,
                    policy,
                    source.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS),
                )
                .context("building article search adapter")?;
                SourceJob::new(Box::new(adapter))
            }
            movies::SOURCE_ID => {
                let youtube = YouTubeLookup::new(http.clone(), config.youtube_api_key.clone());
                SourceJob::new(Box::new(MoviesAdapter::new(http.clone(), youtube)))
            }
            wikipedia::SOURCE_ID => SourceJob::new(Box::new(WikipediaAdapter::new(http.clone()))),
            other => bail!("no adapter registered for {other}"),
        };
        jobs.push(match &source.label {
            Some(label) => job.with_label(label.clone()),
            None => job,
        });
    }
    Ok(jobs)
}
