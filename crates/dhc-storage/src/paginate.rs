//! Paginated, credential-rotating fetch loop for rate-limited search APIs.
//!
//! A [`FetchSession`] walks a date window one day at a time. For each day it
//! requests page 0, learns the total hit count, then requests the remaining
//! pages with a fixed cool-down between requests. A rejected response (rate
//! limit, bad key, missing envelope) is retried on the same credential after a
//! short backoff; every `failures_before_rotation` consecutive rejections move
//! the session to the next credential of the pool. An unexpected error ends the
//! day early but keeps whatever pages were already produced.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One page of results as returned by the external API.
#[derive(Debug, Clone, PartialEq)]
pub struct PageBody {
    pub total_hits: u64,
    pub items: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub day: NaiveDate,
    pub page: u32,
    pub total_hits: u64,
    pub items: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub credential: &'a str,
    pub day: NaiveDate,
    pub page: u32,
}

#[derive(Debug, Error)]
pub enum PageError {
    /// Malformed or rate-limited response; retried with backoff and rotation.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// Anything the retry protocol does not understand; ends the day.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

#[async_trait]
pub trait PageClient: Send + Sync {
    async fn request_page(&self, request: PageRequest<'_>) -> Result<PageBody, PageError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("credential pool must not be empty")]
pub struct EmptyCredentialPool;

/// Ordered, circular list of interchangeable API credentials.
#[derive(Clone)]
pub struct CredentialPool {
    credentials: Vec<String>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<String>) -> Result<Self, EmptyCredentialPool> {
        let credentials: Vec<String> = credentials
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if credentials.is_empty() {
            return Err(EmptyCredentialPool);
        }
        Ok(Self { credentials })
    }

    /// Split a `_`- or `,`-separated list, the form credentials take in the environment.
    pub fn from_delimited(raw: &str) -> Result<Self, EmptyCredentialPool> {
        Self::new(raw.split(['_', ',']).map(str::to_string).collect())
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    fn get(&self, index: usize) -> &str {
        &self.credentials[index % self.credentials.len()]
    }
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("len", &self.credentials.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub page_size: u32,
    /// Wait between two consecutive page requests.
    pub cooldown: Duration,
    /// Wait before retrying a rejected request.
    pub backoff: Duration,
    pub failures_before_rotation: u32,
    /// Full passes over the pool allowed on one page before the day is given
    /// up. `None` retries forever.
    pub max_pool_cycles: Option<u32>,
    pub max_pages: Option<u32>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            page_size: 10,
            cooldown: Duration::from_secs(1),
            backoff: Duration::from_secs(2),
            failures_before_rotation: 10,
            max_pool_cycles: Some(3),
            max_pages: Some(100),
        }
    }
}

impl FetchPolicy {
    pub fn total_pages(&self, total_hits: u64) -> u32 {
        let page_size = u64::from(self.page_size.max(1));
        let pages = total_hits.div_ceil(page_size).min(u64::from(u32::MAX)) as u32;
        match self.max_pages {
            Some(cap) => pages.min(cap),
            None => pages,
        }
    }
}

/// Transient state of one fetch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCursor {
    pub day: Option<NaiveDate>,
    pub page: u32,
    pub consecutive_failures: u32,
    pub credential_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DayTermination {
    Completed,
    Aborted(String),
    CredentialsExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayReport {
    pub day: NaiveDate,
    pub pages_fetched: u32,
    pub total_pages: Option<u32>,
    pub termination: DayTermination,
}

#[derive(Debug, Clone, Copy)]
enum DayState {
    Idle,
    Open {
        total_pages: Option<u32>,
        pages_fetched: u32,
    },
}

enum AttemptFailure {
    Exhausted { attempts: u32 },
    Unexpected(anyhow::Error),
}

#[derive(Debug)]
pub struct ResilientPaginatedFetcher<C> {
    client: C,
    credentials: CredentialPool,
    policy: FetchPolicy,
}

impl<C: PageClient> ResilientPaginatedFetcher<C> {
    pub fn new(client: C, credentials: CredentialPool, policy: FetchPolicy) -> Self {
        Self {
            client,
            credentials,
            policy,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Lazily page through every day of `start..=end`.
    pub fn session(&self, start: NaiveDate, end: NaiveDate) -> FetchSession<'_, C> {
        let days = start.iter_days().take_while(|d| *d <= end).collect();
        FetchSession {
            fetcher: self,
            days,
            cursor: FetchCursor {
                day: None,
                page: 0,
                consecutive_failures: 0,
                credential_index: 0,
            },
            state: DayState::Idle,
            reports: Vec::new(),
            requests_issued: 0,
        }
    }

    pub async fn fetch_day(&self, day: NaiveDate) -> WindowFetch {
        self.fetch_window(day, day).await
    }

    pub async fn fetch_window(&self, start: NaiveDate, end: NaiveDate) -> WindowFetch {
        let mut session = self.session(start, end);
        let mut pages = Vec::new();
        while let Some(page) = session.next_page().await {
            pages.push(page);
        }
        WindowFetch {
            pages,
            reports: session.into_reports(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowFetch {
    pub pages: Vec<RawPage>,
    pub reports: Vec<DayReport>,
}

impl WindowFetch {
    pub fn into_items(self) -> Vec<serde_json::Value> {
        self.pages.into_iter().flat_map(|p| p.items).collect()
    }
}

/// Single-use iterator over the pages of a date window.
pub struct FetchSession<'a, C> {
    fetcher: &'a ResilientPaginatedFetcher<C>,
    days: VecDeque<NaiveDate>,
    cursor: FetchCursor,
    state: DayState,
    reports: Vec<DayReport>,
    requests_issued: u64,
}

impl<'a, C: PageClient> FetchSession<'a, C> {
    pub fn cursor(&self) -> &FetchCursor {
        &self.cursor
    }

    pub fn reports(&self) -> &[DayReport] {
        &self.reports
    }

    pub fn into_reports(self) -> Vec<DayReport> {
        self.reports
    }

    /// Next page of the window, or `None` once every day has ended.
    pub async fn next_page(&mut self) -> Option<RawPage> {
        loop {
            match self.state {
                DayState::Idle => {
                    let day = self.days.pop_front()?;
                    self.cursor.day = Some(day);
                    self.cursor.page = 0;
                    self.cursor.consecutive_failures = 0;
                    self.state = DayState::Open {
                        total_pages: None,
                        pages_fetched: 0,
                    };
                }
                DayState::Open {
                    total_pages,
                    pages_fetched,
                } => {
                    let day = self.cursor.day?;
                    if total_pages.is_some_and(|total| self.cursor.page >= total) {
                        self.finish_day(DayTermination::Completed);
                        continue;
                    }

                    match self.request_current_page(day).await {
                        Ok(body) => {
                            let total = match total_pages {
                                Some(total) => total,
                                None => {
                                    let total = self.fetcher.policy.total_pages(body.total_hits);
                                    info!(%day, hits = body.total_hits, pages = total, "paging day");
                                    total
                                }
                            };
                            if total == 0 {
                                self.state = DayState::Open {
                                    total_pages: Some(0),
                                    pages_fetched,
                                };
                                continue;
                            }
                            let page = RawPage {
                                day,
                                page: self.cursor.page,
                                total_hits: body.total_hits,
                                items: body.items,
                            };
                            debug!(%day, page = page.page + 1, pages = total, "page fetched");
                            self.cursor.page += 1;
                            self.state = DayState::Open {
                                total_pages: Some(total),
                                pages_fetched: pages_fetched + 1,
                            };
                            return Some(page);
                        }
                        Err(AttemptFailure::Exhausted { attempts }) => {
                            warn!(
                                %day,
                                page = self.cursor.page,
                                attempts,
                                "every credential kept failing; returning the pages fetched so far"
                            );
                            self.finish_day(DayTermination::CredentialsExhausted);
                        }
                        Err(AttemptFailure::Unexpected(err)) => {
                            warn!(
                                %day,
                                page = self.cursor.page,
                                error = %err,
                                "unexpected fetch failure; returning the pages fetched so far"
                            );
                            self.finish_day(DayTermination::Aborted(err.to_string()));
                        }
                    }
                }
            }
        }
    }

    fn finish_day(&mut self, termination: DayTermination) {
        if let (Some(day), DayState::Open {
            total_pages,
            pages_fetched,
        }) = (self.cursor.day, self.state)
        {
            self.reports.push(DayReport {
                day,
                pages_fetched,
                total_pages,
                termination,
            });
        }
        self.state = DayState::Idle;
    }

    async fn request_current_page(&mut self, day: NaiveDate) -> Result<PageBody, AttemptFailure> {
        let policy = &self.fetcher.policy;
        let pool = &self.fetcher.credentials;
        let threshold = policy.failures_before_rotation.max(1);
        let attempt_cap = policy
            .max_pool_cycles
            .map(|cycles| threshold.saturating_mul(pool.len() as u32).saturating_mul(cycles.max(1)));
        let mut attempts = 0u32;

        loop {
            if self.requests_issued > 0 && attempts == 0 {
                tokio::time::sleep(policy.cooldown).await;
            }
            self.requests_issued += 1;

            let request = PageRequest {
                credential: pool.get(self.cursor.credential_index),
                day,
                page: self.cursor.page,
            };
            match self.fetcher.client.request_page(request).await {
                Ok(body) => {
                    self.cursor.consecutive_failures = 0;
                    return Ok(body);
                }
                Err(PageError::Unexpected(err)) => return Err(AttemptFailure::Unexpected(err)),
                Err(PageError::Rejected(reason)) => {
                    attempts += 1;
                    self.cursor.consecutive_failures += 1;
                    if self.cursor.consecutive_failures >= threshold {
                        self.cursor.credential_index =
                            (self.cursor.credential_index + 1) % pool.len();
                        self.cursor.consecutive_failures = 0;
                        warn!(
                            credential_index = self.cursor.credential_index,
                            "credential burned out; switching to the next one"
                        );
                    }
                    if attempt_cap.is_some_and(|cap| attempts >= cap) {
                        return Err(AttemptFailure::Exhausted { attempts });
                    }
                    warn!(%day, page = self.cursor.page, %reason, backoff = ?policy.backoff, "request rejected; retrying");
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }
}
