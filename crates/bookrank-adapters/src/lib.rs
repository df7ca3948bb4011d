//! Ranking source contracts, the Rakuten Ichiba ranking client and a fixture-backed source.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bookrank_core::{FetchedRanking, PeriodType, RankedItem, SiteProfile};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "bookrank-adapters";

pub const RAKUTEN_RANKING_ENDPOINT: &str =
    "https://app.rakuten.co.jp/services/api/IchibaItem/Ranking/20170628";

/// Failure of a single source fetch. The ingestion core treats every variant as a
/// fetch failure; the variants exist so logs can tell them apart.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("fixture {}: {message}", .path.display())]
    Fixture { path: PathBuf, message: String },
    #[error("{0}")]
    Message(String),
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Transport(_) => "transport",
            SourceError::HttpStatus { .. } => "http_status",
            SourceError::MalformedPayload(_) => "malformed_payload",
            SourceError::Fixture { .. } => "fixture",
            SourceError::Message(_) => "other",
        }
    }
}

/// An external ranking provider, queried by its own native category identifier.
#[async_trait]
pub trait RankingSource: Send + Sync {
    /// The site rows ingested from this source are attributed to.
    fn site(&self) -> &SiteProfile;

    async fn fetch(
        &self,
        native_category_id: &str,
        period: PeriodType,
    ) -> Result<FetchedRanking, SourceError>;
}

pub fn rakuten_books_site(affiliate_id: impl Into<String>) -> SiteProfile {
    SiteProfile {
        name: "rakuten".to_string(),
        display_name: "Rakuten Books".to_string(),
        base_url: "https://books.rakuten.co.jp/".to_string(),
        affiliate_id: affiliate_id.into(),
    }
}

// ---------------------------------------------------------------------------
// HTTP plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout; always finite so a hung source cannot hold a job slot.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

fn without_query(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transient failures. Query strings are kept out of logs and
    /// errors because they carry the application id.
    pub async fn fetch_bytes(&self, source: &str, url: Url) -> Result<Vec<u8>, SourceError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| SourceError::Message("http limiter closed".to_string()))?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let endpoint = without_query(&url);
        let span = info_span!("http_fetch", source, url = %endpoint);
        async {
            let mut attempt = 0usize;
            loop {
                match self.client.get(url.clone()).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let body = resp
                                .bytes()
                                .await
                                .map_err(|e| SourceError::Transport(e.without_url()))?;
                            debug!(bytes = body.len(), "fetched");
                            return Ok(body.to_vec());
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(status = status.as_u16(), attempt, "retryable status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(SourceError::HttpStatus {
                            status: status.as_u16(),
                            url: without_query(resp.url()),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err.without_url(), attempt, "retryable transport error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(SourceError::Transport(err.without_url()));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Rakuten payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct RakutenRankingPayload {
    #[serde(rename = "Items", default)]
    items: Vec<RakutenItemEnvelope>,
}

#[derive(Debug, Clone, Deserialize)]
struct RakutenItemEnvelope {
    #[serde(rename = "Item")]
    item: RakutenItem,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RakutenItem {
    #[serde(alias = "title")]
    item_name: String,
    #[serde(default)]
    item_code: String,
    #[serde(default)]
    item_price: f64,
    #[serde(default)]
    item_url: String,
    #[serde(default)]
    shop_name: String,
    #[serde(default)]
    medium_image_urls: Vec<RakutenImage>,
    #[serde(default)]
    large_image_url: Option<String>,
    #[serde(default)]
    rank: u32,
    #[serde(default)]
    author: String,
    #[serde(default)]
    publisher_name: String,
    #[serde(default)]
    isbn: String,
    #[serde(default)]
    sales_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RakutenImage {
    image_url: String,
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Decode a Rakuten ranking response (`{"Items":[{"Item":{...}}]}`) into ranked items.
///
/// Items without a declared rank take their 1-based position; items without an item
/// code fall back to their ISBN, then their URL.
pub fn parse_rakuten_payload(bytes: &[u8]) -> Result<Vec<RankedItem>, serde_json::Error> {
    let payload: RakutenRankingPayload = serde_json::from_slice(bytes)?;
    Ok(payload
        .items
        .into_iter()
        .enumerate()
        .map(|(position, envelope)| {
            let item = envelope.item;
            let image_url = item
                .medium_image_urls
                .into_iter()
                .next()
                .map(|img| img.image_url)
                .and_then(non_empty)
                .or_else(|| item.large_image_url.and_then(non_empty));
            let item_code = [&item.item_code, &item.isbn, &item.item_url]
                .into_iter()
                .find(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            RankedItem {
                name: item.item_name,
                item_code,
                price: item.item_price,
                detail_url: item.item_url,
                shop_name: item.shop_name,
                image_url,
                rank: if item.rank == 0 { position as u32 + 1 } else { item.rank },
                author: item.author,
                publisher: item.publisher_name,
                isbn: item.isbn,
                sales_date: item.sales_date.and_then(non_empty),
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub struct RakutenRankingSource {
    http: HttpFetcher,
    endpoint: String,
    application_id: String,
    site: SiteProfile,
}

impl RakutenRankingSource {
    pub fn new(
        application_id: impl Into<String>,
        affiliate_id: impl Into<String>,
        http: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let application_id = application_id.into();
        anyhow::ensure!(
            !application_id.trim().is_empty(),
            "a Rakuten application id is required"
        );
        Ok(Self {
            http: HttpFetcher::new(http)?,
            endpoint: RAKUTEN_RANKING_ENDPOINT.to_string(),
            application_id,
            site: rakuten_books_site(affiliate_id),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn request_url(&self, genre_id: &str, period: PeriodType) -> Result<Url, SourceError> {
        let mut params = vec![
            ("applicationId", self.application_id.as_str()),
            ("format", "json"),
            ("genreId", genre_id),
            ("page", "1"),
            ("period", period.as_str()),
        ];
        if !self.site.affiliate_id.is_empty() {
            params.push(("affiliateId", self.site.affiliate_id.as_str()));
        }
        Url::parse_with_params(&self.endpoint, &params)
            .map_err(|e| SourceError::Message(format!("building ranking url: {e}")))
    }
}

#[async_trait]
impl RankingSource for RakutenRankingSource {
    fn site(&self) -> &SiteProfile {
        &self.site
    }

    async fn fetch(
        &self,
        native_category_id: &str,
        period: PeriodType,
    ) -> Result<FetchedRanking, SourceError> {
        let url = self.request_url(native_category_id, period)?;
        let body = self.http.fetch_bytes(&self.site.name, url).await?;
        let items = parse_rakuten_payload(&body)?;
        Ok(FetchedRanking {
            native_category_id: native_category_id.to_string(),
            items,
        })
    }
}

/// Offline source reading `<root>/<native_id>/<period>.json`, falling back to `daily.json`.
/// Files use the Rakuten payload shape.
#[derive(Debug, Clone)]
pub struct FixtureRankingSource {
    root: PathBuf,
    site: SiteProfile,
}

impl FixtureRankingSource {
    pub fn new(root: impl Into<PathBuf>, site: SiteProfile) -> Self {
        Self {
            root: root.into(),
            site,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, native_category_id: &str, period: PeriodType) -> Vec<PathBuf> {
        let dir = self.root.join(native_category_id);
        let mut paths = vec![dir.join(format!("{}.json", period.as_str()))];
        if period != PeriodType::Daily {
            paths.push(dir.join("daily.json"));
        }
        paths
    }
}

#[async_trait]
impl RankingSource for FixtureRankingSource {
    fn site(&self) -> &SiteProfile {
        &self.site
    }

    async fn fetch(
        &self,
        native_category_id: &str,
        period: PeriodType,
    ) -> Result<FetchedRanking, SourceError> {
        let candidates = self.candidates(native_category_id, period);
        for path in &candidates {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let items = parse_rakuten_payload(&bytes)?;
                    debug!(path = %path.display(), items = items.len(), "loaded ranking fixture");
                    return Ok(FetchedRanking {
                        native_category_id: native_category_id.to_string(),
                        items,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(SourceError::Fixture {
                        path: path.clone(),
                        message: err.to_string(),
                    })
                }
            }
        }
        Err(SourceError::Fixture {
            path: candidates
                .into_iter()
                .next()
                .unwrap_or_else(|| self.root.clone()),
            message: "no fixture file for category".to_string(),
        })
    }
}
