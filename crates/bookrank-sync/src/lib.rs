//! Ingestion orchestration: configuration, the per-run ingestion service and the tick scheduler.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bookrank_adapters::{
    rakuten_books_site, FixtureRankingSource, HttpClientConfig, RakutenRankingSource,
    RankingSource, SourceError, TokenBucketConfig,
};
use bookrank_core::{
    BookCandidate, CategoryId, GenreRegistry, JobKey, PeriodType, RankedItem, RankingFact,
    ReportingWindow, SiteId,
};
use bookrank_storage::{RankingStore, SqliteRepository, StoreError, StoreTx};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bookrank-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Rakuten,
    Fixture,
}

impl SourceKind {
    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "fixture" | "fixtures" => SourceKind::Fixture,
            _ => SourceKind::Rakuten,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub tick_interval: Duration,
    pub category_keys: Vec<String>,
    pub period_types: Vec<PeriodType>,
    pub max_concurrent_jobs: Option<usize>,
    pub source: SourceKind,
    pub fixtures_dir: PathBuf,
    pub genres_file: Option<PathBuf>,
    pub rakuten_application_id: String,
    pub rakuten_affiliate_id: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalizes labels and drops duplicates, so `biannual` and `daily` collapse into one entry.
fn normalize_periods<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<PeriodType> {
    let mut periods = Vec::new();
    for label in labels {
        let period = PeriodType::from_label_or_default(label);
        if !periods.contains(&period) {
            periods.push(period);
        }
    }
    periods
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let category_keys = split_list(
            &var("BOOKRANK_CATEGORY_KEYS").unwrap_or_else(|| "business,computer,all".to_string()),
        );
        let period_labels =
            split_list(&var("BOOKRANK_PERIOD_TYPES").unwrap_or_else(|| "daily,weekly".to_string()));

        Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://bookrank.db".to_string()),
            tick_interval: Duration::from_secs(
                var("BOOKRANK_TICK_INTERVAL_SECS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(3600),
            ),
            category_keys,
            period_types: normalize_periods(period_labels.iter().map(String::as_str)),
            max_concurrent_jobs: var("BOOKRANK_MAX_CONCURRENT_JOBS")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0),
            source: var("BOOKRANK_SOURCE")
                .map(|v| SourceKind::from_label(&v))
                .unwrap_or(SourceKind::Rakuten),
            fixtures_dir: var("BOOKRANK_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            genres_file: var("BOOKRANK_GENRES_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            rakuten_application_id: var("RAKUTEN_APPLICATION_ID").unwrap_or_default(),
            rakuten_affiliate_id: var("RAKUTEN_AFFILIATE_ID").unwrap_or_default(),
            user_agent: var("BOOKRANK_USER_AGENT").unwrap_or_else(|| "bookrank/0.1".to_string()),
            http_timeout_secs: var("BOOKRANK_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(30),
            web_port: var("BOOKRANK_WEB_PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(8080),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: self.tick_interval,
            category_keys: self.category_keys.clone(),
            period_types: self.period_types.clone(),
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GenreIdValue {
    Text(String),
    Number(u64),
}

#[derive(Debug, Deserialize)]
struct GenresFile {
    genres: BTreeMap<String, GenreIdValue>,
}

/// Load the category-key → native genre map. Without a file the built-in Rakuten book genres apply.
pub async fn load_genre_registry(path: Option<&Path>) -> Result<GenreRegistry> {
    let Some(path) = path else {
        return Ok(GenreRegistry::rakuten_books());
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: GenresFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let genres = file
        .genres
        .into_iter()
        .map(|(key, id)| {
            let id = match id {
                GenreIdValue::Text(s) => s.trim().to_string(),
                GenreIdValue::Number(n) => n.to_string(),
            };
            (key, id)
        })
        .collect();
    Ok(GenreRegistry::new(genres))
}

pub fn build_source(config: &SyncConfig) -> Result<Arc<dyn RankingSource>> {
    let site = rakuten_books_site(config.rakuten_affiliate_id.clone());
    match config.source {
        SourceKind::Fixture => Ok(Arc::new(FixtureRankingSource::new(
            config.fixtures_dir.clone(),
            site,
        ))),
        SourceKind::Rakuten => {
            let http = HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                token_bucket: Some(TokenBucketConfig {
                    capacity: 1,
                    refill_every: Duration::from_secs(1),
                }),
                ..Default::default()
            };
            let source = RakutenRankingSource::new(
                config.rakuten_application_id.clone(),
                config.rakuten_affiliate_id.clone(),
                http,
            )
            .context("RAKUTEN_APPLICATION_ID must be set for the rakuten source")?;
            Ok(Arc::new(source))
        }
    }
}

/// Connects and migrates the repository, then wires the ingestion service from config.
pub async fn service_from_config(config: &SyncConfig) -> Result<(SqliteRepository, IngestionService)> {
    let repo = SqliteRepository::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    repo.migrate().await.context("applying migrations")?;
    let genres = load_genre_registry(config.genres_file.as_deref()).await?;
    let source = build_source(config)?;
    let service = IngestionService::new(Arc::new(repo.clone()), source, genres);
    Ok((repo, service))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no genre mapping for category key {0:?}")]
    UnknownCategory(String),
    #[error("fetching genre {genre_id} failed ({kind}): {source}", kind = .source.kind())]
    FetchFailed {
        genre_id: String,
        #[source]
        source: SourceError,
    },
    #[error("write failed at {stage}: {source}")]
    WriteFailed {
        stage: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("commit failed: {0}")]
    CommitFailed(#[source] StoreError),
}

impl IngestError {
    /// Everything except a missing category mapping may succeed on the next tick.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, IngestError::UnknownCategory(_))
    }
}

fn write_failed(stage: &'static str) -> impl Fn(StoreError) -> IngestError {
    move |source| IngestError::WriteFailed { stage, source }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: JobKey,
    pub window: ReportingWindow,
    pub items_fetched: usize,
    pub rankings_written: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Fetches one category/period ranking and persists it in a single transaction.
#[derive(Clone)]
pub struct IngestionService {
    store: Arc<dyn RankingStore>,
    source: Arc<dyn RankingSource>,
    genres: Arc<GenreRegistry>,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn RankingStore>,
        source: Arc<dyn RankingSource>,
        genres: GenreRegistry,
    ) -> Self {
        Self {
            store,
            source,
            genres: Arc::new(genres),
        }
    }

    pub fn genres(&self) -> &GenreRegistry {
        &self.genres
    }

    pub async fn run(&self, category_key: &str, period_label: &str) -> Result<RunSummary, IngestError> {
        let period = PeriodType::from_label_or_default(period_label);
        self.run_at(category_key, period, Utc::now()).await
    }

    pub async fn run_at(
        &self,
        category_key: &str,
        period: PeriodType,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, category_key, period = %period);
        self.execute(run_id, category_key, period, now)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        category_key: &str,
        period: PeriodType,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();
        let genre_id = self
            .genres
            .resolve(category_key)
            .ok_or_else(|| IngestError::UnknownCategory(category_key.to_string()))?
            .to_string();
        let window = period.window_ending(now);

        let fetched = self
            .source
            .fetch(&genre_id, period)
            .await
            .map_err(|source| IngestError::FetchFailed {
                genre_id: genre_id.clone(),
                source,
            })?;
        let items_fetched = fetched.items.len();

        let site = self.source.site();
        let site_id = self
            .store
            .find_or_create_site(site)
            .await
            .map_err(write_failed("site"))?;
        let category_name = format!("{} {}", site.display_name, category_key);
        let category_id = self
            .store
            .find_or_create_category(&category_name, None)
            .await
            .map_err(write_failed("category"))?;
        self.store
            .find_or_create_site_category_mapping(category_id, site_id, &fetched.native_category_id)
            .await
            .map_err(write_failed("site_category_mapping"))?;

        let mut tx = self.store.begin().await.map_err(write_failed("begin"))?;
        let staged = stage_rankings(
            tx.as_mut(),
            site_id,
            category_id,
            period,
            window,
            &fetched.items,
        )
        .await;
        let rankings_written = match staged {
            Ok(written) => written,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed write did not complete");
                }
                return Err(err);
            }
        };
        tx.commit().await.map_err(IngestError::CommitFailed)?;

        let finished_at = Utc::now();
        info!(
            items_fetched,
            rankings_written,
            date_from = %window.date_from,
            date_to = %window.date_to,
            "ingestion run committed"
        );
        Ok(RunSummary {
            run_id,
            job: JobKey::new(category_key, period),
            window,
            items_fetched,
            rankings_written,
            started_at,
            finished_at,
        })
    }
}

/// Writes every item in source order; the first failure aborts the remaining items.
async fn stage_rankings(
    tx: &mut dyn StoreTx,
    site_id: SiteId,
    category_id: CategoryId,
    period: PeriodType,
    window: ReportingWindow,
    items: &[RankedItem],
) -> Result<usize, IngestError> {
    let mut written = 0usize;
    for item in items {
        let candidate = BookCandidate::from(item);
        let book_id = tx
            .find_or_create_book(&candidate)
            .await
            .map_err(write_failed("book"))?;
        let mapping_id = tx
            .upsert_book_site_mapping(book_id, site_id, &item.item_code, item.price, &item.detail_url)
            .await
            .map_err(write_failed("book_site_mapping"))?;
        tx.upsert_ranking(&RankingFact {
            book_site_mapping_id: mapping_id,
            category_id,
            rank: item.rank,
            period,
            window,
        })
        .await
        .map_err(write_failed("ranking"))?;
        written += 1;
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Unit of work the scheduler dispatches per job key.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run_job(&self, key: &JobKey) -> Result<RunSummary, IngestError>;
}

#[async_trait]
impl JobRunner for IngestionService {
    async fn run_job(&self, key: &JobKey) -> Result<RunSummary, IngestError> {
        self.run_at(&key.category_key, key.period, Utc::now()).await
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub category_keys: Vec<String>,
    pub period_types: Vec<PeriodType>,
    /// Defaults to the size of the category × period cross product.
    pub max_concurrent_jobs: Option<usize>,
}

impl SchedulerConfig {
    pub fn job_keys(&self) -> Vec<JobKey> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for category_key in &self.category_keys {
            for period in &self.period_types {
                let key = JobKey::new(category_key.clone(), *period);
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_jobs
            .unwrap_or_else(|| self.job_keys().len())
            .max(1)
    }
}

pub type JobHandle = JoinHandle<Result<RunSummary, IngestError>>;

#[derive(Debug)]
pub enum TriggerOutcome {
    Dispatched(JobHandle),
    AlreadyRunning,
}

impl TriggerOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, TriggerOutcome::Dispatched(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub dispatched: usize,
    pub already_running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

struct SchedulerInner {
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
    in_flight: Mutex<HashSet<JobKey>>,
    permits: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl SchedulerInner {
    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<JobKey>> {
        // The set stays consistent even if a holder panicked; recover it.
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears a key's in-flight mark when the job task ends, however it ends.
struct InFlightGuard {
    inner: Arc<SchedulerInner>,
    key: JobKey,
}

impl InFlightGuard {
    fn acquire(inner: &Arc<SchedulerInner>, key: &JobKey) -> Option<Self> {
        if !inner.in_flight().insert(key.clone()) {
            return None;
        }
        Some(Self {
            inner: Arc::clone(inner),
            key: key.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight().remove(&self.key);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, config: SchedulerConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.concurrency_limit()));
        Self {
            inner: Arc::new(SchedulerInner {
                runner,
                config,
                in_flight: Mutex::new(HashSet::new()),
                permits,
                stop_tx,
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn is_in_flight(&self, key: &JobKey) -> bool {
        self.inner.in_flight().contains(key)
    }

    /// Spawns the control loop: one cycle immediately, then one per tick until `stop`.
    /// Returns `None` if the loop was already started on this scheduler.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("scheduler already started; ignoring start");
            return None;
        }
        let scheduler = self.clone();
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let tick_interval = self.inner.config.tick_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                tick_secs = tick_interval.as_secs(),
                jobs = scheduler.inner.config.job_keys().len(),
                "scheduler started"
            );
            loop {
                if *stop_rx.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow_and_update() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
                let report = scheduler.run_cycle().await;
                info!(
                    dispatched = report.dispatched,
                    already_running = report.already_running,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "scheduler cycle finished"
                );
            }
            info!("scheduler stopped");
        }))
    }

    /// Asks the control loop to exit after its current wait. Dispatched jobs run to completion.
    pub fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
    }

    pub fn trigger_one(&self, category_key: &str, period: PeriodType) -> TriggerOutcome {
        let key = JobKey::new(category_key, period);
        let Some(guard) = InFlightGuard::acquire(&self.inner, &key) else {
            info!(job = %key, "job already running; trigger skipped");
            return TriggerOutcome::AlreadyRunning;
        };

        let inner = Arc::clone(&self.inner);
        let span = info_span!("scheduled_job", job = %key);
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                let _permit = Arc::clone(&inner.permits).acquire_owned().await.ok();
                let result = inner.runner.run_job(&key).await;
                match &result {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        rankings = summary.rankings_written,
                        "job finished"
                    ),
                    Err(err) => error!(
                        error = %err,
                        retryable = err.is_retryable(),
                        "job failed"
                    ),
                }
                result
            }
            .instrument(span),
        );
        TriggerOutcome::Dispatched(handle)
    }

    /// Dispatches the full category × period cross product and waits for every dispatched job.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let mut handles: HashMap<JobKey, JobHandle> = HashMap::new();
        for key in self.inner.config.job_keys() {
            match self.trigger_one(&key.category_key, key.period) {
                TriggerOutcome::Dispatched(handle) => {
                    report.dispatched += 1;
                    handles.insert(key, handle);
                }
                TriggerOutcome::AlreadyRunning => report.already_running += 1,
            }
        }

        for (key, handle) in handles {
            match handle.await {
                Ok(Ok(_)) => report.succeeded += 1,
                Ok(Err(_)) => report.failed += 1,
                Err(join_err) => {
                    error!(job = %key, error = %join_err, "job task aborted");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bookrank_core::{FetchedRanking, SiteProfile, TableCounts};
    use bookrank_core::{BookId, BookSiteMappingId, SiteCategoryMappingId};
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;

    fn stub_site() -> SiteProfile {
        SiteProfile {
            name: "stub".into(),
            display_name: "Stub Books".into(),
            base_url: "https://stub.example/".into(),
            affiliate_id: String::new(),
        }
    }

    fn item(isbn: &str, title: &str, rank: u32) -> RankedItem {
        RankedItem {
            name: title.into(),
            item_code: format!("book:{isbn}{title}"),
            price: 1000.0 + f64::from(rank),
            detail_url: format!("https://stub.example/{title}"),
            shop_name: "stub shop".into(),
            image_url: None,
            rank,
            author: "author".into(),
            publisher: "publisher".into(),
            isbn: isbn.into(),
            sales_date: None,
        }
    }

    struct StubSource {
        site: SiteProfile,
        items: Mutex<Vec<RankedItem>>,
        fail: bool,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl StubSource {
        fn new(items: Vec<RankedItem>) -> Self {
            Self {
                site: stub_site(),
                items: Mutex::new(items),
                fail: false,
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn set_items(&self, items: Vec<RankedItem>) {
            *self.items.lock().unwrap() = items;
        }
    }

    #[async_trait]
    impl RankingSource for StubSource {
        fn site(&self) -> &SiteProfile {
            &self.site
        }

        async fn fetch(
            &self,
            native_category_id: &str,
            _period: PeriodType,
        ) -> Result<FetchedRanking, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(SourceError::Message("stub source offline".into()));
            }
            Ok(FetchedRanking {
                native_category_id: native_category_id.to_string(),
                items: self.items.lock().unwrap().clone(),
            })
        }
    }

    /// Passes through to SQLite but fails the N-th ranking upsert or the commit.
    struct FailingStore {
        inner: SqliteRepository,
        fail_ranking_at: Option<usize>,
        fail_commit: bool,
    }

    struct FailingTx {
        inner: Box<dyn StoreTx>,
        fail_ranking_at: Option<usize>,
        fail_commit: bool,
        rankings_seen: usize,
    }

    #[async_trait]
    impl RankingStore for FailingStore {
        async fn find_or_create_site(&self, site: &SiteProfile) -> Result<SiteId, StoreError> {
            self.inner.find_or_create_site(site).await
        }

        async fn find_or_create_category(
            &self,
            name: &str,
            parent_id: Option<CategoryId>,
        ) -> Result<CategoryId, StoreError> {
            self.inner.find_or_create_category(name, parent_id).await
        }

        async fn find_or_create_site_category_mapping(
            &self,
            category_id: CategoryId,
            site_id: SiteId,
            site_category_id: &str,
        ) -> Result<SiteCategoryMappingId, StoreError> {
            self.inner
                .find_or_create_site_category_mapping(category_id, site_id, site_category_id)
                .await
        }

        async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
            Ok(Box::new(FailingTx {
                inner: self.inner.begin().await?,
                fail_ranking_at: self.fail_ranking_at,
                fail_commit: self.fail_commit,
                rankings_seen: 0,
            }))
        }
    }

    #[async_trait]
    impl StoreTx for FailingTx {
        async fn find_or_create_book(&mut self, candidate: &BookCandidate) -> Result<BookId, StoreError> {
            self.inner.find_or_create_book(candidate).await
        }

        async fn upsert_book_site_mapping(
            &mut self,
            book_id: BookId,
            site_id: SiteId,
            item_code: &str,
            price: f64,
            url: &str,
        ) -> Result<BookSiteMappingId, StoreError> {
            self.inner
                .upsert_book_site_mapping(book_id, site_id, item_code, price, url)
                .await
        }

        async fn upsert_ranking(&mut self, fact: &RankingFact) -> Result<(), StoreError> {
            self.rankings_seen += 1;
            if self.fail_ranking_at == Some(self.rankings_seen) {
                return Err(StoreError::Message("injected ranking failure".into()));
            }
            self.inner.upsert_ranking(fact).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            let this = *self;
            if this.fail_commit {
                return Err(StoreError::Message("injected commit failure".into()));
            }
            this.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            let this = *self;
            this.inner.rollback().await
        }
    }

    async fn repo() -> (TempDir, SqliteRepository) {
        let dir = tempdir().expect("tempdir");
        let repo = SqliteRepository::open(dir.path().join("bookrank.db"))
            .await
            .expect("open");
        repo.migrate().await.expect("migrate");
        (dir, repo)
    }

    fn service(repo: &SqliteRepository, source: Arc<StubSource>) -> IngestionService {
        IngestionService::new(Arc::new(repo.clone()), source, GenreRegistry::rakuten_books())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).single().unwrap()
    }

    async fn counts(repo: &SqliteRepository) -> TableCounts {
        repo.table_counts().await.expect("counts")
    }

    #[tokio::test]
    async fn rerunning_same_items_is_idempotent() {
        let (_dir, repo) = repo().await;
        let source = Arc::new(StubSource::new(vec![
            item("9784000000001", "One", 1),
            item("9784000000002", "Two", 2),
            item("", "Three", 3),
        ]));
        let service = service(&repo, source);

        let first = service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .expect("first run");
        let after_first = counts(&repo).await;
        service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .expect("second run");
        let after_second = counts(&repo).await;

        assert_eq!(first.items_fetched, 3);
        assert_eq!(first.rankings_written, 3);
        assert_eq!(first.job, JobKey::new("business", PeriodType::Daily));
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.books, 3);
        assert_eq!(after_second.book_site_mappings, 3);
        assert_eq!(after_second.rankings, 3);
        assert_eq!(after_second.sites, 1);
        assert_eq!(after_second.categories, 1);
        assert_eq!(after_second.site_category_mappings, 1);
    }

    #[tokio::test]
    async fn rerunning_items_without_isbn_or_author_is_idempotent() {
        let (_dir, repo) = repo().await;
        let mut bare = item("", "Ichiba Bestseller", 1);
        bare.author = String::new();
        bare.publisher = String::new();
        let source = Arc::new(StubSource::new(vec![bare]));
        let service = service(&repo, source);

        service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .expect("first run");
        let after_first = counts(&repo).await;
        service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .expect("second run");

        assert_eq!(after_first, counts(&repo).await);
        assert_eq!(after_first.books, 1);
        assert_eq!(after_first.book_site_mappings, 1);
        assert_eq!(after_first.rankings, 1);
    }

    #[tokio::test]
    async fn failure_on_nth_ranking_rolls_back_whole_run() {
        let (_dir, repo) = repo().await;
        let source = Arc::new(StubSource::new(vec![
            item("9784000000001", "One", 1),
            item("9784000000002", "Two", 2),
            item("9784000000003", "Three", 3),
        ]));
        let store = FailingStore {
            inner: repo.clone(),
            fail_ranking_at: Some(2),
            fail_commit: false,
        };
        let service = IngestionService::new(Arc::new(store), source, GenreRegistry::rakuten_books());

        let err = service
            .run_at("business", PeriodType::Weekly, fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::WriteFailed { stage: "ranking", .. }));
        assert!(err.is_retryable());

        let after = counts(&repo).await;
        assert_eq!(after.rankings, 0);
        assert_eq!(after.books, 0);
        assert_eq!(after.book_site_mappings, 0);
    }

    #[tokio::test]
    async fn commit_failure_leaves_no_partial_rows() {
        let (_dir, repo) = repo().await;
        let source = Arc::new(StubSource::new(vec![item("9784000000001", "One", 1)]));
        let store = FailingStore {
            inner: repo.clone(),
            fail_ranking_at: None,
            fail_commit: true,
        };
        let service = IngestionService::new(Arc::new(store), source, GenreRegistry::rakuten_books());

        let err = service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::CommitFailed(_)));
        assert_eq!(counts(&repo).await.rankings, 0);
    }

    #[tokio::test]
    async fn swapped_ranks_update_the_same_window() {
        let (_dir, repo) = repo().await;
        let source = Arc::new(StubSource::new(vec![item("A", "Alpha", 1), item("B", "Beta", 2)]));
        let service = service(&repo, Arc::clone(&source));
        service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .expect("first run");

        source.set_items(vec![item("A", "Alpha", 2), item("B", "Beta", 1)]);
        service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .expect("second run");

        assert_eq!(counts(&repo).await.rankings, 2);
        let category = repo
            .find_category("Stub Books business", None)
            .await
            .unwrap()
            .expect("category");
        let page = repo
            .top_rankings(category, PeriodType::Daily, 10)
            .await
            .unwrap()
            .expect("page");
        let order: Vec<(&str, u32)> = page.books.iter().map(|b| (b.isbn.as_str(), b.rank)).collect();
        assert_eq!(order, vec![("B", 1), ("A", 2)]);
    }

    #[tokio::test]
    async fn unknown_period_uses_daily_window() {
        let (_dir, repo) = repo().await;
        let source = Arc::new(StubSource::new(vec![item("A", "Alpha", 1)]));
        let service = service(&repo, source);

        let odd = service.run("business", "biannual").await.expect("biannual");
        let daily = service.run("business", "daily").await.expect("daily");

        assert_eq!(odd.window, daily.window);
        assert_eq!(odd.job, daily.job);
        assert_eq!(counts(&repo).await.rankings, 1);
    }

    #[tokio::test]
    async fn books_match_by_isbn_then_title_and_author() {
        let (_dir, repo) = repo().await;
        let source = Arc::new(StubSource::new(vec![item("9784000000009", "Old Title", 1), item("", "No Isbn", 2)]));
        let service = service(&repo, Arc::clone(&source));
        service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .expect("first run");

        let mut renamed = item("9784000000009", "New Title", 1);
        renamed.author = "someone else".into();
        source.set_items(vec![renamed, item("", "No Isbn", 2)]);
        service
            .run_at("computer", PeriodType::Daily, fixed_now())
            .await
            .expect("second run");

        let after = counts(&repo).await;
        assert_eq!(after.books, 2);
        assert_eq!(after.categories, 2);
        // New title means a new item code, so a second site mapping for the same book.
        assert_eq!(after.book_site_mappings, 3);
    }

    #[tokio::test]
    async fn unknown_category_and_fetch_failure_write_nothing() {
        let (_dir, repo) = repo().await;
        let service = service(&repo, Arc::new(StubSource::new(vec![item("A", "Alpha", 1)])));
        let err = service.run("cookbooks", "daily").await.unwrap_err();
        assert!(matches!(err, IngestError::UnknownCategory(ref key) if key == "cookbooks"));
        assert!(!err.is_retryable());

        let mut failing = StubSource::new(vec![item("A", "Alpha", 1)]);
        failing.fail = true;
        let service = IngestionService::new(
            Arc::new(repo.clone()),
            Arc::new(failing),
            GenreRegistry::rakuten_books(),
        );
        let err = service.run("business", "daily").await.unwrap_err();
        assert!(matches!(err, IngestError::FetchFailed { ref genre_id, .. } if genre_id == "200166"));

        assert_eq!(counts(&repo).await, TableCounts::default());
    }

    #[tokio::test]
    async fn duplicate_trigger_while_running_is_skipped() {
        let (_dir, repo) = repo().await;
        let gate = Arc::new(Notify::new());
        let mut blocking = StubSource::new(vec![item("A", "Alpha", 1)]);
        blocking.gate = Some(Arc::clone(&gate));
        let source = Arc::new(blocking);
        let service = service(&repo, Arc::clone(&source));
        let scheduler = Scheduler::new(
            Arc::new(service),
            SchedulerConfig {
                tick_interval: Duration::from_secs(3600),
                category_keys: vec!["business".into()],
                period_types: vec![PeriodType::Daily],
                max_concurrent_jobs: None,
            },
        );

        let first = scheduler.trigger_one("business", PeriodType::Daily);
        let second = scheduler.trigger_one("business", PeriodType::Daily);
        assert!(first.is_dispatched());
        assert!(matches!(second, TriggerOutcome::AlreadyRunning));
        assert!(scheduler.is_in_flight(&JobKey::new("business", PeriodType::Daily)));
        assert_eq!(counts(&repo).await.rankings, 0);

        gate.notify_one();
        let TriggerOutcome::Dispatched(handle) = first else {
            unreachable!()
        };
        handle.await.expect("join").expect("run");

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counts(&repo).await.rankings, 1);
        assert!(!scheduler.is_in_flight(&JobKey::new("business", PeriodType::Daily)));
    }

    struct FakeRunner {
        calls: Mutex<Vec<JobKey>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl FakeRunner {
        fn new(delay: Duration) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobRunner for FakeRunner {
        async fn run_job(&self, key: &JobKey) -> Result<RunSummary, IngestError> {
            self.calls.lock().unwrap().push(key.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            match key.category_key.as_str() {
                "broken" => Err(IngestError::UnknownCategory(key.category_key.clone())),
                "explodes" => panic!("runner blew up"),
                _ => Ok(RunSummary {
                    run_id: Uuid::new_v4(),
                    job: key.clone(),
                    window: key.period.window_ending(Utc::now()),
                    items_fetched: 0,
                    rankings_written: 0,
                    started_at: Utc::now(),
                    finished_at: Utc::now(),
                }),
            }
        }
    }

    fn scheduler_config(keys: &[&str], periods: &[PeriodType]) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(3600),
            category_keys: keys.iter().map(|k| k.to_string()).collect(),
            period_types: periods.to_vec(),
            max_concurrent_jobs: None,
        }
    }

    #[tokio::test]
    async fn cycle_isolates_failing_and_panicking_jobs() {
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(5)));
        let scheduler = Scheduler::new(
            runner.clone(),
            scheduler_config(&["business", "broken", "explodes"], &[PeriodType::Daily, PeriodType::Weekly]),
        );

        let report = scheduler.run_cycle().await;
        assert_eq!(report.dispatched, 6);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 4);

        // Every mark was released, including the panicked ones.
        let again = scheduler.run_cycle().await;
        assert_eq!(again.dispatched, 6);
        assert_eq!(again.already_running, 0);
        assert_eq!(runner.call_count(), 12);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_configured_limit() {
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(30)));
        let mut config = scheduler_config(&["a", "b", "c"], &PeriodType::ALL);
        config.max_concurrent_jobs = Some(2);
        let scheduler = Scheduler::new(runner.clone(), config);

        let report = scheduler.run_cycle().await;
        assert_eq!(report.succeeded, 9);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn start_runs_an_immediate_cycle_and_stop_ends_the_loop() {
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(1)));
        let scheduler = Scheduler::new(
            runner.clone(),
            scheduler_config(&["business", "computer"], &[PeriodType::Daily]),
        );

        let control = scheduler.start().expect("first start spawns the loop");
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while runner.call_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "immediate cycle did not run");

        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(5), control)
            .await
            .expect("control loop exits after stop")
            .expect("join");
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn second_start_is_ignored_and_runs_no_extra_cycle() {
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(1)));
        let scheduler = Scheduler::new(
            runner.clone(),
            scheduler_config(&["business", "computer"], &[PeriodType::Daily]),
        );

        let control = scheduler.start().expect("first start spawns the loop");
        assert!(scheduler.start().is_none());
        assert!(scheduler.clone().start().is_none());

        tokio::time::timeout(Duration::from_secs(5), async {
            while runner.call_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("immediate cycle runs");
        tokio::time::sleep(Duration::from_millis(50)).await;

        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(5), control)
            .await
            .expect("control loop exits after stop")
            .expect("join");
        assert_eq!(runner.call_count(), 2);
    }

    #[test]
    fn job_keys_collapse_normalized_periods() {
        let config = SyncConfig::from_vars(|key| match key {
            "BOOKRANK_CATEGORY_KEYS" => Some("business, computer,,business".into()),
            "BOOKRANK_PERIOD_TYPES" => Some("daily,biannual,weekly".into()),
            _ => None,
        });
        assert_eq!(config.period_types, vec![PeriodType::Daily, PeriodType::Weekly]);
        let keys: Vec<String> = config
            .scheduler_config()
            .job_keys()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            keys,
            vec!["business-daily", "business-weekly", "computer-daily", "computer-weekly"]
        );
        assert_eq!(config.scheduler_config().concurrency_limit(), 4);
    }

    #[test]
    fn config_defaults_apply_without_env() {
        let config = SyncConfig::from_vars(|_| None);
        assert_eq!(config.database_url, "sqlite://bookrank.db");
        assert_eq!(config.tick_interval, Duration::from_secs(3600));
        assert_eq!(config.category_keys, vec!["business", "computer", "all"]);
        assert_eq!(config.source, SourceKind::Rakuten);
        assert_eq!(config.http_timeout_secs, 30);
        assert!(config.genres_file.is_none());
        assert!(build_source(&config).is_err());

        let fixture = SyncConfig::from_vars(|key| (key == "BOOKRANK_SOURCE").then(|| "fixture".into()));
        assert_eq!(fixture.source, SourceKind::Fixture);
        assert_eq!(build_source(&fixture).expect("fixture source").site().name, "rakuten");
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    #[tokio::test]
    async fn fixture_source_ingests_across_categories_and_periods() {
        let (_dir, repo) = repo().await;
        let root = workspace_root();
        let genres = load_genre_registry(Some(&root.join("fixtures/genres.yaml")))
            .await
            .expect("genres");
        let source = FixtureRankingSource::new(root.join("fixtures"), rakuten_books_site(""));
        let service = IngestionService::new(Arc::new(repo.clone()), Arc::new(source), genres);

        let daily = service
            .run_at("business", PeriodType::Daily, fixed_now())
            .await
            .expect("business daily");
        let weekly = service
            .run_at("business", PeriodType::Weekly, fixed_now())
            .await
            .expect("business weekly");
        let computer = service
            .run_at("computer", PeriodType::Daily, fixed_now())
            .await
            .expect("computer daily");

        assert_eq!((daily.rankings_written, weekly.rankings_written, computer.rankings_written), (3, 2, 2));
        let after = counts(&repo).await;
        assert_eq!(after.sites, 1);
        assert_eq!(after.categories, 2);
        assert_eq!(after.site_category_mappings, 2);
        assert_eq!(after.books, 5);
        assert_eq!(after.book_site_mappings, 5);
        assert_eq!(after.rankings, 7);

        let category = repo
            .find_category("Rakuten Books computer", None)
            .await
            .unwrap()
            .expect("category");
        let page = repo
            .top_rankings(category, PeriodType::Daily, 10)
            .await
            .unwrap()
            .expect("page");
        assert_eq!(page.books[0].title, "Rustプログラミング入門");
        assert_eq!(page.books[1].rank, 2);
    }

    #[tokio::test]
    async fn genre_registry_loads_from_yaml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("genres.yaml");
        std::fs::write(&path, "genres:\n  business: 200166\n  novels: \"001004008\"\n").unwrap();

        let registry = load_genre_registry(Some(&path)).await.expect("registry");
        assert_eq!(registry.resolve("business"), Some("200166"));
        assert_eq!(registry.resolve("novels"), Some("001004008"));
        assert_eq!(registry.len(), 2);

        let builtin = load_genre_registry(None).await.expect("builtin");
        assert_eq!(builtin.resolve("computer"), Some("200167"));
    }
}
