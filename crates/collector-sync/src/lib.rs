//! Ingestion pipeline: source registry, paginated fetch, dedup, scheduled runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use collector_adapters::{adapter_for_kind, AdapterContext, PageCursor, SourceAdapter, SourceKind};
use collector_core::{
    CanonicalItem, FailureStage, FetchFailure, FetchFailureKind, IngestionResult, RunFailure,
    RunTrigger,
};
use collector_storage::{
    connect_pg, validate_collection_name, FetchError, HttpClientConfig, HttpFetcher, ItemStore,
    MemoryItemStore, PgItemStore, StoreError, TokenBucketConfig,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "collector-sync";

pub const DEFAULT_SOURCES_PATH: &str = "./sources.yaml";

const TEMPLATE_PLACEHOLDERS: [&str; 5] = ["api_key", "cursor", "page_size", "from", "to"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {name} is required")]
    MissingEnv { name: String },
    #[error("environment variable {name} has invalid value `{value}`: {reason}")]
    InvalidEnv {
        name: String,
        value: String,
        reason: String,
    },
    #[error("source `{source_id}` needs its credential in environment variable {env}")]
    MissingCredential { source_id: String, env: String },
    #[error("source registry {path}: {reason}")]
    Registry { path: String, reason: String },
    #[error("source `{source_id}`: {reason}")]
    InvalidSource { source_id: String, reason: String },
    #[error("unknown source `{0}`")]
    UnknownSource(String),
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    10
}

fn default_target_count() -> usize {
    100
}

fn default_interval_minutes() -> u64 {
    60
}

fn default_max_pages() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: SourceKind,
    pub endpoint_template: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub collection: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_target_count")]
    pub target_count: usize,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub window_days: Option<i64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub min_request_interval_ms: u64,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn fetch_plan(&self) -> FetchPlan {
        FetchPlan {
            page_size: self.page_size,
            target_count: self.target_count,
            max_pages: self.max_pages,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidSource {
            source_id: self.source_id.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_collection_name(&self.collection).map_err(|e| self.invalid(e.to_string()))?;
        if self.page_size == 0 {
            return Err(self.invalid("page_size must be at least 1"));
        }
        if self.target_count == 0 {
            return Err(self.invalid("target_count must be at least 1"));
        }
        if self.interval_minutes == 0 {
            return Err(self.invalid("interval_minutes must be at least 1"));
        }
        if self.max_pages == 0 {
            return Err(self.invalid("max_pages must be at least 1"));
        }

        let placeholders = template_placeholders(&self.endpoint_template);
        if let Some(unknown) = placeholders
            .iter()
            .find(|p| !TEMPLATE_PLACEHOLDERS.contains(p))
        {
            return Err(self.invalid(format!("unknown endpoint placeholder `{{{unknown}}}`")));
        }
        if !placeholders.contains(&"cursor") {
            return Err(self.invalid("endpoint_template must contain `{cursor}`"));
        }
        if placeholders.contains(&"api_key") && self.api_key_env.is_none() {
            return Err(self.invalid("endpoint uses `{api_key}` but api_key_env is not set"));
        }
        if (placeholders.contains(&"from") || placeholders.contains(&"to"))
            && self.window_days.is_none()
        {
            return Err(self.invalid("endpoint uses `{from}`/`{to}` but window_days is not set"));
        }
        Ok(())
    }
}

/// Names inside `{...}` in an endpoint template, in order of appearance.
fn template_placeholders(template: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else { break };
        out.push(&after[..close]);
        rest = &after[close + 1..];
    }
    out
}

/// Substitutes each `{name}` with its percent-encoded value.
fn expand_template(template: &str, values: &[(&str, String)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{{name}}}"), &urlencoding::encode(value))
        })
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Registry {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;
        registry.validate(origin)?;
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Registry {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    fn validate(&self, origin: &str) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(ConfigError::Registry {
                    path: origin.to_string(),
                    reason: format!("duplicate source_id `{}`", source.source_id),
                });
            }
            source.validate()?;
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Reads each enabled source's credential, failing on the first one absent.
    pub fn resolve_credentials(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<HashMap<String, String>, ConfigError> {
        let mut out = HashMap::new();
        for source in self.enabled() {
            let Some(env) = &source.api_key_env else {
                continue;
            };
            let value = lookup(env)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingCredential {
                    source_id: source.source_id.clone(),
                    env: env.clone(),
                })?;
            out.insert(source.source_id.clone(), value);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String },
    Memory,
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Postgres { .. } => "postgres",
            StoreBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreBackend,
    pub sources_path: PathBuf,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(name).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "TRUE" | "True" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "False" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidEnv {
            name: name.to_string(),
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn sources_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("COLLECTOR_SOURCES")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCES_PATH))
}

/// Registry location alone, for commands that never touch the store.
pub fn sources_path_from_env() -> PathBuf {
    sources_path(&|name: &str| std::env::var(name).ok())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store = match lookup("COLLECTOR_STORE").as_deref().map(str::trim) {
            None | Some("postgres") => StoreBackend::Postgres {
                database_url: lookup("DATABASE_URL")
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| ConfigError::MissingEnv {
                        name: "DATABASE_URL".to_string(),
                    })?,
            },
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidEnv {
                    name: "COLLECTOR_STORE".to_string(),
                    value: other.to_string(),
                    reason: "expected `postgres` or `memory`".to_string(),
                })
            }
        };

        Ok(Self {
            store,
            sources_path: sources_path(&lookup),
            scheduler_enabled: parse_flag(&lookup, "COLLECTOR_SCHEDULER_ENABLED", true)?,
            user_agent: lookup("COLLECTOR_USER_AGENT")
                .unwrap_or_else(|| "collector-bot/0.1".to_string()),
            http_timeout_secs: parse_env(&lookup, "COLLECTOR_HTTP_TIMEOUT_SECS", 20u64)?,
            web_port: parse_env(&lookup, "COLLECTOR_WEB_PORT", 8000u16)?,
        })
    }
}

/// One page request against an upstream API.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        cursor: PageCursor,
    ) -> Result<JsonValue, FetchFailure>;
}

pub struct HttpPageSource {
    http: Arc<HttpFetcher>,
    endpoint_template: String,
    api_key: Option<String>,
    page_size: u32,
    window_days: Option<i64>,
}

impl HttpPageSource {
    pub fn new(http: Arc<HttpFetcher>, source: &SourceConfig, api_key: Option<String>) -> Self {
        Self {
            http,
            endpoint_template: source.endpoint_template.clone(),
            api_key,
            page_size: source.page_size,
            window_days: source.window_days,
        }
    }

    pub fn page_url(&self, ctx: &AdapterContext, cursor: PageCursor) -> Result<String, FetchFailure> {
        let to = ctx.fetched_at;
        let from = to - chrono::Duration::days(self.window_days.unwrap_or(0));
        let expanded = expand_template(
            &self.endpoint_template,
            &[
                ("api_key", self.api_key.clone().unwrap_or_default()),
                ("cursor", cursor.value().to_string()),
                ("page_size", self.page_size.to_string()),
                ("from", from.format("%Y-%m-%d").to_string()),
                ("to", to.format("%Y-%m-%d").to_string()),
            ],
        );
        reqwest::Url::parse(&expanded)
            .map(String::from)
            .map_err(|e| FetchFailure {
                kind: FetchFailureKind::Transport,
                status: None,
                cursor: cursor.value(),
                message: format!("invalid endpoint url: {e}"),
            })
    }
}

fn fetch_failure_from(err: &FetchError, cursor: u32) -> FetchFailure {
    let (kind, status) = match err {
        _ if err.is_timeout() => (FetchFailureKind::Timeout, None),
        FetchError::HttpStatus { status, .. } => (FetchFailureKind::HttpStatus, Some(*status)),
        FetchError::Decode(_) => (FetchFailureKind::Payload, None),
        FetchError::Request { .. } => (FetchFailureKind::Transport, None),
    };
    FetchFailure {
        kind,
        status,
        cursor,
        message: err.to_string(),
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        cursor: PageCursor,
    ) -> Result<JsonValue, FetchFailure> {
        let url = self.page_url(ctx, cursor)?;
        self.http
            .fetch_json(ctx.run_id, &ctx.source_id, &url)
            .await
            .map_err(|err| fetch_failure_from(&err, cursor.value()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub page_size: u32,
    pub target_count: usize,
    pub max_pages: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub items: Vec<CanonicalItem>,
    pub pages: usize,
    pub skipped_malformed: usize,
    pub failure: Option<FetchFailure>,
}

/// Walks pages until the target count, an empty page, or a failure.
///
/// A failure keeps every item gathered before it. Malformed records are skipped one by
/// one; the rest of their page still counts.
pub async fn fetch_all(
    source: &dyn PageSource,
    adapter: &dyn SourceAdapter,
    plan: FetchPlan,
    ctx: &AdapterContext,
) -> FetchOutcome {
    let mut outcome = FetchOutcome::default();
    let mut cursor = PageCursor::first(adapter.cursor_style());

    loop {
        if outcome.items.len() >= plan.target_count {
            outcome.items.truncate(plan.target_count);
            debug!(target_count = plan.target_count, "target count reached");
            break;
        }
        if outcome.pages >= plan.max_pages {
            warn!(
                pages = outcome.pages,
                collected = outcome.items.len(),
                "page budget exhausted before target count"
            );
            break;
        }

        let payload = match source.fetch_page(ctx, cursor).await {
            Ok(payload) => payload,
            Err(failure) => {
                warn!(cursor = failure.cursor, kind = ?failure.kind, error = %failure.message, "page fetch failed; keeping partial results");
                outcome.failure = Some(failure);
                break;
            }
        };
        outcome.pages += 1;

        let records = match adapter.extract_records(&payload) {
            Ok(records) => records,
            Err(err) => {
                warn!(cursor = cursor.value(), error = %err, "unusable page payload");
                outcome.failure = Some(FetchFailure {
                    kind: FetchFailureKind::Payload,
                    status: None,
                    cursor: cursor.value(),
                    message: err.to_string(),
                });
                break;
            }
        };
        if records.is_empty() {
            debug!(cursor = cursor.value(), "empty page; source exhausted");
            break;
        }

        for raw in records {
            match adapter.normalize(raw, ctx) {
                Ok(item) => outcome.items.push(item),
                Err(err) => {
                    outcome.skipped_malformed += 1;
                    warn!(cursor = cursor.value(), error = %err, "skipping malformed record");
                }
            }
        }
        cursor.advance(plan.page_size);
    }

    outcome
}

/// Keeps candidates whose title is not yet stored, preserving order.
///
/// A title repeated inside the batch is kept only at its first occurrence.
pub async fn filter_new(
    candidates: Vec<CanonicalItem>,
    store: &dyn ItemStore,
) -> Result<Vec<CanonicalItem>, StoreError> {
    let mut seen = HashSet::with_capacity(candidates.len());
    let mut fresh = Vec::with_capacity(candidates.len());
    for item in candidates {
        if !seen.insert(item.title.clone()) {
            debug!(title = %item.title, "duplicate title within batch");
            continue;
        }
        if store.exists_by_title(&item.title).await? {
            continue;
        }
        fresh.push(item);
    }
    Ok(fresh)
}

/// Fetch → normalize → dedup → insert for one configured source.
///
/// Runs never overlap: on-demand runs wait for the one in flight, scheduled ticks that
/// find a run in flight are skipped.
pub struct IngestionJob {
    source: SourceConfig,
    adapter: Box<dyn SourceAdapter>,
    page_source: Box<dyn PageSource>,
    store: Arc<dyn ItemStore>,
    run_lock: Mutex<()>,
    last_result: RwLock<Option<IngestionResult>>,
}

impl IngestionJob {
    pub fn new(
        source: SourceConfig,
        adapter: Box<dyn SourceAdapter>,
        page_source: Box<dyn PageSource>,
        store: Arc<dyn ItemStore>,
    ) -> Self {
        Self {
            source,
            adapter,
            page_source,
            store,
            run_lock: Mutex::new(()),
            last_result: RwLock::new(None),
        }
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    pub fn source_id(&self) -> &str {
        &self.source.source_id
    }

    pub fn store(&self) -> Arc<dyn ItemStore> {
        Arc::clone(&self.store)
    }

    pub fn interval(&self) -> Duration {
        self.source.interval()
    }

    pub async fn last_result(&self) -> Option<IngestionResult> {
        self.last_result.read().await.clone()
    }

    pub async fn run_once(&self, trigger: RunTrigger) -> IngestionResult {
        let _guard = self.run_lock.lock().await;
        self.run_locked(trigger).await
    }

    /// Returns `None` when another run holds the lock.
    pub async fn run_scheduled(&self) -> Option<IngestionResult> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            info!(source_id = %self.source.source_id, "previous run still in flight; skipping scheduled tick");
            return None;
        };
        Some(self.run_locked(RunTrigger::Scheduled).await)
    }

    async fn run_locked(&self, trigger: RunTrigger) -> IngestionResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ctx = AdapterContext {
            run_id,
            source_id: self.source.source_id.clone(),
            fetched_at: started_at,
            category: self.source.category.clone(),
        };
        let span = info_span!(
            "ingestion_run",
            %run_id,
            source_id = %self.source.source_id,
            trigger = ?trigger
        );

        async {
            info!(store = self.store.backend(), "ingestion run started");
            let outcome = fetch_all(
                self.page_source.as_ref(),
                self.adapter.as_ref(),
                self.source.fetch_plan(),
                &ctx,
            )
            .await;

            let fetched = outcome.items.len();
            let mut failure = outcome.failure.map(RunFailure::from_fetch);
            let inserted = match self.store_new(outcome.items).await {
                Ok(inserted) => inserted,
                Err(err) => {
                    error!(error = %err, "store failure; aborting run");
                    failure = Some(RunFailure {
                        stage: FailureStage::Store,
                        message: err.to_string(),
                        fetch: failure.and_then(|f| f.fetch),
                    });
                    0
                }
            };

            let result = IngestionResult {
                run_id,
                source_id: self.source.source_id.clone(),
                trigger,
                started_at,
                finished_at: Utc::now(),
                pages: outcome.pages,
                fetched,
                skipped_malformed: outcome.skipped_malformed,
                inserted,
                failure,
            };
            if result.is_success() {
                info!(
                    pages = result.pages,
                    fetched = result.fetched,
                    inserted = result.inserted,
                    skipped_malformed = result.skipped_malformed,
                    "ingestion run finished"
                );
            } else {
                warn!(
                    pages = result.pages,
                    fetched = result.fetched,
                    inserted = result.inserted,
                    "ingestion run finished with failure"
                );
            }
            *self.last_result.write().await = Some(result.clone());
            result
        }
        .instrument(span)
        .await
    }

    async fn store_new(&self, items: Vec<CanonicalItem>) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        let candidates = items.len();
        let fresh = filter_new(items, self.store.as_ref()).await?;
        if fresh.is_empty() {
            debug!(candidates, "no new items");
            return Ok(0);
        }
        let inserted = self.store.insert_many(&fresh).await?;
        debug!(candidates, fresh = fresh.len(), inserted, "inserted new items");
        Ok(inserted)
    }
}

/// Process-wide handles built once at startup and shared by the scheduler and the web layer.
pub struct CollectorContext {
    config: SyncConfig,
    jobs: BTreeMap<String, Arc<IngestionJob>>,
    pg_pool: Option<PgPool>,
}

impl CollectorContext {
    pub fn new(config: SyncConfig, jobs: Vec<IngestionJob>) -> Self {
        Self {
            config,
            jobs: jobs
                .into_iter()
                .map(|job| (job.source_id().to_string(), Arc::new(job)))
                .collect(),
            pg_pool: None,
        }
    }

    /// Wires every enabled source to its store, adapter and HTTP page source.
    pub fn assemble(
        config: SyncConfig,
        registry: &SourceRegistry,
        credentials: &HashMap<String, String>,
        pg_pool: Option<PgPool>,
    ) -> Result<Self> {
        let source_pacing = registry
            .enabled()
            .filter(|s| s.min_request_interval_ms > 0)
            .map(|s| {
                (
                    s.source_id.clone(),
                    TokenBucketConfig::min_interval(Duration::from_millis(
                        s.min_request_interval_ms,
                    )),
                )
            })
            .collect();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            source_pacing,
        })?);

        let mut stores: HashMap<String, Arc<dyn ItemStore>> = HashMap::new();
        let mut jobs = Vec::new();
        for source in registry.enabled() {
            let store = match stores.get(&source.collection) {
                Some(store) => Arc::clone(store),
                None => {
                    let store: Arc<dyn ItemStore> = match (&config.store, &pg_pool) {
                        (StoreBackend::Memory, _) => Arc::new(MemoryItemStore::new()),
                        (StoreBackend::Postgres { .. }, Some(pool)) => {
                            Arc::new(PgItemStore::new(pool.clone(), &source.collection)?)
                        }
                        (StoreBackend::Postgres { .. }, None) => {
                            anyhow::bail!("postgres store selected but no connection pool given")
                        }
                    };
                    stores.insert(source.collection.clone(), Arc::clone(&store));
                    store
                }
            };
            let page_source = HttpPageSource::new(
                Arc::clone(&http),
                source,
                credentials.get(&source.source_id).cloned(),
            );
            jobs.push(IngestionJob::new(
                source.clone(),
                adapter_for_kind(source.kind),
                Box::new(page_source),
                store,
            ));
        }

        let mut ctx = Self::new(config, jobs);
        ctx.pg_pool = pg_pool;
        Ok(ctx)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn job(&self, source_id: &str) -> Option<&Arc<IngestionJob>> {
        self.jobs.get(source_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<IngestionJob>> {
        self.jobs.values()
    }

    /// On-demand run; waits for an in-flight run of the same source first.
    pub async fn trigger_ingestion_now(
        &self,
        source_id: &str,
    ) -> Result<IngestionResult, ConfigError> {
        let job = self
            .job(source_id)
            .ok_or_else(|| ConfigError::UnknownSource(source_id.to_string()))?;
        Ok(job.run_once(RunTrigger::OnDemand).await)
    }

    pub async fn run_all_once(&self, trigger: RunTrigger) -> Vec<IngestionResult> {
        let mut results = Vec::with_capacity(self.jobs.len());
        for job in self.jobs.values() {
            results.push(job.run_once(trigger).await);
        }
        results
    }

    /// Creates one table per distinct collection. No-op for the memory store.
    pub async fn migrate(&self) -> Result<Vec<String>> {
        let Some(pool) = &self.pg_pool else {
            info!("memory store selected; nothing to migrate");
            return Ok(Vec::new());
        };
        let mut done = Vec::new();
        for job in self.jobs.values() {
            let collection = &job.source().collection;
            if done.contains(collection) {
                continue;
            }
            PgItemStore::new(pool.clone(), collection)?
                .migrate()
                .await
                .with_context(|| format!("migrating collection {collection}"))?;
            info!(collection = %collection, "collection table ready");
            done.push(collection.clone());
        }
        Ok(done)
    }
}

/// Loads the registry, validates credentials and connects the store.
pub async fn bootstrap(config: SyncConfig) -> Result<CollectorContext> {
    let registry = SourceRegistry::load(&config.sources_path)?;
    let credentials = registry.resolve_credentials(|name| std::env::var(name).ok())?;
    let pg_pool = match &config.store {
        StoreBackend::Postgres { database_url } => Some(connect_pg(database_url).await?),
        StoreBackend::Memory => None,
    };
    info!(
        sources = registry.enabled().count(),
        store = config.store.name(),
        "collector context ready"
    );
    CollectorContext::assemble(config, &registry, &credentials, pg_pool)
}

pub async fn run_ingestion_once_from_env(source_id: Option<&str>) -> Result<Vec<IngestionResult>> {
    let config = SyncConfig::from_env()?;
    let ctx = bootstrap(config).await?;
    match source_id {
        Some(id) => Ok(vec![ctx.trigger_ingestion_now(id).await?]),
        None => Ok(ctx.run_all_once(RunTrigger::OnDemand).await),
    }
}

async fn run_scheduled_guarded(job: Arc<IngestionJob>) {
    let source_id = job.source_id().to_string();
    if let Err(err) = tokio::spawn(async move { job.run_scheduled().await }).await {
        error!(source_id = %source_id, error = %err, "scheduled ingestion run panicked");
    }
}

/// One repeated job per source at its configured interval, or `None` when disabled.
pub async fn maybe_build_scheduler(ctx: Arc<CollectorContext>) -> Result<Option<JobScheduler>> {
    if !ctx.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for job in ctx.jobs() {
        let interval = job.interval();
        let source_id = job.source_id().to_string();
        let job = Arc::clone(job);
        let scheduled = Job::new_repeated_async(interval, move |_uuid, _l| {
            let job = Arc::clone(&job);
            Box::pin(async move {
                run_scheduled_guarded(job).await;
            })
        })
        .with_context(|| format!("creating scheduler job for {source_id}"))?;
        sched.add(scheduled).await.context("adding scheduler job")?;
        info!(source_id = %source_id, interval_secs = interval.as_secs(), "ingestion scheduled");
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const REGISTRY: &str = r#"
sources:
  - source_id: headlines
    display_name: Top headlines
    kind: newsapi
    endpoint_template: "https://newsapi.test/v2/top-headlines?country=us&page={cursor}&pageSize={page_size}&apiKey={api_key}"
    api_key_env: NEWSAPI_KEY
    collection: headlines
    interval_minutes: 5
    category: General
  - source_id: springer
    display_name: Springer open access
    kind: springer
    endpoint_template: "https://springer.test/openaccess/json?api_key={api_key}&q=onlinedate:{from} TO {to}&p={cursor}&s={page_size}"
    api_key_env: SPRINGER_API_KEY
    collection: scientific_collection
    window_days: 60
  - source_id: scholar
    display_name: Scholar mirror
    enabled: false
    kind: scholar
    endpoint_template: "https://scholar.test/search?start={cursor}"
    collection: scientific_collection
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn registry_parses_with_defaults() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY, "inline").unwrap();
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(registry.enabled().count(), 2);
        let springer = &registry.sources[1];
        assert_eq!(springer.kind, SourceKind::Springer);
        assert_eq!(springer.page_size, 10);
        assert_eq!(springer.target_count, 100);
        assert_eq!(springer.interval(), Duration::from_secs(3600));
        assert_eq!(registry.sources[0].interval(), Duration::from_secs(300));
    }

    #[test]
    fn registry_rejects_bad_collection_and_placeholders() {
        let bad_collection = REGISTRY.replace("collection: headlines", "collection: head-lines");
        assert!(matches!(
            SourceRegistry::from_yaml_str(&bad_collection, "inline"),
            Err(ConfigError::InvalidSource { .. })
        ));

        let no_window = REGISTRY.replace("    window_days: 60\n", "");
        let err = SourceRegistry::from_yaml_str(&no_window, "inline").unwrap_err();
        assert!(err.to_string().contains("window_days"));

        let unknown = REGISTRY.replace("country=us", "country={country}");
        let err = SourceRegistry::from_yaml_str(&unknown, "inline").unwrap_err();
        assert!(err.to_string().contains("{country}"));

        let duplicate = REGISTRY.replace("source_id: springer", "source_id: headlines");
        assert!(matches!(
            SourceRegistry::from_yaml_str(&duplicate, "inline"),
            Err(ConfigError::Registry { .. })
        ));
    }

    #[test]
    fn missing_credentials_fail_fast_for_enabled_sources_only() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY, "inline").unwrap();
        let err = registry
            .resolve_credentials(env(&[("NEWSAPI_KEY", "abc")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingCredential { env: ref name, .. } if name == "SPRINGER_API_KEY"
        ));

        let creds = registry
            .resolve_credentials(env(&[("NEWSAPI_KEY", "abc"), ("SPRINGER_API_KEY", "def")]))
            .unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds["springer"], "def");
    }

    #[test]
    fn sync_config_requires_database_url_for_postgres() {
        assert!(matches!(
            SyncConfig::from_lookup(env(&[])),
            Err(ConfigError::MissingEnv { .. })
        ));

        let config = SyncConfig::from_lookup(env(&[
            ("DATABASE_URL", "postgres://c:c@localhost/c"),
            ("COLLECTOR_SCHEDULER_ENABLED", "false"),
            ("COLLECTOR_HTTP_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert!(!config.scheduler_enabled);
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.web_port, 8000);

        let memory = SyncConfig::from_lookup(env(&[("COLLECTOR_STORE", "memory")])).unwrap();
        assert_eq!(memory.store, StoreBackend::Memory);
        assert!(memory.scheduler_enabled);

        assert!(matches!(
            SyncConfig::from_lookup(env(&[
                ("COLLECTOR_STORE", "memory"),
                ("COLLECTOR_WEB_PORT", "eighty")
            ])),
            Err(ConfigError::InvalidEnv { .. })
        ));
    }

    #[test]
    fn page_urls_expand_cursor_window_and_key() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY, "inline").unwrap();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let source = HttpPageSource::new(http, &registry.sources[1], Some("k3y".into()));
        let ctx = AdapterContext {
            run_id: Uuid::nil(),
            source_id: "springer".into(),
            fetched_at: Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).single().unwrap(),
            category: None,
        };
        let mut cursor = PageCursor::first(adapter_for_kind(SourceKind::Springer).cursor_style());
        cursor.advance(10);
        let url = source.page_url(&ctx, cursor).unwrap();
        assert!(url.starts_with("https://springer.test/openaccess/json?api_key=k3y"));
        assert!(url.contains("onlinedate:2026-08-17%20TO%202026-10-16"));
        assert!(url.ends_with("&p=11&s=10"));
    }

    #[test]
    fn shipped_registry_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(path).unwrap();
        let enabled = registry.enabled().map(|s| s.kind).collect::<Vec<_>>();
        assert_eq!(enabled, vec![SourceKind::NewsApi, SourceKind::Springer]);
        assert_eq!(registry.sources[0].interval(), Duration::from_secs(5 * 60));
    }

    #[test]
    fn substituted_values_are_percent_encoded() {
        let url = expand_template(
            "https://x.test/top?page={cursor}&apiKey={api_key}",
            &[("cursor", "3".to_string()), ("api_key", "a&b#c d".to_string())],
        );
        assert_eq!(url, "https://x.test/top?page=3&apiKey=a%26b%23c%20d");
    }

    #[test]
    fn template_placeholders_are_listed_in_order() {
        assert_eq!(
            template_placeholders("https://x.test/?a={api_key}&p={cursor}&s={page_size}"),
            vec!["api_key", "cursor", "page_size"]
        );
        assert!(template_placeholders("https://x.test/plain").is_empty());
    }

    #[tokio::test]
    async fn assemble_shares_stores_between_sources_of_one_collection() {
        let registry = SourceRegistry::from_yaml_str(
            &REGISTRY.replace("enabled: false", "enabled: true"),
            "inline",
        )
        .unwrap();
        let creds = registry
            .resolve_credentials(env(&[("NEWSAPI_KEY", "a"), ("SPRINGER_API_KEY", "b")]))
            .unwrap();
        let config = SyncConfig::from_lookup(env(&[("COLLECTOR_STORE", "memory")])).unwrap();
        let ctx = CollectorContext::assemble(config, &registry, &creds, None).unwrap();
        assert_eq!(ctx.jobs().count(), 3);

        let springer = ctx.job("springer").unwrap().store();
        let scholar = ctx.job("scholar").unwrap().store();
        let headlines = ctx.job("headlines").unwrap().store();
        assert!(Arc::ptr_eq(&springer, &scholar));
        assert!(!Arc::ptr_eq(&springer, &headlines));
        assert!(ctx.migrate().await.unwrap().is_empty());

        assert!(matches!(
            ctx.trigger_ingestion_now("nope").await,
            Err(ConfigError::UnknownSource(_))
        ));
    }
}
