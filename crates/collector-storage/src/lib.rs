//! Item persistence + HTTP fetch utilities for the collector.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use collector_core::{Abstract, CanonicalItem, ItemKind};
use reqwest::header::ACCEPT;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "collector-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid collection name `{0}`: expected [a-z_][a-z0-9_]*")]
    InvalidCollection(String),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Read query over a collection, always keyed on `published_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub order: SortOrder,
    pub skip: usize,
    pub limit: usize,
}

impl PageQuery {
    pub fn newest(skip: usize, limit: usize) -> Self {
        Self {
            order: SortOrder::NewestFirst,
            skip,
            limit,
        }
    }
}

/// Persistent collection of canonical items.
///
/// `insert_many` must enforce title uniqueness on its own and return the number of
/// rows actually added; callers still filter with `exists_by_title` first.
#[async_trait]
pub trait ItemStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn exists_by_title(&self, title: &str) -> Result<bool, StoreError>;

    async fn insert_many(&self, items: &[CanonicalItem]) -> Result<usize, StoreError>;

    async fn query_page(&self, query: PageQuery) -> Result<Vec<CanonicalItem>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Case-insensitive substring match on title, newest first.
    async fn search_titles(&self, needle: &str, limit: usize)
        -> Result<Vec<CanonicalItem>, StoreError>;
}

pub fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_head && valid_tail && name.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

fn sort_items(items: &mut [CanonicalItem], order: SortOrder) {
    items.sort_by(|a, b| {
        let by_time = match order {
            SortOrder::NewestFirst => b.published_at.cmp(&a.published_at),
            SortOrder::OldestFirst => a.published_at.cmp(&b.published_at),
        };
        by_time.then_with(|| a.title.cmp(&b.title))
    });
}

#[derive(Debug, Default)]
struct MemoryState {
    items: Vec<CanonicalItem>,
    titles: HashSet<String>,
}

/// In-process store used for `COLLECTOR_STORE=memory` and tests.
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    state: RwLock<MemoryState>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<CanonicalItem> {
        self.state.read().await.items.clone()
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn exists_by_title(&self, title: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().await.titles.contains(title))
    }

    async fn insert_many(&self, items: &[CanonicalItem]) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for item in items {
            if state.titles.insert(item.title.clone()) {
                state.items.push(item.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn query_page(&self, query: PageQuery) -> Result<Vec<CanonicalItem>, StoreError> {
        let mut items = self.state.read().await.items.clone();
        sort_items(&mut items, query.order);
        Ok(items
            .into_iter()
            .skip(query.skip)
            .take(query.limit)
            .collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.items.len())
    }

    async fn search_titles(
        &self,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalItem>, StoreError> {
        let needle = needle.to_lowercase();
        let mut items = self
            .state
            .read()
            .await
            .items
            .iter()
            .filter(|item| item.title.to_lowercase().contains(&needle))
            .cloned()
            .collect::<Vec<_>>();
        sort_items(&mut items, SortOrder::NewestFirst);
        items.truncate(limit);
        Ok(items)
    }
}

pub async fn connect_pg(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

/// Postgres-backed collection: one table per collection name.
#[derive(Debug, Clone)]
pub struct PgItemStore {
    pool: PgPool,
    table: String,
}

const ITEM_COLUMNS: &str = "id, source_id, kind, title, author, published_at, url, \
                            secondary_url, publisher, category, abstract_json, ingested_at";

impl PgItemStore {
    pub fn new(pool: PgPool, collection: &str) -> Result<Self, StoreError> {
        validate_collection_name(collection)?;
        Ok(Self {
            pool,
            table: collection.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_table_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id            UUID PRIMARY KEY,
                source_id     TEXT NOT NULL,
                kind          TEXT NOT NULL,
                title         TEXT NOT NULL UNIQUE,
                author        TEXT NOT NULL,
                published_at  TIMESTAMPTZ NOT NULL,
                url           TEXT NOT NULL,
                secondary_url TEXT,
                publisher     TEXT NOT NULL,
                category      TEXT NOT NULL,
                abstract_json JSONB,
                ingested_at   TIMESTAMPTZ NOT NULL
            )
            "#,
            table = self.table
        )
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(&self.create_table_sql())
            .execute(&self.pool)
            .await?;
        let index_sql = format!(
            "CREATE INDEX IF NOT EXISTS {table}_published_at_idx ON {table} (published_at DESC)",
            table = self.table
        );
        sqlx::query(&index_sql).execute(&self.pool).await?;
        Ok(())
    }
}

fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for ch in needle.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

fn row_to_item(row: &PgRow) -> Result<CanonicalItem, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = kind.parse::<ItemKind>().map_err(StoreError::Corrupt)?;
    let abstract_json: Option<JsonValue> = row.try_get("abstract_json")?;
    let abstract_text = abstract_json
        .map(serde_json::from_value::<Abstract>)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("abstract_json: {e}")))?;
    Ok(CanonicalItem {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        kind,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        published_at: row.try_get("published_at")?,
        url: row.try_get("url")?,
        secondary_url: row.try_get("secondary_url")?,
        publisher: row.try_get("publisher")?,
        category: row.try_get("category")?,
        abstract_text,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn clamp_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl ItemStore for PgItemStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn exists_by_title(&self, title: &str) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE title = $1) AS present",
            self.table
        );
        let row = sqlx::query(&sql).bind(title).fetch_one(&self.pool).await?;
        Ok(row.try_get("present")?)
    }

    async fn insert_many(&self, items: &[CanonicalItem]) -> Result<usize, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            r#"
            INSERT INTO {table} ({ITEM_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING
            "#,
            table = self.table
        );
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for item in items {
            let abstract_json = item
                .abstract_text
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| StoreError::Corrupt(format!("abstract_json: {e}")))?;
            let result = sqlx::query(&sql)
                .bind(item.id)
                .bind(&item.source_id)
                .bind(item.kind.as_str())
                .bind(&item.title)
                .bind(&item.author)
                .bind(item.published_at)
                .bind(&item.url)
                .bind(item.secondary_url.as_deref())
                .bind(&item.publisher)
                .bind(&item.category)
                .bind(abstract_json)
                .bind(item.ingested_at)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted as usize)
    }

    async fn query_page(&self, query: PageQuery) -> Result<Vec<CanonicalItem>, StoreError> {
        let direction = match query.order {
            SortOrder::NewestFirst => "DESC",
            SortOrder::OldestFirst => "ASC",
        };
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM {table} ORDER BY published_at {direction}, title ASC OFFSET $1 LIMIT $2",
            table = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(clamp_i64(query.skip))
            .bind(clamp_i64(query.limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}", self.table);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }

    async fn search_titles(
        &self,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalItem>, StoreError> {
        let sql = format!(
            r"SELECT {ITEM_COLUMNS} FROM {table} WHERE title ILIKE $1 ESCAPE '\' ORDER BY published_at DESC, title ASC LIMIT $2",
            table = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(escape_like(needle))
            .bind(clamp_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// One request per `interval`, no bursting.
    pub fn min_interval(interval: Duration) -> Self {
        Self {
            capacity: 1,
            refill_every: interval,
        }
    }
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub source_pacing: HashMap<String, TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            source_pacing: HashMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Carries no URL; the request URL holds credentials in its query string.
    #[error("request failed for {url}: {inner}")]
    Request { inner: reqwest::Error, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request { inner, .. } if inner.is_timeout())
    }
}

/// Drop the query string from a URL before it reaches logs or errors.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_string(),
    }
}

/// JSON-over-HTTP client with a per-request timeout and optional per-source pacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacing: HashMap<String, Arc<SimpleTokenBucket>>,
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
        let pacing = config
            .source_pacing
            .iter()
            .map(|(source_id, c)| {
                (
                    source_id.clone(),
                    Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)),
                )
            })
            .collect();

        Ok(Self { client, pacing })
    }

    pub async fn fetch_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<JsonValue, FetchError> {
        if let Some(bucket) = self.pacing.get(source_id) {
            bucket.take().await;
        }

        let redacted = redact_query(url);
        let span = info_span!("http_fetch", %run_id, source_id, url = %redacted);

        async move {
            let request_failed = |err: reqwest::Error| FetchError::Request {
                inner: err.without_url(),
                url: redacted.clone(),
            };
            let resp = self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .send()
                .await
                .map_err(request_failed)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: redacted.clone(),
                });
            }
            let body = resp.bytes().await.map_err(request_failed)?;
            debug!(status = status.as_u16(), bytes = body.len(), "page fetched");
            Ok(serde_json::from_slice(&body)?)
        }
        .instrument(span)
        .await
    }
}
