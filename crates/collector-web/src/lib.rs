//! Axum JSON API over the collected items and the on-demand ingestion trigger.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use collector_core::{CanonicalItem, IngestionResult};
use collector_storage::{ItemStore, PageQuery};
use collector_sync::{CollectorContext, IngestionJob};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "collector-web";

pub const DEFAULT_PER_PAGE: usize = 5;
pub const MAX_PER_PAGE: usize = 100;
pub const LATEST_COUNT: usize = 5;
pub const MORE_PAGE_SIZE: usize = 10;
pub const SEARCH_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<CollectorContext>,
}

impl AppState {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }

    fn job(&self, source_id: &str) -> Result<&Arc<IngestionJob>, Response> {
        self.ctx.job(source_id).ok_or_else(|| not_found(source_id))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub display_name: String,
    pub kind: String,
    pub collection: String,
    pub interval_minutes: u64,
    pub last_run: Option<IngestionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsPage {
    pub items: Vec<CanonicalItem>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorePage {
    pub items: Vec<CanonicalItem>,
    pub page: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
    pub message: String,
    pub result: IngestionResult,
}

#[derive(Debug, Deserialize, Default)]
struct ItemsQuery {
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MoreQuery {
    page: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    q: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sources", get(sources_handler))
        .route("/sources/{id}/items", get(items_handler))
        .route("/sources/{id}/latest", get(latest_handler))
        .route("/sources/{id}/more", get(more_handler))
        .route("/sources/{id}/search", get(search_handler))
        .route("/sources/{id}/status", get(status_handler))
        .route("/sources/{id}/ingest", get(ingest_handler).post(ingest_handler))
        .with_state(Arc::new(state))
}

/// Serves until ctrl-c.
pub async fn serve(ctx: Arc<CollectorContext>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(AppState::new(ctx)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("web server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SourceSummary>> {
    let mut out = Vec::new();
    for job in state.ctx.jobs() {
        let source = job.source();
        out.push(SourceSummary {
            source_id: source.source_id.clone(),
            display_name: source.display_name.clone(),
            kind: source.kind.as_str().to_string(),
            collection: source.collection.clone(),
            interval_minutes: source.interval_minutes,
            last_run: job.last_result().await,
        });
    }
    Json(out)
}

async fn items_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<ItemsQuery>,
) -> Response {
    let job = match state.job(&id) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    match paginated_items(job.store().as_ref(), &query).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

async fn latest_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let job = match state.job(&id) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    match job.store().query_page(PageQuery::newest(0, LATEST_COUNT)).await {
        Ok(items) => Json(items).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn more_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<MoreQuery>,
) -> Response {
    let job = match state.job(&id) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    let page = query.page.unwrap_or(1).max(1);
    let skip = (page - 1).saturating_mul(MORE_PAGE_SIZE);
    match job.store().query_page(PageQuery::newest(skip, MORE_PAGE_SIZE)).await {
        Ok(items) => Json(MorePage { items, page }).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let job = match state.job(&id) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    let needle = query.q.as_deref().map(str::trim).unwrap_or_default();
    if needle.is_empty() {
        return Json(Vec::<CanonicalItem>::new()).into_response();
    }
    match job.store().search_titles(needle, SEARCH_LIMIT).await {
        Ok(items) => Json(items).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.job(&id) {
        Ok(job) => Json(job.last_result().await).into_response(),
        Err(resp) => resp,
    }
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.ctx.trigger_ingestion_now(&id).await {
        Ok(result) => {
            let status = if result.is_success() { "success" } else { "failed" };
            Json(TriggerResponse {
                status: status.to_string(),
                message: result.summary_message(),
                result,
            })
            .into_response()
        }
        Err(_) => not_found(&id),
    }
}

fn not_found(source_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown source `{source_id}`") })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}

async fn paginated_items(store: &dyn ItemStore, query: &ItemsQuery) -> anyhow::Result<ItemsPage> {
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let total = store.count().await?;
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let items = store
        .query_page(PageQuery::newest((page - 1) * per_page, per_page))
        .await?;
    Ok(ItemsPage {
        items,
        page,
        per_page,
        total,
        total_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use collector_adapters::{adapter_for_kind, AdapterContext, PageCursor};
    use collector_core::FetchFailure;
    use collector_storage::{MemoryItemStore, StoreError};
    use collector_sync::{PageSource, SourceRegistry, SyncConfig};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    /// Twelve headlines on page one, dated Oct 1..12.
    struct OnePage;

    #[async_trait]
    impl PageSource for OnePage {
        async fn fetch_page(
            &self,
            _ctx: &AdapterContext,
            cursor: PageCursor,
        ) -> Result<JsonValue, FetchFailure> {
            if cursor.value() != 1 {
                return Ok(json!({ "status": "ok", "articles": [] }));
            }
            let articles = (0..12)
                .map(|i| {
                    json!({
                        "title": format!("Story {i}"),
                        "url": format!("https://news.test/{i}"),
                        "publishedAt": format!("2026-10-{:02}T08:00:00Z", i + 1),
                    })
                })
                .collect::<Vec<_>>();
            Ok(json!({ "status": "ok", "articles": articles }))
        }
    }

    struct DownStore;

    #[async_trait]
    impl ItemStore for DownStore {
        fn backend(&self) -> &'static str {
            "down"
        }
        async fn exists_by_title(&self, _title: &str) -> Result<bool, StoreError> {
            Err(StoreError::Corrupt("store offline".into()))
        }
        async fn insert_many(&self, _items: &[CanonicalItem]) -> Result<usize, StoreError> {
            Err(StoreError::Corrupt("store offline".into()))
        }
        async fn query_page(&self, _query: PageQuery) -> Result<Vec<CanonicalItem>, StoreError> {
            Err(StoreError::Corrupt("store offline".into()))
        }
        async fn count(&self) -> Result<usize, StoreError> {
            Err(StoreError::Corrupt("store offline".into()))
        }
        async fn search_titles(
            &self,
            _needle: &str,
            _limit: usize,
        ) -> Result<Vec<CanonicalItem>, StoreError> {
            Err(StoreError::Corrupt("store offline".into()))
        }
    }

    fn test_app(store: Arc<dyn ItemStore>) -> Router {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: headlines
    display_name: Headlines
    kind: newsapi
    endpoint_template: "https://news.test/top?page={cursor}"
    collection: headlines
    interval_minutes: 5
"#,
            "inline",
        )
        .unwrap();
        let source = registry.sources[0].clone();
        let job = IngestionJob::new(
            source.clone(),
            adapter_for_kind(source.kind),
            Box::new(OnePage),
            store,
        );
        let config = SyncConfig::from_lookup(|name| {
            (name == "COLLECTOR_STORE").then(|| "memory".to_string())
        })
        .unwrap();
        app(AppState::new(Arc::new(CollectorContext::new(config, vec![job]))))
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn seeded_app() -> Router {
        let app = test_app(Arc::new(MemoryItemStore::new()));
        let (status, body) = call(&app, "POST", "/sources/headlines/ingest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["result"]["inserted"], 12);
        app
    }

    fn titles(items: &JsonValue) -> Vec<String> {
        items
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["title"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn handler_smoke_health_and_sources() {
        let app = test_app(Arc::new(MemoryItemStore::new()));
        let (status, body) = call(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (_, body) = call(&app, "GET", "/sources").await;
        assert_eq!(body[0]["source_id"], "headlines");
        assert_eq!(body[0]["kind"], "newsapi");
        assert!(body[0]["last_run"].is_null());
    }

    #[tokio::test]
    async fn items_are_paginated_newest_first_and_clamped() {
        let app = seeded_app().await;

        let (_, body) = call(&app, "GET", "/sources/headlines/items").await;
        assert_eq!(body["total"], 12);
        assert_eq!(body["total_pages"], 3);
        assert_eq!(
            titles(&body["items"]),
            vec!["Story 11", "Story 10", "Story 9", "Story 8", "Story 7"]
        );

        let (_, body) = call(&app, "GET", "/sources/headlines/items?page=9").await;
        assert_eq!(body["page"], 3);
        assert_eq!(titles(&body["items"]), vec!["Story 1", "Story 0"]);

        let (_, body) = call(&app, "GET", "/sources/headlines/items?page=2&per_page=4").await;
        assert_eq!(body["total_pages"], 3);
        assert_eq!(titles(&body["items"]).len(), 4);
    }

    #[tokio::test]
    async fn latest_more_and_search_views() {
        let app = seeded_app().await;

        let (_, body) = call(&app, "GET", "/sources/headlines/latest").await;
        assert_eq!(titles(&body).len(), 5);

        let (_, body) = call(&app, "GET", "/sources/headlines/more?page=2").await;
        assert_eq!(titles(&body["items"]), vec!["Story 1", "Story 0"]);
        let (_, body) = call(&app, "GET", "/sources/headlines/more?page=3").await;
        assert!(body["items"].as_array().unwrap().is_empty());

        let (_, body) = call(&app, "GET", "/sources/headlines/search?q=story%201").await;
        assert_eq!(titles(&body), vec!["Story 11", "Story 10", "Story 1"]);

        let (_, body) = call(&app, "GET", "/sources/headlines/status").await;
        assert_eq!(body["trigger"], "on_demand");
        assert_eq!(body["fetched"], 12);
    }

    #[tokio::test]
    async fn second_trigger_reports_nothing_new() {
        let app = seeded_app().await;
        let (status, body) = call(&app, "GET", "/sources/headlines/ingest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["inserted"], 0);
        assert_eq!(body["result"]["fetched"], 12);
    }

    #[tokio::test]
    async fn unknown_source_is_404() {
        let app = test_app(Arc::new(MemoryItemStore::new()));
        for uri in ["/sources/nope/items", "/sources/nope/status", "/sources/nope/ingest"] {
            let (status, body) = call(&app, "GET", uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert!(body["error"].as_str().unwrap().contains("nope"));
        }
    }

    #[tokio::test]
    async fn store_outage_is_500_on_reads_and_failed_on_trigger() {
        let app = test_app(Arc::new(DownStore));
        let (status, body) = call(&app, "GET", "/sources/headlines/items").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("store offline"));

        let (status, body) = call(&app, "POST", "/sources/headlines/ingest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["result"]["failure"]["stage"], "store");
    }
}
