//! Source adapter contracts + JSON record normalizers for each upstream API.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use collector_core::{
    Abstract, CanonicalItem, ItemKind, ABSTRACT_HEADING, DEFAULT_AUTHOR, DEFAULT_PUBLISHER,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "collector-adapters";

/// Separator used when a source lists several authors.
pub const AUTHOR_SEPARATOR: &str = ", ";

pub const SPRINGER_DEFAULT_PUBLISHER: &str = "Springer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    NewsApi,
    Springer,
    Scholar,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::NewsApi => "newsapi",
            SourceKind::Springer => "springer",
            SourceKind::Scholar => "scholar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStyle {
    /// Page number, advanced by one per request.
    PageIndex { first: u32 },
    /// Record offset, advanced by the page size per request.
    Offset { first: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    style: CursorStyle,
    value: u32,
}

impl PageCursor {
    pub fn first(style: CursorStyle) -> Self {
        let value = match style {
            CursorStyle::PageIndex { first } | CursorStyle::Offset { first } => first,
        };
        Self { style, value }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn advance(&mut self, page_size: u32) {
        self.value = match self.style {
            CursorStyle::PageIndex { .. } => self.value.saturating_add(1),
            CursorStyle::Offset { .. } => self.value.saturating_add(page_size.max(1)),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub category: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unexpected page payload: {0}")]
    Payload(String),
}

/// A single raw record lacks a field the canonical schema cannot default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record is missing required field `{field}`")]
pub struct MalformedRecord {
    pub field: &'static str,
}

pub trait SourceAdapter: Send + Sync {
    fn source_kind(&self) -> SourceKind;
    fn item_kind(&self) -> ItemKind;
    fn cursor_style(&self) -> CursorStyle;

    /// Pull the record array out of one page payload.
    fn extract_records<'a>(&self, payload: &'a JsonValue) -> Result<&'a [JsonValue], AdapterError>;

    fn normalize(
        &self,
        raw: &JsonValue,
        ctx: &AdapterContext,
    ) -> Result<CanonicalItem, MalformedRecord>;
}

pub fn adapter_for_kind(kind: SourceKind) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::NewsApi => Box::new(NewsApiAdapter),
        SourceKind::Springer => Box::new(SpringerAdapter),
        SourceKind::Scholar => Box::new(ScholarAdapter),
    }
}

/// Accepts RFC 3339, naive date-times (taken as UTC), `YYYY-MM-DD`, `YYYY-MM` and `YYYY`.
pub fn parse_published_at(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{input}-01"), "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    if input.len() == 4 && input.chars().all(|c| c.is_ascii_digit()) {
        return input.parse().ok().and_then(start_of_year);
    }
    None
}

pub fn start_of_year(year: i32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()
}

fn current_year_fallback(ctx: &AdapterContext) -> DateTime<Utc> {
    start_of_year(ctx.fetched_at.year()).unwrap_or(ctx.fetched_at)
}

/// Trimmed text with NUL bytes removed (Postgres TEXT rejects them); `None` when nothing is left.
fn text_or_none(value: &str) -> Option<String> {
    let cleaned = value.replace('\0', "");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path).and_then(text_or_none)
}

fn required_text(
    value: &JsonValue,
    path: &[&str],
    field: &'static str,
) -> Result<String, MalformedRecord> {
    json_text(value, path).ok_or(MalformedRecord { field })
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return &[],
        }
    }
    cur.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn records_under<'a>(payload: &'a JsonValue, key: &str) -> Result<&'a [JsonValue], AdapterError> {
    payload
        .get(key)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| AdapterError::Payload(format!("missing `{key}` array")))
}

/// Joins a string or an array of strings with [`AUTHOR_SEPARATOR`], keeping payload order.
fn join_authors<'a>(names: impl Iterator<Item = &'a str>) -> Option<String> {
    let names = names.filter_map(text_or_none).collect::<Vec<_>>();
    if names.is_empty() {
        None
    } else {
        Some(names.join(AUTHOR_SEPARATOR))
    }
}

fn abstract_from(value: Option<&JsonValue>) -> Option<Abstract> {
    match value? {
        JsonValue::String(body) => text_or_none(body).map(Abstract::new),
        JsonValue::Object(map) => {
            let heading = map
                .get("h1")
                .and_then(JsonValue::as_str)
                .and_then(text_or_none)
                .unwrap_or_else(|| ABSTRACT_HEADING.to_string());
            let body = match map.get("p")? {
                JsonValue::String(p) => text_or_none(p),
                JsonValue::Array(parts) => {
                    let parts = parts
                        .iter()
                        .filter_map(JsonValue::as_str)
                        .filter_map(text_or_none)
                        .collect::<Vec<_>>();
                    (!parts.is_empty()).then(|| parts.join("\n\n"))
                }
                _ => None,
            }?;
            Some(Abstract { heading, body })
        }
        _ => None,
    }
}

fn category_for(ctx: &AdapterContext, kind: ItemKind) -> String {
    ctx.category
        .as_deref()
        .and_then(text_or_none)
        .unwrap_or_else(|| kind.default_category().to_string())
}

#[allow(clippy::too_many_arguments)]
fn build_item(
    ctx: &AdapterContext,
    kind: ItemKind,
    title: String,
    author: Option<String>,
    published_at: DateTime<Utc>,
    url: String,
    secondary_url: Option<String>,
    publisher: String,
    abstract_text: Option<Abstract>,
) -> CanonicalItem {
    CanonicalItem {
        id: CanonicalItem::id_for_title(&title),
        source_id: ctx.source_id.clone(),
        kind,
        title,
        author: author.unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
        published_at,
        url,
        secondary_url,
        publisher,
        category: category_for(ctx, kind),
        abstract_text,
        ingested_at: ctx.fetched_at,
    }
}

/// NewsAPI `top-headlines` / `everything`: flat article objects under `articles`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewsApiAdapter;

impl SourceAdapter for NewsApiAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::NewsApi
    }

    fn item_kind(&self) -> ItemKind {
        ItemKind::Headline
    }

    fn cursor_style(&self) -> CursorStyle {
        CursorStyle::PageIndex { first: 1 }
    }

    fn extract_records<'a>(&self, payload: &'a JsonValue) -> Result<&'a [JsonValue], AdapterError> {
        if json_str(payload, &["status"]) == Some("error") {
            return Err(AdapterError::Payload(format!(
                "newsapi error {}: {}",
                json_str(payload, &["code"]).unwrap_or("unknown"),
                json_str(payload, &["message"]).unwrap_or("no message")
            )));
        }
        records_under(payload, "articles")
    }

    fn normalize(
        &self,
        raw: &JsonValue,
        ctx: &AdapterContext,
    ) -> Result<CanonicalItem, MalformedRecord> {
        let title = required_text(raw, &["title"], "title")?;
        let url = required_text(raw, &["url"], "url")?;
        let published_at = json_str(raw, &["publishedAt"])
            .and_then(parse_published_at)
            .unwrap_or(ctx.fetched_at);
        Ok(build_item(
            ctx,
            ItemKind::Headline,
            title,
            json_text(raw, &["author"]),
            published_at,
            url,
            json_text(raw, &["urlToImage"]),
            json_text(raw, &["source", "name"]).unwrap_or_else(|| DEFAULT_PUBLISHER.to_string()),
            None,
        ))
    }
}

/// Springer Nature Open Access API: `records` with `creators[]` and `url[]` lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpringerAdapter;

impl SourceAdapter for SpringerAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Springer
    }

    fn item_kind(&self) -> ItemKind {
        ItemKind::Paper
    }

    fn cursor_style(&self) -> CursorStyle {
        CursorStyle::Offset { first: 1 }
    }

    fn extract_records<'a>(&self, payload: &'a JsonValue) -> Result<&'a [JsonValue], AdapterError> {
        records_under(payload, "records")
    }

    fn normalize(
        &self,
        raw: &JsonValue,
        ctx: &AdapterContext,
    ) -> Result<CanonicalItem, MalformedRecord> {
        let title = required_text(raw, &["title"], "title")?;

        // First non-empty url entry is canonical, the next one (usually the PDF) is secondary.
        let mut urls = json_array(raw, &["url"])
            .iter()
            .filter_map(|entry| json_text(entry, &["value"]));
        let url = urls.next().ok_or(MalformedRecord { field: "url" })?;
        let secondary_url = urls.next();

        let author = join_authors(
            json_array(raw, &["creators"])
                .iter()
                .filter_map(|c| json_str(c, &["creator"])),
        );
        let published_at = json_str(raw, &["publicationDate"])
            .and_then(parse_published_at)
            .or_else(|| json_str(raw, &["onlineDate"]).and_then(parse_published_at))
            .unwrap_or_else(|| current_year_fallback(ctx));

        Ok(build_item(
            ctx,
            ItemKind::Paper,
            title,
            author,
            published_at,
            url,
            secondary_url,
            json_text(raw, &["publicationName"])
                .unwrap_or_else(|| SPRINGER_DEFAULT_PUBLISHER.to_string()),
            abstract_from(raw.get("abstract")),
        ))
    }
}

/// Scholar-style search results: bibliographic data nested under `bib`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScholarAdapter;

impl SourceAdapter for ScholarAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Scholar
    }

    fn item_kind(&self) -> ItemKind {
        ItemKind::Paper
    }

    fn cursor_style(&self) -> CursorStyle {
        CursorStyle::Offset { first: 0 }
    }

    fn extract_records<'a>(&self, payload: &'a JsonValue) -> Result<&'a [JsonValue], AdapterError> {
        records_under(payload, "results")
    }

    fn normalize(
        &self,
        raw: &JsonValue,
        ctx: &AdapterContext,
    ) -> Result<CanonicalItem, MalformedRecord> {
        let title = required_text(raw, &["bib", "title"], "title")?;
        let pub_url = json_text(raw, &["pub_url"]);
        let eprint_url = json_text(raw, &["eprint_url"]);
        let url = pub_url
            .clone()
            .or_else(|| eprint_url.clone())
            .ok_or(MalformedRecord { field: "url" })?;
        let secondary_url = eprint_url.filter(|eprint| *eprint != url);

        let author = match raw.get("bib").and_then(|bib| bib.get("author")) {
            Some(JsonValue::String(names)) => text_or_none(names),
            Some(JsonValue::Array(names)) => {
                join_authors(names.iter().filter_map(JsonValue::as_str))
            }
            _ => None,
        };

        let published_at = match raw.get("bib").and_then(|bib| bib.get("pub_year")) {
            Some(JsonValue::Number(n)) => n
                .as_i64()
                .and_then(|y| i32::try_from(y).ok())
                .and_then(start_of_year),
            Some(JsonValue::String(s)) => parse_published_at(s),
            _ => None,
        }
        .unwrap_or_else(|| current_year_fallback(ctx));

        let publisher = json_text(raw, &["bib", "journal"])
            .or_else(|| json_text(raw, &["bib", "venue"]))
            .unwrap_or_else(|| DEFAULT_PUBLISHER.to_string());

        Ok(build_item(
            ctx,
            ItemKind::Paper,
            title,
            author,
            published_at,
            url,
            secondary_url,
            publisher,
            abstract_from(raw.get("bib").and_then(|bib| bib.get("abstract"))),
        ))
    }
}
