//! Core domain model for the collector: canonical items and run results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "collector-core";

pub const DEFAULT_AUTHOR: &str = "N/A";
pub const DEFAULT_PUBLISHER: &str = "N/A";
pub const DEFAULT_HEADLINE_CATEGORY: &str = "General";
pub const DEFAULT_PAPER_CATEGORY: &str = "N/A";
pub const ABSTRACT_HEADING: &str = "Abstract";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Headline,
    Paper,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Headline => "headline",
            ItemKind::Paper => "paper",
        }
    }

    pub fn default_category(self) -> &'static str {
        match self {
            ItemKind::Headline => DEFAULT_HEADLINE_CATEGORY,
            ItemKind::Paper => DEFAULT_PAPER_CATEGORY,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "headline" => Ok(ItemKind::Headline),
            "paper" => Ok(ItemKind::Paper),
            other => Err(format!("unknown item kind `{other}`")),
        }
    }
}

/// Structured abstract attached to paper items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abstract {
    pub heading: String,
    pub body: String,
}

impl Abstract {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            heading: ABSTRACT_HEADING.to_string(),
            body: body.into(),
        }
    }
}

/// Canonical persisted item. `title` is the uniqueness key within a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: Uuid,
    pub source_id: String,
    pub kind: ItemKind,
    pub title: String,
    pub author: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub secondary_url: Option<String>,
    pub publisher: String,
    pub category: String,
    pub abstract_text: Option<Abstract>,
    pub ingested_at: DateTime<Utc>,
}

impl CanonicalItem {
    /// Deterministic id derived from the dedup key.
    pub fn id_for_title(title: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("collector:title:{title}").as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailureKind {
    Timeout,
    Transport,
    HttpStatus,
    Payload,
}

/// Why a paginated fetch stopped early. Items fetched before it are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub status: Option<u16>,
    pub cursor: u32,
    pub message: String,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch failed at cursor {}: {}", self.cursor, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Store,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: FailureStage,
    pub message: String,
    pub fetch: Option<FetchFailure>,
}

impl RunFailure {
    pub fn from_fetch(failure: FetchFailure) -> Self {
        Self {
            stage: FailureStage::Fetch,
            message: failure.to_string(),
            fetch: Some(failure),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self {
            stage: FailureStage::Store,
            message: message.into(),
            fetch: None,
        }
    }
}

/// Outcome of one ingestion run, timer-triggered or on-demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionResult {
    pub run_id: Uuid,
    pub source_id: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub fetched: usize,
    pub skipped_malformed: usize,
    pub inserted: usize,
    pub failure: Option<RunFailure>,
}

impl IngestionResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn summary_message(&self) -> String {
        match &self.failure {
            None => format!(
                "{}: fetched {} items, inserted {} new",
                self.source_id, self.fetched, self.inserted
            ),
            Some(failure) => format!(
                "{}: fetched {} items, inserted {} new, run failed ({:?}): {}",
                self.source_id, self.fetched, self.inserted, failure.stage, failure.message
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_ids_are_stable_and_distinct() {
        assert_eq!(
            CanonicalItem::id_for_title("A"),
            CanonicalItem::id_for_title("A")
        );
        assert_ne!(
            CanonicalItem::id_for_title("A"),
            CanonicalItem::id_for_title("B")
        );
    }

    #[test]
    fn item_kind_round_trips_through_text() {
        for kind in [ItemKind::Headline, ItemKind::Paper] {
            assert_eq!(kind.as_str().parse::<ItemKind>().unwrap(), kind);
        }
        assert!("podcast".parse::<ItemKind>().is_err());
    }

    #[test]
    fn result_serializes_failure_stage_in_snake_case() {
        let now = Utc::now();
        let result = IngestionResult {
            run_id: Uuid::new_v4(),
            source_id: "news".into(),
            trigger: RunTrigger::OnDemand,
            started_at: now,
            finished_at: now,
            pages: 1,
            fetched: 5,
            skipped_malformed: 0,
            inserted: 0,
            failure: Some(RunFailure::store("connection reset")),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["trigger"], "on_demand");
        assert_eq!(json["failure"]["stage"], "store");
        assert!(!result.is_success());
        assert!(result.summary_message().contains("connection reset"));
    }
}
