use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub use interfaces::defs::{
    AggregatedItem, CandidateItem, FetchError, ItemOutcome, LinkItem, Page, PageLink, ParsedLink,
    ProducerError, RejectReason, ReleaseEstimate, TaskInfo,
};

/// Items above this count trigger the volume advisory.
pub const VOLUME_WARNING_THRESHOLD: usize = 500;

/// Throttle records older than this are removed by the maintenance sweep.
pub const THROTTLE_RETENTION_DAYS: i64 = 7;

/// Last time a title was let through the interval gate for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRecord {
    pub title: String,
    pub task: String,
    pub last_execution: Option<DateTime<Utc>>,
}

impl ThrottleRecord {
    pub fn new(title: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            task: task.into(),
            last_execution: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Admit,
    RejectNotExpired { next_due: DateTime<Utc> },
}

impl ThrottleDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, ThrottleDecision::Admit)
    }
}

/// Everything one run produced: every aggregated item with its outcome, and
/// the flattened link items handed downstream.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub task: String,
    pub items: Vec<AggregatedItem>,
    pub links: Vec<LinkItem>,
    /// Set when the run aggregated more than [`VOLUME_WARNING_THRESHOLD`] items.
    pub volume_exceeded: bool,
}

impl HarvestReport {
    pub fn item(&self, title: &str) -> Option<&AggregatedItem> {
        self.items.iter().find(|item| item.title == title)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &AggregatedItem> {
        self.items.iter().filter(|item| item.outcome.is_rejected())
    }

    pub fn pending(&self) -> impl Iterator<Item = &AggregatedItem> {
        self.items.iter().filter(|item| item.outcome.is_pending())
    }

    /// Folds downstream decisions about link items (keyed by link URL) back
    /// into the aggregated items that produced them. Links without a
    /// decision count as pending. Items already decided are left alone.
    pub fn apply_link_outcomes(&mut self, outcomes: &HashMap<String, ItemOutcome>) {
        let pending = ItemOutcome::Pending;
        for item in self.items.iter_mut().filter(|item| item.outcome.is_pending()) {
            let children: Vec<&ItemOutcome> = self
                .links
                .iter()
                .filter(|link| link.parent_title == item.title)
                .map(|link| outcomes.get(&link.url).unwrap_or(&pending))
                .collect();
            if children.is_empty() {
                continue;
            }
            item.outcome = ItemOutcome::roll_up(children);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseUrlsError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid interval `{0}`")]
    InvalidInterval(String),

    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Backlog registry error: {0}")]
    Backlog(#[source] anyhow::Error),

    #[error("Corrupt persisted state under `{key}`: {reason}")]
    CorruptState { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ParseUrlsError>;
