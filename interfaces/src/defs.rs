use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the task a run belongs to, plus the clock and override flag
/// every stage reads instead of global state.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: String,
    pub now: DateTime<Utc>,
    /// Operator override: admit everything at the interval gate.
    pub run_now: bool,
}

impl TaskInfo {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            now,
            run_now: false,
        }
    }

    pub fn with_run_now(mut self, run_now: bool) -> Self {
        self.run_now = run_now;
        self
    }
}

/// Raw unit handed over by an upstream producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub extra_urls: Vec<String>,
}

impl CandidateItem {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            extra_urls: Vec::new(),
        }
    }

    pub fn with_extra_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// `url` followed by `extra_urls`, blanks and repeats removed.
    pub fn index_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(&self.url)
            .chain(self.extra_urls.iter())
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .filter(|url| seen.insert(*url))
            .map(str::to_string)
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        !self.title.trim().is_empty() && !self.index_urls().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    IntervalNotMet,
    NotYetReleased(DateTime<Utc>),
    FetchFailed,
    NoLinks,
    OverLimit,
    Downstream(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::IntervalNotMet => write!(f, "parse_urls interval not met"),
            RejectReason::NotYetReleased(at) => write!(f, "has not been released (expected {})", at),
            RejectReason::FetchFailed => write!(f, "every index page failed to fetch"),
            RejectReason::NoLinks => write!(f, "no accepted links on index pages"),
            RejectReason::OverLimit => write!(f, "all links cut by limit"),
            RejectReason::Downstream(reason) => write!(f, "rejected downstream: {}", reason),
        }
    }
}

/// Where an item stands; children roll up into their parent via [`ItemOutcome::roll_up`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ItemOutcome {
    #[default]
    Pending,
    Accepted,
    Rejected(RejectReason),
}

impl ItemOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, ItemOutcome::Pending)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ItemOutcome::Rejected(_))
    }

    /// Any accepted child accepts the parent. Once every child is rejected the
    /// parent is rejected with the first child's reason. Otherwise pending.
    pub fn roll_up<'a, I>(children: I) -> ItemOutcome
    where
        I: IntoIterator<Item = &'a ItemOutcome>,
    {
        let mut first_reason = None;
        let mut pending = false;
        for child in children {
            match child {
                ItemOutcome::Accepted => return ItemOutcome::Accepted,
                ItemOutcome::Pending => pending = true,
                ItemOutcome::Rejected(reason) => {
                    first_reason.get_or_insert_with(|| reason.clone());
                }
            }
        }
        match (pending, first_reason) {
            (false, Some(reason)) => ItemOutcome::Rejected(reason),
            _ => ItemOutcome::Pending,
        }
    }
}

/// A link accepted from one of an aggregated item's index pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedLink {
    pub url: String,
    pub text: Option<String>,
    pub rank: Option<i64>,
    pub index_url: String,
}

/// Deduplicated unit: one title, every index page folded under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedItem {
    pub title: String,
    pub index_urls: Vec<String>,
    /// Written once, after every index URL has been fetched.
    pub parsed_links: Vec<ParsedLink>,
    pub outcome: ItemOutcome,
}

impl AggregatedItem {
    pub fn new(title: impl Into<String>, index_url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            index_urls: vec![index_url.into()],
            parsed_links: Vec::new(),
            outcome: ItemOutcome::Pending,
        }
    }

    /// Appends `url` unless it is already folded in. Returns whether it was added.
    pub fn fold_url(&mut self, url: &str) -> bool {
        if self.index_urls.iter().any(|known| known == url) {
            return false;
        }
        self.index_urls.push(url.to_string());
        true
    }

    pub fn reject(&mut self, reason: RejectReason) {
        self.outcome = ItemOutcome::Rejected(reason);
    }
}

/// Output unit: one accepted link, with the aggregated item it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkItem {
    pub title: String,
    pub url: String,
    pub parent_title: String,
    pub index_url: String,
    pub rank: Option<i64>,
}

/// Raw page handed back by the fetch facility.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl Page {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Hyperlink reference found on a page. `rank` is the optional ranking key
/// used when the output is capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    pub url: String,
    pub text: Option<String>,
    pub rank: Option<i64>,
}

impl PageLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            text: None,
            rank: None,
        }
    }

    pub fn with_rank(mut self, rank: i64) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseEstimate {
    Unknown,
    /// A bare date counts from midnight.
    Date(NaiveDate),
    At(DateTime<Utc>),
}

impl ReleaseEstimate {
    pub fn available_from(&self) -> Option<DateTime<Utc>> {
        match self {
            ReleaseEstimate::Unknown => None,
            ReleaseEstimate::Date(date) => Some(date.and_time(chrono::NaiveTime::MIN).and_utc()),
            ReleaseEstimate::At(at) => Some(*at),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("producer failed: {0}")]
    Failed(String),

    #[error("invalid producer configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },

    #[error("failed to fetch {url}: {reason}")]
    Permanent {
        url: String,
        status: Option<u16>,
        reason: String,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Upstream source of candidate items.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(
        &self,
        config: &serde_json::Value,
        task: &TaskInfo,
    ) -> Result<Vec<CandidateItem>, ProducerError>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Page, FetchError>;
}

pub trait LinkExtractor: Send + Sync {
    /// Every hyperlink reference on the page, in document order.
    fn extract(&self, page: &Page) -> Vec<PageLink>;
}

#[async_trait]
pub trait ReleaseEstimator: Send + Sync {
    async fn estimate(&self, item: &AggregatedItem) -> anyhow::Result<ReleaseEstimate>;
}

/// Keys of items being retried after a downstream failure; they bypass the
/// seen cache.
#[async_trait]
pub trait BacklogRegistry: Send + Sync {
    async fn injected_keys(&self, task: &TaskInfo) -> anyhow::Result<HashSet<String>>;
}
