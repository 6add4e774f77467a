#![allow(dead_code)]

// Test doubles for the collaborators a run talks to.
pub use parse_urls::{
    CandidateItem, Collaborators, FetchError, MemoryTaskStore, Page, PageLink, ParseUrls,
    ParseUrlsConfig, ProducerError, ProducerRegistry, ReleaseEstimate, TaskInfo,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use interfaces::defs::{
    AggregatedItem, BacklogRegistry, LinkExtractor, PageFetcher, Producer, ReleaseEstimator,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TASK: &str = "test-task";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn task_at(now: DateTime<Utc>) -> TaskInfo {
    TaskInfo::new(TASK, now)
}

pub fn seeded_rng() -> StdRng {
    StdRng::seed_from_u64(7)
}

/// Returns the same candidates on every call.
pub struct StaticProducer {
    items: Vec<CandidateItem>,
    calls: AtomicUsize,
}

impl StaticProducer {
    pub fn new(items: Vec<CandidateItem>) -> Arc<Self> {
        Arc::new(Self {
            items,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn pairs(pairs: &[(&str, &str)]) -> Arc<Self> {
        Self::new(
            pairs
                .iter()
                .map(|(title, url)| CandidateItem::new(*title, *url))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Producer for StaticProducer {
    async fn produce(
        &self,
        _config: &Value,
        _task: &TaskInfo,
    ) -> Result<Vec<CandidateItem>, ProducerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.clone())
    }
}

/// Candidates can be swapped between runs.
#[derive(Default)]
pub struct ScriptedProducer {
    items: Mutex<Vec<CandidateItem>>,
}

impl ScriptedProducer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, pairs: &[(&str, &str)]) {
        *self.items.lock().unwrap() = pairs
            .iter()
            .map(|(title, url)| CandidateItem::new(*title, *url))
            .collect();
    }
}

#[async_trait]
impl Producer for ScriptedProducer {
    async fn produce(
        &self,
        _config: &Value,
        _task: &TaskInfo,
    ) -> Result<Vec<CandidateItem>, ProducerError> {
        Ok(self.items.lock().unwrap().clone())
    }
}

pub struct FailingProducer;

#[async_trait]
impl Producer for FailingProducer {
    async fn produce(
        &self,
        _config: &Value,
        _task: &TaskInfo,
    ) -> Result<Vec<CandidateItem>, ProducerError> {
        Err(ProducerError::Failed("upstream unavailable".to_string()))
    }
}

/// Serves canned bodies; unknown URLs fail permanently. URLs listed as flaky
/// fail transiently a fixed number of times first.
#[derive(Default)]
pub struct MapFetcher {
    pages: HashMap<String, String>,
    flaky: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<String>>,
    delays: HashMap<String, Duration>,
    statuses: HashMap<String, u16>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }

    pub fn flaky(self, url: &str, failures: usize) -> Self {
        self.flaky.lock().unwrap().insert(url.to_string(), failures);
        self
    }

    /// Answers `url` with `status` instead of 200, body unchanged.
    pub fn status(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_string(), status);
        self
    }

    pub fn slow(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|requested| requested.as_str() == url)
            .count()
    }
}

#[async_trait]
impl PageFetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> Result<Page, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }

        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Transient {
                        url: url.to_string(),
                        reason: "connection reset".to_string(),
                    });
                }
            }
        }

        match self.pages.get(url) {
            Some(body) => {
                let status = self.statuses.get(url).copied().unwrap_or(200);
                Ok(Page::new(url, status, body.as_bytes().to_vec()))
            }
            None => Err(FetchError::Permanent {
                url: url.to_string(),
                status: Some(404),
                reason: "not found".to_string(),
            }),
        }
    }
}

/// Reads one link per line of the page body: `<url> [rank]`.
pub struct LineExtractor;

impl LinkExtractor for LineExtractor {
    fn extract(&self, page: &Page) -> Vec<PageLink> {
        page.text()
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let url = parts.next()?;
                let link = PageLink::new(url);
                Some(match parts.next().and_then(|rank| rank.parse().ok()) {
                    Some(rank) => link.with_rank(rank),
                    None => link,
                })
            })
            .collect()
    }
}

/// Fixed estimate per title; everything else is unknown.
#[derive(Default)]
pub struct FixedEstimator {
    estimates: HashMap<String, ReleaseEstimate>,
    failing: HashSet<String>,
}

impl FixedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, title: &str, estimate: ReleaseEstimate) -> Self {
        self.estimates.insert(title.to_string(), estimate);
        self
    }

    pub fn failing_for(mut self, title: &str) -> Self {
        self.failing.insert(title.to_string());
        self
    }
}

#[async_trait]
impl ReleaseEstimator for FixedEstimator {
    async fn estimate(&self, item: &AggregatedItem) -> anyhow::Result<ReleaseEstimate> {
        if self.failing.contains(&item.title) {
            anyhow::bail!("estimation source offline");
        }
        Ok(self
            .estimates
            .get(&item.title)
            .copied()
            .unwrap_or(ReleaseEstimate::Unknown))
    }
}

pub struct SetBacklog(pub HashSet<String>);

impl SetBacklog {
    pub fn of(keys: &[&str]) -> Arc<Self> {
        Arc::new(Self(keys.iter().map(|key| key.to_string()).collect()))
    }
}

#[async_trait]
impl BacklogRegistry for SetBacklog {
    async fn injected_keys(&self, _task: &TaskInfo) -> anyhow::Result<HashSet<String>> {
        Ok(self.0.clone())
    }
}

pub struct BrokenBacklog;

#[async_trait]
impl BacklogRegistry for BrokenBacklog {
    async fn injected_keys(&self, _task: &TaskInfo) -> anyhow::Result<HashSet<String>> {
        anyhow::bail!("backlog table missing")
    }
}

/// Pipeline over a single producer named `static`.
pub fn pipeline(
    config: Value,
    producer: Arc<dyn Producer>,
    store: Arc<MemoryTaskStore>,
    fetcher: Arc<dyn PageFetcher>,
) -> parse_urls::Result<ParseUrls> {
    let registry = ProducerRegistry::new().with("static", producer);
    let config = ParseUrlsConfig::from_value(config)?;
    ParseUrls::new(
        config,
        &registry,
        Collaborators::new(store, fetcher, Arc::new(LineExtractor)),
    )
}
