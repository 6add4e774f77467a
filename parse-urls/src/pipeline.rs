use crate::aggregator::Aggregator;
use crate::cache::CacheStore;
use crate::config::{CacheMode, FetchConfig, ParseUrlsConfig};
use crate::context::RunContext;
use crate::extractor::LinkHarvester;
use crate::fetcher::RetryingFetcher;
use crate::gate::{EstimationGate, GateStage, IntervalGate};
use crate::matcher::LinkMatcher;
use crate::registry::{ProducerRegistry, ResolvedInput};
use crate::types::{
    HarvestReport, ParseUrlsError, Result, TaskInfo, VOLUME_WARNING_THRESHOLD,
};
use chrono::{DateTime, Duration, Utc};
use interfaces::defs::{BacklogRegistry, LinkExtractor, PageFetcher, ReleaseEstimator};
use interfaces::empty::{NoBacklog, NoEstimates};
use interfaces::state::TaskStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// The external services a run talks to.
pub struct Collaborators {
    pub store: Arc<dyn TaskStore>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn LinkExtractor>,
    pub estimator: Arc<dyn ReleaseEstimator>,
    pub backlog: Arc<dyn BacklogRegistry>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn TaskStore>,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn LinkExtractor>,
    ) -> Self {
        Self {
            store,
            fetcher,
            extractor,
            estimator: Arc::new(NoEstimates),
            backlog: Arc::new(NoBacklog),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn ReleaseEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_backlog(mut self, backlog: Arc<dyn BacklogRegistry>) -> Self {
        self.backlog = backlog;
        self
    }

    /// Retry transient fetch failures according to `config`.
    pub fn with_fetch_retries(mut self, config: FetchConfig) -> Self {
        self.fetcher = Arc::new(RetryingFetcher::new(self.fetcher, config));
        self
    }
}

/// Configured pipeline: producers, then aggregation, gates, fetching and
/// link filtering. Build once, run once per invocation.
pub struct ParseUrls {
    inputs: Vec<ResolvedInput>,
    interval: Duration,
    interval_label: String,
    estimations: bool,
    limit: Option<usize>,
    all_entries: bool,
    cache_mode: CacheMode,
    seen_retention: Duration,
    harvester: LinkHarvester,
    store: Arc<dyn TaskStore>,
    estimator: Arc<dyn ReleaseEstimator>,
    backlog: Arc<dyn BacklogRegistry>,
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ParseUrls {
    /// Validates `config` completely (schema, intervals, patterns, producer
    /// names) before anything runs.
    pub fn new(
        config: ParseUrlsConfig,
        registry: &ProducerRegistry,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let inputs = registry.resolve(&config.inputs)?;
        let matcher = LinkMatcher::compile(&config.links_re)?;
        if matcher.is_accept_all() {
            debug!("No links_re configured, every extracted link is accepted");
        }
        let harvester = LinkHarvester::new(collaborators.fetcher, collaborators.extractor, matcher)
            .with_concurrency(config.concurrency);

        Ok(Self {
            inputs,
            interval: config.interval()?,
            interval_label: config.interval.clone(),
            estimations: !config.ignore_estimations,
            limit: config.limit,
            all_entries: config.all_entries,
            cache_mode: config.cache_mode,
            seen_retention: config.seen_retention()?,
            harvester,
            store: collaborators.store,
            estimator: collaborators.estimator,
            backlog: collaborators.backlog,
            task_locks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(&self, task: TaskInfo) -> Result<HarvestReport> {
        self.run_with_rng(task, StdRng::from_os_rng()).await
    }

    /// Same as [`ParseUrls::run`] with a caller-supplied jitter source.
    pub async fn run_with_rng(&self, task: TaskInfo, rng: StdRng) -> Result<HarvestReport> {
        let lock = self.task_lock(&task.name).await;
        let _guard = lock.lock().await;

        let injected = self
            .backlog
            .injected_keys(&task)
            .await
            .map_err(ParseUrlsError::Backlog)?;
        if !injected.is_empty() {
            debug!("{} backlog keys bypass the seen cache", injected.len());
        }

        let cache = self.cache_for(&task.name).with_injected(injected);
        let mut ctx = RunContext::new(task, cache, rng);
        info!("Starting run {} of task {}", ctx.run_id, ctx.task.name);

        let aggregation = Aggregator::new(&self.inputs)
            .with_all_entries(self.all_entries)
            .aggregate(&mut ctx)
            .await?;
        let origins = aggregation.origins;
        let mut items = aggregation.items;

        info!("Parsing the URLs of {} titles ...", items.len());
        let volume_exceeded = items.len() > VOLUME_WARNING_THRESHOLD;
        if volume_exceeded {
            error!(
                "Looks like your inputs in parse_urls configuration produced over {} entries, please reduce the amount!",
                VOLUME_WARNING_THRESHOLD
            );
        }

        for mut gate in self.gates() {
            items = gate.process(items, &mut ctx).await?;
            debug!(
                "{} gate left {} of {} items pending",
                gate.stage_name(),
                items.iter().filter(|item| item.outcome.is_pending()).count(),
                items.len()
            );
        }

        let attempted: Vec<String> = items
            .iter()
            .filter(|item| item.outcome.is_pending())
            .map(|item| item.title.clone())
            .collect();

        let stats = self.harvester.extract(&mut items).await;
        debug!(
            "Fetched {} pages ({} failed), kept {} of {} links",
            stats.pages,
            stats.failed_pages,
            stats.links - stats.filtered_links,
            stats.links
        );

        for title in attempted {
            for index in origins.get(&title).into_iter().flatten() {
                ctx.cache.mark_seen(*index, [title.clone()]);
            }
        }

        let links = LinkHarvester::flatten(&mut items, self.limit);

        let committed = ctx.cache.commit(ctx.task.now).await?;
        debug!(
            "Committed {} throttle records, seen cache +{} -{}",
            committed.throttle_records, committed.seen_added, committed.seen_expired
        );

        info!(
            "Run {} of task {} produced {} links from {} titles",
            ctx.run_id,
            ctx.task.name,
            links.len(),
            items.len()
        );

        Ok(HarvestReport {
            run_id: ctx.run_id,
            task: ctx.task.name,
            items,
            links,
            volume_exceeded,
        })
    }

    /// Removes throttle records of `task` older than the retention window.
    pub async fn sweep_throttle_records(&self, task: &str, now: DateTime<Utc>) -> Result<usize> {
        let lock = self.task_lock(task).await;
        let _guard = lock.lock().await;
        self.cache_for(task).sweep_throttle_records(now).await
    }

    /// Drops `title` from the seen cache of input `index`.
    pub async fn forget(&self, task: &str, index: usize, title: &str) -> Result<bool> {
        let lock = self.task_lock(task).await;
        let _guard = lock.lock().await;
        self.cache_for(task).forget(index, title).await
    }

    fn cache_for(&self, task: &str) -> CacheStore {
        CacheStore::new(
            Arc::clone(&self.store),
            task,
            self.cache_mode,
            self.seen_retention,
        )
    }

    fn gates(&self) -> Vec<Box<dyn GateStage>> {
        let mut gates: Vec<Box<dyn GateStage>> = vec![Box::new(IntervalGate::new(
            self.interval,
            self.interval_label.clone(),
        ))];
        if self.estimations {
            gates.push(Box::new(EstimationGate::new(Arc::clone(&self.estimator))));
        }
        gates
    }

    async fn task_lock(&self, task: &str) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        Arc::clone(locks.entry(task.to_string()).or_default())
    }
}
