use crate::config::CacheMode;
use crate::types::{ParseUrlsError, Result, ThrottleDecision, ThrottleRecord, THROTTLE_RETENTION_DAYS};
use chrono::{DateTime, Duration, Utc};
use interfaces::state::TaskStore;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

const SEEN_PREFIX: &str = "seen/";
const THROTTLE_PREFIX: &str = "throttle/";

/// Persisted seen keys with the time each was first recorded.
type SeenSet = BTreeMap<String, DateTime<Utc>>;

#[derive(Debug, Default)]
struct StagedSeen {
    observed: HashSet<String>,
    fetched: HashSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub seen_added: usize,
    pub seen_expired: usize,
    pub throttle_records: usize,
}

/// Seen cache and throttle bookkeeping for one task.
///
/// Reads go straight to the [`TaskStore`]; writes are staged in memory and
/// only reach the store through [`CacheStore::commit`], so a run that is
/// abandoned half way leaves the persisted state untouched.
pub struct CacheStore {
    store: Arc<dyn TaskStore>,
    task: String,
    mode: CacheMode,
    seen_retention: Duration,
    injected: HashSet<String>,
    seen: HashMap<usize, SeenSet>,
    staged_seen: BTreeMap<usize, StagedSeen>,
    staged_throttle: BTreeMap<String, ThrottleRecord>,
}

impl CacheStore {
    pub fn new(
        store: Arc<dyn TaskStore>,
        task: impl Into<String>,
        mode: CacheMode,
        seen_retention: Duration,
    ) -> Self {
        Self {
            store,
            task: task.into(),
            mode,
            seen_retention,
            injected: HashSet::new(),
            seen: HashMap::new(),
            staged_seen: BTreeMap::new(),
            staged_throttle: BTreeMap::new(),
        }
    }

    /// Keys handed over by the backlog registry for this run.
    pub fn with_injected(mut self, injected: HashSet<String>) -> Self {
        self.injected = injected;
        self
    }

    pub fn is_injected(&self, key: &str) -> bool {
        self.injected.contains(key)
    }

    async fn seen_set(&mut self, index: usize) -> Result<&SeenSet> {
        if !self.seen.contains_key(&index) {
            let key = seen_key(index);
            let set = match self.store.get(&self.task, &key).await.map_err(ParseUrlsError::Store)? {
                Some(value) => serde_json::from_value(value).map_err(|e| corrupt(&key, e))?,
                None => SeenSet::new(),
            };
            self.seen.insert(index, set);
        }
        Ok(&self.seen[&index])
    }

    /// True if `key` was recorded by an earlier run of producer `index` and
    /// is not being retried through the backlog.
    pub async fn is_seen(&mut self, index: usize, key: &str) -> Result<bool> {
        if self.is_injected(key) {
            return Ok(false);
        }
        Ok(self.seen_set(index).await?.contains_key(key))
    }

    /// Notes that producer `index` emitted `key` this run.
    pub fn observe(&mut self, index: usize, key: &str) {
        self.staged_seen
            .entry(index)
            .or_default()
            .observed
            .insert(key.to_string());
    }

    /// Stages `keys` as fetched for producer `index`.
    pub fn mark_seen<I, S>(&mut self, index: usize, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let staged = self.staged_seen.entry(index).or_default();
        for key in keys {
            let key = key.into();
            staged.observed.insert(key.clone());
            staged.fetched.insert(key);
        }
    }

    /// Drops `key` from the persisted seen set of producer `index`, making it
    /// eligible on the next run.
    pub async fn forget(&mut self, index: usize, key: &str) -> Result<bool> {
        let mut set = self.seen_set(index).await?.clone();
        if set.remove(key).is_none() {
            return Ok(false);
        }
        self.store
            .set(&self.task, &seen_key(index), serde_json::to_value(&set)?)
            .await
            .map_err(ParseUrlsError::Store)?;
        self.seen.insert(index, set);
        Ok(true)
    }

    pub async fn throttle_record(&self, title: &str) -> Result<Option<ThrottleRecord>> {
        if let Some(record) = self.staged_throttle.get(title) {
            return Ok(Some(record.clone()));
        }
        let key = throttle_key(title);
        match self.store.get(&self.task, &key).await.map_err(ParseUrlsError::Store)? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| corrupt(&key, e))?)),
            None => Ok(None),
        }
    }

    /// Decides whether `title` is due again.
    ///
    /// A first sighting is admitted and recorded as if it last ran a random
    /// fraction of `interval` ago, so titles first seen together do not all
    /// come due together. Later sightings are admitted once `interval` has
    /// passed, or unconditionally with `force`.
    pub async fn throttle_check<R: Rng>(
        &mut self,
        title: &str,
        interval: Duration,
        now: DateTime<Utc>,
        rng: &mut R,
        force: bool,
    ) -> Result<ThrottleDecision> {
        let last_execution = self
            .throttle_record(title)
            .await?
            .and_then(|record| record.last_execution);

        let Some(last_execution) = last_execution else {
            debug!("{} -> No previous run recorded", title);
            let jittered = now.checked_sub_signed(jitter(interval, rng)).unwrap_or(now);
            self.stage_execution(title, jittered);
            return Ok(ThrottleDecision::Admit);
        };

        let next_due = last_execution
            .checked_add_signed(interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(
            "last_time: {}, interval: {}, next_time: {}",
            last_execution, interval, next_due
        );
        if !force && now < next_due {
            debug!("{}: interval not met", title);
            return Ok(ThrottleDecision::RejectNotExpired { next_due });
        }

        self.stage_execution(title, now);
        Ok(ThrottleDecision::Admit)
    }

    fn stage_execution(&mut self, title: &str, at: DateTime<Utc>) {
        let mut record = ThrottleRecord::new(title, self.task.clone());
        record.last_execution = Some(at);
        self.staged_throttle.insert(title.to_string(), record);
    }

    /// Flushes staged seen keys and throttle records to the store.
    pub async fn commit(&mut self, now: DateTime<Utc>) -> Result<CommitSummary> {
        let mut summary = CommitSummary::default();

        let staged_seen = std::mem::take(&mut self.staged_seen);
        for (index, staged) in staged_seen {
            let previous = self.seen_set(index).await?.clone();
            let next = self.next_seen_set(&previous, &staged, now);

            let added = next.keys().filter(|key| !previous.contains_key(*key)).count();
            let expired = previous.keys().filter(|key| !next.contains_key(*key)).count();
            debug!(
                "Seen cache for input #{}: {} added, {} expired, {} kept",
                index,
                added,
                expired,
                next.len() - added
            );
            summary.seen_added += added;
            summary.seen_expired += expired;

            self.store
                .set(&self.task, &seen_key(index), serde_json::to_value(&next)?)
                .await
                .map_err(ParseUrlsError::Store)?;
            self.seen.insert(index, next);
        }

        let staged_throttle = std::mem::take(&mut self.staged_throttle);
        for (title, record) in staged_throttle {
            self.store
                .set(&self.task, &throttle_key(&title), serde_json::to_value(&record)?)
                .await
                .map_err(ParseUrlsError::Store)?;
            summary.throttle_records += 1;
        }

        Ok(summary)
    }

    fn next_seen_set(&self, previous: &SeenSet, staged: &StagedSeen, now: DateTime<Utc>) -> SeenSet {
        let mut next: SeenSet = match self.mode {
            CacheMode::Replace => previous
                .iter()
                .filter(|(key, _)| staged.observed.contains(*key))
                .map(|(key, at)| (key.clone(), *at))
                .collect(),
            CacheMode::Union => {
                let cutoff = now
                    .checked_sub_signed(self.seen_retention)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                previous
                    .iter()
                    .filter(|(_, at)| **at > cutoff)
                    .map(|(key, at)| (key.clone(), *at))
                    .collect()
            }
        };
        for key in &staged.fetched {
            next.insert(key.clone(), now);
        }
        next
    }

    /// Maintenance hook: deletes throttle records that last ran at least
    /// seven days before `now`. Not part of a run.
    pub async fn sweep_throttle_records(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now
            .checked_sub_signed(Duration::days(THROTTLE_RETENTION_DAYS))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let keys = self
            .store
            .keys(&self.task, THROTTLE_PREFIX)
            .await
            .map_err(ParseUrlsError::Store)?;

        let mut removed = 0;
        for key in keys {
            let Some(value) = self.store.get(&self.task, &key).await.map_err(ParseUrlsError::Store)? else {
                continue;
            };
            let record: ThrottleRecord = serde_json::from_value(value).map_err(|e| corrupt(&key, e))?;
            if matches!(record.last_execution, Some(last) if last <= cutoff) {
                debug!("deleting {:?}", record);
                self.store
                    .remove(&self.task, &key)
                    .await
                    .map_err(ParseUrlsError::Store)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} expired throttle records for task {}", removed, self.task);
        }
        Ok(removed)
    }
}

fn seen_key(index: usize) -> String {
    format!("{}{}", SEEN_PREFIX, index)
}

fn throttle_key(title: &str) -> String {
    format!("{}{}", THROTTLE_PREFIX, title)
}

fn corrupt(key: &str, err: serde_json::Error) -> ParseUrlsError {
    ParseUrlsError::CorruptState {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

/// A random offset in `(0, interval]`.
fn jitter<R: Rng>(interval: Duration, rng: &mut R) -> Duration {
    let total = interval.num_milliseconds().max(1);
    let fraction: f64 = rng.random();
    let millis = ((1.0 - fraction) * total as f64).ceil() as i64;
    Duration::milliseconds(millis.clamp(1, total))
}
