use crate::context::RunContext;
use crate::registry::ResolvedInput;
use crate::types::{AggregatedItem, CandidateItem, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationStats {
    pub candidates: usize,
    pub invalid: usize,
    pub seen: usize,
    pub duplicate_urls: usize,
    pub folded: usize,
    pub failed_inputs: usize,
    pub empty_inputs: usize,
}

/// Result of folding every producer's candidates.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub items: Vec<AggregatedItem>,
    /// Input indexes that contributed to each title.
    pub origins: HashMap<String, BTreeSet<usize>>,
    pub stats: AggregationStats,
}

/// Runs the configured producers and collapses their candidates into one
/// item per title.
pub struct Aggregator<'a> {
    inputs: &'a [ResolvedInput],
    all_entries: bool,
}

impl<'a> Aggregator<'a> {
    pub fn new(inputs: &'a [ResolvedInput]) -> Self {
        Self {
            inputs,
            all_entries: false,
        }
    }

    /// Skip the seen cache and take every candidate.
    pub fn with_all_entries(mut self, all_entries: bool) -> Self {
        self.all_entries = all_entries;
        self
    }

    pub async fn aggregate(&self, ctx: &mut RunContext) -> Result<Aggregation> {
        let mut fold = Fold::default();

        for input in self.inputs {
            let candidates = match input.producer.produce(&input.config, &ctx.task).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("Error during input {} (#{}): {}", input.name, input.index, e);
                    fold.aggregation.stats.failed_inputs += 1;
                    continue;
                }
            };

            if candidates.is_empty() {
                warn!("Input {} (#{}) did not return anything", input.name, input.index);
                fold.aggregation.stats.empty_inputs += 1;
                continue;
            }

            debug!("Input {} returned {} candidates", input.name, candidates.len());
            for candidate in candidates {
                self.admit(input, candidate, ctx, &mut fold).await?;
            }
        }

        let stats = fold.aggregation.stats;
        info!(
            "Aggregated {} titles from {} candidates ({} seen, {} duplicate URLs, {} folded, {} invalid)",
            fold.aggregation.items.len(),
            stats.candidates,
            stats.seen,
            stats.duplicate_urls,
            stats.folded,
            stats.invalid
        );
        Ok(fold.aggregation)
    }

    async fn admit(
        &self,
        input: &ResolvedInput,
        candidate: CandidateItem,
        ctx: &mut RunContext,
        fold: &mut Fold,
    ) -> Result<()> {
        fold.aggregation.stats.candidates += 1;

        if !candidate.is_valid() {
            warn!("Input {} produced an item without title or URL, dropping: {:?}", input.name, candidate);
            fold.aggregation.stats.invalid += 1;
            return Ok(());
        }

        let title = candidate.title.clone();
        ctx.cache.observe(input.index, &title);

        if !self.all_entries && ctx.cache.is_seen(input.index, &title).await? {
            debug!("`{}` was already processed by input #{}, skipping", title, input.index);
            fold.aggregation.stats.seen += 1;
            return Ok(());
        }

        let urls = candidate.index_urls();
        let existing = fold.by_title.get(&title).copied();

        let taken = urls
            .iter()
            .filter_map(|url| fold.url_owner.get(url).copied())
            .find(|owner| Some(*owner) != existing);
        if let Some(owner) = taken {
            debug!(
                "URL for `{}` already in entry list under `{}`, skipping.",
                title, fold.aggregation.items[owner].title
            );
            fold.aggregation.stats.duplicate_urls += 1;
            return Ok(());
        }

        let position = match existing {
            Some(position) => {
                debug!("Folding duplicate title `{}`", title);
                fold.aggregation.stats.folded += 1;
                position
            }
            None => {
                let position = fold.aggregation.items.len();
                fold.aggregation
                    .items
                    .push(AggregatedItem::new(title.clone(), urls[0].clone()));
                fold.by_title.insert(title.clone(), position);
                position
            }
        };

        for url in urls {
            fold.aggregation.items[position].fold_url(&url);
            fold.url_owner.entry(url).or_insert(position);
        }
        fold.aggregation
            .origins
            .entry(title)
            .or_default()
            .insert(input.index);
        Ok(())
    }
}

#[derive(Default)]
struct Fold {
    aggregation: Aggregation,
    by_title: HashMap<String, usize>,
    url_owner: HashMap<String, usize>,
}
