use crate::context::RunContext;
use crate::types::{AggregatedItem, RejectReason, Result, ThrottleDecision};
use async_trait::async_trait;
use chrono::Duration;
use interfaces::defs::ReleaseEstimator;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A filter between aggregation and fetching.
///
/// Stages see every item but only judge the ones still pending; a rejected
/// item stays in the list, marked with why it stopped.
#[async_trait]
pub trait GateStage: Send + Sync {
    async fn process(
        &mut self,
        items: Vec<AggregatedItem>,
        ctx: &mut RunContext,
    ) -> Result<Vec<AggregatedItem>>;

    fn stage_name(&self) -> String;
}

/// Keeps a title from being parsed more than once per interval.
pub struct IntervalGate {
    interval: Duration,
    label: String,
}

impl IntervalGate {
    /// `label` is the interval as configured, used in log messages.
    pub fn new(interval: Duration, label: impl Into<String>) -> Self {
        Self {
            interval,
            label: label.into(),
        }
    }
}

#[async_trait]
impl GateStage for IntervalGate {
    async fn process(
        &mut self,
        mut items: Vec<AggregatedItem>,
        ctx: &mut RunContext,
    ) -> Result<Vec<AggregatedItem>> {
        let now = ctx.task.now;
        let force = ctx.task.run_now;
        if force {
            info!("Ignoring interval because of run-now override");
        }

        let mut not_met = 0;
        for item in items.iter_mut().filter(|item| item.outcome.is_pending()) {
            let decision = ctx
                .cache
                .throttle_check(&item.title, self.interval, now, &mut ctx.rng, force)
                .await?;
            match decision {
                ThrottleDecision::Admit => debug!("{}: interval passed", item.title),
                ThrottleDecision::RejectNotExpired { next_due } => {
                    debug!("{}: next parse due at {}", item.title, next_due);
                    item.reject(RejectReason::IntervalNotMet);
                    not_met += 1;
                }
            }
        }

        if not_met > 0 {
            info!(
                "Interval of {} not met for {} items. Use the run-now override to ignore it.",
                self.label, not_met
            );
        }
        Ok(items)
    }

    fn stage_name(&self) -> String {
        "interval".to_string()
    }
}

/// Holds back items whose release is expected in the future.
pub struct EstimationGate {
    estimator: Arc<dyn ReleaseEstimator>,
}

impl EstimationGate {
    pub fn new(estimator: Arc<dyn ReleaseEstimator>) -> Self {
        Self { estimator }
    }
}

#[async_trait]
impl GateStage for EstimationGate {
    async fn process(
        &mut self,
        mut items: Vec<AggregatedItem>,
        ctx: &mut RunContext,
    ) -> Result<Vec<AggregatedItem>> {
        let now = ctx.task.now;

        for item in items.iter_mut().filter(|item| item.outcome.is_pending()) {
            let estimate = match self.estimator.estimate(item).await {
                Ok(estimate) => estimate,
                Err(e) => {
                    warn!("Release estimation failed for {}: {}", item.title, e);
                    continue;
                }
            };

            match estimate.available_from() {
                None => debug!("No release date could be determined for {}", item.title),
                Some(at) if now >= at => debug!("{} has been released at {}", item.title, at),
                Some(at) => {
                    debug!("{} hasn't been released yet (Expected: {})", item.title, at);
                    item.reject(RejectReason::NotYetReleased(at));
                }
            }
        }
        Ok(items)
    }

    fn stage_name(&self) -> String {
        "estimation".to_string()
    }
}
