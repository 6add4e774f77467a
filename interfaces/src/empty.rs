use std::collections::HashSet;

use async_trait::async_trait;

use crate::defs::AggregatedItem;
use crate::defs::BacklogRegistry;
use crate::defs::ReleaseEstimate;
use crate::defs::ReleaseEstimator;
use crate::defs::TaskInfo;

pub struct NoBacklog;

#[async_trait]
impl BacklogRegistry for NoBacklog {
    async fn injected_keys(&self, _task: &TaskInfo) -> anyhow::Result<HashSet<String>> {
        // Nothing is ever retried.
        Ok(HashSet::new())
    }
}

pub struct NoEstimates;

#[async_trait]
impl ReleaseEstimator for NoEstimates {
    async fn estimate(&self, _item: &AggregatedItem) -> anyhow::Result<ReleaseEstimate> {
        Ok(ReleaseEstimate::Unknown)
    }
}
