use crate::cache::CacheStore;
use crate::types::TaskInfo;
use rand::rngs::StdRng;
use uuid::Uuid;

/// State threaded through the stages of one run.
pub struct RunContext {
    pub run_id: Uuid,
    pub task: TaskInfo,
    pub cache: CacheStore,
    /// Source of throttle jitter; seed it for reproducible runs.
    pub rng: StdRng,
}

impl RunContext {
    pub fn new(task: TaskInfo, cache: CacheStore, rng: StdRng) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            task,
            cache,
            rng,
        }
    }
}
