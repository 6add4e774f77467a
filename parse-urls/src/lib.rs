pub mod types;
pub mod config;
pub mod matcher;
pub mod store;
pub mod cache;
pub mod context;
pub mod registry;
pub mod aggregator;
pub mod gate;
pub mod fetcher;
pub mod extractor;
pub mod pipeline;

pub use types::*;
pub use config::{parse_interval, CacheMode, FetchConfig, InputBlock, ParseUrlsConfig};
pub use matcher::LinkMatcher;
pub use store::MemoryTaskStore;
pub use cache::{CacheStore, CommitSummary};
pub use context::RunContext;
pub use registry::{ProducerRegistry, ResolvedInput};
pub use aggregator::{Aggregation, AggregationStats, Aggregator};
pub use gate::{EstimationGate, GateStage, IntervalGate};
pub use fetcher::RetryingFetcher;
pub use extractor::{ExtractStats, LinkHarvester};
pub use pipeline::{Collaborators, ParseUrls};
