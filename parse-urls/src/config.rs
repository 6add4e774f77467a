use crate::types::{ParseUrlsError, Result};
use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const DEFAULT_INTERVAL: &str = "5 hours";
pub const DEFAULT_SEEN_RETENTION: &str = "7 days";
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Longest accepted interval or retention, in days.
pub const MAX_INTERVAL_DAYS: i64 = 3_650;

static INTERVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*([A-Za-z]+)\s*$").expect("valid regex"));

/// One entry under `inputs`: exactly one producer name mapped to its config.
pub type InputBlock = BTreeMap<String, Value>;

/// How the seen cache is rewritten at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Keep the previously seen keys the producer emitted again this run,
    /// plus the keys fetched this run; keys a producer stops emitting age
    /// out. This is not a symmetric difference of old and new sets: a key
    /// that leaves and later returns is fetched again.
    #[default]
    Replace,
    /// Never forget a key until `seen_retention` has passed.
    Union,
}

/// Example:
///
/// ```json
/// {
///   "inputs": [{ "emit_series": {} }, { "rss": "https://example.com/feed" }],
///   "links_re": ["rapidgator\\.net", "uploaded\\.to"],
///   "interval": "1 hour",
///   "ignore_estimations": false,
///   "limit": 10
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParseUrlsConfig {
    pub inputs: Vec<InputBlock>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub links_re: Vec<String>,

    #[serde(default = "default_interval")]
    pub interval: String,

    #[serde(default)]
    pub ignore_estimations: bool,

    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub all_entries: bool,

    #[serde(default)]
    pub cache_mode: CacheMode,

    #[serde(default = "default_seen_retention")]
    pub seen_retention: String,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_interval() -> String {
    DEFAULT_INTERVAL.to_string()
}

fn default_seen_retention() -> String {
    DEFAULT_SEEN_RETENTION.to_string()
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(pattern) => vec![pattern],
        OneOrMany::Many(patterns) => patterns,
    })
}

impl ParseUrlsConfig {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| ParseUrlsError::Configuration(e.to_string()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ParseUrlsError::Configuration(e.to_string()))
    }

    /// Checks everything that does not need the producer registry.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(ParseUrlsError::Configuration(
                "`inputs` must list at least one producer".to_string(),
            ));
        }
        for (index, block) in self.inputs.iter().enumerate() {
            if block.len() != 1 {
                return Err(ParseUrlsError::Configuration(format!(
                    "input #{} must name exactly one producer, found {}",
                    index,
                    block.len()
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(ParseUrlsError::Configuration(
                "`limit` must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ParseUrlsError::Configuration(
                "`concurrency` must be at least 1".to_string(),
            ));
        }
        self.interval()?;
        self.seen_retention()?;
        Ok(())
    }

    pub fn interval(&self) -> Result<Duration> {
        parse_interval(&self.interval)
    }

    pub fn seen_retention(&self) -> Result<Duration> {
        parse_interval(&self.seen_retention)
    }
}

/// Parses `"<n> <unit>"` strings such as `"5 hours"` or `"1 week"`.
pub fn parse_interval(text: &str) -> Result<Duration> {
    let invalid = || ParseUrlsError::InvalidInterval(text.to_string());

    let caps = INTERVAL_RE.captures(text).ok_or_else(invalid)?;
    let amount: i64 = caps[1].parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }

    let unit_seconds: i64 = match caps[2].to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return Err(invalid()),
    };

    amount
        .checked_mul(unit_seconds)
        .and_then(Duration::try_seconds)
        .filter(|duration| *duration <= Duration::days(MAX_INTERVAL_DAYS))
        .ok_or_else(invalid)
}

/// Retry policy for transient fetch failures.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_retries: u32,
    pub retry_delay: std::time::Duration,
    pub max_retry_delay: std::time::Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: std::time::Duration::from_secs(5),
            max_retry_delay: std::time::Duration::from_secs(5 * 32),
        }
    }
}
