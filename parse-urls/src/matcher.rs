use crate::types::{ParseUrlsError, Result};
use regex::Regex;

/// Acceptance patterns for extracted links. Patterns search anywhere in the
/// candidate; an empty set accepts everything.
#[derive(Debug, Clone, Default)]
pub struct LinkMatcher {
    patterns: Vec<Regex>,
}

impl LinkMatcher {
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Compiles every pattern up front so a bad one fails setup, not a run.
    pub fn compile<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(pattern).map_err(|source| ParseUrlsError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_accept_all(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        matches(&self.patterns, candidate)
    }
}

pub fn matches(patterns: &[Regex], candidate: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|pattern| pattern.is_match(candidate))
}
