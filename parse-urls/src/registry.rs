use crate::config::InputBlock;
use crate::types::{ParseUrlsError, Result};
use interfaces::defs::Producer;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Producers available to `inputs`, by name.
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    producers: BTreeMap<String, Arc<dyn Producer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, producer: Arc<dyn Producer>) {
        self.producers.insert(name.into(), producer);
    }

    pub fn with(mut self, name: impl Into<String>, producer: Arc<dyn Producer>) -> Self {
        self.register(name, producer);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Producer>> {
        self.producers.get(name).cloned()
    }

    /// Binds every input block to its producer; an unknown name fails setup.
    pub fn resolve(&self, inputs: &[InputBlock]) -> Result<Vec<ResolvedInput>> {
        inputs
            .iter()
            .enumerate()
            .map(|(index, block)| {
                let mut entries = block.iter();
                let (name, config) = match (entries.next(), entries.next()) {
                    (Some(entry), None) => entry,
                    _ => {
                        return Err(ParseUrlsError::Configuration(format!(
                            "input #{} must name exactly one producer",
                            index
                        )))
                    }
                };
                let producer = self
                    .get(name)
                    .ok_or_else(|| ParseUrlsError::UnknownProducer(name.clone()))?;
                Ok(ResolvedInput {
                    index,
                    name: name.clone(),
                    config: config.clone(),
                    producer,
                })
            })
            .collect()
    }
}

/// An input block bound to its producer. `index` scopes the seen cache.
#[derive(Clone)]
pub struct ResolvedInput {
    pub index: usize,
    pub name: String,
    pub config: Value,
    pub producer: Arc<dyn Producer>,
}
