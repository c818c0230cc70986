//! Network to data source resolution

use std::fmt;
use std::sync::Arc;

use super::{DataSource, SourceError};
use crate::chain::Network;

/// Builds a data source for a network, or declines with `None`
pub type SourceFactory = Box<dyn Fn(&Network) -> Option<Arc<dyn DataSource>> + Send + Sync>;

/// Ordered list of data source factories, probed first to last
#[derive(Default)]
pub struct SourceRegistry {
    factories: Vec<SourceFactory>,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, factory: F)
    where
        F: Fn(&Network) -> Option<Arc<dyn DataSource>> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    /// Register a fixed source for every network with its name
    pub fn add_source(&mut self, source: Arc<dyn DataSource>) {
        self.add(move |network| {
            (source.network().name == network.name).then(|| source.clone())
        });
    }

    /// First source any factory produces for `network`
    pub fn resolve(&self, network: &Network) -> Result<Arc<dyn DataSource>, SourceError> {
        self.factories
            .iter()
            .find_map(|factory| factory(network))
            .ok_or_else(|| SourceError::NoSource(network.name.clone()))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
