//! SourceRegistry - source 名 → SourceAdapter の静的レジストリ
//!
//! Filled once by the builder, read-only afterwards, shared by all workers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::SourceId;
use crate::ports::SourceAdapter;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Adapter for source '{0}' is already registered")]
    AlreadyRegistered(SourceId),
}

#[derive(Default, Clone)]
pub struct SourceRegistry {
    adapters: HashMap<SourceId, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<(), RegistryError> {
        let source = adapter.source().clone();
        if self.adapters.contains_key(&source) {
            return Err(RegistryError::AlreadyRegistered(source));
        }
        self.adapters.insert(source, adapter);
        Ok(())
    }

    pub fn get(&self, source: &SourceId) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source).cloned()
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        self.adapters.contains_key(source)
    }

    pub fn registered_sources(&self) -> Vec<SourceId> {
        let mut sources: Vec<SourceId> = self.adapters.keys().cloned().collect();
        sources.sort();
        sources
    }
}
