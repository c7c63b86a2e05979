use std::collections::HashMap;
use std::sync::Arc;

use genforge_generation::ProviderId;

use crate::adapter::ProviderAdapter;

/// Provider tag -> adapter.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the adapter's own id, replacing any previous entry.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&id).cloned()
    }

    pub fn contains(&self, id: ProviderId) -> bool {
        self.adapters.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<_> = self.adapters.keys().copied().collect();
        ids.sort_by_key(|id| id.as_str());
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl core::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FalAdapter, ReplicateAdapter};

    #[test]
    fn lookup_by_adapter_id() {
        let client = reqwest::Client::new();
        let registry = ProviderRegistry::new()
            .with(Arc::new(ReplicateAdapter::new(client.clone(), "t", "http://r")))
            .with(Arc::new(FalAdapter::new(client, "k", "http://f")));

        assert!(registry.contains(ProviderId::Fal));
        assert!(registry.get(ProviderId::TaskApi).is_none());
        assert_eq!(registry.ids(), vec![ProviderId::Fal, ProviderId::Replicate]);
    }
}
