//! Provider credentials from the environment.
//!
//! A provider is registered only when its key variable is set and non-empty.

use std::sync::Arc;

use reqwest::Client;
use tracing::info;

use crate::registry::ProviderRegistry;
use crate::{fal, replicate, taskapi};
use crate::{FalAdapter, ReplicateAdapter, TaskApiAdapter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub replicate: Option<ApiCredentials>,
    pub fal: Option<ApiCredentials>,
    pub taskapi: Option<ApiCredentials>,
}

impl ProviderSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (env, test map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let creds = |key_var: &str, url_var: &str, default_url: &str| {
            lookup(key_var)
                .filter(|k| !k.trim().is_empty())
                .map(|api_key| ApiCredentials {
                    api_key,
                    base_url: lookup(url_var)
                        .filter(|u| !u.trim().is_empty())
                        .unwrap_or_else(|| default_url.to_string()),
                })
        };
        Self {
            replicate: creds("REPLICATE_API_TOKEN", "REPLICATE_BASE_URL", replicate::DEFAULT_BASE_URL),
            fal: creds("FAL_API_KEY", "FAL_BASE_URL", fal::DEFAULT_BASE_URL),
            taskapi: creds("TASKAPI_API_KEY", "TASKAPI_BASE_URL", taskapi::DEFAULT_BASE_URL),
        }
    }

    pub fn build_registry(&self, client: Client) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        if let Some(c) = &self.replicate {
            registry.register(Arc::new(ReplicateAdapter::new(
                client.clone(),
                c.api_key.clone(),
                c.base_url.clone(),
            )));
        }
        if let Some(c) = &self.fal {
            registry.register(Arc::new(FalAdapter::new(
                client.clone(),
                c.api_key.clone(),
                c.base_url.clone(),
            )));
        }
        if let Some(c) = &self.taskapi {
            registry.register(Arc::new(TaskApiAdapter::new(
                client,
                c.api_key.clone(),
                c.base_url.clone(),
            )));
        }
        info!(providers = ?registry.ids(), "provider registry built");
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn only_configured_providers_are_enabled() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FAL_API_KEY", "fal-key"),
            ("FAL_BASE_URL", "http://localhost:9000"),
            ("REPLICATE_API_TOKEN", "  "),
        ]);
        let s = ProviderSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert!(s.replicate.is_none());
        assert!(s.taskapi.is_none());
        assert_eq!(
            s.fal,
            Some(ApiCredentials {
                api_key: "fal-key".into(),
                base_url: "http://localhost:9000".into()
            })
        );
    }
}
