//! Registry for managing provider plugins.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::Provider;
use crate::config::{ConfigError, ProviderConfig, ProviderKind};
use crate::models::{QueryFields, SearchQuery, MAX_LIMIT};

/// What a provider can filter on and what it returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// Query fields this provider can filter on
    pub filterable: QueryFields,

    /// Property names present in returned records
    pub properties: BTreeSet<String>,

    /// Provider-specific extra field names
    pub extra_fields: BTreeSet<String>,

    /// Whether the provider pages its results
    pub supports_pagination: bool,

    /// Most records a single call may return
    pub max_results: usize,
}

impl ProviderCapabilities {
    pub fn new(filterable: QueryFields) -> Self {
        Self {
            filterable,
            properties: BTreeSet::new(),
            extra_fields: BTreeSet::new(),
            supports_pagination: false,
            max_results: MAX_LIMIT,
        }
    }

    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pagination(mut self, supported: bool) -> Self {
        self.supports_pagination = supported;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// True only if every non-empty, non-control field of `query` is
    /// filterable here
    pub fn can_handle(&self, query: &SearchQuery) -> bool {
        self.filterable.contains(query.filter_fields())
    }

    /// Names of the filterable fields
    pub fn filterable_names(&self) -> Vec<&'static str> {
        self.filterable.field_names()
    }
}

/// Registry of available providers.
///
/// Registration order is preserved; it is the order providers are
/// attempted and the order their records are fused in.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled provider described in the configuration
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        for config in configs.iter().filter(|c| c.enabled) {
            let provider = build_provider(config)?;
            tracing::debug!(
                "Registered provider {} ({}) at {}",
                provider.id(),
                provider.name(),
                provider.endpoint()
            );
            registry.register(provider);
        }

        Ok(registry)
    }

    /// Register a provider, replacing any existing one with the same id
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let id = provider.id().to_string();
        match self.index.get(&id) {
            Some(&pos) => self.providers[pos] = provider,
            None => {
                self.index.insert(id, self.providers.len());
                self.providers.push(provider);
            }
        }
    }

    /// Get a provider by id
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Provider>> {
        self.index.get(id).map(|&pos| &self.providers[pos])
    }

    /// All providers, in registration order
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter()
    }

    /// All provider ids, in registration order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.id())
    }

    /// Providers able to answer `query` and admitted by its allowlist
    pub fn capable_of(&self, query: &SearchQuery) -> Vec<Arc<dyn Provider>> {
        self.providers
            .iter()
            .filter(|p| query.allows_provider(p.id()) && p.can_handle(query))
            .cloned()
            .collect()
    }

    pub fn has(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn resolve_api_key(config: &ProviderConfig) -> Option<String> {
    config
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|key| !key.trim().is_empty())
}

fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> {
    let filterable = config.filterable_fields()?;
    let api_key = resolve_api_key(config);
    if config.api_key_env.is_some() && api_key.is_none() {
        tracing::warn!(
            "{}: credential variable {} is not set",
            config.id,
            config.api_key_env.as_deref().unwrap_or_default()
        );
    }

    match config.kind {
        #[cfg(feature = "source-optimade")]
        ProviderKind::Optimade => {
            let mut provider =
                super::OptimadeProvider::new(&config.id, config.display_name(), &config.base_url)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if let Some(fields) = filterable {
                provider = provider.with_filterable(fields);
            }
            if let Some(max) = config.max_results {
                provider = provider.with_max_results(max);
            }
            if let Some(secs) = config.timeout_seconds {
                provider = provider.with_timeout(std::time::Duration::from_secs(secs));
            }
            if config.api_key_env.is_some() {
                provider = provider.with_api_key(api_key);
            }
            Ok(Arc::new(provider))
        }
        #[cfg(feature = "source-materials-project")]
        ProviderKind::MaterialsProject => {
            let mut provider = super::MaterialsProjectProvider::new(
                &config.id,
                config.display_name(),
                &config.base_url,
                api_key,
            )
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if let Some(fields) = filterable {
                provider = provider.with_filterable(fields);
            }
            if let Some(max) = config.max_results {
                provider = provider.with_max_results(max);
            }
            if let Some(secs) = config.timeout_seconds {
                provider = provider.with_timeout(std::time::Duration::from_secs(secs));
            }
            Ok(Arc::new(provider))
        }
        #[allow(unreachable_patterns)]
        other => Err(ConfigError::Invalid(format!(
            "provider '{}': kind {:?} is not compiled in",
            config.id, other
        ))),
    }
}
