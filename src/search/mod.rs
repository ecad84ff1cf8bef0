//! Federated search orchestration.
//!
//! [`SearchOrchestrator`] is the single entry point for a search. It owns the
//! provider registry and shares the health registry and result cache, both of
//! which outlive any one request.
//!
//! Per request it:
//!
//! 1. Returns a fresh cached result when one exists
//! 2. Selects providers able to filter on every field of the query
//! 3. Drops providers whose circuit is open
//! 4. Calls the rest concurrently, each bounded by its own timeout
//! 5. Logs and records health for every provider it called
//! 6. Fuses the records and applies the query limit
//! 7. Caches the result and persists health state

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;

use crate::config::{Config, ConfigError};
use crate::models::{Material, ProviderQueryLog, QueryStatus, SearchQuery, SearchResult};
use crate::sources::{Provider, ProviderError, ProviderRegistry};
use crate::utils::{fuse_materials, HealthManager, ProviderHealth, ResultCache};

/// Timeout used when neither the provider nor the options set one
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator behaviour
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub default_timeout: Duration,

    /// Per-provider timeouts, consulted when the provider has no override
    pub provider_timeouts: HashMap<String, Duration>,

    /// Attach cache statistics to every result
    pub include_cache_stats: bool,

    /// Write the health snapshot to disk after each search
    pub persist_health: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_PROVIDER_TIMEOUT,
            provider_timeouts: HashMap::new(),
            include_cache_stats: false,
            persist_health: false,
        }
    }
}

impl From<&Config> for SearchOptions {
    fn from(config: &Config) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.search.default_timeout_seconds),
            provider_timeouts: config
                .search
                .provider_timeouts
                .iter()
                .map(|(id, secs)| (id.clone(), Duration::from_secs(*secs)))
                .collect(),
            include_cache_stats: config.search.include_cache_stats,
            persist_health: config.health.persist,
        }
    }
}

/// What came back from one spawned provider call
type CallOutcome = Result<(Result<Vec<Material>, ProviderError>, Duration), JoinError>;

/// Coordinates providers, health, cache and fusion for each search
#[derive(Debug, Clone)]
pub struct SearchOrchestrator {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthManager>,
    cache: Option<Arc<ResultCache>>,
    options: SearchOptions,
}

impl SearchOrchestrator {
    /// Create an orchestrator without a cache
    pub fn new(registry: ProviderRegistry, health: Arc<HealthManager>) -> Self {
        Self {
            registry: Arc::new(registry),
            health,
            cache: None,
            options: SearchOptions::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }

    /// Build providers, health and cache state from configuration, loading
    /// any persisted state from disk
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let registry = ProviderRegistry::from_config(&config.providers)?;

        let policy = config.health.policy();
        let health = if config.health.persist {
            HealthManager::load(config.health.resolved_path(), policy)
        } else {
            HealthManager::new(policy)
        };

        let mut orchestrator = Self::new(registry, Arc::new(health))
            .with_options(SearchOptions::from(config));

        if config.cache.enabled {
            let cache = if config.cache.persist {
                ResultCache::load(config.cache.resolved_directory(), config.cache.ttl())
            } else {
                ResultCache::new(config.cache.ttl())
            };
            orchestrator = orchestrator.with_cache(Arc::new(cache));
        }

        Ok(orchestrator)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthManager> {
        &self.health
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    /// Run a federated search.
    ///
    /// Provider failures never fail the search; they surface as log entries
    /// and warnings on the returned result.
    pub async fn search(&self, query: &SearchQuery) -> SearchResult {
        let start = Instant::now();

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(query) {
                return if self.options.include_cache_stats {
                    hit.with_cache_stats(cache.stats())
                } else {
                    hit
                };
            }
        }

        if let Some(ids) = query.providers() {
            if !ids.iter().any(|id| self.registry.has(id)) {
                let warning = format!(
                    "None of the requested providers are registered: {}",
                    ids.join(", ")
                );
                tracing::warn!("{}", warning);
                return SearchResult::empty(query.clone(), warning, start.elapsed());
            }
        }

        let capable = self.registry.capable_of(query);
        if capable.is_empty() {
            tracing::warn!("No provider can handle query: {}", query.query_hash());
            return SearchResult::empty(
                query.clone(),
                "No registered provider supports every field of this query",
                start.elapsed(),
            );
        }

        let (selected, skipped): (Vec<_>, Vec<_>) = capable
            .into_iter()
            .partition(|provider| self.health.should_query(provider.id()));
        for provider in &skipped {
            tracing::debug!("Skipping {}: circuit open", provider.id());
        }
        if selected.is_empty() {
            let ids: Vec<&str> = skipped.iter().map(|p| p.id()).collect();
            tracing::warn!("All capable providers unavailable: {}", ids.join(", "));
            return SearchResult::empty(
                query.clone(),
                format!(
                    "All capable providers are temporarily unavailable: {}",
                    ids.join(", ")
                ),
                start.elapsed(),
            );
        }

        tracing::info!("Querying {} providers", selected.len());

        let mut pending = Vec::with_capacity(selected.len());
        let mut handles = Vec::with_capacity(selected.len());
        for provider in selected {
            let timeout = self.timeout_for(provider.as_ref());
            let log = ProviderQueryLog::started(
                provider.id(),
                provider.name(),
                provider.endpoint(),
                provider.wire_query(query),
                chrono::Utc::now(),
            );
            handles.push(tokio::spawn(call_provider(
                Arc::clone(&provider),
                query.clone(),
                timeout,
            )));
            pending.push((provider, log, Instant::now()));
        }

        let outcomes = join_all(handles).await;

        let mut logs = Vec::with_capacity(outcomes.len());
        let mut warnings = Vec::new();
        let mut records = Vec::new();
        for ((provider, log, called_at), outcome) in pending.into_iter().zip(outcomes) {
            let (log, found) = self.settle(provider.as_ref(), log, called_at, outcome);
            if let Some(message) = log.error_message.as_deref() {
                warnings.push(format!("{} ({}): {}", provider.name(), provider.id(), message));
            }
            if let Some(found) = found {
                records.extend(found);
            }
            logs.push(log);
        }

        let any_success = logs.iter().any(|log| log.status.is_success());

        let mut materials = fuse_materials(records);
        let total_count = materials.len();
        materials.truncate(query.limit());

        if any_success && total_count == 0 {
            warnings.push("No materials matched the query".to_string());
        }

        let result = SearchResult::new(
            materials,
            total_count,
            query.clone(),
            logs,
            warnings,
            start.elapsed(),
            None,
        );

        tracing::info!(
            "Search returned {} materials ({} fused) in {:.0}ms",
            result.materials().len(),
            total_count,
            result.search_time_ms()
        );

        self.finish(query, result).await
    }

    /// A material seen in any cached search, by id
    pub fn get_material(&self, id: &str) -> Option<Material> {
        self.cache.as_ref().and_then(|cache| cache.get_material(id))
    }

    /// Health of every provider that has been called, sorted by id
    pub fn health_status(&self) -> Vec<(String, ProviderHealth)> {
        self.health.status()
    }

    /// Run every provider's liveness probe concurrently
    pub async fn check_providers(&self) -> Vec<(String, bool)> {
        let probes = self.registry.all().map(|provider| {
            let provider = Arc::clone(provider);
            let timeout = self.timeout_for(provider.as_ref());
            async move {
                let healthy = tokio::time::timeout(timeout, provider.health_check())
                    .await
                    .unwrap_or(false);
                if !healthy {
                    tracing::warn!("Health check failed for {}", provider.id());
                }
                (provider.id().to_string(), healthy)
            }
        });
        join_all(probes).await
    }

    /// Provider override, then configured per-id timeout, then the default
    fn timeout_for(&self, provider: &dyn Provider) -> Duration {
        provider
            .timeout()
            .or_else(|| self.options.provider_timeouts.get(provider.id()).copied())
            .unwrap_or(self.options.default_timeout)
    }

    /// Complete a provider's log entry and update its health
    fn settle(
        &self,
        provider: &dyn Provider,
        log: ProviderQueryLog,
        called_at: Instant,
        outcome: CallOutcome,
    ) -> (ProviderQueryLog, Option<Vec<Material>>) {
        let id = provider.id();
        match outcome {
            Ok((Ok(found), latency)) => {
                tracing::debug!(
                    "{} returned {} records in {:?}",
                    id,
                    found.len(),
                    latency
                );
                self.health.record_success(id, latency);
                let log = log.succeeded(latency, found.len());
                (log, Some(found))
            }
            Ok((Err(err), latency)) => {
                tracing::warn!("Search failed for {}: {}", id, err);
                self.health.record_failure(id);
                let log = log.failed(
                    latency,
                    err.status(),
                    err.http_status(),
                    err.error_type(),
                    err.to_string(),
                );
                (log, None)
            }
            Err(join_err) => {
                let (error_type, message) = if join_err.is_panic() {
                    ("panic", "provider panicked during search".to_string())
                } else {
                    ("cancelled", "provider call was cancelled".to_string())
                };
                tracing::error!("Search aborted for {}: {}", id, message);
                self.health.record_failure(id);
                let log = log.failed(
                    called_at.elapsed(),
                    QueryStatus::HttpError,
                    None,
                    error_type,
                    message,
                );
                (log, None)
            }
        }
    }

    /// Cache the result and persist health, returning the result to hand out
    async fn finish(&self, query: &SearchQuery, result: SearchResult) -> SearchResult {
        if self.options.persist_health {
            if let Err(e) = self.health.save().await {
                tracing::warn!("Failed to persist health state: {}", e);
            }
        }

        let Some(cache) = &self.cache else {
            return result;
        };

        if result.any_success() {
            if let Err(e) = cache.put(query, &result).await {
                tracing::warn!("Failed to cache search result: {}", e);
            }
        }

        if self.options.include_cache_stats {
            result.with_cache_stats(cache.stats())
        } else {
            result
        }
    }
}

/// Body of a spawned provider call. Measures its own latency so a slow
/// sibling does not inflate it.
async fn call_provider(
    provider: Arc<dyn Provider>,
    query: SearchQuery,
    timeout: Duration,
) -> (Result<Vec<Material>, ProviderError>, Duration) {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, provider.search(&query)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    };
    (outcome, started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryFields;
    use crate::sources::mock::{make_material, MockProvider};
    use crate::utils::{CircuitState, HealthPolicy};

    fn fe_o() -> SearchQuery {
        SearchQuery::with_elements(["Fe", "O"]).unwrap()
    }

    fn orchestrator(providers: Vec<Arc<MockProvider>>) -> SearchOrchestrator {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(provider);
        }
        SearchOrchestrator::new(registry, Arc::new(HealthManager::new(HealthPolicy::default())))
    }

    #[test]
    fn test_timeout_precedence() {
        let with_override = MockProvider::new("a").with_timeout(Duration::from_secs(5));
        let plain = MockProvider::new("b");
        let other = MockProvider::new("c");

        let mut options = SearchOptions {
            default_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        options
            .provider_timeouts
            .insert("b".into(), Duration::from_secs(12));
        options
            .provider_timeouts
            .insert("a".into(), Duration::from_secs(99));

        let orch = orchestrator(vec![]).with_options(options);
        assert_eq!(orch.timeout_for(&with_override), Duration::from_secs(5));
        assert_eq!(orch.timeout_for(&plain), Duration::from_secs(12));
        assert_eq!(orch.timeout_for(&other), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_success_logs_wire_query() {
        let a = Arc::new(
            MockProvider::new("a").with_materials(vec![make_material("a-1", "Fe2O3", "a")]),
        );
        let orch = orchestrator(vec![a.clone()]);
        let query = fe_o();

        let result = orch.search(&query).await;
        assert_eq!(result.materials().len(), 1);
        assert!(result.warnings().is_empty());

        let log = result.log_for("a").unwrap();
        assert_eq!(log.status, QueryStatus::Success);
        assert_eq!(log.result_count, 1);
        assert_eq!(log.endpoint, "mock://a");
        assert_eq!(log.query_sent, "elements HAS ALL \"Fe\",\"O\"");
        assert_eq!(orch.health().snapshot("a").unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_incapable_provider_not_called() {
        let a = Arc::new(MockProvider::new("a").with_filterable(QueryFields::FORMULA));
        let orch = orchestrator(vec![a.clone()]);

        let result = orch.search(&fe_o()).await;
        assert!(result.materials().is_empty());
        assert!(result.provider_logs().is_empty());
        assert_eq!(result.warnings().len(), 1);
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_allowlist_warning() {
        let a = Arc::new(MockProvider::new("a"));
        let orch = orchestrator(vec![a.clone()]);
        let query = SearchQuery::builder()
            .elements(["Fe"])
            .providers(["zz"])
            .build()
            .unwrap();

        let result = orch.search(&query).await;
        assert!(result.provider_logs().is_empty());
        assert_eq!(
            result.warnings(),
            ["None of the requested providers are registered: zz"]
        );
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_allowlist_reaches_every_provider() {
        let a = Arc::new(MockProvider::new("a"));
        let orch = orchestrator(vec![a.clone()]);
        let query = SearchQuery::builder()
            .elements(["Fe"])
            .providers([" "])
            .build()
            .unwrap();

        let result = orch.search(&query).await;
        assert_eq!(a.call_count(), 1);
        assert!(result.log_for("a").is_some());
    }

    #[tokio::test]
    async fn test_open_circuit_yields_empty_result() {
        let a = Arc::new(MockProvider::new("a"));
        let orch = orchestrator(vec![a.clone()]);
        for _ in 0..3 {
            orch.health().record_failure("a");
        }
        assert_eq!(orch.health().state("a"), CircuitState::Open);

        let result = orch.search(&fe_o()).await;
        assert!(result.provider_logs().is_empty());
        assert!(result.warnings()[0].contains("a"));
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn test_parse_error_status() {
        let a = Arc::new(MockProvider::new("a").with_error(ProviderError::Parse("bad".into())));
        let orch = orchestrator(vec![a]);

        let result = orch.search(&fe_o()).await;
        let log = result.log_for("a").unwrap();
        assert_eq!(log.status, QueryStatus::ParseError);
        assert_eq!(log.error_type.as_deref(), Some("parse"));
        assert_eq!(orch.health().snapshot("a").unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_total_count_before_limit() {
        let materials = vec![
            make_material("a-1", "FeO", "a"),
            make_material("a-2", "Fe2O3", "a"),
            make_material("a-3", "Fe3O4", "a"),
        ];
        let a = Arc::new(MockProvider::new("a").with_materials(materials));
        let orch = orchestrator(vec![a]);

        let query = SearchQuery::builder()
            .elements(["Fe", "O"])
            .limit(2)
            .build()
            .unwrap();
        let result = orch.search(&query).await;
        assert_eq!(result.materials().len(), 2);
        assert_eq!(result.total_count(), 3);
    }

    #[tokio::test]
    async fn test_no_match_warning() {
        let orch = orchestrator(vec![Arc::new(MockProvider::new("a"))]);
        let result = orch.search(&fe_o()).await;
        assert!(result.any_success());
        assert_eq!(result.warnings(), ["No materials matched the query"]);
    }

    #[tokio::test]
    async fn test_check_providers() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        b.set_healthy(false);
        let orch = orchestrator(vec![a, b]);

        let status = orch.check_providers().await;
        assert_eq!(status, vec![("a".to_string(), true), ("b".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_cache_stats_attached_when_enabled() {
        let a = Arc::new(
            MockProvider::new("a").with_materials(vec![make_material("a-1", "FeO", "a")]),
        );
        let orch = orchestrator(vec![a])
            .with_cache(Arc::new(ResultCache::new(Duration::from_secs(60))))
            .with_options(SearchOptions {
                include_cache_stats: true,
                ..Default::default()
            });

        let result = orch.search(&fe_o()).await;
        assert_eq!(result.cache_stats().unwrap().entries, 1);
        assert_eq!(orch.get_material("a-1").unwrap().formula, "FeO");
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.search.default_timeout_seconds = 10;
        config.search.provider_timeouts.insert("mp".into(), 45);
        config.health.persist = false;

        let options = SearchOptions::from(&config);
        assert_eq!(options.default_timeout, Duration::from_secs(10));
        assert_eq!(options.provider_timeouts["mp"], Duration::from_secs(45));
        assert!(!options.persist_health);
    }
}
