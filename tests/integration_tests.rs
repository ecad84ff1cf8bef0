//! Integration tests for Materials Master
//!
//! These tests drive the search orchestrator end to end against mock
//! providers, covering partial failure, circuit breaking, caching and fusion.

use materials_master::models::{Material, QueryStatus, SearchQuery};
use materials_master::search::{SearchOptions, SearchOrchestrator};
use materials_master::sources::mock::{make_material, MockProvider};
use materials_master::sources::{ProviderError, ProviderRegistry};
use materials_master::utils::{CircuitState, HealthManager, HealthPolicy, ResultCache};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn fe_o() -> SearchQuery {
    SearchQuery::with_elements(["Fe", "O"]).unwrap()
}

fn registry(providers: &[Arc<MockProvider>]) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider.clone());
    }
    registry
}

fn health() -> Arc<HealthManager> {
    Arc::new(HealthManager::new(HealthPolicy::default()))
}

fn with_cache(providers: &[Arc<MockProvider>]) -> SearchOrchestrator {
    SearchOrchestrator::new(registry(providers), health())
        .with_cache(Arc::new(ResultCache::new(Duration::from_secs(3600))))
}

fn iron_oxide(id: &str, source: &str, band_gap: f64) -> Material {
    Material::builder(id, "Fe2O3", source)
        .elements(["Fe", "O"])
        .space_group("R-3c")
        .band_gap(band_gap)
        .build()
}

#[tokio::test]
async fn test_open_circuit_provider_is_skipped_and_result_cached() {
    let a = Arc::new(MockProvider::new("a").with_materials(vec![iron_oxide("a-1", "a", 2.1)]));
    let b = Arc::new(MockProvider::new("b").with_materials(vec![iron_oxide("b-1", "b", 1.9)]));
    let orchestrator = with_cache(&[a.clone(), b.clone()]);

    for _ in 0..3 {
        orchestrator.health().record_failure("b");
    }
    assert_eq!(orchestrator.health().state("b"), CircuitState::Open);

    let query = fe_o();
    let result = orchestrator.search(&query).await;

    assert_eq!(result.provider_logs().len(), 1);
    let log = result.log_for("a").unwrap();
    assert_eq!(log.status, QueryStatus::Success);
    assert!(result.log_for("b").is_none());
    assert_eq!(b.call_count(), 0);
    assert_eq!(result.materials().len(), 1);

    let cache = orchestrator.cache().unwrap();
    assert_eq!(cache.len(), 1);

    let again = orchestrator.search(&query).await;
    assert!(again.cached());
    assert_eq!(again.materials(), result.materials());
    assert_eq!(a.call_count(), 1);
}

#[tokio::test]
async fn test_partial_failure_keeps_other_results() {
    let a = Arc::new(MockProvider::new("a").with_materials(vec![iron_oxide("a-1", "a", 2.1)]));
    let b = Arc::new(
        MockProvider::new("b").with_error(ProviderError::Network("connection refused".into())),
    );
    let orchestrator = SearchOrchestrator::new(registry(&[a, b]), health());

    let result = orchestrator.search(&fe_o()).await;

    assert_eq!(result.materials().len(), 1);
    assert_eq!(result.materials()[0].id, "a-1");
    assert_eq!(result.provider_logs().len(), 2);
    assert_eq!(result.log_for("a").unwrap().status, QueryStatus::Success);

    let failed = result.log_for("b").unwrap();
    assert_eq!(failed.status, QueryStatus::HttpError);
    assert_eq!(failed.error_type.as_deref(), Some("network"));
    assert_eq!(failed.result_count, 0);

    assert_eq!(result.warnings().len(), 1);
    assert!(result.warnings()[0].contains("b"));

    let b_health = orchestrator.health().snapshot("b").unwrap();
    assert_eq!(b_health.consecutive_failures, 1);
    assert_eq!(b_health.failure_count, 1);
}

#[tokio::test]
async fn test_slow_provider_times_out_alone() {
    let a = Arc::new(MockProvider::new("a").with_materials(vec![iron_oxide("a-1", "a", 2.1)]));
    let b = Arc::new(
        MockProvider::new("b")
            .with_materials(vec![iron_oxide("b-1", "b", 1.9)])
            .with_delay(Duration::from_secs(5))
            .with_timeout(Duration::from_millis(50)),
    );
    let orchestrator = SearchOrchestrator::new(registry(&[a, b]), health());

    let result = orchestrator.search(&fe_o()).await;

    assert_eq!(result.materials().len(), 1);
    assert_eq!(result.materials()[0].sources, vec!["a"]);

    let log = result.log_for("b").unwrap();
    assert_eq!(log.status, QueryStatus::Timeout);
    assert_eq!(log.error_type.as_deref(), Some("timeout"));
    assert!(log.latency_ms < 5000.0);
    assert_eq!(orchestrator.health().snapshot("b").unwrap().failure_count, 1);
}

#[tokio::test]
async fn test_default_timeout_applies() {
    let slow = Arc::new(MockProvider::new("slow").with_delay(Duration::from_secs(5)));
    let orchestrator =
        SearchOrchestrator::new(registry(&[slow]), health()).with_options(SearchOptions {
            default_timeout: Duration::from_millis(50),
            ..Default::default()
        });

    let result = orchestrator.search(&fe_o()).await;
    assert_eq!(result.log_for("slow").unwrap().status, QueryStatus::Timeout);
    assert!(!result.any_success());
}

#[tokio::test]
async fn test_panicking_provider_is_isolated() {
    let a = Arc::new(MockProvider::new("a").with_materials(vec![iron_oxide("a-1", "a", 2.1)]));
    let b = Arc::new(MockProvider::new("b").panicking());
    let orchestrator = SearchOrchestrator::new(registry(&[a, b]), health());

    let result = orchestrator.search(&fe_o()).await;

    assert_eq!(result.materials().len(), 1);
    let log = result.log_for("b").unwrap();
    assert_eq!(log.status, QueryStatus::HttpError);
    assert_eq!(log.error_type.as_deref(), Some("panic"));
    assert_eq!(orchestrator.health().snapshot("b").unwrap().failure_count, 1);
    assert!(result.warnings().iter().any(|w| w.contains("b")));
}

#[tokio::test]
async fn test_fusion_follows_registration_order() {
    // the first-registered provider answers last but still wins the slots
    let a = Arc::new(
        MockProvider::new("a")
            .with_materials(vec![iron_oxide("a-1", "a", 2.1)])
            .with_delay(Duration::from_millis(50)),
    );
    let b = Arc::new(MockProvider::new("b").with_materials(vec![iron_oxide("b-1", "b", 1.9)]));
    let orchestrator = SearchOrchestrator::new(registry(&[a, b]), health());

    let result = orchestrator.search(&fe_o()).await;

    assert_eq!(result.materials().len(), 1);
    let material = &result.materials()[0];
    assert_eq!(material.id, "a-1");
    assert_eq!(material.sources, vec!["a", "b"]);
    assert_eq!(material.band_gap.as_ref().unwrap().as_f64(), Some(2.1));
    assert_eq!(
        material.extra_properties["band_gap:b"].as_f64(),
        Some(1.9)
    );
}

#[tokio::test]
async fn test_allowlist_restricts_providers() {
    let a = Arc::new(MockProvider::new("a").with_materials(vec![make_material("a-1", "FeO", "a")]));
    let b = Arc::new(MockProvider::new("b").with_materials(vec![make_material("b-1", "FeO", "b")]));
    let orchestrator = SearchOrchestrator::new(registry(&[a.clone(), b.clone()]), health());

    let query = SearchQuery::builder()
        .elements(["Fe", "O"])
        .providers(["b"])
        .build()
        .unwrap();
    let result = orchestrator.search(&query).await;

    assert_eq!(a.call_count(), 0);
    assert_eq!(b.call_count(), 1);
    assert_eq!(result.provider_logs().len(), 1);
    assert_eq!(result.materials()[0].sources, vec!["b"]);
}

#[tokio::test]
async fn test_repeated_failures_open_circuit() {
    let b = Arc::new(MockProvider::new("b").with_error(ProviderError::Http {
        status: 503,
        message: "unavailable".into(),
    }));
    let orchestrator = SearchOrchestrator::new(registry(&[b.clone()]), health());
    let query = fe_o();

    for _ in 0..3 {
        let result = orchestrator.search(&query).await;
        assert_eq!(result.log_for("b").unwrap().http_status, Some(503));
    }
    assert_eq!(orchestrator.health().state("b"), CircuitState::Open);

    let result = orchestrator.search(&query).await;
    assert!(result.provider_logs().is_empty());
    assert!(result.materials().is_empty());
    assert_eq!(result.warnings().len(), 1);
    assert!(result.warnings()[0].contains("b"));
    assert_eq!(b.call_count(), 3);
}

#[tokio::test]
async fn test_failed_search_is_not_cached() {
    let b = Arc::new(MockProvider::new("b").with_error(ProviderError::Parse("bad json".into())));
    let orchestrator = with_cache(&[b.clone()]);

    let result = orchestrator.search(&fe_o()).await;
    assert!(!result.any_success());
    assert_eq!(orchestrator.cache().unwrap().len(), 0);

    // recovery is picked up on the next search
    b.set_response(Ok(vec![make_material("b-1", "FeO", "b")]));
    let result = orchestrator.search(&fe_o()).await;
    assert!(!result.cached());
    assert_eq!(result.materials().len(), 1);
    assert_eq!(b.call_count(), 2);
}

#[tokio::test]
async fn test_health_persisted_after_search() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("health.json");

    let b = Arc::new(MockProvider::new("b").with_error(ProviderError::Network("down".into())));
    let health = Arc::new(HealthManager::new(HealthPolicy::default()).with_path(&path));
    let orchestrator =
        SearchOrchestrator::new(registry(&[b]), health).with_options(SearchOptions {
            persist_health: true,
            ..Default::default()
        });

    orchestrator.search(&fe_o()).await;

    let restored = HealthManager::load(&path, HealthPolicy::default());
    let entry = restored.snapshot("b").unwrap();
    assert_eq!(entry.failure_count, 1);
    assert!(entry.last_failure.is_some());
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let dir = tempdir().unwrap();
    let ttl = Duration::from_secs(3600);
    let query = fe_o();

    let a = Arc::new(MockProvider::new("a").with_materials(vec![iron_oxide("a-1", "a", 2.1)]));
    let first = SearchOrchestrator::new(registry(&[a.clone()]), health())
        .with_cache(Arc::new(ResultCache::load(dir.path(), ttl)));
    first.search(&query).await;
    assert_eq!(a.call_count(), 1);

    let restarted = SearchOrchestrator::new(registry(&[a.clone()]), health())
        .with_cache(Arc::new(ResultCache::load(dir.path(), ttl)));
    let result = restarted.search(&query).await;

    assert!(result.cached());
    assert_eq!(result.materials()[0].id, "a-1");
    assert_eq!(a.call_count(), 1);
    assert_eq!(restarted.get_material("a-1").unwrap().formula, "Fe2O3");
}

#[tokio::test]
async fn test_cached_hit_skips_health_updates() {
    let a = Arc::new(MockProvider::new("a").with_materials(vec![make_material("a-1", "FeO", "a")]));
    let orchestrator = with_cache(&[a]);
    let query = fe_o();

    orchestrator.search(&query).await;
    orchestrator.search(&query).await;

    assert_eq!(orchestrator.health().snapshot("a").unwrap().success_count, 1);
    assert_eq!(orchestrator.cache().unwrap().stats().hits, 1);
}
