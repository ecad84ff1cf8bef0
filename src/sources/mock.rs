//! Mock provider for testing purposes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::models::{Material, QueryFields, SearchQuery};
use crate::sources::{Provider, ProviderCapabilities, ProviderError};

/// A provider that returns canned records or a canned error.
#[derive(Debug)]
pub struct MockProvider {
    id: String,
    name: String,
    endpoint: String,
    capabilities: ProviderCapabilities,
    response: Mutex<Result<Vec<Material>, ProviderError>>,
    delay: Option<Duration>,
    panics: bool,
    timeout: Option<Duration>,
    healthy: AtomicBool,
    calls: AtomicUsize,
}

impl MockProvider {
    /// Create a mock that can filter on every field and returns nothing
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: format!("Mock {}", id),
            endpoint: format!("mock://{}", id),
            id,
            capabilities: ProviderCapabilities::new(QueryFields::all()),
            response: Mutex::new(Ok(Vec::new())),
            delay: None,
            panics: false,
            timeout: None,
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_filterable(mut self, fields: QueryFields) -> Self {
        self.capabilities.filterable = fields;
        self
    }

    pub fn with_materials(self, materials: Vec<Material>) -> Self {
        self.set_response(Ok(materials));
        self
    }

    pub fn with_error(self, error: ProviderError) -> Self {
        self.set_response(Err(error));
        self
    }

    /// Sleep this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Panic inside `search`
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the canned response
    pub fn set_response(&self, response: Result<Vec<Material>, ProviderError>) {
        *self.response.lock().unwrap_or_else(PoisonError::into_inner) = response;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// How many times `search` has been entered
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn search(&self, _query: &SearchQuery) -> Result<Vec<Material>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("mock provider {} panicked", self.id);
        }

        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Helper to create a single-source record for testing
pub fn make_material(id: &str, formula: &str, source: &str) -> Material {
    Material::builder(id, formula, source).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_canned_response() {
        let mock = MockProvider::new("a").with_materials(vec![make_material("a-1", "Fe2O3", "a")]);
        let query = SearchQuery::default();

        let records = mock.search(&query).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "a-1");
        assert_eq!(mock.call_count(), 1);

        mock.set_response(Err(ProviderError::Network("refused".into())));
        assert!(mock.search(&query).await.is_err());
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_health_toggle() {
        let mock = MockProvider::new("a");
        assert!(mock.health_check().await);
        mock.set_healthy(false);
        assert!(!mock.health_check().await);
    }
}
