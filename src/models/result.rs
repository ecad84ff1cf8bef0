//! Search result and per-provider audit models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::material::Material;
use super::query::SearchQuery;
use crate::utils::CacheStats;

/// Outcome of one provider interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Timeout,
    HttpError,
    ParseError,
    CircuitOpen,
    Skipped,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Success => "success",
            QueryStatus::Timeout => "timeout",
            QueryStatus::HttpError => "http_error",
            QueryStatus::ParseError => "parse_error",
            QueryStatus::CircuitOpen => "circuit_open",
            QueryStatus::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, QueryStatus::Success)
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full audit record of a single provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderQueryLog {
    pub provider_id: String,
    pub provider_name: String,

    /// Endpoint the call was sent to
    pub endpoint: String,

    /// Wire-format query actually sent
    pub query_sent: String,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub latency_ms: f64,
    pub status: QueryStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,

    pub result_count: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProviderQueryLog {
    /// Start a log entry for a call about to be made
    pub fn started(
        provider_id: impl Into<String>,
        provider_name: impl Into<String>,
        endpoint: impl Into<String>,
        query_sent: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            provider_name: provider_name.into(),
            endpoint: endpoint.into(),
            query_sent: query_sent.into(),
            started_at,
            finished_at: started_at,
            latency_ms: 0.0,
            status: QueryStatus::Skipped,
            http_status: None,
            result_count: 0,
            error_type: None,
            error_message: None,
        }
    }

    /// Complete the entry as a success
    pub fn succeeded(mut self, latency: Duration, result_count: usize) -> Self {
        self.finish(latency);
        self.status = QueryStatus::Success;
        self.result_count = result_count;
        self
    }

    /// Complete the entry as a failure
    pub fn failed(
        mut self,
        latency: Duration,
        status: QueryStatus,
        http_status: Option<u16>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        self.finish(latency);
        self.status = status;
        self.http_status = http_status;
        self.error_type = Some(error_type.into());
        self.error_message = Some(error_message.into());
        self
    }

    fn finish(&mut self, latency: Duration) {
        self.latency_ms = latency.as_secs_f64() * 1000.0;
        self.finished_at = self.started_at
            + chrono::Duration::from_std(latency).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

/// The fused outcome of one federated search. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    materials: Vec<Material>,
    total_count: usize,
    query: SearchQuery,
    provider_logs: Vec<ProviderQueryLog>,
    warnings: Vec<String>,
    cached: bool,
    search_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cache_stats: Option<CacheStats>,
}

impl SearchResult {
    pub fn new(
        materials: Vec<Material>,
        total_count: usize,
        query: SearchQuery,
        provider_logs: Vec<ProviderQueryLog>,
        warnings: Vec<String>,
        search_time: Duration,
        cache_stats: Option<CacheStats>,
    ) -> Self {
        Self {
            materials,
            total_count,
            query,
            provider_logs,
            warnings,
            cached: false,
            search_time_ms: search_time.as_secs_f64() * 1000.0,
            cache_stats,
        }
    }

    /// An empty result explained by a single warning
    pub fn empty(query: SearchQuery, warning: impl Into<String>, search_time: Duration) -> Self {
        Self::new(
            Vec::new(),
            0,
            query,
            Vec::new(),
            vec![warning.into()],
            search_time,
            None,
        )
    }

    /// A copy of this result marked as served from the cache
    pub fn served_from_cache(&self, cache_stats: Option<CacheStats>) -> Self {
        let mut copy = self.clone();
        copy.cached = true;
        if cache_stats.is_some() {
            copy.cache_stats = cache_stats;
        }
        copy
    }

    /// Attach a cache statistics snapshot
    pub fn with_cache_stats(mut self, cache_stats: CacheStats) -> Self {
        self.cache_stats = Some(cache_stats);
        self
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    /// Number of fused records before the limit was applied
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    pub fn provider_logs(&self) -> &[ProviderQueryLog] {
        &self.provider_logs
    }

    /// Log entry for a given provider, if it was attempted
    pub fn log_for(&self, provider_id: &str) -> Option<&ProviderQueryLog> {
        self.provider_logs
            .iter()
            .find(|log| log.provider_id == provider_id)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn cached(&self) -> bool {
        self.cached
    }

    pub fn search_time_ms(&self) -> f64 {
        self.search_time_ms
    }

    pub fn cache_stats(&self) -> Option<&CacheStats> {
        self.cache_stats.as_ref()
    }

    /// Whether at least one provider answered successfully
    pub fn any_success(&self) -> bool {
        self.provider_logs.iter().any(|log| log.status.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_lifecycle() {
        let start = Utc::now();
        let log = ProviderQueryLog::started("mp", "Materials Project", "https://x", "q", start)
            .failed(
                Duration::from_millis(250),
                QueryStatus::HttpError,
                Some(503),
                "http",
                "unavailable",
            );

        assert_eq!(log.status, QueryStatus::HttpError);
        assert_eq!(log.http_status, Some(503));
        assert!((log.latency_ms - 250.0).abs() < 1e-6);
        assert_eq!((log.finished_at - log.started_at).num_milliseconds(), 250);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&QueryStatus::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
        assert_eq!(QueryStatus::HttpError.to_string(), "http_error");
    }

    #[test]
    fn test_served_from_cache_marks_copy() {
        let result = SearchResult::empty(SearchQuery::default(), "nothing", Duration::ZERO);
        let cached = result.served_from_cache(None);
        assert!(!result.cached());
        assert!(cached.cached());
        assert_eq!(cached.warnings(), result.warnings());
    }
}
