//! Provider plugins with a capability-describing trait.
//!
//! This module defines the [`Provider`] trait that every backend data source
//! implements. Each provider advertises a [`ProviderCapabilities`] value; the
//! [`ProviderRegistry`] consults it before a provider is ever called, so a
//! backend is never sent a filter it cannot interpret.
//!
//! # Feature Flags
//!
//! The bundled HTTP providers can be disabled at compile time:
//!
//! - `optimade` - Enable the generic OPTIMADE filter-dialect provider (default: enabled)
//! - `materials_project` - Enable the Materials Project native-API provider (default: enabled)
//!
//! # Registering Providers
//!
//! Providers are normally built from the `[[providers]]` section of the
//! configuration file via [`ProviderRegistry::from_config`]. Any other type
//! implementing [`Provider`] can be added with [`ProviderRegistry::register`].

#[cfg(feature = "source-materials-project")]
mod materials_project;
#[cfg(feature = "source-optimade")]
mod optimade;
mod registry;

pub mod mock;

pub use mock::MockProvider;

#[cfg(feature = "source-materials-project")]
pub use materials_project::MaterialsProjectProvider;
#[cfg(feature = "source-optimade")]
pub use optimade::OptimadeProvider;
pub use registry::{ProviderCapabilities, ProviderRegistry};

use async_trait::async_trait;
use std::time::Duration;

use crate::models::{Material, QueryStatus, SearchQuery};
use crate::translate::to_filter;

/// The Provider trait defines the interface for all backend data sources.
///
/// # Implementing a New Provider
///
/// 1. Create a struct that implements `Provider`
/// 2. Implement `id`, `name`, `capabilities`, `endpoint` and `search`
/// 3. Override `wire_query` if the provider does not speak the filter dialect
/// 4. Register it with a [`ProviderRegistry`]
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Stable identifier (used in provenance tags, e.g. "mp", "oqmd")
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str;

    /// What this provider can filter on and return
    fn capabilities(&self) -> &ProviderCapabilities;

    /// URL the search call is sent to
    fn endpoint(&self) -> &str;

    /// Provider-specific timeout override
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// The wire-format query this provider sends for `query`, as recorded in
    /// the audit log
    fn wire_query(&self, query: &SearchQuery) -> String {
        to_filter(query).to_string()
    }

    /// Whether every filter field of `query` is filterable here
    fn can_handle(&self, query: &SearchQuery) -> bool {
        self.capabilities().can_handle(query)
    }

    /// Search for materials matching the query
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Material>, ProviderError>;

    /// Lightweight liveness probe
    async fn health_check(&self) -> bool {
        true
    }
}

/// Errors that can occur when calling a provider
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Response could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// The call exceeded its time budget
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Missing or rejected credentials
    /// `status` is set when the server rejected the credential
    #[error("Authentication error: {message}")]
    Auth { status: Option<u16>, message: String },

    /// The provider refused the request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error
    #[error("Error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Audit status this error is recorded under
    pub fn status(&self) -> QueryStatus {
        match self {
            ProviderError::Timeout(_) => QueryStatus::Timeout,
            ProviderError::Parse(_) => QueryStatus::ParseError,
            _ => QueryStatus::HttpError,
        }
    }

    /// Short machine-readable error tag
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::Network(_) => "network",
            ProviderError::Http { .. } => "http",
            ProviderError::Parse(_) => "parse",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Auth { .. } => "auth",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::Other(_) => "other",
        }
    }

    /// HTTP status code, when the failure carried one
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            ProviderError::Auth { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Parse(format!("JSON: {}", err))
    }
}

/// Turn a non-success response into [`ProviderError::Http`], keeping a short
/// excerpt of the body for the audit log
pub(crate) async fn check_status(
    response: reqwest::Response,
    provider: &str,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    Err(ProviderError::Http {
        status: status.as_u16(),
        message: format!("{} returned {}: {}", provider, status, excerpt.trim()),
    })
}
