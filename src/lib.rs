//! # Materials Master
//!
//! Federated search for materials records across independent scientific data
//! providers that differ in query syntax, authentication, reliability and
//! available fields.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`]: Core data structures (SearchQuery, Material, SearchResult, etc.)
//! - [`sources`]: Provider plugins behind a capability-describing trait
//! - [`translate`]: Query translation into each provider's wire dialect
//! - [`search`]: The orchestrator tying providers, health, cache and fusion together
//! - [`utils`]: Circuit breaker, result cache, fusion and HTTP helpers
//! - [`config`]: Configuration management
//!
//! ## Example
//!
//! ```no_run
//! use materials_master::config::load_config;
//! use materials_master::models::SearchQuery;
//! use materials_master::search::SearchOrchestrator;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = load_config(None)?;
//! let orchestrator = SearchOrchestrator::from_config(&config)?;
//!
//! let query = SearchQuery::with_elements(["Fe", "O"])?;
//! let result = orchestrator.search(&query).await;
//! for material in result.materials() {
//!     println!("{} {:?}", material.formula, material.sources);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod models;
pub mod search;
pub mod sources;
pub mod translate;
pub mod utils;

// Re-export commonly used types
pub use models::{Material, SearchQuery, SearchResult};
pub use search::SearchOrchestrator;
pub use sources::{Provider, ProviderRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
