//! Utility modules supporting federated search.
//!
//! This module provides the shared, long-lived state and helpers used by the
//! search orchestrator:
//!
//! - [`HealthManager`]: Per-provider circuit breaker with an EMA latency tracker
//! - [`ResultCache`]: TTL cache of fused results with a material-id index
//! - [`fuse_materials`]: Merge records from several providers into one per entity
//! - [`HttpClient`]: Shared reqwest client for the HTTP providers
//! - [`PersistError`]: Errors writing health or cache state to disk
//!
//! # Fusion
//!
//! ```rust
//! use materials_master::models::Material;
//! use materials_master::utils::fuse_materials;
//!
//! let a = Material::builder("mp-1", "Fe2O3", "mp").space_group("R-3c").band_gap(2.1).build();
//! let b = Material::builder("oq-7", "Fe2O3", "oqmd").space_group("R-3c").band_gap(1.9).build();
//!
//! let fused = fuse_materials(vec![a, b]);
//! assert_eq!(fused.len(), 1);
//! assert_eq!(fused[0].sources, vec!["mp", "oqmd"]);
//! assert!(fused[0].extra_properties.contains_key("band_gap:oqmd"));
//! ```

mod cache;
mod circuit_breaker;
mod fusion;
mod http;
mod persist;

pub use cache::{CacheStats, CachedResult, ResultCache, DEFAULT_TTL};
pub use circuit_breaker::{
    CircuitState, HealthManager, HealthPolicy, ProviderHealth, DEFAULT_COOLDOWN,
    DEFAULT_FAILURE_THRESHOLD,
};
pub use fusion::{fuse_materials, identity_key, UNKNOWN_SPACE_GROUP};
pub use http::{HttpClient, DEFAULT_REQUEST_TIMEOUT};
pub use persist::PersistError;
