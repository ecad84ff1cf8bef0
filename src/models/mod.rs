//! Core data models for materials queries, records and search results.

mod material;
mod query;
mod result;

pub use material::{
    extra_key, normalize_formula, parse_formula, Material, MaterialBuilder, PropertySlot,
    PropertyValue,
};
pub use query::{
    normalize_element, CountRange, CrystalSystem, PropertyRange, QueryError, QueryFields,
    SearchQuery, SearchQueryBuilder, DEFAULT_LIMIT, MAX_LIMIT, MIN_LIMIT, PERIODIC_TABLE,
};
pub use result::{ProviderQueryLog, QueryStatus, SearchResult};
