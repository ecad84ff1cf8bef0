//! Pure query-to-wire translation.
//!
//! Two dialects are supported:
//!
//! - [`to_filter`]: a filter string (`elements HAS ALL "Fe","O" AND nelements<=3`)
//!   for providers exposing an OPTIMADE-style `filter=` parameter.
//! - [`to_native_params`]: a keyword map with closed numeric ranges for
//!   providers with a parameter-based REST API.
//!
//! Neither function touches the network, and neither fails: an empty query
//! translates to an empty filter / empty parameter set.
//!
//! ```rust
//! use materials_master::models::SearchQuery;
//! use materials_master::translate::to_filter;
//!
//! let query = SearchQuery::with_elements(["Fe", "O"]).unwrap();
//! assert_eq!(to_filter(&query).to_string(), r#"elements HAS ALL "Fe","O""#);
//! ```

mod filter;
mod native;

pub use filter::{quote, to_filter, WireFilter, AND, FILTER_FIELDS};
pub use native::{
    to_native_params, NativeParameters, BAND_GAP_BOUNDS, ENERGY_ABOVE_HULL_BOUNDS,
    FORMATION_ENERGY_BOUNDS, NATIVE_FIELDS,
};
