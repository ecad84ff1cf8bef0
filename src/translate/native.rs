//! Native keyword-parameter dialect (Materials Project style).

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::{PropertyRange, QueryFields, SearchQuery, PERIODIC_TABLE};

/// Fields [`to_native_params`] carries; `elements_any` has no parameter
pub const NATIVE_FIELDS: QueryFields = QueryFields::ELEMENTS
    .union(QueryFields::EXCLUDE_ELEMENTS)
    .union(QueryFields::FORMULA)
    .union(QueryFields::NELEMENTS)
    .union(QueryFields::BAND_GAP)
    .union(QueryFields::FORMATION_ENERGY)
    .union(QueryFields::ENERGY_ABOVE_HULL)
    .union(QueryFields::SPACE_GROUP)
    .union(QueryFields::CRYSTAL_SYSTEM);

/// Bounds filled in when a band gap range gives only one side (eV)
pub const BAND_GAP_BOUNDS: (f64, f64) = (0.0, 100.0);

/// Bounds filled in when a formation energy range gives only one side (eV/atom)
pub const FORMATION_ENERGY_BOUNDS: (f64, f64) = (-10.0, 10.0);

/// Bounds filled in when an energy-above-hull range gives only one side (eV/atom)
pub const ENERGY_ABOVE_HULL_BOUNDS: (f64, f64) = (0.0, 10.0);

/// Keyword parameters for providers with a parameter-based API.
///
/// Numeric ranges are closed `(min, max)` tuples.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NativeParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_elements: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_elements: Option<(u32, u32)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub band_gap: Option<(f64, f64)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub formation_energy: Option<(f64, f64)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_above_hull: Option<(f64, f64)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub spacegroup_symbol: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub crystal_system: Option<String>,
}

impl NativeParameters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Keyword map view, sorted by key
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Flatten into URL query pairs: lists are comma-joined and each range
    /// becomes a `<key>_min` / `<key>_max` pair.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(elements) = &self.elements {
            pairs.push(("elements".to_string(), elements.join(",")));
        }
        if let Some(elements) = &self.exclude_elements {
            pairs.push(("exclude_elements".to_string(), elements.join(",")));
        }
        if let Some(formula) = &self.formula {
            pairs.push(("formula".to_string(), formula.clone()));
        }
        if let Some((min, max)) = self.num_elements {
            pairs.push(("num_elements_min".to_string(), min.to_string()));
            pairs.push(("num_elements_max".to_string(), max.to_string()));
        }
        for (key, range) in [
            ("band_gap", self.band_gap),
            ("formation_energy", self.formation_energy),
            ("energy_above_hull", self.energy_above_hull),
        ] {
            if let Some((min, max)) = range {
                pairs.push((format!("{}_min", key), min.to_string()));
                pairs.push((format!("{}_max", key), max.to_string()));
            }
        }
        if let Some(symbol) = &self.spacegroup_symbol {
            pairs.push(("spacegroup_symbol".to_string(), symbol.clone()));
        }
        if let Some(system) = &self.crystal_system {
            pairs.push(("crystal_system".to_string(), system.clone()));
        }
        pairs
    }
}

fn closed(range: Option<PropertyRange>, defaults: (f64, f64)) -> Option<(f64, f64)> {
    let range = range?;
    if range.is_unbounded() {
        return None;
    }
    Some((range.min.unwrap_or(defaults.0), range.max.unwrap_or(defaults.1)))
}

/// Translate a query into native keyword parameters
pub fn to_native_params(query: &SearchQuery) -> NativeParameters {
    NativeParameters {
        elements: query.elements().map(<[String]>::to_vec),
        exclude_elements: query.exclude_elements().map(<[String]>::to_vec),
        formula: query.formula().map(str::to_string),
        num_elements: query.nelements().filter(|r| !r.is_unbounded()).map(|r| {
            (
                r.min.unwrap_or(1),
                r.max.unwrap_or(PERIODIC_TABLE.len() as u32),
            )
        }),
        band_gap: closed(query.band_gap(), BAND_GAP_BOUNDS),
        formation_energy: closed(query.formation_energy(), FORMATION_ENERGY_BOUNDS),
        energy_above_hull: closed(query.energy_above_hull(), ENERGY_ABOVE_HULL_BOUNDS),
        spacegroup_symbol: query.space_group().map(str::to_string),
        crystal_system: query.crystal_system().map(|cs| cs.as_str().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query() {
        let params = to_native_params(&SearchQuery::default());
        assert!(params.is_empty());
        assert!(params.to_query_pairs().is_empty());
    }

    #[test]
    fn test_default_bounds() {
        let query = SearchQuery::builder()
            .elements(["Fe", "O"])
            .band_gap(PropertyRange::at_least(1.5).unwrap())
            .formation_energy(PropertyRange::at_most(-0.5).unwrap())
            .energy_above_hull(PropertyRange::at_most(0.05).unwrap())
            .build()
            .unwrap();

        let params = to_native_params(&query);
        assert_eq!(params.elements, Some(vec!["Fe".to_string(), "O".to_string()]));
        assert_eq!(params.band_gap, Some((1.5, 100.0)));
        assert_eq!(params.formation_energy, Some((-10.0, -0.5)));
        assert_eq!(params.energy_above_hull, Some((0.0, 0.05)));
    }

    #[test]
    fn test_explicit_bounds_kept() {
        let query = SearchQuery::builder()
            .band_gap(PropertyRange::between(0.5, 2.0).unwrap())
            .build()
            .unwrap();
        assert_eq!(to_native_params(&query).band_gap, Some((0.5, 2.0)));
    }

    #[test]
    fn test_keyword_map_and_pairs() {
        let query = SearchQuery::builder()
            .elements(["Si"])
            .formula("SiO2")
            .band_gap(PropertyRange::at_least(1.0).unwrap())
            .build()
            .unwrap();
        let params = to_native_params(&query);

        let map = params.to_map();
        assert_eq!(map["elements"], serde_json::json!(["Si"]));
        assert_eq!(map["formula"], serde_json::json!("SiO2"));
        assert_eq!(map["band_gap"], serde_json::json!([1.0, 100.0]));
        assert!(!map.contains_key("formation_energy"));

        let pairs = params.to_query_pairs();
        assert!(pairs.contains(&("band_gap_min".to_string(), "1".to_string())));
        assert!(pairs.contains(&("band_gap_max".to_string(), "100".to_string())));
        assert!(pairs.contains(&("formula".to_string(), "SiO2".to_string())));
    }
}
