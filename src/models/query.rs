//! Structured search query model.
//!
//! A [`SearchQuery`] is validated and canonicalized once, at construction, and
//! is immutable afterwards. Element lists are normalized (capitalization,
//! sorting, de-duplication) so that two queries describing the same intent
//! produce the same [`SearchQuery::query_hash`] regardless of how they were
//! built.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Smallest accepted result limit
pub const MIN_LIMIT: usize = 1;

/// Largest accepted result limit
pub const MAX_LIMIT: usize = 10_000;

/// Default result limit
pub const DEFAULT_LIMIT: usize = 100;

/// Every element symbol accepted in a query.
pub const PERIODIC_TABLE: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk",
    "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh",
    "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Errors raised while building or validating a query
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid element symbol: {0}")]
    InvalidElement(String),

    #[error("Limit {0} is outside the accepted range [{MIN_LIMIT}, {MAX_LIMIT}]")]
    LimitOutOfRange(usize),

    #[error("Invalid range: min {min} is greater than max {max}")]
    InvertedRange { min: f64, max: f64 },

    #[error("Range bound must be a finite number")]
    NonFiniteBound,

    #[error("Unknown crystal system: {0}")]
    UnknownCrystalSystem(String),

    #[error("Unknown query field: {0}")]
    UnknownField(String),
}

/// Normalize an element symbol to its canonical capitalization and check it
/// against the periodic table.
pub fn normalize_element(symbol: &str) -> Result<String, QueryError> {
    let trimmed = symbol.trim();
    let mut chars = trimmed.chars();
    let normalized = match chars.next() {
        Some(first) => {
            let mut s: String = first.to_uppercase().collect();
            s.push_str(&chars.as_str().to_lowercase());
            s
        }
        None => return Err(QueryError::InvalidElement(symbol.to_string())),
    };

    if PERIODIC_TABLE.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(QueryError::InvalidElement(symbol.to_string()))
    }
}

fn normalize_elements<I, S>(symbols: I) -> Result<Vec<String>, QueryError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = symbols
        .into_iter()
        .map(|s| normalize_element(s.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    out.sort();
    out.dedup();
    Ok(out)
}

/// Inclusive numeric range with optional bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PropertyRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl PropertyRange {
    /// Create a range; fails if either bound is not finite or `min > max`
    pub fn new(min: Option<f64>, max: Option<f64>) -> Result<Self, QueryError> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    /// Range with only a lower bound
    pub fn at_least(min: f64) -> Result<Self, QueryError> {
        Self::new(Some(min), None)
    }

    /// Range with only an upper bound
    pub fn at_most(max: f64) -> Result<Self, QueryError> {
        Self::new(None, Some(max))
    }

    /// Range with both bounds
    pub fn between(min: f64, max: f64) -> Result<Self, QueryError> {
        Self::new(Some(min), Some(max))
    }

    /// Whether neither bound is set
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Whether `value` falls inside the range
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }

    fn validate(&self) -> Result<(), QueryError> {
        if self.min.is_some_and(|v| !v.is_finite()) || self.max.is_some_and(|v| !v.is_finite()) {
            return Err(QueryError::NonFiniteBound);
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(QueryError::InvertedRange { min, max });
            }
        }
        Ok(())
    }
}

/// Inclusive integer range, used for element counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

impl CountRange {
    pub fn new(min: Option<u32>, max: Option<u32>) -> Result<Self, QueryError> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn exactly(count: u32) -> Self {
        Self {
            min: Some(count),
            max: Some(count),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    fn validate(&self) -> Result<(), QueryError> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(QueryError::InvertedRange {
                    min: f64::from(min),
                    max: f64::from(max),
                });
            }
        }
        Ok(())
    }
}

/// The seven crystal systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrystalSystem {
    Triclinic,
    Monoclinic,
    Orthorhombic,
    Tetragonal,
    Trigonal,
    Hexagonal,
    Cubic,
}

impl CrystalSystem {
    pub const ALL: [CrystalSystem; 7] = [
        CrystalSystem::Triclinic,
        CrystalSystem::Monoclinic,
        CrystalSystem::Orthorhombic,
        CrystalSystem::Tetragonal,
        CrystalSystem::Trigonal,
        CrystalSystem::Hexagonal,
        CrystalSystem::Cubic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrystalSystem::Triclinic => "triclinic",
            CrystalSystem::Monoclinic => "monoclinic",
            CrystalSystem::Orthorhombic => "orthorhombic",
            CrystalSystem::Tetragonal => "tetragonal",
            CrystalSystem::Trigonal => "trigonal",
            CrystalSystem::Hexagonal => "hexagonal",
            CrystalSystem::Cubic => "cubic",
        }
    }
}

impl fmt::Display for CrystalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CrystalSystem {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|cs| cs.as_str() == lower)
            .ok_or_else(|| QueryError::UnknownCrystalSystem(s.to_string()))
    }
}

bitflags::bitflags! {
    /// Filterable query fields.
    ///
    /// Control fields (`providers`, `limit`) are deliberately absent: they
    /// never take part in capability matching.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueryFields: u32 {
        const ELEMENTS = 1 << 0;
        const ELEMENTS_ANY = 1 << 1;
        const EXCLUDE_ELEMENTS = 1 << 2;
        const FORMULA = 1 << 3;
        const NELEMENTS = 1 << 4;
        const BAND_GAP = 1 << 5;
        const FORMATION_ENERGY = 1 << 6;
        const ENERGY_ABOVE_HULL = 1 << 7;
        const SPACE_GROUP = 1 << 8;
        const CRYSTAL_SYSTEM = 1 << 9;
    }
}

impl QueryFields {
    const NAMES: [(QueryFields, &'static str); 10] = [
        (QueryFields::ELEMENTS, "elements"),
        (QueryFields::ELEMENTS_ANY, "elements_any"),
        (QueryFields::EXCLUDE_ELEMENTS, "exclude_elements"),
        (QueryFields::FORMULA, "formula"),
        (QueryFields::NELEMENTS, "nelements"),
        (QueryFields::BAND_GAP, "band_gap"),
        (QueryFields::FORMATION_ENERGY, "formation_energy"),
        (QueryFields::ENERGY_ABOVE_HULL, "energy_above_hull"),
        (QueryFields::SPACE_GROUP, "space_group"),
        (QueryFields::CRYSTAL_SYSTEM, "crystal_system"),
    ];

    /// Look up a single field by its wire name (e.g. `"band_gap"`)
    pub fn from_field_name(name: &str) -> Result<Self, QueryError> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(f, _)| *f)
            .ok_or_else(|| QueryError::UnknownField(name.to_string()))
    }

    /// Build a field set from wire names
    pub fn from_field_names<I, S>(names: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(QueryFields::empty(), |acc, name| {
            Ok(acc | Self::from_field_name(name.as_ref())?)
        })
    }

    /// Wire names of every field in this set, in declaration order
    pub fn field_names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(f, _)| self.contains(*f))
            .map(|(_, n)| *n)
            .collect()
    }
}

/// Validated, immutable search query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elements: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elements_any: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exclude_elements: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nelements: Option<CountRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    band_gap: Option<PropertyRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formation_energy: Option<PropertyRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    energy_above_hull: Option<PropertyRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    space_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crystal_system: Option<CrystalSystem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    providers: Option<Vec<String>>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            elements: None,
            elements_any: None,
            exclude_elements: None,
            formula: None,
            nelements: None,
            band_gap: None,
            formation_energy: None,
            energy_above_hull: None,
            space_group: None,
            crystal_system: None,
            providers: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl SearchQuery {
    /// Start building a query
    pub fn builder() -> SearchQueryBuilder {
        SearchQueryBuilder::default()
    }

    /// Shorthand for a query requiring all of `elements`
    pub fn with_elements<I, S>(elements: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::builder().elements(elements).build()
    }

    pub fn elements(&self) -> Option<&[String]> {
        self.elements.as_deref()
    }

    pub fn elements_any(&self) -> Option<&[String]> {
        self.elements_any.as_deref()
    }

    pub fn exclude_elements(&self) -> Option<&[String]> {
        self.exclude_elements.as_deref()
    }

    pub fn formula(&self) -> Option<&str> {
        self.formula.as_deref()
    }

    pub fn nelements(&self) -> Option<CountRange> {
        self.nelements
    }

    pub fn band_gap(&self) -> Option<PropertyRange> {
        self.band_gap
    }

    pub fn formation_energy(&self) -> Option<PropertyRange> {
        self.formation_energy
    }

    pub fn energy_above_hull(&self) -> Option<PropertyRange> {
        self.energy_above_hull
    }

    pub fn space_group(&self) -> Option<&str> {
        self.space_group.as_deref()
    }

    pub fn crystal_system(&self) -> Option<CrystalSystem> {
        self.crystal_system
    }

    /// Explicit provider allowlist, if any
    pub fn providers(&self) -> Option<&[String]> {
        self.providers.as_deref()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether `provider_id` passes the allowlist (always true without one)
    pub fn allows_provider(&self, provider_id: &str) -> bool {
        self.providers
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == provider_id))
    }

    /// The set of non-empty, non-control fields carried by this query
    pub fn filter_fields(&self) -> QueryFields {
        let mut fields = QueryFields::empty();
        let non_empty = |v: &Option<Vec<String>>| v.as_ref().is_some_and(|v| !v.is_empty());

        fields.set(QueryFields::ELEMENTS, non_empty(&self.elements));
        fields.set(QueryFields::ELEMENTS_ANY, non_empty(&self.elements_any));
        fields.set(QueryFields::EXCLUDE_ELEMENTS, non_empty(&self.exclude_elements));
        fields.set(QueryFields::FORMULA, self.formula.is_some());
        fields.set(
            QueryFields::NELEMENTS,
            self.nelements.is_some_and(|r| !r.is_unbounded()),
        );
        fields.set(
            QueryFields::BAND_GAP,
            self.band_gap.is_some_and(|r| !r.is_unbounded()),
        );
        fields.set(
            QueryFields::FORMATION_ENERGY,
            self.formation_energy.is_some_and(|r| !r.is_unbounded()),
        );
        fields.set(
            QueryFields::ENERGY_ABOVE_HULL,
            self.energy_above_hull.is_some_and(|r| !r.is_unbounded()),
        );
        fields.set(QueryFields::SPACE_GROUP, self.space_group.is_some());
        fields.set(QueryFields::CRYSTAL_SYSTEM, self.crystal_system.is_some());
        fields
    }

    /// Whether the query carries no filters at all
    pub fn is_empty(&self) -> bool {
        self.filter_fields().is_empty()
    }

    /// Re-check every invariant. Used for queries that did not come through
    /// the builder, e.g. ones read back from the cache directory.
    pub fn validate(&self) -> Result<(), QueryError> {
        for list in [&self.elements, &self.elements_any, &self.exclude_elements]
            .into_iter()
            .flatten()
        {
            for symbol in list {
                if normalize_element(symbol)? != *symbol {
                    return Err(QueryError::InvalidElement(symbol.clone()));
                }
            }
        }
        for range in [self.band_gap, self.formation_energy, self.energy_above_hull]
            .into_iter()
            .flatten()
        {
            range.validate()?;
        }
        if let Some(range) = self.nelements {
            range.validate()?;
        }
        if !(MIN_LIMIT..=MAX_LIMIT).contains(&self.limit) {
            return Err(QueryError::LimitOutOfRange(self.limit));
        }
        Ok(())
    }

    /// Canonical projection of all non-null fields, keyed and sorted by
    /// field name
    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let sorted: BTreeMap<String, Value> = match value {
            Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            _ => BTreeMap::new(),
        };
        serde_json::to_string(&sorted).unwrap_or_default()
    }

    /// Stable content hash, used as the cache key
    pub fn query_hash(&self) -> String {
        format!("{:x}", md5::compute(self.canonical_json().as_bytes()))
    }
}

/// Builder for [`SearchQuery`]; all validation happens in [`build`](Self::build)
#[derive(Debug, Clone, Default)]
pub struct SearchQueryBuilder {
    elements: Option<Vec<String>>,
    elements_any: Option<Vec<String>>,
    exclude_elements: Option<Vec<String>>,
    formula: Option<String>,
    nelements: Option<CountRange>,
    band_gap: Option<PropertyRange>,
    formation_energy: Option<PropertyRange>,
    energy_above_hull: Option<PropertyRange>,
    space_group: Option<String>,
    crystal_system: Option<CrystalSystem>,
    providers: Option<Vec<String>>,
    limit: Option<usize>,
}

fn collect_strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}

impl SearchQueryBuilder {
    /// Elements that must all be present
    pub fn elements<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.elements = Some(collect_strings(elements));
        self
    }

    /// Elements of which at least one must be present
    pub fn elements_any<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.elements_any = Some(collect_strings(elements));
        self
    }

    /// Elements that must be absent
    pub fn exclude_elements<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exclude_elements = Some(collect_strings(elements));
        self
    }

    pub fn formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    pub fn nelements(mut self, range: CountRange) -> Self {
        self.nelements = Some(range);
        self
    }

    pub fn band_gap(mut self, range: PropertyRange) -> Self {
        self.band_gap = Some(range);
        self
    }

    pub fn formation_energy(mut self, range: PropertyRange) -> Self {
        self.formation_energy = Some(range);
        self
    }

    pub fn energy_above_hull(mut self, range: PropertyRange) -> Self {
        self.energy_above_hull = Some(range);
        self
    }

    pub fn space_group(mut self, space_group: impl Into<String>) -> Self {
        self.space_group = Some(space_group.into());
        self
    }

    pub fn crystal_system(mut self, crystal_system: CrystalSystem) -> Self {
        self.crystal_system = Some(crystal_system);
        self
    }

    /// Restrict the search to these provider ids
    pub fn providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.providers = Some(collect_strings(providers));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Validate and canonicalize
    pub fn build(self) -> Result<SearchQuery, QueryError> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if !(MIN_LIMIT..=MAX_LIMIT).contains(&limit) {
            return Err(QueryError::LimitOutOfRange(limit));
        }

        let elements = self.elements.map(normalize_elements).transpose()?;
        let elements_any = self.elements_any.map(normalize_elements).transpose()?;
        let exclude_elements = self.exclude_elements.map(normalize_elements).transpose()?;

        let formula = self
            .formula
            .map(|f| f.split_whitespace().collect::<String>())
            .filter(|f| !f.is_empty());
        let space_group = self
            .space_group
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        // an allowlist with no usable id means no allowlist
        let providers = self
            .providers
            .map(|mut ids| {
                ids.iter_mut().for_each(|id| *id = id.trim().to_string());
                ids.retain(|id| !id.is_empty());
                ids.sort();
                ids.dedup();
                ids
            })
            .filter(|ids| !ids.is_empty());

        let query = SearchQuery {
            elements: elements.filter(|v| !v.is_empty()),
            elements_any: elements_any.filter(|v| !v.is_empty()),
            exclude_elements: exclude_elements.filter(|v| !v.is_empty()),
            formula,
            nelements: self.nelements.filter(|r| !r.is_unbounded()),
            band_gap: self.band_gap.filter(|r| !r.is_unbounded()),
            formation_energy: self.formation_energy.filter(|r| !r.is_unbounded()),
            energy_above_hull: self.energy_above_hull.filter(|r| !r.is_unbounded()),
            space_group,
            crystal_system: self.crystal_system,
            providers,
            limit,
        };
        query.validate()?;
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_normalization() {
        assert_eq!(normalize_element("fe").unwrap(), "Fe");
        assert_eq!(normalize_element(" O ").unwrap(), "O");
        assert!(normalize_element("Xx").is_err());
        assert!(normalize_element("").is_err());
    }

    #[test]
    fn test_invalid_element_fails_construction() {
        let err = SearchQuery::with_elements(["Fe", "Qq"]).unwrap_err();
        assert_eq!(err, QueryError::InvalidElement("Qq".to_string()));
    }

    #[test]
    fn test_limit_bounds() {
        assert!(SearchQuery::builder().limit(0).build().is_err());
        assert!(SearchQuery::builder().limit(10_001).build().is_err());
        assert_eq!(SearchQuery::builder().limit(1).build().unwrap().limit(), 1);
        assert_eq!(
            SearchQuery::builder().limit(10_000).build().unwrap().limit(),
            10_000
        );
        assert_eq!(SearchQuery::builder().build().unwrap().limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn test_property_range_invariant() {
        assert!(PropertyRange::new(Some(2.0), Some(1.0)).is_err());
        assert!(PropertyRange::new(Some(1.0), Some(1.0)).is_ok());
        assert!(PropertyRange::new(Some(f64::NAN), None).is_err());
        assert!(CountRange::new(Some(4), Some(2)).is_err());

        let range = PropertyRange::between(0.5, 3.0).unwrap();
        assert!(range.contains(0.5));
        assert!(range.contains(3.0));
        assert!(!range.contains(3.1));
    }

    #[test]
    fn test_hash_ignores_construction_order() {
        let a = SearchQuery::builder()
            .elements(["O", "Fe"])
            .band_gap(PropertyRange::at_least(1.0).unwrap())
            .limit(20)
            .build()
            .unwrap();
        let b = SearchQuery::builder()
            .limit(20)
            .band_gap(PropertyRange::at_least(1.0).unwrap())
            .elements(["fe", "o", "Fe"])
            .build()
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.query_hash(), b.query_hash());
    }

    #[test]
    fn test_hash_differs_for_different_values() {
        let a = SearchQuery::with_elements(["Fe", "O"]).unwrap();
        let b = SearchQuery::with_elements(["Fe", "S"]).unwrap();
        let c = SearchQuery::builder()
            .elements(["Fe", "O"])
            .limit(5)
            .build()
            .unwrap();

        assert_ne!(a.query_hash(), b.query_hash());
        assert_ne!(a.query_hash(), c.query_hash());
    }

    #[test]
    fn test_canonical_json_sorted_and_sparse() {
        let q = SearchQuery::builder()
            .space_group("Fm-3m")
            .elements(["Na", "Cl"])
            .build()
            .unwrap();
        assert_eq!(
            q.canonical_json(),
            r#"{"elements":["Cl","Na"],"limit":100,"space_group":"Fm-3m"}"#
        );
    }

    #[test]
    fn test_filter_fields_skip_control_and_empty() {
        let q = SearchQuery::builder()
            .elements(["Fe"])
            .exclude_elements(Vec::<String>::new())
            .providers(["mp"])
            .limit(3)
            .build()
            .unwrap();
        assert_eq!(q.filter_fields(), QueryFields::ELEMENTS);
        assert!(q.exclude_elements().is_none());

        let empty = SearchQuery::builder().providers(["mp"]).build().unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_allowlist() {
        let q = SearchQuery::builder().providers(["b", "a"]).build().unwrap();
        assert!(q.allows_provider("a"));
        assert!(!q.allows_provider("c"));
        assert!(SearchQuery::default().allows_provider("anything"));
    }

    #[test]
    fn test_blank_allowlist_is_no_allowlist() {
        let plain = SearchQuery::with_elements(["Fe"]).unwrap();
        for ids in [vec![], vec![" "], vec!["", "  "]] {
            let q = SearchQuery::builder()
                .elements(["Fe"])
                .providers(ids)
                .build()
                .unwrap();
            assert!(q.providers().is_none());
            assert!(q.allows_provider("mp"));
            assert_eq!(q.query_hash(), plain.query_hash());
        }
    }

    #[test]
    fn test_field_names_roundtrip() {
        let fields = QueryFields::from_field_names(["band_gap", "elements"]).unwrap();
        assert_eq!(fields.field_names(), vec!["elements", "band_gap"]);
        assert!(QueryFields::from_field_name("color").is_err());
    }

    #[test]
    fn test_crystal_system_parse() {
        assert_eq!("Cubic".parse::<CrystalSystem>().unwrap(), CrystalSystem::Cubic);
        assert!("rhombic".parse::<CrystalSystem>().is_err());
    }

    #[test]
    fn test_validate_rejects_tampered_query() {
        let json = r#"{"elements":["fe"],"limit":10}"#;
        let q: SearchQuery = serde_json::from_str(json).unwrap();
        assert!(q.validate().is_err());
    }
}
