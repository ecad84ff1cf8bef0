//! Material record model with per-value provenance.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::query::CrystalSystem;

/// A scientific value together with where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// The value itself (number, string or array)
    pub value: Value,

    /// Provider id that asserted this value
    pub source: String,

    /// How the value was obtained (e.g. "GGA+U", "experimental")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Physical unit, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl PropertyValue {
    pub fn new(value: impl Into<Value>, source: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source: source.into(),
            method: None,
            unit: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Numeric view of the value
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// String view of the value
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// The fixed, named property slots of a [`Material`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertySlot {
    SpaceGroup,
    CrystalSystem,
    LatticeVectors,
    BandGap,
    FormationEnergy,
    EnergyAboveHull,
    BulkModulus,
    DebyeTemperature,
}

impl PropertySlot {
    /// All slots, in the order fusion visits them
    pub const ALL: [PropertySlot; 8] = [
        PropertySlot::SpaceGroup,
        PropertySlot::CrystalSystem,
        PropertySlot::LatticeVectors,
        PropertySlot::BandGap,
        PropertySlot::FormationEnergy,
        PropertySlot::EnergyAboveHull,
        PropertySlot::BulkModulus,
        PropertySlot::DebyeTemperature,
    ];

    /// Property name, as used in extra-property keys
    pub fn name(&self) -> &'static str {
        match self {
            PropertySlot::SpaceGroup => "space_group",
            PropertySlot::CrystalSystem => "crystal_system",
            PropertySlot::LatticeVectors => "lattice_vectors",
            PropertySlot::BandGap => "band_gap",
            PropertySlot::FormationEnergy => "formation_energy",
            PropertySlot::EnergyAboveHull => "energy_above_hull",
            PropertySlot::BulkModulus => "bulk_modulus",
            PropertySlot::DebyeTemperature => "debye_temperature",
        }
    }

    /// Default unit attached when a provider supplies a bare number
    pub fn default_unit(&self) -> Option<&'static str> {
        match self {
            PropertySlot::SpaceGroup | PropertySlot::CrystalSystem => None,
            PropertySlot::LatticeVectors => Some("Å"),
            PropertySlot::BandGap => Some("eV"),
            PropertySlot::FormationEnergy | PropertySlot::EnergyAboveHull => Some("eV/atom"),
            PropertySlot::BulkModulus => Some("GPa"),
            PropertySlot::DebyeTemperature => Some("K"),
        }
    }
}

/// Key under which a demoted or provider-specific value is stored
pub fn extra_key(property: &str, source: &str) -> String {
    format!("{}:{}", property, source)
}

/// A materials record, possibly fused from several providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// Identifier from the first contributing provider
    pub id: String,

    /// Chemical formula as reported by the first contributing provider
    pub formula: String,

    /// Sorted element symbols
    pub elements: Vec<String>,

    /// Number of distinct elements
    pub nelements: usize,

    /// Contributing provider ids, in contribution order (never empty)
    pub sources: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_group: Option<PropertyValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crystal_system: Option<PropertyValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lattice_vectors: Option<PropertyValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band_gap: Option<PropertyValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formation_energy: Option<PropertyValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_above_hull: Option<PropertyValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_modulus: Option<PropertyValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debye_temperature: Option<PropertyValue>,

    /// Values that lost a slot conflict, or provider-specific properties,
    /// keyed by `property:source`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_properties: BTreeMap<String, PropertyValue>,

    /// Raw provider payloads keyed by provider id (debugging only)
    #[serde(skip)]
    pub raw: BTreeMap<String, Value>,
}

impl Material {
    /// Start building a single-source record
    pub fn builder(
        id: impl Into<String>,
        formula: impl Into<String>,
        source: impl Into<String>,
    ) -> MaterialBuilder {
        MaterialBuilder::new(id, formula, source)
    }

    pub fn slot(&self, slot: PropertySlot) -> Option<&PropertyValue> {
        match slot {
            PropertySlot::SpaceGroup => self.space_group.as_ref(),
            PropertySlot::CrystalSystem => self.crystal_system.as_ref(),
            PropertySlot::LatticeVectors => self.lattice_vectors.as_ref(),
            PropertySlot::BandGap => self.band_gap.as_ref(),
            PropertySlot::FormationEnergy => self.formation_energy.as_ref(),
            PropertySlot::EnergyAboveHull => self.energy_above_hull.as_ref(),
            PropertySlot::BulkModulus => self.bulk_modulus.as_ref(),
            PropertySlot::DebyeTemperature => self.debye_temperature.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, slot: PropertySlot) -> &mut Option<PropertyValue> {
        match slot {
            PropertySlot::SpaceGroup => &mut self.space_group,
            PropertySlot::CrystalSystem => &mut self.crystal_system,
            PropertySlot::LatticeVectors => &mut self.lattice_vectors,
            PropertySlot::BandGap => &mut self.band_gap,
            PropertySlot::FormationEnergy => &mut self.formation_energy,
            PropertySlot::EnergyAboveHull => &mut self.energy_above_hull,
            PropertySlot::BulkModulus => &mut self.bulk_modulus,
            PropertySlot::DebyeTemperature => &mut self.debye_temperature,
        }
    }

    /// The first contributing provider
    pub fn primary_source(&self) -> &str {
        self.sources.first().map(String::as_str).unwrap_or_default()
    }

    /// Space group symbol, if known
    pub fn space_group_symbol(&self) -> Option<&str> {
        self.space_group.as_ref().and_then(PropertyValue::as_str)
    }
}

fn formula_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([A-Z][a-z]?)(\d+(?:\.\d+)?)?").expect("valid formula regex")
    })
}

/// Parse a flat formula (no parentheses) into element counts
pub fn parse_formula(formula: &str) -> Option<BTreeMap<String, f64>> {
    let compact: String = formula.split_whitespace().collect();
    if compact.is_empty() {
        return None;
    }

    let mut counts = BTreeMap::new();
    let mut consumed = 0;
    for caps in formula_token_regex().captures_iter(&compact) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let count = match caps.get(2) {
            Some(m) => m.as_str().parse::<f64>().ok()?,
            None => 1.0,
        };
        *counts.entry(caps[1].to_string()).or_insert(0.0) += count;
    }

    (consumed == compact.len()).then_some(counts)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Normalize a formula to a reduced, alphabetically ordered form, so that
/// `"O3Fe2"`, `"Fe2 O3"` and `"Fe4O6"` all become `"Fe2O3"`.
///
/// Formulas that cannot be parsed are returned with whitespace removed.
pub fn normalize_formula(formula: &str) -> String {
    let Some(counts) = parse_formula(formula) else {
        return formula.split_whitespace().collect();
    };

    let integral = counts.values().all(|c| c.fract() == 0.0 && *c >= 1.0);
    let divisor = if integral {
        counts.values().fold(0u64, |acc, c| gcd(acc, *c as u64)).max(1)
    } else {
        1
    };

    counts
        .iter()
        .map(|(element, count)| {
            let reduced = if integral {
                (*count as u64 / divisor) as f64
            } else {
                *count
            };
            if reduced == 1.0 {
                element.clone()
            } else {
                format!("{}{}", element, reduced)
            }
        })
        .collect()
}

/// Builder for single-source [`Material`] records.
///
/// Every numeric setter wraps the value in a [`PropertyValue`] tagged with
/// the builder's source, so providers cannot emit untagged numbers.
#[derive(Debug, Clone)]
pub struct MaterialBuilder {
    material: Material,
    method: Option<String>,
}

impl MaterialBuilder {
    pub fn new(id: impl Into<String>, formula: impl Into<String>, source: impl Into<String>) -> Self {
        let formula = formula.into();
        let elements: Vec<String> = parse_formula(&formula)
            .map(|counts| counts.into_keys().collect())
            .unwrap_or_default();

        Self {
            material: Material {
                id: id.into(),
                nelements: elements.len(),
                elements,
                formula,
                sources: vec![source.into()],
                space_group: None,
                crystal_system: None,
                lattice_vectors: None,
                band_gap: None,
                formation_energy: None,
                energy_above_hull: None,
                bulk_modulus: None,
                debye_temperature: None,
                extra_properties: BTreeMap::new(),
                raw: BTreeMap::new(),
            },
            method: None,
        }
    }

    fn source(&self) -> &str {
        self.material.primary_source()
    }

    fn tagged(&self, slot: Option<PropertySlot>, value: Value) -> PropertyValue {
        let mut pv = PropertyValue::new(value, self.source());
        pv.method = self.method.clone();
        pv.unit = slot.and_then(|s| s.default_unit()).map(str::to_string);
        pv
    }

    /// Method label applied to values set after this call
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Override the element list derived from the formula
    pub fn elements<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut elements: Vec<String> = elements.into_iter().map(Into::into).collect();
        elements.sort();
        elements.dedup();
        self.material.nelements = elements.len();
        self.material.elements = elements;
        self
    }

    /// Set a slot from a bare value, tagging it with source, method and the
    /// slot's default unit
    pub fn value(mut self, slot: PropertySlot, value: impl Into<Value>) -> Self {
        let pv = self.tagged(Some(slot), value.into());
        *self.material.slot_mut(slot) = Some(pv);
        self
    }

    /// Set a slot from a fully specified value
    pub fn property(mut self, slot: PropertySlot, value: PropertyValue) -> Self {
        *self.material.slot_mut(slot) = Some(value);
        self
    }

    pub fn space_group(self, symbol: impl Into<String>) -> Self {
        self.value(PropertySlot::SpaceGroup, symbol.into())
    }

    pub fn crystal_system(self, system: CrystalSystem) -> Self {
        self.value(PropertySlot::CrystalSystem, system.as_str())
    }

    pub fn lattice_vectors(self, vectors: Vec<[f64; 3]>) -> Self {
        let value = serde_json::to_value(vectors).unwrap_or(Value::Null);
        self.value(PropertySlot::LatticeVectors, value)
    }

    pub fn band_gap(self, ev: f64) -> Self {
        self.value(PropertySlot::BandGap, ev)
    }

    pub fn formation_energy(self, ev_per_atom: f64) -> Self {
        self.value(PropertySlot::FormationEnergy, ev_per_atom)
    }

    pub fn energy_above_hull(self, ev_per_atom: f64) -> Self {
        self.value(PropertySlot::EnergyAboveHull, ev_per_atom)
    }

    pub fn bulk_modulus(self, gpa: f64) -> Self {
        self.value(PropertySlot::BulkModulus, gpa)
    }

    pub fn debye_temperature(self, kelvin: f64) -> Self {
        self.value(PropertySlot::DebyeTemperature, kelvin)
    }

    /// Add a provider-specific property, stored under `name:source`
    pub fn extra(mut self, name: &str, value: impl Into<Value>) -> Self {
        let key = extra_key(name, self.source());
        let pv = self.tagged(None, value.into());
        self.material.extra_properties.insert(key, pv);
        self
    }

    /// Keep the provider's raw payload for debugging
    pub fn raw(mut self, payload: Value) -> Self {
        let source = self.source().to_string();
        self.material.raw.insert(source, payload);
        self
    }

    pub fn build(self) -> Material {
        self.material
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_tags_provenance() {
        let m = Material::builder("mp-19770", "Fe2O3", "mp")
            .method("GGA+U")
            .band_gap(2.1)
            .space_group("R-3c")
            .build();

        assert_eq!(m.elements, vec!["Fe", "O"]);
        assert_eq!(m.nelements, 2);
        assert_eq!(m.sources, vec!["mp"]);

        let gap = m.band_gap.as_ref().unwrap();
        assert_eq!(gap.as_f64(), Some(2.1));
        assert_eq!(gap.source, "mp");
        assert_eq!(gap.method.as_deref(), Some("GGA+U"));
        assert_eq!(gap.unit.as_deref(), Some("eV"));
        assert_eq!(m.space_group_symbol(), Some("R-3c"));
    }

    #[test]
    fn test_extra_keyed_by_source() {
        let m = Material::builder("x", "NaCl", "oqmd")
            .extra("stability", -0.2)
            .build();
        assert!(m.extra_properties.contains_key("stability:oqmd"));
    }

    #[test]
    fn test_raw_not_serialized() {
        let m = Material::builder("x", "NaCl", "oqmd")
            .raw(serde_json::json!({"secret": 1}))
            .build();
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("secret"));
        assert!(!m.raw.is_empty());
    }

    #[test]
    fn test_parse_formula() {
        let counts = parse_formula("Fe2O3").unwrap();
        assert_eq!(counts.get("Fe"), Some(&2.0));
        assert_eq!(counts.get("O"), Some(&3.0));
        assert!(parse_formula("Fe2(O3").is_none());
        assert!(parse_formula("").is_none());
    }

    #[test]
    fn test_normalize_formula() {
        assert_eq!(normalize_formula("O3Fe2"), "Fe2O3");
        assert_eq!(normalize_formula("Fe4 O6"), "Fe2O3");
        assert_eq!(normalize_formula("NaCl"), "ClNa");
        assert_eq!(normalize_formula("Li0.5CoO2"), "CoLi0.5O2");
        assert_eq!(normalize_formula("(NH4)2SO4"), "(NH4)2SO4");
    }
}
