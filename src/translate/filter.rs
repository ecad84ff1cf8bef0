//! Generic filter-string dialect (OPTIMADE style).

use std::fmt;

use crate::models::{QueryFields, SearchQuery};

/// Joiner between clauses
pub const AND: &str = " AND ";

/// Fields [`to_filter`] emits a clause for
pub const FILTER_FIELDS: QueryFields = QueryFields::ELEMENTS
    .union(QueryFields::ELEMENTS_ANY)
    .union(QueryFields::EXCLUDE_ELEMENTS)
    .union(QueryFields::FORMULA)
    .union(QueryFields::NELEMENTS)
    .union(QueryFields::SPACE_GROUP);

/// A translated filter string, kept alongside its individual clauses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireFilter {
    clauses: Vec<String>,
}

impl WireFilter {
    pub fn clauses(&self) -> &[String] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The filter string sent on the wire
    pub fn as_filter_string(&self) -> String {
        self.clauses.join(AND)
    }
}

impl fmt::Display for WireFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_filter_string())
    }
}

/// Quote a string literal, escaping backslashes and double quotes
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn quoted_list(values: &[String]) -> String {
    values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(",")
}

/// Translate a query into the generic filter dialect.
///
/// Only the fields in [`FILTER_FIELDS`] have a clause in this dialect;
/// providers speaking it must not advertise the other fields as filterable.
/// An empty query yields an empty filter.
pub fn to_filter(query: &SearchQuery) -> WireFilter {
    let mut clauses = Vec::new();

    if let Some(elements) = query.elements().filter(|e| !e.is_empty()) {
        clauses.push(format!("elements HAS ALL {}", quoted_list(elements)));
    }

    if let Some(elements) = query.elements_any().filter(|e| !e.is_empty()) {
        clauses.push(format!("elements HAS ANY {}", quoted_list(elements)));
    }

    for element in query.exclude_elements().unwrap_or_default() {
        clauses.push(format!("NOT elements HAS {}", quote(element)));
    }

    if let Some(formula) = query.formula() {
        clauses.push(format!("chemical_formula_reduced={}", quote(formula)));
    }

    if let Some(range) = query.nelements() {
        if let Some(min) = range.min {
            clauses.push(format!("nelements>={}", min));
        }
        if let Some(max) = range.max {
            clauses.push(format!("nelements<={}", max));
        }
    }

    if let Some(space_group) = query.space_group() {
        clauses.push(format!("space_group_symbol={}", quote(space_group)));
    }

    WireFilter { clauses }
}
