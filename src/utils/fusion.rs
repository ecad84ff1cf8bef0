//! Cross-provider fusion of single-source records.
//!
//! Records are grouped by [`identity_key`]. The first record of a group is
//! the base; each later record adds its provider to the provenance list,
//! fills empty property slots, and has every conflicting slot value demoted
//! to `extra_properties["<property>:<source>"]`. A slot that already has a
//! value is never overwritten.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use crate::models::{extra_key, normalize_formula, Material, PropertySlot, PropertyValue};

/// Space group used in the identity key when a record has none
pub const UNKNOWN_SPACE_GROUP: &str = "unknown";

/// Normalized formula plus space group.
///
/// A record without a formula gets a key of its own, so it never merges.
pub fn identity_key(material: &Material) -> String {
    let formula = normalize_formula(&material.formula);
    if formula.is_empty() {
        return format!("?{}:{}", material.primary_source(), material.id);
    }
    let space_group = material
        .space_group_symbol()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SPACE_GROUP);
    format!("{}|{}", formula, space_group)
}

/// Merge records that describe the same entity.
///
/// Output order is the order in which each identity key first appears, so
/// the result is deterministic for a deterministic input order.
pub fn fuse_materials(records: Vec<Material>) -> Vec<Material> {
    let mut fused: Vec<Material> = Vec::with_capacity(records.len());
    let mut groups: HashMap<String, usize> = HashMap::new();

    for record in records {
        let key = identity_key(&record);
        match groups.get(&key) {
            Some(&pos) => merge_into(&mut fused[pos], record),
            None => {
                groups.insert(key, fused.len());
                fused.push(record);
            }
        }
    }

    fused
}

fn merge_into(base: &mut Material, mut incoming: Material) {
    for source in &incoming.sources {
        if !base.sources.contains(source) {
            base.sources.push(source.clone());
        }
    }

    if base.elements.is_empty() && !incoming.elements.is_empty() {
        base.nelements = incoming.nelements;
        base.elements = std::mem::take(&mut incoming.elements);
    }

    for slot in PropertySlot::ALL {
        let Some(value) = incoming.slot_mut(slot).take() else {
            continue;
        };
        let target = base.slot_mut(slot);
        if target.is_none() {
            *target = Some(value);
        } else {
            let key = extra_key(slot.name(), &value.source);
            keep_first(&mut base.extra_properties, &base.id, key, value);
        }
    }

    for (key, value) in incoming.extra_properties {
        keep_first(&mut base.extra_properties, &base.id, key, value);
    }

    for (source, payload) in incoming.raw {
        base.raw.entry(source).or_insert(payload);
    }
}

/// Insert unless the key is taken; a later value for the same key is dropped
fn keep_first(
    extras: &mut BTreeMap<String, PropertyValue>,
    material_id: &str,
    key: String,
    value: PropertyValue,
) {
    match extras.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value);
        }
        Entry::Occupied(slot) => {
            tracing::debug!(
                "Dropping {} = {} for {}: already recorded as {}",
                slot.key(),
                value.value,
                material_id,
                slot.get().value
            );
        }
    }
}
