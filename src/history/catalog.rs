//! Entity discovery across configured targets and observed history.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::storage::{StatusEntry, Target};

/// One entity known to a node, with its resolved display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub name: String,
    /// Position in the configured target list, when configured.
    pub position: Option<usize>,
}

/// Merge configured targets and the ids observed in history into one list.
///
/// Name precedence is: configured name, then the most recently observed
/// check name, then the raw id. Entities come back in discovery order
/// (configured targets first); use the sort helpers for display order.
pub fn resolve_entities<'a>(
    targets: &[Target],
    observed: impl IntoIterator<Item = &'a StatusEntry>,
) -> Vec<Entity> {
    let mut entities: Vec<Entity> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut configured_name: Vec<bool> = Vec::new();

    for (position, target) in targets.iter().enumerate() {
        let id = target.id.trim();
        if id.is_empty() || index.contains_key(id) {
            continue;
        }
        let name = target.name.trim();
        index.insert(id.to_string(), entities.len());
        configured_name.push(!name.is_empty());
        entities.push(Entity {
            id: id.to_string(),
            name: (if name.is_empty() { id } else { name }).to_string(),
            position: Some(position),
        });
    }

    for entry in observed {
        for check in &entry.checks {
            let id = check.id.trim();
            if id.is_empty() {
                continue;
            }
            let name = check.name.trim();
            match index.get(id) {
                Some(&i) => {
                    if !configured_name[i] && !name.is_empty() {
                        entities[i].name = name.to_string();
                    }
                }
                None => {
                    index.insert(id.to_string(), entities.len());
                    configured_name.push(false);
                    entities.push(Entity {
                        id: id.to_string(),
                        name: (if name.is_empty() { id } else { name }).to_string(),
                        position: None,
                    });
                }
            }
        }
    }

    entities
}

/// Order by display name (case-insensitive), ties broken by id.
pub fn by_name(a: &Entity, b: &Entity) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.id.cmp(&b.id))
}

/// Configured targets first in configured order, then [`by_name`].
pub fn by_configured_order(a: &Entity, b: &Entity) -> Ordering {
    match (a.position, b.position) {
        (Some(x), Some(y)) if x != y => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => by_name(a, b),
    }
}
