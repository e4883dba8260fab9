use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use weft_core::{Classification, EdgeId, MergePolicy, NodeId, Provenance};

/// One incoming edge's transformed fields.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub node_id: NodeId,
    pub edge_id: EdgeId,
    pub priority: i32,
    pub method: Classification,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("field '{field}' has conflicting values from '{first}' and '{second}'")]
pub struct MergeConflict {
    pub field: String,
    pub first: NodeId,
    pub second: NodeId,
}

/// Merged fields plus where each came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Merged {
    pub fields: Map<String, Value>,
    pub provenance: BTreeMap<String, Provenance>,
}

/// Combine contributions under a merge policy.
///
/// Contributions are visited by descending priority, then source node id.
/// With no declared policy (single-source nodes) the authoritative rule applies.
/// A `null` is a gap under both policies, as in [`Merged::fill`]: any later
/// non-null value takes its place and never conflicts with it.
pub fn merge(
    policy: Option<MergePolicy>,
    mut contributions: Vec<Contribution>,
) -> Result<Merged, MergeConflict> {
    contributions.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    let strict = policy == Some(MergePolicy::Strict);
    let mut merged = Merged::default();

    for contribution in contributions {
        for (field, value) in contribution.fields {
            if let Some(existing) = merged.fields.get(&field).filter(|v| !v.is_null()) {
                if strict && !value.is_null() && *existing != value {
                    let first = match merged.provenance.get(&field) {
                        Some(Provenance::Upstream { node_id, .. }) => node_id.clone(),
                        _ => String::new(),
                    };
                    return Err(MergeConflict {
                        field,
                        first,
                        second: contribution.node_id.clone(),
                    });
                }
                continue;
            }
            if value.is_null() && merged.fields.contains_key(&field) {
                continue;
            }
            merged.provenance.insert(
                field.clone(),
                Provenance::Upstream {
                    node_id: contribution.node_id.clone(),
                    edge_id: contribution.edge_id.clone(),
                    method: contribution.method,
                },
            );
            merged.fields.insert(field, value);
        }
    }

    Ok(merged)
}

impl Merged {
    /// Insert a value only where the field is still missing.
    pub fn fill(&mut self, field: &str, value: &Value, provenance: Provenance) {
        if self.fields.get(field).map_or(true, Value::is_null) {
            self.fields.insert(field.to_string(), value.clone());
            self.provenance.insert(field.to_string(), provenance);
        }
    }
}
