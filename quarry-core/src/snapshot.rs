//! Immutable record snapshots handed to adapters and serializers.

use crate::{Identifier, RelationshipData, ResourceReference, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Old and new value of a locally changed attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub old: Value,
    pub new: Value,
}

/// Shallow view of a related record, enough to embed it in a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedSnapshot {
    pub reference: ResourceReference,
    pub attributes: Map<String, Value>,
    pub relationships: BTreeMap<String, RelationshipData>,
}

/// Related records of one relationship at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelationshipSnapshot {
    One(Option<RelatedSnapshot>),
    Many(Vec<RelatedSnapshot>),
}

impl RelationshipSnapshot {
    /// Linkage only, dropping the embedded bodies.
    pub fn data(&self) -> RelationshipData {
        match self {
            RelationshipSnapshot::One(related) => {
                RelationshipData::One(related.as_ref().map(|r| r.reference.clone()))
            }
            RelationshipSnapshot::Many(related) => {
                RelationshipData::Many(related.iter().map(|r| r.reference.clone()).collect())
            }
        }
    }
}

/// Point-in-time copy of a record's effective state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub identifier: Identifier,
    pub resource_type: ResourceType,
    pub id: Option<String>,
    pub attributes: Map<String, Value>,
    pub changed_attributes: BTreeMap<String, AttributeChange>,
    pub relationships: BTreeMap<String, RelationshipSnapshot>,
}

impl Snapshot {
    pub fn lid(&self) -> &str {
        self.identifier.lid()
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn reference(&self) -> ResourceReference {
        ResourceReference {
            id: self.id.clone(),
            resource_type: self.resource_type.clone(),
            lid: match self.id {
                Some(_) => None,
                None => Some(self.lid().to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relationship_snapshot_data_drops_bodies() {
        let hat = RelatedSnapshot {
            reference: ResourceReference::new(ResourceType::new("hat"), "1"),
            attributes: json!({"color": "red"}).as_object().cloned().unwrap_or_default(),
            relationships: BTreeMap::new(),
        };
        let many = RelationshipSnapshot::Many(vec![hat.clone()]);
        assert_eq!(
            many.data(),
            RelationshipData::Many(vec![ResourceReference::new(ResourceType::new("hat"), "1")])
        );
        assert_eq!(RelationshipSnapshot::One(None).data(), RelationshipData::One(None));
    }

    #[test]
    fn test_new_record_reference_carries_lid() {
        let snapshot = Snapshot {
            identifier: Identifier::from_lid("@lid:x"),
            resource_type: ResourceType::new("user"),
            id: None,
            attributes: Map::new(),
            changed_attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        };
        assert_eq!(snapshot.reference().lid.as_deref(), Some("@lid:x"));
    }
}
