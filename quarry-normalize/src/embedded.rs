//! Embedded-records strategy.
//!
//! Relationships configured here carry full resource bodies instead of ids.
//! On the way in, [`crate::RestSerializer`] lifts every embedded body into
//! `included` and leaves a reference behind; on the way out the related
//! snapshot is written inline.

use crate::builder::{reference_id, should_serialize_many};
use crate::keys::{KeyMap, KeyStyle};
use quarry_core::{
    inflector, QuarryResult, RelatedSnapshot, RelationshipData, RelationshipDefinition,
    RelationshipSnapshot, ResourceType, SchemaRegistry,
};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// How one direction treats a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    /// Full bodies.
    Records,
    /// Plain ids.
    Ids,
    /// Left out of the payload.
    Omit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedOption {
    pub serialize: EmbedMode,
    pub deserialize: EmbedMode,
}

impl EmbedOption {
    pub fn new(serialize: EmbedMode, deserialize: EmbedMode) -> Self {
        Self {
            serialize,
            deserialize,
        }
    }

    /// Bodies in both directions.
    pub fn always() -> Self {
        Self::new(EmbedMode::Records, EmbedMode::Records)
    }
}

/// Per-relationship embedding configuration.
///
/// Options set on an abstract type apply to every type implementing it.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedRecords {
    options: HashMap<(ResourceType, String), EmbedOption>,
}

impl EmbeddedRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn embed(mut self, resource_type: &str, relationship: &str, option: EmbedOption) -> Self {
        self.options
            .insert((ResourceType::new(resource_type), relationship.to_string()), option);
        self
    }

    pub fn option(
        &self,
        registry: &SchemaRegistry,
        resource_type: &ResourceType,
        relationship: &str,
    ) -> Option<EmbedOption> {
        std::iter::once(resource_type)
            .chain(registry.ancestors(resource_type))
            .find_map(|t| self.options.get(&(t.clone(), relationship.to_string())))
            .copied()
    }

    pub fn deserializes_records(
        &self,
        registry: &SchemaRegistry,
        resource_type: &ResourceType,
        relationship: &str,
    ) -> bool {
        self.option(registry, resource_type, relationship)
            .map_or(false, |o| o.deserialize == EmbedMode::Records)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

/// Write an embedded relationship as full bodies.
pub(crate) fn serialize_records(
    registry: &SchemaRegistry,
    def: &RelationshipDefinition,
    related: &RelationshipSnapshot,
) -> QuarryResult<Value> {
    match related {
        RelationshipSnapshot::One(None) => Ok(Value::Null),
        RelationshipSnapshot::One(Some(member)) => serialize_body(registry, def, member),
        RelationshipSnapshot::Many(members) => members
            .iter()
            .map(|member| serialize_body(registry, def, member))
            .collect::<QuarryResult<Vec<_>>>()
            .map(Value::Array),
    }
}

fn serialize_body(
    registry: &SchemaRegistry,
    def: &RelationshipDefinition,
    member: &RelatedSnapshot,
) -> QuarryResult<Value> {
    let resource_type = &member.reference.resource_type;
    let schema = registry.schema(resource_type)?;
    let keys = KeyMap::for_type(schema, KeyStyle::AsIs);
    let mut hash = Map::new();

    if let Some(id) = &member.reference.id {
        hash.insert(schema.primary_key.clone(), Value::String(id.clone()));
    }
    for attr in &schema.attributes {
        if let Some(key) = keys.key_for_attribute(&attr.name) {
            let value = member.attributes.get(&attr.name).cloned().unwrap_or(Value::Null);
            hash.insert(key.to_string(), value);
        }
    }

    // The link back to the parent is implied by the nesting.
    let parent_link = def.inverse.as_ref().map(|inverse| inverse.key.name.as_str());
    for rel in registry.relationships_of(resource_type) {
        if Some(rel.name()) == parent_link {
            continue;
        }
        let (Some(key), Some(data)) = (
            keys.key_for_relationship(rel.name()),
            member.relationships.get(rel.name()),
        ) else {
            continue;
        };
        match data {
            RelationshipData::One(reference) => {
                hash.insert(
                    key.to_string(),
                    reference.as_ref().map_or(Value::Null, reference_id),
                );
            }
            RelationshipData::Many(references) if should_serialize_many(rel) => {
                hash.insert(
                    key.to_string(),
                    Value::Array(references.iter().map(reference_id).collect()),
                );
            }
            RelationshipData::Many(_) => {}
        }
    }

    if def.polymorphic {
        hash.insert(
            "type".to_string(),
            Value::String(inflector::camelize(resource_type.as_str())),
        );
    }
    Ok(Value::Object(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_test_utils::fixtures;

    #[test]
    fn test_option_lookup_walks_implemented_types() {
        let registry = fixtures::app_registry();
        let embedded = EmbeddedRecords::new().embed("hat", "user", EmbedOption::always());

        assert!(embedded.deserializes_records(&registry, &ResourceType::new("big-hat"), "user"));
        assert!(!embedded.deserializes_records(&registry, &ResourceType::new("hobby"), "user"));
    }

    #[test]
    fn test_mixed_option() {
        let registry = fixtures::villain_registry();
        let embedded = EmbeddedRecords::new().embed(
            "super-villain",
            "evilMinions",
            EmbedOption::new(EmbedMode::Ids, EmbedMode::Records),
        );
        let villain = ResourceType::new("super-villain");
        let option = embedded.option(&registry, &villain, "evilMinions");
        assert_eq!(option.map(|o| o.serialize), Some(EmbedMode::Ids));
        assert!(embedded.deserializes_records(&registry, &villain, "evilMinions"));
    }
}
