//! JSON:API payloads.
//!
//! Input is already `{data, included}`; normalizing only translates member
//! keys through the [`KeyMap`] and canonicalizes type names.

use crate::builder::{coerce_id, known_type, should_serialize_many, IncludedSet};
use crate::keys::{KeyMap, KeyStyle};
use quarry_core::{
    inflector, NormalizeContext, NormalizeError, PrimaryData, QuarryResult, RelationshipData,
    RelationshipObject, RelationshipSnapshot, RequestType, ResourceDocument, ResourceObject,
    ResourceReference, ResourceType, SchemaRegistry, SerializeOptions, Serializer, Snapshot,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct JsonApiSerializer {
    key_style: KeyStyle,
}

impl Default for JsonApiSerializer {
    fn default() -> Self {
        Self {
            key_style: KeyStyle::Dasherized,
        }
    }
}

impl JsonApiSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_style(mut self, key_style: KeyStyle) -> Self {
        self.key_style = key_style;
        self
    }

    /// Wire type name: pluralized and dasherized.
    pub fn payload_type(resource_type: &ResourceType) -> String {
        inflector::pluralize(resource_type.as_str())
    }

    fn invalid(reason: impl Into<String>) -> quarry_core::QuarryError {
        NormalizeError::InvalidDocument {
            reason: reason.into(),
        }
        .into()
    }

    fn normalize_reference(
        ctx: &NormalizeContext<'_>,
        raw: &Value,
    ) -> QuarryResult<Option<ResourceReference>> {
        let type_name = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Self::invalid("resource identifier without type"))?;
        let Some(resource_type) = known_type(ctx, type_name)? else {
            return Ok(None);
        };
        let id = raw.get("id").and_then(coerce_id);
        let lid = raw.get("lid").and_then(Value::as_str).map(str::to_string);
        if id.is_none() && lid.is_none() {
            return Err(Self::invalid("resource identifier without id or lid"));
        }
        Ok(Some(ResourceReference {
            id,
            resource_type,
            lid,
        }))
    }

    fn normalize_relationship(
        ctx: &NormalizeContext<'_>,
        raw: Value,
    ) -> QuarryResult<RelationshipObject> {
        let Value::Object(mut raw) = raw else {
            return Err(Self::invalid("relationship must be a JSON object"));
        };
        let data = match raw.remove("data") {
            None => None,
            Some(Value::Null) => Some(RelationshipData::One(None)),
            Some(Value::Array(items)) => {
                let mut references = Vec::with_capacity(items.len());
                for item in &items {
                    if let Some(reference) = Self::normalize_reference(ctx, item)? {
                        references.push(reference);
                    }
                }
                Some(RelationshipData::Many(references))
            }
            Some(item) => Some(RelationshipData::One(Self::normalize_reference(ctx, &item)?)),
        };
        Ok(RelationshipObject {
            data,
            links: raw.remove("links"),
            meta: raw.remove("meta"),
        })
    }

    fn normalize_resource(
        &self,
        ctx: &NormalizeContext<'_>,
        raw: Value,
    ) -> QuarryResult<Option<ResourceObject>> {
        let Value::Object(mut raw) = raw else {
            return Err(Self::invalid("resource object must be a JSON object"));
        };
        let type_name = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Self::invalid("resource object without type"))?
            .to_string();
        let Some(resource_type) = known_type(ctx, &type_name)? else {
            return Ok(None);
        };
        let schema = ctx.registry.schema(&resource_type)?;
        let keys = KeyMap::for_type(schema, self.key_style);

        let mut attributes = Map::new();
        if let Some(Value::Object(raw_attributes)) = raw.remove("attributes") {
            for (key, value) in raw_attributes {
                if let Some(name) = keys.attribute_for_key(&key) {
                    attributes.insert(name.to_string(), value);
                }
            }
        }

        let mut relationships = BTreeMap::new();
        if let Some(Value::Object(raw_relationships)) = raw.remove("relationships") {
            for (key, value) in raw_relationships {
                match keys.relationship_for_key(&key) {
                    Some(name) => {
                        relationships.insert(name.to_string(), Self::normalize_relationship(ctx, value)?);
                    }
                    None => tracing::debug!(
                        resource_type = %resource_type,
                        key = %key,
                        "Ignoring unknown relationship key"
                    ),
                }
            }
        }

        Ok(Some(ResourceObject {
            id: raw.get("id").and_then(coerce_id),
            lid: raw.get("lid").and_then(Value::as_str).map(str::to_string),
            resource_type,
            attributes,
            relationships,
        }))
    }

    fn reference_json(reference: &ResourceReference) -> Value {
        let mut out = Map::new();
        out.insert("type".to_string(), json!(Self::payload_type(&reference.resource_type)));
        match (&reference.id, &reference.lid) {
            (Some(id), _) => {
                out.insert("id".to_string(), json!(id));
            }
            (None, Some(lid)) => {
                out.insert("lid".to_string(), json!(lid));
            }
            (None, None) => {}
        }
        Value::Object(out)
    }
}

impl Serializer for JsonApiSerializer {
    fn normalize_response(
        &self,
        ctx: &NormalizeContext<'_>,
        primary_type: &ResourceType,
        payload: Value,
        _id: Option<&str>,
        _request: RequestType,
    ) -> QuarryResult<ResourceDocument> {
        let Value::Object(mut root) = payload else {
            return Err(Self::invalid("JSON:API payload must be a JSON object"));
        };
        let Some(data) = root.remove("data") else {
            return Err(NormalizeError::MissingData {
                resource_type: primary_type.clone(),
            }
            .into());
        };

        let data = match data {
            Value::Null => PrimaryData::One(None),
            Value::Array(items) => {
                let mut objects = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(object) = self.normalize_resource(ctx, item)? {
                        objects.push(object);
                    }
                }
                PrimaryData::Many(objects)
            }
            item => PrimaryData::One(self.normalize_resource(ctx, item)?.map(Box::new)),
        };

        let mut included = IncludedSet::new();
        if let Some(Value::Array(items)) = root.remove("included") {
            for item in items {
                if let Some(object) = self.normalize_resource(ctx, item)? {
                    included.push(object);
                }
            }
        }
        Ok(included.into_document(data, root.remove("meta")))
    }

    fn serialize(
        &self,
        registry: &SchemaRegistry,
        snapshot: &Snapshot,
        options: &SerializeOptions,
    ) -> QuarryResult<Value> {
        let schema = registry.schema(&snapshot.resource_type)?;
        let keys = KeyMap::for_type(schema, self.key_style);

        let mut resource = Map::new();
        resource.insert(
            "type".to_string(),
            json!(Self::payload_type(&snapshot.resource_type)),
        );
        match &snapshot.id {
            Some(id) if options.include_id => {
                resource.insert("id".to_string(), json!(id));
            }
            Some(_) => {}
            None => {
                resource.insert("lid".to_string(), json!(snapshot.lid()));
            }
        }

        let mut attributes = Map::new();
        for attr in &schema.attributes {
            if let Some(key) = keys.key_for_attribute(&attr.name) {
                let value = snapshot.attr(&attr.name).cloned().unwrap_or(Value::Null);
                attributes.insert(key.to_string(), value);
            }
        }
        resource.insert("attributes".to_string(), Value::Object(attributes));

        let mut relationships = Map::new();
        for def in registry.relationships_of(&snapshot.resource_type) {
            let (Some(key), Some(related)) = (
                keys.key_for_relationship(def.name()),
                snapshot.relationships.get(def.name()),
            ) else {
                continue;
            };
            let data = match related {
                RelationshipSnapshot::One(member) => member
                    .as_ref()
                    .map_or(Value::Null, |m| Self::reference_json(&m.reference)),
                RelationshipSnapshot::Many(members) if should_serialize_many(def) => Value::Array(
                    members.iter().map(|m| Self::reference_json(&m.reference)).collect(),
                ),
                RelationshipSnapshot::Many(_) => continue,
            };
            relationships.insert(key.to_string(), json!({ "data": data }));
        }
        if !relationships.is_empty() {
            resource.insert("relationships".to_string(), Value::Object(relationships));
        }

        Ok(json!({ "data": resource }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{Identifier, RelatedSnapshot};
    use quarry_test_utils::fixtures;

    fn normalize(payload: Value) -> QuarryResult<ResourceDocument> {
        let registry = fixtures::villain_registry();
        let ctx = NormalizeContext::new(&registry);
        JsonApiSerializer::new().normalize_response(
            &ctx,
            &ResourceType::new("super-villain"),
            payload,
            Some("1"),
            RequestType::FindRecord,
        )
    }

    #[test]
    fn test_keys_and_types_are_canonicalized() {
        let doc = normalize(json!({
            "data": {
                "type": "super-villains",
                "id": 1,
                "attributes": {"first-name": "Tom", "unknown": true},
                "relationships": {
                    "home-planet": {"data": {"type": "home-planets", "id": "7"}},
                    "evil-minions": {"data": []}
                }
            },
            "included": [{"type": "home-planets", "id": "7", "attributes": {"name": "Umber"}}]
        }))
        .expect("normalize");

        let villain = &doc.data.resources()[0];
        assert_eq!(villain.resource_type.as_str(), "super-villain");
        assert_eq!(villain.id.as_deref(), Some("1"));
        assert_eq!(villain.attributes.len(), 1);
        assert_eq!(villain.attributes["firstName"], json!("Tom"));
        assert_eq!(
            villain.relationships["homePlanet"].data,
            Some(RelationshipData::One(Some(fixtures::reference("home-planet", "7"))))
        );
        assert_eq!(
            villain.relationships["evilMinions"].data,
            Some(RelationshipData::Many(vec![]))
        );
        assert_eq!(doc.included[0].attributes["name"], json!("Umber"));
    }

    #[test]
    fn test_null_data_is_an_empty_document() {
        let doc = normalize(json!({"data": null})).expect("normalize");
        assert_eq!(serde_json::to_value(&doc).unwrap(), json!({"data": null, "included": []}));
    }

    #[test]
    fn test_missing_data_is_an_error() {
        let err = normalize(json!({"included": []})).unwrap_err();
        assert!(matches!(
            err,
            quarry_core::QuarryError::Normalize(NormalizeError::MissingData { .. })
        ));
    }

    #[test]
    fn test_unknown_included_type_dropped() {
        let doc = normalize(json!({
            "data": {"type": "super-villains", "id": "1"},
            "included": [{"type": "spaceships", "id": "1"}]
        }))
        .expect("normalize");
        assert!(doc.included.is_empty());
    }

    #[test]
    fn test_serialize_uses_dasherized_keys() {
        let registry = fixtures::villain_registry();
        let snapshot = Snapshot {
            identifier: Identifier::from_lid("@lid:v"),
            resource_type: ResourceType::new("super-villain"),
            id: None,
            attributes: json!({"firstName": "Tom"}).as_object().cloned().unwrap_or_default(),
            changed_attributes: BTreeMap::new(),
            relationships: BTreeMap::from([(
                "homePlanet".to_string(),
                RelationshipSnapshot::One(Some(RelatedSnapshot {
                    reference: fixtures::reference("home-planet", "7"),
                    attributes: Map::new(),
                    relationships: BTreeMap::new(),
                })),
            )]),
        };
        let body = JsonApiSerializer::new()
            .serialize(&registry, &snapshot, &SerializeOptions::with_id())
            .expect("serialize");
        assert_eq!(
            body,
            json!({
                "data": {
                    "type": "super-villains",
                    "lid": "@lid:v",
                    "attributes": {"first-name": "Tom", "last-name": null},
                    "relationships": {
                        "home-planet": {"data": {"type": "home-planets", "id": "7"}}
                    }
                }
            })
        );
    }
}
