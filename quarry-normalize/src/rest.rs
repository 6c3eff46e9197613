//! Flat REST payloads.
//!
//! Top-level keys name resource types (`superVillains`, `homePlanet`), keys
//! prefixed with `_` are sideloads and never primary data, and relationship
//! values are ids, `{id, type}` pairs, or embedded bodies when an
//! [`EmbeddedRecords`] strategy is composed in.

use crate::builder::{coerce_id, known_type, reference_id, should_serialize_many, type_from_key, IncludedSet};
use crate::embedded::{serialize_records, EmbedMode, EmbeddedRecords};
use crate::keys::{KeyMap, KeyStyle};
use quarry_core::{
    inflector, Cardinality, NormalizeContext, NormalizeError, PrimaryData, QuarryError, QuarryResult,
    RelationshipData, RelationshipDefinition, RelationshipObject, RelationshipSnapshot,
    RequestType, ResourceDocument, ResourceObject, ResourceReference, ResourceType,
    SchemaRegistry, SerializeOptions, Serializer, Snapshot,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct RestSerializer {
    embedded: Option<EmbeddedRecords>,
}

impl RestSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embedded(mut self, embedded: EmbeddedRecords) -> Self {
        self.embedded = Some(embedded);
        self
    }

    /// Root key used by [`Serializer::serialize_into_document`].
    pub fn payload_key(resource_type: &ResourceType) -> String {
        inflector::camelize(resource_type.as_str())
    }

    // ========================================================================
    // NORMALIZE
    // ========================================================================

    /// A `type` member selects a concrete type only when it names a registered
    /// type implementing `base` and `base` has no attribute called `type`.
    fn discriminate(ctx: &NormalizeContext<'_>, base: &ResourceType, hash: &Map<String, Value>) -> ResourceType {
        let declares_type_attr = ctx
            .registry
            .get(base)
            .map_or(false, |schema| schema.attribute("type").is_some());
        if declares_type_attr {
            return base.clone();
        }
        match hash.get("type").and_then(Value::as_str) {
            Some(name) => {
                let candidate = type_from_key(name);
                if ctx.registry.contains(&candidate) && ctx.registry.is_a(&candidate, base) {
                    candidate
                } else {
                    base.clone()
                }
            }
            None => base.clone(),
        }
    }

    /// Normalize one resource hash, lifting embedded bodies into `included`.
    pub(crate) fn normalize_hash(
        &self,
        ctx: &NormalizeContext<'_>,
        base: &ResourceType,
        hash: Value,
        included: &mut IncludedSet,
    ) -> QuarryResult<ResourceObject> {
        let Value::Object(mut hash) = hash else {
            return Err(NormalizeError::InvalidResource {
                resource_type: base.clone(),
                reason: "expected a JSON object".to_string(),
            }
            .into());
        };
        let resource_type = Self::discriminate(ctx, base, &hash);
        let schema = ctx.registry.schema(&resource_type)?;
        let keys = KeyMap::for_type(schema, KeyStyle::AsIs);

        let id = hash.remove(&schema.primary_key).as_ref().and_then(coerce_id);

        let mut relationships = BTreeMap::new();
        for def in ctx.registry.relationships_of(&resource_type) {
            let Some(key) = keys.key_for_relationship(def.name()) else {
                continue;
            };
            let hint = if def.polymorphic {
                hash.remove(&format!("{key}Type"))
                    .and_then(|v| v.as_str().map(type_from_key))
            } else {
                None
            };
            let Some(value) = hash.remove(key) else {
                continue;
            };
            let data = self.normalize_linkage(ctx, &resource_type, def, value, hint, included)?;
            relationships.insert(def.name().to_string(), RelationshipObject::with_data(data));
        }

        if keys.field_for_key("links").is_none() {
            if let Some(Value::Object(links)) = hash.remove("links") {
                for (key, url) in links {
                    if let Some(name) = keys.relationship_for_key(&key) {
                        let entry: &mut RelationshipObject =
                            relationships.entry(name.to_string()).or_default();
                        entry.links = Some(json!({ "related": url }));
                    }
                }
            }
        }

        let mut attributes = Map::new();
        for (key, value) in hash {
            if let Some(name) = keys.attribute_for_key(&key) {
                attributes.insert(name.to_string(), value);
            }
        }

        Ok(ResourceObject {
            id,
            lid: None,
            resource_type,
            attributes,
            relationships,
        })
    }

    fn normalize_linkage(
        &self,
        ctx: &NormalizeContext<'_>,
        owner: &ResourceType,
        def: &RelationshipDefinition,
        value: Value,
        hint: Option<ResourceType>,
        included: &mut IncludedSet,
    ) -> QuarryResult<RelationshipData> {
        let embedded = self
            .embedded
            .as_ref()
            .map_or(false, |e| e.deserializes_records(ctx.registry, owner, def.name()));
        let invalid = |reason: &str| -> QuarryError {
            NormalizeError::InvalidResource {
                resource_type: owner.clone(),
                reason: format!("{}: {}", def.name(), reason),
            }
            .into()
        };

        match (def.cardinality, value) {
            (Cardinality::One, Value::Null) => Ok(RelationshipData::One(None)),
            (Cardinality::Many, Value::Null) => Ok(RelationshipData::Many(Vec::new())),
            (Cardinality::Many, Value::Array(items)) => {
                let mut members = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(member) = self.normalize_member(ctx, def, item, hint.clone(), embedded, included)? {
                        if !members.contains(&member) {
                            members.push(member);
                        }
                    }
                }
                Ok(RelationshipData::Many(members))
            }
            (Cardinality::Many, _) => Err(invalid("expected an array")),
            (Cardinality::One, Value::Array(_)) => Err(invalid("expected a single value")),
            (Cardinality::One, item) => Ok(RelationshipData::One(
                self.normalize_member(ctx, def, item, hint, embedded, included)?,
            )),
        }
    }

    fn normalize_member(
        &self,
        ctx: &NormalizeContext<'_>,
        def: &RelationshipDefinition,
        item: Value,
        hint: Option<ResourceType>,
        embedded: bool,
        included: &mut IncludedSet,
    ) -> QuarryResult<Option<ResourceReference>> {
        match item {
            Value::Object(_) if embedded => {
                let object = self.normalize_hash(ctx, &def.related_type, item, included)?;
                let reference = object.reference();
                included.push(object);
                Ok(Some(reference))
            }
            Value::Object(body) => {
                let Some(id) = body.get("id").and_then(coerce_id) else {
                    return Err(NormalizeError::InvalidResource {
                        resource_type: def.owner_type.clone(),
                        reason: format!("{}: reference without id", def.name()),
                    }
                    .into());
                };
                let member_type = match body.get("type").and_then(Value::as_str) {
                    Some(name) => known_type(ctx, name)?,
                    None => Some(hint.unwrap_or_else(|| def.related_type.clone())),
                };
                Ok(member_type.map(|t| ResourceReference::new(t, id)))
            }
            scalar => match coerce_id(&scalar) {
                Some(id) => Ok(Some(ResourceReference::new(
                    hint.unwrap_or_else(|| def.related_type.clone()),
                    id,
                ))),
                None => Err(NormalizeError::InvalidResource {
                    resource_type: def.owner_type.clone(),
                    reason: format!("{}: {} is not an id", def.name(), scalar),
                }
                .into()),
            },
        }
    }

    // ========================================================================
    // SERIALIZE
    // ========================================================================

    fn serialize_linkage(
        &self,
        registry: &SchemaRegistry,
        snapshot: &Snapshot,
        def: &RelationshipDefinition,
        key: &str,
        related: &RelationshipSnapshot,
        hash: &mut Map<String, Value>,
    ) -> QuarryResult<()> {
        let mode = self
            .embedded
            .as_ref()
            .and_then(|e| e.option(registry, &snapshot.resource_type, def.name()))
            .map(|o| o.serialize);

        match (mode, related) {
            (Some(EmbedMode::Omit), _) => {}
            (Some(EmbedMode::Records), _) => {
                hash.insert(key.to_string(), serialize_records(registry, def, related)?);
            }
            (_, RelationshipSnapshot::One(member)) => {
                let reference = member.as_ref().map(|m| &m.reference);
                hash.insert(key.to_string(), reference.map_or(Value::Null, reference_id));
                if def.polymorphic {
                    let type_key = reference.map_or(Value::Null, |r| {
                        Value::String(Self::payload_key(&r.resource_type))
                    });
                    hash.insert(format!("{key}Type"), type_key);
                }
            }
            (mode, RelationshipSnapshot::Many(members)) => {
                if mode == Some(EmbedMode::Ids) || should_serialize_many(def) {
                    let ids = members.iter().map(|m| reference_id(&m.reference)).collect();
                    hash.insert(key.to_string(), Value::Array(ids));
                }
            }
        }
        Ok(())
    }
}

impl Serializer for RestSerializer {
    fn normalize_response(
        &self,
        ctx: &NormalizeContext<'_>,
        primary_type: &ResourceType,
        payload: Value,
        id: Option<&str>,
        request: RequestType,
    ) -> QuarryResult<ResourceDocument> {
        let Value::Object(root) = payload else {
            return Err(NormalizeError::InvalidDocument {
                reason: "REST payload must be a JSON object".to_string(),
            }
            .into());
        };

        let single = request.is_single();
        let mut included = IncludedSet::new();
        let mut primary: Option<ResourceObject> = None;
        let mut collection = Vec::new();
        let mut meta = None;

        for (key, value) in root {
            if key == "meta" {
                meta = Some(value);
                continue;
            }
            let (sideloaded, type_key) = match key.strip_prefix('_') {
                Some(rest) => (true, rest),
                None => (false, key.as_str()),
            };
            let Some(resource_type) = known_type(ctx, type_key)? else {
                continue;
            };
            let is_primary = !sideloaded && resource_type == *primary_type;

            let hashes = match value {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                object if is_primary => {
                    let object = self.normalize_hash(ctx, &resource_type, object, &mut included)?;
                    if single {
                        primary = Some(object);
                    } else {
                        collection.push(object);
                    }
                    continue;
                }
                object => vec![object],
            };

            for hash in hashes {
                let object = self.normalize_hash(ctx, &resource_type, hash, &mut included)?;
                if !is_primary {
                    included.push(object);
                } else if !single {
                    collection.push(object);
                } else {
                    // Several primary-typed hashes: the requested id wins, or
                    // the first one when creating.
                    let wanted = match id {
                        Some(id) => object.id.as_deref() == Some(id),
                        None => primary.is_none(),
                    };
                    if wanted && primary.is_none() {
                        primary = Some(object);
                    } else {
                        included.push(object);
                    }
                }
            }
        }

        let data = if single {
            PrimaryData::One(primary.map(Box::new))
        } else {
            PrimaryData::Many(collection)
        };
        Ok(included.into_document(data, meta))
    }

    fn serialize(
        &self,
        registry: &SchemaRegistry,
        snapshot: &Snapshot,
        options: &SerializeOptions,
    ) -> QuarryResult<Value> {
        let schema = registry.schema(&snapshot.resource_type)?;
        let keys = KeyMap::for_type(schema, KeyStyle::AsIs);
        let mut hash = Map::new();

        if options.include_id {
            if let Some(id) = &snapshot.id {
                hash.insert(schema.primary_key.clone(), Value::String(id.clone()));
            }
        }
        for attr in &schema.attributes {
            if let Some(key) = keys.key_for_attribute(&attr.name) {
                let value = snapshot.attr(&attr.name).cloned().unwrap_or(Value::Null);
                hash.insert(key.to_string(), value);
            }
        }
        for def in registry.relationships_of(&snapshot.resource_type) {
            let (Some(key), Some(related)) = (
                keys.key_for_relationship(def.name()),
                snapshot.relationships.get(def.name()),
            ) else {
                continue;
            };
            self.serialize_linkage(registry, snapshot, def, key, related, &mut hash)?;
        }
        Ok(Value::Object(hash))
    }

    fn serialize_into_document(
        &self,
        registry: &SchemaRegistry,
        snapshot: &Snapshot,
        options: &SerializeOptions,
    ) -> QuarryResult<Value> {
        let mut root = Map::new();
        root.insert(
            Self::payload_key(&snapshot.resource_type),
            self.serialize(registry, snapshot, options)?,
        );
        Ok(Value::Object(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{Identifier, RelatedSnapshot};
    use quarry_test_utils::fixtures;

    fn normalize(payload: Value, primary: &str, id: Option<&str>, request: RequestType) -> ResourceDocument {
        let registry = fixtures::villain_registry();
        let ctx = NormalizeContext::new(&registry);
        RestSerializer::new()
            .normalize_response(&ctx, &ResourceType::new(primary), payload, id, request)
            .expect("normalize")
    }

    #[test]
    fn test_plural_root_keys_and_sideloads() {
        let doc = normalize(
            json!({
                "superVillain": {"id": 1, "firstName": "Tom", "homePlanet": "1", "evilMinions": [3]},
                "homePlanets": [{"id": 1, "name": "Umber"}],
                "_superVillains": [{"id": 2, "firstName": "Yehuda"}]
            }),
            "super-villain",
            Some("1"),
            RequestType::FindRecord,
        );

        let primary = &doc.data.resources()[0];
        assert_eq!(primary.id.as_deref(), Some("1"));
        assert_eq!(primary.attributes["firstName"], json!("Tom"));
        assert_eq!(
            primary.relationships["homePlanet"].data,
            Some(RelationshipData::One(Some(fixtures::reference("home-planet", "1"))))
        );
        assert_eq!(
            primary.relationships["evilMinions"].data,
            Some(RelationshipData::Many(vec![fixtures::reference("evil-minion", "3")]))
        );

        let included: Vec<_> = doc
            .included
            .iter()
            .map(|o| (o.resource_type.as_str().to_string(), o.id.clone().unwrap_or_default()))
            .collect();
        assert!(included.contains(&("home-planet".to_string(), "1".to_string())));
        assert!(included.contains(&("super-villain".to_string(), "2".to_string())));
    }

    #[test]
    fn test_primary_chosen_by_requested_id() {
        let doc = normalize(
            json!({"superVillains": [{"id": "1", "firstName": "A"}, {"id": "2", "firstName": "B"}]}),
            "super-villain",
            Some("2"),
            RequestType::FindRecord,
        );
        assert_eq!(doc.data.resources()[0].id.as_deref(), Some("2"));
        assert_eq!(doc.included.len(), 1);
        assert_eq!(doc.included[0].id.as_deref(), Some("1"));
    }

    #[test]
    fn test_collection_request() {
        let doc = normalize(
            json!({"superVillains": [{"id": "1"}, {"id": "2"}], "meta": {"total": 2}}),
            "super-villain",
            None,
            RequestType::FindAll,
        );
        assert_eq!(doc.data.resources().len(), 2);
        assert_eq!(doc.meta, Some(json!({"total": 2})));
    }

    #[test]
    fn test_missing_primary_yields_null_data() {
        let doc = normalize(
            json!({"homePlanets": [{"id": "1"}]}),
            "super-villain",
            Some("1"),
            RequestType::FindRecord,
        );
        assert!(doc.data.is_null());
        assert_eq!(doc.included.len(), 1);
    }

    #[test]
    fn test_custom_primary_key() {
        let registry = quarry_core::SchemaRegistry::build(vec![
            quarry_core::TypeSchema::new("tag").with_primary_key("_id").attr("name"),
        ])
        .expect("schema");
        let ctx = NormalizeContext::new(&registry);
        let doc = RestSerializer::new()
            .normalize_response(
                &ctx,
                &ResourceType::new("tag"),
                json!({"tag": {"_id": "abc", "name": "rust"}}),
                Some("abc"),
                RequestType::FindRecord,
            )
            .expect("normalize");
        let tag = &doc.data.resources()[0];
        assert_eq!(tag.id.as_deref(), Some("abc"));
        assert!(!tag.attributes.contains_key("_id"));
    }

    #[test]
    fn test_polymorphic_type_hint() {
        let registry = fixtures::app_registry();
        let ctx = NormalizeContext::new(&registry);
        let doc = RestSerializer::new()
            .normalize_response(
                &ctx,
                &ResourceType::new("user"),
                json!({"user": {"id": "1", "hats": [{"id": "2", "type": "bigHat"}, {"id": "3", "type": "small-hat"}]}}),
                Some("1"),
                RequestType::FindRecord,
            )
            .expect("normalize");
        assert_eq!(
            doc.data.resources()[0].relationships["hats"].data,
            Some(RelationshipData::Many(vec![
                fixtures::reference("big-hat", "2"),
                fixtures::reference("small-hat", "3"),
            ]))
        );
    }

    #[test]
    fn test_links_become_related_links() {
        let doc = normalize(
            json!({"homePlanet": {"id": "1", "links": {"villains": "/planets/1/villains"}}}),
            "home-planet",
            Some("1"),
            RequestType::FindRecord,
        );
        let villains = &doc.data.resources()[0].relationships["villains"];
        assert_eq!(villains.data, None);
        assert_eq!(villains.links, Some(json!({"related": "/planets/1/villains"})));
    }

    #[test]
    fn test_unknown_root_key_is_dropped_or_rejected() {
        let registry = fixtures::villain_registry();
        let payload = json!({"superVillain": {"id": "1"}, "spaceships": [{"id": "9"}]});

        let lenient = NormalizeContext::new(&registry);
        let doc = RestSerializer::new()
            .normalize_response(&lenient, &ResourceType::new("super-villain"), payload.clone(), Some("1"), RequestType::FindRecord)
            .expect("lenient");
        assert!(doc.included.is_empty());

        let strict = NormalizeContext::new(&registry).with_drop_unknown_types(false);
        let result = RestSerializer::new().normalize_response(
            &strict,
            &ResourceType::new("super-villain"),
            payload,
            Some("1"),
            RequestType::FindRecord,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_flat_hash() {
        let registry = fixtures::villain_registry();
        let planet = RelatedSnapshot {
            reference: fixtures::reference("home-planet", "1"),
            attributes: Map::new(),
            relationships: BTreeMap::new(),
        };
        let minion = RelatedSnapshot {
            reference: fixtures::reference("evil-minion", "4"),
            attributes: Map::new(),
            relationships: BTreeMap::new(),
        };
        let snapshot = Snapshot {
            identifier: Identifier::from_lid("@lid:v"),
            resource_type: ResourceType::new("super-villain"),
            id: Some("2".to_string()),
            attributes: json!({"firstName": "Tom", "lastName": "Dale"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
            changed_attributes: BTreeMap::new(),
            relationships: BTreeMap::from([
                ("homePlanet".to_string(), RelationshipSnapshot::One(Some(planet))),
                ("evilMinions".to_string(), RelationshipSnapshot::Many(vec![minion])),
            ]),
        };

        let serializer = RestSerializer::new();
        let body = serializer
            .serialize(&registry, &snapshot, &SerializeOptions::with_id())
            .expect("serialize");
        // One-to-many: the minions carry the linkage, the villain does not.
        assert_eq!(
            body,
            json!({"id": "2", "firstName": "Tom", "lastName": "Dale", "homePlanet": "1"})
        );

        let document = serializer
            .serialize_into_document(&registry, &snapshot, &SerializeOptions::default())
            .expect("serialize");
        assert_eq!(document["superVillain"]["firstName"], json!("Tom"));
        assert!(document["superVillain"].get("id").is_none());
    }
}
