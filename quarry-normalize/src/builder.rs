//! Shared pieces of every normalizer: id coercion, type names, and the
//! deduplicating `included` collector.

use quarry_core::{
    inflector, Cardinality, NormalizeContext, NormalizeError, PrimaryData, QuarryResult,
    RelationshipDefinition, ResourceDocument, ResourceObject, ResourceReference, ResourceType,
};
use serde_json::Value;
use std::collections::HashMap;

/// Ids arrive as strings or numbers; everything else is not an id.
pub fn coerce_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `superVillains`, `super_villains` and `super-villain` all name `super-villain`.
pub fn type_from_key(key: &str) -> ResourceType {
    ResourceType::new(inflector::singularize(key))
}

/// Resolve a wire type name against the registry.
///
/// `Ok(None)` means the type is unknown and the caller should skip the
/// resource; that only happens when the context drops unknown types.
pub fn known_type(ctx: &NormalizeContext<'_>, key: &str) -> QuarryResult<Option<ResourceType>> {
    let resource_type = type_from_key(key);
    if ctx.registry.contains(&resource_type) {
        return Ok(Some(resource_type));
    }
    if ctx.drop_unknown_types {
        tracing::warn!(key, "Dropping resource of unregistered type");
        Ok(None)
    } else {
        Err(NormalizeError::UnknownType {
            key: key.to_string(),
        }
        .into())
    }
}

/// To-many relationships are written only when nothing on the other side
/// already carries the linkage (many-to-none and many-to-many).
pub fn should_serialize_many(def: &RelationshipDefinition) -> bool {
    def.inverse
        .as_ref()
        .map_or(true, |inverse| inverse.cardinality == Cardinality::Many)
}

/// Flat id of a reference, `null` for records the server has not seen yet.
pub fn reference_id(reference: &ResourceReference) -> Value {
    reference
        .id
        .as_ref()
        .map_or(Value::Null, |id| Value::String(id.clone()))
}

/// Collects sideloaded and embedded resources, merging repeats of the same
/// `(type, id)` into the first occurrence.
#[derive(Debug, Default)]
pub struct IncludedSet {
    objects: Vec<ResourceObject>,
    index: HashMap<(ResourceType, String), usize>,
}

impl IncludedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, object: ResourceObject) {
        let Some(id) = object.id.clone() else {
            self.objects.push(object);
            return;
        };
        let key = (object.resource_type.clone(), id);
        match self.index.get(&key) {
            Some(&position) => self.objects[position].merge(object),
            None => {
                self.index.insert(key, self.objects.len());
                self.objects.push(object);
            }
        }
    }

    pub fn extend(&mut self, objects: impl IntoIterator<Item = ResourceObject>) {
        for object in objects {
            self.push(object);
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Build the document, folding included copies of primary resources into them.
    pub fn into_document(self, data: PrimaryData, meta: Option<Value>) -> ResourceDocument {
        let mut data = data;
        let mut included = Vec::with_capacity(self.objects.len());
        for object in self.objects {
            match find_primary(&mut data, &object) {
                Some(primary) => primary.merge(object),
                None => included.push(object),
            }
        }
        ResourceDocument {
            data,
            included,
            meta,
        }
    }
}

fn find_primary<'a>(data: &'a mut PrimaryData, object: &ResourceObject) -> Option<&'a mut ResourceObject> {
    object.id.as_ref()?;
    let same = |candidate: &ResourceObject| {
        candidate.resource_type == object.resource_type && candidate.id == object.id
    };
    match data {
        PrimaryData::One(Some(primary)) if same(&**primary) => Some(primary.as_mut()),
        PrimaryData::Many(primaries) => primaries.iter_mut().find(|p| same(&**p)),
        _ => None,
    }
}
