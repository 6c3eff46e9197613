//! Resource type schemas.
//!
//! Schemas are plain data registered once, up front. Polymorphism is expressed
//! through `implements` edges between types rather than through any notion of
//! subclassing: a concrete type inherits the attributes and relationships of
//! every type it implements, and the registry resolves each relationship and
//! its inverse a single time, at build time, into a [`RelationshipDefinition`].

use crate::inflector::dasherize;
use crate::{QuarryResult, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// RESOURCE TYPE
// ============================================================================

/// Normalized (dasherized, singular) name of a resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(Arc<str>);

impl ResourceType {
    /// Create a resource type, dasherizing the given name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(dasherize(name.as_ref())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// ============================================================================
// FIELD SCHEMAS
// ============================================================================

/// Whether a relationship holds one related resource or an ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::One => "belongsTo",
            Cardinality::Many => "hasMany",
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attribute and its optional payload key override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub name: String,
    pub key: Option<String>,
}

/// A declared relationship field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSchema {
    pub name: String,
    pub cardinality: Cardinality,
    pub related_type: ResourceType,
    pub inverse: Option<String>,
    pub is_async: bool,
    pub polymorphic: bool,
    /// Payload key override used by serializers.
    pub key: Option<String>,
}

impl RelationshipSchema {
    fn new(name: &str, cardinality: Cardinality, related_type: &str) -> Self {
        Self {
            name: name.to_string(),
            cardinality,
            related_type: ResourceType::new(related_type),
            inverse: None,
            is_async: false,
            polymorphic: false,
            key: None,
        }
    }

    /// A to-one relationship.
    pub fn belongs_to(name: &str, related_type: &str) -> Self {
        Self::new(name, Cardinality::One, related_type)
    }

    /// A to-many relationship.
    pub fn has_many(name: &str, related_type: &str) -> Self {
        Self::new(name, Cardinality::Many, related_type)
    }

    pub fn with_inverse(mut self, inverse: &str) -> Self {
        self.inverse = Some(inverse.to_string());
        self
    }

    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn polymorphic(mut self) -> Self {
        self.polymorphic = true;
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }
}

/// Schema of one resource type: its fields, primary key and the abstract
/// types it can stand in for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSchema {
    pub resource_type: ResourceType,
    pub primary_key: String,
    pub attributes: Vec<AttributeSchema>,
    pub relationships: Vec<RelationshipSchema>,
    pub implements: Vec<ResourceType>,
}

impl TypeSchema {
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource_type: ResourceType::new(resource_type),
            primary_key: "id".to_string(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            implements: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, key: &str) -> Self {
        self.primary_key = key.to_string();
        self
    }

    pub fn attr(mut self, name: &str) -> Self {
        self.attributes.push(AttributeSchema {
            name: name.to_string(),
            key: None,
        });
        self
    }

    /// An attribute read from and written to a payload key other than its name.
    pub fn attr_with_key(mut self, name: &str, key: &str) -> Self {
        self.attributes.push(AttributeSchema {
            name: name.to_string(),
            key: Some(key.to_string()),
        });
        self
    }

    pub fn relationship(mut self, relationship: RelationshipSchema) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn implements(mut self, base: &str) -> Self {
        self.implements.push(ResourceType::new(base));
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship_schema(&self, name: &str) -> Option<&RelationshipSchema> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

// ============================================================================
// RESOLVED DEFINITIONS
// ============================================================================

/// A relationship named by the type that declares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipKey {
    pub resource_type: ResourceType,
    pub name: String,
}

impl RelationshipKey {
    pub fn new(resource_type: ResourceType, name: &str) -> Self {
        Self {
            resource_type,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Which half of a [`PairKey`] a relationship occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Lhs,
    Rhs,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Lhs => Side::Rhs,
            Side::Rhs => Side::Lhs,
        }
    }
}

/// Unordered pair over a relationship and its inverse.
///
/// Both directions of one relationship definition hash to the same key, so a
/// write from either side lands in the same payload store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    lhs: RelationshipKey,
    rhs: Option<RelationshipKey>,
}

impl PairKey {
    pub fn new(a: RelationshipKey, b: Option<RelationshipKey>) -> Self {
        match b {
            Some(b) if b < a => Self {
                lhs: b,
                rhs: Some(a),
            },
            b => Self { lhs: a, rhs: b },
        }
    }

    pub fn lhs(&self) -> &RelationshipKey {
        &self.lhs
    }

    pub fn rhs(&self) -> Option<&RelationshipKey> {
        self.rhs.as_ref()
    }

    /// True when a relationship is its own inverse (`person.friends <-> person.friends`).
    pub fn is_reflexive(&self) -> bool {
        self.rhs.as_ref() == Some(&self.lhs)
    }

    pub fn side_of(&self, key: &RelationshipKey) -> Option<Side> {
        if &self.lhs == key {
            Some(Side::Lhs)
        } else if self.rhs.as_ref() == Some(key) {
            Some(Side::Rhs)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rhs {
            Some(rhs) => write!(f, "{}:{}", self.lhs, rhs),
            None => write!(f, "{}", self.lhs),
        }
    }
}

/// The far side of a relationship definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InverseDefinition {
    pub key: RelationshipKey,
    pub cardinality: Cardinality,
    pub is_async: bool,
}

/// A relationship as seen from one concrete owner type, with its inverse resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDefinition {
    pub owner_type: ResourceType,
    pub key: RelationshipKey,
    pub cardinality: Cardinality,
    pub related_type: ResourceType,
    pub is_async: bool,
    pub polymorphic: bool,
    pub payload_key: Option<String>,
    pub inverse: Option<InverseDefinition>,
}

impl RelationshipDefinition {
    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn is_many(&self) -> bool {
        self.cardinality == Cardinality::Many
    }

    pub fn pair_key(&self) -> PairKey {
        PairKey::new(
            self.key.clone(),
            self.inverse.as_ref().map(|inv| inv.key.clone()),
        )
    }

    /// Side of [`Self::pair_key`] this definition writes to.
    pub fn side(&self) -> Side {
        self.pair_key().side_of(&self.key).unwrap_or(Side::Lhs)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Static registry of every resource type the cache knows about.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: HashMap<ResourceType, TypeSchema>,
    order: Vec<ResourceType>,
    ancestors: HashMap<ResourceType, Vec<ResourceType>>,
    definitions: HashMap<(ResourceType, String), RelationshipDefinition>,
}

impl SchemaRegistry {
    /// Register all schemas and resolve every relationship definition.
    pub fn build(schemas: impl IntoIterator<Item = TypeSchema>) -> QuarryResult<Self> {
        let mut raw: HashMap<ResourceType, TypeSchema> = HashMap::new();
        let mut order = Vec::new();
        for schema in schemas {
            if raw.contains_key(&schema.resource_type) {
                return Err(SchemaError::DuplicateType {
                    resource_type: schema.resource_type,
                }
                .into());
            }
            order.push(schema.resource_type.clone());
            raw.insert(schema.resource_type.clone(), schema);
        }

        let mut ancestors = HashMap::new();
        for resource_type in &order {
            let mut found = Vec::new();
            collect_ancestors(&raw, resource_type, resource_type, &mut found)?;
            ancestors.insert(resource_type.clone(), found);
        }

        // Flatten inherited fields; remember which type declared each relationship.
        let mut types = HashMap::new();
        let mut declaring: HashMap<(ResourceType, String), ResourceType> = HashMap::new();
        for resource_type in &order {
            let mut flat = raw[resource_type].clone();
            for rel in &flat.relationships {
                declaring.insert(
                    (resource_type.clone(), rel.name.clone()),
                    resource_type.clone(),
                );
            }
            for base in &ancestors[resource_type] {
                let base_schema = &raw[base];
                for attr in &base_schema.attributes {
                    if flat.attribute(&attr.name).is_none() {
                        flat.attributes.push(attr.clone());
                    }
                }
                for rel in &base_schema.relationships {
                    if flat.relationship_schema(&rel.name).is_none() {
                        flat.relationships.push(rel.clone());
                        declaring.insert((resource_type.clone(), rel.name.clone()), base.clone());
                    }
                }
            }
            types.insert(resource_type.clone(), flat);
        }

        let mut registry = Self {
            types,
            order,
            ancestors,
            definitions: HashMap::new(),
        };

        let mut definitions = HashMap::new();
        for resource_type in &registry.order {
            let schema = &registry.types[resource_type];
            for rel in &schema.relationships {
                let declared_by = declaring[&(resource_type.clone(), rel.name.clone())].clone();
                let inverse = registry.resolve_inverse(resource_type, &declared_by, rel, &declaring)?;
                definitions.insert(
                    (resource_type.clone(), rel.name.clone()),
                    RelationshipDefinition {
                        owner_type: resource_type.clone(),
                        key: RelationshipKey::new(declared_by, &rel.name),
                        cardinality: rel.cardinality,
                        related_type: rel.related_type.clone(),
                        is_async: rel.is_async,
                        polymorphic: rel.polymorphic,
                        payload_key: rel.key.clone(),
                        inverse,
                    },
                );
            }
        }
        registry.definitions = definitions;
        Ok(registry)
    }

    fn resolve_inverse(
        &self,
        owner: &ResourceType,
        declared_by: &ResourceType,
        rel: &RelationshipSchema,
        declaring: &HashMap<(ResourceType, String), ResourceType>,
    ) -> QuarryResult<Option<InverseDefinition>> {
        let related = self.schema(&rel.related_type)?;
        let points_back = |candidate: &RelationshipSchema| {
            candidate.related_type == *declared_by || self.is_a(owner, &candidate.related_type)
        };

        let inverse = match &rel.inverse {
            Some(name) => {
                let candidate = related.relationship_schema(name).ok_or_else(|| {
                    SchemaError::UnknownRelationship {
                        resource_type: related.resource_type.clone(),
                        name: name.clone(),
                    }
                })?;
                let agrees = candidate.inverse.as_deref().map_or(true, |n| n == rel.name);
                if !agrees || !points_back(candidate) {
                    return Err(SchemaError::InverseMismatch {
                        resource_type: owner.clone(),
                        name: rel.name.clone(),
                        inverse: name.clone(),
                    }
                    .into());
                }
                Some(candidate)
            }
            // The far side may declare the pairing on its own.
            None => related
                .relationships
                .iter()
                .find(|c| c.inverse.as_deref() == Some(rel.name.as_str()) && points_back(c)),
        };

        Ok(inverse.map(|inv| {
            let inv_declared_by = declaring
                .get(&(related.resource_type.clone(), inv.name.clone()))
                .cloned()
                .unwrap_or_else(|| related.resource_type.clone());
            InverseDefinition {
                key: RelationshipKey::new(inv_declared_by, &inv.name),
                cardinality: inv.cardinality,
                is_async: inv.is_async,
            }
        }))
    }

    /// Flattened schema for a type.
    pub fn schema(&self, resource_type: &ResourceType) -> QuarryResult<&TypeSchema> {
        self.types.get(resource_type).ok_or_else(|| {
            SchemaError::UnknownType {
                resource_type: resource_type.clone(),
            }
            .into()
        })
    }

    pub fn get(&self, resource_type: &ResourceType) -> Option<&TypeSchema> {
        self.types.get(resource_type)
    }

    pub fn contains(&self, resource_type: &ResourceType) -> bool {
        self.types.contains_key(resource_type)
    }

    /// Registered types, in registration order.
    pub fn types(&self) -> impl Iterator<Item = &ResourceType> {
        self.order.iter()
    }

    pub fn relationship(
        &self,
        resource_type: &ResourceType,
        name: &str,
    ) -> QuarryResult<&RelationshipDefinition> {
        self.definitions
            .get(&(resource_type.clone(), name.to_string()))
            .ok_or_else(|| {
                SchemaError::UnknownRelationship {
                    resource_type: resource_type.clone(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Resolved relationship definitions of a type, in schema order.
    pub fn relationships_of<'a>(
        &'a self,
        resource_type: &ResourceType,
    ) -> impl Iterator<Item = &'a RelationshipDefinition> + 'a {
        let resource_type = resource_type.clone();
        self.types
            .get(&resource_type)
            .into_iter()
            .flat_map(|schema| schema.relationships.iter())
            .filter_map(move |rel| {
                self.definitions
                    .get(&(resource_type.clone(), rel.name.clone()))
            })
    }

    /// Every type `resource_type` implements, directly or transitively.
    pub fn ancestors(&self, resource_type: &ResourceType) -> &[ResourceType] {
        self.ancestors
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// True when `concrete` is `base` or implements it.
    pub fn is_a(&self, concrete: &ResourceType, base: &ResourceType) -> bool {
        concrete == base || self.ancestors(concrete).contains(base)
    }
}

fn collect_ancestors(
    raw: &HashMap<ResourceType, TypeSchema>,
    origin: &ResourceType,
    current: &ResourceType,
    found: &mut Vec<ResourceType>,
) -> QuarryResult<()> {
    let schema = raw.get(current).ok_or_else(|| SchemaError::UnknownType {
        resource_type: current.clone(),
    })?;
    let mut seen: HashSet<ResourceType> = found.iter().cloned().collect();
    for base in &schema.implements {
        if base == origin {
            return Err(SchemaError::CyclicImplements {
                resource_type: origin.clone(),
                via: current.clone(),
            }
            .into());
        }
        if !raw.contains_key(base) {
            return Err(SchemaError::UnknownType {
                resource_type: base.clone(),
            }
            .into());
        }
        if seen.insert(base.clone()) {
            found.push(base.clone());
            collect_ancestors(raw, origin, base, found)?;
            seen.extend(found.iter().cloned());
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
