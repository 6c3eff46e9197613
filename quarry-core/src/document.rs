//! Canonical resource document.
//!
//! `{data, included}` is the one interchange shape between the normalizers
//! and the cache. Relationship blocks are always present (possibly `{}`), and
//! an empty to-many relationship is `{"data": []}`, never `null`.

use crate::{NormalizeError, QuarryResult, ResourceType};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// `{id, type}` pointer to a resource; `lid` only for resources without an id yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceReference {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            resource_type,
            lid: None,
        }
    }
}

/// Linkage of one relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    Many(Vec<ResourceReference>),
    One(Option<ResourceReference>),
}

impl RelationshipData {
    pub fn references(&self) -> Vec<&ResourceReference> {
        match self {
            RelationshipData::Many(refs) => refs.iter().collect(),
            RelationshipData::One(r) => r.iter().collect(),
        }
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<RelationshipData>, D::Error>
where
    D: Deserializer<'de>,
{
    RelationshipData::deserialize(deserializer).map(Some)
}

/// One relationship block. `data: None` means the payload did not mention
/// linkage at all, which is different from `data: null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelationshipObject {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub data: Option<RelationshipData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl RelationshipObject {
    pub fn with_data(data: RelationshipData) -> Self {
        Self {
            data: Some(data),
            links: None,
            meta: None,
        }
    }
}

/// A normalized resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipObject>,
}

impl ResourceObject {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            lid: None,
            resource_type,
            attributes: Map::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn with_one(mut self, name: &str, related: Option<ResourceReference>) -> Self {
        self.relationships.insert(
            name.to_string(),
            RelationshipObject::with_data(RelationshipData::One(related)),
        );
        self
    }

    pub fn with_many(mut self, name: &str, related: Vec<ResourceReference>) -> Self {
        self.relationships.insert(
            name.to_string(),
            RelationshipObject::with_data(RelationshipData::Many(related)),
        );
        self
    }

    pub fn reference(&self) -> ResourceReference {
        ResourceReference {
            id: self.id.clone(),
            resource_type: self.resource_type.clone(),
            lid: self.lid.clone(),
        }
    }

    /// Merge a later occurrence of the same resource into this one.
    /// Later attribute values and relationship blocks win.
    pub fn merge(&mut self, other: ResourceObject) {
        self.attributes.extend(other.attributes);
        self.relationships.extend(other.relationships);
        if self.lid.is_none() {
            self.lid = other.lid;
        }
    }
}

/// Primary data: a resource, `null`, or a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<ResourceObject>),
    One(Option<Box<ResourceObject>>),
}

impl PrimaryData {
    pub fn resources(&self) -> Vec<&ResourceObject> {
        match self {
            PrimaryData::Many(objects) => objects.iter().collect(),
            PrimaryData::One(object) => object.iter().map(|o| o.as_ref()).collect(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PrimaryData::One(None))
    }
}

/// The canonical `{data, included}` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    pub data: PrimaryData,
    #[serde(default)]
    pub included: Vec<ResourceObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ResourceDocument {
    pub fn single(object: ResourceObject) -> Self {
        Self {
            data: PrimaryData::One(Some(Box::new(object))),
            included: Vec::new(),
            meta: None,
        }
    }

    /// `{data: null, included: []}`.
    pub fn empty() -> Self {
        Self {
            data: PrimaryData::One(None),
            included: Vec::new(),
            meta: None,
        }
    }

    pub fn collection(objects: Vec<ResourceObject>) -> Self {
        Self {
            data: PrimaryData::Many(objects),
            included: Vec::new(),
            meta: None,
        }
    }

    pub fn with_included(mut self, included: Vec<ResourceObject>) -> Self {
        self.included = included;
        self
    }

    /// Parse a JSON value already in canonical shape. A missing `data`
    /// member is an error, `data: null` is not.
    pub fn from_value(value: Value, resource_type: &ResourceType) -> QuarryResult<Self> {
        let has_data = value.as_object().map_or(false, |o| o.contains_key("data"));
        if !has_data {
            return Err(NormalizeError::MissingData {
                resource_type: resource_type.clone(),
            }
            .into());
        }
        serde_json::from_value(value).map_err(|e| {
            NormalizeError::InvalidDocument {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Primary resources followed by included ones.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceObject> {
        self.data.resources().into_iter().chain(self.included.iter())
    }
}

// =============================================================================
// TESTS
// =============================================================================
