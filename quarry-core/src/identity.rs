//! Identifiers and the identifier cache.
//!
//! An [`Identifier`] is the only handle other components use to reference a
//! resource. It wraps the resource's `lid`, which never changes for the
//! lifetime of the identifier, so it stays valid across id assignment and
//! polymorphic type upgrades.

use crate::{IdentityError, ResourceReference, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Default prefix for locally generated ids.
pub const DEFAULT_LID_PREFIX: &str = "@lid:";

/// Generate a new lid: `<prefix><uuid-v7>` (timestamp-sortable).
pub fn new_lid(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::now_v7())
}

/// Opaque, process-unique token for one logical resource.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier {
    lid: Arc<str>,
}

impl Identifier {
    pub fn from_lid(lid: impl AsRef<str>) -> Self {
        Self {
            lid: Arc::from(lid.as_ref()),
        }
    }

    pub fn lid(&self) -> &str {
        &self.lid
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.lid)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lid)
    }
}

/// Current `{type, id, lid}` triple of an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierRecord {
    pub identifier: Identifier,
    pub resource_type: ResourceType,
    pub id: Option<String>,
    /// Abstract types this identifier is also reachable through.
    pub aliases: Vec<ResourceType>,
}

#[derive(Debug, Clone)]
struct Slot {
    resource_type: ResourceType,
    id: Option<String>,
    aliases: Vec<ResourceType>,
}

impl Slot {
    fn types(&self) -> impl Iterator<Item = &ResourceType> {
        std::iter::once(&self.resource_type).chain(self.aliases.iter())
    }
}

/// Maps `(type, id)` and `lid` to stable identifiers.
#[derive(Debug, Clone)]
pub struct IdentifierCache {
    lid_prefix: String,
    slots: HashMap<Identifier, Slot>,
    by_key: HashMap<(ResourceType, String), Identifier>,
}

impl Default for IdentifierCache {
    fn default() -> Self {
        Self::new(DEFAULT_LID_PREFIX)
    }
}

impl IdentifierCache {
    pub fn new(lid_prefix: impl Into<String>) -> Self {
        Self {
            lid_prefix: lid_prefix.into(),
            slots: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    fn allocate(&mut self, resource_type: &ResourceType, id: Option<&str>, lid: Option<&str>) -> Identifier {
        let identifier = match lid {
            Some(lid) => Identifier::from_lid(lid),
            None => Identifier::from_lid(new_lid(&self.lid_prefix)),
        };
        if let Some(id) = id {
            self.by_key
                .insert((resource_type.clone(), id.to_string()), identifier.clone());
        }
        self.slots.insert(
            identifier.clone(),
            Slot {
                resource_type: resource_type.clone(),
                id: id.map(str::to_string),
                aliases: Vec::new(),
            },
        );
        identifier
    }

    /// Existing identifier for `(type, id)`, or a freshly allocated one.
    pub fn get_or_create(&mut self, resource_type: &ResourceType, id: &str) -> Identifier {
        match self.peek(resource_type, id) {
            Some(identifier) => identifier,
            None => self.allocate(resource_type, Some(id), None),
        }
    }

    /// Identifier with no id, for client-created records.
    pub fn get_or_create_for_new_resource(&mut self, resource_type: &ResourceType) -> Identifier {
        self.allocate(resource_type, None, None)
    }

    /// Resolve a reference that may carry a lid, an id, or both.
    ///
    /// A known lid wins; an id carried alongside it is assigned to that
    /// identifier if it does not have one yet.
    pub fn get_or_create_with_lid(
        &mut self,
        resource_type: &ResourceType,
        id: Option<&str>,
        lid: Option<&str>,
    ) -> Result<Identifier, IdentityError> {
        if let Some(identifier) = lid.and_then(|lid| self.peek_lid(lid)) {
            if let Some(id) = id {
                self.update_identifier(&identifier, id)?;
            }
            return Ok(identifier);
        }
        if let Some(identifier) = id.and_then(|id| self.peek(resource_type, id)) {
            return Ok(identifier);
        }
        Ok(self.allocate(resource_type, id, lid))
    }

    /// Non-allocating lookup by `(type, id)`. Abstract aliases resolve too.
    pub fn peek(&self, resource_type: &ResourceType, id: &str) -> Option<Identifier> {
        self.by_key
            .get(&(resource_type.clone(), id.to_string()))
            .cloned()
    }

    pub fn peek_lid(&self, lid: &str) -> Option<Identifier> {
        self.slots
            .get_key_value(&Identifier::from_lid(lid))
            .map(|(identifier, _)| identifier.clone())
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.slots.contains_key(identifier)
    }

    /// Assign a server id to an identifier created without one.
    pub fn update_identifier(
        &mut self,
        identifier: &Identifier,
        new_id: &str,
    ) -> Result<(), IdentityError> {
        let slot = self
            .slots
            .get(identifier)
            .ok_or_else(|| IdentityError::UnknownIdentifier {
                identifier: identifier.clone(),
            })?;

        match slot.id.as_deref() {
            Some(current) if current == new_id => return Ok(()),
            Some(current) => {
                return Err(IdentityError::IdAlreadyAssigned {
                    identifier: identifier.clone(),
                    current: current.to_string(),
                    requested: new_id.to_string(),
                })
            }
            None => {}
        }

        for resource_type in slot.types() {
            if let Some(existing) = self.by_key.get(&(resource_type.clone(), new_id.to_string())) {
                if existing != identifier {
                    return Err(IdentityError::IdentifierCollision {
                        resource_type: resource_type.clone(),
                        id: new_id.to_string(),
                        existing: existing.clone(),
                        incoming: identifier.clone(),
                    });
                }
            }
        }

        let keys: Vec<_> = slot
            .types()
            .map(|t| (t.clone(), new_id.to_string()))
            .collect();
        for key in keys {
            self.by_key.insert(key, identifier.clone());
        }
        if let Some(slot) = self.slots.get_mut(identifier) {
            slot.id = Some(new_id.to_string());
        }
        Ok(())
    }

    /// Record that `abstract_type:id` and `concrete_type:id` are one resource.
    ///
    /// If only the abstract key is known, that identifier is upgraded to the
    /// concrete type and keeps the abstract type as an alias.
    pub fn resolve_alias(
        &mut self,
        concrete_type: &ResourceType,
        id: &str,
        abstract_type: &ResourceType,
    ) -> Result<Identifier, IdentityError> {
        if concrete_type == abstract_type {
            return Ok(self.get_or_create(concrete_type, id));
        }

        let concrete = self.peek(concrete_type, id);
        let abstract_ = self.peek(abstract_type, id);

        let identifier = match (concrete, abstract_) {
            (Some(c), Some(a)) if c != a => {
                return Err(IdentityError::IdentifierCollision {
                    resource_type: abstract_type.clone(),
                    id: id.to_string(),
                    existing: a,
                    incoming: c,
                });
            }
            (Some(c), _) => {
                if let Some(slot) = self.slots.get_mut(&c) {
                    if !slot.types().any(|t| t == abstract_type) {
                        slot.aliases.push(abstract_type.clone());
                    }
                }
                c
            }
            (None, Some(a)) => {
                if let Some(slot) = self.slots.get_mut(&a) {
                    let previous = std::mem::replace(&mut slot.resource_type, concrete_type.clone());
                    slot.aliases.retain(|t| t != concrete_type);
                    if !slot.aliases.contains(&previous) {
                        slot.aliases.push(previous);
                    }
                }
                a
            }
            (None, None) => {
                let identifier = self.allocate(concrete_type, Some(id), None);
                if let Some(slot) = self.slots.get_mut(&identifier) {
                    slot.aliases.push(abstract_type.clone());
                }
                identifier
            }
        };

        self.by_key
            .insert((concrete_type.clone(), id.to_string()), identifier.clone());
        self.by_key
            .insert((abstract_type.clone(), id.to_string()), identifier.clone());
        Ok(identifier)
    }

    /// Remove an identifier and every key (aliases included) pointing at it.
    pub fn release(&mut self, identifier: &Identifier) -> Option<IdentifierRecord> {
        let slot = self.slots.remove(identifier)?;
        if let Some(id) = &slot.id {
            for resource_type in slot.types() {
                let key = (resource_type.clone(), id.clone());
                if self.by_key.get(&key) == Some(identifier) {
                    self.by_key.remove(&key);
                }
            }
        }
        Some(IdentifierRecord {
            identifier: identifier.clone(),
            resource_type: slot.resource_type,
            id: slot.id,
            aliases: slot.aliases,
        })
    }

    pub fn record(&self, identifier: &Identifier) -> Option<IdentifierRecord> {
        self.slots.get(identifier).map(|slot| IdentifierRecord {
            identifier: identifier.clone(),
            resource_type: slot.resource_type.clone(),
            id: slot.id.clone(),
            aliases: slot.aliases.clone(),
        })
    }

    pub fn resource_type(&self, identifier: &Identifier) -> Option<&ResourceType> {
        self.slots.get(identifier).map(|slot| &slot.resource_type)
    }

    pub fn id(&self, identifier: &Identifier) -> Option<&str> {
        self.slots.get(identifier).and_then(|slot| slot.id.as_deref())
    }

    /// Wire reference for an identifier: `{id, type}` plus the lid when no id exists yet.
    pub fn reference(&self, identifier: &Identifier) -> Option<ResourceReference> {
        self.slots.get(identifier).map(|slot| ResourceReference {
            id: slot.id.clone(),
            resource_type: slot.resource_type.clone(),
            lid: match slot.id {
                Some(_) => None,
                None => Some(identifier.lid().to_string()),
            },
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
