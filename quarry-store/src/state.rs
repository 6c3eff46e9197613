//! Cache state guarded by the store lock.
//!
//! Everything here is synchronous. The async request paths take the lock,
//! read or apply what they need, and release it before awaiting an adapter.

use crate::errors::RecordErrors;
use crate::notification::{Notification, Notifier};
use quarry_core::{
    AttributeChange, Cardinality, Identifier, IdentifierCache, LifecycleError, NormalizeError, QuarryResult,
    RecordEvent, RecordState, RelatedSnapshot, RelationshipData, RelationshipSnapshot,
    ResourceDocument, ResourceObject, ResourceReference, ResourceType, SchemaError,
    SchemaRegistry, Snapshot, StoreConfig,
};
use quarry_graph::{Graph, Membership};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// ============================================================================
// RECORD DATA
// ============================================================================

/// Edits carried by one save request.
#[derive(Debug, Clone)]
pub(crate) struct InflightSet {
    pub save: u64,
    pub attributes: Map<String, Value>,
}

/// One materialized record.
///
/// Attribute reads resolve `local`, then the inflight sets from newest to
/// oldest, then `remote`.
#[derive(Debug, Clone)]
pub(crate) struct RecordData {
    /// Distinguishes this materialization from earlier ones of the same identifier.
    pub instance: u64,
    pub state: RecordState,
    pub resource_type: ResourceType,
    pub remote: Map<String, Value>,
    /// Oldest save first.
    pub inflight: Vec<InflightSet>,
    pub local: Map<String, Value>,
    next_save: u64,
    pub errors: RecordErrors,
    /// The last save failed with a non-validation error.
    pub errored: bool,
}

impl RecordData {
    fn new(instance: u64, resource_type: ResourceType) -> Self {
        Self {
            instance,
            state: RecordState::Empty,
            resource_type,
            remote: Map::new(),
            inflight: Vec::new(),
            local: Map::new(),
            next_save: 0,
            errors: RecordErrors::new(),
            errored: false,
        }
    }

    fn inflight_value(&self, name: &str) -> Option<&Value> {
        self.inflight
            .iter()
            .rev()
            .find_map(|set| set.attributes.get(name))
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.local
            .get(name)
            .or_else(|| self.inflight_value(name))
            .or_else(|| self.remote.get(name))
    }

    /// Value the local edit of `name` is compared against.
    pub fn original(&self, name: &str) -> Option<&Value> {
        self.inflight_value(name).or_else(|| self.remote.get(name))
    }

    pub fn attributes(&self) -> Map<String, Value> {
        let mut merged = self.remote.clone();
        for set in &self.inflight {
            merged.extend(set.attributes.clone());
        }
        merged.extend(self.local.clone());
        merged
    }

    pub fn changed_attributes(&self) -> BTreeMap<String, AttributeChange> {
        self.inflight
            .iter()
            .flat_map(|set| set.attributes.keys())
            .chain(self.local.keys())
            .map(|name| {
                let change = AttributeChange {
                    old: self.remote.get(name).cloned().unwrap_or(Value::Null),
                    new: self.attribute(name).cloned().unwrap_or(Value::Null),
                };
                (name.clone(), change)
            })
            .collect()
    }

    /// No attribute differs from the last committed server state.
    pub fn attributes_clean(&self) -> bool {
        self.local.is_empty() && self.inflight.iter().all(|set| set.attributes.is_empty())
    }

    pub fn pending_saves(&self) -> usize {
        self.inflight.len()
    }

    /// Move uncommitted edits into a new inflight set, returning its save number.
    pub fn start_inflight(&mut self) -> u64 {
        let save = self.next_save;
        self.next_save += 1;
        self.inflight.push(InflightSet {
            save,
            attributes: std::mem::take(&mut self.local),
        });
        save
    }

    fn take_inflight(&mut self, save: u64) -> Option<(usize, InflightSet)> {
        let position = self.inflight.iter().position(|set| set.save == save)?;
        Some((position, self.inflight.remove(position)))
    }

    /// The server accepted the edits of `save`.
    pub fn commit_inflight(&mut self, save: u64) {
        if let Some((_, set)) = self.take_inflight(save) {
            self.remote.extend(set.attributes);
        }
    }

    /// The server rejected `save`; its edits become local again unless a
    /// later save or a local edit has replaced them.
    pub fn reject_inflight(&mut self, save: u64) {
        let Some((position, set)) = self.take_inflight(save) else {
            return;
        };
        for (name, value) in set.attributes {
            let replaced = self.local.contains_key(&name)
                || self.inflight[position..]
                    .iter()
                    .any(|later| later.attributes.contains_key(&name));
            if !replaced {
                self.local.insert(name, value);
            }
        }
    }
}

// ============================================================================
// STORE STATE
// ============================================================================

/// A pushed object with every identifier it mentions resolved.
struct ResolvedResource {
    identifier: Identifier,
    relationships: Vec<(String, Membership)>,
}

fn cardinality_of(data: &RelationshipData) -> Cardinality {
    match data {
        RelationshipData::One(_) => Cardinality::One,
        RelationshipData::Many(_) => Cardinality::Many,
    }
}

fn check_reference(reference: &ResourceReference) -> QuarryResult<()> {
    if reference.id.is_none() && reference.lid.is_none() {
        return Err(NormalizeError::InvalidResource {
            resource_type: reference.resource_type.clone(),
            reason: "reference has neither id nor lid".to_string(),
        }
        .into());
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct StoreState {
    pub registry: Arc<SchemaRegistry>,
    pub identifiers: IdentifierCache,
    pub graph: Graph,
    pub records: HashMap<Identifier, RecordData>,
    /// Live records in materialization order.
    live: BTreeMap<u64, Identifier>,
    /// Unloaded instances awaiting the next settle point.
    destroying: BTreeMap<u64, Identifier>,
    /// Identifiers to release once nothing retains them.
    pending_release: Vec<Identifier>,
    next_instance: u64,
    notifier: Notifier,
}

impl StoreState {
    pub fn new(registry: Arc<SchemaRegistry>, config: &StoreConfig, notifier: Notifier) -> Self {
        Self {
            identifiers: IdentifierCache::new(config.lid_prefix.clone()),
            graph: Graph::new(registry.clone()).with_strict(config.strict_relationships),
            registry,
            records: HashMap::new(),
            live: BTreeMap::new(),
            destroying: BTreeMap::new(),
            pending_release: Vec::new(),
            next_instance: 1,
            notifier,
        }
    }

    pub fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }

    // ------------------------------------------------------------------------
    // Record access
    // ------------------------------------------------------------------------

    pub fn record(&self, identifier: &Identifier, instance: u64) -> QuarryResult<&RecordData> {
        match self.records.get(identifier) {
            Some(data) if data.instance == instance => Ok(data),
            _ => Err(LifecycleError::RecordDestroyed {
                identifier: identifier.clone(),
            }
            .into()),
        }
    }

    pub fn record_mut(&mut self, identifier: &Identifier, instance: u64) -> QuarryResult<&mut RecordData> {
        match self.records.get_mut(identifier) {
            Some(data) if data.instance == instance => Ok(data),
            _ => Err(LifecycleError::RecordDestroyed {
                identifier: identifier.clone(),
            }
            .into()),
        }
    }

    /// Lifecycle state of one materialization, including after it is gone.
    pub fn instance_state(&self, identifier: &Identifier, instance: u64) -> RecordState {
        match self.records.get(identifier) {
            Some(data) if data.instance == instance => data.state,
            _ if self.destroying.contains_key(&instance) => RecordState::Destroying,
            _ => RecordState::Destroyed,
        }
    }

    /// Materialize a record for `identifier`, returning its instance.
    pub fn materialize(&mut self, identifier: &Identifier, resource_type: &ResourceType) -> u64 {
        if let Some(data) = self.records.get(identifier) {
            return data.instance;
        }
        let instance = self.next_instance;
        self.next_instance += 1;
        self.records
            .insert(identifier.clone(), RecordData::new(instance, resource_type.clone()));
        self.live.insert(instance, identifier.clone());
        instance
    }

    /// Live records, oldest materialization first.
    pub fn live(&self) -> impl Iterator<Item = (&Identifier, &RecordData)> {
        self.live
            .values()
            .filter_map(|identifier| self.records.get(identifier).map(|data| (identifier, data)))
    }

    /// Apply a lifecycle event, notifying when the state actually moves.
    pub fn transition(&mut self, identifier: &Identifier, event: RecordEvent) -> QuarryResult<RecordState> {
        let data = self
            .records
            .get_mut(identifier)
            .ok_or_else(|| LifecycleError::NotLoaded {
                identifier: identifier.clone(),
            })?;
        let from = data.state;
        let to = from.transition(event)?;
        if from != to {
            data.state = to;
            tracing::debug!(
                identifier = %identifier,
                from = %from,
                to = %to,
                event = %event,
                "Record state transition"
            );
            self.notify(Notification::StateChanged {
                identifier: identifier.clone(),
                from,
                to,
            });
        }
        Ok(to)
    }

    // ------------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------------

    /// Identifier for a pushed resource object.
    ///
    /// A concrete type that implements abstract types is registered under
    /// each of them, so references through the abstract type resolve to the
    /// same identifier.
    fn resolve_resource(&mut self, object: &ResourceObject) -> QuarryResult<Identifier> {
        let resource_type = &object.resource_type;
        self.registry.schema(resource_type)?;

        let known_lid = object
            .lid
            .as_deref()
            .and_then(|lid| self.identifiers.peek_lid(lid));
        if known_lid.is_none() {
            if let Some(id) = object.id.as_deref() {
                let mut resolved = None;
                for base in self.registry.ancestors(resource_type).to_vec() {
                    resolved = Some(self.identifiers.resolve_alias(resource_type, id, &base)?);
                }
                if let Some(identifier) = resolved {
                    return Ok(identifier);
                }
            }
        }

        self.resolve_reference(&object.reference())
    }

    pub fn resolve_reference(&mut self, reference: &ResourceReference) -> QuarryResult<Identifier> {
        check_reference(reference)?;
        Ok(self.identifiers.get_or_create_with_lid(
            &reference.resource_type,
            reference.id.as_deref(),
            reference.lid.as_deref(),
        )?)
    }

    /// Resolve a reference, noting the identifier in `fresh` when it had to
    /// be allocated.
    fn resolve_tracked(
        &mut self,
        reference: &ResourceReference,
        fresh: &mut Vec<Identifier>,
    ) -> QuarryResult<Identifier> {
        let known = self.knows(
            &reference.resource_type,
            reference.id.as_deref(),
            reference.lid.as_deref(),
        );
        let identifier = self.resolve_reference(reference)?;
        if !known {
            fresh.push(identifier.clone());
        }
        Ok(identifier)
    }

    fn membership(&mut self, data: &RelationshipData, fresh: &mut Vec<Identifier>) -> QuarryResult<Membership> {
        Ok(match data {
            RelationshipData::One(reference) => Membership::One(
                reference
                    .as_ref()
                    .map(|r| self.resolve_tracked(r, fresh))
                    .transpose()?,
            ),
            RelationshipData::Many(references) => Membership::Many(
                references
                    .iter()
                    .map(|r| self.resolve_tracked(r, fresh))
                    .collect::<QuarryResult<Vec<_>>>()?,
            ),
        })
    }

    /// Apply a canonical document, returning the primary identifiers.
    ///
    /// Every resource is checked and every identifier resolved before any
    /// record or relationship changes, so a rejected document leaves the
    /// records as they were.
    pub fn push_document(&mut self, document: &ResourceDocument) -> QuarryResult<Vec<Identifier>> {
        let objects: Vec<&ResourceObject> = document.resources().collect();
        for object in &objects {
            self.check_resource(object)?;
        }

        let mut fresh = Vec::new();
        let resolved = match self.resolve_resources(&objects, &mut fresh) {
            Ok(resolved) => resolved,
            Err(err) => {
                for identifier in &fresh {
                    self.identifiers.release(identifier);
                }
                return Err(err);
            }
        };

        let primary_count = document.data.resources().len();
        let mut primary = Vec::with_capacity(primary_count);
        for (index, (object, pushed)) in objects.into_iter().zip(resolved).enumerate() {
            let identifier = self.apply_resource(object, pushed)?;
            if index < primary_count {
                primary.push(identifier);
            }
        }
        self.emit_graph_changes();
        Ok(primary)
    }

    /// Checks that need no identifiers: known type, relationship names and
    /// cardinalities, and references that can be resolved.
    fn check_resource(&self, object: &ResourceObject) -> QuarryResult<()> {
        self.registry.schema(&object.resource_type)?;
        check_reference(&object.reference())?;
        for (name, relationship) in &object.relationships {
            let Some(data) = &relationship.data else {
                continue;
            };
            self.graph
                .check_push(&object.resource_type, name, cardinality_of(data))?;
            for reference in data.references() {
                check_reference(reference)?;
            }
        }
        Ok(())
    }

    /// Resolve identifiers for every object and its linkage, collecting the
    /// ones allocated along the way.
    fn resolve_resources(
        &mut self,
        objects: &[&ResourceObject],
        fresh: &mut Vec<Identifier>,
    ) -> QuarryResult<Vec<ResolvedResource>> {
        let mut resolved = Vec::with_capacity(objects.len());
        for object in objects {
            let known = self.knows(&object.resource_type, object.id.as_deref(), object.lid.as_deref());
            let identifier = self.resolve_resource(object)?;
            if !known {
                fresh.push(identifier.clone());
            }
            if let Some(data) = self.records.get(&identifier) {
                data.state.transition(RecordEvent::Loaded)?;
            }

            let mut relationships = Vec::new();
            for (name, relationship) in &object.relationships {
                let Some(data) = &relationship.data else {
                    continue;
                };
                if !self
                    .graph
                    .check_push(&object.resource_type, name, cardinality_of(data))?
                {
                    tracing::warn!(
                        resource_type = %object.resource_type,
                        relationship = %name,
                        "Skipping payload for unknown relationship"
                    );
                    continue;
                }
                relationships.push((name.clone(), self.membership(data, fresh)?));
            }
            resolved.push(ResolvedResource {
                identifier,
                relationships,
            });
        }
        Ok(resolved)
    }

    fn knows(&self, resource_type: &ResourceType, id: Option<&str>, lid: Option<&str>) -> bool {
        if lid.and_then(|lid| self.identifiers.peek_lid(lid)).is_some() {
            return true;
        }
        id.map_or(false, |id| {
            self.identifiers.peek(resource_type, id).is_some()
                || self
                    .registry
                    .ancestors(resource_type)
                    .iter()
                    .any(|base| self.identifiers.peek(base, id).is_some())
        })
    }

    fn apply_resource(&mut self, object: &ResourceObject, resolved: ResolvedResource) -> QuarryResult<Identifier> {
        let ResolvedResource {
            identifier,
            relationships,
        } = resolved;
        let resource_type = object.resource_type.clone();
        let registry = self.registry.clone();
        let schema = registry.schema(&resource_type)?;
        self.materialize(&identifier, &resource_type);

        let mut changed = Vec::new();
        if let Some(data) = self.records.get_mut(&identifier) {
            if !registry.is_a(&data.resource_type, &resource_type) {
                data.resource_type = resource_type.clone();
            }
            for (name, value) in &object.attributes {
                if schema.attribute(name).is_none() {
                    tracing::trace!(
                        resource_type = %resource_type,
                        attribute = %name,
                        "Ignoring unknown attribute"
                    );
                    continue;
                }
                let before = data.attribute(name).cloned();
                data.remote.insert(name.clone(), value.clone());
                if data.attribute(name) != before.as_ref() {
                    changed.push(name.clone());
                }
            }
        }
        for name in changed {
            self.notify(Notification::AttributeChanged {
                identifier: identifier.clone(),
                name,
            });
        }
        self.transition(&identifier, RecordEvent::Loaded)?;

        for (name, membership) in relationships {
            self.graph.push(&identifier, &resource_type, &name, membership)?;
        }
        Ok(identifier)
    }

    /// Publish changes to relationships that have been read.
    ///
    /// Payloads nobody has read stay queued whether or not anyone is
    /// subscribed.
    pub fn emit_graph_changes(&mut self) {
        if !self.notifier.has_subscribers() {
            self.graph.clear_changes();
            return;
        }
        for change in self.graph.take_observed_changes() {
            self.notify(Notification::RelationshipChanged {
                identifier: change.identifier,
                name: change.name,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    fn linkage(&self, membership: &Membership) -> RelationshipData {
        match membership {
            Membership::One(member) => {
                RelationshipData::One(member.as_ref().and_then(|m| self.identifiers.reference(m)))
            }
            Membership::Many(members) => RelationshipData::Many(
                members
                    .iter()
                    .filter_map(|m| self.identifiers.reference(m))
                    .collect(),
            ),
        }
    }

    fn related_snapshot(&mut self, identifier: &Identifier) -> Option<RelatedSnapshot> {
        let reference = self.identifiers.reference(identifier)?;
        let attributes = self
            .records
            .get(identifier)
            .map(RecordData::attributes)
            .unwrap_or_default();
        let relationships = self
            .graph
            .local_state(identifier, &reference.resource_type)
            .iter()
            .map(|(name, membership)| (name.clone(), self.linkage(membership)))
            .collect();
        Some(RelatedSnapshot {
            reference,
            attributes,
            relationships,
        })
    }

    /// Point-in-time copy of a record's effective state.
    pub fn snapshot(&mut self, identifier: &Identifier) -> QuarryResult<Snapshot> {
        let data = self
            .records
            .get(identifier)
            .ok_or_else(|| LifecycleError::NotLoaded {
                identifier: identifier.clone(),
            })?;
        let resource_type = data.resource_type.clone();
        let attributes = data.attributes();
        let changed_attributes = data.changed_attributes();

        let mut relationships = BTreeMap::new();
        for (name, membership) in self.graph.local_state(identifier, &resource_type) {
            let related = match membership {
                Membership::One(member) => {
                    RelationshipSnapshot::One(member.and_then(|m| self.related_snapshot(&m)))
                }
                Membership::Many(members) => RelationshipSnapshot::Many(
                    members
                        .iter()
                        .filter_map(|m| self.related_snapshot(m))
                        .collect(),
                ),
            };
            relationships.insert(name, related);
        }

        Ok(Snapshot {
            identifier: identifier.clone(),
            id: self.identifiers.id(identifier).map(str::to_string),
            resource_type,
            attributes,
            changed_attributes,
            relationships,
        })
    }

    /// Wire linkage of one relationship, `None` when the graph knows nothing.
    pub fn relationship_data(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
    ) -> QuarryResult<Option<RelationshipData>> {
        let membership = self.graph.get(identifier, resource_type, name)?;
        Ok(membership.map(|m| self.linkage(&m)))
    }

    pub fn check_attribute(&self, resource_type: &ResourceType, name: &str) -> QuarryResult<()> {
        if self.registry.schema(resource_type)?.attribute(name).is_none() {
            return Err(SchemaError::UnknownAttribute {
                resource_type: resource_type.clone(),
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Detach a record from the cache. The identifier is released at a later
    /// settle point, once nothing retains it.
    ///
    /// `hard` also removes the record from every relationship that still
    /// references it, async ones included.
    pub fn detach(&mut self, identifier: &Identifier, hard: bool) -> QuarryResult<()> {
        let Some(data) = self.records.get(identifier) else {
            return Ok(());
        };
        let from = data.state;
        let to = from.transition(RecordEvent::Unloaded)?;
        let instance = data.instance;
        let resource_type = data.resource_type.clone();

        self.records.remove(identifier);
        self.live.remove(&instance);
        self.graph.unload_record(identifier, &resource_type, hard);
        self.destroying.insert(instance, identifier.clone());
        if !self.pending_release.contains(identifier) {
            self.pending_release.push(identifier.clone());
        }

        tracing::debug!(
            identifier = %identifier,
            resource_type = %resource_type,
            hard,
            "Record detached"
        );
        self.notify(Notification::StateChanged {
            identifier: identifier.clone(),
            from,
            to,
        });
        self.notify(Notification::Unloaded {
            identifier: identifier.clone(),
        });
        self.emit_graph_changes();
        Ok(())
    }

    /// Finalize pending destroys. Returns how many instances were destroyed.
    pub fn settle(&mut self) -> usize {
        let destroyed = std::mem::take(&mut self.destroying);
        for (instance, identifier) in &destroyed {
            tracing::debug!(identifier = %identifier, instance, "Record destroyed");
        }

        for identifier in std::mem::take(&mut self.pending_release) {
            if self.records.contains_key(&identifier) {
                continue;
            }
            if !self.graph.retainers(&identifier).is_empty() {
                self.pending_release.push(identifier);
                continue;
            }
            if let Some(released) = self.identifiers.release(&identifier) {
                tracing::debug!(
                    identifier = %identifier,
                    resource_type = %released.resource_type,
                    "Identifier released"
                );
            }
        }
        self.emit_graph_changes();
        destroyed.len()
    }

    /// Drop a materialization that never finished loading.
    pub fn discard(&mut self, identifier: &Identifier) {
        if let Some(data) = self.records.remove(identifier) {
            self.live.remove(&data.instance);
        }
        if self.graph.retainers(identifier).is_empty() {
            self.identifiers.release(identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> RecordData {
        let mut data = RecordData::new(1, ResourceType::new("user"));
        data.remote.insert("name".to_string(), json!("Tom"));
        data
    }

    #[test]
    fn test_reads_prefer_local_then_inflight() {
        let mut data = data();
        data.local.insert("name".to_string(), json!("Inflight"));
        data.start_inflight();
        assert_eq!(data.attribute("name"), Some(&json!("Inflight")));
        data.local.insert("name".to_string(), json!("Local"));
        assert_eq!(data.attribute("name"), Some(&json!("Local")));
        assert_eq!(data.original("name"), Some(&json!("Inflight")));
    }

    #[test]
    fn test_commit_moves_inflight_to_remote() {
        let mut data = data();
        data.local.insert("name".to_string(), json!("Tomster"));
        let save = data.start_inflight();
        assert!(data.local.is_empty());
        assert_eq!(data.pending_saves(), 1);

        data.commit_inflight(save);
        assert_eq!(data.remote["name"], json!("Tomster"));
        assert!(data.inflight.is_empty());
        assert_eq!(data.pending_saves(), 0);
        assert!(data.changed_attributes().is_empty());
    }

    #[test]
    fn test_reject_does_not_overwrite_newer_edits() {
        let mut data = data();
        data.local.insert("name".to_string(), json!("Saved"));
        data.local.insert("email".to_string(), json!("a@b.c"));
        let save = data.start_inflight();
        data.local.insert("name".to_string(), json!("Newer"));

        data.reject_inflight(save);
        assert_eq!(data.local["name"], json!("Newer"));
        assert_eq!(data.local["email"], json!("a@b.c"));
        assert_eq!(data.remote["name"], json!("Tom"));
        assert_eq!(data.pending_saves(), 0);
    }

    #[test]
    fn test_commit_only_promotes_its_own_save() {
        let mut data = data();
        data.local.insert("name".to_string(), json!("First"));
        let first = data.start_inflight();
        data.local.insert("name".to_string(), json!("Second"));
        let second = data.start_inflight();

        data.commit_inflight(first);
        assert_eq!(data.remote["name"], json!("First"));
        assert_eq!(data.attribute("name"), Some(&json!("Second")));

        data.reject_inflight(second);
        assert_eq!(data.local["name"], json!("Second"));
        assert_eq!(data.changed_attributes()["name"].old, json!("First"));
        assert!(!data.attributes_clean());
    }

    #[test]
    fn test_reject_keeps_value_a_later_save_carries() {
        let mut data = data();
        data.local.insert("name".to_string(), json!("First"));
        let first = data.start_inflight();
        data.local.insert("name".to_string(), json!("Second"));
        let second = data.start_inflight();

        data.reject_inflight(first);
        assert!(data.local.is_empty());
        data.commit_inflight(second);
        assert_eq!(data.remote["name"], json!("Second"));
        assert!(data.attributes_clean());
    }
}
