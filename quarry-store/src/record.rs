//! Record handles and to-many views.
//!
//! A [`Record`] is a thin handle: `(store, identifier, instance)`. Every read
//! goes through the store, so all handles of one materialization see the same
//! state, and a handle whose materialization was unloaded reports
//! `destroying`/`destroyed` even after the identifier is re-pushed.

use crate::errors::RecordErrors;
use crate::state::StoreState;
use crate::store::Store;
use quarry_core::{
    AttributeChange, Cardinality, GraphError, Identifier, QuarryResult, RecordEvent, RecordState,
    RelationshipData, RelationshipDefinition, ResourceReference, ResourceType, Snapshot,
};
use quarry_graph::Graph;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Move a persisted record between `loaded.saved` and
/// `loaded.updated.uncommitted` to match whether it has local changes.
pub(crate) fn refresh_dirty(state: &mut StoreState, identifier: &Identifier) -> QuarryResult<()> {
    let Some(data) = state.records.get(identifier) else {
        return Ok(());
    };
    let current = data.state;
    let resource_type = data.resource_type.clone();
    let attributes_clean = data.attributes_clean();
    let clean = attributes_clean && !state.graph.has_local_changes(identifier, &resource_type);
    match current {
        RecordState::LoadedSaved if !clean => {
            state.transition(identifier, RecordEvent::Edited)?;
        }
        RecordState::UpdatedUncommitted if clean => {
            state.transition(identifier, RecordEvent::RolledBack)?;
        }
        _ => {}
    }
    Ok(())
}

/// Handle to one materialization of a resource.
#[derive(Clone)]
pub struct Record {
    store: Store,
    identifier: Identifier,
    instance: u64,
    resource_type: ResourceType,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.instance == other.instance
    }
}

impl Eq for Record {}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("type", &self.resource_type)
            .field("identifier", &self.identifier)
            .field("instance", &self.instance)
            .finish()
    }
}

impl Record {
    pub(crate) fn new(
        store: Store,
        identifier: Identifier,
        instance: u64,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            store,
            identifier,
            instance,
            resource_type,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn lid(&self) -> &str {
        self.identifier.lid()
    }

    /// Materialization counter; differs between a record and its re-push
    /// after an unload.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Server id, once assigned.
    pub fn id(&self) -> Option<String> {
        let state = self.store.read().ok()?;
        state.identifiers.id(&self.identifier).map(str::to_string)
    }

    fn definition(&self, name: &str) -> QuarryResult<RelationshipDefinition> {
        Ok(self
            .store
            .registry()
            .relationship(&self.resource_type, name)?
            .clone())
    }

    fn expect_cardinality(&self, def: &RelationshipDefinition, cardinality: Cardinality) -> QuarryResult<()> {
        if def.cardinality != cardinality {
            return Err(GraphError::CardinalityMismatch {
                resource_type: self.resource_type.clone(),
                name: def.name().to_string(),
                expected: def.cardinality.as_str(),
            }
            .into());
        }
        Ok(())
    }

    // ========================================================================
    // STATE
    // ========================================================================

    pub fn state(&self) -> QuarryResult<RecordState> {
        Ok(self.store.read()?.instance_state(&self.identifier, self.instance))
    }

    fn check(&self, predicate: fn(&RecordState) -> bool) -> bool {
        self.state().map_or(false, |state| predicate(&state))
    }

    pub fn is_empty(&self) -> bool {
        self.check(RecordState::is_empty)
    }

    pub fn is_loading(&self) -> bool {
        self.check(RecordState::is_loading)
    }

    pub fn is_loaded(&self) -> bool {
        self.check(RecordState::is_loaded)
    }

    pub fn is_dirty(&self) -> bool {
        self.check(RecordState::is_dirty)
    }

    pub fn is_new(&self) -> bool {
        self.check(RecordState::is_new)
    }

    pub fn is_deleted(&self) -> bool {
        self.check(RecordState::is_deleted)
    }

    pub fn is_saving(&self) -> bool {
        self.check(RecordState::is_saving)
    }

    pub fn is_valid(&self) -> bool {
        !self.check(RecordState::is_invalid)
    }

    pub fn is_destroying(&self) -> bool {
        self.check(RecordState::is_destroying)
    }

    pub fn is_destroyed(&self) -> bool {
        self.check(RecordState::is_destroyed)
    }

    /// The last save failed with a non-validation error.
    pub fn is_error(&self) -> bool {
        self.store
            .read()
            .ok()
            .and_then(|state| state.record(&self.identifier, self.instance).ok().map(|d| d.errored))
            .unwrap_or(false)
    }

    pub fn errors(&self) -> QuarryResult<RecordErrors> {
        let state = self.store.read()?;
        Ok(state.record(&self.identifier, self.instance)?.errors.clone())
    }

    // ========================================================================
    // ATTRIBUTES
    // ========================================================================

    pub fn attr(&self, name: &str) -> QuarryResult<Option<Value>> {
        let state = self.store.read()?;
        state.check_attribute(&self.resource_type, name)?;
        Ok(state
            .record(&self.identifier, self.instance)?
            .attribute(name)
            .cloned())
    }

    pub fn attributes(&self) -> QuarryResult<Map<String, Value>> {
        let state = self.store.read()?;
        Ok(state.record(&self.identifier, self.instance)?.attributes())
    }

    /// Locally changed attributes with their last known server value.
    pub fn changed_attributes(&self) -> QuarryResult<BTreeMap<String, AttributeChange>> {
        let state = self.store.read()?;
        Ok(state.record(&self.identifier, self.instance)?.changed_attributes())
    }

    pub fn has_dirty_attributes(&self) -> bool {
        self.changed_attributes().map_or(false, |changes| !changes.is_empty())
    }

    /// Set an attribute locally.
    ///
    /// Setting a value back to its server value drops the local change. On an
    /// invalid record the field's errors are cleared, and once no errors
    /// remain the record becomes uncommitted again.
    pub fn set_attr(&self, name: &str, value: Value) -> QuarryResult<()> {
        let mut state = self.store.write()?;
        state.check_attribute(&self.resource_type, name)?;
        let data = state.record_mut(&self.identifier, self.instance)?;
        if data.attribute(name).unwrap_or(&Value::Null) == &value {
            return Ok(());
        }
        data.state.transition(RecordEvent::Edited)?;

        if data.original(name).unwrap_or(&Value::Null) == &value {
            data.local.remove(name);
        } else {
            data.local.insert(name.to_string(), value);
        }
        let cleared = data.errors.remove(name);
        let errors_resolved = cleared && data.state.is_invalid() && data.errors.is_empty();

        state.notify(crate::Notification::AttributeChanged {
            identifier: self.identifier.clone(),
            name: name.to_string(),
        });
        state.transition(&self.identifier, RecordEvent::Edited)?;
        if errors_resolved {
            state.transition(&self.identifier, RecordEvent::ErrorsCleared)?;
        }
        refresh_dirty(&mut state, &self.identifier)
    }

    /// Discard local changes.
    ///
    /// A record that was never saved has nothing to roll back to and is
    /// unloaded instead.
    pub fn rollback_attributes(&self) -> QuarryResult<()> {
        let mut state = self.store.write()?;
        let data = state.record_mut(&self.identifier, self.instance)?;
        if matches!(
            data.state,
            RecordState::CreatedUncommitted | RecordState::CreatedInvalid
        ) {
            return state.detach(&self.identifier, false);
        }
        data.state.transition(RecordEvent::RolledBack)?;

        let discarded: Vec<String> = data.local.keys().cloned().collect();
        data.local.clear();
        data.errors.clear();
        data.errored = false;
        for name in discarded {
            state.notify(crate::Notification::AttributeChanged {
                identifier: self.identifier.clone(),
                name,
            });
        }
        state.graph.rollback_local(&self.identifier, &self.resource_type);
        state.transition(&self.identifier, RecordEvent::RolledBack)?;
        state.emit_graph_changes();
        Ok(())
    }

    // ========================================================================
    // RELATIONSHIPS
    // ========================================================================

    /// Apply a local relationship edit and update the dirty state.
    fn edit_relationship<F>(&self, edit: F) -> QuarryResult<()>
    where
        F: FnOnce(&mut Graph, &Identifier, &ResourceType) -> QuarryResult<()>,
    {
        let mut state = self.store.write()?;
        let current = state.record(&self.identifier, self.instance)?.state;
        current.transition(RecordEvent::Edited)?;
        edit(&mut state.graph, &self.identifier, &self.resource_type)?;
        refresh_dirty(&mut state, &self.identifier)?;
        state.emit_graph_changes();
        Ok(())
    }

    /// Related record of a to-one relationship, if it is materialized.
    pub fn belongs_to(&self, name: &str) -> QuarryResult<Option<Record>> {
        let def = self.definition(name)?;
        self.expect_cardinality(&def, Cardinality::One)?;
        let mut state = self.store.write()?;
        state.record(&self.identifier, self.instance)?;
        let member = state
            .graph
            .get(&self.identifier, &self.resource_type, name)?
            .and_then(|m| m.as_one().cloned());
        Ok(member.and_then(|m| self.store.handle(&state, &m)))
    }

    /// Linkage of a to-one relationship, whether or not the related record is loaded.
    pub fn belongs_to_reference(&self, name: &str) -> QuarryResult<Option<ResourceReference>> {
        let def = self.definition(name)?;
        self.expect_cardinality(&def, Cardinality::One)?;
        let mut state = self.store.write()?;
        state.record(&self.identifier, self.instance)?;
        Ok(
            match state.relationship_data(&self.identifier, &self.resource_type, name)? {
                Some(RelationshipData::One(reference)) => reference,
                _ => None,
            },
        )
    }

    pub fn set_belongs_to(&self, name: &str, related: Option<&Record>) -> QuarryResult<()> {
        let def = self.definition(name)?;
        self.expect_cardinality(&def, Cardinality::One)?;
        self.edit_relationship(|graph, identifier, resource_type| {
            graph.set_one(identifier, resource_type, name, related.map(Record::identifier))
        })
    }

    /// Read-through view of a to-many relationship.
    pub fn has_many(&self, name: &str) -> QuarryResult<ManyView> {
        let def = self.definition(name)?;
        self.expect_cardinality(&def, Cardinality::Many)?;
        Ok(ManyView {
            owner: self.clone(),
            name: name.to_string(),
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Mark for deletion. A record that was never saved is destroyed at once.
    pub fn delete_record(&self) -> QuarryResult<()> {
        let mut state = self.store.write()?;
        let current = state.record(&self.identifier, self.instance)?.state;
        let next = state.transition(&self.identifier, RecordEvent::Deleted)?;
        if current.is_new() && next == RecordState::DeletedSaved {
            state.detach(&self.identifier, true)?;
        }
        Ok(())
    }

    /// Detach from the cache; destruction completes at the next settle point.
    pub fn unload(&self) -> QuarryResult<()> {
        let mut state = self.store.write()?;
        state.record(&self.identifier, self.instance)?;
        state.detach(&self.identifier, false)
    }

    pub fn snapshot(&self) -> QuarryResult<Snapshot> {
        let mut state = self.store.write()?;
        state.record(&self.identifier, self.instance)?;
        state.snapshot(&self.identifier)
    }

    pub async fn save(&self) -> QuarryResult<()> {
        self.store.save(self).await
    }

    /// Delete and persist the deletion.
    pub async fn destroy_record(&self) -> QuarryResult<()> {
        self.delete_record()?;
        if self.is_destroying() {
            return Ok(());
        }
        self.save().await
    }

    pub async fn reload(&self) -> QuarryResult<Record> {
        self.store.reload(self).await
    }
}

// ============================================================================
// MANY VIEW
// ============================================================================

/// Live view of a to-many relationship.
///
/// Holds no membership of its own: every call reads the graph, so edits
/// made anywhere are visible immediately.
#[derive(Clone, Debug)]
pub struct ManyView {
    owner: Record,
    name: String,
}

impl ManyView {
    pub fn owner(&self) -> &Record {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifiers(&self) -> QuarryResult<Vec<Identifier>> {
        let mut state = self.owner.store.write()?;
        state.record(&self.owner.identifier, self.owner.instance)?;
        Ok(state
            .graph
            .get(&self.owner.identifier, &self.owner.resource_type, &self.name)?
            .map(|m| m.identifiers())
            .unwrap_or_default())
    }

    /// Wire references of every member, loaded or not.
    pub fn references(&self) -> QuarryResult<Vec<ResourceReference>> {
        let mut state = self.owner.store.write()?;
        state.record(&self.owner.identifier, self.owner.instance)?;
        Ok(
            match state.relationship_data(&self.owner.identifier, &self.owner.resource_type, &self.name)? {
                Some(RelationshipData::Many(references)) => references,
                _ => Vec::new(),
            },
        )
    }

    pub fn ids(&self) -> QuarryResult<Vec<String>> {
        Ok(self
            .references()?
            .into_iter()
            .filter_map(|reference| reference.id)
            .collect())
    }

    /// Materialized members, in membership order.
    pub fn records(&self) -> QuarryResult<Vec<Record>> {
        let identifiers = self.identifiers()?;
        let state = self.owner.store.read()?;
        Ok(identifiers
            .iter()
            .filter_map(|identifier| self.owner.store.handle(&state, identifier))
            .collect())
    }

    pub fn len(&self) -> QuarryResult<usize> {
        Ok(self.identifiers()?.len())
    }

    pub fn is_empty(&self) -> QuarryResult<bool> {
        Ok(self.identifiers()?.is_empty())
    }

    pub fn contains(&self, record: &Record) -> QuarryResult<bool> {
        Ok(self.identifiers()?.contains(&record.identifier))
    }

    pub fn add(&self, record: &Record) -> QuarryResult<()> {
        self.owner.edit_relationship(|graph, identifier, resource_type| {
            graph.add_to_many(identifier, resource_type, &self.name, &record.identifier)
        })
    }

    pub fn remove(&self, record: &Record) -> QuarryResult<()> {
        self.owner.edit_relationship(|graph, identifier, resource_type| {
            graph.remove_from_many(identifier, resource_type, &self.name, &record.identifier)
        })
    }

    pub fn replace(&self, records: &[Record]) -> QuarryResult<()> {
        let members: Vec<Identifier> = records.iter().map(|r| r.identifier.clone()).collect();
        self.owner.edit_relationship(|graph, identifier, resource_type| {
            graph.replace_many(identifier, resource_type, &self.name, &members)
        })
    }

    /// Re-fetch the members through the adapter.
    pub async fn reload(&self) -> QuarryResult<Vec<Record>> {
        self.owner.store.reload_relationship(&self.owner, &self.name).await
    }
}
