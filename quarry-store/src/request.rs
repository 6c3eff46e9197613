//! Requests: finds, reloads and the save orchestrator.
//!
//! Every request follows the same shape: take the lock to prepare, release
//! it, await the adapter, then take the lock again to apply the outcome. The
//! record is identified by `(identifier, instance)` across the await, so a
//! response for a record unloaded in the meantime is dropped.

use crate::array::RecordArray;
use crate::errors::RecordErrors;
use crate::notification::Notification;
use crate::record::{refresh_dirty, Record};
use crate::store::Store;
use quarry_core::{
    Identifier, LifecycleError, PrimaryData, QuarryError, QuarryResult, RecordEvent,
    RequestError, RequestType, ResourceDocument, ResourceType, SerializeOptions,
};
use quarry_graph::Membership;
use serde_json::Value;
use std::collections::BTreeMap;

/// Which adapter call a save maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveKind {
    Create,
    Update,
    Delete,
}

impl SaveKind {
    fn request_type(self) -> RequestType {
        match self {
            SaveKind::Create => RequestType::CreateRecord,
            SaveKind::Update => RequestType::UpdateRecord,
            SaveKind::Delete => RequestType::DeleteRecord,
        }
    }
}

impl Store {
    /// Normalize a find-style response; a success without primary data is an error.
    fn normalize_find(
        &self,
        resource_type: &ResourceType,
        payload: Value,
        id: Option<&str>,
        request: RequestType,
    ) -> QuarryResult<ResourceDocument> {
        let document = self.serializer_for(resource_type).normalize_response(
            &self.normalize_context(),
            resource_type,
            payload,
            id,
            request,
        )?;
        if document.data.is_null() {
            return Err(RequestError::MissingPrimaryData {
                resource_type: resource_type.clone(),
                request,
            }
            .into());
        }
        Ok(document)
    }

    // ========================================================================
    // FIND
    // ========================================================================

    /// Loaded record for `(type, id)`, fetching it when the cache has none.
    pub async fn find_record(&self, type_name: &str, id: &str) -> QuarryResult<Record> {
        let resource_type = self.resource_type(type_name)?;
        {
            let state = self.read()?;
            if let Some(identifier) = state.identifiers.peek(&resource_type, id) {
                let loaded = state
                    .records
                    .get(&identifier)
                    .map_or(false, |data| data.state.is_loaded());
                if loaded {
                    if let Some(record) = self.handle(&state, &identifier) {
                        return Ok(record);
                    }
                }
            }
        }
        self.fetch_record(&resource_type, id).await
    }

    /// Fetch a loaded record again; local edits stay on top of the new data.
    pub async fn reload(&self, record: &Record) -> QuarryResult<Record> {
        let current = self
            .read()?
            .record(record.identifier(), record.instance())?
            .state;
        let Some(id) = record.id() else {
            return Err(LifecycleError::InvalidTransition {
                from: current.to_string(),
                event: RecordEvent::LoadingStarted.to_string(),
            }
            .into());
        };
        self.fetch_record(record.resource_type(), &id).await
    }

    async fn fetch_record(&self, resource_type: &ResourceType, id: &str) -> QuarryResult<Record> {
        let (identifier, instance, record_type) = {
            let mut state = self.write()?;
            let identifier = state.identifiers.get_or_create(resource_type, id);
            let instance = state.materialize(&identifier, resource_type);
            state.transition(&identifier, RecordEvent::LoadingStarted)?;
            let record_type = state.record(&identifier, instance)?.resource_type.clone();
            (identifier, instance, record_type)
        };

        tracing::debug!(resource_type = %resource_type, id, "Fetching record");
        let outcome = match self.adapter_for(resource_type).find_record(resource_type, id).await {
            Ok(payload) => self.normalize_find(resource_type, payload, Some(id), RequestType::FindRecord),
            Err(err) => Err(err.into()),
        };

        let mut state = self.write()?;
        if state.instance_state(&identifier, instance).is_destroying() {
            tracing::debug!(identifier = %identifier, "Dropping find response for an unloaded record");
            return Ok(Record::new(self.clone(), identifier, instance, record_type));
        }
        let document = match outcome {
            Ok(document) => document,
            Err(err) => {
                let not_found = matches!(err.as_request(), Some(RequestError::NotFound { .. }));
                let current = state.record(&identifier, instance).ok().map(|data| data.state);
                match current {
                    Some(s) if s.is_empty() || s.is_loading() => {
                        if s.is_loading() {
                            state.transition(&identifier, RecordEvent::NotFound)?;
                        }
                        state.discard(&identifier);
                    }
                    Some(s) if not_found && s.is_loaded() && !s.is_dirty() => {
                        state.transition(&identifier, RecordEvent::NotFound)?;
                        state.detach(&identifier, false)?;
                    }
                    _ => {}
                }
                tracing::debug!(resource_type = %resource_type, id, error = %err, "Find failed");
                return Err(err);
            }
        };

        let primary = state.push_document(&document)?;
        let identifier = primary.into_iter().next().unwrap_or(identifier);
        self.handle(&state, &identifier).ok_or_else(|| {
            LifecycleError::NotLoaded {
                identifier: identifier.clone(),
            }
            .into()
        })
    }

    /// Fetch several records of one type in a single request.
    pub async fn find_many(&self, type_name: &str, ids: &[String]) -> QuarryResult<Vec<Record>> {
        let resource_type = self.resource_type(type_name)?;
        self.fetch_many(&resource_type, ids).await
    }

    async fn fetch_many(&self, resource_type: &ResourceType, ids: &[String]) -> QuarryResult<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(resource_type = %resource_type, count = ids.len(), "Fetching records");
        let payload = self.adapter_for(resource_type).find_many(resource_type, ids).await?;
        let document = self.normalize_find(resource_type, payload, None, RequestType::FindMany)?;
        self.push(document)
    }

    /// Fetch every record of a type and return the live array.
    pub async fn find_all(&self, type_name: &str) -> QuarryResult<RecordArray> {
        let resource_type = self.resource_type(type_name)?;
        tracing::debug!(resource_type = %resource_type, "Fetching all records");
        let payload = self.adapter_for(&resource_type).find_all(&resource_type).await?;
        let document = self.normalize_find(&resource_type, payload, None, RequestType::FindAll)?;
        self.push(document)?;
        self.peek_all(type_name)
    }

    /// Re-fetch the members of a relationship through `find_many`, one
    /// request per concrete member type. Returns the members in order.
    pub async fn reload_relationship(&self, record: &Record, name: &str) -> QuarryResult<Vec<Record>> {
        let members = {
            let mut state = self.write()?;
            state.record(record.identifier(), record.instance())?;
            state
                .graph
                .get(record.identifier(), record.resource_type(), name)?
                .map(|m| m.identifiers())
                .unwrap_or_default()
        };

        let mut by_type: BTreeMap<String, (ResourceType, Vec<String>)> = BTreeMap::new();
        {
            let state = self.read()?;
            for member in &members {
                let (Some(resource_type), Some(id)) =
                    (state.identifiers.resource_type(member), state.identifiers.id(member))
                else {
                    continue;
                };
                by_type
                    .entry(resource_type.to_string())
                    .or_insert_with(|| (resource_type.clone(), Vec::new()))
                    .1
                    .push(id.to_string());
            }
        }
        for (resource_type, ids) in by_type.values() {
            self.fetch_many(resource_type, ids).await?;
        }

        let mut state = self.write()?;
        let members = state
            .graph
            .get(record.identifier(), record.resource_type(), name)?
            .map(|m| m.identifiers())
            .unwrap_or_default();
        Ok(members
            .iter()
            .filter_map(|member| self.handle(&state, member))
            .collect())
    }

    // ========================================================================
    // SAVE
    // ========================================================================

    /// Persist a dirty record.
    ///
    /// Creates, updates or deletes depending on the lifecycle state. A save
    /// issued while another is in flight is dispatched immediately; each
    /// carries its own snapshot and the last response to resolve wins. A
    /// response only settles the edits its own request carried.
    pub async fn save(&self, record: &Record) -> QuarryResult<()> {
        let identifier = record.identifier().clone();
        let instance = record.instance();

        let (kind, resource_type, snapshot, body, saved, save) = {
            let mut state = self.write()?;
            let data = state.record(&identifier, instance)?;
            let current = data.state;
            let resource_type = data.resource_type.clone();
            current.transition(RecordEvent::WillCommit)?;
            let kind = if current.is_deleted() {
                SaveKind::Delete
            } else if current.is_new() {
                SaveKind::Create
            } else {
                SaveKind::Update
            };

            let snapshot = state.snapshot(&identifier)?;
            let body = match kind {
                SaveKind::Delete => Value::Null,
                _ => self.serializer_for(&resource_type).serialize_into_document(
                    &state.registry,
                    &snapshot,
                    &SerializeOptions {
                        include_id: snapshot.id.is_some(),
                    },
                )?,
            };
            let saved = state.graph.local_state(&identifier, &resource_type);

            let data = state.record_mut(&identifier, instance)?;
            let save = data.start_inflight();
            data.errors.clear();
            data.errored = false;
            state.transition(&identifier, RecordEvent::WillCommit)?;
            (kind, resource_type, snapshot, body, saved, save)
        };

        tracing::debug!(
            identifier = %identifier,
            request = %kind.request_type(),
            save,
            "Dispatching save"
        );
        let adapter = self.adapter_for(&resource_type);
        let response = match kind {
            SaveKind::Create => adapter.create_record(&resource_type, &snapshot, &body).await,
            SaveKind::Update => adapter.update_record(&resource_type, &snapshot, &body).await,
            SaveKind::Delete => adapter.delete_record(&resource_type, &snapshot).await,
        };

        let document = match response {
            Ok(Some(payload)) => match self.serializer_for(&resource_type).normalize_response(
                &self.normalize_context(),
                &resource_type,
                payload,
                snapshot.id.as_deref(),
                kind.request_type(),
            ) {
                Ok(document) => Some(document),
                Err(err) => return self.reject_save(&identifier, instance, save, err),
            },
            Ok(None) => None,
            Err(err) => return self.reject_save(&identifier, instance, save, err.into()),
        };
        self.commit_save(&identifier, instance, save, kind, &saved, document)
    }

    fn commit_save(
        &self,
        identifier: &Identifier,
        instance: u64,
        save: u64,
        kind: SaveKind,
        saved: &BTreeMap<String, Membership>,
        document: Option<ResourceDocument>,
    ) -> QuarryResult<()> {
        let mut state = self.write()?;
        let Ok(data) = state.record_mut(identifier, instance) else {
            tracing::debug!(identifier = %identifier, "Dropping save response for a destroyed record");
            return Ok(());
        };
        data.commit_inflight(save);
        let pending = data.pending_saves();
        let resource_type = data.resource_type.clone();
        state.graph.commit_local(identifier, &resource_type, saved)?;

        if let Some(mut document) = document {
            if let PrimaryData::One(Some(primary)) = &mut document.data {
                if let Some(id) = primary.id.clone() {
                    if state.identifiers.id(identifier).is_none() {
                        state.identifiers.update_identifier(identifier, &id)?;
                        state.notify(Notification::IdentifierUpdated {
                            identifier: identifier.clone(),
                            id,
                        });
                    }
                }
                primary.lid = Some(identifier.lid().to_string());
            }
            state.push_document(&document)?;
        }

        if pending == 0 {
            state.transition(identifier, RecordEvent::DidCommit)?;
            match kind {
                SaveKind::Delete => state.detach(identifier, true)?,
                SaveKind::Create | SaveKind::Update => refresh_dirty(&mut state, identifier)?,
            }
        }
        tracing::debug!(identifier = %identifier, save, pending, "Save committed");
        state.emit_graph_changes();
        Ok(())
    }

    /// Put the edits of `save` back and record why it failed.
    fn reject_save(
        &self,
        identifier: &Identifier,
        instance: u64,
        save: u64,
        err: QuarryError,
    ) -> QuarryResult<()> {
        let mut state = self.write()?;
        let registry = state.registry.clone();
        let Ok(data) = state.record_mut(identifier, instance) else {
            tracing::debug!(identifier = %identifier, "Dropping save failure for a destroyed record");
            return Ok(());
        };
        data.reject_inflight(save);
        let pending = data.pending_saves();

        let event = match err.as_request() {
            Some(RequestError::Invalid { errors }) => {
                let schema = registry.schema(&data.resource_type)?;
                data.errors = RecordErrors::from_field_errors(schema, errors.clone());
                RecordEvent::BecameInvalid
            }
            _ => {
                data.errored = true;
                RecordEvent::BecameError
            }
        };
        if pending == 0 {
            state.transition(identifier, event)?;
        }
        tracing::debug!(identifier = %identifier, save, error = %err, "Save rejected");
        Err(err)
    }
}
