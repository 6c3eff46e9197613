//! The store: identity map, relationship graph and record lifecycle behind
//! one lock, with adapters and serializers injected at construction.

use crate::array::RecordArray;
use crate::notification::{Notification, Notifier};
use crate::record::Record;
use crate::state::StoreState;
use async_trait::async_trait;
use quarry_core::{
    single_adapter, single_serializer, Adapter, AdapterResolver, Identifier, NormalizeContext,
    NormalizeError, QuarryResult, RecordEvent, RequestError, RequestType, ResourceDocument,
    ResourceType, SchemaRegistry, Serializer, SerializerResolver, Snapshot, StoreConfig,
    StoreError,
};
use quarry_normalize::JsonApiSerializer;
use serde_json::Value;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`Store`].
///
/// Without an adapter every request fails with an adapter error, which is
/// enough for stores fed only through [`Store::push`]. The default serializer
/// is [`JsonApiSerializer`].
pub struct StoreBuilder {
    registry: Arc<SchemaRegistry>,
    config: StoreConfig,
    adapters: Option<AdapterResolver>,
    serializers: Option<SerializerResolver>,
}

impl StoreBuilder {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            config: StoreConfig::default(),
            adapters: None,
            serializers: None,
        }
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// One adapter for every resource type.
    pub fn with_adapter(self, adapter: Arc<dyn Adapter>) -> Self {
        self.with_adapter_resolver(single_adapter(adapter))
    }

    pub fn with_adapter_resolver(mut self, resolver: AdapterResolver) -> Self {
        self.adapters = Some(resolver);
        self
    }

    /// One serializer for every resource type.
    pub fn with_serializer(self, serializer: Arc<dyn Serializer>) -> Self {
        self.with_serializer_resolver(single_serializer(serializer))
    }

    pub fn with_serializer_resolver(mut self, resolver: SerializerResolver) -> Self {
        self.serializers = Some(resolver);
        self
    }

    /// Validate the configuration and build the store.
    pub fn build(self) -> QuarryResult<Store> {
        self.config.validate()?;

        let notifier = Notifier::new(self.config.notification_capacity);
        let state = StoreState::new(self.registry.clone(), &self.config, notifier.clone());
        let adapters = self
            .adapters
            .unwrap_or_else(|| single_adapter(Arc::new(UnconfiguredAdapter)));
        let serializers = self
            .serializers
            .unwrap_or_else(|| single_serializer(Arc::new(JsonApiSerializer::new())));

        tracing::debug!(
            types = self.registry.types().count(),
            lid_prefix = %self.config.lid_prefix,
            strict_relationships = self.config.strict_relationships,
            "Store built"
        );

        Ok(Store {
            inner: Arc::new(StoreInner {
                state: RwLock::new(state),
                registry: self.registry,
                config: self.config,
                adapters,
                serializers,
                notifier,
            }),
        })
    }
}

/// Adapter used when none was configured.
#[derive(Debug)]
struct UnconfiguredAdapter;

impl UnconfiguredAdapter {
    fn error(resource_type: &ResourceType) -> RequestError {
        RequestError::adapter(None, format!("No adapter configured for {}", resource_type))
    }
}

#[async_trait]
impl Adapter for UnconfiguredAdapter {
    async fn find_record(&self, resource_type: &ResourceType, _id: &str) -> Result<Value, RequestError> {
        Err(Self::error(resource_type))
    }

    async fn find_many(&self, resource_type: &ResourceType, _ids: &[String]) -> Result<Value, RequestError> {
        Err(Self::error(resource_type))
    }

    async fn create_record(
        &self,
        resource_type: &ResourceType,
        _snapshot: &Snapshot,
        _body: &Value,
    ) -> Result<Option<Value>, RequestError> {
        Err(Self::error(resource_type))
    }

    async fn update_record(
        &self,
        resource_type: &ResourceType,
        _snapshot: &Snapshot,
        _body: &Value,
    ) -> Result<Option<Value>, RequestError> {
        Err(Self::error(resource_type))
    }

    async fn delete_record(
        &self,
        resource_type: &ResourceType,
        _snapshot: &Snapshot,
    ) -> Result<Option<Value>, RequestError> {
        Err(Self::error(resource_type))
    }
}

// ============================================================================
// STORE
// ============================================================================

pub(crate) struct StoreInner {
    state: RwLock<StoreState>,
    registry: Arc<SchemaRegistry>,
    config: StoreConfig,
    adapters: AdapterResolver,
    serializers: SerializerResolver,
    notifier: Notifier,
}

/// Cheaply cloneable handle to one cache instance.
///
/// All cache mutations are synchronous and serialized by one lock. Requests
/// release the lock while the adapter is awaited, so the cache stays readable
/// and writable while they are pending.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn builder(registry: Arc<SchemaRegistry>) -> StoreBuilder {
        StoreBuilder::new(registry)
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Receive every notification published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    pub(crate) fn read(&self) -> QuarryResult<RwLockReadGuard<'_, StoreState>> {
        self.inner
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned.into())
    }

    pub(crate) fn write(&self) -> QuarryResult<RwLockWriteGuard<'_, StoreState>> {
        self.inner
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned.into())
    }

    pub(crate) fn adapter_for(&self, resource_type: &ResourceType) -> Arc<dyn Adapter> {
        (self.inner.adapters)(resource_type)
    }

    pub(crate) fn serializer_for(&self, resource_type: &ResourceType) -> Arc<dyn Serializer> {
        (self.inner.serializers)(resource_type)
    }

    pub(crate) fn normalize_context(&self) -> NormalizeContext<'_> {
        NormalizeContext::new(&self.inner.registry)
            .with_drop_unknown_types(self.inner.config.drop_unknown_types)
    }

    /// Registered resource type named `name`.
    pub(crate) fn resource_type(&self, name: &str) -> QuarryResult<ResourceType> {
        let resource_type = ResourceType::new(name);
        self.inner.registry.schema(&resource_type)?;
        Ok(resource_type)
    }

    pub(crate) fn handle(&self, state: &StoreState, identifier: &Identifier) -> Option<Record> {
        state.records.get(identifier).map(|data| {
            Record::new(
                self.clone(),
                identifier.clone(),
                data.instance,
                data.resource_type.clone(),
            )
        })
    }

    // ========================================================================
    // PUSH
    // ========================================================================

    /// Apply a canonical document and return the primary records.
    ///
    /// Attributes are merged into the remote state; relationship payloads are
    /// queued on the graph and reconciled lazily, so the order of resources in
    /// `included` does not affect the final state.
    pub fn push(&self, document: ResourceDocument) -> QuarryResult<Vec<Record>> {
        let mut state = self.write()?;
        let primary = state.push_document(&document)?;
        Ok(primary
            .iter()
            .filter_map(|identifier| self.handle(&state, identifier))
            .collect())
    }

    /// Normalize a raw payload with the serializer of `type_name`, then push it.
    pub fn push_payload(&self, type_name: &str, payload: Value) -> QuarryResult<Vec<Record>> {
        let resource_type = self.resource_type(type_name)?;
        let document = self.serializer_for(&resource_type).normalize_response(
            &self.normalize_context(),
            &resource_type,
            payload,
            None,
            RequestType::FindAll,
        )?;
        self.push(document)
    }

    // ========================================================================
    // LOCAL RECORDS
    // ========================================================================

    /// Create a record that exists only locally, in `loaded.created.uncommitted`.
    pub fn create_record(&self, type_name: &str, attributes: Value) -> QuarryResult<Record> {
        let resource_type = self.resource_type(type_name)?;
        let attributes = match attributes {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map,
            _ => {
                return Err(NormalizeError::InvalidResource {
                    resource_type,
                    reason: "initial attributes must be a JSON object".to_string(),
                }
                .into())
            }
        };

        let mut state = self.write()?;
        for name in attributes.keys() {
            state.check_attribute(&resource_type, name)?;
        }
        let identifier = state
            .identifiers
            .get_or_create_for_new_resource(&resource_type);
        let instance = state.materialize(&identifier, &resource_type);
        if let Some(data) = state.records.get_mut(&identifier) {
            data.local = attributes;
        }
        state.transition(&identifier, RecordEvent::Created)?;
        tracing::debug!(identifier = %identifier, resource_type = %resource_type, "Record created");

        Ok(Record::new(self.clone(), identifier, instance, resource_type))
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    /// Loaded record for `(type, id)`, without a request.
    pub fn peek_record(&self, type_name: &str, id: &str) -> QuarryResult<Option<Record>> {
        let resource_type = self.resource_type(type_name)?;
        let state = self.read()?;
        let Some(identifier) = state.identifiers.peek(&resource_type, id) else {
            return Ok(None);
        };
        Ok(self
            .handle(&state, &identifier)
            .filter(|_| state.records.get(&identifier).map_or(false, |d| d.state.is_loaded())))
    }

    pub fn has_record_for_id(&self, type_name: &str, id: &str) -> bool {
        matches!(self.peek_record(type_name, id), Ok(Some(_)))
    }

    /// Record currently materialized for an identifier.
    pub fn record_for(&self, identifier: &Identifier) -> QuarryResult<Option<Record>> {
        let state = self.read()?;
        Ok(self.handle(&state, identifier))
    }

    /// Identifier for `(type, id)`, if the cache has seen it.
    pub fn identifier_for(&self, type_name: &str, id: &str) -> QuarryResult<Option<Identifier>> {
        let resource_type = self.resource_type(type_name)?;
        Ok(self.read()?.identifiers.peek(&resource_type, id))
    }

    /// Live array of every loaded record of a type, subtypes included.
    pub fn peek_all(&self, type_name: &str) -> QuarryResult<RecordArray> {
        let resource_type = self.resource_type(type_name)?;
        Ok(RecordArray::new(self.clone(), resource_type))
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Unload every record of a type. Returns how many were unloaded.
    pub fn unload_all(&self, type_name: &str) -> QuarryResult<usize> {
        let resource_type = self.resource_type(type_name)?;
        let mut state = self.write()?;
        let registry = self.inner.registry.clone();
        let targets: Vec<Identifier> = state
            .live()
            .filter(|(_, data)| registry.is_a(&data.resource_type, &resource_type))
            .map(|(identifier, _)| identifier.clone())
            .collect();
        for identifier in &targets {
            state.detach(identifier, false)?;
        }
        Ok(targets.len())
    }

    /// Settle point: finalize pending destroys and release identifiers that
    /// nothing retains any more. Returns how many records were destroyed.
    pub fn settle(&self) -> QuarryResult<usize> {
        let destroyed = self.write()?.settle();
        if destroyed > 0 {
            tracing::debug!(destroyed, "Settled pending destroys");
        }
        Ok(destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{QuarryError, RecordState, SchemaError};
    use quarry_test_utils::fixtures;
    use serde_json::json;

    fn store() -> Store {
        Store::builder(fixtures::app_registry()).build().unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = Store::builder(fixtures::app_registry())
            .with_config(StoreConfig::default().with_lid_prefix(""))
            .build();
        assert!(matches!(result, Err(QuarryError::Config(_))));
    }

    #[test]
    fn test_push_returns_primary_records() {
        let store = store();
        let records = store
            .push(fixtures::user_with_hats(&[("big-hat", "1"), ("small-hat", "2")]))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id().as_deref(), Some("1"));
        assert_eq!(records[0].state().unwrap(), RecordState::LoadedSaved);
        assert!(store.has_record_for_id("big-hat", "1"));
        assert!(store.has_record_for_id("hat", "1"));
        assert!(!store.has_record_for_id("user", "2"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let store = store();
        assert!(matches!(
            store.peek_record("spaceship", "1"),
            Err(QuarryError::Schema(SchemaError::UnknownType { .. }))
        ));
    }

    #[test]
    fn test_create_record_validates_attributes() {
        let store = store();
        let err = store
            .create_record("user", json!({"nickname": "x"}))
            .unwrap_err();
        assert!(matches!(
            err,
            QuarryError::Schema(SchemaError::UnknownAttribute { .. })
        ));

        let user = store.create_record("user", json!({"name": "Tom"})).unwrap();
        assert_eq!(user.state().unwrap(), RecordState::CreatedUncommitted);
        assert_eq!(user.id(), None);
        assert!(user.lid().starts_with("@lid:"));
        assert_eq!(user.attr("name").unwrap(), Some(json!("Tom")));
    }

    #[tokio::test]
    async fn test_requests_without_adapter_fail() {
        let store = store();
        let err = store.find_record("user", "1").await.unwrap_err();
        assert!(matches!(
            err.as_request(),
            Some(RequestError::Adapter { status: None, .. })
        ));
        assert!(!store.has_record_for_id("user", "1"));
    }

    #[test]
    fn test_push_payload_uses_type_serializer() {
        let store = store();
        let records = store
            .push_payload("user", fixtures::user_payload("4", "Yehuda"))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attr("name").unwrap(), Some(json!("Yehuda")));
    }
}
