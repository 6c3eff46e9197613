//! Quarry Test Utilities
//!
//! Shared test infrastructure for the quarry workspace:
//! - Mock adapters (canned and manually resolved)
//! - Proptest generators
//! - Fixture schemas and documents

pub use quarry_core::{
    Adapter, FieldError, Identifier, QuarryError, QuarryResult, RelationshipSchema, RequestError,
    RequestType, ResourceDocument, ResourceObject, ResourceReference, ResourceType,
    SchemaRegistry, Snapshot, StoreConfig, TypeSchema,
};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// MOCK ADAPTERS
// ============================================================================

/// A request an adapter received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub request: RequestType,
    pub resource_type: ResourceType,
    pub ids: Vec<String>,
    pub body: Option<Value>,
}

#[derive(Debug, Default)]
struct MockState {
    records: HashMap<(ResourceType, String), Value>,
    many: HashMap<ResourceType, Value>,
    saves: VecDeque<Result<Option<Value>, RequestError>>,
    calls: Vec<RecordedCall>,
}

/// Adapter answering from canned payloads.
///
/// `find_record` answers from [`MockAdapter::with_record`] or fails with
/// `NotFound`; `find_many` and `find_all` answer from
/// [`MockAdapter::with_many`]; writes pop responses queued with [`MockAdapter::respond`] and
/// succeed with no payload once the queue is empty.
#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_record(self, resource_type: &str, id: &str, payload: Value) -> Self {
        self.state()
            .records
            .insert((ResourceType::new(resource_type), id.to_string()), payload);
        self
    }

    pub fn with_many(self, resource_type: &str, payload: Value) -> Self {
        self.state().many.insert(ResourceType::new(resource_type), payload);
        self
    }

    /// Queue the outcome of the next write request.
    pub fn respond(&self, response: Result<Option<Value>, RequestError>) {
        self.state().saves.push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    fn record_call(&self, request: RequestType, resource_type: &ResourceType, ids: Vec<String>, body: Option<Value>) {
        self.state().calls.push(RecordedCall {
            request,
            resource_type: resource_type.clone(),
            ids,
            body,
        });
    }

    fn next_save(&self) -> Result<Option<Value>, RequestError> {
        self.state().saves.pop_front().unwrap_or(Ok(None))
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn find_record(&self, resource_type: &ResourceType, id: &str) -> Result<Value, RequestError> {
        self.record_call(RequestType::FindRecord, resource_type, vec![id.to_string()], None);
        self.state()
            .records
            .get(&(resource_type.clone(), id.to_string()))
            .cloned()
            .ok_or_else(|| RequestError::NotFound {
                resource_type: resource_type.clone(),
                id: id.to_string(),
            })
    }

    async fn find_many(&self, resource_type: &ResourceType, ids: &[String]) -> Result<Value, RequestError> {
        self.record_call(RequestType::FindMany, resource_type, ids.to_vec(), None);
        self.state()
            .many
            .get(resource_type)
            .cloned()
            .ok_or_else(|| RequestError::adapter(Some(404), format!("no canned findMany for {}", resource_type)))
    }

    async fn find_all(&self, resource_type: &ResourceType) -> Result<Value, RequestError> {
        self.record_call(RequestType::FindAll, resource_type, Vec::new(), None);
        self.state()
            .many
            .get(resource_type)
            .cloned()
            .ok_or_else(|| RequestError::adapter(Some(404), format!("no canned findAll for {}", resource_type)))
    }

    async fn create_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
        body: &Value,
    ) -> Result<Option<Value>, RequestError> {
        let ids = snapshot.id.iter().cloned().collect();
        self.record_call(RequestType::CreateRecord, resource_type, ids, Some(body.clone()));
        self.next_save()
    }

    async fn update_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
        body: &Value,
    ) -> Result<Option<Value>, RequestError> {
        let ids = snapshot.id.iter().cloned().collect();
        self.record_call(RequestType::UpdateRecord, resource_type, ids, Some(body.clone()));
        self.next_save()
    }

    async fn delete_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
    ) -> Result<Option<Value>, RequestError> {
        let ids = snapshot.id.iter().cloned().collect();
        self.record_call(RequestType::DeleteRecord, resource_type, ids, None);
        self.next_save()
    }
}

/// A request held open until the test resolves it.
#[derive(Debug)]
pub struct PendingRequest {
    pub request: RequestType,
    pub resource_type: ResourceType,
    pub ids: Vec<String>,
    pub snapshot: Option<Snapshot>,
    pub body: Option<Value>,
    responder: oneshot::Sender<Result<Option<Value>, RequestError>>,
}

impl PendingRequest {
    pub fn respond(self, payload: Value) {
        let _ = self.responder.send(Ok(Some(payload)));
    }

    pub fn respond_empty(self) {
        let _ = self.responder.send(Ok(None));
    }

    pub fn reject(self, error: RequestError) {
        let _ = self.responder.send(Err(error));
    }
}

/// Adapter that hands every request to the test through a channel, so the
/// test decides when and in which order requests resolve.
#[derive(Debug, Clone)]
pub struct DeferredAdapter {
    sender: mpsc::UnboundedSender<PendingRequest>,
}

impl DeferredAdapter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    async fn dispatch(
        &self,
        request: RequestType,
        resource_type: &ResourceType,
        ids: Vec<String>,
        snapshot: Option<&Snapshot>,
        body: Option<&Value>,
    ) -> Result<Option<Value>, RequestError> {
        let (responder, response) = oneshot::channel();
        self.sender
            .send(PendingRequest {
                request,
                resource_type: resource_type.clone(),
                ids,
                snapshot: snapshot.cloned(),
                body: body.cloned(),
                responder,
            })
            .map_err(|_| RequestError::adapter(None, "deferred adapter receiver dropped"))?;
        response
            .await
            .map_err(|_| RequestError::adapter(None, "deferred request dropped"))?
    }
}

#[async_trait]
impl Adapter for DeferredAdapter {
    async fn find_record(&self, resource_type: &ResourceType, id: &str) -> Result<Value, RequestError> {
        self.dispatch(RequestType::FindRecord, resource_type, vec![id.to_string()], None, None)
            .await
            .map(|payload| payload.unwrap_or(Value::Null))
    }

    async fn find_many(&self, resource_type: &ResourceType, ids: &[String]) -> Result<Value, RequestError> {
        self.dispatch(RequestType::FindMany, resource_type, ids.to_vec(), None, None)
            .await
            .map(|payload| payload.unwrap_or(Value::Null))
    }

    async fn create_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
        body: &Value,
    ) -> Result<Option<Value>, RequestError> {
        let ids = snapshot.id.iter().cloned().collect();
        self.dispatch(RequestType::CreateRecord, resource_type, ids, Some(snapshot), Some(body))
            .await
    }

    async fn update_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
        body: &Value,
    ) -> Result<Option<Value>, RequestError> {
        let ids = snapshot.id.iter().cloned().collect();
        self.dispatch(RequestType::UpdateRecord, resource_type, ids, Some(snapshot), Some(body))
            .await
    }

    async fn delete_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
    ) -> Result<Option<Value>, RequestError> {
        let ids = snapshot.id.iter().cloned().collect();
        self.dispatch(RequestType::DeleteRecord, resource_type, ids, Some(snapshot), None)
            .await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for quarry types.

    use super::*;
    use proptest::prelude::*;

    /// Server ids as they arrive on the wire (always strings after normalization).
    pub fn arb_resource_id() -> impl Strategy<Value = String> {
        "[1-9][0-9]{0,3}"
    }

    /// Distinct ids, in random order.
    pub fn arb_distinct_ids(max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::hash_set(arb_resource_id(), 1..max).prop_map(|set| set.into_iter().collect())
    }

    /// Concrete hat types, including the abstract base.
    pub fn arb_hat_type() -> impl Strategy<Value = &'static str> {
        prop_oneof![Just("hat"), Just("big-hat"), Just("small-hat")]
    }

    /// Scalar JSON attribute values.
    pub fn arb_attribute_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::from),
            "[a-zA-Z ]{0,12}".prop_map(Value::String),
        ]
    }

    /// A permutation of `items`.
    pub fn arb_permutation<T: Clone + std::fmt::Debug>(items: Vec<T>) -> impl Strategy<Value = Vec<T>> {
        Just(items).prop_shuffle()
    }

    /// Valid store configurations.
    pub fn arb_valid_config() -> impl Strategy<Value = StoreConfig> {
        ("[a-z]{1,6}:", 1usize..1024, any::<bool>(), any::<bool>()).prop_map(
            |(prefix, capacity, strict, drop_unknown)| {
                StoreConfig::default()
                    .with_lid_prefix(prefix)
                    .with_notification_capacity(capacity)
                    .with_strict_relationships(strict)
                    .with_drop_unknown_types(drop_unknown)
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Schemas and documents shared by the test suites.

    use super::*;
    use serde_json::json;

    /// Users, polymorphic hats, hobbies, people with reflexive relationships,
    /// pets behind an async inverse, and one-directional tags.
    pub fn app_schemas() -> Vec<TypeSchema> {
        vec![
            TypeSchema::new("user")
                .attr("name")
                .attr("email")
                .relationship(
                    RelationshipSchema::has_many("hats", "hat")
                        .with_inverse("user")
                        .polymorphic(),
                )
                .relationship(RelationshipSchema::has_many("hobbies", "hobby").with_inverse("user")),
            TypeSchema::new("hat")
                .attr("color")
                .relationship(RelationshipSchema::belongs_to("user", "user").with_inverse("hats")),
            TypeSchema::new("big-hat").implements("hat"),
            TypeSchema::new("small-hat").implements("hat").attr("size"),
            TypeSchema::new("hobby")
                .attr("name")
                .relationship(RelationshipSchema::belongs_to("user", "user").with_inverse("hobbies")),
            TypeSchema::new("person")
                .attr("name")
                .relationship(RelationshipSchema::has_many("friends", "person").with_inverse("friends"))
                .relationship(RelationshipSchema::belongs_to("parent", "person").with_inverse("children"))
                .relationship(RelationshipSchema::has_many("children", "person").with_inverse("parent"))
                .relationship(RelationshipSchema::belongs_to("spouse", "person").with_inverse("spouse"))
                .relationship(
                    RelationshipSchema::has_many("pets", "pet")
                        .with_inverse("owner")
                        .with_async(true),
                ),
            TypeSchema::new("pet")
                .attr("name")
                .relationship(RelationshipSchema::belongs_to("owner", "person").with_inverse("pets")),
            TypeSchema::new("post")
                .attr("title")
                .relationship(RelationshipSchema::has_many("tags", "tag")),
            TypeSchema::new("tag").attr("name"),
        ]
    }

    pub fn app_registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::build(app_schemas()).expect("app fixture schemas are valid"))
    }

    /// Planets, villains and minions for the normalization suites.
    pub fn villain_schemas() -> Vec<TypeSchema> {
        vec![
            TypeSchema::new("home-planet").attr("name").relationship(
                RelationshipSchema::has_many("villains", "super-villain").with_inverse("homePlanet"),
            ),
            TypeSchema::new("super-villain")
                .attr("firstName")
                .attr("lastName")
                .relationship(
                    RelationshipSchema::belongs_to("homePlanet", "home-planet").with_inverse("villains"),
                )
                .relationship(RelationshipSchema::belongs_to("secretLab", "secret-lab"))
                .relationship(
                    RelationshipSchema::has_many("evilMinions", "evil-minion").with_inverse("superVillain"),
                ),
            TypeSchema::new("evil-minion").attr("name").relationship(
                RelationshipSchema::belongs_to("superVillain", "super-villain").with_inverse("evilMinions"),
            ),
            TypeSchema::new("secret-lab").attr("minionCapacity").attr("vicinity"),
            TypeSchema::new("comment")
                .attr("body")
                .relationship(RelationshipSchema::belongs_to("root", "comment").with_inverse("children"))
                .relationship(RelationshipSchema::has_many("children", "comment").with_inverse("root")),
        ]
    }

    pub fn villain_registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::build(villain_schemas()).expect("villain fixture schemas are valid"))
    }

    pub fn reference(resource_type: &str, id: &str) -> ResourceReference {
        ResourceReference::new(ResourceType::new(resource_type), id)
    }

    /// `user:1` plus one hat per `(type, id)`, each hat pointing back at the user.
    /// The user itself does not list its hats.
    pub fn user_with_hats(hats: &[(&str, &str)]) -> ResourceDocument {
        let user = ResourceObject::new(ResourceType::new("user"), "1").with_attribute("name", json!("Clemens"));
        let included = hats
            .iter()
            .map(|(hat_type, id)| {
                ResourceObject::new(ResourceType::new(hat_type), *id)
                    .with_one("user", Some(reference("user", "1")))
            })
            .collect();
        ResourceDocument::single(user).with_included(included)
    }

    /// `{data, included}` value for a single user.
    pub fn user_payload(id: &str, name: &str) -> Value {
        json!({
            "data": {"id": id, "type": "user", "attributes": {"name": name}},
            "included": []
        })
    }

    pub fn invalid_name_error() -> RequestError {
        RequestError::Invalid {
            errors: vec![FieldError::for_attribute("name", "is too short")],
        }
    }
}
