//! Serializer contract: wire payload to canonical document and back.

use crate::{QuarryResult, RequestType, ResourceDocument, ResourceType, SchemaRegistry, Snapshot};
use serde_json::Value;
use std::sync::Arc;

/// What a normalizer needs from the store that called it.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub registry: &'a SchemaRegistry,
    /// Drop resources of unregistered types with a warning instead of failing.
    pub drop_unknown_types: bool,
}

impl<'a> NormalizeContext<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            drop_unknown_types: true,
        }
    }

    pub fn with_drop_unknown_types(mut self, drop: bool) -> Self {
        self.drop_unknown_types = drop;
        self
    }
}

/// Options for the serialize direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerializeOptions {
    pub include_id: bool,
}

impl SerializeOptions {
    pub fn with_id() -> Self {
        Self { include_id: true }
    }
}

/// Normalization strategy.
pub trait Serializer: Send + Sync {
    /// Convert a raw response into the canonical document.
    fn normalize_response(
        &self,
        ctx: &NormalizeContext<'_>,
        primary_type: &ResourceType,
        payload: Value,
        id: Option<&str>,
        request: RequestType,
    ) -> QuarryResult<ResourceDocument>;

    /// Convert a snapshot into a request body (no root key).
    fn serialize(
        &self,
        registry: &SchemaRegistry,
        snapshot: &Snapshot,
        options: &SerializeOptions,
    ) -> QuarryResult<Value>;

    /// Serialize into a complete request document.
    fn serialize_into_document(
        &self,
        registry: &SchemaRegistry,
        snapshot: &Snapshot,
        options: &SerializeOptions,
    ) -> QuarryResult<Value> {
        self.serialize(registry, snapshot, options)
    }
}

/// Resolves the serializer for a resource type. Passed to the store at construction.
pub type SerializerResolver = Arc<dyn Fn(&ResourceType) -> Arc<dyn Serializer> + Send + Sync>;

/// Resolver that hands out one serializer for every type.
pub fn single_serializer(serializer: Arc<dyn Serializer>) -> SerializerResolver {
    Arc::new(move |_| serializer.clone())
}
