//! Quarry Core - Shared Types
//!
//! Identifiers, the schema registry, the canonical resource document, record
//! snapshots, the adapter/serializer contracts and the error taxonomy. Every
//! other quarry crate depends on this one.

pub mod adapter;
pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod inflector;
pub mod lifecycle;
pub mod schema;
pub mod serializer;
pub mod snapshot;

pub use adapter::{single_adapter, Adapter, AdapterResolver, RequestType};
pub use config::StoreConfig;
pub use document::{
    PrimaryData, RelationshipData, RelationshipObject, ResourceDocument, ResourceObject,
    ResourceReference,
};
pub use error::{
    ConfigError, ErrorSource, FieldError, GraphError, IdentityError, LifecycleError,
    NormalizeError, QuarryError, QuarryResult, RequestError, SchemaError, StoreError,
};
pub use identity::{new_lid, Identifier, IdentifierCache, IdentifierRecord, DEFAULT_LID_PREFIX};
pub use lifecycle::{RecordEvent, RecordState};
pub use schema::{
    AttributeSchema, Cardinality, InverseDefinition, PairKey, RelationshipDefinition,
    RelationshipKey, RelationshipSchema, ResourceType, SchemaRegistry, Side, TypeSchema,
};
pub use serializer::{
    single_serializer, NormalizeContext, SerializeOptions, Serializer, SerializerResolver,
};
pub use snapshot::{AttributeChange, RelatedSnapshot, RelationshipSnapshot, Snapshot};
