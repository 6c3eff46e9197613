//! Error types for quarry operations

use crate::{Identifier, RequestType, ResourceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pointer into a request document identifying the offending member.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorSource {
    pub pointer: String,
}

/// A single field-level validation error, shaped like a JSON:API error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub title: String,
    pub detail: String,
    #[serde(default)]
    pub source: ErrorSource,
}

impl FieldError {
    /// Build an error pointing at `/data/attributes/<attribute>`.
    pub fn for_attribute(attribute: &str, detail: impl Into<String>) -> Self {
        Self {
            title: "Invalid Attribute".to_string(),
            detail: detail.into(),
            source: ErrorSource {
                pointer: format!("/data/attributes/{}", attribute),
            },
        }
    }

    /// Name of the attribute or relationship the pointer addresses, if any.
    ///
    /// `/data/attributes/first-name` and `/data/relationships/owner` both
    /// resolve to their last segment; `/data` resolves to `None` (base error).
    pub fn member(&self) -> Option<&str> {
        let pointer = self.source.pointer.as_str();
        ["/data/attributes/", "/data/relationships/"]
            .iter()
            .find_map(|prefix| pointer.strip_prefix(prefix))
            .filter(|rest| !rest.is_empty())
    }
}

/// Identifier cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Identifier collision: {resource_type}:{id} is claimed by {existing}, cannot assign it to {incoming}")]
    IdentifierCollision {
        resource_type: ResourceType,
        id: String,
        existing: Identifier,
        incoming: Identifier,
    },

    #[error("Unknown identifier: {identifier}")]
    UnknownIdentifier { identifier: Identifier },

    #[error("Identifier {identifier} already has id {current}, cannot reassign to {requested}")]
    IdAlreadyAssigned {
        identifier: Identifier,
        current: String,
        requested: String,
    },
}

/// Schema registry errors, raised while registering resource types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Unknown resource type: {resource_type}")]
    UnknownType { resource_type: ResourceType },

    #[error("Resource type registered twice: {resource_type}")]
    DuplicateType { resource_type: ResourceType },

    #[error("Unknown relationship {name} on {resource_type}")]
    UnknownRelationship {
        resource_type: ResourceType,
        name: String,
    },

    #[error("Unknown attribute {name} on {resource_type}")]
    UnknownAttribute {
        resource_type: ResourceType,
        name: String,
    },

    #[error("Inverse mismatch: {resource_type}.{name} declares inverse {inverse}, which does not point back")]
    InverseMismatch {
        resource_type: ResourceType,
        name: String,
        inverse: String,
    },

    #[error("Type {resource_type} implements itself through {via}")]
    CyclicImplements {
        resource_type: ResourceType,
        via: ResourceType,
    },
}

/// Relationship graph errors. These are assertion failures: they indicate an
/// integration bug, not a recoverable runtime condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Relationship {name} does not belong to either side of any definition for {resource_type}")]
    UnknownRelationship {
        resource_type: ResourceType,
        name: String,
    },

    #[error("Relationship {resource_type}.{name} expected {expected} data")]
    CardinalityMismatch {
        resource_type: ResourceType,
        name: String,
        expected: &'static str,
    },
}

/// Normalization pipeline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Document for {resource_type} has no top-level data member")]
    MissingData { resource_type: ResourceType },

    #[error("Invalid document: {reason}")]
    InvalidDocument { reason: String },

    #[error("Invalid resource object of type {resource_type}: {reason}")]
    InvalidResource {
        resource_type: ResourceType,
        reason: String,
    },

    #[error("Payload key {key} does not name a registered resource type")]
    UnknownType { key: String },
}

/// Errors surfaced by adapter requests and their reconciliation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Record not found: {resource_type}:{id}")]
    NotFound {
        resource_type: ResourceType,
        id: String,
    },

    #[error("Record is invalid: {} field error(s)", .errors.len())]
    Invalid { errors: Vec<FieldError> },

    #[error("Adapter request failed (status {status:?}): {message}")]
    Adapter {
        status: Option<u16>,
        message: String,
    },

    #[error("{request} for {resource_type} succeeded but returned no primary data")]
    MissingPrimaryData {
        resource_type: ResourceType,
        request: RequestType,
    },
}

impl RequestError {
    /// Shorthand for a transport or server failure.
    pub fn adapter(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Adapter {
            status,
            message: message.into(),
        }
    }

    /// True for 422-style validation failures.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }
}

/// Record lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cannot apply {event} to a record in state {from}")]
    InvalidTransition { from: String, event: String },

    #[error("Record {identifier} has been destroyed")]
    RecordDestroyed { identifier: Identifier },

    #[error("No record is loaded for {identifier}")]
    NotLoaded { identifier: Identifier },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Store internals errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Master error type for all quarry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuarryError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Normalize error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl QuarryError {
    /// Borrow the request error, when this is one.
    pub fn as_request(&self) -> Option<&RequestError> {
        match self {
            Self::Request(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for quarry operations.
pub type QuarryResult<T> = Result<T, QuarryError>;

// =============================================================================
// TESTS
// =============================================================================
