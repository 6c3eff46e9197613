//! Adapter contract: the transport collaborator the store talks to.
//!
//! Adapters return raw wire payloads. The store runs every payload through
//! the serializer resolved for the primary type before touching the cache.

use crate::{RequestError, ResourceType, Snapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of request a payload answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    FindRecord,
    FindMany,
    FindAll,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::FindRecord => "findRecord",
            RequestType::FindMany => "findMany",
            RequestType::FindAll => "findAll",
            RequestType::CreateRecord => "createRecord",
            RequestType::UpdateRecord => "updateRecord",
            RequestType::DeleteRecord => "deleteRecord",
        }
    }

    /// Requests whose primary data is expected to be a single resource.
    pub fn is_single(&self) -> bool {
        !matches!(self, RequestType::FindMany | RequestType::FindAll)
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RequestType::CreateRecord | RequestType::UpdateRecord | RequestType::DeleteRecord
        )
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "findRecord" => Ok(RequestType::FindRecord),
            "findMany" => Ok(RequestType::FindMany),
            "findAll" => Ok(RequestType::FindAll),
            "createRecord" => Ok(RequestType::CreateRecord),
            "updateRecord" => Ok(RequestType::UpdateRecord),
            "deleteRecord" => Ok(RequestType::DeleteRecord),
            _ => Err(format!("Unknown request type: {}", s)),
        }
    }
}

/// Transport collaborator.
///
/// Validation failures must be reported as [`RequestError::Invalid`];
/// anything else is treated as a retryable adapter failure.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn find_record(&self, resource_type: &ResourceType, id: &str) -> Result<Value, RequestError>;

    async fn find_many(&self, resource_type: &ResourceType, ids: &[String]) -> Result<Value, RequestError>;

    async fn find_all(&self, resource_type: &ResourceType) -> Result<Value, RequestError> {
        Err(RequestError::adapter(
            None,
            format!("findAll is not supported for {}", resource_type),
        ))
    }

    /// `body` is the serializer's output for `snapshot`.
    async fn create_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
        body: &Value,
    ) -> Result<Option<Value>, RequestError>;

    async fn update_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
        body: &Value,
    ) -> Result<Option<Value>, RequestError>;

    async fn delete_record(
        &self,
        resource_type: &ResourceType,
        snapshot: &Snapshot,
    ) -> Result<Option<Value>, RequestError>;
}

/// Resolves the adapter for a resource type. Passed to the store at construction.
pub type AdapterResolver = Arc<dyn Fn(&ResourceType) -> Arc<dyn Adapter> + Send + Sync>;

/// Resolver that hands out one adapter for every type.
pub fn single_adapter(adapter: Arc<dyn Adapter>) -> AdapterResolver {
    Arc::new(move |_| adapter.clone())
}
