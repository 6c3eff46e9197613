//! Live record arrays.

use crate::record::Record;
use crate::store::Store;
use quarry_core::{QuarryResult, RecordState, ResourceType};

/// Every live record of a type (subtypes included), in materialization order.
///
/// The array is a query, not a copy: records pushed, created or unloaded
/// after it was obtained show up on the next read.
#[derive(Clone, Debug)]
pub struct RecordArray {
    store: Store,
    resource_type: ResourceType,
}

impl RecordArray {
    pub(crate) fn new(store: Store, resource_type: ResourceType) -> Self {
        Self {
            store,
            resource_type,
        }
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    pub fn records(&self) -> QuarryResult<Vec<Record>> {
        let state = self.store.read()?;
        let registry = self.store.registry();
        Ok(state
            .live()
            .filter(|(_, data)| {
                registry.is_a(&data.resource_type, &self.resource_type)
                    && data.state.is_loaded()
                    && data.state != RecordState::DeletedSaved
            })
            .filter_map(|(identifier, _)| self.store.handle(&state, identifier))
            .collect())
    }

    pub fn ids(&self) -> QuarryResult<Vec<String>> {
        Ok(self.records()?.iter().filter_map(Record::id).collect())
    }

    pub fn len(&self) -> QuarryResult<usize> {
        Ok(self.records()?.len())
    }

    pub fn is_empty(&self) -> QuarryResult<bool> {
        Ok(self.records()?.is_empty())
    }

    pub fn contains(&self, record: &Record) -> QuarryResult<bool> {
        Ok(self.records()?.contains(record))
    }
}
