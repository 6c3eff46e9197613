//! Quarry Store - Identity-Mapped Record Cache
//!
//! The [`Store`] ties the pieces together: identifiers from `quarry-core`,
//! relationship state from `quarry-graph`, payload normalization from
//! `quarry-normalize`. It owns the record lifecycle, local edits and the save
//! orchestration, and publishes every observable change as a
//! [`Notification`].
//!
//! Cache operations are synchronous. Requests (`find_*`, `reload*`, `save`)
//! are async and only hold the store lock while preparing and applying.

mod array;
mod errors;
mod notification;
mod record;
mod request;
mod state;
mod store;

pub use array::RecordArray;
pub use errors::RecordErrors;
pub use notification::{Notification, Notifier};
pub use record::{ManyView, Record};
pub use store::{Store, StoreBuilder};

pub use quarry_core::{
    Identifier, QuarryError, QuarryResult, RecordState, ResourceDocument, ResourceType,
    SchemaRegistry, StoreConfig,
};
