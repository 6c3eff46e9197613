//! Quarry Normalize - Wire Payload Normalizers
//!
//! Three [`Serializer`](quarry_core::Serializer) strategies sharing one output
//! contract, the canonical `{data, included}` document:
//!
//! - [`JsonApiSerializer`]: already `{data, included}`; keys and type names
//!   are translated.
//! - [`RestSerializer`]: flat hashes under pluralized root keys, with
//!   `_`-prefixed sideloads.
//! - [`EmbeddedRecords`]: composed into a [`RestSerializer`] to lift embedded
//!   bodies into `included`.

mod builder;
mod embedded;
mod json_api;
mod keys;
mod rest;

pub use builder::{coerce_id, type_from_key, IncludedSet};
pub use embedded::{EmbedMode, EmbedOption, EmbeddedRecords};
pub use json_api::JsonApiSerializer;
pub use keys::{FieldKey, FieldKind, KeyMap, KeyStyle};
pub use rest::RestSerializer;
