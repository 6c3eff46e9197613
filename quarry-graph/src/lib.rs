//! Quarry Graph - Relationship Payload Graph Manager
//!
//! Owns every declared relationship's membership. Each relationship and its
//! inverse share one payload store keyed by an unordered [`PairKey`], so a
//! write from either direction updates the same structure and both sides
//! stay consistent.
//!
//! [`PairKey`]: quarry_core::PairKey

mod graph;
mod membership;
mod pair;

pub use graph::{Graph, RelationshipChange, Retainer};
pub use membership::Membership;
