//! Payload store shared by a relationship and its inverse.

use crate::membership::Entry;
use quarry_core::{Cardinality, Identifier, RelationshipDefinition, RelationshipKey, Side};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) struct SideInfo {
    pub(crate) key: RelationshipKey,
    pub(crate) cardinality: Cardinality,
    pub(crate) is_async: bool,
}

/// Both halves of one relationship definition.
///
/// A reflexive pair (`person.friends <-> person.friends`) keeps a single
/// entry map; every write lands on the left side.
#[derive(Debug)]
pub(crate) struct PairStore {
    lhs: SideInfo,
    rhs: Option<SideInfo>,
    reflexive: bool,
    lhs_entries: HashMap<Identifier, Entry>,
    rhs_entries: HashMap<Identifier, Entry>,
}

impl PairStore {
    pub(crate) fn from_definition(def: &RelationshipDefinition) -> Self {
        let own = SideInfo {
            key: def.key.clone(),
            cardinality: def.cardinality,
            is_async: def.is_async,
        };
        let inverse = def.inverse.as_ref().map(|inv| SideInfo {
            key: inv.key.clone(),
            cardinality: inv.cardinality,
            is_async: inv.is_async,
        });
        let pair = def.pair_key();
        let reflexive = pair.is_reflexive();
        let (lhs, rhs) = match (def.side(), inverse) {
            (Side::Rhs, Some(inverse)) => (inverse, Some(own)),
            (_, inverse) => (own, inverse),
        };
        Self {
            lhs,
            rhs,
            reflexive,
            lhs_entries: HashMap::new(),
            rhs_entries: HashMap::new(),
        }
    }

    /// The side entries for `side` are actually stored on.
    pub(crate) fn resolve(&self, side: Side) -> Side {
        if self.reflexive || self.rhs.is_none() {
            Side::Lhs
        } else {
            side
        }
    }

    pub(crate) fn inverse_side(&self, side: Side) -> Option<Side> {
        self.rhs.as_ref()?;
        Some(self.resolve(side.opposite()))
    }

    pub(crate) fn info(&self, side: Side) -> &SideInfo {
        match (side, &self.rhs) {
            (Side::Rhs, Some(rhs)) => rhs,
            _ => &self.lhs,
        }
    }

    pub(crate) fn sides(&self) -> Vec<Side> {
        if self.reflexive || self.rhs.is_none() {
            vec![Side::Lhs]
        } else {
            vec![Side::Lhs, Side::Rhs]
        }
    }

    pub(crate) fn entries(&self, side: Side) -> &HashMap<Identifier, Entry> {
        match self.resolve(side) {
            Side::Lhs => &self.lhs_entries,
            Side::Rhs => &self.rhs_entries,
        }
    }

    pub(crate) fn entries_mut(&mut self, side: Side) -> &mut HashMap<Identifier, Entry> {
        match self.resolve(side) {
            Side::Lhs => &mut self.lhs_entries,
            Side::Rhs => &mut self.rhs_entries,
        }
    }

    /// Entry for `identifier`, created empty (and not asserted) if missing.
    pub(crate) fn entry_mut(&mut self, side: Side, identifier: &Identifier) -> &mut Entry {
        let cardinality = self.info(self.resolve(side)).cardinality;
        self.entries_mut(side)
            .entry(identifier.clone())
            .or_insert_with(|| Entry::new(cardinality, false))
    }
}
