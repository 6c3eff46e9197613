//! Relationship payload graph manager.
//!
//! Remote relationship payloads are queued by [`Graph::push`] and applied
//! when something reads them. A read applies only the queued payloads
//! connected to the resource being read, so the inverse of a bulk push is
//! computed per resource as it is asked for. Applying a payload to one side
//! of a definition also writes the complementary membership into the inverse
//! side, so both directions always agree.

use crate::membership::{Entry, LocalDelta, Membership};
use crate::pair::PairStore;
use quarry_core::{
    Cardinality, GraphError, Identifier, PairKey, QuarryResult, RelationshipDefinition,
    ResourceType, SchemaRegistry, Side,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Identifiers a component scan may visit beyond those the queue mentions
/// before it gives up and applies the whole pair.
const COMPONENT_SCAN_SLACK: usize = 64;

/// A relationship whose effective membership changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationshipChange {
    pub identifier: Identifier,
    pub name: String,
}

/// A resource still holding a reference to another one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Retainer {
    pub identifier: Identifier,
    pub name: String,
}

#[derive(Debug, Clone)]
struct PendingPush {
    identifier: Identifier,
    definition: RelationshipDefinition,
    data: Membership,
}

impl PendingPush {
    fn mentioned(&self) -> impl Iterator<Item = &Identifier> {
        std::iter::once(&self.identifier).chain(self.data.as_one()).chain(self.data.as_many())
    }
}

/// Queued payloads of one pair in push order, indexed by every identifier
/// they mention.
#[derive(Debug, Default)]
struct PendingQueue {
    pushes: BTreeMap<u64, PendingPush>,
    mentions: HashMap<Identifier, Vec<u64>>,
}

impl PendingQueue {
    fn insert(&mut self, seq: u64, push: PendingPush) {
        for identifier in push.mentioned() {
            let seqs = self.mentions.entry(identifier.clone()).or_default();
            if seqs.last() != Some(&seq) {
                seqs.push(seq);
            }
        }
        self.pushes.insert(seq, push);
    }

    fn is_empty(&self) -> bool {
        self.pushes.is_empty()
    }

    /// Remove the given pushes, oldest first.
    fn take(&mut self, seqs: &BTreeSet<u64>) -> Vec<PendingPush> {
        let taken: Vec<PendingPush> = seqs.iter().filter_map(|seq| self.pushes.remove(seq)).collect();
        let touched: HashSet<&Identifier> = taken.iter().flat_map(PendingPush::mentioned).collect();
        let pushes = &self.pushes;
        for identifier in touched {
            if let Some(list) = self.mentions.get_mut(identifier) {
                list.retain(|seq| pushes.contains_key(seq));
                if list.is_empty() {
                    self.mentions.remove(identifier);
                }
            }
        }
        taken
    }

    fn drain(&mut self) -> Vec<PendingPush> {
        self.mentions.clear();
        std::mem::take(&mut self.pushes).into_values().collect()
    }
}

type Slot = (PairKey, Side, Identifier);

/// Single source of truth for relationship membership.
#[derive(Debug)]
pub struct Graph {
    registry: Arc<SchemaRegistry>,
    strict: bool,
    pairs: HashMap<PairKey, PairStore>,
    pending: HashMap<PairKey, PendingQueue>,
    next_push: u64,
    /// Slots that have been read through [`Graph::get`].
    observed: HashSet<Slot>,
    touched: HashSet<Slot>,
    before: Vec<(Slot, Option<Membership>)>,
    changes: Vec<(Slot, RelationshipChange)>,
}

impl Graph {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            strict: true,
            pairs: HashMap::new(),
            pending: HashMap::new(),
            next_push: 0,
            observed: HashSet::new(),
            touched: HashSet::new(),
            before: Vec::new(),
            changes: Vec::new(),
        }
    }

    /// Unknown relationship names are errors when strict, skipped otherwise.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    fn definition(
        &self,
        resource_type: &ResourceType,
        name: &str,
    ) -> QuarryResult<RelationshipDefinition> {
        self.registry
            .relationship(resource_type, name)
            .cloned()
            .map_err(|_| {
                GraphError::UnknownRelationship {
                    resource_type: resource_type.clone(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    fn store_for(&mut self, def: &RelationshipDefinition) -> (PairKey, Side) {
        let pair = def.pair_key();
        let store = self
            .pairs
            .entry(pair.clone())
            .or_insert_with(|| PairStore::from_definition(def));
        let side = store.resolve(def.side());
        (pair, side)
    }

    // ========================================================================
    // CHANGE TRACKING
    // ========================================================================

    fn touch(&mut self, pair: &PairKey, side: Side, identifier: &Identifier) {
        let slot = (pair.clone(), side, identifier.clone());
        if self.touched.contains(&slot) {
            return;
        }
        let old = self
            .pairs
            .get_mut(pair)
            .and_then(|store| store.entries_mut(side).get_mut(identifier))
            .map(Entry::effective);
        self.touched.insert(slot.clone());
        self.before.push((slot, old));
    }

    fn finish(&mut self) {
        self.touched.clear();
        for ((pair, side, identifier), old) in std::mem::take(&mut self.before) {
            let Some(store) = self.pairs.get_mut(&pair) else {
                continue;
            };
            let name = store.info(side).key.name.clone();
            let entry = store.entries_mut(side).get_mut(&identifier);
            let new = match entry {
                Some(entry) => {
                    let effective = entry.effective();
                    if old.as_ref() != Some(&effective) {
                        entry.version += 1;
                    }
                    Some(effective)
                }
                None => None,
            };
            if old != new {
                let change = RelationshipChange {
                    identifier: identifier.clone(),
                    name,
                };
                self.changes.push(((pair, side, identifier), change));
            }
        }
    }

    /// Apply every queued payload and drain the relationships whose
    /// effective membership changed.
    pub fn take_changes(&mut self) -> Vec<RelationshipChange> {
        self.flush();
        std::mem::take(&mut self.changes)
            .into_iter()
            .map(|(_, change)| change)
            .collect()
    }

    /// Drain changes to relationships that have been read.
    ///
    /// Only payloads connected to a read relationship are applied; the rest
    /// stay queued.
    pub fn take_observed_changes(&mut self) -> Vec<RelationshipChange> {
        let waiting: Vec<Slot> = self
            .observed
            .iter()
            .filter(|(pair, _, _)| self.pending.contains_key(pair))
            .cloned()
            .collect();
        for (pair, _, identifier) in waiting {
            self.flush_component(&pair, &identifier);
        }
        let observed = &self.observed;
        std::mem::take(&mut self.changes)
            .into_iter()
            .filter(|(slot, _)| observed.contains(slot))
            .map(|(_, change)| change)
            .collect()
    }

    /// Forget recorded changes without applying anything.
    pub fn clear_changes(&mut self) {
        self.changes.clear();
    }

    // ========================================================================
    // REMOTE PAYLOADS
    // ========================================================================

    /// Definition a payload for `resource_type.name` would be applied
    /// through, `None` when a lenient graph would skip it.
    fn accept(
        &self,
        resource_type: &ResourceType,
        name: &str,
        cardinality: Cardinality,
    ) -> QuarryResult<Option<RelationshipDefinition>> {
        let definition = match self.definition(resource_type, name) {
            Ok(def) => def,
            Err(err) if self.strict => return Err(err),
            Err(_) => return Ok(None),
        };
        if definition.cardinality != cardinality {
            return Err(GraphError::CardinalityMismatch {
                resource_type: resource_type.clone(),
                name: name.to_string(),
                expected: definition.cardinality.as_str(),
            }
            .into());
        }
        Ok(Some(definition))
    }

    /// Check a payload without queueing it. `Ok(false)` means it would be skipped.
    pub fn check_push(
        &self,
        resource_type: &ResourceType,
        name: &str,
        cardinality: Cardinality,
    ) -> QuarryResult<bool> {
        Ok(self.accept(resource_type, name, cardinality)?.is_some())
    }

    /// Queue a remote assertion `identifier.name = data`.
    ///
    /// The relationship name and cardinality are checked immediately; the
    /// payload itself is applied when a connected relationship is read.
    pub fn push(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
        data: Membership,
    ) -> QuarryResult<()> {
        let Some(definition) = self.accept(resource_type, name, data.cardinality())? else {
            tracing::warn!(
                resource_type = %resource_type,
                relationship = name,
                "Skipping payload for unknown relationship"
            );
            return Ok(());
        };
        let seq = self.next_push;
        self.next_push += 1;
        self.pending.entry(definition.pair_key()).or_default().insert(
            seq,
            PendingPush {
                identifier: identifier.clone(),
                definition,
                data: data.dedupe(),
            },
        );
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.values().any(|queue| !queue.is_empty())
    }

    /// Apply every queued payload, in push order.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut pushes: Vec<(u64, PendingPush)> = self
            .pending
            .drain()
            .flat_map(|(_, queue)| queue.pushes)
            .collect();
        pushes.sort_by_key(|(seq, _)| *seq);
        tracing::trace!(pushes = pushes.len(), "Flushing relationship payloads");
        self.apply(pushes.into_iter().map(|(_, push)| push));
        self.finish();
    }

    /// Apply every queued payload of one pair.
    fn flush_pair(&mut self, pair: &PairKey) {
        let Some(mut queue) = self.pending.remove(pair) else {
            return;
        };
        let pushes = queue.drain();
        tracing::trace!(pushes = pushes.len(), "Flushing relationship pair");
        self.apply(pushes);
        self.finish();
    }

    /// Apply the queued payloads of `pair` that can affect `identifier`.
    ///
    /// Those are the pushes reachable from `identifier` through identifiers
    /// the pushes mention and members already stored. Pushes outside that
    /// component only touch entries inside it by removing identifiers the
    /// component never holds, so applying it first gives the same result as
    /// applying the whole queue in order.
    fn flush_component(&mut self, pair: &PairKey, identifier: &Identifier) {
        let Some(queue) = self.pending.get(pair) else {
            return;
        };
        let store = self.pairs.get(pair);
        let limit = queue.mentions.len() + COMPONENT_SCAN_SLACK;

        let mut included = BTreeSet::new();
        let mut seen = HashSet::from([identifier.clone()]);
        let mut frontier = vec![identifier.clone()];
        let mut exhausted = false;
        while let Some(current) = frontier.pop() {
            let mut neighbours = Vec::new();
            if let Some(store) = store {
                for side in store.sides() {
                    if let Some(entry) = store.entries(side).get(&current) {
                        neighbours.extend(entry.remote().identifiers());
                    }
                }
            }
            for seq in queue.mentions.get(&current).into_iter().flatten() {
                if included.insert(*seq) {
                    if let Some(push) = queue.pushes.get(seq) {
                        neighbours.extend(push.mentioned().cloned());
                    }
                }
            }
            for neighbour in neighbours {
                if seen.insert(neighbour.clone()) {
                    frontier.push(neighbour);
                }
            }
            if seen.len() > limit {
                exhausted = true;
                break;
            }
        }

        if exhausted {
            self.flush_pair(pair);
            return;
        }
        if included.is_empty() {
            return;
        }
        let Some(queue) = self.pending.get_mut(pair) else {
            return;
        };
        let pushes = queue.take(&included);
        if queue.is_empty() {
            self.pending.remove(pair);
        }
        tracing::trace!(pushes = pushes.len(), "Flushing relationship component");
        self.apply(pushes);
        self.finish();
    }

    fn apply(&mut self, pushes: impl IntoIterator<Item = PendingPush>) {
        for push in pushes {
            let (pair, side) = self.store_for(&push.definition);
            self.replace_remote(&pair, side, &push.identifier, push.data);
        }
    }

    fn replace_remote(&mut self, pair: &PairKey, side: Side, owner: &Identifier, data: Membership) {
        self.touch(pair, side, owner);
        let Some(store) = self.pairs.get_mut(pair) else {
            return;
        };
        let inverse = store.inverse_side(side);
        let entry = store.entry_mut(side, owner);
        entry.asserted = true;
        let old = entry.replace_remote(data.clone());
        entry.normalize_local();

        let Some(inverse) = inverse else {
            return;
        };
        let old_members = old.identifiers();
        let new_members = data.identifiers();
        let old_set: HashSet<&Identifier> = old_members.iter().collect();
        let new_set: HashSet<&Identifier> = new_members.iter().collect();
        for member in old_members.iter().filter(|m| !new_set.contains(m)) {
            self.unlink_remote(pair, inverse, member, owner);
        }
        for member in new_members.iter().filter(|m| !old_set.contains(m)) {
            self.link_remote(pair, inverse, member, owner, side);
        }
    }

    /// Record `owner` in `member`'s inverse entry, displacing a previous to-one value.
    fn link_remote(
        &mut self,
        pair: &PairKey,
        inverse: Side,
        member: &Identifier,
        owner: &Identifier,
        owner_side: Side,
    ) {
        self.touch(pair, inverse, member);
        let Some(store) = self.pairs.get_mut(pair) else {
            return;
        };
        let entry = store.entry_mut(inverse, member);
        let displaced = match entry.remote() {
            Membership::One(Some(previous)) if previous != owner => Some(previous.clone()),
            _ => None,
        };
        entry.insert_remote(owner);
        entry.normalize_local();

        if let Some(previous) = displaced {
            self.touch(pair, owner_side, &previous);
            if let Some(entry) = self
                .pairs
                .get_mut(pair)
                .and_then(|store| store.entries_mut(owner_side).get_mut(&previous))
            {
                entry.remove_remote(member);
                entry.normalize_local();
            }
        }
    }

    fn unlink_remote(&mut self, pair: &PairKey, inverse: Side, member: &Identifier, owner: &Identifier) {
        self.touch(pair, inverse, member);
        if let Some(entry) = self
            .pairs
            .get_mut(pair)
            .and_then(|store| store.entries_mut(inverse).get_mut(member))
        {
            entry.remove_remote(owner);
            entry.normalize_local();
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Effective membership of `identifier.name`, or `None` when neither side
    /// has ever said anything about it.
    ///
    /// The relationship counts as observed from now on, so its later changes
    /// are reported by [`Graph::take_observed_changes`].
    pub fn get(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
    ) -> QuarryResult<Option<Membership>> {
        let def = self.definition(resource_type, name)?;
        let (pair, side) = self.store_for(&def);
        self.flush_component(&pair, identifier);

        let slot = (pair.clone(), side, identifier.clone());
        if self.observed.insert(slot.clone()) {
            self.changes.retain(|(changed, _)| changed != &slot);
        }
        Ok(self
            .pairs
            .get_mut(&pair)
            .and_then(|store| store.entries_mut(side).get_mut(identifier))
            .map(Entry::effective))
    }

    /// Last confirmed server membership.
    pub fn get_remote(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
    ) -> QuarryResult<Option<Membership>> {
        let def = self.definition(resource_type, name)?;
        let (pair, side) = self.store_for(&def);
        self.flush_component(&pair, identifier);
        Ok(self
            .pairs
            .get(&pair)
            .and_then(|store| store.entries(side).get(identifier))
            .map(|e| e.remote().clone()))
    }

    /// Change counter of one relationship entry; unchanged by no-op pushes.
    pub fn version(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
    ) -> QuarryResult<u64> {
        let def = self.definition(resource_type, name)?;
        let (pair, side) = self.store_for(&def);
        self.flush_component(&pair, identifier);
        Ok(self
            .pairs
            .get(&pair)
            .and_then(|store| store.entries(side).get(identifier))
            .map(|e| e.version)
            .unwrap_or(0))
    }

    /// Effective membership of every known relationship of a resource.
    pub fn local_state(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
    ) -> BTreeMap<String, Membership> {
        let defs: Vec<_> = self.registry.relationships_of(resource_type).cloned().collect();
        let mut state = BTreeMap::new();
        for def in defs {
            let pair = def.pair_key();
            self.flush_component(&pair, identifier);
            if let Some(store) = self.pairs.get_mut(&pair) {
                let side = store.resolve(def.side());
                if let Some(entry) = store.entries_mut(side).get_mut(identifier) {
                    state.insert(def.name().to_string(), entry.effective());
                }
            }
        }
        state
    }

    pub fn has_local_changes(&mut self, identifier: &Identifier, resource_type: &ResourceType) -> bool {
        let defs: Vec<_> = self.registry.relationships_of(resource_type).cloned().collect();
        defs.iter().any(|def| {
            let pair = def.pair_key();
            self.flush_component(&pair, identifier);
            self.pairs
                .get(&pair)
                .and_then(|store| store.entries(store.resolve(def.side())).get(identifier))
                .map_or(false, |entry| entry.local.is_some())
        })
    }

    /// Resources whose relationships still reference `identifier`.
    pub fn retainers(&mut self, identifier: &Identifier) -> Vec<Retainer> {
        self.flush();
        let mut retainers = Vec::new();
        for store in self.pairs.values_mut() {
            for side in store.sides() {
                let name = store.info(side).key.name.clone();
                for (owner, entry) in store.entries_mut(side).iter_mut() {
                    if owner == identifier {
                        continue;
                    }
                    if entry.remote_contains(identifier) || entry.effective().contains(identifier) {
                        retainers.push(Retainer {
                            identifier: owner.clone(),
                            name: name.clone(),
                        });
                    }
                }
            }
        }
        retainers
    }

    // ========================================================================
    // LOCAL MUTATIONS
    // ========================================================================

    fn expect_cardinality(
        def: &RelationshipDefinition,
        resource_type: &ResourceType,
        cardinality: Cardinality,
    ) -> QuarryResult<()> {
        if def.cardinality != cardinality {
            return Err(GraphError::CardinalityMismatch {
                resource_type: resource_type.clone(),
                name: def.name().to_string(),
                expected: def.cardinality.as_str(),
            }
            .into());
        }
        Ok(())
    }

    fn current(&mut self, pair: &PairKey, side: Side, identifier: &Identifier) -> Option<Membership> {
        self.pairs
            .get_mut(pair)
            .and_then(|store| store.entries_mut(side).get_mut(identifier))
            .map(Entry::effective)
    }

    fn local_link(&mut self, pair: &PairKey, side: Side, owner: &Identifier, member: &Identifier) {
        self.touch(pair, side, owner);
        let Some(store) = self.pairs.get_mut(pair) else {
            return;
        };
        let inverse = store.inverse_side(side);
        let entry = store.entry_mut(side, owner);
        entry.asserted = true;
        entry.local_add(member);

        let Some(inverse) = inverse else {
            return;
        };
        self.touch(pair, inverse, member);
        let Some(store) = self.pairs.get_mut(pair) else {
            return;
        };
        let entry = store.entry_mut(inverse, member);
        let displaced = match entry.effective() {
            Membership::One(Some(previous)) if &previous != owner => Some(previous),
            _ => None,
        };
        entry.local_add(owner);

        if let Some(previous) = displaced {
            self.touch(pair, side, &previous);
            if let Some(entry) = self
                .pairs
                .get_mut(pair)
                .and_then(|store| store.entries_mut(side).get_mut(&previous))
            {
                entry.local_remove(member);
            }
        }
    }

    fn local_unlink(&mut self, pair: &PairKey, side: Side, owner: &Identifier, member: &Identifier) {
        self.touch(pair, side, owner);
        let Some(store) = self.pairs.get_mut(pair) else {
            return;
        };
        let inverse = store.inverse_side(side);
        let entry = store.entry_mut(side, owner);
        entry.asserted = true;
        entry.local_remove(member);

        if let Some(inverse) = inverse {
            self.touch(pair, inverse, member);
            if let Some(entry) = self
                .pairs
                .get_mut(pair)
                .and_then(|store| store.entries_mut(inverse).get_mut(member))
            {
                entry.local_remove(owner);
            }
        }
    }

    /// Append `member` to a to-many relationship; the inverse sees it at once.
    pub fn add_to_many(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
        member: &Identifier,
    ) -> QuarryResult<()> {
        let def = self.definition(resource_type, name)?;
        Self::expect_cardinality(&def, resource_type, Cardinality::Many)?;
        self.flush_pair(&def.pair_key());
        let (pair, side) = self.store_for(&def);
        self.local_link(&pair, side, identifier, member);
        self.finish();
        Ok(())
    }

    pub fn remove_from_many(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
        member: &Identifier,
    ) -> QuarryResult<()> {
        let def = self.definition(resource_type, name)?;
        Self::expect_cardinality(&def, resource_type, Cardinality::Many)?;
        self.flush_pair(&def.pair_key());
        let (pair, side) = self.store_for(&def);
        self.local_unlink(&pair, side, identifier, member);
        self.finish();
        Ok(())
    }

    /// Replace a to-many relationship's members locally.
    pub fn replace_many(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
        members: &[Identifier],
    ) -> QuarryResult<()> {
        let def = self.definition(resource_type, name)?;
        Self::expect_cardinality(&def, resource_type, Cardinality::Many)?;
        self.flush_pair(&def.pair_key());
        let (pair, side) = self.store_for(&def);
        let current = self
            .current(&pair, side, identifier)
            .map(|m| m.identifiers())
            .unwrap_or_default();
        for existing in current.iter().filter(|m| !members.contains(m)) {
            self.local_unlink(&pair, side, identifier, existing);
        }
        for member in members {
            self.local_link(&pair, side, identifier, member);
        }
        // An explicit empty list still counts as an assertion.
        if let Some(store) = self.pairs.get_mut(&pair) {
            store.entry_mut(side, identifier).asserted = true;
        }
        self.finish();
        Ok(())
    }

    /// Set a to-one relationship locally.
    pub fn set_one(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
        member: Option<&Identifier>,
    ) -> QuarryResult<()> {
        let def = self.definition(resource_type, name)?;
        Self::expect_cardinality(&def, resource_type, Cardinality::One)?;
        self.flush_pair(&def.pair_key());
        let (pair, side) = self.store_for(&def);
        let current = self
            .current(&pair, side, identifier)
            .and_then(|m| m.as_one().cloned());
        if current.as_ref() == member {
            return Ok(());
        }
        if let Some(previous) = &current {
            self.local_unlink(&pair, side, identifier, previous);
        }
        match member {
            Some(member) => self.local_link(&pair, side, identifier, member),
            None => {
                if let Some(store) = self.pairs.get_mut(&pair) {
                    store.entry_mut(side, identifier).asserted = true;
                }
            }
        }
        self.finish();
        Ok(())
    }

    /// Promote a saved snapshot of local state into remote state.
    ///
    /// Changes made after `saved` was taken stay local.
    pub fn commit_local(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        saved: &BTreeMap<String, Membership>,
    ) -> QuarryResult<()> {
        for (name, membership) in saved {
            let def = self.definition(resource_type, name)?;
            let (pair, side) = self.store_for(&def);
            self.flush_pair(&pair);
            let now = self
                .current(&pair, side, identifier)
                .unwrap_or_else(|| Membership::empty(def.cardinality));

            self.replace_remote(&pair, side, identifier, membership.clone());

            let Some(store) = self.pairs.get_mut(&pair) else {
                continue;
            };
            let inverse = store.inverse_side(side);
            let entry = store.entry_mut(side, identifier);
            entry.local = LocalDelta::between(entry.remote(), &now);
            entry.normalize_local();

            if let Some(inverse) = inverse {
                let mut related = now.identifiers();
                related.extend(membership.identifiers());
                for member in related {
                    if let Some(entry) = store.entries_mut(inverse).get_mut(&member) {
                        entry.normalize_local();
                    }
                }
            }
        }
        self.finish();
        Ok(())
    }

    /// Discard local relationship changes of a resource, on both sides.
    pub fn rollback_local(&mut self, identifier: &Identifier, resource_type: &ResourceType) {
        let defs: Vec<_> = self.registry.relationships_of(resource_type).cloned().collect();
        for def in defs {
            let pair = def.pair_key();
            self.flush_pair(&pair);
            let Some(store) = self.pairs.get(&pair) else {
                continue;
            };
            let side = store.resolve(def.side());
            let inverse = store.inverse_side(side);
            let mentioned = match store.entries(side).get(identifier).and_then(|e| e.local.as_ref()) {
                Some(local) => local.mentioned(),
                None => continue,
            };
            let remote_one = store
                .entries(side)
                .get(identifier)
                .and_then(|e| e.remote().as_one().cloned());

            self.touch(&pair, side, identifier);
            if let Some(entry) = self
                .pairs
                .get_mut(&pair)
                .and_then(|store| store.entries_mut(side).get_mut(identifier))
            {
                entry.local = None;
                entry.invalidate();
            }

            let Some(inverse) = inverse else {
                continue;
            };
            for member in mentioned.into_iter().chain(remote_one) {
                self.touch(&pair, inverse, &member);
                if let Some(entry) = self
                    .pairs
                    .get_mut(&pair)
                    .and_then(|store| store.entries_mut(inverse).get_mut(&member))
                {
                    entry.forget_local(identifier);
                }
            }
        }
        self.finish();
    }

    // ========================================================================
    // UNLOADING
    // ========================================================================

    /// Drop one side's contribution to a relationship.
    ///
    /// Inverse entries that were only derived from this side lose the
    /// reference (and disappear when empty); inverse entries that were
    /// asserted independently keep their data.
    pub fn unload(
        &mut self,
        identifier: &Identifier,
        resource_type: &ResourceType,
        name: &str,
    ) -> QuarryResult<()> {
        let def = self.definition(resource_type, name)?;
        let pair = def.pair_key();
        self.flush_pair(&pair);
        let Some(store) = self.pairs.get(&pair) else {
            return Ok(());
        };
        let side = store.resolve(def.side());
        self.drop_entry(&pair, side, identifier, |asserted| !asserted);
        self.finish();
        Ok(())
    }

    /// Detach a resource from every relationship it owns.
    ///
    /// Inverses declared async keep their reference to the unloaded resource
    /// so it can be re-fetched; sync inverses lose it. With `hard` set, every
    /// reference is removed regardless.
    pub fn unload_record(&mut self, identifier: &Identifier, resource_type: &ResourceType, hard: bool) {
        let defs: Vec<_> = self.registry.relationships_of(resource_type).cloned().collect();
        for def in defs {
            let pair = def.pair_key();
            self.flush_pair(&pair);
            let Some(store) = self.pairs.get(&pair) else {
                continue;
            };
            let side = store.resolve(def.side());
            let retain = !hard
                && store
                    .inverse_side(side)
                    .map_or(false, |inverse| store.info(inverse).is_async);
            self.drop_entry(&pair, side, identifier, |_| !retain);
        }
        if hard {
            self.remove_everywhere(identifier);
        }
        self.finish();
    }

    /// Remove `identifier` from every relationship in the graph.
    pub fn remove_everywhere(&mut self, identifier: &Identifier) {
        self.flush();
        let mut slots = Vec::new();
        for (pair, store) in &self.pairs {
            for side in store.sides() {
                for (owner, entry) in store.entries(side) {
                    if owner == identifier
                        || entry.remote_contains(identifier)
                        || entry.compute_effective().contains(identifier)
                    {
                        slots.push((pair.clone(), side, owner.clone()));
                    }
                }
            }
        }
        for (pair, side, owner) in slots {
            self.touch(&pair, side, &owner);
            let Some(store) = self.pairs.get_mut(&pair) else {
                continue;
            };
            let entries = store.entries_mut(side);
            if &owner == identifier {
                entries.remove(&owner);
                self.observed.remove(&(pair, side, owner));
            } else if let Some(entry) = entries.get_mut(&owner) {
                entry.forget(identifier);
            }
        }
        self.finish();
    }

    /// Remove an entry and, for each member, its reference back when
    /// `clear_inverse(asserted)` says so.
    fn drop_entry<F>(&mut self, pair: &PairKey, side: Side, identifier: &Identifier, clear_inverse: F)
    where
        F: Fn(bool) -> bool,
    {
        self.touch(pair, side, identifier);
        let Some(store) = self.pairs.get_mut(pair) else {
            return;
        };
        let inverse = store.inverse_side(side);
        let Some(mut removed) = store.entries_mut(side).remove(identifier) else {
            return;
        };
        self.observed.remove(&(pair.clone(), side, identifier.clone()));
        let Some(inverse) = inverse else {
            return;
        };
        let mut members = removed.effective().identifiers();
        for member in removed.remote().identifiers() {
            if !members.contains(&member) {
                members.push(member);
            }
        }
        for member in members.iter().filter(|m| *m != identifier) {
            self.touch(pair, inverse, member);
            let Some(store) = self.pairs.get_mut(pair) else {
                continue;
            };
            let entries = store.entries_mut(inverse);
            let Some(entry) = entries.get_mut(member) else {
                continue;
            };
            if !clear_inverse(entry.asserted) {
                continue;
            }
            entry.forget(identifier);
            if !entry.asserted && entry.is_vacant() {
                entries.remove(member);
            }
        }
    }
}
