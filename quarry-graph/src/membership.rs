//! Relationship membership and per-resource entries.

use quarry_core::{Cardinality, Identifier};
use std::collections::HashSet;

/// Related identifiers of one relationship for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    One(Option<Identifier>),
    Many(Vec<Identifier>),
}

impl Membership {
    pub fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::One => Membership::One(None),
            Cardinality::Many => Membership::Many(Vec::new()),
        }
    }

    pub fn cardinality(&self) -> Cardinality {
        match self {
            Membership::One(_) => Cardinality::One,
            Membership::Many(_) => Cardinality::Many,
        }
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        match self {
            Membership::One(member) => member.as_ref() == Some(identifier),
            Membership::Many(members) => members.contains(identifier),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Membership::One(member) => member.is_none(),
            Membership::Many(members) => members.is_empty(),
        }
    }

    pub fn identifiers(&self) -> Vec<Identifier> {
        match self {
            Membership::One(member) => member.iter().cloned().collect(),
            Membership::Many(members) => members.clone(),
        }
    }

    pub fn as_one(&self) -> Option<&Identifier> {
        match self {
            Membership::One(member) => member.as_ref(),
            Membership::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> &[Identifier] {
        match self {
            Membership::Many(members) => members,
            Membership::One(_) => &[],
        }
    }

    /// Drop repeated members, keeping first occurrences in order.
    pub(crate) fn dedupe(self) -> Self {
        match self {
            Membership::Many(members) => {
                let mut seen = HashSet::with_capacity(members.len());
                let out = members
                    .into_iter()
                    .filter(|member| seen.insert(member.clone()))
                    .collect();
                Membership::Many(out)
            }
            one => one,
        }
    }
}

/// Local, unconfirmed changes layered over the remote membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LocalDelta {
    Many {
        added: Vec<Identifier>,
        removed: Vec<Identifier>,
    },
    One(Option<Identifier>),
}

impl LocalDelta {
    /// Delta that turns `remote` into `target`.
    pub(crate) fn between(remote: &Membership, target: &Membership) -> Option<Self> {
        match (remote, target) {
            (Membership::Many(remote), Membership::Many(target)) => {
                let remote_set: HashSet<&Identifier> = remote.iter().collect();
                let target_set: HashSet<&Identifier> = target.iter().collect();
                let added: Vec<_> = target.iter().filter(|m| !remote_set.contains(m)).cloned().collect();
                let removed: Vec<_> = remote.iter().filter(|m| !target_set.contains(m)).cloned().collect();
                if added.is_empty() && removed.is_empty() {
                    None
                } else {
                    Some(LocalDelta::Many { added, removed })
                }
            }
            (Membership::One(remote), Membership::One(target)) if remote != target => {
                Some(LocalDelta::One(target.clone()))
            }
            _ => None,
        }
    }

    /// Every identifier this delta mentions.
    pub(crate) fn mentioned(&self) -> Vec<Identifier> {
        match self {
            LocalDelta::Many { added, removed } => added.iter().chain(removed.iter()).cloned().collect(),
            LocalDelta::One(member) => member.iter().cloned().collect(),
        }
    }
}

/// One resource's side of one relationship.
///
/// To-many remote members keep an index next to the ordered list, so
/// membership checks stay constant time while inverse pushes pile up on one
/// owner.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    remote: Membership,
    index: HashSet<Identifier>,
    pub(crate) local: Option<LocalDelta>,
    /// Set when this side was told directly, not only derived from the inverse.
    pub(crate) asserted: bool,
    pub(crate) version: u64,
    cached: Option<Membership>,
}

impl Entry {
    pub(crate) fn new(cardinality: Cardinality, asserted: bool) -> Self {
        Self {
            remote: Membership::empty(cardinality),
            index: HashSet::new(),
            local: None,
            asserted,
            version: 0,
            cached: None,
        }
    }

    pub(crate) fn remote(&self) -> &Membership {
        &self.remote
    }

    pub(crate) fn remote_contains(&self, member: &Identifier) -> bool {
        match &self.remote {
            Membership::One(current) => current.as_ref() == Some(member),
            Membership::Many(_) => self.index.contains(member),
        }
    }

    /// Swap in a new remote membership, returning the previous one.
    pub(crate) fn replace_remote(&mut self, remote: Membership) -> Membership {
        self.index = match &remote {
            Membership::Many(members) => members.iter().cloned().collect(),
            Membership::One(_) => HashSet::new(),
        };
        self.cached = None;
        std::mem::replace(&mut self.remote, remote)
    }

    pub(crate) fn insert_remote(&mut self, member: &Identifier) {
        self.cached = None;
        match &mut self.remote {
            Membership::One(current) => *current = Some(member.clone()),
            Membership::Many(members) => {
                if self.index.insert(member.clone()) {
                    members.push(member.clone());
                }
            }
        }
    }

    pub(crate) fn remove_remote(&mut self, member: &Identifier) {
        match &mut self.remote {
            Membership::One(current) => {
                if current.as_ref() == Some(member) {
                    *current = None;
                    self.cached = None;
                }
            }
            Membership::Many(members) => {
                if self.index.remove(member) {
                    members.retain(|m| m != member);
                    self.cached = None;
                }
            }
        }
    }

    /// `remote ⊕ local`, memoized until the next mutation.
    pub(crate) fn effective(&mut self) -> Membership {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        let computed = self.compute_effective();
        self.cached = Some(computed.clone());
        computed
    }

    pub(crate) fn compute_effective(&self) -> Membership {
        match (&self.remote, &self.local) {
            (remote, None) => remote.clone(),
            (Membership::Many(remote), Some(LocalDelta::Many { added, removed })) => {
                let removed: HashSet<&Identifier> = removed.iter().collect();
                let mut members: Vec<Identifier> = remote
                    .iter()
                    .filter(|m| !removed.contains(m))
                    .cloned()
                    .collect();
                members.extend(added.iter().filter(|m| !self.index.contains(*m)).cloned());
                Membership::Many(members)
            }
            (Membership::One(_), Some(LocalDelta::One(member))) => Membership::One(member.clone()),
            (remote, Some(_)) => remote.clone(),
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Add `member` locally.
    pub(crate) fn local_add(&mut self, member: &Identifier) {
        let current = self.compute_effective();
        match current {
            Membership::One(_) => self.local = Some(LocalDelta::One(Some(member.clone()))),
            Membership::Many(members) => {
                if members.contains(member) {
                    return;
                }
                let (mut added, mut removed) = match self.local.take() {
                    Some(LocalDelta::Many { added, removed }) => (added, removed),
                    _ => (Vec::new(), Vec::new()),
                };
                if removed.contains(member) {
                    removed.retain(|m| m != member);
                } else {
                    added.push(member.clone());
                }
                self.local = Some(LocalDelta::Many { added, removed });
            }
        }
        self.normalize_local();
    }

    /// Remove `member` locally.
    pub(crate) fn local_remove(&mut self, member: &Identifier) {
        let current = self.compute_effective();
        if !current.contains(member) {
            return;
        }
        match current {
            Membership::One(_) => self.local = Some(LocalDelta::One(None)),
            Membership::Many(_) => {
                let (mut added, mut removed) = match self.local.take() {
                    Some(LocalDelta::Many { added, removed }) => (added, removed),
                    _ => (Vec::new(), Vec::new()),
                };
                added.retain(|m| m != member);
                if self.remote_contains(member) && !removed.contains(member) {
                    removed.push(member.clone());
                }
                self.local = Some(LocalDelta::Many { added, removed });
            }
        }
        self.normalize_local();
    }

    /// Drop delta parts the remote state already satisfies.
    pub(crate) fn normalize_local(&mut self) {
        self.local = match self.local.take() {
            Some(LocalDelta::Many { added, removed }) => {
                let added: Vec<_> = added.into_iter().filter(|m| !self.remote_contains(m)).collect();
                let removed: Vec<_> = removed.into_iter().filter(|m| self.remote_contains(m)).collect();
                if added.is_empty() && removed.is_empty() {
                    None
                } else {
                    Some(LocalDelta::Many { added, removed })
                }
            }
            Some(LocalDelta::One(member)) => {
                if self.remote.as_one() == member.as_ref()
                    && matches!(self.remote, Membership::One(_))
                {
                    None
                } else {
                    Some(LocalDelta::One(member))
                }
            }
            None => None,
        };
        self.invalidate();
    }

    /// Remove every trace of `member`, remote and local.
    pub(crate) fn forget(&mut self, member: &Identifier) {
        self.remove_remote(member);
        if let Some(local) = &mut self.local {
            match local {
                LocalDelta::Many { added, removed } => {
                    added.retain(|m| m != member);
                    removed.retain(|m| m != member);
                }
                LocalDelta::One(current) => {
                    if current.as_ref() == Some(member) {
                        *current = None;
                    }
                }
            }
        }
        self.normalize_local();
    }

    /// Discard local changes that mention `member`, keeping the remote side.
    pub(crate) fn forget_local(&mut self, member: &Identifier) {
        let remote_has = self.remote_contains(member);
        self.local = match self.local.take() {
            Some(LocalDelta::Many {
                mut added,
                mut removed,
            }) => {
                added.retain(|m| m != member);
                removed.retain(|m| m != member);
                Some(LocalDelta::Many { added, removed })
            }
            Some(LocalDelta::One(current)) => {
                if current.as_ref() == Some(member) || remote_has {
                    None
                } else {
                    Some(LocalDelta::One(current))
                }
            }
            None => None,
        };
        self.normalize_local();
    }

    /// Nothing remote, nothing local.
    pub(crate) fn is_vacant(&self) -> bool {
        self.remote.is_empty() && self.local.is_none()
    }
}
