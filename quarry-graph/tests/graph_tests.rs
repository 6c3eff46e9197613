//! Relationship graph behavior against the shared fixture schemas.

use proptest::prelude::*;
use quarry_core::{Cardinality, GraphError, Identifier, IdentifierCache, QuarryError, ResourceType};
use quarry_graph::{Graph, Membership, Retainer};
use quarry_test_utils::fixtures;

struct Harness {
    graph: Graph,
    identifiers: IdentifierCache,
}

impl Harness {
    fn new() -> Self {
        Self {
            graph: Graph::new(fixtures::app_registry()),
            identifiers: IdentifierCache::default(),
        }
    }

    fn ident(&mut self, resource_type: &str, id: &str) -> Identifier {
        self.identifiers.get_or_create(&ResourceType::new(resource_type), id)
    }

    fn push_many(&mut self, owner: &Identifier, resource_type: &str, name: &str, members: &[Identifier]) {
        self.graph
            .push(owner, &ResourceType::new(resource_type), name, Membership::Many(members.to_vec()))
            .expect("push to-many");
    }

    fn push_one(&mut self, owner: &Identifier, resource_type: &str, name: &str, member: Option<&Identifier>) {
        self.graph
            .push(owner, &ResourceType::new(resource_type), name, Membership::One(member.cloned()))
            .expect("push to-one");
    }

    fn get(&mut self, owner: &Identifier, resource_type: &str, name: &str) -> Option<Membership> {
        self.graph
            .get(owner, &ResourceType::new(resource_type), name)
            .expect("known relationship")
    }

    fn many(&mut self, owner: &Identifier, resource_type: &str, name: &str) -> Vec<Identifier> {
        self.get(owner, resource_type, name)
            .map(|m| m.identifiers())
            .unwrap_or_default()
    }

    fn one(&mut self, owner: &Identifier, resource_type: &str, name: &str) -> Option<Identifier> {
        self.get(owner, resource_type, name)
            .and_then(|m| m.as_one().cloned())
    }
}

#[test]
fn test_inverse_is_derived_lazily() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let hobby = h.ident("hobby", "2");

    h.push_many(&user, "user", "hobbies", &[hobby.clone()]);
    assert!(h.graph.has_pending());

    assert_eq!(h.one(&hobby, "hobby", "user"), Some(user.clone()));
    assert!(!h.graph.has_pending());
    assert_eq!(h.many(&user, "user", "hobbies"), vec![hobby]);
}

#[test]
fn test_read_applies_only_connected_payloads() {
    let mut h = Harness::new();
    let first = h.ident("user", "1");
    let other = h.ident("user", "3");
    let h2 = h.ident("hobby", "2");
    let h4 = h.ident("hobby", "4");

    h.push_many(&first, "user", "hobbies", &[h2.clone()]);
    h.push_many(&other, "user", "hobbies", &[h4.clone()]);

    assert_eq!(h.many(&first, "user", "hobbies"), vec![h2]);
    assert!(h.graph.has_pending());

    assert_eq!(h.one(&h4, "hobby", "user"), Some(other));
    assert!(!h.graph.has_pending());
}

#[test]
fn test_connected_payloads_apply_in_push_order() {
    let mut h = Harness::new();
    let first = h.ident("user", "1");
    let second = h.ident("user", "2");
    let hobby = h.ident("hobby", "1");

    h.push_many(&first, "user", "hobbies", &[hobby.clone()]);
    h.push_one(&hobby, "hobby", "user", Some(&second));

    assert_eq!(h.many(&first, "user", "hobbies"), Vec::<Identifier>::new());
    assert_eq!(h.many(&second, "user", "hobbies"), vec![hobby]);
}

#[test]
fn test_check_push_does_not_queue() {
    let h = Harness::new();
    let user = ResourceType::new("user");
    assert!(h.graph.check_push(&user, "hobbies", Cardinality::Many).unwrap());
    assert!(h.graph.check_push(&user, "hats", Cardinality::One).is_err());
    assert!(h.graph.check_push(&user, "spaceships", Cardinality::Many).is_err());
    assert!(!h.graph.has_pending());

    let lenient = Graph::new(fixtures::app_registry()).with_strict(false);
    assert!(!lenient.check_push(&user, "spaceships", Cardinality::Many).unwrap());
}

#[test]
fn test_observed_changes_cover_read_relationships_only() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let stranger = h.ident("user", "9");
    let h1 = h.ident("hobby", "1");
    let h2 = h.ident("hobby", "2");
    let h9 = h.ident("hobby", "9");

    h.push_many(&user, "user", "hobbies", &[h1.clone()]);
    assert_eq!(h.many(&user, "user", "hobbies"), vec![h1.clone()]);
    assert!(h.graph.take_observed_changes().is_empty());

    h.push_many(&user, "user", "hobbies", &[h1, h2]);
    h.push_many(&stranger, "user", "hobbies", &[h9]);
    let changes = h.graph.take_observed_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].identifier, user);
    assert_eq!(changes[0].name, "hobbies");
    assert!(h.graph.has_pending());
}

#[test]
fn test_never_told_is_none() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    assert_eq!(h.get(&user, "user", "hats"), None);
}

#[test]
fn test_unknown_relationship_is_an_assertion() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let err = h
        .graph
        .get(&user, &ResourceType::new("user"), "spaceships")
        .unwrap_err();
    assert!(matches!(
        err,
        QuarryError::Graph(GraphError::UnknownRelationship { .. })
    ));

    let push = h.graph.push(
        &user,
        &ResourceType::new("user"),
        "spaceships",
        Membership::Many(vec![]),
    );
    assert!(push.is_err());
}

#[test]
fn test_lenient_graph_skips_unknown_relationships() {
    let mut graph = Graph::new(fixtures::app_registry()).with_strict(false);
    let user = Identifier::from_lid("@lid:user");
    let result = graph.push(
        &user,
        &ResourceType::new("user"),
        "spaceships",
        Membership::Many(vec![]),
    );
    assert!(result.is_ok());
    assert!(!graph.has_pending());
}

#[test]
fn test_cardinality_mismatch() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let err = h
        .graph
        .push(&user, &ResourceType::new("user"), "hats", Membership::One(None))
        .unwrap_err();
    assert!(matches!(
        err,
        QuarryError::Graph(GraphError::CardinalityMismatch { .. })
    ));
}

#[test]
fn test_polymorphic_members_keep_push_order() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let hat = h.ident("hat", "1");
    let big = h.ident("big-hat", "2");
    let small = h.ident("small-hat", "3");

    h.push_one(&hat, "hat", "user", Some(&user));
    h.push_one(&big, "big-hat", "user", Some(&user));
    h.push_one(&small, "small-hat", "user", Some(&user));
    // Re-push must not duplicate.
    h.push_one(&big, "big-hat", "user", Some(&user));

    assert_eq!(
        h.many(&user, "user", "hats"),
        vec![hat.clone(), big.clone(), small.clone()]
    );

    let mut reversed = Harness::new();
    let user = reversed.ident("user", "1");
    let hat = reversed.ident("hat", "1");
    let big = reversed.ident("big-hat", "2");
    let small = reversed.ident("small-hat", "3");
    reversed.push_one(&small, "small-hat", "user", Some(&user));
    reversed.push_one(&big, "big-hat", "user", Some(&user));
    reversed.push_one(&hat, "hat", "user", Some(&user));
    assert_eq!(reversed.many(&user, "user", "hats"), vec![small, big, hat]);
}

#[test]
fn test_to_one_push_displaces_previous_owner() {
    let mut h = Harness::new();
    let first = h.ident("user", "1");
    let second = h.ident("user", "2");
    let hobby = h.ident("hobby", "1");

    h.push_many(&first, "user", "hobbies", &[hobby.clone()]);
    h.push_many(&second, "user", "hobbies", &[hobby.clone()]);

    assert_eq!(h.many(&first, "user", "hobbies"), Vec::<Identifier>::new());
    assert_eq!(h.many(&second, "user", "hobbies"), vec![hobby.clone()]);
    assert_eq!(h.one(&hobby, "hobby", "user"), Some(second));
}

#[test]
fn test_reflexive_same_field_many_to_many() {
    let mut h = Harness::new();
    let alice = h.ident("person", "1");
    let bob = h.ident("person", "2");
    let person = ResourceType::new("person");

    h.graph.add_to_many(&alice, &person, "friends", &bob).unwrap();
    assert_eq!(h.many(&bob, "person", "friends"), vec![alice.clone()]);
    assert_eq!(h.many(&alice, "person", "friends"), vec![bob.clone()]);

    h.graph.remove_from_many(&alice, &person, "friends", &bob).unwrap();
    assert!(h.many(&bob, "person", "friends").is_empty());
    assert!(h.many(&alice, "person", "friends").is_empty());
}

#[test]
fn test_reflexive_self_reference_is_not_duplicated() {
    let mut h = Harness::new();
    let alice = h.ident("person", "1");
    let bob = h.ident("person", "2");

    h.push_many(&alice, "person", "friends", &[alice.clone(), bob.clone()]);
    assert_eq!(
        h.many(&alice, "person", "friends"),
        vec![alice.clone(), bob.clone()]
    );
    assert_eq!(h.many(&bob, "person", "friends"), vec![alice]);
}

#[test]
fn test_self_reference_through_lid() {
    let mut h = Harness::new();
    let fresh = h.identifiers.get_or_create_for_new_resource(&ResourceType::new("person"));

    h.push_one(&fresh, "person", "parent", Some(&fresh));
    assert_eq!(h.many(&fresh, "person", "children"), vec![fresh.clone()]);
    assert_eq!(h.one(&fresh, "person", "parent"), Some(fresh));
}

#[test]
fn test_reflexive_one_to_one_displacement() {
    let mut h = Harness::new();
    let a = h.ident("person", "1");
    let b = h.ident("person", "2");
    let c = h.ident("person", "3");

    h.push_one(&a, "person", "spouse", Some(&b));
    assert_eq!(h.one(&b, "person", "spouse"), Some(a.clone()));

    h.push_one(&c, "person", "spouse", Some(&b));
    assert_eq!(h.one(&b, "person", "spouse"), Some(c));
    assert_eq!(h.one(&a, "person", "spouse"), None);
}

#[test]
fn test_unload_keeps_independently_asserted_inverse() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let derived = h.ident("hobby", "1");
    let asserted = h.ident("hobby", "2");
    let user_type = ResourceType::new("user");

    h.push_many(&user, "user", "hobbies", &[derived.clone(), asserted.clone()]);
    h.push_one(&asserted, "hobby", "user", Some(&user));

    h.graph.unload(&user, &user_type, "hobbies").unwrap();

    assert_eq!(h.get(&user, "user", "hobbies"), None);
    assert_eq!(h.get(&derived, "hobby", "user"), None);
    assert_eq!(h.one(&asserted, "hobby", "user"), Some(user));
}

#[test]
fn test_unload_record_sync_inverse_is_nulled() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let hat = h.ident("hat", "1");

    h.push_one(&hat, "hat", "user", Some(&user));
    assert_eq!(h.many(&user, "user", "hats"), vec![hat.clone()]);

    h.graph.unload_record(&user, &ResourceType::new("user"), false);
    assert_eq!(h.one(&hat, "hat", "user"), None);
    assert!(h.graph.retainers(&user).is_empty());
}

#[test]
fn test_unload_record_async_inverse_keeps_reference() {
    let mut h = Harness::new();
    let owner = h.ident("person", "1");
    let pet = h.ident("pet", "1");

    h.push_one(&pet, "pet", "owner", Some(&owner));
    h.graph.unload_record(&pet, &ResourceType::new("pet"), false);

    assert_eq!(h.many(&owner, "person", "pets"), vec![pet.clone()]);
    assert_eq!(
        h.graph.retainers(&pet),
        vec![Retainer {
            identifier: owner,
            name: "pets".to_string(),
        }]
    );
    assert_eq!(h.get(&pet, "pet", "owner"), None);
}

#[test]
fn test_hard_unload_removes_async_references_too() {
    let mut h = Harness::new();
    let owner = h.ident("person", "1");
    let pet = h.ident("pet", "1");

    h.push_one(&pet, "pet", "owner", Some(&owner));
    h.graph.unload_record(&pet, &ResourceType::new("pet"), true);

    assert!(h.many(&owner, "person", "pets").is_empty());
    assert!(h.graph.retainers(&pet).is_empty());
}

#[test]
fn test_remove_everywhere_clears_one_directional_references() {
    let mut h = Harness::new();
    let post = h.ident("post", "1");
    let tag = h.ident("tag", "1");

    h.push_many(&post, "post", "tags", &[tag.clone()]);
    assert_eq!(h.graph.retainers(&tag).len(), 1);

    h.graph.remove_everywhere(&tag);
    assert!(h.many(&post, "post", "tags").is_empty());
    assert!(h.graph.retainers(&tag).is_empty());
}

#[test]
fn test_local_changes_rollback() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let kept = h.ident("hobby", "1");
    let added = h.ident("hobby", "2");
    let user_type = ResourceType::new("user");

    h.push_many(&user, "user", "hobbies", &[kept.clone()]);
    h.graph.add_to_many(&user, &user_type, "hobbies", &added).unwrap();
    assert_eq!(h.one(&added, "hobby", "user"), Some(user.clone()));
    assert!(h.graph.has_local_changes(&user, &user_type));

    h.graph.rollback_local(&user, &user_type);
    assert_eq!(h.many(&user, "user", "hobbies"), vec![kept]);
    assert_eq!(h.one(&added, "hobby", "user"), None);
    assert!(!h.graph.has_local_changes(&user, &user_type));
}

#[test]
fn test_commit_local_keeps_later_changes() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let first = h.ident("hobby", "1");
    let second = h.ident("hobby", "2");
    let third = h.ident("hobby", "3");
    let user_type = ResourceType::new("user");

    h.push_many(&user, "user", "hobbies", &[first.clone()]);
    h.graph.add_to_many(&user, &user_type, "hobbies", &second).unwrap();
    let saved = h.graph.local_state(&user, &user_type);
    h.graph.add_to_many(&user, &user_type, "hobbies", &third).unwrap();

    h.graph.commit_local(&user, &user_type, &saved).unwrap();

    let remote = h
        .graph
        .get_remote(&user, &user_type, "hobbies")
        .unwrap()
        .map(|m| m.identifiers());
    assert_eq!(remote, Some(vec![first.clone(), second.clone()]));
    assert_eq!(
        h.many(&user, "user", "hobbies"),
        vec![first, second, third]
    );
    assert!(h.graph.has_local_changes(&user, &user_type));
}

#[test]
fn test_set_one_moves_member_between_owners() {
    let mut h = Harness::new();
    let first = h.ident("user", "1");
    let second = h.ident("user", "2");
    let hobby = h.ident("hobby", "1");
    let hobby_type = ResourceType::new("hobby");

    h.graph.set_one(&hobby, &hobby_type, "user", Some(&first)).unwrap();
    assert_eq!(h.many(&first, "user", "hobbies"), vec![hobby.clone()]);

    h.graph.set_one(&hobby, &hobby_type, "user", Some(&second)).unwrap();
    assert!(h.many(&first, "user", "hobbies").is_empty());
    assert_eq!(h.many(&second, "user", "hobbies"), vec![hobby.clone()]);

    h.graph.set_one(&hobby, &hobby_type, "user", None).unwrap();
    assert!(h.many(&second, "user", "hobbies").is_empty());
}

#[test]
fn test_replace_many() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let a = h.ident("hobby", "1");
    let b = h.ident("hobby", "2");
    let c = h.ident("hobby", "3");
    let user_type = ResourceType::new("user");

    h.push_many(&user, "user", "hobbies", &[a.clone(), b.clone()]);
    h.graph
        .replace_many(&user, &user_type, "hobbies", &[b.clone(), c.clone()])
        .unwrap();

    assert_eq!(h.many(&user, "user", "hobbies"), vec![b, c.clone()]);
    assert_eq!(h.one(&a, "hobby", "user"), None);
    assert_eq!(h.one(&c, "hobby", "user"), Some(user));
}

#[test]
fn test_identical_repush_reports_no_changes() {
    let mut h = Harness::new();
    let user = h.ident("user", "1");
    let hobby = h.ident("hobby", "1");
    let user_type = ResourceType::new("user");

    h.push_many(&user, "user", "hobbies", &[hobby.clone()]);
    let changes = h.graph.take_changes();
    assert!(changes.iter().any(|c| c.identifier == user && c.name == "hobbies"));
    assert!(changes.iter().any(|c| c.identifier == hobby && c.name == "user"));
    let version = h.graph.version(&user, &user_type, "hobbies").unwrap();

    h.push_many(&user, "user", "hobbies", &[hobby.clone()]);
    assert!(h.graph.take_changes().is_empty());
    assert_eq!(h.graph.version(&user, &user_type, "hobbies").unwrap(), version);
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    HobbyUser(usize, Option<usize>),
    UserHobbies(usize, Vec<usize>),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..6, prop::option::of(0usize..3)).prop_map(|(h, u)| Op::HobbyUser(h, u)),
        (0usize..3, prop::collection::vec(0usize..6, 0..4)).prop_map(|(u, hs)| Op::UserHobbies(u, hs)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// h ∈ u.hobbies exactly when h.user == u, whichever side the payloads came from.
    #[test]
    fn prop_bidirectional_consistency(ops in prop::collection::vec(arb_op(), 1..25)) {
        let mut h = Harness::new();
        let users: Vec<_> = (0..3).map(|i| h.ident("user", &i.to_string())).collect();
        let hobbies: Vec<_> = (0..6).map(|i| h.ident("hobby", &i.to_string())).collect();

        for op in ops {
            match op {
                Op::HobbyUser(hobby, user) => {
                    let user = user.map(|u| users[u].clone());
                    h.push_one(&hobbies[hobby], "hobby", "user", user.as_ref());
                }
                Op::UserHobbies(user, members) => {
                    let members: Vec<_> = members.into_iter().map(|m| hobbies[m].clone()).collect();
                    h.push_many(&users[user], "user", "hobbies", &members);
                }
            }
        }

        for user in &users {
            for hobby in &hobbies {
                let listed = h.many(user, "user", "hobbies").contains(hobby);
                let points_back = h.one(hobby, "hobby", "user").as_ref() == Some(user);
                prop_assert_eq!(listed, points_back);
            }
        }
    }

    /// Reading one resource at a time sees what a full flush would have produced.
    #[test]
    fn prop_connected_reads_match_full_flush(ops in prop::collection::vec(arb_op(), 1..25)) {
        let mut lazy = Harness::new();
        let mut eager = Harness::new();
        let users: Vec<_> = (0..3).map(|i| lazy.ident("user", &i.to_string())).collect();
        let hobbies: Vec<_> = (0..6).map(|i| lazy.ident("hobby", &i.to_string())).collect();

        for op in ops {
            match op {
                Op::HobbyUser(hobby, user) => {
                    let user = user.map(|u| users[u].clone());
                    lazy.push_one(&hobbies[hobby], "hobby", "user", user.as_ref());
                    eager.push_one(&hobbies[hobby], "hobby", "user", user.as_ref());
                }
                Op::UserHobbies(user, members) => {
                    let members: Vec<_> = members.into_iter().map(|m| hobbies[m].clone()).collect();
                    lazy.push_many(&users[user], "user", "hobbies", &members);
                    eager.push_many(&users[user], "user", "hobbies", &members);
                }
            }
        }
        eager.graph.take_changes();

        for hobby in &hobbies {
            prop_assert_eq!(lazy.one(hobby, "hobby", "user"), eager.one(hobby, "hobby", "user"));
        }
        for user in &users {
            prop_assert_eq!(lazy.many(user, "user", "hobbies"), eager.many(user, "user", "hobbies"));
        }
    }

    /// With the owner's list pushed first, the order of inverse pushes does not matter.
    #[test]
    fn prop_inverse_push_order_independent(order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle()) {
        let mut h = Harness::new();
        let user = h.ident("user", "1");
        let hats: Vec<_> = (0..6)
            .map(|i| {
                let hat_type = ["hat", "big-hat", "small-hat"][i % 3];
                (hat_type, h.ident(hat_type, &i.to_string()))
            })
            .collect();
        let listed: Vec<_> = hats.iter().map(|(_, ident)| ident.clone()).collect();

        h.push_many(&user, "user", "hats", &listed);
        for i in order {
            let (hat_type, ident) = hats[i].clone();
            h.push_one(&ident, hat_type, "user", Some(&user));
        }

        prop_assert_eq!(h.many(&user, "user", "hats"), listed);
    }
}
