//! Cache behavior of the store: identity, pushes, relationships, teardown.

use proptest::prelude::*;
use quarry_core::{
    GraphError, QuarryError, RecordState, ResourceDocument, ResourceObject, ResourceReference,
    ResourceType,
};
use quarry_store::{Notification, Store};
use quarry_test_utils::{fixtures, generators};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

fn store() -> Store {
    Store::builder(fixtures::app_registry()).build().expect("store")
}

fn person_with_pet() -> ResourceDocument {
    let person = ResourceObject::new(ResourceType::new("person"), "1")
        .with_attribute("name", json!("Ada"))
        .with_many("pets", vec![fixtures::reference("pet", "1")]);
    let pet = ResourceObject::new(ResourceType::new("pet"), "1")
        .with_attribute("name", json!("Rex"))
        .with_one("owner", Some(fixtures::reference("person", "1")));
    ResourceDocument::single(person).with_included(vec![pet])
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        seen.push(notification);
    }
    seen
}

#[test]
fn test_one_record_per_identity() {
    let store = store();
    let first = store.push(fixtures::user_with_hats(&[])).unwrap();
    let second = store.push(fixtures::user_with_hats(&[])).unwrap();
    assert_eq!(first[0], second[0]);
    assert_eq!(first[0].instance(), second[0].instance());

    let peeked = store.peek_record("user", "1").unwrap().unwrap();
    assert_eq!(peeked, first[0]);
    assert_eq!(store.peek_all("user").unwrap().len().unwrap(), 1);
}

#[test]
fn test_inverse_visible_from_both_sides() {
    let store = store();
    let user = store
        .push(fixtures::user_with_hats(&[("big-hat", "1"), ("small-hat", "2")]))
        .unwrap()
        .remove(0);

    let hats = user.has_many("hats").unwrap();
    assert_eq!(hats.ids().unwrap(), vec!["1", "2"]);
    let records = hats.records().unwrap();
    assert_eq!(records[0].resource_type(), &ResourceType::new("big-hat"));
    assert_eq!(records[1].resource_type(), &ResourceType::new("small-hat"));
    for hat in &records {
        assert_eq!(hat.belongs_to("user").unwrap().as_ref(), Some(&user));
    }
}

#[test]
fn test_polymorphic_members_resolve_through_base_type() {
    let store = store();
    store
        .push(fixtures::user_with_hats(&[("big-hat", "1"), ("small-hat", "2"), ("big-hat", "3")]))
        .unwrap();

    let through_base = store.peek_record("hat", "3").unwrap().unwrap();
    let concrete = store.peek_record("big-hat", "3").unwrap().unwrap();
    assert_eq!(through_base, concrete);
    assert_eq!(concrete.resource_type(), &ResourceType::new("big-hat"));
    assert_eq!(store.peek_all("hat").unwrap().len().unwrap(), 3);
    assert_eq!(store.peek_all("small-hat").unwrap().ids().unwrap(), vec!["2"]);
}

#[test]
fn test_identical_repush_is_silent() {
    let store = store();
    let user = store
        .push(fixtures::user_with_hats(&[("big-hat", "1")]))
        .unwrap()
        .remove(0);
    assert_eq!(user.has_many("hats").unwrap().ids().unwrap(), vec!["1"]);
    let mut rx = store.subscribe();

    let document = fixtures::user_with_hats(&[("big-hat", "1"), ("small-hat", "2")]);
    store.push(document.clone()).unwrap();
    let first = drain(&mut rx);
    assert!(first
        .iter()
        .any(|n| matches!(n, Notification::RelationshipChanged { name, .. } if name == "hats")));

    store.push(document).unwrap();
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn test_subscribing_does_not_apply_unread_relationships() {
    let store = store();
    let mut rx = store.subscribe();

    store.push(person_with_pet()).unwrap();
    let seen = drain(&mut rx);
    assert!(!seen
        .iter()
        .any(|n| matches!(n, Notification::RelationshipChanged { .. })));

    let person = store.peek_record("person", "1").unwrap().unwrap();
    assert_eq!(person.has_many("pets").unwrap().ids().unwrap(), vec!["1"]);
}

#[test]
fn test_rejected_push_leaves_nothing_behind() {
    let store = store();
    let hobby = ResourceObject::new(ResourceType::new("hobby"), "2")
        .with_one("user", Some(fixtures::reference("user", "1")));
    let user = ResourceObject::new(ResourceType::new("user"), "1")
        .with_attribute("name", json!("Tom"))
        .with_one("hobbies", None);

    let err = store
        .push(ResourceDocument::single(hobby).with_included(vec![user]))
        .unwrap_err();
    assert!(matches!(
        err,
        QuarryError::Graph(GraphError::CardinalityMismatch { .. })
    ));
    assert!(store.peek_record("hobby", "2").unwrap().is_none());
    assert!(store.identifier_for("hobby", "2").unwrap().is_none());
    assert!(store.identifier_for("user", "1").unwrap().is_none());
}

#[test]
fn test_push_with_unresolvable_reference_is_rejected_whole() {
    let store = store();
    let user = ResourceObject::new(ResourceType::new("user"), "1")
        .with_attribute("name", json!("Tom"))
        .with_many(
            "hobbies",
            vec![ResourceReference {
                id: None,
                resource_type: ResourceType::new("hobby"),
                lid: None,
            }],
        );

    assert!(store.push(ResourceDocument::single(user)).is_err());
    assert!(store.peek_record("user", "1").unwrap().is_none());
}

#[test]
fn test_attribute_change_notifies() {
    let store = store();
    store.push_payload("user", fixtures::user_payload("1", "Tom")).unwrap();
    let mut rx = store.subscribe();

    store.push_payload("user", fixtures::user_payload("1", "Thomas")).unwrap();
    let seen = drain(&mut rx);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), "attributeChanged");
}

#[test]
fn test_unload_then_restore_is_a_new_record() {
    let store = store();
    let user = store
        .push(fixtures::user_with_hats(&[("big-hat", "1")]))
        .unwrap()
        .remove(0);
    let hat = store.peek_record("big-hat", "1").unwrap().unwrap();

    user.unload().unwrap();
    assert_eq!(user.state().unwrap(), RecordState::Destroying);
    assert!(user.attr("name").is_err());
    assert!(store.peek_record("user", "1").unwrap().is_none());
    assert_eq!(hat.belongs_to("user").unwrap(), None);

    assert_eq!(store.settle().unwrap(), 1);
    assert_eq!(user.state().unwrap(), RecordState::Destroyed);
    assert!(store.identifier_for("user", "1").unwrap().is_none());

    let restored = store
        .push_payload("user", fixtures::user_payload("1", "Clemens"))
        .unwrap()
        .remove(0);
    assert_ne!(restored, user);
    assert_ne!(restored.identifier(), user.identifier());
    assert_eq!(restored.state().unwrap(), RecordState::LoadedSaved);
    assert!(restored.has_many("hats").unwrap().is_empty().unwrap());
    assert_eq!(user.state().unwrap(), RecordState::Destroyed);
}

#[test]
fn test_async_inverse_retains_unloaded_member() {
    let store = store();
    let person = store.push(person_with_pet()).unwrap().remove(0);
    let pet = store.peek_record("pet", "1").unwrap().unwrap();
    let identifier = pet.identifier().clone();

    pet.unload().unwrap();
    store.settle().unwrap();

    let pets = person.has_many("pets").unwrap();
    assert_eq!(pets.ids().unwrap(), vec!["1"]);
    assert!(pets.records().unwrap().is_empty());
    assert_eq!(store.identifier_for("pet", "1").unwrap(), Some(identifier.clone()));

    let restored = store.push(person_with_pet()).unwrap();
    assert_eq!(restored[0], person);
    let pet = store.peek_record("pet", "1").unwrap().unwrap();
    assert_eq!(pet.identifier(), &identifier);
    assert_eq!(pets.records().unwrap(), vec![pet.clone()]);
    assert_eq!(pet.belongs_to("owner").unwrap(), Some(person));
}

#[test]
fn test_sync_inverse_is_cleared_on_unload() {
    let store = store();
    let person = store.push(person_with_pet()).unwrap().remove(0);
    let pet = store.peek_record("pet", "1").unwrap().unwrap();

    person.unload().unwrap();
    assert_eq!(pet.belongs_to_reference("owner").unwrap(), None);
}

#[test]
fn test_unload_all_covers_subtypes() {
    let store = store();
    store
        .push(fixtures::user_with_hats(&[("big-hat", "1"), ("small-hat", "2")]))
        .unwrap();
    let hats = store.peek_all("hat").unwrap();
    assert_eq!(hats.len().unwrap(), 2);

    assert_eq!(store.unload_all("hat").unwrap(), 2);
    assert!(hats.is_empty().unwrap());
    assert!(store.has_record_for_id("user", "1"));
}

#[test]
fn test_local_relationship_edit_and_rollback() {
    let store = store();
    store
        .push(fixtures::user_with_hats(&[("big-hat", "1"), ("small-hat", "2")]))
        .unwrap();
    let user = store.peek_record("user", "1").unwrap().unwrap();
    let hat = store.peek_record("big-hat", "1").unwrap().unwrap();

    hat.set_belongs_to("user", None).unwrap();
    assert_eq!(hat.state().unwrap(), RecordState::UpdatedUncommitted);
    assert_eq!(user.has_many("hats").unwrap().ids().unwrap(), vec!["2"]);
    assert_eq!(user.state().unwrap(), RecordState::LoadedSaved);

    hat.rollback_attributes().unwrap();
    assert_eq!(hat.state().unwrap(), RecordState::LoadedSaved);
    assert_eq!(hat.belongs_to("user").unwrap(), Some(user.clone()));
    assert!(user.has_many("hats").unwrap().contains(&hat).unwrap());
}

#[test]
fn test_set_attr_back_to_server_value_is_clean() {
    let store = store();
    let user = store
        .push_payload("user", fixtures::user_payload("1", "Tom"))
        .unwrap()
        .remove(0);

    user.set_attr("name", json!("Tomster")).unwrap();
    assert!(user.is_dirty());
    let changes = user.changed_attributes().unwrap();
    assert_eq!(changes["name"].old, json!("Tom"));
    assert_eq!(changes["name"].new, json!("Tomster"));

    user.set_attr("name", json!("Tom")).unwrap();
    assert_eq!(user.state().unwrap(), RecordState::LoadedSaved);
    assert!(!user.has_dirty_attributes());
}

#[test]
fn test_rollback_attributes() {
    let store = store();
    let user = store
        .push_payload("user", fixtures::user_payload("1", "Tom"))
        .unwrap()
        .remove(0);
    user.set_attr("name", json!("Tomster")).unwrap();
    user.set_attr("email", json!("tom@example.com")).unwrap();

    user.rollback_attributes().unwrap();
    assert_eq!(user.state().unwrap(), RecordState::LoadedSaved);
    assert_eq!(user.attr("name").unwrap(), Some(json!("Tom")));
    assert_eq!(user.attr("email").unwrap(), None);
}

#[test]
fn test_deleting_a_new_record_destroys_it() {
    let store = store();
    let user = store.create_record("user", json!({"name": "Tom"})).unwrap();
    assert_eq!(store.peek_all("user").unwrap().len().unwrap(), 1);

    user.delete_record().unwrap();
    assert!(user.is_destroying());
    assert!(store.peek_all("user").unwrap().is_empty().unwrap());
}

#[test]
fn test_rolling_back_a_new_record_unloads_it() {
    let store = store();
    let user = store.create_record("user", json!({"name": "Tom"})).unwrap();
    user.rollback_attributes().unwrap();
    assert!(user.is_destroying());
    store.settle().unwrap();
    assert!(user.is_destroyed());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The final graph does not depend on the order of `included`.
    #[test]
    fn prop_included_order_does_not_matter(
        order in generators::arb_permutation(vec![
            ("big-hat", "1"),
            ("small-hat", "2"),
            ("big-hat", "3"),
            ("small-hat", "4"),
        ])
    ) {
        let store = store();
        let mut document = fixtures::user_with_hats(&order);
        document.included.push(
            ResourceObject::new(ResourceType::new("hobby"), "1")
                .with_one("user", Some(fixtures::reference("user", "1"))),
        );
        let user = store.push(document).unwrap().remove(0);

        let mut ids = user.has_many("hats").unwrap().ids().unwrap();
        ids.sort();
        prop_assert_eq!(ids, vec!["1", "2", "3", "4"]);
        prop_assert_eq!(user.has_many("hobbies").unwrap().ids().unwrap(), vec!["1"]);
        for (hat_type, id) in &order {
            let hat = store.peek_record(hat_type, id).unwrap().unwrap();
            prop_assert_eq!(hat.belongs_to("user").unwrap(), Some(user.clone()));
        }
    }
}
