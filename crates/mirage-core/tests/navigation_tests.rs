mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{local_pets_model, MockServer};
use mirage_core::{
    field_map, BeforeState, Entity, ListListener, MirageError, Model, PropertyChange, Record,
    RecordListener, ReferenceRelation, Result, Value, LENGTH_PROPERTY,
};

/// Collects every property notification delivered to one record.
#[derive(Default)]
struct RecordSink {
    seen: RefCell<Vec<PropertyChange>>,
}

impl RecordListener for RecordSink {
    fn on_change(&self, change: &PropertyChange, _before: Option<BeforeState>) -> Result<()> {
        self.seen.borrow_mut().push(change.clone());
        Ok(())
    }
}

/// Collects every property notification delivered to one collection view.
#[derive(Default)]
struct ListSink {
    seen: RefCell<Vec<PropertyChange>>,
}

impl ListListener for ListSink {
    fn on_change(&self, change: &PropertyChange) -> Result<()> {
        self.seen.borrow_mut().push(change.clone());
        Ok(())
    }
}

/// Two owners, three pets, changes committed so the logs start clean.
fn seeded() -> (Model, Entity, Entity) {
    let server = Rc::new(MockServer::new());
    let (model, owners, pets) = local_pets_model(server);
    owners.append(vec![
        field_map([("id", Value::from(1)), ("name", Value::from("Sophia"))]),
        field_map([("id", Value::from(2)), ("name", Value::from("Oliver"))]),
    ]);
    pets.append(vec![
        field_map([
            ("id", Value::from(101)),
            ("owner_id", Value::from(1)),
            ("name", Value::from("Whiskers")),
        ]),
        field_map([
            ("id", Value::from(102)),
            ("owner_id", Value::from(1)),
            ("name", Value::from("Rex")),
        ]),
        field_map([
            ("id", Value::from(103)),
            ("owner_id", Value::from(2)),
            ("name", Value::from("Kesha")),
        ]),
    ]);
    owners.commit();
    pets.commit();
    assert!(!model.modified());
    (model, owners, pets)
}

fn owner(owners: &Entity, id: f64) -> Record {
    owners.find_by_key(&[Value::from(id)]).unwrap().unwrap()
}

fn pet(pets: &Entity, id: f64) -> Record {
    pets.find_by_key(&[Value::from(id)]).unwrap().unwrap()
}

// ===== SCALAR NAVIGATION TESTS =====

#[test]
fn test_scalar_resolves_referenced_record() {
    let (_model, owners, pets) = seeded();
    let whiskers = pet(&pets, 101.0);

    let resolved = pets.scalar(&whiskers, "owner").unwrap().unwrap();
    assert_eq!(resolved, owner(&owners, 1.0));
    assert_eq!(resolved.get("name"), Value::from("Sophia"));
}

#[test]
fn test_scalar_is_none_for_blank_foreign_key() {
    let (_model, _owners, pets) = seeded();
    let stray = pets
        .append(vec![field_map([
            ("id", Value::from(104)),
            ("name", Value::from("Tom")),
        ])])
        .pop()
        .unwrap();

    assert_eq!(pets.scalar(&stray, "owner").unwrap(), None);
}

#[test]
fn test_unknown_navigation_is_rejected() {
    let (_model, owners, pets) = seeded();
    let whiskers = pet(&pets, 101.0);

    match pets.scalar(&whiskers, "keeper") {
        Err(MirageError::UnknownNavigation { entity, property }) => {
            assert_eq!(entity, "pets");
            assert_eq!(property, "keeper");
        }
        other => panic!("Expected UnknownNavigation, got {other:?}"),
    }
    let sophia = owner(&owners, 1.0);
    assert!(matches!(
        owners.collection(&sophia, "animals"),
        Err(MirageError::UnknownNavigation { .. })
    ));
}

#[test]
fn test_dangling_reference_surfaces_on_read() {
    let (_model, _owners, pets) = seeded();
    // Bulk ingestion bypasses the write guard, so a dangling value can
    // arrive from outside. It is reported when the navigation is read.
    let orphan = pets
        .append(vec![field_map([
            ("id", Value::from(105)),
            ("owner_id", Value::from(99)),
            ("name", Value::from("Ghost")),
        ])])
        .pop()
        .unwrap();

    match pets.scalar(&orphan, "owner") {
        Err(MirageError::UnresolvedReference {
            entity,
            field,
            target,
            value,
        }) => {
            assert_eq!(entity, "pets");
            assert_eq!(field, "owner_id");
            assert_eq!(target, "owners");
            assert_eq!(value, "99");
        }
        other => panic!("Expected UnresolvedReference, got {other:?}"),
    }
}

#[test]
fn test_write_guard_rejects_dangling_foreign_key() {
    let (model, _owners, pets) = seeded();
    let whiskers = pet(&pets, 101.0);

    match whiskers.set("owner_id", 99) {
        Err(MirageError::UnresolvedReference { value, .. }) => assert_eq!(value, "99"),
        other => panic!("Expected UnresolvedReference, got {other:?}"),
    }
    // Rejected before anything fired: value intact, nothing logged.
    assert_eq!(whiskers.get("owner_id"), Value::from(1));
    assert!(!model.modified());
}

#[test]
fn test_write_guard_allows_clearing_foreign_key() {
    let (model, _owners, pets) = seeded();
    let whiskers = pet(&pets, 101.0);

    whiskers.set("owner_id", Value::Null).unwrap();
    assert_eq!(pets.scalar(&whiskers, "owner").unwrap(), None);
    assert!(model.modified());
}

#[test]
fn test_set_scalar_rewrites_foreign_key() {
    let (_model, owners, pets) = seeded();
    let whiskers = pet(&pets, 101.0);
    let oliver = owner(&owners, 2.0);

    pets.set_scalar(&whiskers, "owner", Some(&oliver)).unwrap();
    assert_eq!(whiskers.get("owner_id"), Value::from(2));
    assert_eq!(pets.scalar(&whiskers, "owner").unwrap(), Some(oliver));

    pets.set_scalar(&whiskers, "owner", None).unwrap();
    assert_eq!(whiskers.get("owner_id"), Value::Null);
    assert_eq!(pets.scalar(&whiskers, "owner").unwrap(), None);
}

// ===== COLLECTION NAVIGATION TESTS =====

#[test]
fn test_collection_groups_source_records_by_owner() {
    let (_model, owners, pets) = seeded();
    let sophia = owner(&owners, 1.0);
    let oliver = owner(&owners, 2.0);

    let hers = owners.collection(&sophia, "pets").unwrap();
    let his = owners.collection(&oliver, "pets").unwrap();

    assert_eq!(hers.len(), 2);
    assert_eq!(his.len(), 1);
    assert!(hers.contains(&pet(&pets, 101.0)));
    assert!(hers.contains(&pet(&pets, 102.0)));
    assert_eq!(his.get(0).unwrap().get("name"), Value::from("Kesha"));
    assert!(!his.contains(&pet(&pets, 101.0)));
}

#[test]
fn test_collection_push_and_remove_rewrite_membership() {
    let (_model, owners, pets) = seeded();
    let sophia = owner(&owners, 1.0);
    let oliver = owner(&owners, 2.0);
    let hers = owners.collection(&sophia, "pets").unwrap();
    let his = owners.collection(&oliver, "pets").unwrap();

    let tom = pets
        .append(vec![field_map([
            ("id", Value::from(104)),
            ("name", Value::from("Tom")),
        ])])
        .pop()
        .unwrap();
    assert!(!hers.contains(&tom));

    hers.push(&tom).unwrap();
    assert_eq!(tom.get("owner_id"), Value::from(1));
    assert_eq!(hers.len(), 3);
    assert_eq!(his.len(), 1);

    hers.remove(&tom).unwrap();
    assert_eq!(tom.get("owner_id"), Value::Null);
    assert_eq!(hers.len(), 2);

    // Removing a nonmember is a no-op.
    his.remove(&tom).unwrap();
    assert_eq!(tom.get("owner_id"), Value::Null);
    assert_eq!(his.len(), 1);

    his.clear().unwrap();
    assert!(his.is_empty());
    assert_eq!(pet(&pets, 103.0).get("owner_id"), Value::Null);
}

#[test]
fn test_collection_view_is_cached_per_owner() {
    let (_model, owners, pets) = seeded();
    let sophia = owner(&owners, 1.0);

    let first = owners.collection(&sophia, "pets").unwrap();
    let sink = Rc::new(ListSink::default());
    first.listen(sink.clone());

    // A second handle reaches the same live view; membership changes
    // observed through it notify the listener attached to the first.
    let second = owners.collection(&sophia, "pets").unwrap();
    let kesha = pet(&pets, 103.0);
    second.push(&kesha).unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 3);
    let seen = sink.seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].property, LENGTH_PROPERTY);
    assert_eq!(seen[0].old_value, Value::from(2));
    assert_eq!(seen[0].new_value, Value::from(3));
}

// ===== CHANGE PROPAGATION TESTS =====

#[test]
fn test_owner_flip_notifies_record_and_both_views() {
    let (_model, owners, pets) = seeded();
    let sophia = owner(&owners, 1.0);
    let oliver = owner(&owners, 2.0);
    let whiskers = pet(&pets, 101.0);

    let hers = owners.collection(&sophia, "pets").unwrap();
    let his = owners.collection(&oliver, "pets").unwrap();
    let record_sink = Rc::new(RecordSink::default());
    let hers_sink = Rc::new(ListSink::default());
    let his_sink = Rc::new(ListSink::default());
    whiskers.listen(record_sink.clone());
    hers.listen(hers_sink.clone());
    his.listen(his_sink.clone());

    whiskers.set("owner_id", 2).unwrap();

    assert_eq!(hers.len(), 1);
    assert_eq!(his.len(), 2);
    let names: Vec<Value> = his.records().iter().map(|r| r.get("name")).collect();
    assert_eq!(names, vec![Value::from("Kesha"), Value::from("Whiskers")]);

    // The record saw the raw field write and the derived navigation change.
    let seen = record_sink.seen.borrow();
    assert_eq!(seen.len(), 2);
    let field = seen.iter().find(|c| c.property == "owner_id").unwrap();
    assert_eq!(field.old_value, Value::from(1));
    assert_eq!(field.new_value, Value::from(2));
    let nav = seen.iter().find(|c| c.property == "owner").unwrap();
    assert_eq!(nav.old_value, Value::from(1));
    assert_eq!(nav.new_value, Value::from(2));

    // Both owners' cached views reported their length flip.
    let hers_seen = hers_sink.seen.borrow();
    assert_eq!(hers_seen.len(), 1);
    assert_eq!(hers_seen[0].property, LENGTH_PROPERTY);
    assert_eq!(hers_seen[0].old_value, Value::from(2));
    assert_eq!(hers_seen[0].new_value, Value::from(1));
    let his_seen = his_sink.seen.borrow();
    assert_eq!(his_seen.len(), 1);
    assert_eq!(his_seen[0].old_value, Value::from(1));
    assert_eq!(his_seen[0].new_value, Value::from(2));
}

#[test]
fn test_same_owner_write_skips_length_notifications() {
    let (_model, owners, pets) = seeded();
    let sophia = owner(&owners, 1.0);
    let hers = owners.collection(&sophia, "pets").unwrap();
    let sink = Rc::new(ListSink::default());
    hers.listen(sink.clone());

    // A plain field write on a member never touches membership.
    pet(&pets, 101.0).set("name", "Mittens").unwrap();
    assert!(sink.seen.borrow().is_empty());
    assert_eq!(hers.len(), 2);
}

// ===== MULTI-FIELD REFERENCE TESTS =====

#[test]
fn test_composite_reference_checks_on_read_only() {
    let server = Rc::new(MockServer::new());
    let model = Model::new(server);
    let slots = Entity::new("slots", ["id"]).unwrap();
    let bookings = Entity::new("bookings", ["id"]).unwrap();
    model.add_entity(slots.clone()).unwrap();
    model.add_entity(bookings.clone()).unwrap();
    model
        .add_association(
            ReferenceRelation::with_fields(
                "bookings",
                vec!["day".to_string(), "room".to_string()],
                "slots",
                vec!["day".to_string(), "room".to_string()],
            )
            .scalar("slot"),
        )
        .unwrap();

    slots.append(vec![field_map([
        ("id", Value::from(1)),
        ("day", Value::from("mon")),
        ("room", Value::from("A")),
    ])]);
    let booking = bookings
        .append(vec![field_map([
            ("id", Value::from(10)),
            ("day", Value::from("mon")),
            ("room", Value::from("A")),
        ])])
        .pop()
        .unwrap();

    let resolved = bookings.scalar(&booking, "slot").unwrap().unwrap();
    assert_eq!(resolved.get("id"), Value::from(1));

    // Per-field writes on a multi-field reference are not guarded; the
    // half-updated state surfaces when the navigation is read.
    booking.set("room", "B").unwrap();
    match bookings.scalar(&booking, "slot") {
        Err(MirageError::UnresolvedReference { value, .. }) => {
            assert_eq!(value, "mon | B");
        }
        other => panic!("Expected UnresolvedReference, got {other:?}"),
    }
}
