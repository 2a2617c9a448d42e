//! Owner and index resolution used by cascades and merges.

mod common;

use common::{text, Harness};
use ormctx_core::{
    CollectionData, CollectionKind, CoreError, Element, EntityProxy, EntityRef, Instance, MergeMap,
    PersistentCollection, Value,
};
use ormctx_testkit::Record;

fn book(id: i64) -> EntityRef {
    Record::create("Book", id, vec![text(&format!("isbn-{id}"))])
}

fn author_with_books(h: &mut Harness, id: i64, books: &[&EntityRef]) -> EntityRef {
    let author = h.manage("Author", id, vec![text(&format!("author-{id}")), Value::Null]);
    let data = CollectionData::Bag(books.iter().map(|b| Element::from((*b).clone())).collect());
    Record::of(&author).set_collection("books", PersistentCollection::new(data));
    author
}

#[test]
fn owner_is_the_entity_whose_collection_holds_the_child() {
    let mut h = Harness::new();
    let kindred = book(1);
    let dawn = book(2);
    author_with_books(&mut h, 10, &[&dawn]);
    author_with_books(&mut h, 11, &[&kindred]);

    let owner = h
        .ctx
        .get_owner_id("Author", "books", &Instance::Entity(kindred), None)
        .unwrap();

    assert_eq!(owner, Some(Value::Integer(11)));
}

#[test]
fn subclass_owners_are_considered() {
    let mut h = Harness::new();
    let kindred = book(1);
    let novelist = h.manage("Novelist", 12, vec![text("novelist"), Value::Null]);
    Record::of(&novelist).set_collection(
        "books",
        PersistentCollection::new(CollectionData::Bag(vec![Element::from(kindred.clone())])),
    );

    let owner = h
        .ctx
        .get_owner_id("Author", "books", &Instance::Entity(kindred), None)
        .unwrap();

    assert_eq!(owner, Some(Value::Integer(12)));
}

#[test]
fn orphans_have_no_owner() {
    let mut h = Harness::new();
    author_with_books(&mut h, 10, &[&book(2)]);
    let orphan = Instance::Entity(book(3));
    assert_eq!(h.ctx.get_owner_id("Author", "books", &orphan, None).unwrap(), None);
    assert_eq!(h.ctx.get_index_in_owner("Author", "books", &orphan, None).unwrap(), None);
}

#[test]
fn uninitialized_collections_are_not_searched() {
    let mut h = Harness::new();
    let author = h.manage("Author", 10, vec![text("author-10"), Value::Null]);
    Record::of(&author).set_collection("books", PersistentCollection::uninitialized(CollectionKind::Bag));

    let owner = h
        .ctx
        .get_owner_id("Author", "books", &Instance::Entity(book(1)), None)
        .unwrap();

    assert_eq!(owner, None);
}

#[test]
fn unmapped_properties_and_entities_are_rejected() {
    let mut h = Harness::new();
    let child = Instance::Entity(book(1));

    let err = h.ctx.get_owner_id("Author", "awards", &child, None).unwrap_err();
    assert!(matches!(err, CoreError::UnknownCollectionRole { .. }));

    let err = h.ctx.get_index_in_owner("Publisher", "books", &child, None).unwrap_err();
    assert!(matches!(err, CoreError::UnknownEntity { .. }));
}

#[test]
fn a_remembered_parent_is_used_when_still_valid() {
    let mut h = Harness::new();
    let kindred = book(1);
    let author = author_with_books(&mut h, 10, &[&kindred]);
    let child = Instance::Entity(kindred);
    h.ctx.add_child_parent(child.clone(), author);

    assert_eq!(
        h.ctx.get_owner_id("Author", "books", &child, None).unwrap(),
        Some(Value::Integer(10))
    );
}

#[test]
fn a_stale_parent_falls_back_to_the_scan() {
    let mut h = Harness::new();
    let kindred = book(1);
    let former = author_with_books(&mut h, 10, &[]);
    author_with_books(&mut h, 11, &[&kindred]);
    let child = Instance::Entity(kindred);
    h.ctx.add_child_parent(child.clone(), former.clone());

    assert_eq!(
        h.ctx.get_owner_id("Author", "books", &child, None).unwrap(),
        Some(Value::Integer(11))
    );

    h.ctx.remove_child_parent(&child);
    assert_eq!(
        h.ctx.get_owner_id("Author", "books", &child, None).unwrap(),
        Some(Value::Integer(11))
    );
}

#[test]
fn merges_consult_the_detached_graph() {
    let mut h = Harness::new();
    let managed_author = author_with_books(&mut h, 10, &[]);
    let managed_book = book(1);

    let detached_book = book(1);
    let detached_author = Record::create("Author", 10, vec![text("author-10"), Value::Null]);
    Record::of(&detached_author).set_collection(
        "books",
        PersistentCollection::new(CollectionData::Bag(vec![Element::from(detached_book.clone())])),
    );

    let mut merge_map = MergeMap::new();
    merge_map.insert(Instance::Entity(managed_author), Instance::Entity(detached_author));
    merge_map.insert(Instance::Entity(managed_book.clone()), Instance::Entity(detached_book));

    let child = Instance::Entity(managed_book);
    assert_eq!(h.ctx.get_owner_id("Author", "books", &child, None).unwrap(), None);
    assert_eq!(
        h.ctx.get_owner_id("Author", "books", &child, Some(&merge_map)).unwrap(),
        Some(Value::Integer(10))
    );
}

#[test]
fn merges_consult_detached_proxies_standing_in_for_the_owner() {
    let mut h = Harness::new();
    let managed_book = book(1);
    let detached_owner = Record::create("Author", 20, vec![text("author-20"), Value::Null]);
    Record::of(&detached_owner).set_collection(
        "books",
        PersistentCollection::new(CollectionData::Bag(vec![Element::from(managed_book.clone())])),
    );
    let proxy = EntityProxy::new("Author", Value::Integer(20));

    let mut merge_map = MergeMap::new();
    merge_map.insert(Instance::Proxy(proxy), Instance::Entity(detached_owner));

    let owner = h
        .ctx
        .get_owner_id("Author", "books", &Instance::Entity(managed_book), Some(&merge_map))
        .unwrap();

    assert_eq!(owner, Some(Value::Integer(20)));
}

#[test]
fn list_positions_are_indexes() {
    let mut h = Harness::new();
    let managed = h.manage("Book", 1, vec![text("isbn-1")]);
    let first = Record::create("Chapter", 1, Vec::new());
    let second = Record::create("Chapter", 2, Vec::new());
    Record::of(&managed).set_collection(
        "chapters",
        PersistentCollection::new(CollectionData::List(vec![
            Element::from(first.clone()),
            Element::from(second.clone()),
        ])),
    );

    let index = h
        .ctx
        .get_index_in_owner("Book", "chapters", &Instance::Entity(second), None)
        .unwrap();

    assert_eq!(index, Some(Value::Integer(1)));
}

#[test]
fn map_keys_are_indexes() {
    let mut h = Harness::new();
    let managed = h.manage("Book", 1, vec![text("isbn-1")]);
    let preface = Record::create("Chapter", 1, Vec::new());
    let mut data = CollectionData::empty(CollectionKind::Map);
    data.put(text("preface"), Element::from(preface.clone()));
    Record::of(&managed).set_collection("chapters", PersistentCollection::new(data));

    let index = h
        .ctx
        .get_index_in_owner("Book", "chapters", &Instance::Entity(preface), None)
        .unwrap();

    assert_eq!(index, Some(text("preface")));
}

#[test]
fn bags_have_no_index() {
    let mut h = Harness::new();
    let kindred = book(1);
    author_with_books(&mut h, 10, &[&kindred]);

    let index = h
        .ctx
        .get_index_in_owner("Author", "books", &Instance::Entity(kindred), None)
        .unwrap();

    assert_eq!(index, None);
}

#[test]
fn indexes_can_come_from_the_detached_graph() {
    let mut h = Harness::new();
    let managed_owner = h.manage("Book", 1, vec![text("isbn-1")]);
    Record::of(&managed_owner).set_collection(
        "chapters",
        PersistentCollection::new(CollectionData::empty(CollectionKind::List)),
    );
    let managed_chapter = Record::create("Chapter", 3, Vec::new());

    let detached_chapter = Record::create("Chapter", 3, Vec::new());
    let detached_owner = Record::create("Book", 1, vec![text("isbn-1")]);
    Record::of(&detached_owner).set_collection(
        "chapters",
        PersistentCollection::new(CollectionData::List(vec![
            Element::Value(text("front matter")),
            Element::from(detached_chapter.clone()),
        ])),
    );

    let mut merge_map = MergeMap::new();
    merge_map.insert(Instance::Entity(managed_owner), Instance::Entity(detached_owner));
    merge_map.insert(Instance::Entity(managed_chapter.clone()), Instance::Entity(detached_chapter));

    let index = h
        .ctx
        .get_index_in_owner("Book", "chapters", &Instance::Entity(managed_chapter), Some(&merge_map))
        .unwrap();

    assert_eq!(index, Some(Value::Integer(1)));
}

#[test]
fn cascade_levels_gate_orphan_removal() {
    let mut h = Harness::new();
    h.ctx.increment_cascade_level();
    h.ctx.begin_remove_orphan_before_updates().unwrap();
    h.ctx.increment_cascade_level();
    h.ctx.begin_remove_orphan_before_updates().unwrap();

    assert!(h.ctx.is_removing_orphan_before_updates());
    h.ctx.end_remove_orphan_before_updates().unwrap();
    h.ctx.decrement_cascade_level();
    h.ctx.end_remove_orphan_before_updates().unwrap();
    h.ctx.decrement_cascade_level();

    assert!(!h.ctx.is_removing_orphan_before_updates());
    assert_eq!(h.ctx.cascade_level(), 0);
}
