//! Collection admission, loading, batching and owner resolution.

mod common;

use common::{text, Harness};
use ormctx_core::{
    CollectionData, CollectionKey, CollectionKind, CollectionPersister, CollectionRef, CoreError, Element,
    EntityUniqueKey, Instance, PersistenceContext, PersistentCollection, Value,
};
use ormctx_testkit::{FixtureCollectionPersister, FixtureMetamodel, Record, RecordPersister, TestSession};
use std::sync::Arc;

fn row(n: i64) -> Vec<Value> {
    vec![text(&format!("author-{n}")), text(&format!("a{n}@example.org"))]
}

fn titles(names: &[&str]) -> CollectionData {
    CollectionData::Bag(names.iter().map(|n| Element::Value(text(n))).collect())
}

#[test]
fn uninitialized_collections_are_indexed_and_queued() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let collection = PersistentCollection::uninitialized(CollectionKind::Bag);

    h.ctx.add_uninitialized_collection(&books, &collection, Value::Integer(1)).unwrap();

    let entry = h.ctx.get_collection_entry(&collection).unwrap();
    assert_eq!(entry.role(), Some("Author.books"));
    assert_eq!(entry.loaded_key(), Some(&Value::Integer(1)));
    assert_eq!(collection.role().as_deref(), Some("Author.books"));
    assert_eq!(collection.key(), Some(Value::Integer(1)));

    let key = CollectionKey::new("Author.books", Value::Integer(1));
    assert!(Arc::ptr_eq(&h.ctx.get_collection(&key).unwrap(), &collection));
    assert!(h.ctx.batch_fetch_queue().contains_collection(&collection));
}

#[test]
fn roles_without_batching_are_not_queued() {
    let mut h = Harness::new();
    let aliases = h.role("Author.aliases");
    let collection = PersistentCollection::uninitialized(CollectionKind::Set);

    h.ctx
        .add_uninitialized_collection(&aliases, &collection, text("a1@example.org"))
        .unwrap();

    assert!(!h.ctx.batch_fetch_queue().contains_collection(&collection));
}

#[test]
fn admitting_the_same_wrapper_twice_is_a_bug() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &collection, Value::Integer(1)).unwrap();

    let err = h
        .ctx
        .add_uninitialized_collection(&books, &collection, Value::Integer(1))
        .unwrap_err();
    assert!(matches!(err, CoreError::AssertionFailure { .. }));
}

#[test]
fn a_new_wrapper_for_the_same_key_evicts_the_old_one() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let old = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &old, Value::Integer(1)).unwrap();
    old.set_current_session(h.ctx.session_link().clone()).unwrap();

    let replacement = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &replacement, Value::Integer(1)).unwrap();

    assert!(!h.ctx.contains_collection(&old));
    assert!(old.session_id().is_none());
    let key = CollectionKey::new("Author.books", Value::Integer(1));
    assert!(Arc::ptr_eq(&h.ctx.get_collection(&key).unwrap(), &replacement));
    assert_eq!(h.ctx.collection_entries_len(), 1);
}

#[test]
fn bound_collections_load_their_elements() {
    let mut h = Harness::new();
    h.model.role("Author.books").store(1, titles(&["Kindred", "Dawn"]));
    let books = h.role("Author.books");
    let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &collection, Value::Integer(1)).unwrap();
    assert!(collection.set_current_session(h.ctx.session_link().clone()).unwrap());

    collection.force_initialization().unwrap();

    assert!(collection.was_initialized());
    assert_eq!(collection.snapshot(), titles(&["Kindred", "Dawn"]));
}

#[test]
fn unbound_collections_cannot_load() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &collection, Value::Integer(1)).unwrap();

    let err = collection.force_initialization().unwrap_err();
    assert!(matches!(err, CoreError::LazyInitialization { .. }));
    assert!(err.to_string().contains("no Session"));
    assert!(!collection.contains(&Instance::Entity(Record::create("Book", 1, Vec::new()))));
}

#[test]
fn collections_stay_with_one_open_session() {
    let h = Harness::new();
    let other = TestSession::open(&h.model);
    let other_ctx = PersistenceContext::new(&other.handle());
    let collection = PersistentCollection::new(titles(&["Dawn"]));
    collection.set_current_session(other_ctx.session_link().clone()).unwrap();

    let err = collection.set_current_session(h.ctx.session_link().clone()).unwrap_err();
    assert!(matches!(err, CoreError::IllegalState { .. }));
    assert!(!collection.unset_session(h.ctx.session_id()));

    other.close();
    assert!(collection.set_current_session(h.ctx.session_link().clone()).unwrap());
    assert!(!collection.set_current_session(h.ctx.session_link().clone()).unwrap());
    assert!(collection.unset_session(h.ctx.session_id()));
}

#[test]
fn initialized_collections_keep_a_snapshot_when_mutable() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let collection = PersistentCollection::new(titles(&["Wild Seed"]));

    let entry = h.ctx.add_initialized_collection(&books, &collection, Value::Integer(2)).unwrap();

    assert_eq!(entry.snapshot(), Some(&titles(&["Wild Seed"])));
    assert_eq!(h.ctx.get_snapshot(&collection), Some(titles(&["Wild Seed"])));
    assert_eq!(collection.stored_snapshot(), Some(titles(&["Wild Seed"])));
}

#[test]
fn immutable_roles_keep_no_snapshot() {
    let model = Arc::new(
        FixtureMetamodel::new()
            .entity(RecordPersister::new("Shelf"))
            .collection(FixtureCollectionPersister::new("Shelf", "labels").immutable()),
    );
    let session = TestSession::open(&model);
    let mut ctx = PersistenceContext::new(&session.handle());
    let labels: Arc<dyn CollectionPersister> = model.role("Shelf.labels");
    let collection = PersistentCollection::new(titles(&["sci-fi"]));

    let entry = ctx.add_initialized_collection(&labels, &collection, Value::Integer(1)).unwrap();

    assert!(entry.snapshot().is_none());
}

#[test]
fn new_collections_have_a_role_but_no_key() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let collection = PersistentCollection::new(titles(&["Fledgling"]));
    collection.set_dirty();

    h.ctx.add_new_collection(&books, &collection);

    let entry = h.ctx.get_collection_entry(&collection).unwrap();
    assert_eq!(entry.role(), Some("Author.books"));
    assert!(entry.loaded_key().is_none());
    assert_eq!(entry.snapshot(), Some(&titles(&["Fledgling"])));
    assert!(!collection.is_dirty());
    assert_eq!(h.ctx.collections_by_key().count(), 0);
}

#[test]
fn detached_initialized_collections_reuse_their_stored_state() {
    let mut h = Harness::new();
    let books = h.role("Author.books");

    let never_attached = PersistentCollection::new(titles(&["Parable"]));
    h.ctx.add_initialized_detached_collection(&books, &never_attached).unwrap();
    assert!(h.ctx.get_collection_entry(&never_attached).unwrap().loaded_key().is_none());

    let detached = PersistentCollection::new(titles(&["Talents"]));
    detached.set_snapshot(
        Some(Value::Integer(4)),
        Some("Author.books".to_string()),
        Some(titles(&["Talents", "Parable"])),
    );
    h.ctx.add_initialized_detached_collection(&books, &detached).unwrap();

    let entry = h.ctx.get_collection_entry(&detached).unwrap();
    assert_eq!(entry.loaded_key(), Some(&Value::Integer(4)));
    assert_eq!(entry.snapshot(), Some(&titles(&["Talents", "Parable"])));
    let key = CollectionKey::new("Author.books", Value::Integer(4));
    assert!(Arc::ptr_eq(&h.ctx.get_collection(&key).unwrap(), &detached));
}

#[test]
fn detached_uninitialized_collections_keep_their_key() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let detached = PersistentCollection::uninitialized(CollectionKind::Bag);
    detached.set_snapshot(Some(Value::Integer(6)), Some("Author.books".to_string()), None);

    h.ctx.add_uninitialized_detached_collection(&books, &detached).unwrap();

    let key = CollectionKey::new("Author.books", Value::Integer(6));
    assert!(Arc::ptr_eq(&h.ctx.get_collection(&key).unwrap(), &detached));
    assert!(h.ctx.batch_fetch_queue().contains_collection(&detached));
}

#[test]
fn batches_prefer_keys_registered_after_the_requested_one() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    for id in 1..=4 {
        let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
        h.ctx.add_uninitialized_collection(&books, &collection, Value::Integer(id)).unwrap();
    }

    let batch = h
        .ctx
        .batch_fetch_queue()
        .collection_batch(books.as_ref(), &Value::Integer(2), 3);

    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0], Value::Integer(2));
    assert!(batch.contains(&Value::Integer(3)));
    assert!(batch.contains(&Value::Integer(4)));
}

#[test]
fn initialized_collections_are_skipped_by_batches() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let loaded = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &loaded, Value::Integer(1)).unwrap();
    let pending = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &pending, Value::Integer(2)).unwrap();
    loaded.inject_loaded(CollectionData::empty(CollectionKind::Bag));

    let batch = h
        .ctx
        .batch_fetch_queue()
        .collection_batch(books.as_ref(), &Value::Integer(3), 4);

    assert_eq!(batch, vec![Value::Integer(3), Value::Integer(2)]);
}

#[test]
fn non_lazy_collections_drain_last_first_once() {
    let mut h = Harness::new();
    let first = PersistentCollection::new(titles(&["one"]));
    let second = PersistentCollection::new(titles(&["two"]));
    h.ctx.add_non_lazy_collection(first.clone());
    h.ctx.add_non_lazy_collection(second.clone());
    let owner = h.key("Author", 1);
    h.ctx.add_null_property(owner.clone(), "agent");

    let mut seen = Vec::new();
    h.ctx
        .initialize_non_lazy_collections_with(|ctx, collection| {
            assert!(!ctx.is_load_finished());
            // nested calls return without draining
            ctx.initialize_non_lazy_collections_with(|_, _| panic!("nested drain"))?;
            seen.push(collection.clone());
            Ok(())
        })
        .unwrap();

    assert_eq!(seen.len(), 2);
    assert!(Arc::ptr_eq(&seen[0], &second));
    assert!(Arc::ptr_eq(&seen[1], &first));
    assert!(h.ctx.is_load_finished());
    assert!(!h.ctx.is_property_null(&owner, "agent"));
}

#[test]
fn collections_queued_during_a_drain_are_initialized_once() {
    let mut h = Harness::new();
    let root = PersistentCollection::new(titles(&["root"]));
    h.ctx.add_non_lazy_collection(root.clone());

    let mut seen: Vec<CollectionRef> = Vec::new();
    h.ctx
        .initialize_non_lazy_collections_with(|ctx, collection| {
            assert!(!seen.iter().any(|s| Arc::ptr_eq(s, collection)));
            seen.push(collection.clone());
            // each of the first three enqueues one more
            if seen.len() < 4 {
                ctx.add_non_lazy_collection(PersistentCollection::new(titles(&["child"])));
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(seen.len(), 4);
    assert!(Arc::ptr_eq(&seen[0], &root));

    let mut again = 0;
    h.ctx
        .initialize_non_lazy_collections_with(|_, _| {
            again += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(again, 0);
}

#[test]
fn a_failed_drain_keeps_the_rest_queued() {
    let mut h = Harness::new();
    let first = PersistentCollection::new(titles(&["one"]));
    let second = PersistentCollection::new(titles(&["two"]));
    h.ctx.add_non_lazy_collection(first.clone());
    h.ctx.add_non_lazy_collection(second);

    let err = h
        .ctx
        .initialize_non_lazy_collections_with(|_, _| Err(CoreError::illegal_state("boom")))
        .unwrap_err();
    assert!(matches!(err, CoreError::IllegalState { .. }));
    assert!(h.ctx.is_load_finished());

    let mut rest = Vec::new();
    h.ctx
        .initialize_non_lazy_collections_with(|_, c| {
            rest.push(c.clone());
            Ok(())
        })
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert!(Arc::ptr_eq(&rest[0], &first));
}

#[test]
fn non_lazy_collections_load_through_their_session() {
    let mut h = Harness::new();
    h.model.role("Author.books").store(1, titles(&["Kindred"]));
    let books = h.role("Author.books");
    let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &collection, Value::Integer(1)).unwrap();
    collection.set_current_session(h.ctx.session_link().clone()).unwrap();
    h.ctx.add_non_lazy_collection(collection.clone());

    h.ctx.initialize_non_lazy_collections().unwrap();

    assert!(collection.was_initialized());
    assert_eq!(collection.snapshot(), titles(&["Kindred"]));
}

#[test]
fn non_lazy_drain_waits_for_the_outer_load() {
    let mut h = Harness::new();
    let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_non_lazy_collection(collection.clone());

    h.ctx.before_load();
    h.ctx.initialize_non_lazy_collections().unwrap();
    assert!(!collection.was_initialized());
    h.ctx.after_load();

    assert!(h.ctx.initialize_non_lazy_collections().is_err());
}

#[test]
fn unowned_collections_are_handed_out_once() {
    let mut h = Harness::new();
    let key = CollectionKey::new("Author.books", Value::Integer(9));
    let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_unowned_collection(key.clone(), collection.clone());

    assert!(Arc::ptr_eq(&h.ctx.use_unowned_collection(&key).unwrap(), &collection));
    assert!(h.ctx.use_unowned_collection(&key).is_none());
}

#[test]
fn owners_are_found_by_identifier() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, row(1));
    let books = h.role("Author.books");

    let owner = h.ctx.get_collection_owner(&Value::Integer(1), books.as_ref()).unwrap();
    assert!(owner.unwrap().ptr_eq(&author));
    assert!(h.ctx.get_collection_owner(&Value::Integer(2), books.as_ref()).unwrap().is_none());
}

#[test]
fn owners_keyed_by_a_property_use_the_unique_key_index() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, row(1));
    let aliases = h.role("Author.aliases");
    let email = text("a1@example.org");
    h.ctx.add_entity_by_unique_key(
        EntityUniqueKey::new("Author", "email", email.clone(), "property"),
        author.clone(),
    );

    let owner = h.ctx.get_collection_owner(&email, aliases.as_ref()).unwrap();
    assert!(owner.unwrap().ptr_eq(&author));
}

#[test]
fn owners_keyed_by_a_property_fall_back_to_the_persister() {
    let mut h = Harness::new();
    h.model.record("Author").insert_row(3, row(3));
    let author = h.manage("Author", 3, row(3));
    let aliases = h.role("Author.aliases");

    let owner = h.ctx.get_collection_owner(&text("a3@example.org"), aliases.as_ref()).unwrap();
    assert!(owner.unwrap().ptr_eq(&author));
    assert!(h
        .ctx
        .get_collection_owner(&text("nobody@example.org"), aliases.as_ref())
        .unwrap()
        .is_none());
}

#[test]
fn loaded_owner_comes_from_the_entry() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, row(1));
    let books = h.role("Author.books");
    let aliases = h.role("Author.aliases");
    let by_id = PersistentCollection::uninitialized(CollectionKind::Bag);
    let by_property = PersistentCollection::uninitialized(CollectionKind::Set);
    h.ctx.add_uninitialized_collection(&books, &by_id, Value::Integer(1)).unwrap();
    h.ctx
        .add_uninitialized_collection(&aliases, &by_property, text("a1@example.org"))
        .unwrap();

    assert_eq!(h.ctx.get_loaded_collection_owner_id_or_null(&by_id), Some(Value::Integer(1)));
    assert!(h.ctx.get_loaded_collection_owner_or_null(&by_id).unwrap().unwrap().ptr_eq(&author));
    assert!(h.ctx.get_loaded_collection_owner_id_or_null(&by_property).is_none());
    assert!(h.ctx.get_loaded_collection_owner_or_null(&by_property).unwrap().is_none());

    let untracked = PersistentCollection::uninitialized(CollectionKind::Bag);
    assert!(h.ctx.get_loaded_collection_owner_or_null(&untracked).unwrap().is_none());
}

#[test]
fn entries_are_visited_in_admission_order() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let mut admitted = Vec::new();
    for id in [3, 1, 2] {
        let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
        h.ctx.add_uninitialized_collection(&books, &collection, Value::Integer(id)).unwrap();
        admitted.push(collection);
    }

    let mut keys = Vec::new();
    h.ctx.for_each_collection_entry(|_, entry| keys.push(entry.loaded_key().cloned()));
    assert_eq!(keys, vec![Some(Value::Integer(3)), Some(Value::Integer(1)), Some(Value::Integer(2))]);

    for (collection, _) in h.ctx.reentrant_safe_collection_entries() {
        h.ctx.remove_collection_entry(&collection);
    }
    assert_eq!(h.ctx.collection_entries_len(), 0);
    assert_eq!(h.ctx.collections_by_key().count(), 3);

    h.ctx.clear_collections_by_key();
    assert_eq!(h.ctx.collections_by_key().count(), 0);
    drop(admitted);
}

#[test]
fn key_index_can_be_edited_directly() {
    let mut h = Harness::new();
    let key = CollectionKey::new("Book.chapters", Value::Integer(1));
    let first = PersistentCollection::new(CollectionData::List(vec![Element::Value(text("one"))]));
    let second = PersistentCollection::new(CollectionData::List(vec![Element::Value(text("uno"))]));

    assert!(h.ctx.add_collection_by_key(key.clone(), first.clone()).is_none());
    let replaced = h.ctx.add_collection_by_key(key.clone(), second.clone()).unwrap();
    assert!(Arc::ptr_eq(&replaced, &first));
    assert!(Arc::ptr_eq(&h.ctx.remove_collection_by_key(&key).unwrap(), &second));
    assert!(h.ctx.get_collection(&key).is_none());
}

#[test]
fn clear_unbinds_collections() {
    let mut h = Harness::new();
    let books = h.role("Author.books");
    let collection = PersistentCollection::uninitialized(CollectionKind::Bag);
    h.ctx.add_uninitialized_collection(&books, &collection, Value::Integer(1)).unwrap();
    collection.set_current_session(h.ctx.session_link().clone()).unwrap();

    h.ctx.clear();

    assert!(collection.session_id().is_none());
    assert!(!h.ctx.contains_collection(&collection));
    assert!(!h.ctx.batch_fetch_queue().contains_collection(&collection));
    assert!(h.ctx.to_string().ends_with("collectionKeys=[]]"));
}
