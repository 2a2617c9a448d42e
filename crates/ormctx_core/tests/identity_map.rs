//! Identity map, entries, snapshots and read-only management.

mod common;

use common::{text, Harness};
use ormctx_core::{
    CoreError, EntityUniqueKey, EntryParams, Instance, LockMode, PersistenceContext, Status, Value,
};
use ormctx_testkit::{context_ops_strategy, ContextOp, FixtureMetamodel, Record, RecordPersister, TestSession};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn author_state(n: i64) -> Vec<Value> {
    vec![text(&format!("author-{n}")), text(&format!("a{n}@example.org"))]
}

#[test]
fn loaded_entities_are_found_until_removed() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, author_state(1));
    let key = h.key("Author", 1);

    assert!(h.ctx.contains_entity(&key));
    assert!(h.ctx.get_entity(&key).unwrap().ptr_eq(&author));
    assert!(h.ctx.is_entry_for(&author));
    assert_eq!(h.ctx.number_of_managed_entities(), 1);

    let removed = h.ctx.remove_entity(&key).unwrap();
    assert!(removed.ptr_eq(&author));
    assert!(!h.ctx.contains_entity(&key));
    assert!(h.ctx.get_entity(&key).is_none());
}

#[test]
fn subclass_instances_share_the_root_key_space() {
    let mut h = Harness::new();
    let novelist = h.manage("Novelist", 7, author_state(7));
    let as_author = h.key("Author", 7);
    assert!(h.ctx.get_entity(&as_author).unwrap().ptr_eq(&novelist));
}

#[test]
fn removing_an_entity_drops_its_unique_keys_only() {
    let mut h = Harness::new();
    let first = h.manage("Author", 1, author_state(1));
    let second = h.manage("Author", 2, author_state(2));
    let by_email = |n: i64| EntityUniqueKey::new("Author", "email", text(&format!("a{n}@example.org")), "string");
    h.ctx.add_entity_by_unique_key(by_email(1), first.clone());
    h.ctx.add_entity_by_unique_key(by_email(2), second.clone());

    let key = h.key("Author", 1);
    h.ctx.remove_entity(&key);

    assert!(h.ctx.get_entity_by_unique_key(&by_email(1)).is_none());
    assert!(h.ctx.get_entity_by_unique_key(&by_email(2)).unwrap().ptr_eq(&second));
}

#[test]
fn removing_an_entity_drops_its_batch_registration_and_marks() {
    let mut h = Harness::new();
    h.manage("Author", 1, author_state(1));
    let key = h.key("Author", 1);
    let persister = h.persister("Author");
    h.ctx.batch_fetch_queue().add_batch_loadable_entity_key(&key, persister.as_ref());
    h.ctx.add_nullifiable_entity_key(key.clone());
    assert!(h.ctx.batch_fetch_queue().contains_entity_key(&key));

    h.ctx.remove_entity(&key);

    assert!(!h.ctx.batch_fetch_queue().contains_entity_key(&key));
    assert!(!h.ctx.is_nullifiable_entity_key_registered(&key));
}

#[test]
fn adding_an_entity_takes_its_key_out_of_the_batch_queue() {
    let mut h = Harness::new();
    let key = h.key("Author", 3);
    let persister = h.persister("Author");
    h.ctx.batch_fetch_queue().add_batch_loadable_entity_key(&key, persister.as_ref());

    h.ctx.add_entity(key.clone(), Record::create("Author", 3, author_state(3)));

    assert!(!h.ctx.batch_fetch_queue().contains_entity_key(&key));
}

#[test]
fn uniqueness_check_distinguishes_same_and_different_instances() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, author_state(1));
    let key = h.key("Author", 1);

    let same = h.ctx.check_uniqueness(&key, &Instance::Entity(author));
    assert!(matches!(same, Err(CoreError::AssertionFailure { .. })));

    let other = Record::create("Author", 1, author_state(1));
    let different = h.ctx.check_uniqueness(&key, &Instance::Entity(other));
    assert!(matches!(different, Err(CoreError::NonUniqueObject { .. })));

    let free = h.key("Author", 2);
    let fresh = Record::create("Author", 2, author_state(2));
    assert!(h.ctx.check_uniqueness(&free, &Instance::Entity(fresh)).is_ok());
}

#[test]
fn database_snapshots_are_read_once() {
    let mut h = Harness::new();
    let authors = h.model.record("Author");
    authors.insert_row(1, author_state(1));

    let first = h.ctx.get_database_snapshot(&Value::Integer(1), authors.as_ref()).unwrap();
    let second = h.ctx.get_database_snapshot(&Value::Integer(1), authors.as_ref()).unwrap();

    assert_eq!(first, Some(author_state(1)));
    assert_eq!(second, first);
    assert_eq!(authors.snapshot_reads(), 1);

    let key = h.key("Author", 1);
    assert_eq!(h.ctx.get_cached_database_snapshot(&key).unwrap(), first);
}

#[test]
fn missing_rows_are_cached_as_no_row() {
    let mut h = Harness::new();
    let authors = h.model.record("Author");

    assert_eq!(h.ctx.get_database_snapshot(&Value::Integer(9), authors.as_ref()).unwrap(), None);
    assert_eq!(h.ctx.get_database_snapshot(&Value::Integer(9), authors.as_ref()).unwrap(), None);
    assert_eq!(authors.snapshot_reads(), 1);

    let key = h.key("Author", 9);
    let cached = h.ctx.get_cached_database_snapshot(&key);
    assert!(matches!(cached, Err(CoreError::IllegalState { .. })));

    let never_read = h.key("Author", 10);
    assert_eq!(h.ctx.get_cached_database_snapshot(&never_read).unwrap(), None);
}

#[test]
fn mutable_natural_ids_are_projected_from_the_snapshot() {
    let mut h = Harness::new();
    let authors = h.model.record("Author");
    authors.insert_row(1, author_state(1));

    let natural_id = h.ctx.get_natural_id_snapshot(&Value::Integer(1), authors.as_ref()).unwrap();
    assert_eq!(natural_id, Some(text("author-1")));
    assert_eq!(
        h.ctx
            .natural_id_resolutions()
            .find_cached_id_by_natural_id(&text("author-1"), authors.as_ref()),
        Some(Value::Integer(1))
    );

    // a second call is answered by the resolutions
    h.ctx.get_natural_id_snapshot(&Value::Integer(1), authors.as_ref()).unwrap();
    assert_eq!(authors.snapshot_reads(), 1);
}

#[test]
fn losing_natural_id_resolutions_only_costs_a_read() {
    let mut h = Harness::new();
    let authors = h.model.record("Author");
    authors.insert_row(1, author_state(1));
    let before = h.ctx.get_natural_id_snapshot(&Value::Integer(1), authors.as_ref()).unwrap();

    h.ctx.natural_id_resolutions().clear();
    let after = h.ctx.get_natural_id_snapshot(&Value::Integer(1), authors.as_ref()).unwrap();

    assert_eq!(before, after);
}

#[test]
fn immutable_natural_ids_bypass_the_row_snapshot() {
    let mut h = Harness::new();
    let books = h.model.record("Book");
    books.insert_row(4, vec![text("isbn-4"), text("The Dispossessed")]);

    let natural_id = h.ctx.get_natural_id_snapshot(&Value::Integer(4), books.as_ref()).unwrap();

    assert_eq!(natural_id, Some(text("isbn-4")));
    assert_eq!(books.snapshot_reads(), 0);
}

#[test]
fn entities_without_natural_id_have_no_natural_id_snapshot() {
    let mut h = Harness::new();
    let novelists = h.model.record("Novelist");
    let natural_id = h.ctx.get_natural_id_snapshot(&Value::Integer(1), novelists.as_ref()).unwrap();
    assert_eq!(natural_id, None);
}

#[test]
fn modifiable_statuses_raise_the_non_read_only_flag_until_clear() {
    let mut h = Harness::new();
    let entity = Record::create("Author", 1, author_state(1));
    let params = EntryParams::new(h.persister("Author"), Value::Integer(1)).status(Status::ReadOnly);
    h.ctx.add_entry(entity.clone(), params).unwrap();
    assert!(!h.ctx.has_non_read_only_entities());

    h.ctx.set_entry_status(&entity, Status::Deleted).unwrap();
    assert!(h.ctx.has_non_read_only_entities());
    assert_eq!(h.ctx.get_entry(&entity).unwrap().previous_status(), Some(Status::ReadOnly));

    h.ctx.set_entry_status(&entity, Status::Gone).unwrap();
    assert!(h.ctx.has_non_read_only_entities());

    h.ctx.clear();
    assert!(!h.ctx.has_non_read_only_entities());
}

#[test]
fn clear_keeps_the_default_read_only_setting() {
    let mut h = Harness::new();
    h.manage("Author", 1, author_state(1));
    h.ctx.set_default_read_only(true);

    h.ctx.clear();

    assert!(h.ctx.is_default_read_only());
    assert_eq!(h.ctx.number_of_managed_entities(), 0);
}

#[test]
fn status_of_an_untracked_entity_cannot_change() {
    let mut h = Harness::new();
    let stranger = Record::create("Author", 5, author_state(5));
    let err = h.ctx.set_entry_status(&stranger, Status::Managed).unwrap_err();
    assert!(matches!(err, CoreError::TransientObject { .. }));
}

#[test]
fn entries_exist_exactly_while_tracked() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, author_state(1));
    assert_eq!(h.ctx.get_entry(&author).unwrap().id(), &Value::Integer(1));

    let entry = h.ctx.remove_entry(&author).unwrap();
    assert_eq!(entry.status(), Status::Managed);
    assert!(!h.ctx.is_entry_for(&author));
    assert!(h.ctx.remove_entry(&author).is_none());
}

#[test]
fn reference_entries_take_the_given_status() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, author_state(1));
    let entry = h.ctx.remove_entry(&author).unwrap();

    let restored = h.ctx.add_reference_entry(author.clone(), entry, Status::ReadOnly);
    assert_eq!(restored.status(), Status::ReadOnly);
    assert!(restored.loaded_state().is_none());
}

#[test]
fn read_only_round_trip_reloads_state() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, author_state(1));
    let instance = Instance::Entity(author.clone());

    h.ctx.set_read_only(&instance, true).unwrap();
    assert!(h.ctx.is_read_only(&instance).unwrap());
    assert!(h.ctx.get_entry(&author).unwrap().loaded_state().is_none());

    Record::of(&author).set(0, "renamed");
    h.ctx.set_read_only(&instance, false).unwrap();
    assert!(!h.ctx.is_read_only(&instance).unwrap());
    let state = h.ctx.get_entry(&author).unwrap().loaded_state().unwrap().to_vec();
    assert_eq!(state[0], text("renamed"));
}

#[test]
fn read_only_of_a_deleted_entity_is_undefined() {
    let mut h = Harness::new();
    let author = h.manage("Author", 1, author_state(1));
    h.ctx.set_entry_status(&author, Status::Deleted).unwrap();
    let err = h.ctx.is_read_only(&Instance::Entity(author)).unwrap_err();
    assert!(matches!(err, CoreError::IllegalState { .. }));
}

#[test]
fn immutable_entities_refuse_to_become_modifiable() {
    let model = Arc::new(FixtureMetamodel::new().entity(RecordPersister::new("Genre").immutable()));
    let session = TestSession::open(&model);
    let mut ctx = PersistenceContext::new(&session.handle());

    let genre = Record::create("Genre", 1, vec![text("fantasy")]);
    let params = EntryParams::new(model.record("Genre"), Value::Integer(1)).status(Status::ReadOnly);
    ctx.add_entry(genre.clone(), params).unwrap();

    let err = ctx.set_read_only(&Instance::Entity(genre), false).unwrap_err();
    assert!(matches!(err, CoreError::IllegalState { .. }));
}

#[test]
fn unassociated_instances_have_no_read_only_state() {
    let h = Harness::new();
    let stranger = Record::create("Author", 2, author_state(2));
    let err = h.ctx.is_read_only(&Instance::Entity(stranger)).unwrap_err();
    assert!(matches!(err, CoreError::TransientObject { .. }));
}

#[test]
fn delayed_identity_keys_are_replaced() {
    let mut h = Harness::new();
    let author = h.manage("Author", -1, author_state(0));
    let temporary = h.key("Author", -1);

    h.ctx
        .replace_delayed_entity_identity_insert_keys(&temporary, Value::Integer(40))
        .unwrap();

    let generated = h.key("Author", 40);
    assert!(h.ctx.get_entity(&temporary).is_none());
    assert!(h.ctx.get_entity(&generated).unwrap().ptr_eq(&author));
    assert_eq!(h.ctx.get_entry(&author).unwrap().id(), &Value::Integer(40));
    assert_eq!(h.ctx.get_entry(&author).unwrap().entity_key(), &generated);
}

#[test]
fn replacing_an_unknown_key_fails() {
    let mut h = Harness::new();
    let missing = h.key("Author", -5);
    let err = h
        .ctx
        .replace_delayed_entity_identity_insert_keys(&missing, Value::Integer(1))
        .unwrap_err();
    assert!(matches!(err, CoreError::TransientObject { .. }));
}

#[test]
fn nullifiable_and_deleted_unloaded_keys() {
    let mut h = Harness::new();
    let key = h.key("Author", 1);
    assert!(h.ctx.is_nullifiable_entity_keys_empty());

    h.ctx.add_nullifiable_entity_key(key.clone());
    h.ctx.register_deleted_unloaded_entity_key(key.clone());
    assert!(h.ctx.is_nullifiable_entity_key_registered(&key));
    assert!(h.ctx.is_deleted_unloaded_entity(&key));

    assert!(h.ctx.remove_deleted_unloaded_entity_key(&key));
    assert!(!h.ctx.is_deleted_unloaded_entity(&key));
    assert!(!h.ctx.remove_deleted_unloaded_entity_key(&key));
}

#[test]
fn inserted_keys_are_tracked_for_cacheable_entities_until_completion() {
    let mut h = Harness::new();
    let authors = h.persister("Author");
    let books = h.persister("Book");

    h.ctx.register_inserted_key(authors.as_ref(), Value::Integer(5));
    h.ctx.register_inserted_key(books.as_ref(), Value::Integer(5));
    assert!(h.ctx.was_inserted_during_transaction(authors.as_ref(), &Value::Integer(5)));
    assert!(!h.ctx.was_inserted_during_transaction(books.as_ref(), &Value::Integer(5)));

    h.ctx.after_transaction_completion();
    assert!(!h.ctx.was_inserted_during_transaction(authors.as_ref(), &Value::Integer(5)));
}

#[test]
fn transaction_completion_downgrades_locks() {
    let mut h = Harness::new();
    let author = Record::create("Author", 1, author_state(1));
    let params = EntryParams::new(h.persister("Author"), Value::Integer(1)).lock_mode(LockMode::Write);
    h.ctx.add_entry(author.clone(), params).unwrap();

    h.ctx.after_transaction_completion();

    assert_eq!(h.ctx.get_entry(&author).unwrap().lock_mode(), LockMode::None);
}

#[test]
fn counters_and_flags() {
    let mut h = Harness::new();

    assert_eq!(h.ctx.increment_cascade_level(), 1);
    assert_eq!(h.ctx.increment_cascade_level(), 2);
    assert_eq!(h.ctx.decrement_cascade_level(), 1);
    assert_eq!(h.ctx.cascade_level(), 1);

    h.ctx.before_load();
    assert!(!h.ctx.is_load_finished());
    h.ctx.after_load();
    assert!(h.ctx.is_load_finished());

    h.ctx.set_flushing(true);
    assert!(h.ctx.is_flushing());
    h.ctx.set_flushing(false);
    assert!(!h.ctx.is_flushing());
}

#[test]
fn orphan_removal_counter_must_balance() {
    let mut h = Harness::new();
    assert!(h.ctx.begin_remove_orphan_before_updates().is_err());

    h.ctx.increment_cascade_level();
    assert!(h.ctx.end_remove_orphan_before_updates().is_err());
    h.ctx.begin_remove_orphan_before_updates().unwrap();
    assert!(h.ctx.begin_remove_orphan_before_updates().is_err());
    assert!(h.ctx.is_removing_orphan_before_updates());
    h.ctx.end_remove_orphan_before_updates().unwrap();
    assert!(!h.ctx.is_removing_orphan_before_updates());
}

#[test]
fn null_associations_are_remembered() {
    let mut h = Harness::new();
    let owner = h.key("Book", 1);
    h.ctx.add_null_property(owner.clone(), "editor");
    assert!(h.ctx.is_property_null(&owner, "editor"));
    assert!(!h.ctx.is_property_null(&owner, "publisher"));
}

#[test]
fn display_lists_entity_keys() {
    let mut h = Harness::new();
    h.manage("Author", 1, author_state(1));
    let shown = h.ctx.to_string();
    assert!(shown.starts_with("PersistenceContext[entityKeys=["));
    assert!(shown.contains("Author"));
}

#[test]
fn operations_fail_once_the_session_is_gone() {
    let model = ormctx_testkit::library();
    let session = TestSession::open(&model);
    let ctx = PersistenceContext::new(&session.handle());
    drop(session);

    let err = ctx
        .generate_entity_key(Value::Integer(1), model.record("Author").as_ref())
        .unwrap_err();
    assert!(matches!(err, CoreError::IllegalState { .. }));
}

proptest! {
    #[test]
    fn identity_map_matches_a_model(ops in context_ops_strategy(40)) {
        let mut h = Harness::new();
        let authors = h.persister("Author");
        let mut model: HashMap<i64, ormctx_core::EntityRef> = HashMap::new();
        let mut proxies = Vec::new();

        for op in ops {
            match op {
                ContextOp::Add(id) => {
                    let key = h.key("Author", id);
                    let candidate = Instance::Entity(Record::create("Author", id, author_state(id)));
                    if model.contains_key(&id) {
                        prop_assert!(h.ctx.check_uniqueness(&key, &candidate).is_err());
                    } else {
                        prop_assert!(h.ctx.check_uniqueness(&key, &candidate).is_ok());
                        let entity = h.manage("Author", id, author_state(id));
                        model.insert(id, entity);
                    }
                }
                ContextOp::Remove(id) => {
                    let key = h.key("Author", id);
                    if let Some(entity) = h.ctx.remove_entity(&key) {
                        h.ctx.remove_entry(&entity);
                    }
                    model.remove(&id);
                }
                ContextOp::Proxy(id) => {
                    let proxy = authors.create_proxy(Value::Integer(id));
                    h.ctx.reassociate_proxy(&Instance::Proxy(proxy.clone()), Value::Integer(id)).unwrap();
                    proxies.push(proxy);
                }
                ContextOp::ReadOnly(id, read_only) => {
                    if let Some(entity) = model.get(&id) {
                        let instance = Instance::Entity(entity.clone());
                        h.ctx.set_read_only(&instance, read_only).unwrap();
                        prop_assert_eq!(h.ctx.is_read_only(&instance).unwrap(), read_only);
                    }
                }
                ContextOp::Evict(id) => {
                    h.ctx.natural_id_resolutions().remove_local_resolution(&Value::Integer(id), authors.as_ref());
                }
                ContextOp::Clear => {
                    h.ctx.clear();
                    model.clear();
                }
            }
        }

        prop_assert_eq!(h.ctx.number_of_managed_entities(), model.len());
        prop_assert_eq!(h.ctx.managed_entities().len(), model.len());
        for (id, entity) in &model {
            let key = h.key("Author", *id);
            prop_assert!(h.ctx.get_entity(&key).unwrap().ptr_eq(entity));
            prop_assert!(h.ctx.is_entry_for(entity));
        }
    }
}
