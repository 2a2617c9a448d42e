//! Entity identity map, snapshots, entries and read-only management.

use super::{PersistenceContext, Snapshot};
use crate::entry::{EntityEntry, EntryParams};
use crate::error::{CoreError, CoreResult};
use crate::instance::{EntityRef, Instance};
use crate::key::{EntityKey, EntityUniqueKey};
use crate::natural_id::extract_natural_id;
use crate::persister::EntityPersister;
use crate::proxy::ProxyRef;
use crate::types::Status;
use ormctx_codec::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

impl PersistenceContext {
    // ---- identity map ----

    /// Registers an entity under its key.
    ///
    /// The key leaves the batch fetch queue since the entity is now loaded.
    pub fn add_entity(&mut self, key: EntityKey, entity: EntityRef) {
        if let Some(queue) = self.batch_fetch_queue.as_mut() {
            queue.remove_batch_loadable_entity_key(&key);
        }
        let capacity = self.config.initial_capacity;
        self.entities_by_key
            .get_or_insert_with(|| HashMap::with_capacity(capacity))
            .insert(key, entity);
    }

    /// Entity registered under a key.
    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entities_by_key.as_ref()?.get(key).cloned()
    }

    /// Whether an entity is registered under a key.
    pub fn contains_entity(&self, key: &EntityKey) -> bool {
        self.entities_by_key
            .as_ref()
            .is_some_and(|m| m.contains_key(key))
    }

    /// Unregisters the entity of a key.
    ///
    /// Unique keys pointing at the same instance, the snapshot, the
    /// nullifiable mark and any batch or subselect registration of the key
    /// go with it. The parent/child cache is dropped.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityRef> {
        let removed = self.entities_by_key.as_mut().and_then(|m| m.remove(key));
        if let (Some(entity), Some(unique)) = (&removed, self.entities_by_unique_key.as_mut()) {
            unique.retain(|_, e| !e.ptr_eq(entity));
        }
        self.parents_by_child = None;
        if let Some(snapshots) = self.entity_snapshots_by_key.as_mut() {
            snapshots.remove(key);
        }
        if let Some(nullifiable) = self.nullifiable_entity_keys.as_mut() {
            nullifiable.remove(key);
        }
        if let Some(queue) = self.batch_fetch_queue.as_mut() {
            queue.remove_batch_loadable_entity_key(key);
            queue.remove_subselect(key);
        }
        removed
    }

    /// Registered keys and entities.
    pub fn entities_by_key(&self) -> impl Iterator<Item = (&EntityKey, &EntityRef)> {
        self.entities_by_key.iter().flat_map(HashMap::iter)
    }

    /// Every entity in the identity map.
    pub fn managed_entities(&self) -> Vec<EntityRef> {
        self.entities_by_key
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers an entity under a unique key.
    pub fn add_entity_by_unique_key(&mut self, key: EntityUniqueKey, entity: EntityRef) {
        let capacity = self.config.initial_capacity;
        self.entities_by_unique_key
            .get_or_insert_with(|| HashMap::with_capacity(capacity))
            .insert(key, entity);
    }

    /// Entity registered under a unique key.
    pub fn get_entity_by_unique_key(&self, key: &EntityUniqueKey) -> Option<EntityRef> {
        self.entities_by_unique_key.as_ref()?.get(key).cloned()
    }

    /// Fails if a different instance is registered under the key.
    ///
    /// # Errors
    ///
    /// Returns a non-unique object error for a different instance, or an
    /// assertion failure if the same instance is registered without an
    /// entry.
    pub fn check_uniqueness(&self, key: &EntityKey, object: &Instance) -> CoreResult<()> {
        let Some(existing) = self.get_entity(key) else {
            return Ok(());
        };
        if object.as_entity().is_some_and(|e| e.ptr_eq(&existing)) {
            return Err(CoreError::assertion_failure(
                "object already associated, but no entry was found",
            ));
        }
        Err(CoreError::non_unique_object(
            key.entity_name(),
            key.identifier().clone(),
        ))
    }

    // ---- snapshots ----

    /// Current database state of an entity, read once and then cached.
    ///
    /// # Errors
    ///
    /// Returns the persister's error if the read fails.
    pub fn get_database_snapshot(
        &mut self,
        id: &Value,
        persister: &dyn EntityPersister,
    ) -> CoreResult<Option<Vec<Value>>> {
        let key = self.generate_entity_key(id.clone(), persister)?;
        if let Some(cached) = self
            .entity_snapshots_by_key
            .as_ref()
            .and_then(|m| m.get(&key))
        {
            return Ok(match cached {
                Snapshot::Row(row) => Some(row.clone()),
                Snapshot::NoRow => None,
            });
        }
        let loaded = persister.database_snapshot(id)?;
        let capacity = self.config.initial_capacity;
        let snapshot = loaded.clone().map_or(Snapshot::NoRow, Snapshot::Row);
        self.entity_snapshots_by_key
            .get_or_insert_with(|| HashMap::with_capacity(capacity))
            .insert(key, snapshot);
        Ok(loaded)
    }

    /// Cached database state of a key, without reading.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if the key is known to have no row.
    pub fn get_cached_database_snapshot(&self, key: &EntityKey) -> CoreResult<Option<Vec<Value>>> {
        match self
            .entity_snapshots_by_key
            .as_ref()
            .and_then(|m| m.get(key))
        {
            None => Ok(None),
            Some(Snapshot::Row(row)) => Ok(Some(row.clone())),
            Some(Snapshot::NoRow) => Err(CoreError::illegal_state(format!(
                "persistence context reported no row snapshot for {}#{}",
                key.entity_name(),
                key.identifier()
            ))),
        }
    }

    /// Current natural id of an entity.
    ///
    /// Resolutions are consulted first; otherwise an immutable natural id
    /// is read directly and a mutable one is projected from the database
    /// snapshot. Either result is cached.
    ///
    /// # Errors
    ///
    /// Returns the persister's error if a read fails.
    pub fn get_natural_id_snapshot(
        &mut self,
        id: &Value,
        persister: &dyn EntityPersister,
    ) -> CoreResult<Option<Value>> {
        if !persister.has_natural_identifier() {
            return Ok(None);
        }
        if let Some(cached) = self
            .natural_id_resolutions
            .as_ref()
            .and_then(|r| r.find_cached_natural_id_by_id(id, persister))
        {
            return Ok(Some(cached));
        }

        let natural_id = if persister.has_immutable_natural_id() {
            persister.natural_id_snapshot(id)?
        } else {
            self.get_database_snapshot(id, persister)?
                .map(|row| extract_natural_id(&row, persister))
        };
        if let Some(natural_id) = &natural_id {
            self.natural_id_resolutions()
                .cache_resolution_from_load(id, natural_id, persister)?;
        }
        Ok(natural_id)
    }

    // ---- entries ----

    /// Registers an entity and creates its entry.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if the session no longer exists.
    pub fn add_entity_with_entry(
        &mut self,
        key: EntityKey,
        entity: EntityRef,
        params: EntryParams,
    ) -> CoreResult<&mut EntityEntry> {
        self.add_entity(key, entity.clone());
        self.add_entry(entity, params)
    }

    /// Creates the entry of an entity.
    ///
    /// The entry kind comes from the persister.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if the session no longer exists.
    pub fn add_entry(&mut self, entity: EntityRef, params: EntryParams) -> CoreResult<&mut EntityEntry> {
        let key = self.generate_entity_key(params.id.clone(), params.persister.as_ref())?;
        self.note_status(params.status);
        Ok(self
            .entity_entry_context
            .add_entity_entry(entity, EntityEntry::new(params, key)))
    }

    /// Registers an entry built by the caller, moving it to `status`.
    pub fn add_reference_entry(
        &mut self,
        entity: EntityRef,
        mut entry: EntityEntry,
        status: Status,
    ) -> &mut EntityEntry {
        entry.set_status(status);
        self.note_status(status);
        self.entity_entry_context.add_entity_entry(entity, entry)
    }

    /// Entry of an entity.
    pub fn get_entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.entity_entry_context.get_entity_entry(entity)
    }

    /// Mutable entry of an entity, for flush bookkeeping.
    ///
    /// Status changes must go through [`set_entry_status`](Self::set_entry_status).
    pub fn get_entry_mut(&mut self, entity: &EntityRef) -> Option<&mut EntityEntry> {
        self.entity_entry_context.get_entity_entry_mut(entity)
    }

    /// Removes the entry of an entity.
    pub fn remove_entry(&mut self, entity: &EntityRef) -> Option<EntityEntry> {
        self.entity_entry_context.remove_entity_entry(entity)
    }

    /// Whether an entity has an entry.
    pub fn is_entry_for(&self, entity: &EntityRef) -> bool {
        self.entity_entry_context.has_entity_entry(entity)
    }

    /// Moves an entry to a new status.
    ///
    /// # Errors
    ///
    /// Returns a transient object error if the entity has no entry.
    pub fn set_entry_status(&mut self, entity: &EntityRef, status: Status) -> CoreResult<()> {
        let entry = self
            .entity_entry_context
            .get_entity_entry_mut(entity)
            .ok_or_else(|| not_associated(entity))?;
        entry.set_status(status);
        self.note_status(status);
        Ok(())
    }

    fn note_status(&mut self, status: Status) {
        if status.is_modifiable() {
            self.has_non_read_only_entities = true;
        }
    }

    /// Entries copied out, safe to walk while the context changes.
    pub fn reentrant_safe_entity_entries(&self) -> Vec<(EntityRef, EntityEntry)> {
        self.entity_entry_context.reentrant_safe_entity_entries()
    }

    /// Entries in registration order.
    pub fn entity_entries(&self) -> impl Iterator<Item = (&EntityRef, &EntityEntry)> {
        self.entity_entry_context.iter()
    }

    /// Number of entities with an entry.
    pub fn number_of_managed_entities(&self) -> usize {
        self.entity_entry_context.number_of_managed_entities()
    }

    /// Moves an entity inserted with a delayed identity to its generated id.
    ///
    /// # Errors
    ///
    /// Returns a transient object error if no entity is registered under
    /// `old_key`, or an illegal state error if the session is gone.
    pub fn replace_delayed_entity_identity_insert_keys(
        &mut self,
        old_key: &EntityKey,
        generated_id: Value,
    ) -> CoreResult<()> {
        let entity = self
            .entities_by_key
            .as_mut()
            .and_then(|m| m.remove(old_key))
            .ok_or_else(|| {
                CoreError::transient_object(format!("no entity registered under {old_key}"))
            })?;
        let old_entry = self
            .entity_entry_context
            .remove_entity_entry(&entity)
            .ok_or_else(|| not_associated(&entity))?;
        self.parents_by_child = None;

        let persister = Arc::clone(old_entry.persister());
        let new_key = self.generate_entity_key(generated_id.clone(), persister.as_ref())?;
        trace!(old = %old_key, new = %new_key, "replacing delayed identity key");
        self.add_entity(new_key, entity.clone());
        self.add_entry(entity, old_entry.to_params(generated_id))?;
        Ok(())
    }

    // ---- read-only ----

    /// Whether an entity or proxy is read-only.
    ///
    /// # Errors
    ///
    /// Returns a transient object error if the instance is not associated
    /// with this context, or an illegal state error for a deleted entity.
    pub fn is_read_only(&self, instance: &Instance) -> CoreResult<bool> {
        match instance {
            Instance::Proxy(proxy) => proxy.is_read_only(),
            Instance::Entity(entity) => self
                .get_entry(entity)
                .ok_or_else(|| not_associated(entity))?
                .is_read_only(),
        }
    }

    /// Makes an entity or proxy read-only or modifiable.
    ///
    /// A proxy carries the change to its initialized implementation; an
    /// entity carries it to its registered proxy.
    ///
    /// # Errors
    ///
    /// Returns a transient object error for an unassociated instance, an
    /// assertion failure for a proxy bound elsewhere, or an illegal state
    /// error when an immutable entity would become modifiable.
    pub fn set_read_only(&mut self, instance: &Instance, read_only: bool) -> CoreResult<()> {
        if self.is_read_only(instance)? == read_only {
            return Ok(());
        }
        match instance {
            Instance::Proxy(proxy) => {
                self.set_proxy_read_only(proxy, read_only)?;
                if let Some(entity) = proxy.implementation_if_initialized() {
                    self.set_entity_read_only(&entity, read_only)?;
                }
            }
            Instance::Entity(entity) => {
                self.set_entity_read_only(entity, read_only)?;
                if let Instance::Proxy(proxy) = self.proxy_for_entity(entity)? {
                    self.set_proxy_read_only(&proxy, read_only)?;
                }
            }
        }
        self.has_non_read_only_entities |= !read_only;
        Ok(())
    }

    fn set_proxy_read_only(&self, proxy: &ProxyRef, read_only: bool) -> CoreResult<()> {
        if !proxy.is_bound_to(self.session.id()) {
            return Err(CoreError::assertion_failure(
                "Attempt to set a proxy to read-only that is associated with a different session",
            ));
        }
        proxy.set_read_only(read_only)
    }

    fn set_entity_read_only(&mut self, entity: &EntityRef, read_only: bool) -> CoreResult<()> {
        let entry = self
            .entity_entry_context
            .get_entity_entry_mut(entity)
            .ok_or_else(|| not_associated(entity))?;
        entry.set_read_only(read_only, entity)
    }

    // ---- nullifiable, deleted-unloaded and inserted keys ----

    /// Marks a key as referencing an entity that is being deleted.
    pub fn add_nullifiable_entity_key(&mut self, key: EntityKey) {
        let capacity = self.config.initial_capacity;
        self.nullifiable_entity_keys
            .get_or_insert_with(|| HashSet::with_capacity(capacity))
            .insert(key);
    }

    /// Whether references to a key must be nulled out.
    pub fn is_nullifiable_entity_key_registered(&self, key: &EntityKey) -> bool {
        self.nullifiable_entity_keys
            .as_ref()
            .is_some_and(|s| s.contains(key))
    }

    /// Whether no key is marked nullifiable.
    pub fn is_nullifiable_entity_keys_empty(&self) -> bool {
        self.nullifiable_entity_keys
            .as_ref()
            .map_or(true, HashSet::is_empty)
    }

    /// Records that an entity was deleted without being loaded.
    pub fn register_deleted_unloaded_entity_key(&mut self, key: EntityKey) {
        self.deleted_unloaded_entity_keys
            .get_or_insert_with(HashSet::new)
            .insert(key);
    }

    /// Whether an entity was deleted without being loaded.
    pub fn is_deleted_unloaded_entity(&self, key: &EntityKey) -> bool {
        self.deleted_unloaded_entity_keys
            .as_ref()
            .is_some_and(|s| s.contains(key))
    }

    /// Forgets a deleted-unloaded mark.
    pub fn remove_deleted_unloaded_entity_key(&mut self, key: &EntityKey) -> bool {
        self.deleted_unloaded_entity_keys
            .as_mut()
            .is_some_and(|s| s.remove(key))
    }

    /// Records an insert for cache invalidation at transaction end.
    ///
    /// Only persisters that write to the second-level cache are tracked.
    pub fn register_inserted_key(&mut self, persister: &dyn EntityPersister, id: Value) {
        if !persister.can_write_to_cache() {
            return;
        }
        self.inserted_keys
            .get_or_insert_with(HashMap::new)
            .entry(persister.root_entity_name().to_string())
            .or_default()
            .insert(id);
    }

    /// Whether an id was inserted during the current transaction.
    pub fn was_inserted_during_transaction(&self, persister: &dyn EntityPersister, id: &Value) -> bool {
        persister.can_write_to_cache()
            && self
                .inserted_keys
                .as_ref()
                .and_then(|m| m.get(persister.root_entity_name()))
                .is_some_and(|ids| ids.contains(id))
    }
}

pub(super) fn not_associated(entity: &EntityRef) -> CoreError {
    CoreError::transient_object(format!(
        "Instance was not associated with this persistence context ({})",
        entity.entity_name()
    ))
}
