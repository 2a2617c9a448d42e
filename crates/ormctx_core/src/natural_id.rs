//! Cross-reference between natural ids and primary keys.
//!
//! Resolutions are a cache: dropping any of them only costs a snapshot
//! read later. They are grouped by root entity name so that subclasses
//! share one resolution space.

use crate::error::{CoreError, CoreResult};
use crate::persister::EntityPersister;
use ormctx_codec::Value;
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Default)]
struct EntityResolutions {
    pk_to_natural_id: HashMap<Value, Value>,
    natural_id_to_pk: HashMap<Value, Value>,
    invalid: Vec<Value>,
}

impl EntityResolutions {
    fn cache(&mut self, pk: &Value, natural_id: &Value) -> bool {
        if let Some(initial) = self.pk_to_natural_id.get(pk) {
            if initial == natural_id {
                return false;
            }
            let initial = initial.clone();
            self.natural_id_to_pk.remove(&initial);
        }
        self.pk_to_natural_id.insert(pk.clone(), natural_id.clone());
        self.natural_id_to_pk.insert(natural_id.clone(), pk.clone());
        true
    }

    fn remove(&mut self, pk: &Value) -> Option<Value> {
        let removed = self.pk_to_natural_id.remove(pk)?;
        self.natural_id_to_pk.remove(&removed);
        Some(removed)
    }
}

/// Natural-id resolutions of one persistence context.
#[derive(Debug, Default)]
pub struct NaturalIdResolutions {
    by_entity: HashMap<String, EntityResolutions>,
}

/// Projects the natural id out of a state array.
///
/// A single-property natural id is the property value itself; a compound
/// one is an array in property order.
pub fn extract_natural_id(state: &[Value], persister: &dyn EntityPersister) -> Value {
    let props = persister.natural_id_properties();
    let mut values: Vec<Value> = props
        .iter()
        .map(|&i| state.get(i).cloned().unwrap_or(Value::Null))
        .collect();
    if values.len() == 1 {
        values.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(values)
    }
}

fn validate(persister: &dyn EntityPersister) -> CoreResult<()> {
    if persister.has_natural_identifier() {
        Ok(())
    } else {
        Err(CoreError::illegal_state(format!(
            "entity {} does not define a natural id",
            persister.entity_name()
        )))
    }
}

impl NaturalIdResolutions {
    /// Creates an empty cross-reference.
    pub fn new() -> Self {
        Self::default()
    }

    fn resolutions(&self, persister: &dyn EntityPersister) -> Option<&EntityResolutions> {
        self.by_entity.get(persister.root_entity_name())
    }

    fn resolutions_mut(&mut self, persister: &dyn EntityPersister) -> &mut EntityResolutions {
        self.by_entity
            .entry(persister.root_entity_name().to_string())
            .or_default()
    }

    /// Records that `id` has natural id `natural_id`.
    ///
    /// Returns whether the resolution changed.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if the entity has no natural id.
    pub fn cache_resolution(&mut self, id: &Value, natural_id: &Value, persister: &dyn EntityPersister) -> CoreResult<bool> {
        validate(persister)?;
        Ok(self.cache_resolution_locally(id, natural_id, persister))
    }

    /// Records a resolution observed while loading.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if the entity has no natural id.
    pub fn cache_resolution_from_load(
        &mut self,
        id: &Value,
        natural_id: &Value,
        persister: &dyn EntityPersister,
    ) -> CoreResult<bool> {
        validate(persister)?;
        let changed = self.cache_resolution_locally(id, natural_id, persister);
        if changed {
            trace!(entity = persister.entity_name(), id = %id, natural_id = %natural_id, "cached natural id from load");
        }
        Ok(changed)
    }

    /// Records a resolution in this context only.
    pub fn cache_resolution_locally(&mut self, id: &Value, natural_id: &Value, persister: &dyn EntityPersister) -> bool {
        if id.is_null() {
            return false;
        }
        self.resolutions_mut(persister).cache(id, natural_id)
    }

    /// Drops the resolution of `id`, returning the natural id it had, or
    /// `natural_id` if none was cached.
    pub fn remove_resolution(&mut self, id: &Value, natural_id: &Value, persister: &dyn EntityPersister) -> Value {
        self.remove_local_resolution(id, persister)
            .unwrap_or_else(|| natural_id.clone())
    }

    /// Drops the resolution of `id` from this context only.
    pub fn remove_local_resolution(&mut self, id: &Value, persister: &dyn EntityPersister) -> Option<Value> {
        let root = persister.root_entity_name();
        let resolutions = self.by_entity.get_mut(root)?;
        let removed = resolutions.remove(id);
        if resolutions.pk_to_natural_id.is_empty() && resolutions.invalid.is_empty() {
            self.by_entity.remove(root);
        }
        removed
    }

    /// Cached natural id of `id`.
    pub fn find_cached_natural_id_by_id(&self, id: &Value, persister: &dyn EntityPersister) -> Option<Value> {
        self.resolutions(persister)?.pk_to_natural_id.get(id).cloned()
    }

    /// Cached id for a natural id; invalidated natural ids resolve to nothing.
    pub fn find_cached_id_by_natural_id(&self, natural_id: &Value, persister: &dyn EntityPersister) -> Option<Value> {
        let resolutions = self.resolutions(persister)?;
        if resolutions.invalid.contains(natural_id) {
            return None;
        }
        resolutions.natural_id_to_pk.get(natural_id).cloned()
    }

    /// Ids with a cached resolution.
    pub fn cached_pk_resolutions(&self, persister: &dyn EntityPersister) -> Vec<Value> {
        self.resolutions(persister)
            .map(|r| r.pk_to_natural_id.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Invalidates a resolution whose natural id changed in memory.
    ///
    /// Only mutable natural ids are affected. The stale natural id stops
    /// resolving until [`cleanup_from_synchronizations`] runs after the
    /// flush.
    ///
    /// [`cleanup_from_synchronizations`]: Self::cleanup_from_synchronizations
    pub fn handle_synchronization(&mut self, id: &Value, natural_id: &Value, persister: &dyn EntityPersister) {
        if !persister.has_natural_identifier() || persister.has_immutable_natural_id() {
            return;
        }
        let Some(resolutions) = self.by_entity.get_mut(persister.root_entity_name()) else {
            return;
        };
        let Some(cached) = resolutions.pk_to_natural_id.get(id).cloned() else {
            return;
        };
        if &cached == natural_id {
            return;
        }
        resolutions.natural_id_to_pk.remove(&cached);
        resolutions.invalid.push(cached);
    }

    /// Forgets invalidated natural ids once a flush completed.
    pub fn cleanup_from_synchronizations(&mut self) {
        for resolutions in self.by_entity.values_mut() {
            resolutions.invalid.clear();
        }
    }

    /// Drops the resolution of an evicted entity given its state.
    pub fn handle_eviction(&mut self, id: &Value, state: &[Value], persister: &dyn EntityPersister) {
        if !persister.has_natural_identifier() {
            return;
        }
        let natural_id = extract_natural_id(state, persister);
        self.remove_resolution(id, &natural_id, persister);
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.by_entity.clear();
    }
}
