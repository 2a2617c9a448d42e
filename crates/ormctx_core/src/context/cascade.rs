//! Owner and index resolution for cascades.
//!
//! The parent/child cache is a hint only. Both lookups fall back to a walk
//! over every tracked entity whose type can own the property, so their
//! cost grows with the number of managed entities.

use super::PersistenceContext;
use crate::collection::CollectionRef;
use crate::error::CoreResult;
use crate::instance::{EntityRef, Instance, MergeMap};
use crate::persister::EntityPersister;
use ormctx_codec::Value;
use std::collections::HashMap;
use tracing::debug;

fn property_collection(
    property: &str,
    persister: &dyn EntityPersister,
    parent: &Instance,
) -> Option<CollectionRef> {
    let parent = parent.resolved_entity()?;
    persister
        .collection_property(&parent, property)
        .filter(|c| c.was_initialized())
}

fn is_found_in_parent(
    property: &str,
    child: Option<&Instance>,
    persister: &dyn EntityPersister,
    parent: Option<&Instance>,
) -> bool {
    let (Some(child), Some(parent)) = (child, parent) else {
        return false;
    };
    property_collection(property, persister, parent).is_some_and(|c| c.contains(child))
}

fn index_in_parent(
    property: &str,
    child: Option<&Instance>,
    persister: &dyn EntityPersister,
    parent: Option<&Instance>,
) -> Option<Value> {
    let (Some(child), Some(parent)) = (child, parent) else {
        return None;
    };
    property_collection(property, persister, parent)?.index_of(child)
}

impl PersistenceContext {
    /// Remembers the parent of a child for later owner lookups.
    pub fn add_child_parent(&mut self, child: Instance, parent: EntityRef) {
        self.parents_by_child
            .get_or_insert_with(HashMap::new)
            .insert(child, parent);
    }

    /// Forgets the remembered parent of a child.
    pub fn remove_child_parent(&mut self, child: &Instance) {
        if let Some(parents) = self.parents_by_child.as_mut() {
            parents.remove(child);
        }
    }

    fn cached_parent(&self, child: &Instance, persister: &dyn EntityPersister) -> Option<Option<(EntityRef, Value)>> {
        let parent = self.parents_by_child.as_ref()?.get(child)?;
        let entry = self
            .get_entry(parent)
            .filter(|e| persister.is_subclass_entity_name(e.entity_name()));
        Some(entry.map(|e| (parent.clone(), e.id().clone())))
    }

    /// Identifier of the entity whose `property` collection contains `child`.
    ///
    /// During a merge, detached counterparts from `merge_map` are tested as
    /// well, including detached proxies standing in for the owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity or the collection role is unknown.
    pub fn get_owner_id(
        &mut self,
        entity_name: &str,
        property: &str,
        child: &Instance,
        merge_map: Option<&MergeMap>,
    ) -> CoreResult<Option<Value>> {
        let persister = self.entity_persister(entity_name)?;
        // fails for an unmapped property
        self.collection_persister(&format!("{entity_name}.{property}"))?;
        let persister = persister.as_ref();

        match self.cached_parent(child, persister) {
            Some(Some((parent, id)))
                if is_found_in_parent(
                    property,
                    Some(child),
                    persister,
                    Some(&Instance::Entity(parent.clone())),
                ) =>
            {
                return Ok(Some(id));
            }
            Some(_) => self.remove_child_parent(child),
            None => {}
        }

        for (entity, entry) in self.reentrant_safe_entity_entries() {
            if !persister.is_subclass_entity_name(entry.entity_name()) {
                continue;
            }
            let candidate = Instance::Entity(entity);
            let mut found = is_found_in_parent(property, Some(child), persister, Some(&candidate));
            if !found {
                if let Some(merge_map) = merge_map {
                    let unmerged_parent = merge_map.get(&candidate);
                    let unmerged_child = merge_map.get(child);
                    if unmerged_parent.is_some() && unmerged_child.is_some() {
                        found = is_found_in_parent(property, unmerged_child, persister, unmerged_parent);
                        debug!(
                            found,
                            "detached object being merged has a collection that may contain the detached child"
                        );
                    }
                }
            }
            if found {
                return Ok(Some(entry.id().clone()));
            }
        }

        // a detached proxy may stand between the merge map and its owner
        let Some(merge_map) = merge_map else {
            return Ok(None);
        };
        for (key, detached) in merge_map {
            let Instance::Proxy(proxy) = key else {
                continue;
            };
            if !persister.is_subclass_entity_name(&proxy.entity_name()) {
                continue;
            }
            let mut found = is_found_in_parent(property, Some(child), persister, Some(detached));
            debug!(found, "detached proxy being merged tested against the managed child");
            if !found {
                found = is_found_in_parent(property, merge_map.get(child), persister, Some(detached));
                debug!(found, "detached proxy being merged tested against the detached child");
            }
            if found {
                return Ok(Some(proxy.identifier()));
            }
        }
        Ok(None)
    }

    /// Index or map key of `child` within the owner's `property` collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity or the collection role is unknown.
    pub fn get_index_in_owner(
        &mut self,
        entity_name: &str,
        property: &str,
        child: &Instance,
        merge_map: Option<&MergeMap>,
    ) -> CoreResult<Option<Value>> {
        let persister = self.entity_persister(entity_name)?;
        self.collection_persister(&format!("{entity_name}.{property}"))?;
        let persister = persister.as_ref();

        let lookup = |parent: &Instance| -> Option<Value> {
            index_in_parent(property, Some(child), persister, Some(parent)).or_else(|| {
                let merge_map = merge_map?;
                let unmerged_parent = merge_map.get(parent);
                let unmerged_child = merge_map.get(child);
                if unmerged_parent.is_none() || unmerged_child.is_none() {
                    return None;
                }
                let index = index_in_parent(property, unmerged_child, persister, unmerged_parent);
                debug!(
                    found = index.is_some(),
                    "detached object being merged has a collection that may contain the detached child"
                );
                index
            })
        };

        match self.cached_parent(child, persister) {
            Some(Some((parent, _))) => {
                if let Some(index) = lookup(&Instance::Entity(parent)) {
                    return Ok(Some(index));
                }
            }
            Some(None) => self.remove_child_parent(child),
            None => {}
        }

        for (entity, entry) in self.reentrant_safe_entity_entries() {
            if !persister.is_subclass_entity_name(entry.entity_name()) {
                continue;
            }
            if let Some(index) = lookup(&Instance::Entity(entity)) {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }
}
