//! The per-session persistence context.
//!
//! The context identity-maps loaded entities, keeps database snapshots for
//! dirty checking, tracks collection wrappers and proxies, resolves owners
//! for cascades and can passivate itself. It never creates instances; it
//! only indexes what loaders and the session hand to it.
//!
//! Every index is allocated on first use and released by
//! [`PersistenceContext::clear`].

mod cascade;
mod collections;
mod entities;
mod passivation;
mod proxies;

pub use passivation::{StreamSummary, SECTION_NAMES, TABLE_NAMES};

use crate::batch::BatchFetchQueue;
use crate::collection::{CollectionEntry, CollectionRef};
use crate::config::ContextConfig;
use crate::entry_context::EntityEntryContext;
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityMap;
use crate::instance::{EntityRef, Instance};
use crate::key::{AssociationKey, CollectionKey, EntityKey, EntityUniqueKey};
use crate::natural_id::NaturalIdResolutions;
use crate::persister::{CollectionPersister, EntityPersister};
use crate::proxy::ProxyMap;
use crate::session::{Session, SessionLink};
use crate::types::SessionId;
use ormctx_codec::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Cached database state of an entity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Snapshot {
    /// The row as last read.
    Row(Vec<Value>),
    /// The row was looked up and does not exist.
    NoRow,
}

/// Tracking structure of one session's unit of work.
///
/// Mutation requires `&mut self`; the proxy index alone is internally
/// synchronized so proxies can be looked up through `&self`.
pub struct PersistenceContext {
    session: SessionLink,
    config: ContextConfig,

    entities_by_key: Option<HashMap<EntityKey, EntityRef>>,
    entities_by_unique_key: Option<HashMap<EntityUniqueKey, EntityRef>>,
    proxies_by_key: Option<ProxyMap>,
    entity_snapshots_by_key: Option<HashMap<EntityKey, Snapshot>>,
    entity_entry_context: EntityEntryContext,
    collection_entries: Option<IdentityMap<CollectionRef, CollectionEntry>>,
    collections_by_key: Option<HashMap<CollectionKey, CollectionRef>>,
    nullifiable_entity_keys: Option<HashSet<EntityKey>>,
    deleted_unloaded_entity_keys: Option<HashSet<EntityKey>>,
    null_associations: Option<HashSet<AssociationKey>>,
    non_lazy_collections: Option<Vec<CollectionRef>>,
    unowned_collections: Option<HashMap<CollectionKey, CollectionRef>>,
    parents_by_child: Option<HashMap<Instance, EntityRef>>,
    inserted_keys: Option<HashMap<String, HashSet<Value>>>,
    batch_fetch_queue: Option<BatchFetchQueue>,
    natural_id_resolutions: Option<NaturalIdResolutions>,

    cascading: usize,
    load_counter: usize,
    remove_orphan_before_updates_counter: usize,
    flushing: bool,
    default_read_only: bool,
    has_non_read_only_entities: bool,
}

impl PersistenceContext {
    /// Creates an empty context for a session.
    pub fn new(session: &Arc<dyn Session>) -> Self {
        Self::with_config(session, ContextConfig::default())
    }

    /// Creates an empty context with explicit configuration.
    pub fn with_config(session: &Arc<dyn Session>, config: ContextConfig) -> Self {
        Self {
            session: SessionLink::new(session),
            default_read_only: config.default_read_only,
            config,
            entities_by_key: None,
            entities_by_unique_key: None,
            proxies_by_key: None,
            entity_snapshots_by_key: None,
            entity_entry_context: EntityEntryContext::new(),
            collection_entries: None,
            collections_by_key: None,
            nullifiable_entity_keys: None,
            deleted_unloaded_entity_keys: None,
            null_associations: None,
            non_lazy_collections: None,
            unowned_collections: None,
            parents_by_child: None,
            inserted_keys: None,
            batch_fetch_queue: None,
            natural_id_resolutions: None,
            cascading: 0,
            load_counter: 0,
            remove_orphan_before_updates_counter: 0,
            flushing: false,
            has_non_read_only_entities: false,
        }
    }

    /// Id of the owning session.
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Link to the owning session.
    pub fn session_link(&self) -> &SessionLink {
        &self.session
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn session(&self) -> CoreResult<Arc<dyn Session>> {
        self.session.upgrade().ok_or_else(|| {
            CoreError::illegal_state(format!(
                "persistence context outlived its session {}",
                self.session.id()
            ))
        })
    }

    fn entity_persister(&self, entity_name: &str) -> CoreResult<Arc<dyn EntityPersister>> {
        self.session()?.metamodel().entity_persister(entity_name)
    }

    fn collection_persister(&self, role: &str) -> CoreResult<Arc<dyn CollectionPersister>> {
        self.session()?.metamodel().collection_persister(role)
    }

    /// Builds the key of an identifier through the owning session.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if the session no longer exists.
    pub fn generate_entity_key(&self, id: Value, persister: &dyn EntityPersister) -> CoreResult<EntityKey> {
        Ok(self.session()?.generate_entity_key(id, persister))
    }

    /// Whether the context is stateless. Always false.
    pub fn is_stateless(&self) -> bool {
        false
    }

    /// Releases every index.
    ///
    /// Proxies, enhanced entities and collection wrappers are unbound from
    /// the session. The default read-only setting is kept.
    pub fn clear(&mut self) {
        trace!(session = %self.session.id(), "clearing persistence context");
        if let Some(proxies) = &self.proxies_by_key {
            for (_, proxy) in proxies.live_entries() {
                proxy.unset_session();
            }
        }
        for entity in self.entity_entry_context.entities() {
            if let Some(interceptor) = entity.interceptor() {
                interceptor.set_session(None);
            }
        }
        if let Some(entries) = &self.collection_entries {
            let session = self.session.id();
            for collection in entries.keys() {
                collection.unset_session(session);
            }
        }

        self.entities_by_key = None;
        self.entities_by_unique_key = None;
        self.entity_entry_context.clear();
        self.parents_by_child = None;
        self.entity_snapshots_by_key = None;
        self.collections_by_key = None;
        self.non_lazy_collections = None;
        self.collection_entries = None;
        self.unowned_collections = None;
        self.proxies_by_key = None;
        self.nullifiable_entity_keys = None;
        self.deleted_unloaded_entity_keys = None;
        self.null_associations = None;
        if let Some(queue) = self.batch_fetch_queue.as_mut() {
            queue.clear();
        }
        self.has_non_read_only_entities = false;
        self.natural_id_resolutions = None;
    }

    // ---- batch fetching and natural ids ----

    /// The batch fetch queue, created on first use.
    pub fn batch_fetch_queue(&mut self) -> &mut BatchFetchQueue {
        let enabled = self.config.batch_fetch_enabled;
        self.batch_fetch_queue
            .get_or_insert_with(|| BatchFetchQueue::new(enabled))
    }

    /// The batch fetch queue, if it was ever used.
    pub fn batch_fetch_queue_if_present(&self) -> Option<&BatchFetchQueue> {
        self.batch_fetch_queue.as_ref()
    }

    /// The natural-id resolutions, created on first use.
    pub fn natural_id_resolutions(&mut self) -> &mut NaturalIdResolutions {
        self.natural_id_resolutions
            .get_or_insert_with(NaturalIdResolutions::new)
    }

    /// The natural-id resolutions, if they were ever used.
    pub fn natural_id_resolutions_if_present(&self) -> Option<&NaturalIdResolutions> {
        self.natural_id_resolutions.as_ref()
    }

    // ---- read-only defaults ----

    /// Whether newly loaded entities and proxies start read-only.
    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    /// Sets whether newly loaded entities and proxies start read-only.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    /// Whether any entity was ever made modifiable since the last clear.
    pub fn has_non_read_only_entities(&self) -> bool {
        self.has_non_read_only_entities
    }

    // ---- counters and flags ----

    /// Current cascade depth.
    pub fn cascade_level(&self) -> usize {
        self.cascading
    }

    /// Enters a cascade, returning the new depth.
    pub fn increment_cascade_level(&mut self) -> usize {
        self.cascading += 1;
        self.cascading
    }

    /// Leaves a cascade, returning the new depth.
    pub fn decrement_cascade_level(&mut self) -> usize {
        self.cascading = self.cascading.saturating_sub(1);
        self.cascading
    }

    /// Whether orphans are being removed ahead of updates.
    pub fn is_removing_orphan_before_updates(&self) -> bool {
        self.remove_orphan_before_updates_counter > 0
    }

    /// Starts removing an orphan ahead of updates.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error outside a cascade or when the
    /// counter is out of sync with the cascade depth.
    pub fn begin_remove_orphan_before_updates(&mut self) -> CoreResult<()> {
        if self.cascading < 1 {
            return Err(CoreError::illegal_state(
                "Attempt to remove orphan when not cascading.",
            ));
        }
        if self.remove_orphan_before_updates_counter >= self.cascading {
            return Err(CoreError::illegal_state(format!(
                "Cascade level [{}] is out of sync with removeOrphanBeforeUpdatesCounter [{}] before incrementing removeOrphanBeforeUpdatesCounter",
                self.cascading, self.remove_orphan_before_updates_counter
            )));
        }
        self.remove_orphan_before_updates_counter += 1;
        Ok(())
    }

    /// Finishes removing an orphan ahead of updates.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error outside a cascade or when the
    /// counter is out of sync with the cascade depth.
    pub fn end_remove_orphan_before_updates(&mut self) -> CoreResult<()> {
        if self.cascading < 1 {
            return Err(CoreError::illegal_state(
                "Finished removing orphan when not cascading.",
            ));
        }
        if self.remove_orphan_before_updates_counter > self.cascading
            || self.remove_orphan_before_updates_counter == 0
        {
            return Err(CoreError::illegal_state(format!(
                "Cascade level [{}] is out of sync with removeOrphanBeforeUpdatesCounter [{}] before decrementing removeOrphanBeforeUpdatesCounter",
                self.cascading, self.remove_orphan_before_updates_counter
            )));
        }
        self.remove_orphan_before_updates_counter -= 1;
        Ok(())
    }

    /// Whether a flush is in progress.
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Marks the start or end of a flush.
    ///
    /// Ending a flush drops natural ids invalidated during it.
    pub fn set_flushing(&mut self, flushing: bool) {
        let after_flush = self.flushing && !flushing;
        self.flushing = flushing;
        if after_flush {
            if let Some(resolutions) = self.natural_id_resolutions.as_mut() {
                resolutions.cleanup_from_synchronizations();
            }
        }
    }

    /// Enters a load.
    pub fn before_load(&mut self) {
        self.load_counter += 1;
    }

    /// Leaves a load.
    pub fn after_load(&mut self) {
        self.load_counter = self.load_counter.saturating_sub(1);
    }

    /// Whether no load is in progress.
    pub fn is_load_finished(&self) -> bool {
        self.load_counter == 0
    }

    // ---- null associations ----

    /// Remembers that an association was null during the current load.
    pub fn add_null_property(&mut self, owner_key: EntityKey, property_name: impl Into<String>) {
        let capacity = self.config.initial_capacity;
        self.null_associations
            .get_or_insert_with(|| HashSet::with_capacity(capacity))
            .insert(AssociationKey::new(owner_key, property_name));
    }

    /// Whether an association was found null during the current load.
    pub fn is_property_null(&self, owner_key: &EntityKey, property_name: &str) -> bool {
        self.null_associations.as_ref().is_some_and(|set| {
            set.contains(&AssociationKey::new(owner_key.clone(), property_name))
        })
    }

    fn clear_null_properties(&mut self) {
        self.null_associations = None;
    }

    /// Transaction completion: forgets inserted keys and downgrades locks.
    pub fn after_transaction_completion(&mut self) {
        if let Some(inserted) = self.inserted_keys.as_mut() {
            inserted.clear();
        }
        self.entity_entry_context.downgrade_locks();
    }
}

impl fmt::Display for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<'a, T: fmt::Display + 'a>(items: impl Iterator<Item = &'a T>) -> String {
            items.map(ToString::to_string).collect::<Vec<_>>().join(", ")
        }
        let entity_keys = self
            .entities_by_key
            .as_ref()
            .map(|m| join(m.keys()))
            .unwrap_or_default();
        let collection_keys = self
            .collections_by_key
            .as_ref()
            .map(|m| join(m.keys()))
            .unwrap_or_default();
        write!(
            f,
            "PersistenceContext[entityKeys=[{entity_keys}], collectionKeys=[{collection_keys}]]"
        )
    }
}

impl fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("session", &self.session.id())
            .field(
                "entities",
                &self.entities_by_key.as_ref().map_or(0, HashMap::len),
            )
            .field(
                "collections",
                &self.collection_entries.as_ref().map_or(0, IdentityMap::len),
            )
            .field(
                "proxies",
                &self.proxies_by_key.as_ref().map_or(0, ProxyMap::len),
            )
            .field("default_read_only", &self.default_read_only)
            .field("flushing", &self.flushing)
            .finish_non_exhaustive()
    }
}
