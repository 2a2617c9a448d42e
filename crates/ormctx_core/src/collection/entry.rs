use super::{CollectionData, PersistentCollection};
use crate::persister::CollectionPersister;
use ormctx_codec::Value;
use std::fmt;
use std::sync::Arc;

/// Tracking record of one collection wrapper.
///
/// The loaded persister and key describe the collection as it was read
/// from the database; the current ones are what the flush found.
#[derive(Clone, Default)]
pub struct CollectionEntry {
    loaded_persister: Option<Arc<dyn CollectionPersister>>,
    loaded_key: Option<Value>,
    current_persister: Option<Arc<dyn CollectionPersister>>,
    current_key: Option<Value>,
    role: Option<String>,
    snapshot: Option<CollectionData>,
    reached: bool,
    processed: bool,
    do_update: bool,
    do_remove: bool,
    do_recreate: bool,
    ignore: bool,
    from_merge: bool,
}

impl CollectionEntry {
    /// Entry for a new collection found and wrapped during flush.
    pub fn for_new(persister: &Arc<dyn CollectionPersister>, collection: &PersistentCollection) -> Self {
        collection.clear_dirty();
        let snapshot = persister.is_mutable().then(|| collection.snapshot());
        let role = persister.role().to_string();
        collection.set_snapshot(None, Some(role.clone()), snapshot.clone());
        Self {
            role: Some(role),
            snapshot,
            ..Self::default()
        }
    }

    /// Entry for a collection about to be loaded.
    pub fn for_loading(
        collection: &PersistentCollection,
        persister: &Arc<dyn CollectionPersister>,
        key: Value,
        ignore: bool,
    ) -> Self {
        let role = persister.role().to_string();
        collection.set_snapshot(Some(key.clone()), Some(role.clone()), None);
        Self {
            loaded_persister: Some(Arc::clone(persister)),
            loaded_key: Some(key),
            role: Some(role),
            ignore,
            ..Self::default()
        }
    }

    /// Entry for an uninitialized wrapper reattached from a detached graph.
    pub fn for_detached_uninitialized(persister: &Arc<dyn CollectionPersister>, key: Option<Value>) -> Self {
        Self {
            loaded_persister: Some(Arc::clone(persister)),
            loaded_key: key,
            role: Some(persister.role().to_string()),
            ..Self::default()
        }
    }

    /// Entry for an initialized wrapper reattached from a detached graph.
    pub fn for_detached_initialized(
        collection: &PersistentCollection,
        persister: &Arc<dyn CollectionPersister>,
    ) -> Self {
        Self {
            loaded_persister: Some(Arc::clone(persister)),
            loaded_key: collection.key(),
            role: collection.role(),
            snapshot: collection.stored_snapshot(),
            ..Self::default()
        }
    }

    /// Rebuilds a passivated entry.
    pub(crate) fn restore(
        persister: Option<Arc<dyn CollectionPersister>>,
        role: Option<String>,
        loaded_key: Option<Value>,
        snapshot: Option<CollectionData>,
    ) -> Self {
        Self {
            loaded_persister: persister,
            loaded_key,
            role,
            snapshot,
            ..Self::default()
        }
    }

    /// Takes the snapshot once the elements are loaded.
    pub fn post_initialize(&mut self, collection: &PersistentCollection) {
        self.snapshot = match &self.loaded_persister {
            Some(p) if p.is_mutable() => Some(collection.snapshot()),
            _ => None,
        };
        collection.set_snapshot(self.loaded_key.clone(), self.role.clone(), self.snapshot.clone());
    }

    /// Resets the per-flush flags.
    pub fn pre_flush(&mut self) {
        self.reached = false;
        self.processed = false;
        self.do_update = false;
        self.do_remove = false;
        self.do_recreate = false;
    }

    /// Clears the ignore flag after a flush.
    pub fn post_flush(&mut self) {
        self.ignore = false;
    }

    /// Adopts the current persister and key after the flush actions ran.
    pub fn after_action(&mut self, collection: &PersistentCollection) {
        self.loaded_key = self.current_key.clone();
        self.loaded_persister = self.current_persister.clone();
        self.role = self.loaded_persister.as_ref().map(|p| p.role().to_string());
        if collection.was_initialized() && (self.do_remove || self.do_recreate || self.do_update) {
            self.snapshot = match &self.loaded_persister {
                Some(p) if p.is_mutable() => Some(collection.snapshot()),
                _ => None,
            };
            collection.clear_dirty();
        }
    }

    /// Persister the collection was loaded with.
    pub fn loaded_persister(&self) -> Option<&Arc<dyn CollectionPersister>> {
        self.loaded_persister.as_ref()
    }

    /// Key the collection was loaded with.
    pub fn loaded_key(&self) -> Option<&Value> {
        self.loaded_key.as_ref()
    }

    /// Persister found by the current flush.
    pub fn current_persister(&self) -> Option<&Arc<dyn CollectionPersister>> {
        self.current_persister.as_ref()
    }

    /// Sets the persister found by the current flush.
    pub fn set_current_persister(&mut self, persister: Option<Arc<dyn CollectionPersister>>) {
        self.current_persister = persister;
    }

    /// Key found by the current flush.
    pub fn current_key(&self) -> Option<&Value> {
        self.current_key.as_ref()
    }

    /// Sets the key found by the current flush.
    pub fn set_current_key(&mut self, key: Option<Value>) {
        self.current_key = key;
    }

    /// Role of the loaded persister.
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Snapshot used for dirty checking.
    pub fn snapshot(&self) -> Option<&CollectionData> {
        self.snapshot.as_ref()
    }

    /// Whether the flush reached this collection.
    pub fn is_reached(&self) -> bool {
        self.reached
    }

    /// Marks the collection as reached.
    pub fn set_reached(&mut self, reached: bool) {
        self.reached = reached;
    }

    /// Whether the flush processed this collection.
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Marks the collection as processed.
    pub fn set_processed(&mut self, processed: bool) {
        self.processed = processed;
    }

    /// Whether an update is scheduled.
    pub fn is_do_update(&self) -> bool {
        self.do_update
    }

    /// Schedules an update.
    pub fn set_do_update(&mut self, value: bool) {
        self.do_update = value;
    }

    /// Whether a removal is scheduled.
    pub fn is_do_remove(&self) -> bool {
        self.do_remove
    }

    /// Schedules a removal.
    pub fn set_do_remove(&mut self, value: bool) {
        self.do_remove = value;
    }

    /// Whether a recreate is scheduled.
    pub fn is_do_recreate(&self) -> bool {
        self.do_recreate
    }

    /// Schedules a recreate.
    pub fn set_do_recreate(&mut self, value: bool) {
        self.do_recreate = value;
    }

    /// Whether the flush ignores this collection.
    pub fn is_ignore(&self) -> bool {
        self.ignore
    }

    /// Whether the wrapper came from a merge.
    pub fn is_from_merge(&self) -> bool {
        self.from_merge
    }

    /// Marks the wrapper as coming from a merge.
    pub fn set_from_merge(&mut self, value: bool) {
        self.from_merge = value;
    }
}

impl fmt::Debug for CollectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionEntry")
            .field("role", &self.role)
            .field("loaded_key", &self.loaded_key)
            .field("has_snapshot", &self.snapshot.is_some())
            .field("ignore", &self.ignore)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CollectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = self.role.as_deref().unwrap_or("<unreferenced>");
        match &self.loaded_key {
            Some(key) => write!(f, "CollectionEntry[{role}#{key}]"),
            None => write!(f, "CollectionEntry[{role}]"),
        }
    }
}
