//! The owning session and the metamodel it exposes.
//!
//! Both are collaborators: the context asks the session for entity keys,
//! persisters and immediate loads, but never drives it.

use crate::collection::PersistentCollection;
use crate::error::{CoreError, CoreResult};
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::persister::{CollectionPersister, EntityPersister};
use crate::types::SessionId;
use ormctx_codec::Value;
use std::fmt;
use std::sync::{Arc, Weak};

/// Lookup of persisters by entity name and collection role.
pub trait Metamodel: Send + Sync + fmt::Debug {
    /// Persister for an entity name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownEntity`] if no persister is mapped.
    fn entity_persister(&self, entity_name: &str) -> CoreResult<Arc<dyn EntityPersister>>;

    /// Persister for a collection role.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownCollectionRole`] if no persister is mapped.
    fn collection_persister(&self, role: &str) -> CoreResult<Arc<dyn CollectionPersister>>;
}

/// The session that owns a persistence context.
pub trait Session: Send + Sync + fmt::Debug {
    /// Identity of this session.
    fn id(&self) -> SessionId;

    /// Whether the session can still load data.
    fn is_open(&self) -> bool;

    /// Persister metadata.
    fn metamodel(&self) -> &dyn Metamodel;

    /// Tenant the session is bound to.
    fn tenant_id(&self) -> Option<&str> {
        None
    }

    /// Builds the key for an identifier of the given persister.
    fn generate_entity_key(&self, id: Value, persister: &dyn EntityPersister) -> EntityKey {
        EntityKey::new(id, persister, self.tenant_id().map(str::to_string))
    }

    /// Loads an entity right away, bypassing proxies.
    ///
    /// # Errors
    ///
    /// Returns an error if the persister is unknown or the load fails.
    fn immediate_load(&self, entity_name: &str, id: &Value) -> CoreResult<Option<EntityRef>> {
        self.metamodel().entity_persister(entity_name)?.load(id)
    }

    /// Loads the elements of an uninitialized collection into it.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection has no role or key, the role is
    /// unknown, or the load fails.
    fn initialize_collection(&self, collection: &PersistentCollection) -> CoreResult<()> {
        let role = collection
            .role()
            .ok_or_else(|| CoreError::lazy_initialization("collection has no role"))?;
        let key = collection.key().ok_or_else(|| {
            CoreError::lazy_initialization(format!("collection of role {role} has no key"))
        })?;
        let data = self
            .metamodel()
            .collection_persister(&role)?
            .load_elements(&key)?;
        collection.inject_loaded(data);
        Ok(())
    }
}

/// Non-owning link from a proxy or collection back to its session.
#[derive(Clone)]
pub struct SessionLink {
    id: SessionId,
    session: Weak<dyn Session>,
}

impl SessionLink {
    /// Links to a live session.
    pub fn new(session: &Arc<dyn Session>) -> Self {
        Self {
            id: session.id(),
            session: Arc::downgrade(session),
        }
    }

    /// Id of the linked session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session, if it still exists.
    pub fn upgrade(&self) -> Option<Arc<dyn Session>> {
        self.session.upgrade()
    }

    /// The session, if it still exists and is open.
    pub fn live(&self) -> Option<Arc<dyn Session>> {
        self.upgrade().filter(|s| s.is_open())
    }

    /// Whether the session still exists and is open.
    pub fn is_live(&self) -> bool {
        self.live().is_some()
    }
}

impl fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLink")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}
