//! Persister contracts.
//!
//! Persisters carry the mapping metadata (names, hierarchy, batch size,
//! natural ids, proxies) and perform the row I/O the context delegates.
//! Most capability methods have conservative defaults.

use crate::collection::{CollectionData, CollectionKind, CollectionRef};
use crate::error::{CoreError, CoreResult};
use crate::instance::{EntityRef, Instance};
use crate::proxy::{EntityProxy, ProxyRef};
use crate::types::EntryKind;
use ormctx_codec::Value;
use std::fmt;

/// Interns nested instances while an entity is passivated.
pub trait HandleWriter {
    /// Handle for an entity or proxy referenced from entity state.
    fn instance(&mut self, instance: &Instance) -> Value;

    /// Handle for a collection referenced from entity state.
    fn collection(&mut self, collection: &CollectionRef) -> Value;
}

/// Resolves handles written by a [`HandleWriter`] while restoring.
pub trait HandleReader {
    /// Instance behind a handle.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed or dangling handle.
    fn instance(&self, handle: &Value) -> CoreResult<Instance>;

    /// Collection behind a handle.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed or dangling handle.
    fn collection(&self, handle: &Value) -> CoreResult<CollectionRef>;
}

/// Metadata and row access for one entity type.
pub trait EntityPersister: Send + Sync + fmt::Debug {
    /// Entity name handled by this persister.
    fn entity_name(&self) -> &str;

    /// Root of the inheritance hierarchy; keys compare on this name.
    fn root_entity_name(&self) -> &str {
        self.entity_name()
    }

    /// Whether `entity_name` is this entity or one of its subclasses.
    fn is_subclass_entity_name(&self, entity_name: &str) -> bool {
        entity_name == self.entity_name()
    }

    /// Whether `entity` is an instance of this entity type.
    fn is_instance(&self, entity: &EntityRef) -> bool {
        self.is_subclass_entity_name(entity.entity_name())
    }

    /// Whether lazy references use proxies.
    fn has_proxy(&self) -> bool {
        false
    }

    /// Creates a detached, uninitialized proxy for `id`.
    fn create_proxy(&self, id: Value) -> ProxyRef {
        EntityProxy::new(self.entity_name(), id)
    }

    /// Flavour of entries created for this entity.
    fn entry_kind(&self) -> EntryKind {
        EntryKind::Mutable
    }

    /// Whether the entity can be modified.
    fn is_mutable(&self) -> bool {
        self.entry_kind() == EntryKind::Mutable
    }

    /// Number of keys loaded together; values above one enable batching.
    fn batch_size(&self) -> usize {
        1
    }

    /// Whether inserts must be tracked for the second-level cache.
    fn can_write_to_cache(&self) -> bool {
        false
    }

    /// Whether the entity declares a natural id.
    fn has_natural_identifier(&self) -> bool {
        false
    }

    /// Whether the natural id can never change.
    fn has_immutable_natural_id(&self) -> bool {
        false
    }

    /// Indices of the natural id properties within the state array.
    fn natural_id_properties(&self) -> &[usize] {
        &[]
    }

    /// Reads the natural id of a row directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn natural_id_snapshot(&self, _id: &Value) -> CoreResult<Option<Value>> {
        Ok(None)
    }

    /// Reads the current row state, `None` if no row exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn database_snapshot(&self, id: &Value) -> CoreResult<Option<Vec<Value>>>;

    /// Current property values of an instance.
    fn property_values(&self, entity: &EntityRef) -> Vec<Value>;

    /// Value of a collection-valued property.
    fn collection_property(&self, entity: &EntityRef, property: &str) -> Option<CollectionRef>;

    /// Identifier of an instance.
    fn identifier(&self, entity: &EntityRef) -> Option<Value>;

    /// Resolves a unique-key value to the identifier owning it.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn id_by_unique_key(&self, _key: &Value, _property: &str) -> CoreResult<Option<Value>> {
        Ok(None)
    }

    /// Loads an instance by identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn load(&self, id: &Value) -> CoreResult<Option<EntityRef>>;

    /// Passivated form of an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not of this type.
    fn serialize_instance(
        &self,
        entity: &EntityRef,
        handles: &mut dyn HandleWriter,
    ) -> CoreResult<Value> {
        let _ = handles;
        Err(CoreError::persister(format!(
            "{} instances cannot be passivated ({entity:?})",
            self.entity_name()
        )))
    }

    /// Allocates an instance from its passivated form.
    ///
    /// References to other instances and collections are bound afterwards
    /// by [`link_instance`](Self::link_instance).
    ///
    /// # Errors
    ///
    /// Returns an error if the state is malformed.
    fn deserialize_instance(&self, state: &Value) -> CoreResult<EntityRef> {
        let _ = state;
        Err(CoreError::persister(format!(
            "{} instances cannot be restored",
            self.entity_name()
        )))
    }

    /// Binds the references of a freshly allocated instance.
    ///
    /// # Errors
    ///
    /// Returns an error if a handle cannot be resolved.
    fn link_instance(
        &self,
        _entity: &EntityRef,
        _state: &Value,
        _handles: &dyn HandleReader,
    ) -> CoreResult<()> {
        Ok(())
    }
}

/// Metadata and element access for one collection role.
pub trait CollectionPersister: Send + Sync + fmt::Debug {
    /// Role, `Owner.property`.
    fn role(&self) -> &str;

    /// Entity name of the owning entity.
    fn owner_entity_name(&self) -> &str;

    /// Shape of the collection.
    fn kind(&self) -> CollectionKind {
        CollectionKind::Bag
    }

    /// Number of collections initialized together.
    fn batch_size(&self) -> usize {
        1
    }

    /// Whether the collection can be modified; immutable ones keep no snapshot.
    fn is_mutable(&self) -> bool {
        true
    }

    /// Owner property the collection key refers to, when it is not the id.
    fn lhs_property_name(&self) -> Option<&str> {
        None
    }

    /// Type name of the collection key.
    fn key_type(&self) -> &str {
        "identifier"
    }

    /// Owner identifier for a collection key, when derivable.
    fn id_of_owner(&self, key: &Value) -> Option<Value> {
        if self.lhs_property_name().is_some() {
            None
        } else {
            Some(key.clone())
        }
    }

    /// Loads the elements for a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn load_elements(&self, key: &Value) -> CoreResult<CollectionData>;
}
