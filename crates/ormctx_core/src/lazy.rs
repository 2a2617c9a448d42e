//! Helpers for working with possibly-lazy instances and collections.

use crate::collection::PersistentCollection;
use crate::error::CoreResult;
use crate::instance::{EntityRef, Instance};

/// Whether an instance is loaded.
///
/// Proxies are loaded once they have an implementation; enhanced entities
/// once their interceptor reports so; plain entities always are.
pub fn is_initialized(instance: &Instance) -> bool {
    match instance {
        Instance::Proxy(proxy) => !proxy.is_uninitialized(),
        Instance::Entity(entity) => entity
            .interceptor()
            .map_or(true, |i| !i.is_enhanced_proxy_uninitialized()),
    }
}

/// Loads an instance through its bound session if needed.
///
/// # Errors
///
/// Returns a lazy initialization error if no open session is bound.
pub fn initialize(instance: &Instance) -> CoreResult<()> {
    match instance {
        Instance::Proxy(proxy) => proxy.initialize(),
        Instance::Entity(entity) => match entity.interceptor() {
            Some(i) if i.is_enhanced_proxy_uninitialized() => i.force_initialize(),
            _ => Ok(()),
        },
    }
}

/// The real instance behind a proxy, loading it if needed.
///
/// # Errors
///
/// Returns a lazy initialization error if a proxy must be loaded but no
/// open session is bound.
pub fn unproxy(instance: &Instance) -> CoreResult<EntityRef> {
    match instance {
        Instance::Proxy(proxy) => proxy.implementation(),
        Instance::Entity(entity) => Ok(entity.clone()),
    }
}

/// Whether a collection's elements are loaded.
pub fn is_collection_initialized(collection: &PersistentCollection) -> bool {
    collection.was_initialized()
}

/// Loads a collection's elements if needed.
///
/// # Errors
///
/// Returns a lazy initialization error if no open session is bound.
pub fn initialize_collection(collection: &PersistentCollection) -> CoreResult<()> {
    collection.force_initialization()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CollectionData, CollectionKind};
    use crate::error::CoreError;
    use crate::instance::Persistable;
    use crate::proxy::EntityProxy;
    use ormctx_codec::Value;
    use std::any::Any;

    #[derive(Debug)]
    struct Plain;

    impl Persistable for Plain {
        fn entity_name(&self) -> &str {
            "Plain"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn plain_entities_are_initialized() {
        let entity = EntityRef::new(Plain);
        let instance = Instance::from(entity.clone());
        assert!(is_initialized(&instance));
        initialize(&instance).unwrap();
        assert!(unproxy(&instance).unwrap().ptr_eq(&entity));
    }

    #[test]
    fn proxies_follow_their_implementation() {
        let proxy = EntityProxy::new("Plain", Value::Integer(1));
        let instance = Instance::from(proxy.clone());
        assert!(!is_initialized(&instance));
        assert!(matches!(
            unproxy(&instance),
            Err(CoreError::LazyInitialization { .. })
        ));

        let entity = EntityRef::new(Plain);
        proxy.set_implementation(entity.clone());
        assert!(is_initialized(&instance));
        assert!(unproxy(&instance).unwrap().ptr_eq(&entity));
    }

    #[test]
    fn collections() {
        let loaded = PersistentCollection::new(CollectionData::empty(CollectionKind::Bag));
        assert!(is_collection_initialized(&loaded));
        initialize_collection(&loaded).unwrap();

        let lazy = PersistentCollection::uninitialized(CollectionKind::Bag);
        assert!(!is_collection_initialized(&lazy));
        assert!(initialize_collection(&lazy).is_err());
    }
}
