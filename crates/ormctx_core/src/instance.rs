//! Entity instances as seen by the persistence context.
//!
//! The context never owns entity state; it holds shared handles and
//! compares them by identity, never by value.

use crate::error::CoreResult;
use crate::proxy::ProxyRef;
use crate::session::SessionLink;
use crate::types::SessionId;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

/// An application entity the context can track.
pub trait Persistable: Any + Send + Sync + fmt::Debug {
    /// Concrete entity name of this instance.
    fn entity_name(&self) -> &str;

    /// Interception hook for enhanced entities.
    fn interceptor(&self) -> Option<&dyn AttributeInterceptor> {
        None
    }

    /// Upcast for downcasting by callers.
    fn as_any(&self) -> &dyn Any;
}

/// Interception contract for enhanced entities.
///
/// An enhanced entity may act as its own proxy: it is registered in the
/// identity map while its attributes are still unloaded, and the interceptor
/// loads them on demand through its bound session.
pub trait AttributeInterceptor: Send + Sync + fmt::Debug {
    /// Binds or unbinds the session used for lazy loading.
    fn set_session(&self, session: Option<SessionLink>);

    /// Id of the session currently bound, if any.
    fn session_id(&self) -> Option<SessionId>;

    /// Whether this entity is an enhanced proxy that has not loaded yet.
    fn is_enhanced_proxy_uninitialized(&self) -> bool {
        false
    }

    /// Loads all unloaded attributes.
    ///
    /// # Errors
    ///
    /// Returns a lazy initialization error if no live session is bound.
    fn force_initialize(&self) -> CoreResult<()>;
}

/// Shared handle to an entity instance with identity semantics.
#[derive(Clone)]
pub struct EntityRef(Arc<dyn Persistable>);

impl EntityRef {
    /// Wraps a new entity.
    pub fn new<T: Persistable>(entity: T) -> Self {
        Self(Arc::new(entity))
    }

    /// Wraps an existing shared entity.
    pub fn from_arc(entity: Arc<dyn Persistable>) -> Self {
        Self(entity)
    }

    /// Entity name of the instance.
    pub fn entity_name(&self) -> &str {
        self.0.entity_name()
    }

    /// Interceptor of an enhanced instance.
    pub fn interceptor(&self) -> Option<&dyn AttributeInterceptor> {
        self.0.interceptor()
    }

    /// Borrows the instance as a concrete type.
    pub fn downcast_ref<T: Persistable>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// The shared instance.
    pub fn as_arc(&self) -> &Arc<dyn Persistable> {
        &self.0
    }

    /// Non-owning handle to the instance.
    pub fn downgrade(&self) -> Weak<dyn Persistable> {
        Arc::downgrade(&self.0)
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        self.addr() == other.addr()
    }

    /// Address used as the identity of the instance.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef({}@{:#x})", self.entity_name(), self.addr())
    }
}

/// Either a real entity or a proxy standing in for one.
///
/// Equality and hashing follow identity.
#[derive(Clone)]
pub enum Instance {
    /// A real (possibly enhanced) entity.
    Entity(EntityRef),
    /// A lazy stand-in.
    Proxy(ProxyRef),
}

impl Instance {
    /// Entity name of the entity or of the proxied entity.
    pub fn entity_name(&self) -> String {
        match self {
            Instance::Entity(e) => e.entity_name().to_string(),
            Instance::Proxy(p) => p.entity_name(),
        }
    }

    /// The entity, if this is not a proxy.
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Instance::Entity(e) => Some(e),
            Instance::Proxy(_) => None,
        }
    }

    /// The proxy, if this is one.
    pub fn as_proxy(&self) -> Option<&ProxyRef> {
        match self {
            Instance::Proxy(p) => Some(p),
            Instance::Entity(_) => None,
        }
    }

    /// The entity itself, or the implementation of an initialized proxy.
    ///
    /// Never triggers initialization.
    pub fn resolved_entity(&self) -> Option<EntityRef> {
        match self {
            Instance::Entity(e) => Some(e.clone()),
            Instance::Proxy(p) => p.implementation_if_initialized(),
        }
    }

    /// Address used as the identity of the instance.
    pub fn addr(&self) -> usize {
        match self {
            Instance::Entity(e) => e.addr(),
            Instance::Proxy(p) => Arc::as_ptr(p) as usize,
        }
    }

    /// Whether this instance is, or proxies, the given entity.
    pub fn refers_to(&self, entity: &EntityRef) -> bool {
        match self {
            Instance::Entity(e) => e.ptr_eq(entity),
            Instance::Proxy(p) => p
                .implementation_if_initialized()
                .is_some_and(|i| i.ptr_eq(entity)),
        }
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Instance {}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl From<EntityRef> for Instance {
    fn from(entity: EntityRef) -> Self {
        Instance::Entity(entity)
    }
}

impl From<ProxyRef> for Instance {
    fn from(proxy: ProxyRef) -> Self {
        Instance::Proxy(proxy)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instance::Entity(e) => e.fmt(f),
            Instance::Proxy(p) => write!(f, "Proxy({}#{})", p.entity_name(), p.identifier()),
        }
    }
}

/// Correspondence from managed instances to their detached counterparts
/// during a merge.
pub type MergeMap = HashMap<Instance, Instance>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Plain(&'static str);

    impl Persistable for Plain {
        fn entity_name(&self) -> &str {
            self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn identity_not_value_equality() {
        let a = EntityRef::new(Plain("Item"));
        let b = EntityRef::new(Plain("Item"));

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(Instance::from(a.clone()), Instance::Entity(a.clone()));
        assert_ne!(Instance::from(a), Instance::from(b));
    }

    #[test]
    fn downcast() {
        let a = EntityRef::new(Plain("Item"));
        assert_eq!(a.downcast_ref::<Plain>().unwrap().0, "Item");
        assert_eq!(a.entity_name(), "Item");
        assert!(a.interceptor().is_none());
    }

    #[test]
    fn merge_map_uses_identity() {
        let managed = EntityRef::new(Plain("Item"));
        let detached = EntityRef::new(Plain("Item"));
        let mut map = MergeMap::new();
        map.insert(managed.clone().into(), detached.clone().into());

        assert_eq!(
            map.get(&Instance::from(managed)),
            Some(&Instance::from(detached.clone()))
        );
        assert!(map.get(&Instance::from(detached)).is_none());
    }
}
