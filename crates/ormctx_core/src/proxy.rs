//! Lazy entity proxies and the weak proxy index.
//!
//! A proxy stands in for an entity that has not been loaded. It remembers
//! the entity name and identifier, the session it is bound to, and, once
//! initialized, the real instance.

use crate::error::{CoreError, CoreResult};
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::session::SessionLink;
use crate::types::SessionId;
use ormctx_codec::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Shared handle to a proxy.
pub type ProxyRef = Arc<EntityProxy>;

/// Lazy-loading state behind a proxy.
#[derive(Debug, Clone)]
pub struct LazyInitializer {
    entity_name: String,
    id: Value,
    session: Option<SessionLink>,
    implementation: Option<EntityRef>,
    read_only: bool,
    read_only_before_attached: Option<bool>,
}

impl LazyInitializer {
    fn new(entity_name: String, id: Value) -> Self {
        Self {
            entity_name,
            id,
            session: None,
            implementation: None,
            read_only: false,
            read_only_before_attached: None,
        }
    }

    fn is_attached(&self) -> bool {
        self.session.as_ref().is_some_and(SessionLink::is_live)
    }

    fn describe(&self) -> String {
        format!("[{}#{}]", self.entity_name, self.id)
    }

    fn detached_error(&self) -> CoreError {
        CoreError::transient_object(format!(
            "proxy {} is detached; the read-only setting is only accessible while it is associated with an open session",
            self.describe()
        ))
    }
}

/// A lazy stand-in for an entity.
pub struct EntityProxy {
    inner: Mutex<LazyInitializer>,
}

impl EntityProxy {
    /// Creates a detached, uninitialized proxy.
    pub fn new(entity_name: impl Into<String>, id: Value) -> ProxyRef {
        Arc::new(Self {
            inner: Mutex::new(LazyInitializer::new(entity_name.into(), id)),
        })
    }

    /// Entity name the proxy was created for.
    pub fn entity_name(&self) -> String {
        self.inner.lock().entity_name.clone()
    }

    /// Identifier of the proxied entity.
    pub fn identifier(&self) -> Value {
        self.inner.lock().id.clone()
    }

    /// Replaces the identifier.
    pub fn set_identifier(&self, id: Value) {
        self.inner.lock().id = id;
    }

    /// Id of the bound session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.lock().session.as_ref().map(SessionLink::id)
    }

    /// Whether the proxy is bound to the given session.
    pub fn is_bound_to(&self, session: SessionId) -> bool {
        self.session_id() == Some(session)
    }

    /// Whether the proxy is bound to an open session.
    pub fn is_attached(&self) -> bool {
        self.inner.lock().is_attached()
    }

    /// Whether the real instance has not been loaded yet.
    pub fn is_uninitialized(&self) -> bool {
        self.inner.lock().implementation.is_none()
    }

    /// The real instance, if already loaded. Never loads.
    pub fn implementation_if_initialized(&self) -> Option<EntityRef> {
        self.inner.lock().implementation.clone()
    }

    /// Supplies the real instance.
    pub fn set_implementation(&self, entity: EntityRef) {
        self.inner.lock().implementation = Some(entity);
    }

    /// The real instance, loading it through the bound session if needed.
    ///
    /// # Errors
    ///
    /// Returns a lazy initialization error if no open session is bound and
    /// an object-not-found error if no row exists.
    pub fn implementation(&self) -> CoreResult<EntityRef> {
        let (name, id, link) = {
            let li = self.inner.lock();
            if let Some(entity) = &li.implementation {
                return Ok(entity.clone());
            }
            (li.entity_name.clone(), li.id.clone(), li.session.clone())
        };

        let session = link.and_then(|l| l.live()).ok_or_else(|| {
            CoreError::lazy_initialization(format!(
                "could not initialize proxy [{name}#{id}] - no Session"
            ))
        })?;
        trace!(entity = %name, id = %id, "initializing proxy");
        let loaded = session
            .immediate_load(&name, &id)?
            .ok_or_else(|| CoreError::object_not_found(name.as_str(), id.clone()))?;

        let mut li = self.inner.lock();
        Ok(li.implementation.get_or_insert(loaded).clone())
    }

    /// Loads the real instance if needed.
    ///
    /// # Errors
    ///
    /// See [`implementation`](Self::implementation).
    pub fn initialize(&self) -> CoreResult<()> {
        self.implementation().map(|_| ())
    }

    /// Binds the proxy to a session.
    ///
    /// The read-only flag comes from the setting recorded while detached,
    /// or from `default_read_only`.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if the proxy is bound to a different
    /// open session.
    pub fn set_session(&self, link: SessionLink, default_read_only: bool) -> CoreResult<()> {
        let mut li = self.inner.lock();
        if li.session.as_ref().map(SessionLink::id) == Some(link.id()) {
            return Ok(());
        }
        if li.is_attached() {
            return Err(CoreError::illegal_state(format!(
                "illegally attempted to associate proxy {} with two open sessions",
                li.describe()
            )));
        }
        li.session = Some(link);
        li.read_only = li.read_only_before_attached.take().unwrap_or(default_read_only);
        Ok(())
    }

    /// Detaches the proxy from its session.
    pub fn unset_session(&self) {
        let mut li = self.inner.lock();
        li.session = None;
        li.read_only = false;
        li.read_only_before_attached = None;
    }

    /// Whether the proxy is read-only.
    ///
    /// # Errors
    ///
    /// Returns a transient object error if the proxy is detached.
    pub fn is_read_only(&self) -> CoreResult<bool> {
        let li = self.inner.lock();
        if !li.is_attached() {
            return Err(li.detached_error());
        }
        Ok(li.read_only)
    }

    /// Sets the read-only flag.
    ///
    /// # Errors
    ///
    /// Returns a transient object error if the proxy is detached.
    pub fn set_read_only(&self, read_only: bool) -> CoreResult<()> {
        let mut li = self.inner.lock();
        if !li.is_attached() {
            return Err(li.detached_error());
        }
        li.read_only = read_only;
        Ok(())
    }

    /// Read-only flag to apply when the proxy is next bound.
    pub fn set_read_only_before_attached(&self, read_only: Option<bool>) {
        self.inner.lock().read_only_before_attached = read_only;
    }

    /// Read-only flag regardless of attachment, for passivation.
    pub(crate) fn read_only_flag(&self) -> bool {
        let li = self.inner.lock();
        if li.session.is_some() {
            li.read_only
        } else {
            li.read_only_before_attached.unwrap_or(false)
        }
    }

    /// Copy of the lazy-loading state.
    pub fn lazy_initializer(&self) -> LazyInitializer {
        self.inner.lock().clone()
    }
}

impl LazyInitializer {
    /// Entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Identifier.
    pub fn identifier(&self) -> &Value {
        &self.id
    }

    /// Bound session.
    pub fn session(&self) -> Option<&SessionLink> {
        self.session.as_ref()
    }

    /// Whether the real instance is loaded.
    pub fn is_uninitialized(&self) -> bool {
        self.implementation.is_none()
    }
}

impl fmt::Debug for EntityProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let li = self.inner.lock();
        f.debug_struct("EntityProxy")
            .field("entity", &li.entity_name)
            .field("id", &li.id)
            .field("initialized", &li.implementation.is_some())
            .field("session", &li.session.as_ref().map(SessionLink::id))
            .finish()
    }
}

/// Index of proxies by entity key holding non-owning references.
///
/// Reachability of a proxy is governed by its users, not by the index.
/// Dead references are dropped lazily by [`purge_dead`](Self::purge_dead)
/// and treated as absent by every lookup.
#[derive(Debug, Default)]
pub struct ProxyMap {
    map: RwLock<HashMap<EntityKey, Weak<EntityProxy>>>,
}

impl ProxyMap {
    /// Creates an empty index.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Live proxy under a key.
    pub fn get(&self, key: &EntityKey) -> Option<ProxyRef> {
        self.map.read().get(key).and_then(Weak::upgrade)
    }

    /// Whether a live proxy is registered under a key.
    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.get(key).is_some()
    }

    /// Registers a proxy, returning the previous live one.
    pub fn insert(&self, key: EntityKey, proxy: &ProxyRef) -> Option<ProxyRef> {
        self.map
            .write()
            .insert(key, Arc::downgrade(proxy))
            .and_then(|w| w.upgrade())
    }

    /// Registers a proxy unless a live one is already present, which is
    /// returned instead.
    pub fn put_if_absent(&self, key: EntityKey, proxy: &ProxyRef) -> Option<ProxyRef> {
        let mut map = self.map.write();
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return Some(existing);
        }
        map.insert(key, Arc::downgrade(proxy));
        None
    }

    /// Removes a key, returning its live proxy.
    pub fn remove(&self, key: &EntityKey) -> Option<ProxyRef> {
        self.map.write().remove(key).and_then(|w| w.upgrade())
    }

    /// Whether this exact proxy is registered.
    pub fn contains_value(&self, proxy: &ProxyRef) -> bool {
        let target = Arc::as_ptr(proxy);
        self.map
            .read()
            .values()
            .any(|w| std::ptr::eq(w.as_ptr(), target))
    }

    /// Live registrations.
    pub fn live_entries(&self) -> Vec<(EntityKey, ProxyRef)> {
        self.map
            .read()
            .iter()
            .filter_map(|(k, w)| w.upgrade().map(|p| (k.clone(), p)))
            .collect()
    }

    /// Every registration, `None` for dead references.
    pub fn entries(&self) -> Vec<(EntityKey, Option<ProxyRef>)> {
        self.map
            .read()
            .iter()
            .map(|(k, w)| (k.clone(), w.upgrade()))
            .collect()
    }

    /// Drops dead references, returning how many were removed.
    pub fn purge_dead(&self) -> usize {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, w| w.strong_count() > 0);
        before - map.len()
    }

    /// Number of registrations, dead ones included.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether no registration exists.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Removes every registration.
    pub fn clear(&self) {
        self.map.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> EntityKey {
        EntityKey::from_parts("Item", "Item", Value::Integer(id), None)
    }

    #[test]
    fn detached_proxy_cannot_load() {
        let proxy = EntityProxy::new("Item", Value::Integer(1));
        assert!(proxy.is_uninitialized());
        let err = proxy.implementation().unwrap_err();
        assert!(matches!(err, CoreError::LazyInitialization { .. }));
        assert!(err.to_string().contains("[Item#1] - no Session"));
    }

    #[test]
    fn detached_read_only_is_transient() {
        let proxy = EntityProxy::new("Item", Value::Integer(1));
        assert!(matches!(
            proxy.is_read_only(),
            Err(CoreError::TransientObject { .. })
        ));
        assert!(proxy.set_read_only(true).is_err());

        proxy.set_read_only_before_attached(Some(true));
        assert!(proxy.read_only_flag());
        proxy.unset_session();
        assert!(!proxy.read_only_flag());
    }

    #[test]
    fn identifier_can_be_replaced() {
        let proxy = EntityProxy::new("Item", Value::Integer(1));
        proxy.set_identifier(Value::Integer(2));
        assert_eq!(proxy.identifier(), Value::Integer(2));
        assert_eq!(proxy.entity_name(), "Item");
    }

    #[test]
    fn map_holds_weak_references() {
        let map = ProxyMap::default();
        let proxy = EntityProxy::new("Item", Value::Integer(1));
        assert!(map.insert(key(1), &proxy).is_none());
        assert!(map.contains_key(&key(1)));
        assert!(map.contains_value(&proxy));

        drop(proxy);
        assert!(map.get(&key(1)).is_none());
        assert_eq!(map.len(), 1);
        assert_eq!(map.purge_dead(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn first_registration_wins() {
        let map = ProxyMap::default();
        let first = EntityProxy::new("Item", Value::Integer(1));
        let second = EntityProxy::new("Item", Value::Integer(1));

        assert!(map.put_if_absent(key(1), &first).is_none());
        let existing = map.put_if_absent(key(1), &second).unwrap();
        assert!(Arc::ptr_eq(&existing, &first));

        drop(existing);
        drop(first);
        assert!(map.put_if_absent(key(1), &second).is_none());
        assert!(Arc::ptr_eq(&map.get(&key(1)).unwrap(), &second));
    }
}
