//! Proxy registration, reassociation and narrowing.

use super::entities::not_associated;
use super::PersistenceContext;
use crate::error::{CoreError, CoreResult};
use crate::instance::{EntityRef, Instance};
use crate::key::EntityKey;
use crate::persister::EntityPersister;
use crate::proxy::{ProxyMap, ProxyRef};
use ormctx_codec::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

impl PersistenceContext {
    fn proxy_map(&mut self) -> &ProxyMap {
        let capacity = self.config.initial_capacity;
        self.proxies_by_key
            .get_or_insert_with(|| ProxyMap::with_capacity(capacity))
    }

    /// Live proxy registered under a key.
    pub fn get_proxy(&self, key: &EntityKey) -> Option<ProxyRef> {
        self.proxies_by_key.as_ref()?.get(key)
    }

    /// Registers a proxy under a key, replacing any previous one.
    pub fn add_proxy(&mut self, key: EntityKey, proxy: &ProxyRef) {
        self.proxy_map().insert(key, proxy);
    }

    /// Unregisters the proxy of a key.
    ///
    /// Batch and subselect registrations of the key are dropped too.
    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<ProxyRef> {
        if let Some(queue) = self.batch_fetch_queue.as_mut() {
            queue.remove_batch_loadable_entity_key(key);
            queue.remove_subselect(key);
        }
        self.proxies_by_key.as_ref()?.remove(key)
    }

    fn remove_proxy_by_key(&mut self, key: &EntityKey) {
        if let Some(proxies) = &self.proxies_by_key {
            proxies.remove(key);
        }
    }

    /// Whether this exact proxy is registered.
    pub fn contains_proxy(&self, proxy: &ProxyRef) -> bool {
        self.proxies_by_key
            .as_ref()
            .is_some_and(|p| p.contains_value(proxy))
    }

    /// Live proxies with their keys.
    pub fn proxies(&self) -> Vec<(EntityKey, ProxyRef)> {
        self.proxies_by_key
            .as_ref()
            .map(ProxyMap::live_entries)
            .unwrap_or_default()
    }

    /// Drops registrations whose proxy no longer exists.
    pub fn purge_dead_proxies(&self) -> usize {
        self.proxies_by_key.as_ref().map_or(0, ProxyMap::purge_dead)
    }

    fn bind_proxy(&self, proxy: &ProxyRef, persister: &dyn EntityPersister) -> CoreResult<()> {
        proxy.set_session(
            self.session.clone(),
            self.default_read_only || !persister.is_mutable(),
        )
    }

    fn reassociate(&mut self, proxy: &ProxyRef) -> CoreResult<()> {
        if proxy.is_bound_to(self.session.id()) {
            return Ok(());
        }
        let persister = self.entity_persister(&proxy.entity_name())?;
        let key = self.generate_entity_key(proxy.identifier(), persister.as_ref())?;
        debug!(key = %key, "reassociating proxy");
        // an earlier proxy keeps the slot
        self.proxy_map().put_if_absent(key, proxy);
        self.bind_proxy(proxy, persister.as_ref())
    }

    /// Binds an uninitialized proxy or enhanced entity to this session.
    ///
    /// Returns whether the value was uninitialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is unknown or the proxy is bound to
    /// another open session.
    pub fn reassociate_if_uninitialized_proxy(&mut self, value: &Instance) -> CoreResult<bool> {
        match value {
            Instance::Proxy(proxy) if proxy.is_uninitialized() => {
                self.reassociate(proxy)?;
                Ok(true)
            }
            Instance::Entity(entity) => match entity.interceptor() {
                Some(i) if i.is_enhanced_proxy_uninitialized() => {
                    i.set_session(Some(self.session.clone()));
                    Ok(true)
                }
                _ => Ok(false),
            },
            Instance::Proxy(_) => Ok(false),
        }
    }

    /// Gives a proxy a new identifier and binds it to this session.
    ///
    /// Plain entities are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is unknown or the proxy is bound to
    /// another open session.
    pub fn reassociate_proxy(&mut self, value: &Instance, id: Value) -> CoreResult<()> {
        if let Instance::Proxy(proxy) = value {
            proxy.set_identifier(id);
            self.reassociate(proxy)?;
        }
        Ok(())
    }

    /// The real instance behind a value, without loading.
    ///
    /// # Errors
    ///
    /// Returns a persistent object error for an uninitialized proxy.
    pub fn unproxy(&self, value: &Instance) -> CoreResult<EntityRef> {
        match value {
            Instance::Entity(entity) => Ok(entity.clone()),
            Instance::Proxy(proxy) => proxy.implementation_if_initialized().ok_or_else(|| {
                CoreError::persistent_object(format!(
                    "object was an uninitialized proxy for {}",
                    proxy.entity_name()
                ))
            }),
        }
    }

    /// The real instance behind a value, binding and loading as needed.
    ///
    /// # Errors
    ///
    /// Returns a lazy initialization error if the value cannot be loaded.
    pub fn unproxy_and_reassociate(&mut self, value: &Instance) -> CoreResult<EntityRef> {
        match value {
            Instance::Proxy(proxy) => {
                self.reassociate(proxy)?;
                proxy.implementation()
            }
            Instance::Entity(entity) => {
                if let Some(i) = entity.interceptor() {
                    if i.is_enhanced_proxy_uninitialized() {
                        i.force_initialize()?;
                    }
                }
                Ok(entity.clone())
            }
        }
    }

    /// Reconciles a registered proxy with the persister's concrete type.
    ///
    /// A proxy for a supertype is superseded by `object` when one is given,
    /// or by its own implementation when that already has the right type;
    /// either way the registration is dropped. Otherwise an unregistered
    /// proxy of the concrete type is created with the same read-only flag.
    /// A proxy that is already narrow adopts `object` as its implementation.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if a new proxy cannot be bound.
    pub fn narrow_proxy(
        &mut self,
        proxy: &ProxyRef,
        persister: &Arc<dyn EntityPersister>,
        key: &EntityKey,
        object: Option<&EntityRef>,
    ) -> CoreResult<Instance> {
        if persister.is_subclass_entity_name(&proxy.entity_name()) {
            if let Some(object) = object {
                proxy.set_implementation(object.clone());
            }
            return Ok(Instance::Proxy(Arc::clone(proxy)));
        }

        debug!(
            from = %proxy.entity_name(),
            to = persister.entity_name(),
            "narrowing proxy"
        );
        if let Some(object) = object {
            self.remove_proxy_by_key(key);
            return Ok(Instance::Entity(object.clone()));
        }
        if let Some(implementation) = proxy.implementation_if_initialized() {
            if persister.is_instance(&implementation) {
                self.remove_proxy_by_key(key);
                return Ok(Instance::Entity(implementation));
            }
        }

        let narrowed = persister.create_proxy(key.identifier().clone());
        narrowed.set_read_only_before_attached(Some(proxy.read_only_flag()));
        self.bind_proxy(&narrowed, persister.as_ref())?;
        Ok(Instance::Proxy(narrowed))
    }

    /// The registered proxy for an entity, narrowed, or the entity itself.
    ///
    /// # Errors
    ///
    /// See [`narrow_proxy`](Self::narrow_proxy).
    pub fn proxy_for(
        &mut self,
        persister: &Arc<dyn EntityPersister>,
        key: &EntityKey,
        entity: EntityRef,
    ) -> CoreResult<Instance> {
        if !persister.has_proxy() {
            return Ok(Instance::Entity(entity));
        }
        match self.get_proxy(key) {
            Some(proxy) => self.narrow_proxy(&proxy, persister, key, Some(&entity)),
            None => Ok(Instance::Entity(entity)),
        }
    }

    /// [`proxy_for`](Self::proxy_for) using the entity's own entry.
    ///
    /// # Errors
    ///
    /// Returns a transient object error if the entity has no entry.
    pub fn proxy_for_entity(&mut self, entity: &EntityRef) -> CoreResult<Instance> {
        let entry = self.get_entry(entity).ok_or_else(|| not_associated(entity))?;
        let persister = Arc::clone(entry.persister());
        let key = entry.entity_key().clone();
        self.proxy_for(&persister, &key, entity.clone())
    }

    /// Registers an enhanced entity acting as its own proxy.
    pub fn add_enhanced_proxy(&mut self, key: EntityKey, entity: EntityRef) {
        let capacity = self.config.initial_capacity;
        self.entities_by_key
            .get_or_insert_with(|| HashMap::with_capacity(capacity))
            .insert(key, entity);
    }
}
