//! In-memory entities, persisters and sessions.
//!
//! [`Record`] is a generic entity: an identifier, a flat state array, named
//! collections and one to-one reference. [`RecordPersister`] keeps its rows
//! in a map and counts snapshot reads so tests can observe caching.

use ormctx_codec::Value;
use ormctx_core::{
    extract_natural_id, AttributeInterceptor, CollectionData, CollectionKind, CollectionPersister,
    CollectionRef, CoreError, CoreResult, EntityPersister, EntityProxy, EntityRef, HandleReader,
    HandleWriter, Instance, Metamodel, Persistable, ProxyRef, Session, SessionId, SessionLink,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Interceptor of an enhanced [`Record`] acting as its own proxy.
#[derive(Debug)]
pub struct FixtureInterceptor {
    session: Mutex<Option<SessionLink>>,
    uninitialized: AtomicBool,
}

impl FixtureInterceptor {
    fn new(uninitialized: bool) -> Self {
        Self {
            session: Mutex::new(None),
            uninitialized: AtomicBool::new(uninitialized),
        }
    }
}

impl AttributeInterceptor for FixtureInterceptor {
    fn set_session(&self, session: Option<SessionLink>) {
        *self.session.lock() = session;
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.lock().as_ref().map(SessionLink::id)
    }

    fn is_enhanced_proxy_uninitialized(&self) -> bool {
        self.uninitialized.load(Ordering::SeqCst)
    }

    fn force_initialize(&self) -> CoreResult<()> {
        if !self.session.lock().as_ref().is_some_and(SessionLink::is_live) {
            return Err(CoreError::lazy_initialization(
                "enhanced entity has no open session",
            ));
        }
        self.uninitialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Generic test entity.
#[derive(Debug)]
pub struct Record {
    entity_name: String,
    id: Value,
    state: Mutex<Vec<Value>>,
    collections: Mutex<BTreeMap<String, CollectionRef>>,
    reference: Mutex<Option<Instance>>,
    interceptor: Option<FixtureInterceptor>,
}

impl Record {
    fn build(entity_name: &str, id: Value, state: Vec<Value>, interceptor: Option<FixtureInterceptor>) -> Self {
        Self {
            entity_name: entity_name.to_string(),
            id,
            state: Mutex::new(state),
            collections: Mutex::new(BTreeMap::new()),
            reference: Mutex::new(None),
            interceptor,
        }
    }

    /// Creates a plain record.
    pub fn create(entity_name: &str, id: impl Into<Value>, state: Vec<Value>) -> EntityRef {
        EntityRef::new(Self::build(entity_name, id.into(), state, None))
    }

    /// Creates an enhanced record whose attributes are not loaded yet.
    pub fn enhanced(entity_name: &str, id: impl Into<Value>) -> EntityRef {
        EntityRef::new(Self::build(
            entity_name,
            id.into(),
            Vec::new(),
            Some(FixtureInterceptor::new(true)),
        ))
    }

    /// The record behind an entity handle.
    ///
    /// # Panics
    ///
    /// Panics if the entity is not a [`Record`].
    pub fn of(entity: &EntityRef) -> &Record {
        entity.downcast_ref::<Record>().expect("entity is not a Record")
    }

    /// Identifier.
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Current state array.
    pub fn state(&self) -> Vec<Value> {
        self.state.lock().clone()
    }

    /// Replaces one state value.
    pub fn set(&self, index: usize, value: impl Into<Value>) {
        let mut state = self.state.lock();
        if state.len() <= index {
            state.resize(index + 1, Value::Null);
        }
        state[index] = value.into();
    }

    /// Sets a collection-valued property.
    pub fn set_collection(&self, property: &str, collection: CollectionRef) {
        self.collections.lock().insert(property.to_string(), collection);
    }

    /// A collection-valued property.
    pub fn collection(&self, property: &str) -> Option<CollectionRef> {
        self.collections.lock().get(property).cloned()
    }

    /// Sets the to-one reference.
    pub fn set_reference(&self, target: Option<Instance>) {
        *self.reference.lock() = target;
    }

    /// The to-one reference.
    pub fn reference(&self) -> Option<Instance> {
        self.reference.lock().clone()
    }
}

impl Persistable for Record {
    fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn interceptor(&self) -> Option<&dyn AttributeInterceptor> {
        self.interceptor
            .as_ref()
            .map(|i| i as &dyn AttributeInterceptor)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-memory persister for [`Record`] entities.
#[derive(Debug)]
pub struct RecordPersister {
    entity_name: String,
    root_entity_name: String,
    subclasses: Vec<String>,
    proxied: bool,
    mutable: bool,
    batch_size: usize,
    cacheable: bool,
    natural_id: Vec<usize>,
    immutable_natural_id: bool,
    unique_properties: Vec<(String, usize)>,
    rows: Mutex<HashMap<Value, Vec<Value>>>,
    snapshot_reads: AtomicUsize,
}

impl RecordPersister {
    /// A root entity with no proxies, batch size 1 and no natural id.
    pub fn new(entity_name: &str) -> Self {
        Self {
            entity_name: entity_name.to_string(),
            root_entity_name: entity_name.to_string(),
            subclasses: Vec::new(),
            proxied: false,
            mutable: true,
            batch_size: 1,
            cacheable: false,
            natural_id: Vec::new(),
            immutable_natural_id: false,
            unique_properties: Vec::new(),
            rows: Mutex::new(HashMap::new()),
            snapshot_reads: AtomicUsize::new(0),
        }
    }

    /// Places the entity under a root.
    #[must_use]
    pub fn root(mut self, root: &str) -> Self {
        self.root_entity_name = root.to_string();
        self
    }

    /// Declares a subclass entity name.
    #[must_use]
    pub fn subclass(mut self, name: &str) -> Self {
        self.subclasses.push(name.to_string());
        self
    }

    /// Enables proxies.
    #[must_use]
    pub fn proxied(mut self) -> Self {
        self.proxied = true;
        self
    }

    /// Marks the entity immutable.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Enables second-level cache writes.
    #[must_use]
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Declares the natural id properties.
    #[must_use]
    pub fn natural_id(mut self, properties: &[usize], immutable: bool) -> Self {
        self.natural_id = properties.to_vec();
        self.immutable_natural_id = immutable;
        self
    }

    /// Declares a unique property at a state index.
    #[must_use]
    pub fn unique_property(mut self, property: &str, index: usize) -> Self {
        self.unique_properties.push((property.to_string(), index));
        self
    }

    /// Stores a row.
    pub fn insert_row(&self, id: impl Into<Value>, state: Vec<Value>) {
        self.rows.lock().insert(id.into(), state);
    }

    /// Deletes a row.
    pub fn delete_row(&self, id: &Value) {
        self.rows.lock().remove(id);
    }

    /// Number of [`database_snapshot`](EntityPersister::database_snapshot) calls.
    pub fn snapshot_reads(&self) -> usize {
        self.snapshot_reads.load(Ordering::SeqCst)
    }
}

impl EntityPersister for RecordPersister {
    fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn root_entity_name(&self) -> &str {
        &self.root_entity_name
    }

    fn is_subclass_entity_name(&self, entity_name: &str) -> bool {
        entity_name == self.entity_name || self.subclasses.iter().any(|s| s == entity_name)
    }

    fn is_instance(&self, entity: &EntityRef) -> bool {
        self.is_subclass_entity_name(entity.entity_name())
    }

    fn has_proxy(&self) -> bool {
        self.proxied
    }

    fn create_proxy(&self, id: Value) -> ProxyRef {
        EntityProxy::new(self.entity_name.as_str(), id)
    }

    fn is_mutable(&self) -> bool {
        self.mutable
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn can_write_to_cache(&self) -> bool {
        self.cacheable
    }

    fn has_natural_identifier(&self) -> bool {
        !self.natural_id.is_empty()
    }

    fn has_immutable_natural_id(&self) -> bool {
        self.immutable_natural_id
    }

    fn natural_id_properties(&self) -> &[usize] {
        &self.natural_id
    }

    fn natural_id_snapshot(&self, id: &Value) -> CoreResult<Option<Value>> {
        Ok(self
            .rows
            .lock()
            .get(id)
            .map(|row| extract_natural_id(row, self)))
    }

    fn database_snapshot(&self, id: &Value) -> CoreResult<Option<Vec<Value>>> {
        self.snapshot_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.lock().get(id).cloned())
    }

    fn property_values(&self, entity: &EntityRef) -> Vec<Value> {
        Record::of(entity).state()
    }

    fn collection_property(&self, entity: &EntityRef, property: &str) -> Option<CollectionRef> {
        Record::of(entity).collection(property)
    }

    fn identifier(&self, entity: &EntityRef) -> Option<Value> {
        Some(Record::of(entity).id().clone())
    }

    fn id_by_unique_key(&self, key: &Value, property: &str) -> CoreResult<Option<Value>> {
        let Some(&(_, index)) = self.unique_properties.iter().find(|(p, _)| p == property) else {
            return Err(CoreError::persister(format!(
                "{} has no unique property {property}",
                self.entity_name
            )));
        };
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|(_, row)| row.get(index) == Some(key))
            .map(|(id, _)| id.clone()))
    }

    fn load(&self, id: &Value) -> CoreResult<Option<EntityRef>> {
        Ok(self
            .rows
            .lock()
            .get(id)
            .map(|row| Record::create(&self.entity_name, id.clone(), row.clone())))
    }

    fn serialize_instance(&self, entity: &EntityRef, handles: &mut dyn HandleWriter) -> CoreResult<Value> {
        let record = entity
            .downcast_ref::<Record>()
            .ok_or_else(|| CoreError::persister(format!("{entity:?} is not a record")))?;
        let collections = record
            .collections
            .lock()
            .iter()
            .map(|(p, c)| Value::Array(vec![Value::text(p.as_str()), handles.collection(c)]))
            .collect();
        let reference = record
            .reference()
            .map_or(Value::Null, |r| handles.instance(&r));
        Ok(Value::Array(vec![
            Value::text(record.entity_name.as_str()),
            record.id.clone(),
            Value::Array(record.state()),
            Value::Array(collections),
            reference,
        ]))
    }

    fn deserialize_instance(&self, state: &Value) -> CoreResult<EntityRef> {
        let fields = state
            .as_array()
            .filter(|f| f.len() == 5)
            .ok_or_else(|| CoreError::persister("malformed record state"))?;
        let name = fields[0].clone().into_text()?;
        let values = fields[2].clone().into_array()?;
        Ok(Record::create(&name, fields[1].clone(), values))
    }

    fn link_instance(&self, entity: &EntityRef, state: &Value, handles: &dyn HandleReader) -> CoreResult<()> {
        let record = Record::of(entity);
        let fields = state
            .as_array()
            .filter(|f| f.len() == 5)
            .ok_or_else(|| CoreError::persister("malformed record state"))?;
        for pair in fields[3].clone().into_array()? {
            let pair = pair.into_tuple(2)?;
            let property = pair[0].clone().into_text()?;
            record.set_collection(&property, handles.collection(&pair[1])?);
        }
        if !fields[4].is_null() {
            record.set_reference(Some(handles.instance(&fields[4])?));
        }
        Ok(())
    }
}

/// In-memory persister for one collection role.
#[derive(Debug)]
pub struct FixtureCollectionPersister {
    role: String,
    owner: String,
    kind: CollectionKind,
    batch_size: usize,
    mutable: bool,
    lhs_property: Option<String>,
    elements: Mutex<HashMap<Value, CollectionData>>,
}

impl FixtureCollectionPersister {
    /// A mutable bag role `Owner.property`.
    pub fn new(owner: &str, property: &str) -> Self {
        Self {
            role: format!("{owner}.{property}"),
            owner: owner.to_string(),
            kind: CollectionKind::Bag,
            batch_size: 1,
            mutable: true,
            lhs_property: None,
            elements: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the collection kind.
    #[must_use]
    pub fn kind(mut self, kind: CollectionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Marks the role immutable.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Keys the collection by a unique owner property instead of the id.
    #[must_use]
    pub fn keyed_by(mut self, property: &str) -> Self {
        self.lhs_property = Some(property.to_string());
        self
    }

    /// Stores the elements returned for a key.
    pub fn store(&self, key: impl Into<Value>, data: CollectionData) {
        self.elements.lock().insert(key.into(), data);
    }
}

impl CollectionPersister for FixtureCollectionPersister {
    fn role(&self) -> &str {
        &self.role
    }

    fn owner_entity_name(&self) -> &str {
        &self.owner
    }

    fn kind(&self) -> CollectionKind {
        self.kind
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn is_mutable(&self) -> bool {
        self.mutable
    }

    fn lhs_property_name(&self) -> Option<&str> {
        self.lhs_property.as_deref()
    }

    fn key_type(&self) -> &str {
        if self.lhs_property.is_some() {
            "property"
        } else {
            "identifier"
        }
    }

    fn load_elements(&self, key: &Value) -> CoreResult<CollectionData> {
        Ok(self
            .elements
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| CollectionData::empty(self.kind)))
    }
}

/// Name-indexed persisters.
#[derive(Debug, Default)]
pub struct FixtureMetamodel {
    records: HashMap<String, Arc<RecordPersister>>,
    collections: HashMap<String, Arc<FixtureCollectionPersister>>,
}

impl FixtureMetamodel {
    /// An empty metamodel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity persister.
    #[must_use]
    pub fn entity(mut self, persister: RecordPersister) -> Self {
        self.records
            .insert(persister.entity_name.clone(), Arc::new(persister));
        self
    }

    /// Registers a collection persister.
    #[must_use]
    pub fn collection(mut self, persister: FixtureCollectionPersister) -> Self {
        self.collections
            .insert(persister.role.clone(), Arc::new(persister));
        self
    }

    /// The concrete persister of an entity.
    ///
    /// # Panics
    ///
    /// Panics if the entity is not registered.
    pub fn record(&self, entity_name: &str) -> Arc<RecordPersister> {
        Arc::clone(
            self.records
                .get(entity_name)
                .unwrap_or_else(|| panic!("no persister for {entity_name}")),
        )
    }

    /// The concrete persister of a role.
    ///
    /// # Panics
    ///
    /// Panics if the role is not registered.
    pub fn role(&self, role: &str) -> Arc<FixtureCollectionPersister> {
        Arc::clone(
            self.collections
                .get(role)
                .unwrap_or_else(|| panic!("no persister for {role}")),
        )
    }
}

impl Metamodel for FixtureMetamodel {
    fn entity_persister(&self, entity_name: &str) -> CoreResult<Arc<dyn EntityPersister>> {
        self.records
            .get(entity_name)
            .map(|p| Arc::clone(p) as Arc<dyn EntityPersister>)
            .ok_or_else(|| CoreError::unknown_entity(entity_name))
    }

    fn collection_persister(&self, role: &str) -> CoreResult<Arc<dyn CollectionPersister>> {
        self.collections
            .get(role)
            .map(|p| Arc::clone(p) as Arc<dyn CollectionPersister>)
            .ok_or_else(|| CoreError::unknown_collection_role(role))
    }
}

/// Session over a [`FixtureMetamodel`].
#[derive(Debug)]
pub struct TestSession {
    id: SessionId,
    open: AtomicBool,
    tenant: Option<String>,
    metamodel: Arc<FixtureMetamodel>,
}

impl TestSession {
    /// Opens a session.
    pub fn open(metamodel: &Arc<FixtureMetamodel>) -> Arc<Self> {
        Self::open_for_tenant(metamodel, None)
    }

    /// Opens a session bound to a tenant.
    pub fn open_for_tenant(metamodel: &Arc<FixtureMetamodel>, tenant: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(),
            open: AtomicBool::new(true),
            tenant: tenant.map(str::to_string),
            metamodel: Arc::clone(metamodel),
        })
    }

    /// The session as the trait object a context expects.
    pub fn handle(self: &Arc<Self>) -> Arc<dyn Session> {
        Arc::clone(self) as Arc<dyn Session>
    }

    /// Closes the session; linked proxies and collections stop loading.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Session for TestSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn metamodel(&self) -> &dyn Metamodel {
        self.metamodel.as_ref()
    }

    fn tenant_id(&self) -> Option<&str> {
        self.tenant.as_deref()
    }
}

/// A small library domain used across the test suites.
///
/// - `Author`: proxied root with subclass `Novelist`, batch size 4,
///   mutable natural id at state index 0, unique `email` at index 1,
///   cacheable
/// - `Novelist`: proxied subclass of `Author`
/// - `Book`: proxied, immutable natural id at state index 0
/// - `Author.books`: bag with batch size 3
/// - `Author.aliases`: set keyed by the author's `email`
/// - `Book.chapters`: list
pub fn library() -> Arc<FixtureMetamodel> {
    Arc::new(
        FixtureMetamodel::new()
            .entity(
                RecordPersister::new("Author")
                    .subclass("Novelist")
                    .proxied()
                    .batch_size(4)
                    .natural_id(&[0], false)
                    .unique_property("email", 1)
                    .cacheable(),
            )
            .entity(RecordPersister::new("Novelist").root("Author").proxied())
            .entity(RecordPersister::new("Book").proxied().natural_id(&[0], true))
            .collection(FixtureCollectionPersister::new("Author", "books").batch_size(3))
            .collection(
                FixtureCollectionPersister::new("Author", "aliases")
                    .kind(CollectionKind::Set)
                    .keyed_by("email"),
            )
            .collection(FixtureCollectionPersister::new("Book", "chapters").kind(CollectionKind::List)),
    )
}
