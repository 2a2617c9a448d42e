//! Persistent collection wrappers.
//!
//! A wrapper owns the elements of one collection-valued property together
//! with the bookkeeping the context needs: role, owner key, session
//! affinity, initialization and dirty flags, and the snapshot taken when the
//! elements were last synchronized with the database.

mod entry;

pub use entry::CollectionEntry;

use crate::error::{CoreError, CoreResult};
use crate::instance::{EntityRef, Instance, Persistable};
use crate::persister::{HandleReader, HandleWriter};
use crate::session::SessionLink;
use crate::types::SessionId;
use ormctx_codec::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::warn;

/// Shared handle to a collection wrapper.
pub type CollectionRef = Arc<PersistentCollection>;

/// Shape of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    /// Unordered, duplicates allowed.
    Bag,
    /// Unordered, unique elements.
    Set,
    /// Indexed by position.
    List,
    /// Indexed by key.
    Map,
}

impl CollectionKind {
    /// Stable name used in passivated streams.
    pub const fn as_str(self) -> &'static str {
        match self {
            CollectionKind::Bag => "bag",
            CollectionKind::Set => "set",
            CollectionKind::List => "list",
            CollectionKind::Map => "map",
        }
    }

    /// Parses a stable name.
    ///
    /// # Errors
    ///
    /// Returns an invalid object error for an unknown name.
    pub fn parse(name: &str) -> CoreResult<Self> {
        Ok(match name {
            "bag" => CollectionKind::Bag,
            "set" => CollectionKind::Set,
            "list" => CollectionKind::List,
            "map" => CollectionKind::Map,
            other => {
                return Err(CoreError::invalid_object(format!(
                    "unknown collection kind {other}"
                )))
            }
        })
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ELEMENT_VALUE_TAG: i64 = 2;

/// One element of a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// An entity or proxy.
    Instance(Instance),
    /// A basic or embedded value.
    Value(Value),
}

impl Element {
    /// Whether this element is the given instance.
    ///
    /// A proxy matches its initialized implementation and vice versa.
    pub fn matches(&self, child: &Instance) -> bool {
        let Element::Instance(own) = self else {
            return false;
        };
        if own == child {
            return true;
        }
        match (own.resolved_entity(), child.resolved_entity()) {
            (Some(a), Some(b)) => a.ptr_eq(&b),
            _ => false,
        }
    }

    fn to_value(&self, handles: &mut dyn HandleWriter) -> Value {
        match self {
            Element::Instance(i) => handles.instance(i),
            Element::Value(v) => Value::Array(vec![Value::Integer(ELEMENT_VALUE_TAG), v.clone()]),
        }
    }

    fn from_value(value: Value, handles: &dyn HandleReader) -> CoreResult<Self> {
        let is_value = value
            .as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_integer)
            == Some(ELEMENT_VALUE_TAG);
        if is_value {
            let mut fields = value.into_tuple(2)?;
            return Ok(Element::Value(fields.pop().unwrap_or(Value::Null)));
        }
        handles.instance(&value).map(Element::Instance)
    }
}

impl From<Instance> for Element {
    fn from(instance: Instance) -> Self {
        Element::Instance(instance)
    }
}

impl From<EntityRef> for Element {
    fn from(entity: EntityRef) -> Self {
        Element::Instance(entity.into())
    }
}

impl From<Value> for Element {
    fn from(value: Value) -> Self {
        Element::Value(value)
    }
}

/// Elements of a collection, shaped by its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionData {
    /// Bag elements.
    Bag(Vec<Element>),
    /// Set elements.
    Set(Vec<Element>),
    /// List elements in index order.
    List(Vec<Element>),
    /// Map entries in key order.
    Map(Vec<(Value, Element)>),
}

impl CollectionData {
    /// Empty data of a kind.
    pub fn empty(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Bag => CollectionData::Bag(Vec::new()),
            CollectionKind::Set => CollectionData::Set(Vec::new()),
            CollectionKind::List => CollectionData::List(Vec::new()),
            CollectionKind::Map => CollectionData::Map(Vec::new()),
        }
    }

    /// Kind of this data.
    pub fn kind(&self) -> CollectionKind {
        match self {
            CollectionData::Bag(_) => CollectionKind::Bag,
            CollectionData::Set(_) => CollectionKind::Set,
            CollectionData::List(_) => CollectionKind::List,
            CollectionData::Map(_) => CollectionKind::Map,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            CollectionData::Bag(e) | CollectionData::Set(e) | CollectionData::List(e) => e.len(),
            CollectionData::Map(e) => e.len(),
        }
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements in order, map keys dropped.
    pub fn elements(&self) -> Vec<&Element> {
        match self {
            CollectionData::Bag(e) | CollectionData::Set(e) | CollectionData::List(e) => {
                e.iter().collect()
            }
            CollectionData::Map(e) => e.iter().map(|(_, v)| v).collect(),
        }
    }

    /// Whether `child` is an element.
    pub fn contains(&self, child: &Instance) -> bool {
        self.elements().iter().any(|e| e.matches(child))
    }

    /// Index of `child`: the position in a list, the key in a map.
    pub fn index_of(&self, child: &Instance) -> Option<Value> {
        match self {
            CollectionData::List(e) => e
                .iter()
                .position(|el| el.matches(child))
                .and_then(|i| i64::try_from(i).ok())
                .map(Value::Integer),
            CollectionData::Map(e) => e
                .iter()
                .find(|(_, el)| el.matches(child))
                .map(|(k, _)| k.clone()),
            CollectionData::Bag(_) | CollectionData::Set(_) => None,
        }
    }

    /// Appends an element; for maps the key is the current length.
    pub fn push(&mut self, element: Element) {
        match self {
            CollectionData::Bag(e) | CollectionData::Set(e) | CollectionData::List(e) => {
                e.push(element);
            }
            CollectionData::Map(e) => {
                let key = i64::try_from(e.len()).unwrap_or(i64::MAX);
                e.push((Value::Integer(key), element));
            }
        }
    }

    /// Inserts a map entry; other kinds append the element.
    pub fn put(&mut self, key: Value, element: Element) {
        match self {
            CollectionData::Map(e) => match e.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = element,
                None => e.push((key, element)),
            },
            _ => self.push(element),
        }
    }

    pub(crate) fn to_value(&self, handles: &mut dyn HandleWriter) -> Value {
        let items = match self {
            CollectionData::Bag(e) | CollectionData::Set(e) | CollectionData::List(e) => {
                e.iter().map(|el| el.to_value(handles)).collect()
            }
            CollectionData::Map(e) => e
                .iter()
                .map(|(k, el)| Value::Array(vec![k.clone(), el.to_value(handles)]))
                .collect(),
        };
        Value::Array(items)
    }

    pub(crate) fn from_value(
        value: Value,
        kind: CollectionKind,
        handles: &dyn HandleReader,
    ) -> CoreResult<Self> {
        let items = value.into_array()?;
        if kind == CollectionKind::Map {
            let entries = items
                .into_iter()
                .map(|pair| {
                    let mut fields = pair.into_tuple(2)?.into_iter();
                    match (fields.next(), fields.next()) {
                        (Some(k), Some(el)) => Ok((k, Element::from_value(el, handles)?)),
                        _ => Err(CoreError::invalid_object("truncated map entry")),
                    }
                })
                .collect::<CoreResult<Vec<_>>>()?;
            return Ok(CollectionData::Map(entries));
        }
        let elements = items
            .into_iter()
            .map(|el| Element::from_value(el, handles))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(match kind {
            CollectionKind::Bag => CollectionData::Bag(elements),
            CollectionKind::Set => CollectionData::Set(elements),
            CollectionKind::List | CollectionKind::Map => CollectionData::List(elements),
        })
    }
}

struct CollectionState {
    role: Option<String>,
    key: Option<Value>,
    owner: Option<Weak<dyn Persistable>>,
    session: Option<SessionLink>,
    initialized: bool,
    dirty: bool,
    data: CollectionData,
    stored_snapshot: Option<CollectionData>,
}

/// A collection wrapper tracked by identity.
pub struct PersistentCollection {
    state: Mutex<CollectionState>,
}

impl PersistentCollection {
    fn with_state(data: CollectionData, initialized: bool) -> CollectionRef {
        Arc::new(Self {
            state: Mutex::new(CollectionState {
                role: None,
                key: None,
                owner: None,
                session: None,
                initialized,
                dirty: false,
                data,
                stored_snapshot: None,
            }),
        })
    }

    /// Wraps application elements; the wrapper starts initialized.
    pub fn new(data: CollectionData) -> CollectionRef {
        Self::with_state(data, true)
    }

    /// Creates an uninitialized wrapper to be loaded on demand.
    pub fn uninitialized(kind: CollectionKind) -> CollectionRef {
        Self::with_state(CollectionData::empty(kind), false)
    }

    /// Rebuilds a passivated wrapper.
    pub(crate) fn restore(
        role: Option<String>,
        key: Option<Value>,
        initialized: bool,
        dirty: bool,
        data: CollectionData,
        stored_snapshot: Option<CollectionData>,
    ) -> CollectionRef {
        Arc::new(Self {
            state: Mutex::new(CollectionState {
                role,
                key,
                owner: None,
                session: None,
                initialized,
                dirty,
                data,
                stored_snapshot,
            }),
        })
    }

    /// Role the wrapper was last associated with.
    pub fn role(&self) -> Option<String> {
        self.state.lock().role.clone()
    }

    /// Owner key the wrapper was last associated with.
    pub fn key(&self) -> Option<Value> {
        self.state.lock().key.clone()
    }

    /// Shape of the collection.
    pub fn kind(&self) -> CollectionKind {
        self.state.lock().data.kind()
    }

    /// Whether the wrapper was never associated with a role.
    pub fn is_unreferenced(&self) -> bool {
        self.state.lock().role.is_none()
    }

    /// Owning entity, if set and still alive.
    pub fn owner(&self) -> Option<EntityRef> {
        self.state
            .lock()
            .owner
            .as_ref()
            .and_then(Weak::upgrade)
            .map(EntityRef::from_arc)
    }

    /// Sets the owning entity.
    pub fn set_owner(&self, owner: &EntityRef) {
        self.state.lock().owner = Some(owner.downgrade());
    }

    /// Id of the bound session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.state.lock().session.as_ref().map(SessionLink::id)
    }

    /// Whether the elements are loaded.
    pub fn was_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Whether the elements changed since the last snapshot.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Marks the elements as changed.
    pub fn set_dirty(&self) {
        self.state.lock().dirty = true;
    }

    /// Marks the elements as synchronized.
    pub fn clear_dirty(&self) {
        self.state.lock().dirty = false;
    }

    /// Copy of the elements if initialized. Never loads.
    pub fn data_if_initialized(&self) -> Option<CollectionData> {
        let state = self.state.lock();
        state.initialized.then(|| state.data.clone())
    }

    /// Copy of the elements, loading them if needed.
    ///
    /// # Errors
    ///
    /// See [`force_initialization`](Self::force_initialization).
    pub fn data(&self) -> CoreResult<CollectionData> {
        self.force_initialization()?;
        Ok(self.state.lock().data.clone())
    }

    /// Appends an element, loading the collection first.
    ///
    /// # Errors
    ///
    /// See [`force_initialization`](Self::force_initialization).
    pub fn add(&self, element: impl Into<Element>) -> CoreResult<()> {
        self.force_initialization()?;
        let mut state = self.state.lock();
        state.data.push(element.into());
        state.dirty = true;
        Ok(())
    }

    /// Whether `child` is an element. Uninitialized wrappers contain nothing.
    pub fn contains(&self, child: &Instance) -> bool {
        let state = self.state.lock();
        state.initialized && state.data.contains(child)
    }

    /// Index of `child` in an initialized list or map.
    pub fn index_of(&self, child: &Instance) -> Option<Value> {
        let state = self.state.lock();
        if !state.initialized {
            return None;
        }
        state.data.index_of(child)
    }

    /// Binds the wrapper to a session; returns whether the binding changed.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error if the wrapper is bound to a
    /// different open session.
    pub fn set_current_session(&self, link: SessionLink) -> CoreResult<bool> {
        let mut state = self.state.lock();
        if let Some(current) = &state.session {
            if current.id() == link.id() {
                return Ok(false);
            }
            if current.is_live() {
                return Err(CoreError::illegal_state(format!(
                    "Illegal attempt to associate a collection with two open sessions: {}",
                    describe(&state)
                )));
            }
            warn!(
                collection = %describe(&state),
                "collection was associated with a session that is no longer open"
            );
        }
        state.session = Some(link);
        Ok(true)
    }

    /// Unbinds the wrapper if bound to `session`; returns whether it was.
    pub fn unset_session(&self, session: SessionId) -> bool {
        let mut state = self.state.lock();
        match state.session.as_ref().map(SessionLink::id) {
            Some(current) if current == session => {
                state.session = None;
                true
            }
            Some(_) => {
                warn!(
                    collection = %describe(&state),
                    "collection not unbound: it belongs to a different session"
                );
                false
            }
            None => false,
        }
    }

    /// Loads the elements through the bound session if not yet loaded.
    ///
    /// # Errors
    ///
    /// Returns a lazy initialization error if no open session is bound, or
    /// the error of the load itself.
    pub fn force_initialization(&self) -> CoreResult<()> {
        let link = {
            let state = self.state.lock();
            if state.initialized {
                return Ok(());
            }
            let link = state.session.clone();
            match link.and_then(|l| l.live()) {
                Some(session) => session,
                None => {
                    return Err(CoreError::lazy_initialization(format!(
                        "failed to lazily initialize a collection {} - no Session",
                        describe(&state)
                    )))
                }
            }
        };
        link.initialize_collection(self)
    }

    /// Installs elements read from the database.
    pub fn inject_loaded(&self, data: CollectionData) {
        let mut state = self.state.lock();
        state.data = data;
        state.initialized = true;
        state.dirty = false;
    }

    /// Copy of the current elements for dirty checking.
    pub fn snapshot(&self) -> CollectionData {
        self.state.lock().data.clone()
    }

    /// Records the key, role and snapshot of the last synchronization.
    pub fn set_snapshot(&self, key: Option<Value>, role: Option<String>, snapshot: Option<CollectionData>) {
        let mut state = self.state.lock();
        state.key = key;
        state.role = role;
        state.stored_snapshot = snapshot;
    }

    /// Snapshot recorded by [`set_snapshot`](Self::set_snapshot).
    pub fn stored_snapshot(&self) -> Option<CollectionData> {
        self.state.lock().stored_snapshot.clone()
    }
}

fn describe(state: &CollectionState) -> String {
    format!(
        "[{}#{}]",
        state.role.as_deref().unwrap_or("<unreferenced>"),
        state.key.as_ref().map_or_else(|| "<unknown>".to_string(), ToString::to_string)
    )
}

impl fmt::Debug for PersistentCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PersistentCollection")
            .field("role", &state.role)
            .field("key", &state.key)
            .field("initialized", &state.initialized)
            .field("dirty", &state.dirty)
            .field("len", &state.data.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Debug)]
    struct Line;

    impl Persistable for Line {
        fn entity_name(&self) -> &str {
            "Line"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn contains_uses_identity() {
        let a = EntityRef::new(Line);
        let b = EntityRef::new(Line);
        let coll = PersistentCollection::new(CollectionData::Bag(vec![a.clone().into()]));

        assert!(coll.contains(&a.clone().into()));
        assert!(!coll.contains(&b.into()));
    }

    #[test]
    fn uninitialized_contains_nothing() {
        let coll = PersistentCollection::uninitialized(CollectionKind::Set);
        assert!(!coll.was_initialized());
        assert!(!coll.contains(&EntityRef::new(Line).into()));
        assert!(coll.data_if_initialized().is_none());
    }

    #[test]
    fn index_of_list_and_map() {
        let a = EntityRef::new(Line);
        let b = EntityRef::new(Line);
        let list = CollectionData::List(vec![a.clone().into(), b.clone().into()]);
        assert_eq!(list.index_of(&b.clone().into()), Some(Value::Integer(1)));

        let mut map = CollectionData::empty(CollectionKind::Map);
        map.put(Value::text("first"), a.clone().into());
        assert_eq!(map.index_of(&a.clone().into()), Some(Value::text("first")));
        assert_eq!(
            CollectionData::Set(vec![a.clone().into()]).index_of(&a.into()),
            None
        );
    }

    #[test]
    fn detached_wrapper_cannot_load() {
        let coll = PersistentCollection::uninitialized(CollectionKind::Bag);
        coll.set_snapshot(Some(Value::Integer(1)), Some("Order.lines".into()), None);
        let err = coll.force_initialization().unwrap_err();
        assert!(matches!(err, CoreError::LazyInitialization { .. }));
        assert!(err.to_string().contains("Order.lines#1"));
    }

    #[test]
    fn inject_marks_initialized_and_clean() {
        let coll = PersistentCollection::uninitialized(CollectionKind::List);
        coll.set_dirty();
        coll.inject_loaded(CollectionData::List(vec![Element::Value(Value::Integer(3))]));

        assert!(coll.was_initialized());
        assert!(!coll.is_dirty());
        assert_eq!(coll.snapshot().len(), 1);
    }

    #[test]
    fn unreferenced_until_snapshot_sets_role() {
        let coll = PersistentCollection::new(CollectionData::empty(CollectionKind::Bag));
        assert!(coll.is_unreferenced());
        coll.set_snapshot(None, Some("Order.lines".into()), Some(coll.snapshot()));
        assert!(!coll.is_unreferenced());
        assert!(coll.stored_snapshot().is_some());
    }

    #[test]
    fn owner_is_weak() {
        let coll = PersistentCollection::uninitialized(CollectionKind::Bag);
        let owner = EntityRef::new(Line);
        coll.set_owner(&owner);
        assert!(coll.owner().is_some_and(|o| o.ptr_eq(&owner)));
        drop(owner);
        assert!(coll.owner().is_none());
    }

    #[test]
    fn kind_names_parse_back() {
        for kind in [
            CollectionKind::Bag,
            CollectionKind::Set,
            CollectionKind::List,
            CollectionKind::Map,
        ] {
            assert_eq!(CollectionKind::parse(kind.as_str()).unwrap(), kind);
        }
    }
}
