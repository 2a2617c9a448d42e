//! Passivation of a persistence context to a byte stream.
//!
//! The stream is a sequence of canonical CBOR items:
//!
//! ```text
//! magic, version, default_read_only, has_non_read_only_entities
//! entity table       count, [entity_name, state]*
//! proxy table        count, [entity_name, id, read_only, implementation]*
//! collection table   count, [role, key, kind, initialized, dirty, elements, stored_snapshot]*
//! one section per SECTION_NAMES entry: count, item*
//! ```
//!
//! Instances are written once in the tables and referenced by handle from
//! everywhere else, so references that were shared stay shared after a
//! restore.

use super::{PersistenceContext, Snapshot};
use crate::collection::{CollectionData, CollectionEntry, CollectionKind, CollectionRef, PersistentCollection};
use crate::config::ContextConfig;
use crate::entry::EntityEntry;
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityMap;
use crate::instance::{EntityRef, Instance};
use crate::key::{CollectionKey, EntityKey, EntityUniqueKey};
use crate::persister::{EntityPersister, HandleReader, HandleWriter};
use crate::proxy::{EntityProxy, ProxyMap, ProxyRef};
use crate::session::{Metamodel, Session, SessionLink};
use ormctx_codec::{StreamReader, StreamWriter, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Names of the stream sections, in stream order.
pub const SECTION_NAMES: [&str; 9] = [
    "entities_by_key",
    "entities_by_unique_key",
    "proxies_by_key",
    "entity_snapshots_by_key",
    "entity_entries",
    "collections_by_key",
    "collection_entries",
    "nullifiable_entity_keys",
    "deleted_unloaded_entity_keys",
];

const SECTION_ARITY: [usize; 9] = [2, 2, 2, 2, 2, 2, 4, 3, 3];
/// Names of the object tables, in stream order.
pub const TABLE_NAMES: [&str; 3] = ["entities", "proxies", "collections"];
const TABLE_ARITY: [usize; 3] = [2, 4, 7];

const MAGIC: &str = "ORMCTX-PC";
const FORMAT_VERSION: i64 = 1;

const ENTITY_TAG: i64 = 0;
const PROXY_TAG: i64 = 1;

fn handle(tag: i64, index: usize) -> Value {
    Value::Array(vec![Value::Integer(tag), Value::Integer(index as i64)])
}

fn fields<const N: usize>(item: Value) -> CoreResult<[Value; N]> {
    item.into_tuple(N)?
        .try_into()
        .map_err(|_| CoreError::invalid_object(format!("expected an item of {N} fields")))
}

fn index_of(value: &Value) -> CoreResult<usize> {
    usize::try_from(value.to_integer()?)
        .map_err(|_| CoreError::invalid_object(format!("negative handle {value}")))
}

/// Interns instances and collections in discovery order.
#[derive(Default)]
struct ObjectWriter {
    entities: Vec<EntityRef>,
    entity_index: HashMap<usize, usize>,
    proxies: Vec<ProxyRef>,
    proxy_index: HashMap<usize, usize>,
    collections: Vec<CollectionRef>,
    collection_index: HashMap<usize, usize>,
}

impl ObjectWriter {
    fn entity(&mut self, entity: &EntityRef) -> Value {
        let next = self.entities.len();
        let index = *self.entity_index.entry(entity.addr()).or_insert(next);
        if index == next {
            self.entities.push(entity.clone());
        }
        handle(ENTITY_TAG, index)
    }

    fn proxy(&mut self, proxy: &ProxyRef) -> Value {
        let next = self.proxies.len();
        let index = *self
            .proxy_index
            .entry(Arc::as_ptr(proxy) as usize)
            .or_insert(next);
        if index == next {
            self.proxies.push(Arc::clone(proxy));
        }
        handle(PROXY_TAG, index)
    }

    /// Serializes interned objects until no new ones are discovered.
    fn tables(&mut self, metamodel: &dyn Metamodel) -> CoreResult<[Vec<Value>; 3]> {
        let mut entities = Vec::new();
        let mut proxies = Vec::new();
        let mut collections = Vec::new();
        loop {
            if let Some(entity) = self.entities.get(entities.len()).cloned() {
                let persister = metamodel.entity_persister(entity.entity_name())?;
                let state = persister.serialize_instance(&entity, self)?;
                entities.push(Value::Array(vec![Value::text(entity.entity_name()), state]));
            } else if let Some(proxy) = self.proxies.get(proxies.len()).cloned() {
                let implementation = proxy
                    .implementation_if_initialized()
                    .map_or(Value::Null, |e| self.entity(&e));
                proxies.push(Value::Array(vec![
                    Value::text(proxy.entity_name()),
                    proxy.identifier(),
                    Value::Bool(proxy.read_only_flag()),
                    implementation,
                ]));
            } else if let Some(collection) = self.collections.get(collections.len()).cloned() {
                let stored = collection
                    .stored_snapshot()
                    .map_or(Value::Null, |s| s.to_value(self));
                collections.push(Value::Array(vec![
                    Value::from_option(collection.role()),
                    Value::from_option(collection.key()),
                    Value::text(collection.kind().as_str()),
                    Value::Bool(collection.was_initialized()),
                    Value::Bool(collection.is_dirty()),
                    collection.snapshot().to_value(self),
                    stored,
                ]));
            } else {
                return Ok([entities, proxies, collections]);
            }
        }
    }
}

impl HandleWriter for ObjectWriter {
    fn instance(&mut self, instance: &Instance) -> Value {
        match instance {
            Instance::Entity(e) => self.entity(e),
            Instance::Proxy(p) => self.proxy(p),
        }
    }

    fn collection(&mut self, collection: &CollectionRef) -> Value {
        let next = self.collections.len();
        let index = *self
            .collection_index
            .entry(Arc::as_ptr(collection) as usize)
            .or_insert(next);
        if index == next {
            self.collections.push(Arc::clone(collection));
        }
        Value::Integer(index as i64)
    }
}

/// Restored objects, addressed by the handles of the stream.
#[derive(Default)]
struct ObjectReader {
    entities: Vec<EntityRef>,
    proxies: Vec<ProxyRef>,
    collections: Vec<CollectionRef>,
}

impl ObjectReader {
    fn entity(&self, handle: &Value) -> CoreResult<EntityRef> {
        match self.instance(handle)? {
            Instance::Entity(e) => Ok(e),
            Instance::Proxy(_) => Err(CoreError::invalid_object(format!(
                "handle {handle} refers to a proxy where an entity is required"
            ))),
        }
    }

    fn proxy(&self, handle: &Value) -> CoreResult<ProxyRef> {
        match self.instance(handle)? {
            Instance::Proxy(p) => Ok(p),
            Instance::Entity(_) => Err(CoreError::invalid_object(format!(
                "handle {handle} refers to an entity where a proxy is required"
            ))),
        }
    }
}

impl HandleReader for ObjectReader {
    fn instance(&self, handle: &Value) -> CoreResult<Instance> {
        let pair = handle
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| CoreError::invalid_object(format!("malformed instance handle {handle}")))?;
        let tag = pair[0].to_integer()?;
        let index = index_of(&pair[1])?;
        let found = match tag {
            ENTITY_TAG => self.entities.get(index).cloned().map(Instance::Entity),
            PROXY_TAG => self.proxies.get(index).cloned().map(Instance::Proxy),
            _ => None,
        };
        found.ok_or_else(|| CoreError::invalid_object(format!("dangling instance handle {handle}")))
    }

    fn collection(&self, handle: &Value) -> CoreResult<CollectionRef> {
        self.collections
            .get(index_of(handle)?)
            .cloned()
            .ok_or_else(|| CoreError::invalid_object(format!("dangling collection handle {handle}")))
    }
}

fn write_items(out: &mut StreamWriter, items: &[Value]) -> CoreResult<()> {
    out.write_count(items.len())?;
    for item in items {
        out.write(item)?;
    }
    Ok(())
}

fn read_items(input: &mut StreamReader<'_>) -> CoreResult<Vec<Value>> {
    let count = input.read_count()?;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(input.read()?);
    }
    Ok(items)
}

struct Header {
    version: i64,
    default_read_only: bool,
    has_non_read_only_entities: bool,
}

fn read_header(input: &mut StreamReader<'_>) -> CoreResult<Header> {
    if input.read_text()? != MAGIC {
        return Err(CoreError::invalid_object("not a passivated persistence context"));
    }
    let version = input.read()?.to_integer()?;
    if version != FORMAT_VERSION {
        return Err(CoreError::invalid_object(format!(
            "unsupported format version {version}"
        )));
    }
    Ok(Header {
        version,
        default_read_only: input.read_bool()?,
        has_non_read_only_entities: input.read_bool()?,
    })
}

fn optional_state(value: Value) -> CoreResult<Option<Vec<Value>>> {
    match value {
        Value::Null => Ok(None),
        other => Ok(Some(other.into_array()?)),
    }
}

fn entity_key(value: Value, metamodel: &dyn Metamodel) -> CoreResult<EntityKey> {
    EntityKey::from_value(value, |name| {
        Ok(metamodel.entity_persister(name)?.root_entity_name().to_string())
    })
}

impl PersistenceContext {
    /// Writes the context to a byte stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is gone, an entity is unknown, or a
    /// persister cannot passivate one of its instances.
    pub fn serialize(&self) -> CoreResult<Vec<u8>> {
        let session = self.session()?;
        let mut objects = ObjectWriter::default();
        let sections = self.section_items(&mut objects);
        let tables = objects.tables(session.metamodel())?;

        let mut out = StreamWriter::new();
        out.write_text(MAGIC)?;
        out.write(&Value::Integer(FORMAT_VERSION))?;
        out.write_bool(self.default_read_only)?;
        out.write_bool(self.has_non_read_only_entities)?;
        for (name, items) in TABLE_NAMES.iter().zip(&tables) {
            trace!(table = name, count = items.len(), "serializing");
            write_items(&mut out, items)?;
        }
        for (name, items) in SECTION_NAMES.iter().zip(&sections) {
            trace!(section = name, count = items.len(), "serializing");
            write_items(&mut out, items)?;
        }
        debug!(bytes = out.len(), "serialized persistence context");
        Ok(out.into_bytes())
    }

    fn section_items(&self, objects: &mut ObjectWriter) -> [Vec<Value>; 9] {
        let entities_by_key = self
            .entities_by_key()
            .map(|(k, e)| Value::Array(vec![k.to_value(), objects.entity(e)]))
            .collect();
        let entities_by_unique_key = self
            .entities_by_unique_key
            .iter()
            .flatten()
            .map(|(k, e)| Value::Array(vec![k.to_value(), objects.entity(e)]))
            .collect();
        // dead proxies are written as null and skipped on restore
        let proxies_by_key = self
            .proxies_by_key
            .as_ref()
            .map(ProxyMap::entries)
            .unwrap_or_default()
            .into_iter()
            .map(|(k, p)| {
                let proxy = p.map_or(Value::Null, |p| objects.proxy(&p));
                Value::Array(vec![k.to_value(), proxy])
            })
            .collect();
        let snapshots = self
            .entity_snapshots_by_key
            .iter()
            .flatten()
            .map(|(k, s)| {
                let row = match s {
                    Snapshot::Row(row) => Value::Array(row.clone()),
                    Snapshot::NoRow => Value::Null,
                };
                Value::Array(vec![k.to_value(), row])
            })
            .collect();
        let entries = self
            .entity_entry_context
            .iter()
            .map(|(e, entry)| Value::Array(vec![objects.entity(e), entry.to_value()]))
            .collect();
        let collections_by_key = self
            .collections_by_key()
            .map(|(k, c)| Value::Array(vec![k.to_value(), objects.collection(c)]))
            .collect();
        let collection_entries = self
            .collection_entries
            .iter()
            .flat_map(IdentityMap::iter)
            .map(|(c, entry)| {
                Value::Array(vec![
                    objects.collection(c),
                    Value::from_option(entry.role().map(str::to_string)),
                    Value::from_option(entry.loaded_key().cloned()),
                    entry.snapshot().map_or(Value::Null, |s| s.to_value(objects)),
                ])
            })
            .collect();
        let keys = |set: &Option<HashSet<EntityKey>>| -> Vec<Value> {
            set.iter().flatten().map(EntityKey::to_value).collect()
        };
        [
            entities_by_key,
            entities_by_unique_key,
            proxies_by_key,
            snapshots,
            entries,
            collections_by_key,
            collection_entries,
            keys(&self.nullifiable_entity_keys),
            keys(&self.deleted_unloaded_entity_keys),
        ]
    }

    /// Restores a context written by [`serialize`](Self::serialize) into a
    /// resuming session.
    ///
    /// # Errors
    ///
    /// Every failure, including unknown entities and persister errors, is
    /// reported as an invalid object error.
    pub fn deserialize(bytes: &[u8], session: &Arc<dyn Session>) -> CoreResult<Self> {
        Self::deserialize_with_config(bytes, session, ContextConfig::default())
    }

    /// [`deserialize`](Self::deserialize) with explicit configuration.
    ///
    /// The default read-only setting is taken from the stream.
    ///
    /// # Errors
    ///
    /// See [`deserialize`](Self::deserialize).
    pub fn deserialize_with_config(
        bytes: &[u8],
        session: &Arc<dyn Session>,
        config: ContextConfig,
    ) -> CoreResult<Self> {
        restore(bytes, session, config).map_err(|err| match err {
            err @ CoreError::InvalidObject { .. } => err,
            other => CoreError::invalid_object(format!(
                "could not restore persistence context: {other}"
            )),
        })
    }
}

fn restore(bytes: &[u8], session: &Arc<dyn Session>, config: ContextConfig) -> CoreResult<PersistenceContext> {
    let mut input = StreamReader::new(bytes);
    let header = read_header(&mut input)?;
    let metamodel = session.metamodel();
    let link = SessionLink::new(session);

    let mut ctx = PersistenceContext::with_config(session, config);
    ctx.default_read_only = header.default_read_only;
    ctx.has_non_read_only_entities = header.has_non_read_only_entities;

    // allocate first, link once everything exists
    let mut objects = ObjectReader::default();
    let mut states: Vec<(Arc<dyn EntityPersister>, Value)> = Vec::new();
    for item in read_items(&mut input)? {
        let [name, state] = fields(item)?;
        let persister = metamodel.entity_persister(&name.into_text()?)?;
        objects.entities.push(persister.deserialize_instance(&state)?);
        states.push((persister, state));
    }

    let mut implementations = Vec::new();
    for item in read_items(&mut input)? {
        let [name, id, read_only, implementation] = fields(item)?;
        let proxy = EntityProxy::new(name.into_text()?, id);
        proxy.set_read_only_before_attached(Some(read_only.to_bool()?));
        objects.proxies.push(Arc::clone(&proxy));
        implementations.push((proxy, implementation));
    }

    let mut collections = Vec::new();
    for item in read_items(&mut input)? {
        let [role, key, kind, initialized, dirty, elements, stored] = fields(item)?;
        let kind = CollectionKind::parse(&kind.into_text()?)?;
        let data = CollectionData::from_value(elements, kind, &objects)?;
        let stored = match stored {
            Value::Null => None,
            other => Some(CollectionData::from_value(other, kind, &objects)?),
        };
        collections.push(PersistentCollection::restore(
            role.into_optional_text()?,
            key.into_option(),
            initialized.to_bool()?,
            dirty.to_bool()?,
            data,
            stored,
        ));
    }
    objects.collections = collections;

    for ((persister, state), entity) in states.iter().zip(&objects.entities) {
        persister.link_instance(entity, state, &objects)?;
    }
    for (proxy, implementation) in implementations {
        if !implementation.is_null() {
            proxy.set_implementation(objects.entity(&implementation)?);
        }
    }

    let capacity = ctx.config.initial_capacity;

    let items = read_items(&mut input)?;
    trace!(section = SECTION_NAMES[0], count = items.len(), "deserializing");
    let mut entities_by_key = HashMap::with_capacity(items.len().max(capacity));
    for item in items {
        let [key, entity] = fields(item)?;
        entities_by_key.insert(entity_key(key, metamodel)?, objects.entity(&entity)?);
    }
    ctx.entities_by_key = Some(entities_by_key);

    let items = read_items(&mut input)?;
    trace!(section = SECTION_NAMES[1], count = items.len(), "deserializing");
    if !items.is_empty() {
        let mut by_unique_key = HashMap::with_capacity(items.len());
        for item in items {
            let [key, entity] = fields(item)?;
            by_unique_key.insert(EntityUniqueKey::from_value(key)?, objects.entity(&entity)?);
        }
        ctx.entities_by_unique_key = Some(by_unique_key);
    }

    let items = read_items(&mut input)?;
    trace!(section = SECTION_NAMES[2], count = items.len(), "deserializing");
    let proxies = ProxyMap::with_capacity(items.len().max(capacity));
    for item in items {
        let [key, proxy] = fields(item)?;
        if proxy.is_null() {
            trace!("encountered pruned proxy");
            continue;
        }
        let proxy = objects.proxy(&proxy)?;
        let persister = metamodel.entity_persister(&proxy.entity_name())?;
        proxy.set_session(link.clone(), ctx.default_read_only || !persister.is_mutable())?;
        proxies.insert(entity_key(key, metamodel)?, &proxy);
    }
    ctx.proxies_by_key = Some(proxies);

    let items = read_items(&mut input)?;
    trace!(section = SECTION_NAMES[3], count = items.len(), "deserializing");
    let mut snapshots = HashMap::with_capacity(items.len().max(capacity));
    for item in items {
        let [key, row] = fields(item)?;
        let snapshot = optional_state(row)?.map_or(Snapshot::NoRow, Snapshot::Row);
        snapshots.insert(entity_key(key, metamodel)?, snapshot);
    }
    ctx.entity_snapshots_by_key = Some(snapshots);

    let items = read_items(&mut input)?;
    trace!(section = SECTION_NAMES[4], count = items.len(), "deserializing");
    for item in items {
        let [entity, entry] = fields(item)?;
        let entity = objects.entity(&entity)?;
        let entry = EntityEntry::from_value(entry, |name, id| {
            let persister = metamodel.entity_persister(name)?;
            let key = session.generate_entity_key(id, persister.as_ref());
            Ok((persister, key))
        })?;
        ctx.entity_entry_context.add_entity_entry(entity, entry);
    }

    let items = read_items(&mut input)?;
    trace!(section = SECTION_NAMES[5], count = items.len(), "deserializing");
    let mut collections_by_key = HashMap::with_capacity(items.len().max(capacity));
    for item in items {
        let [key, collection] = fields(item)?;
        collections_by_key.insert(CollectionKey::from_value(key)?, objects.collection(&collection)?);
    }
    ctx.collections_by_key = Some(collections_by_key);

    let items = read_items(&mut input)?;
    trace!(section = SECTION_NAMES[6], count = items.len(), "deserializing");
    let mut collection_entries = IdentityMap::with_capacity(items.len().max(capacity));
    for item in items {
        let [collection, role, loaded_key, snapshot] = fields(item)?;
        let collection = objects.collection(&collection)?;
        let role = role.into_optional_text()?;
        let persister = role
            .as_deref()
            .map(|r| metamodel.collection_persister(r))
            .transpose()?;
        let snapshot = match snapshot {
            Value::Null => None,
            other => Some(CollectionData::from_value(other, collection.kind(), &objects)?),
        };
        collection.set_current_session(link.clone())?;
        collection_entries.insert(
            collection,
            CollectionEntry::restore(persister, role, loaded_key.into_option(), snapshot),
        );
    }
    ctx.collection_entries = Some(collection_entries);

    for (index, target) in [
        &mut ctx.nullifiable_entity_keys,
        &mut ctx.deleted_unloaded_entity_keys,
    ]
    .into_iter()
    .enumerate()
    {
        let items = read_items(&mut input)?;
        trace!(section = SECTION_NAMES[7 + index], count = items.len(), "deserializing");
        if !items.is_empty() {
            let keys = items
                .into_iter()
                .map(|k| entity_key(k, metamodel))
                .collect::<CoreResult<HashSet<_>>>()?;
            *target = Some(keys);
        }
    }

    if !input.is_finished() {
        return Err(CoreError::invalid_object(format!(
            "trailing data at offset {}",
            input.position()
        )));
    }
    debug!(
        entities = ctx.number_of_managed_entities(),
        collections = ctx.collection_entries_len(),
        "deserialized persistence context"
    );
    Ok(ctx)
}

/// Shape of a passivated stream, read without resolving any entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Format version.
    pub version: i64,
    /// Default read-only setting of the context.
    pub default_read_only: bool,
    /// Whether the context held modifiable entities.
    pub has_non_read_only_entities: bool,
    /// Item counts of the object tables, by table name.
    pub tables: Vec<(&'static str, usize)>,
    /// Item counts of the sections, in stream order.
    pub sections: Vec<(&'static str, usize)>,
    /// Stream length.
    pub bytes: usize,
}

impl StreamSummary {
    /// Reads and checks the structure of every item of a stream.
    ///
    /// # Errors
    ///
    /// Returns an invalid object error for a malformed stream.
    pub fn read(bytes: &[u8]) -> CoreResult<Self> {
        let mut input = StreamReader::new(bytes);
        let header = read_header(&mut input)?;
        let mut count = |name: &'static str, arity: usize| -> CoreResult<(&'static str, usize)> {
            let items = read_items(&mut input)?;
            for (i, item) in items.iter().enumerate() {
                if item.as_array().map(<[Value]>::len) != Some(arity) {
                    return Err(CoreError::invalid_object(format!(
                        "{name}: item {i} is not an array of {arity} fields"
                    )));
                }
            }
            Ok((name, items.len()))
        };
        let tables = TABLE_NAMES
            .iter()
            .zip(TABLE_ARITY)
            .map(|(name, arity)| count(*name, arity))
            .collect::<CoreResult<Vec<_>>>()?;
        let sections = SECTION_NAMES
            .iter()
            .zip(SECTION_ARITY)
            .map(|(name, arity)| count(*name, arity))
            .collect::<CoreResult<Vec<_>>>()?;
        if !input.is_finished() {
            return Err(CoreError::invalid_object(format!(
                "trailing data at offset {}",
                input.position()
            )));
        }
        Ok(Self {
            version: header.version,
            default_read_only: header.default_read_only,
            has_non_read_only_entities: header.has_non_read_only_entities,
            tables,
            sections,
            bytes: bytes.len(),
        })
    }

    /// Item count of an object table.
    pub fn table(&self, name: &str) -> Option<usize> {
        self.tables
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
    }

    /// Item count of a section.
    pub fn section(&self, name: &str) -> Option<usize> {
        self.sections
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
    }
}
