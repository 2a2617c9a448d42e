//! Per-entity tracking records.

use crate::error::{CoreError, CoreResult};
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::persister::EntityPersister;
use crate::types::{EntryKind, LockMode, Status};
use ormctx_codec::Value;
use std::fmt;
use std::sync::Arc;

/// Parameters for creating an [`EntityEntry`].
#[derive(Debug, Clone)]
pub struct EntryParams {
    pub(crate) persister: Arc<dyn EntityPersister>,
    pub(crate) id: Value,
    pub(crate) status: Status,
    pub(crate) loaded_state: Option<Vec<Value>>,
    pub(crate) row_id: Option<Value>,
    pub(crate) version: Option<Value>,
    pub(crate) lock_mode: LockMode,
    pub(crate) exists_in_database: bool,
    pub(crate) disable_version_increment: bool,
}

impl EntryParams {
    /// Starts a managed, existing entry for `id`.
    pub fn new(persister: Arc<dyn EntityPersister>, id: Value) -> Self {
        Self {
            persister,
            id,
            status: Status::Managed,
            loaded_state: None,
            row_id: None,
            version: None,
            lock_mode: LockMode::None,
            exists_in_database: true,
            disable_version_increment: false,
        }
    }

    /// Sets the initial status.
    #[must_use]
    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Sets the state as loaded from the database.
    #[must_use]
    pub fn loaded_state(mut self, state: Vec<Value>) -> Self {
        self.loaded_state = Some(state);
        self
    }

    /// Sets the database row id.
    #[must_use]
    pub fn row_id(mut self, row_id: Value) -> Self {
        self.row_id = Some(row_id);
        self
    }

    /// Sets the version value.
    #[must_use]
    pub fn version(mut self, version: Value) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the lock mode.
    #[must_use]
    pub fn lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    /// Sets whether a row exists.
    #[must_use]
    pub fn exists_in_database(mut self, exists: bool) -> Self {
        self.exists_in_database = exists;
        self
    }

    /// Suppresses the version increment (replication).
    #[must_use]
    pub fn disable_version_increment(mut self, disable: bool) -> Self {
        self.disable_version_increment = disable;
        self
    }
}

/// Tracking record of one managed entity instance.
///
/// Status changes go through the persistence context so that it can keep
/// its "has modifiable entities" flag current.
#[derive(Clone)]
pub struct EntityEntry {
    persister: Arc<dyn EntityPersister>,
    kind: EntryKind,
    entity_key: EntityKey,
    status: Status,
    previous_status: Option<Status>,
    loaded_state: Option<Vec<Value>>,
    deleted_state: Option<Vec<Value>>,
    row_id: Option<Value>,
    version: Option<Value>,
    lock_mode: LockMode,
    exists_in_database: bool,
    being_replicated: bool,
}

impl EntityEntry {
    pub(crate) fn new(params: EntryParams, entity_key: EntityKey) -> Self {
        let kind = params.persister.entry_kind();
        let loaded_state = if params.status == Status::ReadOnly {
            None
        } else {
            params.loaded_state
        };
        Self {
            persister: params.persister,
            kind,
            entity_key,
            status: params.status,
            previous_status: None,
            loaded_state,
            deleted_state: None,
            row_id: params.row_id,
            version: params.version,
            lock_mode: params.lock_mode,
            exists_in_database: params.exists_in_database,
            being_replicated: params.disable_version_increment,
        }
    }

    /// Parameters reproducing this entry, optionally under a new id.
    pub(crate) fn to_params(&self, id: Value) -> EntryParams {
        EntryParams {
            persister: Arc::clone(&self.persister),
            id,
            status: self.status,
            loaded_state: self.loaded_state.clone(),
            row_id: self.row_id.clone(),
            version: self.version.clone(),
            lock_mode: self.lock_mode,
            exists_in_database: self.exists_in_database,
            disable_version_increment: self.being_replicated,
        }
    }

    /// Owning persister.
    pub fn persister(&self) -> &Arc<dyn EntityPersister> {
        &self.persister
    }

    /// Entity name of the persister.
    pub fn entity_name(&self) -> &str {
        self.persister.entity_name()
    }

    /// Entry flavour.
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Key of the entity.
    pub fn entity_key(&self) -> &EntityKey {
        &self.entity_key
    }

    /// Identifier of the entity.
    pub fn id(&self) -> &Value {
        self.entity_key.identifier()
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Status before the last transition.
    pub fn previous_status(&self) -> Option<Status> {
        self.previous_status
    }

    /// State as loaded from the database.
    pub fn loaded_state(&self) -> Option<&[Value]> {
        self.loaded_state.as_deref()
    }

    /// State at the time of deletion.
    pub fn deleted_state(&self) -> Option<&[Value]> {
        self.deleted_state.as_deref()
    }

    /// Database row id.
    pub fn row_id(&self) -> Option<&Value> {
        self.row_id.as_ref()
    }

    /// Version value.
    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    /// Current lock mode.
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Whether a row exists.
    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Whether the entity is being replicated.
    pub fn is_being_replicated(&self) -> bool {
        self.being_replicated
    }

    /// Whether the entity is read-only.
    ///
    /// # Errors
    ///
    /// Returns an illegal state error unless the status is managed or
    /// read-only.
    pub fn is_read_only(&self) -> CoreResult<bool> {
        match self.status {
            Status::Managed => Ok(false),
            Status::ReadOnly => Ok(true),
            other => Err(CoreError::illegal_state(format!(
                "instance was not in a valid state ({other})"
            ))),
        }
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        if status == Status::ReadOnly {
            self.loaded_state = None;
        }
        if self.status != status {
            self.previous_status = Some(self.status);
            self.status = status;
        }
    }

    /// Switches between read-only and modifiable.
    ///
    /// Becoming modifiable reloads the loaded state from the instance.
    pub(crate) fn set_read_only(&mut self, read_only: bool, entity: &EntityRef) -> CoreResult<()> {
        if read_only == self.is_read_only()? {
            return Ok(());
        }
        if read_only {
            self.set_status(Status::ReadOnly);
        } else {
            if self.kind == EntryKind::Immutable || !self.persister.is_mutable() {
                return Err(CoreError::illegal_state(
                    "Cannot make an immutable entity modifiable",
                ));
            }
            self.set_status(Status::Managed);
            self.loaded_state = Some(self.persister.property_values(entity));
        }
        Ok(())
    }

    /// Sets the lock mode held on the instance.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedLock` when an immutable entry is asked for a
    /// lock stronger than `Read`.
    pub fn set_lock_mode(&mut self, lock_mode: LockMode) -> CoreResult<()> {
        if self.kind == EntryKind::Immutable
            && !matches!(lock_mode, LockMode::None | LockMode::Read)
        {
            return Err(CoreError::unsupported_lock(format!(
                "lock mode {lock_mode} not supported for immutable {}",
                self.entity_key
            )));
        }
        self.lock_mode = lock_mode;
        Ok(())
    }

    pub(crate) fn downgrade_lock(&mut self) {
        self.lock_mode = LockMode::None;
    }

    /// Records a completed delete.
    pub fn post_delete(&mut self) {
        self.previous_status = Some(self.status);
        self.status = Status::Gone;
        self.exists_in_database = false;
    }

    /// Records a completed update.
    pub fn post_update(&mut self, state: Vec<Value>, next_version: Option<Value>) {
        self.loaded_state = Some(state);
        if next_version.is_some() {
            self.version = next_version;
        }
    }

    /// Records the state at deletion time.
    pub fn set_deleted_state(&mut self, state: Vec<Value>) {
        self.deleted_state = Some(state);
    }

    /// Passivated form; the persister is stored by entity name.
    pub(crate) fn to_value(&self) -> Value {
        let state = |s: &Option<Vec<Value>>| s.clone().map_or(Value::Null, Value::Array);
        Value::Array(vec![
            Value::text(self.entity_name()),
            self.id().clone(),
            Value::text(self.status.as_str()),
            self.previous_status
                .map_or(Value::Null, |s| Value::text(s.as_str())),
            state(&self.loaded_state),
            state(&self.deleted_state),
            Value::from_option(self.row_id.clone()),
            Value::from_option(self.version.clone()),
            Value::text(self.lock_mode.as_str()),
            Value::Bool(self.exists_in_database),
            Value::Bool(self.being_replicated),
        ])
    }

    /// Restores an entry; `resolve` maps the entity name and id to the
    /// persister and key of the resuming session.
    pub(crate) fn from_value(
        value: Value,
        resolve: impl FnOnce(&str, Value) -> CoreResult<(Arc<dyn EntityPersister>, EntityKey)>,
    ) -> CoreResult<Self> {
        let fields = value.into_tuple(11)?;
        let [name, id, status, previous, loaded, deleted, row_id, version, lock, exists, replicated]: [Value; 11] =
            fields
                .try_into()
                .map_err(|_| CoreError::invalid_object("malformed entity entry"))?;

        let (persister, entity_key) = resolve(&name.into_text()?, id)?;
        let state = |v: Value| -> CoreResult<Option<Vec<Value>>> {
            match v {
                Value::Null => Ok(None),
                other => Ok(Some(other.into_array()?)),
            }
        };
        let previous_status = match previous.into_optional_text()? {
            Some(s) => Some(Status::parse(&s)?),
            None => None,
        };

        Ok(Self {
            kind: persister.entry_kind(),
            persister,
            entity_key,
            status: Status::parse(&status.into_text()?)?,
            previous_status,
            loaded_state: state(loaded)?,
            deleted_state: state(deleted)?,
            row_id: row_id.into_option(),
            version: version.into_option(),
            lock_mode: LockMode::parse(&lock.into_text()?)?,
            exists_in_database: exists.to_bool()?,
            being_replicated: replicated.to_bool()?,
        })
    }
}

impl fmt::Debug for EntityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEntry")
            .field("key", &self.entity_key)
            .field("status", &self.status)
            .field("kind", &self.kind)
            .field("lock_mode", &self.lock_mode)
            .field("version", &self.version)
            .field("exists_in_database", &self.exists_in_database)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for EntityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityEntry{}({})", self.entity_key, self.status)
    }
}
