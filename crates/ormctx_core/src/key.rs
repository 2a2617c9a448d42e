//! Composite keys used to index the context.

use crate::error::{CoreError, CoreResult};
use crate::persister::EntityPersister;
use ormctx_codec::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Primary identity of an entity: root entity name plus identifier.
///
/// The concrete entity name and the tenant are carried for information;
/// equality and hashing only consider the root name and the identifier, so
/// a subclass instance and a proxy of its superclass share one key.
#[derive(Debug, Clone)]
pub struct EntityKey {
    entity_name: String,
    root_entity_name: String,
    identifier: Value,
    tenant_id: Option<String>,
}

impl EntityKey {
    /// Builds a key for `identifier` of the given persister.
    pub fn new(identifier: Value, persister: &dyn EntityPersister, tenant_id: Option<String>) -> Self {
        Self {
            entity_name: persister.entity_name().to_string(),
            root_entity_name: persister.root_entity_name().to_string(),
            identifier,
            tenant_id,
        }
    }

    /// Builds a key from its parts.
    pub fn from_parts(
        entity_name: impl Into<String>,
        root_entity_name: impl Into<String>,
        identifier: Value,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            root_entity_name: root_entity_name.into(),
            identifier,
            tenant_id,
        }
    }

    /// Entity name the key was created for.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Root entity name.
    pub fn root_entity_name(&self) -> &str {
        &self.root_entity_name
    }

    /// Identifier value.
    pub fn identifier(&self) -> &Value {
        &self.identifier
    }

    /// Tenant of the owning session.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Passivated form `[entity_name, identifier, tenant]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::text(&self.entity_name),
            self.identifier.clone(),
            Value::from_option(self.tenant_id.clone()),
        ])
    }

    /// Restores a key, resolving the root name through `resolve_root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is malformed or the entity is unknown.
    pub fn from_value(
        value: Value,
        resolve_root: impl FnOnce(&str) -> CoreResult<String>,
    ) -> CoreResult<Self> {
        let mut fields = value.into_tuple(3)?.into_iter();
        let (entity_name, identifier, tenant) = match (fields.next(), fields.next(), fields.next()) {
            (Some(n), Some(i), Some(t)) => (n.into_text()?, i, t.into_optional_text()?),
            _ => return Err(CoreError::invalid_object("truncated entity key")),
        };
        let root = resolve_root(&entity_name)?;
        Ok(Self::from_parts(entity_name, root, identifier, tenant))
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.root_entity_name == other.root_entity_name && self.identifier == other.identifier
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root_entity_name.hash(state);
        self.identifier.hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey[{}#{}]", self.entity_name, self.identifier)
    }
}

/// Secondary identity of an entity loaded by a unique, non-primary property.
#[derive(Debug, Clone)]
pub struct EntityUniqueKey {
    entity_name: String,
    unique_key_name: String,
    key: Value,
    key_type: String,
}

impl EntityUniqueKey {
    /// Creates a unique key.
    pub fn new(
        entity_name: impl Into<String>,
        unique_key_name: impl Into<String>,
        key: Value,
        key_type: impl Into<String>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            unique_key_name: unique_key_name.into(),
            key,
            key_type: key_type.into(),
        }
    }

    /// Entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Property holding the unique value.
    pub fn unique_key_name(&self) -> &str {
        &self.unique_key_name
    }

    /// The unique value.
    pub fn key(&self) -> &Value {
        &self.key
    }

    /// Type name of the unique value.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Passivated form.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::text(&self.entity_name),
            Value::text(&self.unique_key_name),
            Value::text(&self.key_type),
            self.key.clone(),
        ])
    }

    /// Restores a unique key.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is malformed.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let mut fields = value.into_tuple(4)?.into_iter();
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(e), Some(u), Some(t), Some(k)) => {
                Ok(Self::new(e.into_text()?, u.into_text()?, k, t.into_text()?))
            }
            _ => Err(CoreError::invalid_object("truncated unique key")),
        }
    }
}

impl PartialEq for EntityUniqueKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity_name == other.entity_name
            && self.unique_key_name == other.unique_key_name
            && self.key == other.key
    }
}

impl Eq for EntityUniqueKey {}

impl Hash for EntityUniqueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_name.hash(state);
        self.unique_key_name.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Display for EntityUniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EntityUniqueKey[{}.{}={}]",
            self.entity_name, self.unique_key_name, self.key
        )
    }
}

/// Identity of a persistent collection independent of its wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    role: String,
    key: Value,
}

impl CollectionKey {
    /// Creates a collection key.
    pub fn new(role: impl Into<String>, key: Value) -> Self {
        Self {
            role: role.into(),
            key,
        }
    }

    /// Collection role.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Owner key value.
    pub fn key(&self) -> &Value {
        &self.key
    }

    /// Passivated form `[role, key]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![Value::text(&self.role), self.key.clone()])
    }

    /// Restores a collection key.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is malformed.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let mut fields = value.into_tuple(2)?.into_iter();
        match (fields.next(), fields.next()) {
            (Some(role), Some(key)) => Ok(Self::new(role.into_text()?, key)),
            _ => Err(CoreError::invalid_object("truncated collection key")),
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionKey[{}#{}]", self.role, self.key)
    }
}

/// An association of an owner found to be null during a load.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationKey {
    owner_key: EntityKey,
    property_name: String,
}

impl AssociationKey {
    /// Creates an association key.
    pub fn new(owner_key: EntityKey, property_name: impl Into<String>) -> Self {
        Self {
            owner_key,
            property_name: property_name.into(),
        }
    }

    /// Key of the owning entity.
    pub fn owner_key(&self) -> &EntityKey {
        &self.owner_key
    }

    /// Association property.
    pub fn property_name(&self) -> &str {
        &self.property_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key(entity: &str, root: &str, id: i64) -> EntityKey {
        EntityKey::from_parts(entity, root, Value::Integer(id), None)
    }

    #[test]
    fn entity_keys_compare_on_root_and_id() {
        assert_eq!(key("Dog", "Animal", 1), key("Cat", "Animal", 1));
        assert_ne!(key("Dog", "Animal", 1), key("Dog", "Animal", 2));
        assert_ne!(key("Dog", "Animal", 1), key("Dog", "Pet", 1));

        let tenant_a = EntityKey::from_parts("Dog", "Animal", Value::Integer(1), Some("a".into()));
        assert_eq!(tenant_a, key("Dog", "Animal", 1));

        let set: HashSet<_> = [key("Dog", "Animal", 1), key("Cat", "Animal", 1)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn entity_key_value_form() {
        let original = EntityKey::from_parts("Dog", "Animal", Value::text("rex"), Some("t1".into()));
        let restored = EntityKey::from_value(original.to_value(), |name| {
            assert_eq!(name, "Dog");
            Ok("Animal".to_string())
        })
        .unwrap();

        assert_eq!(restored, original);
        assert_eq!(restored.entity_name(), "Dog");
        assert_eq!(restored.tenant_id(), Some("t1"));
    }

    #[test]
    fn entity_key_restore_reports_unknown_entity() {
        let original = key("Ghost", "Ghost", 3);
        let result = EntityKey::from_value(original.to_value(), |name| {
            Err(CoreError::unknown_entity(name))
        });
        assert!(matches!(result, Err(CoreError::UnknownEntity { .. })));
    }

    #[test]
    fn unique_key_ignores_type_name() {
        let a = EntityUniqueKey::new("User", "email", Value::text("a@x"), "string");
        let b = EntityUniqueKey::new("User", "email", Value::text("a@x"), "text");
        let c = EntityUniqueKey::new("User", "login", Value::text("a@x"), "string");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(EntityUniqueKey::from_value(a.to_value()).unwrap(), a);
    }

    #[test]
    fn display_forms() {
        assert_eq!(key("Dog", "Animal", 5).to_string(), "EntityKey[Dog#5]");
        assert_eq!(
            CollectionKey::new("Order.lines", Value::Integer(9)).to_string(),
            "CollectionKey[Order.lines#9]"
        );
    }

    #[test]
    fn association_keys() {
        let a = AssociationKey::new(key("Order", "Order", 1), "customer");
        let b = AssociationKey::new(key("Order", "Order", 1), "customer");
        assert_eq!(a, b);
        assert_eq!(a.property_name(), "customer");
        assert_eq!(a.owner_key().identifier(), &Value::Integer(1));
    }
}
