//! Shared setup for the persistence context suites.

#![allow(dead_code)]

use ormctx_core::{
    CollectionPersister, EntityKey, EntityPersister, EntityRef, EntryParams, PersistenceContext,
    Value,
};
use ormctx_testkit::{library, FixtureMetamodel, Record, TestSession};
use std::sync::Arc;

/// A context over the library domain, with its session kept alive.
pub struct Harness {
    pub model: Arc<FixtureMetamodel>,
    pub session: Arc<TestSession>,
    pub ctx: PersistenceContext,
}

impl Harness {
    pub fn new() -> Self {
        ormctx_testkit::init_tracing();
        let model = library();
        let session = TestSession::open(&model);
        let ctx = PersistenceContext::new(&session.handle());
        Self { model, session, ctx }
    }

    pub fn persister(&self, entity_name: &str) -> Arc<dyn EntityPersister> {
        self.model.record(entity_name)
    }

    pub fn role(&self, role: &str) -> Arc<dyn CollectionPersister> {
        self.model.role(role)
    }

    pub fn key(&self, entity_name: &str, id: i64) -> EntityKey {
        self.ctx
            .generate_entity_key(Value::Integer(id), self.persister(entity_name).as_ref())
            .unwrap()
    }

    /// Registers a loaded record together with a managed entry.
    pub fn manage(&mut self, entity_name: &str, id: i64, state: Vec<Value>) -> EntityRef {
        let entity = Record::create(entity_name, id, state.clone());
        let key = self.key(entity_name, id);
        let params = EntryParams::new(self.persister(entity_name), Value::Integer(id)).loaded_state(state);
        self.ctx
            .add_entity_with_entry(key, entity.clone(), params)
            .unwrap();
        entity
    }
}

pub fn text(s: &str) -> Value {
    Value::text(s)
}
