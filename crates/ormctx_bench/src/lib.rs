//! Benchmark utilities.

use ormctx_codec::Value;
use ormctx_core::{
    CollectionData, CoreResult, Element, EntityKey, EntityRef, EntryParams, PersistenceContext,
    PersistentCollection,
};
use ormctx_testkit::{library, FixtureMetamodel, Record, TestSession};
use std::sync::Arc;

/// A context with the session it belongs to.
pub struct Fixture {
    /// Metamodel of the library domain.
    pub model: Arc<FixtureMetamodel>,
    /// Session kept alive for the context.
    pub session: Arc<TestSession>,
    /// The context under test.
    pub ctx: PersistenceContext,
}

impl Fixture {
    /// An empty context.
    pub fn new() -> Self {
        let model = library();
        let session = TestSession::open(&model);
        let ctx = PersistenceContext::new(&session.handle());
        Self { model, session, ctx }
    }

    /// A context managing `authors` authors, each owning `books_each` books.
    ///
    /// # Errors
    ///
    /// Fails if an entity cannot be registered.
    pub fn populated(authors: usize, books_each: usize) -> CoreResult<Self> {
        let mut fixture = Self::new();
        for a in 0..authors {
            let id = a as i64;
            let author = fixture.manage("Author", id, author_row(id))?;
            let books = (0..books_each)
                .map(|b| {
                    let book_id = id * 1_000 + b as i64;
                    let book = fixture.manage("Book", book_id, vec![Value::text(format!("isbn-{book_id}"))])?;
                    Ok(Element::from(book))
                })
                .collect::<CoreResult<Vec<_>>>()?;
            Record::of(&author).set_collection("books", PersistentCollection::new(CollectionData::Bag(books)));
        }
        Ok(fixture)
    }

    /// Key of an entity of the library domain.
    pub fn key(&self, entity_name: &str, id: i64) -> EntityKey {
        EntityKey::new(Value::Integer(id), self.model.record(entity_name).as_ref(), None)
    }

    /// Registers a record with a managed entry.
    ///
    /// # Errors
    ///
    /// Fails if the session is gone.
    pub fn manage(&mut self, entity_name: &str, id: i64, state: Vec<Value>) -> CoreResult<EntityRef> {
        let entity = Record::create(entity_name, id, state.clone());
        let params = EntryParams::new(self.model.record(entity_name), Value::Integer(id)).loaded_state(state);
        self.ctx
            .add_entity_with_entry(self.key(entity_name, id), entity.clone(), params)?;
        Ok(entity)
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Loaded state of an author.
pub fn author_row(id: i64) -> Vec<Value> {
    vec![
        Value::text(format!("author-{id}")),
        Value::text(format!("a{id}@example.org")),
    ]
}
