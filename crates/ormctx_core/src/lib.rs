//! # ormctx core
//!
//! The per-session persistence context of an object/relational mapper.
//!
//! This crate provides:
//! - An identity map of managed entities keyed by [`EntityKey`]
//! - Entity entries with status, loaded state and lock mode
//! - Database snapshot and natural id caches
//! - Proxy registration, reassociation and narrowing
//! - Persistent collection wrappers and their entries
//! - A batch fetch queue for lazy loads
//! - Passivation of a whole context to a byte stream
//!
//! The context does no I/O itself. Row access, proxy creation and instance
//! passivation are delegated to [`EntityPersister`] and
//! [`CollectionPersister`] implementations reached through the owning
//! [`Session`].
//!
//! ## Usage
//!
//! ```ignore
//! use ormctx_core::{EntryParams, PersistenceContext, Status};
//!
//! let mut ctx = PersistenceContext::new(&session);
//! let params = EntryParams::new(persister, id).loaded_state(state);
//! let entry = ctx.add_entry(entity, params)?;
//! assert_eq!(entry.status(), Status::Managed);
//!
//! let bytes = ctx.serialize()?;
//! let restored = PersistenceContext::deserialize(&bytes, &resumed_session)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod collection;
mod config;
mod context;
mod entry;
mod entry_context;
mod error;
mod identity;
mod instance;
mod key;
pub mod lazy;
mod natural_id;
mod persister;
mod proxy;
mod session;
mod types;

pub use batch::{BatchFetchQueue, SubselectFetch};
pub use collection::{
    CollectionData, CollectionEntry, CollectionKind, CollectionRef, Element, PersistentCollection,
};
pub use config::ContextConfig;
pub use context::{PersistenceContext, StreamSummary, SECTION_NAMES, TABLE_NAMES};
pub use entry::{EntityEntry, EntryParams};
pub use entry_context::EntityEntryContext;
pub use error::{CoreError, CoreResult};
pub use identity::{IdentityKey, IdentityMap};
pub use instance::{AttributeInterceptor, EntityRef, Instance, MergeMap, Persistable};
pub use key::{AssociationKey, CollectionKey, EntityKey, EntityUniqueKey};
pub use natural_id::{extract_natural_id, NaturalIdResolutions};
pub use persister::{CollectionPersister, EntityPersister, HandleReader, HandleWriter};
pub use proxy::{EntityProxy, LazyInitializer, ProxyMap, ProxyRef};
pub use session::{Metamodel, Session, SessionLink};
pub use types::{EntryKind, LockMode, SessionId, Status};

/// Re-exported so callers can build identifiers and states without a direct
/// dependency on the codec crate.
pub use ormctx_codec::Value;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
