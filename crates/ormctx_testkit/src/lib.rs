//! # ormctx testkit
//!
//! Test utilities for the ormctx persistence context.
//!
//! This crate provides:
//! - In-memory entities, persisters, metamodel and sessions
//! - A small library domain shared by the test suites
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ormctx_testkit::prelude::*;
//!
//! let model = library();
//! let session = TestSession::open(&model);
//! let mut ctx = PersistenceContext::new(&session.handle());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

pub use fixtures::*;
pub use generators::*;

/// Routes `tracing` output to the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
