//! # ormctx codec
//!
//! Canonical CBOR values and item streams used to passivate a persistence
//! context.
//!
//! The same [`Value`] type carries identifiers, versions, snapshots and
//! collection keys throughout `ormctx_core`, so it is deliberately free of
//! floats: every value has one encoding, a total order and a stable hash.
//!
//! ## Canonical rules
//!
//! - Map keys are sorted by encoded form (length-first, then bytewise)
//! - Integers and lengths use the shortest head
//! - No floats, tags or indefinite-length items
//! - Strings must be UTF-8
//!
//! ## Usage
//!
//! ```
//! use ormctx_codec::{StreamReader, StreamWriter, Value};
//!
//! let mut writer = StreamWriter::new();
//! writer.write_count(1).unwrap();
//! writer.write(&Value::Integer(42)).unwrap();
//! let bytes = writer.into_bytes();
//!
//! let mut reader = StreamReader::new(&bytes);
//! assert_eq!(reader.read_count().unwrap(), 1);
//! assert_eq!(reader.read().unwrap(), Value::Integer(42));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod stream;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder, DEFAULT_MAX_DEPTH};
pub use encoder::{to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use stream::{StreamReader, StreamWriter};
pub use value::Value;

/// Types that convert themselves into a [`Value`].
pub trait Encode {
    /// Produce the value form of `self`.
    fn to_value(&self) -> Value;

    /// Encode `self` to canonical CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value form cannot be encoded.
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_canonical_cbor(&self.to_value())
    }
}

/// Types that rebuild themselves from a [`Value`].
pub trait Decode: Sized {
    /// Rebuild from the value form.
    ///
    /// # Errors
    ///
    /// Returns an error if the value has the wrong shape.
    fn from_value(value: Value) -> CodecResult<Self>;

    /// Decode from canonical CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are malformed or have the wrong shape.
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        Self::from_value(from_cbor(bytes)?)
    }
}

impl Encode for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl Decode for Value {
    fn from_value(value: Value) -> CodecResult<Self> {
        Ok(value)
    }
}
