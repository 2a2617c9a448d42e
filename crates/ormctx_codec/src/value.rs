//! Dynamic value type.
//!
//! `Value` is the currency of the whole workspace: entity identifiers,
//! versions, row ids, loaded state and collection keys are all values, and
//! the passivation stream is a sequence of encoded values.

use crate::error::{CodecError, CodecResult};
use std::cmp::Ordering;
use std::fmt;

/// A dynamic CBOR value.
///
/// Floats are intentionally not supported so that every value has exactly
/// one canonical encoding and a total `Eq`/`Hash`, which is what lets values
/// act as identifiers in hash maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Map of key-value pairs.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Create a map value with keys sorted canonically.
    pub fn map(mut pairs: Vec<(Value, Value)>) -> Self {
        pairs.sort_by(|a, b| a.0.cmp_canonical(&b.0));
        Value::Map(pairs)
    }

    /// Create a text value.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Wrap an optional value, mapping `None` to `Null`.
    pub fn from_option<T: Into<Value>>(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }

    /// Compare two values by their canonical encoding.
    ///
    /// Length-first, then bytewise, as required for map key ordering.
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        let self_type = self.major_type();
        let other_type = other.major_type();
        if self_type != other_type {
            return self_type.cmp(&other_type);
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => {
                // Same major type means same sign here.
                Self::cmp_head(Self::head_argument(*a), Self::head_argument(*b))
            }
            (Value::Bytes(a), Value::Bytes(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => a.len().cmp(&b.len()).then_with(|| {
                a.iter()
                    .zip(b)
                    .map(|(x, y)| x.cmp_canonical(y))
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            }),
            (Value::Map(a), Value::Map(b)) => a.len().cmp(&b.len()).then_with(|| {
                a.iter()
                    .zip(b)
                    .map(|((ak, av), (bk, bv))| {
                        ak.cmp_canonical(bk).then_with(|| av.cmp_canonical(bv))
                    })
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            }),
            // Null and Bool share major type 7.
            (Value::Null, Value::Bool(_)) => Ordering::Greater,
            (Value::Bool(_), Value::Null) => Ordering::Less,
            _ => Ordering::Equal,
        }
    }

    /// The unsigned argument CBOR stores in the head of an integer.
    #[allow(clippy::cast_sign_loss)]
    fn head_argument(n: i64) -> u64 {
        if n >= 0 {
            n as u64
        } else {
            (-1 - n) as u64
        }
    }

    fn cmp_head(a: u64, b: u64) -> Ordering {
        Self::head_len(a).cmp(&Self::head_len(b)).then(a.cmp(&b))
    }

    /// Encoded length of a head carrying `n`.
    pub(crate) fn head_len(n: u64) -> usize {
        match n {
            0..=23 => 1,
            24..=0xFF => 2,
            0x100..=0xFFFF => 3,
            0x1_0000..=0xFFFF_FFFF => 5,
            _ => 9,
        }
    }

    fn major_type(&self) -> u8 {
        match self {
            Value::Integer(n) if *n >= 0 => 0,
            Value::Integer(_) => 1,
            Value::Bytes(_) => 2,
            Value::Text(_) => 3,
            Value::Array(_) => 4,
            Value::Map(_) => 5,
            Value::Bool(_) | Value::Null => 7,
        }
    }

    /// A short name for the variant, used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a text key in this map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
    }

    /// Consume an array value.
    ///
    /// # Errors
    ///
    /// Returns a type mismatch if the value is not an array.
    pub fn into_array(self) -> CodecResult<Vec<Value>> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(CodecError::type_mismatch("array", other.kind())),
        }
    }

    /// Consume an array value that must hold exactly `len` items.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an array of that length.
    pub fn into_tuple(self, len: usize) -> CodecResult<Vec<Value>> {
        let items = self.into_array()?;
        if items.len() != len {
            return Err(CodecError::invalid_structure(format!(
                "expected {len} fields, found {}",
                items.len()
            )));
        }
        Ok(items)
    }

    /// Consume a text value.
    ///
    /// # Errors
    ///
    /// Returns a type mismatch if the value is not text.
    pub fn into_text(self) -> CodecResult<String> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(CodecError::type_mismatch("text", other.kind())),
        }
    }

    /// Consume a nullable text value.
    ///
    /// # Errors
    ///
    /// Returns a type mismatch if the value is neither null nor text.
    pub fn into_optional_text(self) -> CodecResult<Option<String>> {
        match self {
            Value::Null => Ok(None),
            other => other.into_text().map(Some),
        }
    }

    /// Read a boolean.
    ///
    /// # Errors
    ///
    /// Returns a type mismatch if the value is not a boolean.
    pub fn to_bool(&self) -> CodecResult<bool> {
        self.as_bool()
            .ok_or_else(|| CodecError::type_mismatch("bool", self.kind()))
    }

    /// Read an integer.
    ///
    /// # Errors
    ///
    /// Returns a type mismatch if the value is not an integer.
    pub fn to_integer(&self) -> CodecResult<i64> {
        self.as_integer()
            .ok_or_else(|| CodecError::type_mismatch("integer", self.kind()))
    }

    /// Map `Null` to `None`, anything else to `Some`.
    pub fn into_option(self) -> Option<Value> {
        match self {
            Value::Null => None,
            other => Some(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Bytes(b) => {
                f.write_str("0x")?;
                b.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
            }
            Value::Text(s) => f.write_str(s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}
