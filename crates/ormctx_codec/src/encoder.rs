//! Canonical CBOR encoder.

use crate::error::CodecResult;
use crate::value::Value;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;

const SIMPLE_FALSE: u8 = 0xf4;
const SIMPLE_TRUE: u8 = 0xf5;
const SIMPLE_NULL: u8 = 0xf6;

/// Encode a single value to canonical CBOR bytes.
///
/// Map keys are ordered by their encoded form (length-first, then bytewise),
/// integers take the shortest head and lengths are always definite.
///
/// # Errors
///
/// Returns an error if a nested value cannot be encoded.
pub fn to_canonical_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// An appending canonical CBOR encoder.
///
/// Successive calls to [`encode`](Self::encode) write items back to back,
/// which is how passivation streams are produced.
#[derive(Debug, Default)]
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new encoder with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Append one value.
    ///
    /// # Errors
    ///
    /// Returns an error if a nested value cannot be encoded.
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Null => self.buffer.push(SIMPLE_NULL),
            Value::Bool(b) => self.buffer.push(if *b { SIMPLE_TRUE } else { SIMPLE_FALSE }),
            Value::Integer(n) => self.write_integer(*n),
            Value::Bytes(b) => {
                self.write_head(MAJOR_BYTES, b.len() as u64);
                self.buffer.extend_from_slice(b);
            }
            Value::Text(s) => {
                self.write_head(MAJOR_TEXT, s.len() as u64);
                self.buffer.extend_from_slice(s.as_bytes());
            }
            Value::Array(items) => {
                self.write_head(MAJOR_ARRAY, items.len() as u64);
                for item in items {
                    self.encode(item)?;
                }
            }
            Value::Map(pairs) => self.write_map(pairs)?,
        }
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get a reference to the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    #[allow(clippy::cast_sign_loss)]
    fn write_integer(&mut self, n: i64) {
        if n >= 0 {
            self.write_head(MAJOR_UNSIGNED, n as u64);
        } else {
            // -1 - n is in [0, i64::MAX] for every negative n.
            self.write_head(MAJOR_NEGATIVE, (-1 - n) as u64);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_head(&mut self, major: u8, argument: u64) {
        let mt = major << 5;
        match Value::head_len(argument) {
            1 => self.buffer.push(mt | argument as u8),
            2 => self.buffer.extend_from_slice(&[mt | 24, argument as u8]),
            3 => {
                self.buffer.push(mt | 25);
                self.buffer
                    .extend_from_slice(&(argument as u16).to_be_bytes());
            }
            5 => {
                self.buffer.push(mt | 26);
                self.buffer
                    .extend_from_slice(&(argument as u32).to_be_bytes());
            }
            _ => {
                self.buffer.push(mt | 27);
                self.buffer.extend_from_slice(&argument.to_be_bytes());
            }
        }
    }

    fn write_map(&mut self, pairs: &[(Value, Value)]) -> CodecResult<()> {
        let mut keyed = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            keyed.push((to_canonical_cbor(key)?, value));
        }
        keyed.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));

        self.write_head(MAJOR_MAP, pairs.len() as u64);
        for (key_bytes, value) in keyed {
            self.buffer.extend_from_slice(&key_bytes);
            self.encode(value)?;
        }
        Ok(())
    }
}
