//! Canonical CBOR decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use std::cmp::Ordering;

/// Maximum element count accepted for arrays and maps.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum accepted byte or text string length.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Default maximum nesting of arrays and maps.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Decode exactly one value from `bytes`.
///
/// # Errors
///
/// Returns an error if the bytes are not canonical CBOR, contain forbidden
/// constructs, or carry trailing data after the value.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::invalid_structure(format!(
            "{} trailing bytes after value",
            decoder.remaining().len()
        )));
    }
    Ok(value)
}

/// A sequential canonical CBOR decoder.
///
/// Each call to [`decode`](Self::decode) consumes one item, so a decoder
/// can walk a stream of back-to-back values.
#[derive(Debug)]
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl<'a> CanonicalDecoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_max_depth(data, DEFAULT_MAX_DEPTH)
    }

    /// Create a decoder with a custom nesting limit.
    pub fn with_max_depth(data: &'a [u8], max_depth: usize) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
            max_depth,
        }
    }

    /// Decode the next value.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed, non-canonical or truncated input.
    pub fn decode(&mut self) -> CodecResult<Value> {
        let initial = self.read_byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            0 => {
                let n = self.read_argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::decoding_failed("unsigned integer exceeds i64"))
            }
            1 => {
                let n = self.read_argument(info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-1 - n))
                    .map_err(|_| CodecError::decoding_failed("negative integer exceeds i64"))
            }
            2 => {
                let len = self.read_length(info, MAX_BYTES_LENGTH)?;
                Ok(Value::Bytes(self.read_bytes(len)?.to_vec()))
            }
            3 => {
                let len = self.read_length(info, MAX_BYTES_LENGTH)?;
                let raw = self.read_bytes(len)?;
                let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_string()))
            }
            4 => {
                let len = self.read_length(info, MAX_CONTAINER_ELEMENTS)?;
                self.nested(|d| {
                    let mut items = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        items.push(d.decode()?);
                    }
                    Ok(Value::Array(items))
                })
            }
            5 => {
                let len = self.read_length(info, MAX_CONTAINER_ELEMENTS)?;
                self.nested(|d| d.decode_map_body(len))
            }
            6 => Err(CodecError::unsupported_type("tagged item")),
            _ => self.decode_simple(info),
        }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Byte offset of the next item.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> CodecResult<T>) -> CodecResult<T> {
        if self.depth >= self.max_depth {
            return Err(CodecError::NestingTooDeep {
                max_depth: self.max_depth,
            });
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn decode_map_body(&mut self, len: usize) -> CodecResult<Value> {
        let mut pairs = Vec::with_capacity(len.min(1024));
        let mut previous: Option<&'a [u8]> = None;

        for _ in 0..len {
            let start = self.pos;
            let key = self.decode()?;
            let key_bytes = &self.data[start..self.pos];

            if let Some(prev) = previous {
                let order = prev.len().cmp(&key_bytes.len()).then_with(|| prev.cmp(key_bytes));
                if order != Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: map keys not in sorted order",
                    ));
                }
            }
            previous = Some(key_bytes);

            let value = self.decode()?;
            pairs.push((key, value));
        }

        Ok(Value::Map(pairs))
    }

    fn decode_simple(&mut self, info: u8) -> CodecResult<Value> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 => Ok(Value::Null),
            25..=27 => Err(CodecError::FloatForbidden),
            31 => Err(CodecError::invalid_structure("break without indefinite")),
            other => Err(CodecError::unsupported_type(format!("simple value {other}"))),
        }
    }

    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let bytes = self.data.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    fn read_length(&mut self, info: u8, max: u64) -> CodecResult<usize> {
        let claimed = self.read_argument(info)?;
        if claimed > max {
            return Err(CodecError::SizeLimitExceeded {
                claimed,
                max_allowed: max,
            });
        }
        usize::try_from(claimed).map_err(|_| CodecError::SizeLimitExceeded {
            claimed,
            max_allowed: max,
        })
    }

    fn read_argument(&mut self, info: u8) -> CodecResult<u64> {
        let value = match info {
            0..=23 => return Ok(u64::from(info)),
            24 => u64::from(self.read_byte()?),
            25 => {
                let b = self.read_bytes(2)?;
                u64::from(u16::from_be_bytes([b[0], b[1]]))
            }
            26 => {
                let b = self.read_bytes(4)?;
                u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            27 => {
                let b = self.read_bytes(8)?;
                u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
            31 => return Err(CodecError::IndefiniteLengthForbidden),
            _ => return Err(CodecError::invalid_structure("reserved additional info")),
        };

        let expected = match Value::head_len(value) {
            1 => 0..=23,
            2 => 24..=24,
            3 => 25..=25,
            5 => 26..=26,
            _ => 27..=27,
        };
        if !expected.contains(&info) {
            return Err(CodecError::invalid_structure(
                "non-canonical: value could be encoded in fewer bytes",
            ));
        }
        Ok(value)
    }
}
