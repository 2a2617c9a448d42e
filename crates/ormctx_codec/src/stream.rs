//! Streams of back-to-back canonical CBOR items.
//!
//! A stream is not wrapped in an outer array: the writer appends items one
//! at a time and the reader pulls them in the same order. Sections are
//! introduced by an item count so that a reader can skip or validate them
//! without knowing their content up front.

use crate::decoder::CanonicalDecoder;
use crate::encoder::CanonicalEncoder;
use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Appends values to a byte stream.
#[derive(Debug, Default)]
pub struct StreamWriter {
    encoder: CanonicalEncoder,
}

impl StreamWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn write(&mut self, value: &Value) -> CodecResult<()> {
        self.encoder.encode(value)
    }

    /// Append a section item count.
    ///
    /// # Errors
    ///
    /// Returns an error if the count does not fit an i64.
    pub fn write_count(&mut self, count: usize) -> CodecResult<()> {
        let n = i64::try_from(count)
            .map_err(|_| CodecError::encoding_failed(format!("count {count} exceeds i64")))?;
        self.encoder.encode(&Value::Integer(n))
    }

    /// Append a boolean.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature mirrors [`write`](Self::write).
    pub fn write_bool(&mut self, value: bool) -> CodecResult<()> {
        self.encoder.encode(&Value::Bool(value))
    }

    /// Append a text string.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature mirrors [`write`](Self::write).
    pub fn write_text(&mut self, value: &str) -> CodecResult<()> {
        self.encoder.encode(&Value::text(value))
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.encoder.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.encoder.is_empty()
    }

    /// Finish the stream.
    pub fn into_bytes(self) -> Vec<u8> {
        self.encoder.into_bytes()
    }
}

/// Pulls values from a byte stream in write order.
#[derive(Debug)]
pub struct StreamReader<'a> {
    decoder: CanonicalDecoder<'a>,
}

impl<'a> StreamReader<'a> {
    /// Create a reader over `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            decoder: CanonicalDecoder::new(bytes),
        }
    }

    /// Read the next value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] at the end of the stream, or a
    /// decoding error for malformed input.
    pub fn read(&mut self) -> CodecResult<Value> {
        self.decoder.decode()
    }

    /// Read a section item count.
    ///
    /// # Errors
    ///
    /// Returns an error if the next item is not a non-negative integer.
    pub fn read_count(&mut self) -> CodecResult<usize> {
        let value = self.read()?;
        let n = value.to_integer()?;
        usize::try_from(n)
            .map_err(|_| CodecError::decoding_failed(format!("invalid section count {n}")))
    }

    /// Read a boolean.
    ///
    /// # Errors
    ///
    /// Returns an error if the next item is not a boolean.
    pub fn read_bool(&mut self) -> CodecResult<bool> {
        self.read()?.to_bool()
    }

    /// Read a text string.
    ///
    /// # Errors
    ///
    /// Returns an error if the next item is not text.
    pub fn read_text(&mut self) -> CodecResult<String> {
        self.read()?.into_text()
    }

    /// Whether the whole stream has been consumed.
    pub fn is_finished(&self) -> bool {
        self.decoder.is_empty()
    }

    /// Byte offset of the next item.
    pub fn position(&self) -> usize {
        self.decoder.position()
    }
}
