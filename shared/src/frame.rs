//! Envelope framing shared by the relay and the client.
//!
//! Wire layout: `u16 BE length || raw-deflate(header block) || body`.
//! Only the header block is compressed; the body travels as-is.

use std::io::{Cursor, Read, Write};

use bytes::Bytes;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::{Error, Result};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX: usize = 2;

/// Compress `text` and prepend its compressed length.
///
/// Fails with [`Error::HeaderTooLarge`] when the compressed block does not
/// fit the 16-bit prefix.
pub fn encode_header_block(text: &str) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(text.len() / 2 + 16), Compression::best());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;

    let len = u16::try_from(compressed.len()).map_err(|_| Error::HeaderTooLarge(compressed.len()))?;

    let mut framed = Vec::with_capacity(LENGTH_PREFIX + compressed.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&compressed);
    Ok(framed)
}

/// Read one length-prefixed header block from `reader` and inflate it.
///
/// Exactly `length` bytes are consumed after the prefix, so whatever the
/// reader yields next is the envelope body.
pub fn decode_header_block<R: Read>(reader: &mut R) -> Result<String> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader
        .read_exact(&mut prefix)
        .map_err(|e| Error::Framing(format!("missing length prefix: {e}")))?;
    let len = u16::from_be_bytes(prefix) as usize;

    let mut compressed = vec![0u8; len];
    reader
        .read_exact(&mut compressed)
        .map_err(|_| Error::Framing(format!("header block truncated, expected {len} bytes")))?;

    let inflated = inflate(&compressed)?;
    String::from_utf8(inflated).map_err(|e| Error::Framing(format!("header block is not utf-8: {e}")))
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(compressed.len() * 4 + 64);

    loop {
        let (in_before, out_before) = (inflater.total_in(), inflater.total_out());
        let consumed = in_before as usize;
        let status = inflater
            .decompress_vec(&compressed[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| Error::Framing(format!("inflate header block: {e}")))?;

        if status == Status::StreamEnd {
            return Ok(out);
        }
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(256));
            continue;
        }
        let progressed = inflater.total_in() != in_before || inflater.total_out() != out_before;
        if !progressed || inflater.total_in() as usize == compressed.len() {
            return Err(Error::Framing("header block ends before the deflate stream does".into()));
        }
    }
}

/// One decoded carrier body: the inflated header block plus the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub head: String,
    pub body: Bytes,
}

impl Envelope {
    pub fn new(head: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            head: head.into(),
            body: body.into(),
        }
    }

    /// Serialize to `[prefix][compressed head][body]`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut framed = encode_header_block(&self.head)?;
        framed.extend_from_slice(&self.body);
        Ok(framed)
    }

    /// Split a carrier body into head and payload. The payload shares the
    /// input buffer.
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(&data[..]);
        let head = decode_header_block(&mut cursor)?;
        let offset = cursor.position() as usize;
        Ok(Self {
            head,
            body: data.slice(offset..),
        })
    }
}
