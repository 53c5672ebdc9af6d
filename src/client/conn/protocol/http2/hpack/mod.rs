//! HPACK header compression (RFC 7541).
//!
//! The decoder must see every header block in the order the peer sent them,
//! including blocks for streams that are about to be discarded, or its
//! dynamic table drifts from the peer's.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

mod huffman;
mod table;

use self::table::{Match, Table};

/// Default dynamic table size for both directions.
pub(crate) const DEFAULT_TABLE_SIZE: usize = 4096;

/// Header names which must never enter a compression table.
const SENSITIVE: &[&[u8]] = &[b"authorization", b"proxy-authorization", b"cookie", b"set-cookie"];

/// Header names whose values change per request and would only churn the table.
const UNINDEXED: &[&[u8]] = &[
    b":path",
    b"content-length",
    b"date",
    b"etag",
    b"if-modified-since",
    b"if-none-match",
    b"last-modified",
    b"location",
];

/// Errors decoding a header block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum HpackError {
    #[error("header block truncated")]
    Truncated,
    #[error("integer overflow")]
    Overflow,
    #[error("invalid table index {0}")]
    InvalidIndex(usize),
    #[error("invalid huffman string")]
    Huffman,
    #[error("dynamic table size update out of place or too large")]
    SizeUpdate,
}

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeaderField {
    pub(crate) name: Bytes,
    pub(crate) value: Bytes,
}

impl HeaderField {
    pub(crate) fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Size for table accounting (RFC 7541 Section 4.1).
    pub(crate) fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

fn encode_int(dst: &mut BytesMut, value: usize, prefix_bits: u8, pattern: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        dst.put_u8(pattern | value as u8);
        return;
    }

    dst.put_u8(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 128 {
        dst.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

fn decode_int(src: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize, HpackError> {
    let first = *src.get(*pos).ok_or(HpackError::Truncated)?;
    *pos += 1;

    let max = (1usize << prefix_bits) - 1;
    let mut value = (first as usize) & max;
    if value < max {
        return Ok(value);
    }

    let mut shift = 0u32;
    loop {
        let byte = *src.get(*pos).ok_or(HpackError::Truncated)?;
        *pos += 1;
        if shift > 28 {
            return Err(HpackError::Overflow);
        }
        value = value
            .checked_add(((byte & 0x7f) as usize) << shift)
            .ok_or(HpackError::Overflow)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn encode_str(dst: &mut BytesMut, data: &[u8]) {
    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        encode_int(dst, huffman_len, 7, 0x80);
        let mut out = Vec::with_capacity(huffman_len);
        huffman::encode(data, &mut out);
        dst.extend_from_slice(&out);
    } else {
        encode_int(dst, data.len(), 7, 0x00);
        dst.extend_from_slice(data);
    }
}

fn decode_str(src: &[u8], pos: &mut usize) -> Result<Bytes, HpackError> {
    let huffman = src.get(*pos).ok_or(HpackError::Truncated)? & 0x80 != 0;
    let len = decode_int(src, pos, 7)?;
    let end = pos.checked_add(len).ok_or(HpackError::Overflow)?;
    let raw = src.get(*pos..end).ok_or(HpackError::Truncated)?;
    *pos = end;

    if huffman {
        huffman::decode(raw).map(Bytes::from)
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

/// Compresses outgoing header blocks.
#[derive(Debug)]
pub(crate) struct Encoder {
    table: Table,
    /// Smallest and final size from settings changes since the last block.
    pending_resize: Option<(usize, usize)>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl Encoder {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            table: Table::new(max_size),
            pending_resize: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. The update is signalled
    /// at the start of the next header block.
    pub(crate) fn set_max_table_size(&mut self, size: usize) {
        let size = size.min(DEFAULT_TABLE_SIZE);
        if size == self.table.max_size() && self.pending_resize.is_none() {
            return;
        }
        self.pending_resize = Some(match self.pending_resize {
            Some((smallest, _)) => (smallest.min(size), size),
            None => (size, size),
        });
        self.table.resize(size);
    }

    /// Encode one complete header block.
    pub(crate) fn encode<'a, I>(&mut self, fields: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = &'a HeaderField>,
    {
        if let Some((smallest, last)) = self.pending_resize.take() {
            if smallest < last {
                encode_int(dst, smallest, 5, 0x20);
            }
            encode_int(dst, last, 5, 0x20);
        }

        for field in fields {
            self.encode_field(field, dst);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, dst: &mut BytesMut) {
        let name = field.name.as_ref();
        let sensitive = SENSITIVE.contains(&name);
        let found = self.table.find(name, &field.value);

        if let (Some(Match::Full(index)), false) = (found, sensitive) {
            encode_int(dst, index, 7, 0x80);
            return;
        }

        let name_index = match found {
            Some(Match::Full(index)) | Some(Match::Name(index)) => Some(index),
            None => None,
        };

        let (prefix, pattern, index_it) = if sensitive {
            (4, 0x10, false)
        } else if UNINDEXED.contains(&name) {
            (4, 0x00, false)
        } else {
            (6, 0x40, true)
        };

        match name_index {
            Some(index) => encode_int(dst, index, prefix, pattern),
            None => {
                dst.put_u8(pattern);
                encode_str(dst, name);
            }
        }
        encode_str(dst, &field.value);

        if index_it {
            self.table.insert(field.clone());
        }
    }
}

/// Decompresses incoming header blocks.
#[derive(Debug)]
pub(crate) struct Decoder {
    table: Table,
    max_allowed: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl Decoder {
    pub(crate) fn new(max_allowed: usize) -> Self {
        Self {
            table: Table::new(max_allowed),
            max_allowed,
        }
    }

    /// Decode one complete header block.
    pub(crate) fn decode(&mut self, src: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        let mut pos = 0;

        while pos < src.len() {
            let byte = src[pos];

            if byte & 0x80 != 0 {
                let index = decode_int(src, &mut pos, 7)?;
                fields.push(self.table.get(index)?);
            } else if byte & 0x40 != 0 {
                let field = self.decode_literal(src, &mut pos, 6)?;
                self.table.insert(field.clone());
                fields.push(field);
            } else if byte & 0x20 != 0 {
                // Size updates are only legal before the first field.
                if !fields.is_empty() {
                    return Err(HpackError::SizeUpdate);
                }
                let size = decode_int(src, &mut pos, 5)?;
                if size > self.max_allowed {
                    return Err(HpackError::SizeUpdate);
                }
                self.table.resize(size);
            } else {
                // Without indexing (0000) and never indexed (0001) share a shape.
                fields.push(self.decode_literal(src, &mut pos, 4)?);
            }
        }

        Ok(fields)
    }

    fn decode_literal(
        &self,
        src: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<HeaderField, HpackError> {
        let name_index = decode_int(src, pos, prefix_bits)?;
        let name = if name_index == 0 {
            decode_str(src, pos)?
        } else {
            self.table.get(name_index)?.name
        };
        let value = decode_str(src, pos)?;
        Ok(HeaderField { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &'static str, value: &'static str) -> HeaderField {
        HeaderField::new(
            Bytes::from_static(name.as_bytes()),
            Bytes::from_static(value.as_bytes()),
        )
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn integer_examples() {
        // RFC 7541 C.1.1 through C.1.3.
        let mut dst = BytesMut::new();
        encode_int(&mut dst, 10, 5, 0);
        assert_eq!(&dst[..], &[10]);

        let mut dst = BytesMut::new();
        encode_int(&mut dst, 1337, 5, 0);
        assert_eq!(&dst[..], &[31, 154, 10]);
        let mut pos = 0;
        assert_eq!(decode_int(&dst, &mut pos, 5).unwrap(), 1337);
        assert_eq!(pos, 3);

        let mut dst = BytesMut::new();
        encode_int(&mut dst, 42, 8, 0);
        assert_eq!(&dst[..], &[42]);
    }

    #[test]
    fn truncated_integer() {
        let mut pos = 0;
        assert_eq!(
            decode_int(&[0x1f, 0x9a], &mut pos, 5),
            Err(HpackError::Truncated)
        );
    }

    #[test]
    fn rfc_requests_without_huffman() {
        let mut decoder = Decoder::default();

        // C.3.1
        let fields = decoder
            .decode(&hex("828684410f7777772e6578616d706c652e636f6d"))
            .unwrap();
        assert_eq!(
            fields,
            vec![
                field(":method", "GET"),
                field(":scheme", "http"),
                field(":path", "/"),
                field(":authority", "www.example.com"),
            ]
        );
        assert_eq!(decoder.table.size(), 57);

        // C.3.2 reuses the dynamic entry at index 62.
        let fields = decoder
            .decode(&hex("828684be58086e6f2d6361636865"))
            .unwrap();
        assert_eq!(fields[3], field(":authority", "www.example.com"));
        assert_eq!(fields[4], field("cache-control", "no-cache"));
        assert_eq!(decoder.table.size(), 110);
    }

    #[test]
    fn rfc_request_with_huffman() {
        // C.4.1
        let mut decoder = Decoder::default();
        let fields = decoder
            .decode(&hex("828684418cf1e3c2e5f23a6ba0ab90f4ff"))
            .unwrap();
        assert_eq!(fields[3], field(":authority", "www.example.com"));
    }

    #[test]
    fn encoder_and_decoder_stay_in_sync() {
        let mut encoder = Encoder::default();
        let mut decoder = Decoder::default();

        let block = vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":path", "/resource"),
            field(":authority", "example.com"),
            field("user-agent", "switchyard"),
            field("authorization", "secret"),
        ];

        for _ in 0..3 {
            let mut dst = BytesMut::new();
            encoder.encode(&block, &mut dst);
            assert_eq!(decoder.decode(&dst).unwrap(), block);
        }

        // Sensitive values never enter either table.
        assert_eq!(
            encoder.table.find(b"authorization", b"secret"),
            Some(Match::Name(23))
        );
        assert_eq!(encoder.table.dynamic_len(), decoder.table.dynamic_len());
    }

    #[test]
    fn second_block_is_smaller() {
        let mut encoder = Encoder::default();
        let block = vec![field(":authority", "example.com"), field("x-trace", "abc")];

        let mut first = BytesMut::new();
        encoder.encode(&block, &mut first);
        let mut second = BytesMut::new();
        encoder.encode(&block, &mut second);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn table_size_update_is_signalled() {
        let mut encoder = Encoder::default();
        let mut decoder = Decoder::default();

        encoder.set_max_table_size(0);
        let mut dst = BytesMut::new();
        encoder.encode(&[field("x-a", "1")], &mut dst);
        assert_eq!(dst[0], 0x20);
        assert_eq!(decoder.decode(&dst).unwrap(), vec![field("x-a", "1")]);
        assert_eq!(decoder.table.dynamic_len(), 0);
    }

    #[test]
    fn size_update_after_field_is_rejected() {
        let mut decoder = Decoder::default();
        assert_eq!(decoder.decode(&[0x82, 0x20]), Err(HpackError::SizeUpdate));
    }

    #[test]
    fn size_update_above_limit_is_rejected() {
        let mut decoder = Decoder::new(100);
        let mut dst = BytesMut::new();
        encode_int(&mut dst, 4096, 5, 0x20);
        assert_eq!(decoder.decode(&dst), Err(HpackError::SizeUpdate));
    }

    #[test]
    fn invalid_index_is_rejected() {
        let mut decoder = Decoder::default();
        assert_eq!(decoder.decode(&[0x80]), Err(HpackError::InvalidIndex(0)));
        assert_eq!(decoder.decode(&[0xbe]), Err(HpackError::InvalidIndex(62)));
    }
}
