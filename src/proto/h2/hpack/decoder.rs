use bytes::{Buf, Bytes};

use crate::error::Error;
use crate::proto::h2::Reason;

use super::huffman;
use super::table::{DynamicTable, STATIC_TABLE};

/// HPACK block decoder (RFC 7541 §3).
///
/// One per connection; owns the dynamic table negotiated via
/// `SETTINGS_HEADER_TABLE_SIZE`.
#[derive(Debug)]
pub(crate) struct Decoder {
    table: DynamicTable,
    /// Upper bound for table-size updates, from our SETTINGS.
    max_size_limit: usize,
}

fn compression_error(message: &'static str) -> Error {
    Error::new_h2_connection(Reason::COMPRESSION_ERROR, message)
}

impl Decoder {
    pub(crate) fn new(max_size: usize) -> Decoder {
        Decoder {
            table: DynamicTable::new(max_size),
            max_size_limit: max_size,
        }
    }

    /// Decodes one complete header block into `(name, value)` pairs in
    /// on-wire order.
    pub(crate) fn decode(&mut self, mut buf: Bytes) -> crate::Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        let mut seen_header = false;
        while buf.has_remaining() {
            let first = buf.get_u8();
            if first & 0x80 != 0 {
                // Indexed header field.
                let index = decode_integer(first, 7, &mut buf)?;
                let (name, value) = self.indexed(index)?;
                headers.push((name, value));
                seen_header = true;
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing.
                let (name, value) = self.literal(first, 6, &mut buf)?;
                self.table.insert(name.clone(), value.clone());
                headers.push((name, value));
                seen_header = true;
            } else if first & 0x20 != 0 {
                // Dynamic table size update; must precede the block's
                // header fields.
                if seen_header {
                    return Err(compression_error(
                        "table size update after header fields",
                    ));
                }
                let size = decode_integer(first, 5, &mut buf)? as usize;
                if size > self.max_size_limit {
                    return Err(compression_error(
                        "table size update exceeds SETTINGS limit",
                    ));
                }
                self.table.set_max_size(size);
            } else {
                // Literal without indexing (0b0000) or never indexed
                // (0b0001); both use a 4-bit prefix and neither touches
                // the table.
                let (name, value) = self.literal(first, 4, &mut buf)?;
                headers.push((name, value));
                seen_header = true;
            }
        }
        Ok(headers)
    }

    /// Applies a new `SETTINGS_HEADER_TABLE_SIZE` from our own settings.
    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        self.max_size_limit = max_size;
        if self.table.max_size() > max_size {
            self.table.set_max_size(max_size);
        }
    }

    fn indexed(&self, index: u64) -> crate::Result<(String, String)> {
        if index == 0 {
            return Err(compression_error("indexed field with index 0"));
        }
        let index = index as usize;
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_owned(), value.to_owned()));
        }
        match self.table.get(index - STATIC_TABLE.len() - 1) {
            Some((name, value)) => Ok((name.to_owned(), value.to_owned())),
            None => Err(compression_error("header index out of range")),
        }
    }

    fn literal(
        &self,
        first: u8,
        prefix: u8,
        buf: &mut Bytes,
    ) -> crate::Result<(String, String)> {
        let index = decode_integer(first, prefix, buf)?;
        let name = if index == 0 {
            decode_string(buf)?
        } else {
            self.indexed(index)?.0
        };
        let value = decode_string(buf)?;
        Ok((name, value))
    }

    #[cfg(test)]
    pub(crate) fn table_len(&self) -> usize {
        self.table.len()
    }
}

/// Integer representation with an N-bit prefix (RFC 7541 §5.1).
fn decode_integer(first: u8, prefix: u8, buf: &mut Bytes) -> crate::Result<u64> {
    let mask = (1u16 << prefix) as u64 - 1;
    let mut value = first as u64 & mask;
    if value < mask {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(compression_error("truncated integer"));
        }
        let byte = buf.get_u8();
        value = value
            .checked_add(((byte & 0x7f) as u64) << shift)
            .ok_or_else(|| compression_error("integer overflow"))?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 56 {
            return Err(compression_error("integer too long"));
        }
    }
}

/// String literal, optionally Huffman coded (RFC 7541 §5.2).
fn decode_string(buf: &mut Bytes) -> crate::Result<String> {
    if !buf.has_remaining() {
        return Err(compression_error("truncated string length"));
    }
    let first = buf.get_u8();
    let huffman_coded = first & 0x80 != 0;
    let len = decode_integer(first, 7, buf)? as usize;
    if buf.remaining() < len {
        return Err(compression_error("truncated string"));
    }
    let raw = buf.split_to(len);
    let octets = if huffman_coded {
        huffman::decode(&raw)?
    } else {
        raw.to_vec()
    };
    String::from_utf8(octets).map_err(|_| compression_error("string not UTF-8"))
}
