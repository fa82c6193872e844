use bytes::{BufMut, BytesMut};

use super::huffman;
use super::table::{DynamicTable, STATIC_TABLE};

/// HPACK block encoder.
///
/// One per connection, living behind the priority output lock so header
/// blocks hit the wire in the same order the dynamic table evolves.
#[derive(Debug)]
pub(crate) struct Encoder {
    table: DynamicTable,
    /// A pending table-size update to emit at the head of the next block.
    pending_resize: Option<usize>,
}

impl Encoder {
    pub(crate) fn new(max_size: usize) -> Encoder {
        Encoder {
            table: DynamicTable::new(max_size),
            pending_resize: None,
        }
    }

    /// Adopts the peer's `SETTINGS_HEADER_TABLE_SIZE`.
    ///
    /// Shrinking must be announced in-band, so the update is buffered
    /// until the next encoded block.
    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        let capped = std::cmp::min(max_size, 4096);
        if capped != self.table.max_size() {
            self.table.set_max_size(capped);
            self.pending_resize = Some(capped);
        }
    }

    /// Encodes one header block.
    pub(crate) fn encode<'a, I>(&mut self, headers: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        if let Some(size) = self.pending_resize.take() {
            encode_integer(size as u64, 5, 0x20, dst);
        }
        for (name, value) in headers {
            self.encode_field(name, value, dst);
        }
    }

    fn encode_field(&mut self, name: &str, value: &str, dst: &mut BytesMut) {
        let (static_exact, static_name) = find_static(name, value);
        if let Some(index) = static_exact {
            encode_integer(index as u64, 7, 0x80, dst);
            return;
        }
        let (dynamic_exact, dynamic_name) = self.table.find(name, value);
        if let Some(at) = dynamic_exact {
            encode_integer((STATIC_TABLE.len() + at + 1) as u64, 7, 0x80, dst);
            return;
        }

        // Literal with incremental indexing, reusing an indexed name
        // when one exists.
        let name_index = static_name
            .map(|i| i as u64)
            .or_else(|| dynamic_name.map(|at| (STATIC_TABLE.len() + at + 1) as u64));
        match name_index {
            Some(index) => encode_integer(index, 6, 0x40, dst),
            None => {
                dst.put_u8(0x40);
                encode_string(name, dst);
            }
        }
        encode_string(value, dst);
        self.table.insert(name.to_owned(), value.to_owned());
    }
}

/// Finds `(exact, name-only)` 1-based static indices.
fn find_static(name: &str, value: &str) -> (Option<usize>, Option<usize>) {
    let mut name_match = None;
    for (at, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if *n == name {
            if *v == value {
                return (Some(at + 1), Some(at + 1));
            }
            if name_match.is_none() {
                name_match = Some(at + 1);
            }
        }
    }
    (None, name_match)
}

/// Integer representation with an N-bit prefix (RFC 7541 §5.1).
fn encode_integer(value: u64, prefix: u8, pattern: u8, dst: &mut BytesMut) {
    let mask = (1u16 << prefix) as u64 - 1;
    if value < mask {
        dst.put_u8(pattern | value as u8);
        return;
    }
    dst.put_u8(pattern | mask as u8);
    let mut rest = value - mask;
    while rest >= 0x80 {
        dst.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

/// String literal; Huffman coded when that is shorter.
fn encode_string(src: &str, dst: &mut BytesMut) {
    let raw = src.as_bytes();
    let huffman_len = huffman::encoded_len(raw);
    if huffman_len < raw.len() {
        encode_integer(huffman_len as u64, 7, 0x80, dst);
        huffman::encode(raw, dst);
    } else {
        encode_integer(raw.len() as u64, 7, 0x00, dst);
        dst.extend_from_slice(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::super::decoder::Decoder;
    use super::*;
    use bytes::Bytes;

    fn roundtrip(headers: &[(&str, &str)]) {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096);
        let mut block = BytesMut::new();
        encoder.encode(headers.iter().copied(), &mut block);
        let decoded = decoder.decode(Bytes::from(block.to_vec())).unwrap();
        let expected: Vec<(String, String)> = headers
            .iter()
            .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
            .collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn static_exact_is_one_byte() {
        let mut encoder = Encoder::new(4096);
        let mut block = BytesMut::new();
        encoder.encode([(":status", "200")], &mut block);
        assert_eq!(&block[..], &[0x88]);
    }

    #[test]
    fn roundtrip_request_headers() {
        roundtrip(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/resource/42"),
            (":authority", "example.org"),
            ("accept", "text/html"),
            ("user-agent", "trellis-test"),
        ]);
    }

    #[test]
    fn roundtrip_preserves_duplicate_name_order() {
        roundtrip(&[
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
            ("set-cookie", "c=3"),
        ]);
    }

    #[test]
    fn repeated_fields_hit_the_dynamic_table() {
        let mut encoder = Encoder::new(4096);
        let mut first = BytesMut::new();
        encoder.encode([("x-trace-id", "abc123")], &mut first);
        let mut second = BytesMut::new();
        encoder.encode([("x-trace-id", "abc123")], &mut second);
        // Second occurrence is a single indexed byte.
        assert_eq!(second.len(), 1);
        assert!(second[0] & 0x80 != 0);

        let mut decoder = Decoder::new(4096);
        decoder.decode(Bytes::from(first.to_vec())).unwrap();
        let decoded = decoder.decode(Bytes::from(second.to_vec())).unwrap();
        assert_eq!(decoded[0].1, "abc123");
    }

    #[test]
    fn shrink_announces_table_size_update() {
        let mut encoder = Encoder::new(4096);
        encoder.set_max_size(64);
        let mut block = BytesMut::new();
        encoder.encode([(":method", "GET")], &mut block);
        // 0x20 | 31, then varint for 64 - 31 = 33, then the indexed field.
        assert_eq!(&block[..], &[0x3f, 0x21, 0x82]);

        let mut decoder = Decoder::new(4096);
        let decoded = decoder.decode(Bytes::from(block.to_vec())).unwrap();
        assert_eq!(decoded[0].0, ":method");
    }

    #[test]
    fn integer_encoding_boundaries() {
        let mut dst = BytesMut::new();
        encode_integer(10, 5, 0x20, &mut dst);
        assert_eq!(&dst[..], &[0x2a]);

        let mut dst = BytesMut::new();
        encode_integer(1337, 5, 0x20, &mut dst);
        assert_eq!(&dst[..], &[0x3f, 0x9a, 0x0a]);

        let mut dst = BytesMut::new();
        encode_integer(31, 5, 0x00, &mut dst);
        assert_eq!(&dst[..], &[0x1f, 0x00]);
    }
}
