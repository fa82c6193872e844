use http::header::HeaderMap;
use http::{StatusCode, Version};

const AVERAGE_HEADER_SIZE: usize = 30;

/// Writes the status line and header section, terminated by the empty line.
pub(crate) fn encode_head(
    dst: &mut Vec<u8>,
    version: Version,
    status: StatusCode,
    headers: &HeaderMap,
) {
    dst.reserve(30 + headers.len() * AVERAGE_HEADER_SIZE);
    if version == Version::HTTP_11 && status == StatusCode::OK {
        extend(dst, b"HTTP/1.1 200 OK\r\n");
    } else {
        match version {
            Version::HTTP_10 => extend(dst, b"HTTP/1.0 "),
            _ => extend(dst, b"HTTP/1.1 "),
        }
        let mut code = itoa::Buffer::new();
        extend(dst, code.format(status.as_u16()).as_bytes());
        extend(dst, b" ");
        extend(
            dst,
            status.canonical_reason().unwrap_or("<none>").as_bytes(),
        );
        extend(dst, b"\r\n");
    }

    for (name, value) in headers.iter() {
        extend(dst, name.as_str().as_bytes());
        extend(dst, b": ");
        extend(dst, value.as_bytes());
        extend(dst, b"\r\n");
    }

    extend(dst, b"\r\n");
}

/// Writes one chunk of a chunk-encoded body.
pub(crate) fn encode_chunk(dst: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(!data.is_empty(), "zero-length chunk would terminate the body");
    write_hex(dst, data.len());
    extend(dst, b"\r\n");
    extend(dst, data);
    extend(dst, b"\r\n");
}

/// Terminates a chunk-encoded body (no trailers).
pub(crate) fn encode_chunked_end(dst: &mut Vec<u8>) {
    extend(dst, b"0\r\n\r\n");
}

fn write_hex(dst: &mut Vec<u8>, mut n: usize) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    if n == 0 {
        dst.push(b'0');
        return;
    }
    let mut scratch = [0u8; 16];
    let mut at = scratch.len();
    while n > 0 {
        at -= 1;
        scratch[at] = DIGITS[n & 0xf];
        n >>= 4;
    }
    extend(dst, &scratch[at..]);
}

#[inline]
fn extend(dst: &mut Vec<u8>, data: &[u8]) {
    dst.extend_from_slice(data);
}
