use std::collections::VecDeque;
use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};

/// Default capacity of a single chunk page.
pub(crate) const CHUNK_SIZE: usize = 4096;

/// An append-only sequence of fixed-size chunk pages.
///
/// Used to assemble outbound bodies whose total length is not known up
/// front while the handler is still producing data. The total written so
/// far is always known, but the buffer is serialized with
/// `Transfer-Encoding: chunked` since the writer may keep appending until
/// the response is handed off.
pub struct ChunkedBuffer {
    chunks: VecDeque<BytesMut>,
    chunk_size: usize,
    len: u64,
}

impl ChunkedBuffer {
    pub fn new() -> ChunkedBuffer {
        ChunkedBuffer::with_chunk_size(CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> ChunkedBuffer {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        ChunkedBuffer {
            chunks: VecDeque::new(),
            chunk_size,
            len: 0,
        }
    }

    /// Total number of bytes appended so far.
    pub fn known_size(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `data`, filling the current page before opening a new one.
    pub fn write(&mut self, mut data: &[u8]) {
        self.len += data.len() as u64;
        while !data.is_empty() {
            let room = match self.chunks.back() {
                Some(last) => self.chunk_size - last.len(),
                None => 0,
            };
            if room == 0 {
                self.chunks
                    .push_back(BytesMut::with_capacity(self.chunk_size));
                continue;
            }
            let take = std::cmp::min(room, data.len());
            self.chunks
                .back_mut()
                .expect("page exists")
                .extend_from_slice(&data[..take]);
            data = &data[take..];
        }
    }

    pub fn write_str(&mut self, data: &str) {
        self.write(data.as_bytes());
    }

    pub(crate) fn pop_chunk(&mut self) -> Option<Bytes> {
        self.chunks.pop_front().map(BytesMut::freeze)
    }

    /// Iterate the chunk pages without consuming them.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(|c| c.as_ref())
    }
}

impl Default for ChunkedBuffer {
    fn default() -> ChunkedBuffer {
        ChunkedBuffer::new()
    }
}

impl io::Write for ChunkedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ChunkedBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for ChunkedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedBuffer")
            .field("chunks", &self.chunks.len())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_pages_in_order() {
        let mut buf = ChunkedBuffer::with_chunk_size(4);
        buf.write(b"hello wo");
        buf.write(b"rld");
        assert_eq!(buf.known_size(), 11);

        let pages: Vec<&[u8]> = buf.chunks().collect();
        assert_eq!(pages, vec![&b"hell"[..], &b"o wo"[..], &b"rld"[..]]);
    }

    #[test]
    fn pop_preserves_order() {
        let mut buf = ChunkedBuffer::with_chunk_size(2);
        buf.write(b"abcde");
        let mut out = Vec::new();
        while let Some(chunk) = buf.pop_chunk() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"abcde");
    }

    #[test]
    fn io_write_appends() {
        use std::io::Write;
        let mut buf = ChunkedBuffer::new();
        write!(buf, "{} {}", "status", 200).unwrap();
        assert_eq!(buf.known_size(), 10);
    }
}
