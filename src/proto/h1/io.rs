use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::common::Io;

/// The initial buffer size allocated before trying to read from IO.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// The default maximum read buffer size. Peeks past this limit fail rather
/// than growing the buffer without bound.
pub(crate) const DEFAULT_MAX_BUFFER_SIZE: usize = 8192 + 4096 * 100;

/// A buffered, peekable wrapper over a byte stream.
///
/// Reads land in an internal buffer that callers may inspect without
/// consuming (`fill`/`read_buf`), then commit with `consume`. The header
/// parser scans the buffer in place and leaves trailing body bytes for the
/// body decoder. Writes collect into a flattened buffer until `flush`.
pub(crate) struct Buffered<T> {
    io: T,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    max_buf_size: usize,
}

impl<T: Io> Buffered<T> {
    pub(crate) fn new(io: T) -> Buffered<T> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(0),
            write_buf: Vec::with_capacity(INIT_BUFFER_SIZE),
            max_buf_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    pub(crate) fn set_max_buf_size(&mut self, max: usize) {
        assert!(
            max >= INIT_BUFFER_SIZE,
            "max_buf_size cannot be smaller than {}",
            INIT_BUFFER_SIZE,
        );
        self.max_buf_size = max;
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        self.read_buf.as_ref()
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// One read from the underlying stream into the buffer.
    ///
    /// Returns the number of bytes read; zero means the peer closed.
    pub(crate) async fn read_some(&mut self) -> io::Result<usize> {
        if self.read_buf.len() >= self.max_buf_size {
            debug!("max_buf_size ({}) reached", self.max_buf_size);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "read buffer full",
            ));
        }
        self.read_buf.reserve(INIT_BUFFER_SIZE);
        let n = self.io.read_buf(&mut self.read_buf).await?;
        trace!("read {} bytes", n);
        Ok(n)
    }

    /// Fills the buffer until at least `n` bytes are peekable.
    ///
    /// Returns the available length, which is smaller than `n` only on EOF.
    /// Requests beyond the configured maximum are refused.
    pub(crate) async fn fill(&mut self, n: usize) -> io::Result<usize> {
        if n > self.max_buf_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "peek beyond maximum buffer size",
            ));
        }
        while self.read_buf.len() < n {
            if self.read_some().await? == 0 {
                break;
            }
        }
        Ok(self.read_buf.len())
    }

    /// Commits `n` previously peeked bytes.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.read_buf.len());
        let _ = self.read_buf.split_to(n);
    }

    pub(crate) fn write_buf(&mut self) -> &mut Vec<u8> {
        &mut self.write_buf
    }

    /// Queues body data, spilling directly to the stream when the write
    /// buffer grows past its limit.
    pub(crate) async fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        if self.write_buf.len() + data.len() > self.max_buf_size {
            self.flush().await?;
            if data.len() > self.max_buf_size {
                self.io.write_all(data).await?;
                return Ok(());
            }
        }
        self.write_buf.extend_from_slice(data);
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            self.io.write_all(&self.write_buf).await?;
            trace!("flushed {} bytes", self.write_buf.len());
            self.write_buf.clear();
        }
        self.io.flush().await
    }

    /// Releases the stream along with any bytes already read past the
    /// last committed offset.
    pub(crate) fn into_parts(self) -> (T, Bytes) {
        (self.io, self.read_buf.freeze())
    }
}
