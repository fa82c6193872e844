use std::io::{self, Read, Write};

use bytes::BytesMut;
use tracing::trace;

/// A byte stream usable from the blocking handler.
pub trait Conn: Read + Write + Send {}

impl<T: Read + Write + Send> Conn for T {}

pub(crate) type BoxConn = Box<dyn Conn>;

const INIT_BUFFER_SIZE: usize = 8192;
const DEFAULT_MAX_BUFFER_SIZE: usize = 8192 + 4096 * 100;

/// The synchronous twin of the async buffered stream: a peekable read
/// buffer plus a flattened write buffer over one blocking socket.
pub(crate) struct BufferedIo {
    io: BoxConn,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    max_buf_size: usize,
}

impl BufferedIo {
    pub(crate) fn new(io: BoxConn) -> BufferedIo {
        BufferedIo {
            io,
            read_buf: BytesMut::with_capacity(0),
            write_buf: Vec::with_capacity(INIT_BUFFER_SIZE),
            max_buf_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        self.read_buf.as_ref()
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// One blocking read into the buffer; zero means the peer closed.
    pub(crate) fn read_some(&mut self) -> io::Result<usize> {
        if self.read_buf.len() >= self.max_buf_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "read buffer full",
            ));
        }
        let mut chunk = [0u8; INIT_BUFFER_SIZE];
        loop {
            match self.io.read(&mut chunk) {
                Ok(n) => {
                    trace!("read {} bytes", n);
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) fn write_buf(&mut self) -> &mut Vec<u8> {
        &mut self.write_buf
    }

    pub(crate) fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        if self.write_buf.len() + data.len() > self.max_buf_size {
            self.flush()?;
            if data.len() > self.max_buf_size {
                return self.io.write_all(data);
            }
        }
        self.write_buf.extend_from_slice(data);
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            self.io.write_all(&self.write_buf)?;
            trace!("flushed {} bytes", self.write_buf.len());
            self.write_buf.clear();
        }
        self.io.flush()
    }
}
