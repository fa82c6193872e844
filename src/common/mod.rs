pub(crate) mod exec;
pub(crate) mod rewind;

use tokio::io::{AsyncRead, AsyncWrite};

/// The byte-stream contract handed to connection handlers.
///
/// A connection provider yields these; TLS wrappers, in-memory pipes and
/// `TcpStream` all qualify.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A type-erased connection, as produced by the accept loop.
pub type BoxIo = Box<dyn Io>;
