//! Request and response bodies.

mod chunked;

pub use self::chunked::ChunkedBuffer;

use std::fmt;

use bytes::{Bytes, BytesMut};
use futures_channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use tracing::trace;

use crate::error::{Error, Parse};
use crate::proto::h1::decode::Decoded;

/// A request or response body.
///
/// Outbound bodies are one of: empty, a complete in-memory buffer, an
/// assembled [`ChunkedBuffer`], or a lazy channel fed by a producer task.
/// Inbound HTTP/1.1 bodies read lazily from the connection, framed by the
/// message's `Content-Length` or chunked encoding; inbound HTTP/2 bodies
/// are complete buffers assembled by the session.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Option<Bytes>),
    Chunks(ChunkedBuffer),
    Channel(mpsc::Receiver<crate::Result<Bytes>>),
    H1(crate::proto::h1::conn::SharedPipe),
    H1Blocking(crate::blocking::conn::SharedPipe),
}

/// Feeds chunks into a [`Body::channel`] body.
pub struct Sender {
    tx: mpsc::Sender<crate::Result<Bytes>>,
}

/// Trailer fields of a request whose body carried them.
///
/// Attached to the request's extensions when an HTTP/2 stream ends with
/// a trailer HEADERS block.
#[derive(Clone, Debug)]
pub struct Trailers(pub http::HeaderMap);

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body { kind: Kind::Empty }
    }

    /// A lazy body; the returned [`Sender`] produces the data.
    pub fn channel() -> (Sender, Body) {
        let (tx, rx) = mpsc::channel(8);
        (
            Sender { tx },
            Body {
                kind: Kind::Channel(rx),
            },
        )
    }

    pub(crate) fn full(bytes: Bytes) -> Body {
        if bytes.is_empty() {
            Body::empty()
        } else {
            Body {
                kind: Kind::Full(Some(bytes)),
            }
        }
    }

    pub(crate) fn h1(pipe: crate::proto::h1::conn::SharedPipe) -> Body {
        Body {
            kind: Kind::H1(pipe),
        }
    }

    pub(crate) fn h1_blocking(pipe: crate::blocking::conn::SharedPipe) -> Body {
        Body {
            kind: Kind::H1Blocking(pipe),
        }
    }

    /// The total size, when known up front.
    ///
    /// `None` means the serializer must fall back to chunked encoding.
    pub fn known_size(&self) -> Option<u64> {
        match self.kind {
            Kind::Empty => Some(0),
            Kind::Full(ref bytes) => {
                Some(bytes.as_ref().map_or(0, |b| b.len() as u64))
            }
            Kind::Chunks(ref buf) => Some(buf.known_size()),
            Kind::Channel(_) | Kind::H1(_) | Kind::H1Blocking(_) => None,
        }
    }

    /// Whether the serializer should frame this body with chunked encoding.
    pub(crate) fn is_streaming(&self) -> bool {
        matches!(
            self.kind,
            Kind::Chunks(_) | Kind::Channel(_) | Kind::H1(_) | Kind::H1Blocking(_)
        )
    }

    /// The next chunk of data, or `None` at the end of the body.
    pub async fn data(&mut self) -> Option<crate::Result<Bytes>> {
        match self.kind {
            Kind::Empty => None,
            Kind::Full(ref mut bytes) => bytes.take().map(Ok),
            Kind::Chunks(ref mut buf) => buf.pop_chunk().map(Ok),
            Kind::Channel(ref mut rx) => rx.next().await,
            Kind::H1(ref pipe) => read_h1_data(pipe).await,
            Kind::H1Blocking(_) => Some(Err(Error::endpoint_msg(
                "blocking body polled from async context",
            ))),
        }
    }

    /// Reads the body to completion into one buffer.
    pub async fn bytes(&mut self) -> crate::Result<Bytes> {
        let mut acc = BytesMut::new();
        while let Some(chunk) = self.data().await {
            acc.extend_from_slice(&chunk?);
        }
        Ok(acc.freeze())
    }

    /// Synchronous analogue of [`Body::data`] for the blocking handler.
    pub fn data_blocking(&mut self) -> Option<crate::Result<Bytes>> {
        match self.kind {
            Kind::Empty => None,
            Kind::Full(ref mut bytes) => bytes.take().map(Ok),
            Kind::Chunks(ref mut buf) => buf.pop_chunk().map(Ok),
            Kind::Channel(ref mut rx) => {
                futures_executor::block_on(rx.next())
            }
            Kind::H1Blocking(ref pipe) => crate::blocking::conn::read_data(pipe),
            Kind::H1(_) => Some(Err(Error::endpoint_msg(
                "async body polled from blocking context",
            ))),
        }
    }

    /// Synchronous analogue of [`Body::bytes`].
    pub fn bytes_blocking(&mut self) -> crate::Result<Bytes> {
        let mut acc = BytesMut::new();
        while let Some(chunk) = self.data_blocking() {
            acc.extend_from_slice(&chunk?);
        }
        Ok(acc.freeze())
    }
}

async fn read_h1_data(
    pipe: &crate::proto::h1::conn::SharedPipe,
) -> Option<crate::Result<Bytes>> {
    let mut guard = pipe.lock().await;
    loop {
        let inner = &mut *guard;
        let step = match inner.reading.as_mut() {
            Some(decoder) => decoder.decode(inner.io.read_buf_mut()),
            None => return None,
        };
        match step {
            Ok(Decoded::Data(chunk)) => return Some(Ok(chunk)),
            Ok(Decoded::Complete(trailers)) => {
                if let Some(trailers) = trailers {
                    trace!("discarding {} request trailers", trailers.len());
                }
                guard.reading = None;
                return None;
            }
            Ok(Decoded::NeedMore) => match guard.io.read_some().await {
                Ok(0) => {
                    guard.reading = None;
                    return Some(Err(Error::new_parse(Parse::Incomplete)));
                }
                Ok(_) => continue,
                Err(err) => {
                    guard.reading = None;
                    return Some(Err(Error::new_io(err)));
                }
            },
            Err(err) => {
                guard.reading = None;
                return Some(Err(err));
            }
        }
    }
}

impl Sender {
    /// Sends a chunk; completes when the receiver has capacity.
    pub async fn send_data(&mut self, chunk: impl Into<Bytes>) -> crate::Result<()> {
        self.tx
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| Error::endpoint_msg("body receiver dropped"))
    }

    /// Aborts the body with an error observed by the reader.
    pub fn abort(mut self) {
        let _ = self
            .tx
            .try_send(Err(Error::endpoint_msg("body writer aborted")));
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body::full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::full(Bytes::from(vec))
    }
}

impl From<&'static [u8]> for Body {
    fn from(slice: &'static [u8]) -> Body {
        Body::full(Bytes::from_static(slice))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::full(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<ChunkedBuffer> for Body {
    fn from(buf: ChunkedBuffer) -> Body {
        Body {
            kind: Kind::Chunks(buf),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Kind::Empty => "Empty",
            Kind::Full(_) => "Full",
            Kind::Chunks(_) => "Chunks",
            Kind::Channel(_) => "Channel",
            Kind::H1(_) => "H1",
            Kind::H1Blocking(_) => "H1Blocking",
        };
        f.debug_struct("Body").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_body_yields_once() {
        let mut body = Body::from("hi");
        assert_eq!(body.known_size(), Some(2));
        assert_eq!(body.data().await.unwrap().unwrap(), "hi");
        assert!(body.data().await.is_none());
    }

    #[tokio::test]
    async fn empty_from_empty_bytes() {
        let body = Body::from(Vec::new());
        assert_eq!(body.known_size(), Some(0));
        assert!(!body.is_streaming());
    }

    #[tokio::test]
    async fn chunked_buffer_body_streams_pages() {
        let mut buf = ChunkedBuffer::with_chunk_size(2);
        buf.write(b"abcd");
        let mut body = Body::from(buf);
        assert_eq!(body.known_size(), Some(4));
        assert!(body.is_streaming());
        assert_eq!(body.bytes().await.unwrap(), "abcd");
    }

    #[tokio::test]
    async fn channel_body_streams_sent_chunks() {
        let (mut tx, mut body) = Body::channel();
        assert_eq!(body.known_size(), None);

        tokio::spawn(async move {
            tx.send_data("hel").await.unwrap();
            tx.send_data("lo").await.unwrap();
        });

        assert_eq!(body.bytes().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn aborted_channel_surfaces_error() {
        let (tx, mut body) = Body::channel();
        tx.abort();
        let err = body.data().await.unwrap().unwrap_err();
        assert_eq!(err.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
