//! Framed I/O over the connection's split halves.

use std::io;

use bytes::{Bytes, BytesMut};
use http::header::HeaderMap;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::error::Error;
use crate::proto::h2::frame::{self, Continuation, Head, Headers};
use crate::proto::h2::hpack;
use crate::proto::h2::Reason;

/// Reads frame heads and payloads from the session's read half.
pub(crate) struct FramedRead<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FramedRead<R> {
    pub(crate) fn new(io: R) -> FramedRead<R> {
        FramedRead {
            io,
            buf: BytesMut::with_capacity(frame::HEADER_LEN),
        }
    }

    /// Fills the buffer to `n` bytes; `false` means EOF hit first.
    async fn fill(&mut self, n: usize) -> crate::Result<bool> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            let read = self
                .io
                .read_buf(&mut self.buf)
                .await
                .map_err(Error::new_io)?;
            if read == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Expects and consumes the 24-byte connection preface.
    pub(crate) async fn read_preface(&mut self) -> crate::Result<()> {
        if !self.fill(frame::PREFACE.len()).await? {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "connection closed before preface",
            ));
        }
        if &self.buf[..frame::PREFACE.len()] != frame::PREFACE {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "invalid connection preface",
            ));
        }
        let _ = self.buf.split_to(frame::PREFACE.len());
        Ok(())
    }

    /// Reads one frame; `Ok(None)` is a clean EOF at a frame boundary.
    pub(crate) async fn read_frame(
        &mut self,
        max_frame_size: u32,
    ) -> crate::Result<Option<(Head, Bytes)>> {
        if !self.fill(frame::HEADER_LEN).await? {
            if self.buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::new_io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid frame header",
            )));
        }
        let head = Head::parse(&self.buf[..frame::HEADER_LEN]);
        if head.length > max_frame_size {
            return Err(Error::new_h2_connection(
                Reason::FRAME_SIZE_ERROR,
                "frame exceeds SETTINGS_MAX_FRAME_SIZE",
            ));
        }
        let total = frame::HEADER_LEN + head.length as usize;
        if !self.fill(total).await? {
            return Err(Error::new_io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid frame payload",
            )));
        }
        let _ = self.buf.split_to(frame::HEADER_LEN);
        let payload = self.buf.split_to(head.length as usize).freeze();
        trace!(
            "received {:?} frame, stream={}, len={}",
            head.kind,
            head.stream_id,
            head.length
        );
        Ok(Some((head, payload)))
    }
}

/// The write side: owns the HPACK encoder so header blocks hit the wire
/// in table order. Lives behind the priority output lock.
pub(crate) struct FrameWriter<W> {
    io: W,
    pub(crate) hpack: hpack::Encoder,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) fn new(io: W, hpack_table_size: u32) -> FrameWriter<W> {
        FrameWriter {
            io,
            hpack: hpack::Encoder::new(hpack_table_size as usize),
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Encodes one frame via `encode` and flushes it.
    pub(crate) async fn send<F>(&mut self, encode: F) -> crate::Result<()>
    where
        F: FnOnce(&mut BytesMut),
    {
        self.buf.clear();
        encode(&mut self.buf);
        self.io.write_all(&self.buf).await.map_err(Error::new_io)?;
        self.io.flush().await.map_err(Error::new_io)
    }

    /// Sends a response header block as HEADERS plus any CONTINUATION
    /// frames the peer's max frame size forces.
    pub(crate) async fn send_response_headers(
        &mut self,
        stream_id: u32,
        status: StatusCode,
        headers: &HeaderMap,
        content_length: Option<u64>,
        end_stream: bool,
        max_frame_size: u32,
    ) -> crate::Result<()> {
        let mut fields: Vec<(String, String)> = Vec::with_capacity(headers.len() + 2);
        fields.push((":status".to_owned(), status.as_str().to_owned()));
        if let Some(len) = content_length {
            fields.push(("content-length".to_owned(), len.to_string()));
        }
        for (name, value) in headers.iter() {
            match name.as_str() {
                // Connection-specific headers never cross into h2.
                "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
                | "upgrade" | "content-length" => continue,
                _ => (),
            }
            match value.to_str() {
                Ok(value) => fields.push((name.as_str().to_owned(), value.to_owned())),
                Err(_) => {
                    warn!("skipping non-UTF-8 header value for {}", name);
                }
            }
        }

        let mut block = BytesMut::new();
        self.hpack
            .encode(fields.iter().map(|(n, v)| (n.as_str(), v.as_str())), &mut block);

        self.buf.clear();
        let max = max_frame_size as usize;
        let first_len = std::cmp::min(block.len(), max);
        let first = block.split_to(first_len);
        Headers::encode_block(stream_id, &first, end_stream, block.is_empty(), &mut self.buf);
        while !block.is_empty() {
            let len = std::cmp::min(block.len(), max);
            let fragment = block.split_to(len);
            Continuation::encode_block(stream_id, &fragment, block.is_empty(), &mut self.buf);
        }
        self.io.write_all(&self.buf).await.map_err(Error::new_io)?;
        self.io.flush().await.map_err(Error::new_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::{Kind, Settings};

    #[tokio::test]
    async fn frame_roundtrip_through_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, write_half) = tokio::io::split(client);

        let mut writer = FrameWriter::new(write_half, 4096);
        let settings = Settings::default();
        writer.send(|buf| settings.encode(buf)).await.unwrap();

        let mut reader = FramedRead::new(read_half);
        let (head, payload) = reader
            .read_frame(frame::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.kind, Kind::Settings);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, mut write_half) = tokio::io::split(client);

        // A 9-byte header claiming a payload past the negotiated limit.
        let mut head = BytesMut::new();
        Head::new(Kind::Data, 0, 1).encode(17_000, &mut head);
        write_half.write_all(&head).await.unwrap();

        let mut reader = FramedRead::new(read_half);
        let err = reader
            .read_frame(frame::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::FRAME_SIZE_ERROR));
    }

    #[tokio::test]
    async fn preface_mismatch_is_protocol_error() {
        let (client, server) = tokio::io::duplex(64);
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut reader = FramedRead::new(read_half);
        let err = reader.read_preface().await.unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[tokio::test]
    async fn header_block_splits_into_continuations() {
        let (client, server) = tokio::io::duplex(65536);
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, write_half) = tokio::io::split(client);

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-large",
            http::header::HeaderValue::from_str(&"v".repeat(40_000)).unwrap(),
        );

        let mut writer = FrameWriter::new(write_half, 4096);
        writer
            .send_response_headers(
                1,
                StatusCode::OK,
                &headers,
                None,
                true,
                frame::DEFAULT_MAX_FRAME_SIZE,
            )
            .await
            .unwrap();

        let mut reader = FramedRead::new(read_half);
        let (head, _) = reader
            .read_frame(frame::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.kind, Kind::Headers);
        assert!(!head.is_flag(frame::END_HEADERS));
        let (head, _) = reader
            .read_frame(frame::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.kind, Kind::Continuation);
    }
}
