use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, trace};

use crate::error::{Error, Parse};

use self::ChunkedState::*;

/// Maximum bytes of chunked extensions tolerated across the whole body.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// Maximum bytes of trailer fields.
const TRAILER_LIMIT: usize = 1024 * 16;

/// Decoders to handle the different request body framings.
///
/// Incremental: `decode` consumes what it can from the front of the
/// caller's read buffer and reports when it needs another fill. Both the
/// async and the blocking connection loops drive the same state machine.
#[derive(Debug)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// Body bounded by `Content-Length`.
    Length(u64),
    /// Body framed by `Transfer-Encoding: chunked`.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_cnt: u64,
        trailers_buf: Option<BytesMut>,
    },
}

/// The result of one decode step.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A run of body bytes.
    Data(Bytes),
    /// The body is complete; chunked bodies may carry trailers.
    Complete(Option<HeaderMap>),
    /// The buffer is exhausted mid-message.
    NeedMore,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    pub(crate) fn length(len: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Start,
                chunk_len: 0,
                extensions_cnt: 0,
                trailers_buf: None,
            },
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        match self.kind {
            Kind::Length(remaining) => remaining == 0,
            Kind::Chunked { state, .. } => state == ChunkedState::End,
        }
    }

    /// Advances the decoder over the front of `buf`.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> crate::Result<Decoded> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Decoded::Complete(None));
                }
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Decoded::Data(buf.split_to(take).freeze()))
            }
            Kind::Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_cnt,
                ref mut trailers_buf,
            } => loop {
                if *state == ChunkedState::End {
                    let trailers = match trailers_buf.take() {
                        Some(mut raw) => decode_trailers(&mut raw)?,
                        None => None,
                    };
                    return Ok(Decoded::Complete(trailers));
                }
                let mut data = None;
                *state = match state.step(
                    buf,
                    chunk_len,
                    extensions_cnt,
                    &mut data,
                    trailers_buf,
                )? {
                    Some(next) => next,
                    None => return Ok(Decoded::NeedMore),
                };
                if let Some(data) = data {
                    return Ok(Decoded::Data(data));
                }
            },
        }
    }
}

macro_rules! byte (
    ($buf:ident) => ({
        if $buf.is_empty() {
            return Ok(None);
        }
        $buf.split_to(1)[0]
    })
);

macro_rules! or_overflow {
    ($e:expr) => (
        match $e {
            Some(val) => val,
            None => return Err(Error::new_parse(Parse::Chunked)
                .with("invalid chunk size: overflow")),
        }
    )
}

impl ChunkedState {
    /// One transition; `Ok(None)` means the buffer ran dry.
    fn step(
        self,
        buf: &mut BytesMut,
        size: &mut u64,
        extensions_cnt: &mut u64,
        data: &mut Option<Bytes>,
        trailers_buf: &mut Option<BytesMut>,
    ) -> crate::Result<Option<ChunkedState>> {
        match self {
            Start => {
                let b = byte!(buf);
                match b {
                    b'0'..=b'9' => *size = (b - b'0') as u64,
                    b'a'..=b'f' => *size = (b + 10 - b'a') as u64,
                    b'A'..=b'F' => *size = (b + 10 - b'A') as u64,
                    _ => {
                        return Err(Error::new_parse(Parse::Chunked)
                            .with("invalid chunk size line: missing size digit"));
                    }
                }
                Ok(Some(Size))
            }
            Size => {
                let radix = 16;
                match byte!(buf) {
                    b @ b'0'..=b'9' => {
                        *size = or_overflow!(size.checked_mul(radix));
                        *size = or_overflow!(size.checked_add((b - b'0') as u64));
                    }
                    b @ b'a'..=b'f' => {
                        *size = or_overflow!(size.checked_mul(radix));
                        *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
                    }
                    b @ b'A'..=b'F' => {
                        *size = or_overflow!(size.checked_mul(radix));
                        *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
                    }
                    b'\t' | b' ' => return Ok(Some(SizeLws)),
                    b';' => return Ok(Some(Extension)),
                    b'\r' => return Ok(Some(SizeLf)),
                    _ => {
                        return Err(Error::new_parse(Parse::Chunked)
                            .with("invalid chunk size line: invalid size"));
                    }
                }
                Ok(Some(Size))
            }
            SizeLws => match byte!(buf) {
                b'\t' | b' ' => Ok(Some(SizeLws)),
                b';' => Ok(Some(Extension)),
                b'\r' => Ok(Some(SizeLf)),
                _ => Err(Error::new_parse(Parse::Chunked)
                    .with("invalid chunk size linear white space")),
            },
            Extension => match byte!(buf) {
                // Extensions are ignored, but their end must still be a CRLF;
                // a bare LF inside one is rejected outright.
                b'\r' => Ok(Some(SizeLf)),
                b'\n' => Err(Error::new_parse(Parse::Chunked)
                    .with("invalid chunk extension contains newline")),
                _ => {
                    *extensions_cnt += 1;
                    if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                        Err(Error::new_parse(Parse::Chunked)
                            .with("chunk extensions over limit"))
                    } else {
                        Ok(Some(Extension))
                    }
                }
            },
            SizeLf => match byte!(buf) {
                b'\n' => {
                    if *size == 0 {
                        Ok(Some(EndCr))
                    } else {
                        debug!("incoming chunked header: {0:#X} ({0} bytes)", *size);
                        Ok(Some(Body))
                    }
                }
                _ => Err(Error::new_parse(Parse::Chunked).with("invalid chunk size LF")),
            },
            Body => {
                trace!("chunked read, remaining={:?}", size);
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = std::cmp::min(*size, buf.len() as u64) as usize;
                *size -= take as u64;
                *data = Some(buf.split_to(take).freeze());
                if *size > 0 {
                    Ok(Some(Body))
                } else {
                    Ok(Some(BodyCr))
                }
            }
            BodyCr => match byte!(buf) {
                b'\r' => Ok(Some(BodyLf)),
                _ => Err(Error::new_parse(Parse::Chunked).with("invalid chunk body CR")),
            },
            BodyLf => match byte!(buf) {
                b'\n' => Ok(Some(Start)),
                _ => Err(Error::new_parse(Parse::Chunked).with("invalid chunk body LF")),
            },
            Trailer => {
                let b = byte!(buf);
                put_trailer_byte(trailers_buf, b)?;
                match b {
                    b'\r' => Ok(Some(TrailerLf)),
                    _ => Ok(Some(Trailer)),
                }
            }
            TrailerLf => match byte!(buf) {
                b'\n' => {
                    put_trailer_byte(trailers_buf, b'\n')?;
                    Ok(Some(EndCr))
                }
                _ => Err(Error::new_parse(Parse::Chunked).with("invalid trailer end LF")),
            },
            EndCr => {
                let b = byte!(buf);
                match b {
                    b'\r' => {
                        if trailers_buf.is_some() {
                            put_trailer_byte(trailers_buf, b)?;
                        }
                        Ok(Some(EndLf))
                    }
                    _ => {
                        put_trailer_byte(trailers_buf, b)?;
                        Ok(Some(Trailer))
                    }
                }
            }
            EndLf => match byte!(buf) {
                b'\n' => {
                    if trailers_buf.is_some() {
                        put_trailer_byte(trailers_buf, b'\n')?;
                    }
                    Ok(Some(End))
                }
                _ => Err(Error::new_parse(Parse::Chunked).with("invalid chunk end LF")),
            },
            End => Ok(Some(End)),
        }
    }
}

fn put_trailer_byte(trailers_buf: &mut Option<BytesMut>, byte: u8) -> crate::Result<()> {
    let buf = trailers_buf.get_or_insert_with(|| BytesMut::with_capacity(64));
    buf.put_u8(byte);
    if buf.len() >= TRAILER_LIMIT {
        return Err(Error::new_parse(Parse::Chunked).with("chunk trailers over limit"));
    }
    Ok(())
}

fn decode_trailers(raw: &mut BytesMut) -> crate::Result<Option<HeaderMap>> {
    let mut parsed = [httparse::EMPTY_HEADER; super::parse::MAX_HEADERS];
    match httparse::parse_headers(raw, &mut parsed) {
        Ok(httparse::Status::Complete((_, entries))) => {
            let mut trailers = HeaderMap::with_capacity(entries.len());
            for entry in entries {
                let name = HeaderName::from_bytes(entry.name.as_bytes())
                    .map_err(|e| Error::new_parse(Parse::Header).with(e))?;
                let value = HeaderValue::from_bytes(entry.value)
                    .map_err(|e| Error::new_parse(Parse::Header).with(e))?;
                trailers.append(name, value);
            }
            Ok(Some(trailers))
        }
        Ok(httparse::Status::Partial) => {
            Err(Error::new_parse(Parse::Chunked).with("partial trailers"))
        }
        Err(err) => Err(Error::new_parse(Parse::Chunked).with(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut Decoder, raw: &[u8]) -> crate::Result<(Vec<u8>, bool)> {
        let mut buf = BytesMut::from(raw);
        let mut out = Vec::new();
        loop {
            match decoder.decode(&mut buf)? {
                Decoded::Data(data) => out.extend_from_slice(&data),
                Decoded::Complete(_) => return Ok((out, true)),
                Decoded::NeedMore => return Ok((out, false)),
            }
        }
    }

    #[test]
    fn length_decoder_bounds_body() {
        let mut decoder = Decoder::length(5);
        let (out, done) = decode_all(&mut decoder, b"helloworld").unwrap();
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn length_decoder_resumes_across_fills() {
        let mut decoder = Decoder::length(5);
        let (out, done) = decode_all(&mut decoder, b"he").unwrap();
        assert_eq!(out, b"he");
        assert!(!done);
        let (out, done) = decode_all(&mut decoder, b"llo").unwrap();
        assert_eq!(out, b"llo");
        assert!(done);
    }

    #[test]
    fn chunked_single_chunk() {
        let mut decoder = Decoder::chunked();
        let (out, done) = decode_all(&mut decoder, b"5\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn chunked_multiple_chunks_and_split_fills() {
        let mut decoder = Decoder::chunked();
        let raw = b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n";
        // feed one byte at a time; the state machine must resume anywhere
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let mut done = false;
        for &b in raw.iter() {
            buf.put_u8(b);
            loop {
                match decoder.decode(&mut buf).unwrap() {
                    Decoded::Data(data) => out.extend_from_slice(&data),
                    Decoded::Complete(_) => {
                        done = true;
                        break;
                    }
                    Decoded::NeedMore => break,
                }
            }
        }
        assert_eq!(out, b"foobar");
        assert!(done);
    }

    #[test]
    fn chunked_extensions_are_ignored() {
        let mut decoder = Decoder::chunked();
        let (out, done) =
            decode_all(&mut decoder, b"5;name=value\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn chunked_trailers_are_parsed() {
        let mut decoder = Decoder::chunked();
        let mut buf =
            BytesMut::from(&b"5\r\nhello\r\n0\r\nExpires: never\r\n\r\n"[..]);
        let mut trailers = None;
        loop {
            match decoder.decode(&mut buf).unwrap() {
                Decoded::Data(_) => (),
                Decoded::Complete(t) => {
                    trailers = t;
                    break;
                }
                Decoded::NeedMore => panic!("input is complete"),
            }
        }
        let trailers = trailers.expect("trailers present");
        assert_eq!(trailers["expires"], "never");
    }

    #[test]
    fn chunked_bad_size_digit() {
        let mut decoder = Decoder::chunked();
        let err = decode_all(&mut decoder, b"X\r\n").unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn chunked_size_overflow() {
        let mut decoder = Decoder::chunked();
        let err = decode_all(&mut decoder, b"f0000000000000003\r\n").unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn chunked_missing_body_crlf() {
        let mut decoder = Decoder::chunked();
        let err = decode_all(&mut decoder, b"3\r\nfooXY").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn chunked_extension_newline_rejected() {
        let mut decoder = Decoder::chunked();
        let err = decode_all(&mut decoder, b"1;ext\nnope\r\n").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn chunked_leaves_pipelined_bytes() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(&b"2\r\nhi\r\n0\r\n\r\nGET /next"[..]);
        loop {
            match decoder.decode(&mut buf).unwrap() {
                Decoded::Complete(_) => break,
                Decoded::NeedMore => panic!("input is complete"),
                Decoded::Data(_) => (),
            }
        }
        assert_eq!(&buf[..], b"GET /next");
    }
}
