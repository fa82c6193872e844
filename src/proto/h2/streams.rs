//! Per-stream state for the HTTP/2 session.

use std::sync::Arc;

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri};
use tokio::sync::watch;

use crate::error::Error;
use crate::proto::h2::flow::{RecvWindow, SendWindow};
use crate::proto::h2::Reason;

/// Request-side stream states.
///
/// A stream is created on its first HEADERS frame, accumulates its header
/// block (`Headers`/`Continuation`) and body (`Payload`), is handed to a
/// handler task at `Ready -> Piped`, and ends in `Done` or one of the
/// terminal branches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamState {
    Headers,
    Continuation,
    Payload,
    Ready,
    Piped,
    Reset,
    Aborted,
    Error,
}

impl StreamState {
    /// The request side is complete; receiving more request frames on
    /// this stream is a STREAM_CLOSED violation.
    pub(crate) fn is_half_closed(self) -> bool {
        matches!(self, StreamState::Ready | StreamState::Piped)
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Reset | StreamState::Aborted | StreamState::Error
        )
    }
}

/// Session-side record of one stream.
pub(crate) struct Stream {
    pub(crate) id: u32,
    pub(crate) state: StreamState,
    pub(crate) recv_window: RecvWindow,
    pub(crate) send_window: Arc<SendWindow>,
    /// DATA priority for the output lock; 1..=256, default 16.
    pub(crate) weight: u16,
    /// END_STREAM already seen while the header block is still open.
    pub(crate) end_stream: bool,
    pub(crate) header_block: BytesMut,
    /// Set once DATA has been seen and a trailer HEADERS block opens.
    pub(crate) trailers_block: Option<BytesMut>,
    pub(crate) head: Option<RequestHeadParts>,
    pub(crate) trailers: Option<HeaderMap>,
    pub(crate) body: BytesMut,
    /// Over the concurrency limit; answered with RST_STREAM(REFUSED_STREAM).
    pub(crate) refused: bool,
    pub(crate) cancel: watch::Sender<bool>,
    pub(crate) cancel_rx: watch::Receiver<bool>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        send_window_size: u32,
        recv_window_size: u32,
        weight: u16,
    ) -> Stream {
        let (cancel, cancel_rx) = watch::channel(false);
        Stream {
            id,
            state: StreamState::Headers,
            recv_window: RecvWindow::new(recv_window_size),
            send_window: Arc::new(SendWindow::new(send_window_size)),
            weight,
            end_stream: false,
            header_block: BytesMut::new(),
            trailers_block: None,
            head: None,
            trailers: None,
            body: BytesMut::new(),
            refused: false,
            cancel,
            cancel_rx,
        }
    }

    pub(crate) fn abort(&mut self, state: StreamState) {
        self.state = state;
        let _ = self.cancel.send(true);
    }
}

/// The decoded pseudo-headers and header section of a request.
#[derive(Debug)]
pub(crate) struct RequestHeadParts {
    pub(crate) method: Method,
    pub(crate) scheme: String,
    pub(crate) authority: Option<String>,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
}

impl RequestHeadParts {
    pub(crate) fn uri(&self) -> crate::Result<Uri> {
        let mut builder = Uri::builder().path_and_query(self.path.as_str());
        if let Some(authority) = self.authority.as_deref() {
            builder = builder.scheme(self.scheme.as_str()).authority(authority);
        }
        builder
            .build()
            .map_err(|_| stream_error("request pseudo-headers form no valid URI"))
    }
}

fn stream_error(message: &'static str) -> Error {
    Error::new_h2_stream(Reason::PROTOCOL_ERROR, message)
}

/// Validates a decoded header list as a request head (RFC 7540 §8.1.2).
///
/// Pseudo-headers must precede regular fields, `:method`, `:path` and
/// `:scheme` are mandatory, header names must be lowercase, and
/// connection-specific headers are forbidden.
pub(crate) fn request_head_from_fields(
    fields: Vec<(String, String)>,
) -> crate::Result<RequestHeadParts> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = HeaderMap::new();
    let mut seen_regular = false;

    for (name, value) in fields {
        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err(stream_error("pseudo-header after regular header"));
            }
            let slot = match pseudo {
                "method" => &mut method,
                "scheme" => &mut scheme,
                "authority" => &mut authority,
                "path" => &mut path,
                _ => return Err(stream_error("unknown request pseudo-header")),
            };
            if slot.is_some() {
                return Err(stream_error("duplicate pseudo-header"));
            }
            *slot = Some(value);
        } else {
            seen_regular = true;
            append_regular(&mut headers, &name, &value)?;
        }
    }

    let method = method
        .ok_or_else(|| stream_error("request is missing :method"))?
        .parse::<Method>()
        .map_err(|_| stream_error("invalid :method"))?;
    let scheme = scheme.ok_or_else(|| stream_error("request is missing :scheme"))?;
    let path = path.ok_or_else(|| stream_error("request is missing :path"))?;
    if path.is_empty() {
        return Err(stream_error(":path must not be empty"));
    }

    Ok(RequestHeadParts {
        method,
        scheme,
        authority,
        path,
        headers,
    })
}

/// Validates a decoded header list as trailers: regular fields only.
pub(crate) fn trailers_from_fields(
    fields: Vec<(String, String)>,
) -> crate::Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    for (name, value) in fields {
        if name.starts_with(':') {
            return Err(stream_error("pseudo-header in trailers"));
        }
        append_regular(&mut trailers, &name, &value)?;
    }
    Ok(trailers)
}

fn append_regular(headers: &mut HeaderMap, name: &str, value: &str) -> crate::Result<()> {
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(stream_error("header name is not lowercase"));
    }
    match name {
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
        | "upgrade" => {
            return Err(stream_error("connection-specific header in http2 request"));
        }
        "te" if value != "trailers" => {
            return Err(stream_error("te header other than trailers"));
        }
        _ => (),
    }
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| stream_error("invalid header name"))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| stream_error("invalid header value"))?;
    headers.append(name, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn valid_request_head() {
        let head = request_head_from_fields(fields(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.org"),
            (":path", "/users/8"),
            ("accept", "*/*"),
        ]))
        .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path, "/users/8");
        assert_eq!(head.uri().unwrap().path(), "/users/8");
        assert_eq!(head.headers["accept"], "*/*");
    }

    #[test]
    fn missing_required_pseudo_header() {
        let err = request_head_from_fields(fields(&[
            (":method", "GET"),
            (":scheme", "https"),
        ]))
        .unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn pseudo_after_regular_rejected() {
        let err = request_head_from_fields(fields(&[
            (":method", "GET"),
            ("accept", "*/*"),
            (":path", "/"),
        ]))
        .unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn unknown_pseudo_rejected() {
        let err = request_head_from_fields(fields(&[(":nope", "x")])).unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn uppercase_header_name_rejected() {
        let err = request_head_from_fields(fields(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            ("Accept", "*/*"),
        ]))
        .unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn connection_header_rejected() {
        let err = request_head_from_fields(fields(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            ("connection", "close"),
        ]))
        .unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn trailers_reject_pseudo_headers() {
        assert!(trailers_from_fields(fields(&[("x-checksum", "abc")])).is_ok());
        assert!(trailers_from_fields(fields(&[(":status", "200")])).is_err());
    }
}
