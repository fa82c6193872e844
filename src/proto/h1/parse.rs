use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri, Version};
use tracing::{debug, trace};

use crate::error::{Error, Parse};

/// Maximum number of headers `httparse` will record.
pub(crate) const MAX_HEADERS: usize = 100;

/// Default cap on the size of the request head (request line + headers).
pub(crate) const DEFAULT_MAX_HEADERS_SIZE: usize = 4096;

/// A parsed request line and header section.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ParseConfig {
    pub(crate) max_headers_size: usize,
}

impl Default for ParseConfig {
    fn default() -> ParseConfig {
        ParseConfig {
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
        }
    }
}

/// Parses one request head from the front of `buf`.
///
/// On success the head bytes are consumed from `buf`; any body bytes that
/// were already read stay buffered for the body decoder. `Ok(None)` means
/// more bytes are needed.
pub(crate) fn parse_request(
    buf: &mut BytesMut,
    config: &ParseConfig,
) -> crate::Result<Option<RequestHead>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    trace!("Request.parse [Header; {}], [u8; {}]", headers.len(), buf.len());
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            trace!("Request.parse Complete({})", len);
            len
        }
        Ok(httparse::Status::Partial) => {
            return if buf.len() > config.max_headers_size {
                debug!(
                    "partial headers exceed limit ({} > {})",
                    buf.len(),
                    config.max_headers_size
                );
                Err(Error::new_parse(Parse::TooLarge))
            } else {
                Ok(None)
            };
        }
        Err(err) => return Err(map_httparse_error(err)),
    };

    if len > config.max_headers_size {
        debug!(
            "headers section exceeds limit ({} > {})",
            len, config.max_headers_size
        );
        return Err(Error::new_parse(Parse::TooLarge));
    }

    let method = Method::from_bytes(req.method.unwrap().as_bytes())
        .map_err(|e| Error::new_parse(Parse::Method).with(e))?;
    if !req
        .method
        .unwrap()
        .bytes()
        .all(|b| b.is_ascii_uppercase())
    {
        return Err(Error::new_parse(Parse::Method).with("Invalid starting line"));
    }
    let uri: Uri = req
        .path
        .unwrap()
        .parse()
        .map_err(|e| Error::new_parse(Parse::Uri).with(e))?;
    let version = match req.version.unwrap() {
        0 => Version::HTTP_10,
        1 => Version::HTTP_11,
        _ => return Err(Error::new_parse(Parse::Version).with("Invalid starting line")),
    };

    let mut header_map = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| Error::new_parse(Parse::Header).with(e))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| Error::new_parse(Parse::Header).with(e))?;
        header_map.append(name, value);
    }

    let _ = buf.split_to(len);

    Ok(Some(RequestHead {
        method,
        uri,
        version,
        headers: header_map,
    }))
}

fn map_httparse_error(err: httparse::Error) -> Error {
    match err {
        httparse::Error::Version => {
            Error::new_parse(Parse::Version).with("Invalid starting line")
        }
        httparse::Error::Token => {
            Error::new_parse(Parse::Method).with("Invalid starting line")
        }
        httparse::Error::TooManyHeaders => Error::new_parse(Parse::TooLarge).with(err),
        _ => Error::new_parse(Parse::Header).with(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn parse(raw: &[u8]) -> crate::Result<Option<RequestHead>> {
        let mut buf = BytesMut::from(raw);
        parse_request(&mut buf, &ParseConfig::default())
    }

    #[test]
    fn parse_simple_get() {
        let head = parse(b"GET /echo HTTP/1.1\r\nHost: example.org\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri.path(), "/echo");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers["host"], "example.org");
    }

    #[test]
    fn parse_leaves_body_bytes() {
        let mut buf =
            BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"[..]);
        let head = parse_request(&mut buf, &ParseConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn parse_partial_returns_none() {
        assert!(parse(b"GET / HTTP/1.1\r\nHost: ex").unwrap().is_none());
    }

    #[test]
    fn parse_lowercase_method_rejected() {
        let err = parse(b"get / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn parse_bad_version_rejected() {
        let err = parse(b"GET / HTTP/4.2\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err
            .message_stack()
            .iter()
            .any(|m| m.contains("Invalid starting line")));
    }

    #[test]
    fn parse_headers_preserve_multi_values() {
        let head = parse(
            b"GET / HTTP/1.1\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        let cookies: Vec<_> = head
            .headers
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn parse_oversized_head_rejected() {
        let mut raw = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
        for i in 0..200 {
            raw.extend_from_slice(format!("X-Filler-{}: {}\r\n", i, "y".repeat(40)).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let err = parse(&raw).unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    #[test]
    fn parse_oversized_partial_rejected() {
        // No terminator yet, but already past the configured cap.
        let mut raw = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
        raw.extend_from_slice("X-Filler: ".as_bytes());
        raw.extend_from_slice("y".repeat(DEFAULT_MAX_HEADERS_SIZE).as_bytes());
        let err = parse(&raw).unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }
}
