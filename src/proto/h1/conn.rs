//! The HTTP/1.1 connection loop.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE};
use http::{Method, StatusCode, Version};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::body::Body;
use crate::common::BoxIo;
use crate::error::{Error, Parse};
use crate::headers;
use crate::service::HttpService;
use crate::{Request, Response};

use super::decode::{Decoded, Decoder};
use super::encode;
use super::io::Buffered;
use super::parse::{self, ParseConfig, RequestHead};

/// How many stray body bytes are skipped to salvage keep-alive when an
/// endpoint ignores the request body; larger remainders close instead.
const DRAIN_BUDGET: usize = 64 * 1024;

/// Tuning for the HTTP/1.1 connection handlers.
#[derive(Clone, Debug)]
pub struct Http1Config {
    /// Cap on the request head (request line + headers); overflow is 431.
    pub max_headers_size: usize,
    /// Allow connection reuse at all.
    pub keep_alive: bool,
}

impl Default for Http1Config {
    fn default() -> Http1Config {
        Http1Config {
            max_headers_size: parse::DEFAULT_MAX_HEADERS_SIZE,
            keep_alive: true,
        }
    }
}

/// The connection's buffered read side plus the in-flight body decoder.
///
/// Shared between the loop and the request [`Body`] handed to the
/// endpoint; accesses are strictly sequential (parse, handler, drain,
/// serialize), so the lock is never contended.
pub(crate) struct ReadPipe {
    pub(crate) io: Buffered<BoxIo>,
    pub(crate) reading: Option<Decoder>,
}

pub(crate) type SharedPipe = Arc<Mutex<ReadPipe>>;

/// What became of a connection once the loop exited.
pub(crate) enum Deed {
    Closed,
    Delegated(Delegation),
}

/// A live connection handed off after an `Upgrade` exchange.
pub(crate) struct Delegation {
    pub(crate) io: BoxIo,
    pub(crate) read_buf: Bytes,
    pub(crate) protocol: String,
    pub(crate) h2_settings: Option<Bytes>,
}

/// The considered state of the connection after one exchange.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConnState {
    Alive,
    Closing,
    Delegated,
}

/// Decides connection reuse after a request/response exchange.
pub(crate) fn consider_connection_state(
    req_version: Version,
    req_close: bool,
    req_keep_alive: bool,
    has_upgrade: bool,
    resp_close: bool,
    resp_status: StatusCode,
) -> ConnState {
    if resp_close || resp_status.is_server_error() {
        ConnState::Closing
    } else if has_upgrade {
        ConnState::Delegated
    } else if req_version == Version::HTTP_11 {
        if req_close {
            ConnState::Closing
        } else {
            ConnState::Alive
        }
    } else if req_keep_alive {
        ConnState::Alive
    } else {
        ConnState::Closing
    }
}

/// Serves HTTP/1.1 exchanges on `io` until the connection closes or is
/// delegated to another protocol handler.
pub(crate) async fn serve(
    io: BoxIo,
    service: Arc<HttpService>,
    config: &Http1Config,
) -> crate::Result<Deed> {
    let parse_config = ParseConfig {
        max_headers_size: config.max_headers_size,
    };
    let pipe: SharedPipe = Arc::new(Mutex::new(ReadPipe {
        io: Buffered::new(io),
        reading: None,
    }));

    loop {
        // Read the next request head. A clean EOF between requests ends
        // the loop silently.
        let head = {
            let mut guard = pipe.lock().await;
            match read_head(&mut guard.io, &parse_config).await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(Deed::Closed),
                Err(err) => {
                    drop(guard);
                    if err.is_broken_pipe() {
                        trace!("connection dropped before request head");
                        return Ok(Deed::Closed);
                    }
                    let res = service.render_error(&err);
                    let _ = write_response(&pipe, res, Version::HTTP_11, false).await;
                    return Ok(Deed::Closed);
                }
            }
        };

        let req_version = head.version;
        let is_head = head.method == Method::HEAD;
        let req_close = headers::connection_has(&head.headers, "close");
        let req_keep_alive = headers::connection_has(&head.headers, "keep-alive");
        let req_upgrade = head.headers.get(UPGRADE).cloned();
        let h2_settings = head
            .headers
            .get("http2-settings")
            .map(|v| Bytes::copy_from_slice(v.as_bytes()));

        // Select the body framing before the request object exists; a bad
        // combination fails the whole exchange.
        let decoder = match request_decoder(&head.headers) {
            Ok(decoder) => decoder,
            Err(err) => {
                let res = service.render_error(&err);
                let _ = write_response(&pipe, res, req_version, is_head).await;
                return Ok(Deed::Closed);
            }
        };

        let body = match decoder {
            Some(decoder) => {
                pipe.lock().await.reading = Some(decoder);
                Body::h1(pipe.clone())
            }
            None => Body::empty(),
        };

        let req = request_from_head(head, body);
        let res = service.handle(req).await;

        let resp_status = res.status();
        let resp_close = headers::connection_has(res.headers(), "close");
        let resp_upgrade = res.headers().get(UPGRADE).cloned();
        let has_upgrade = resp_upgrade.is_some() || req_upgrade.is_some();

        let mut state = consider_connection_state(
            req_version,
            req_close,
            req_keep_alive,
            has_upgrade,
            resp_close,
            resp_status,
        );
        if !config.keep_alive && state == ConnState::Alive {
            state = ConnState::Closing;
        }

        let res = finalize_headers(res, req_version, state);
        match write_response(&pipe, res, req_version, is_head).await {
            Ok(true) => (),
            Ok(false) => state = ConnState::Closing,
            Err(err) => {
                if !err.is_broken_pipe() {
                    debug!("error writing response: {}", err);
                }
                return Ok(Deed::Closed);
            }
        }

        // Whatever the endpoint left unread must be consumed before the
        // next head parse, or the framing is lost.
        if !drain_request_body(&pipe).await {
            state = ConnState::Closing;
        }

        match state {
            ConnState::Alive => continue,
            ConnState::Closing => return Ok(Deed::Closed),
            ConnState::Delegated => {
                let protocol = resp_upgrade
                    .as_ref()
                    .or(req_upgrade.as_ref())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_owned();
                let pipe = match Arc::try_unwrap(pipe) {
                    Ok(mutex) => mutex.into_inner(),
                    Err(_) => {
                        warn!("upgrade requested but the request body is still shared");
                        return Ok(Deed::Closed);
                    }
                };
                let (io, read_buf) = pipe.io.into_parts();
                return Ok(Deed::Delegated(Delegation {
                    io,
                    read_buf,
                    protocol,
                    h2_settings,
                }));
            }
        }
    }
}

/// Reads one request head; `Ok(None)` is a clean close between requests.
async fn read_head(
    io: &mut Buffered<BoxIo>,
    config: &ParseConfig,
) -> crate::Result<Option<RequestHead>> {
    loop {
        if let Some(head) = parse::parse_request(io.read_buf_mut(), config)? {
            return Ok(Some(head));
        }
        match io.read_some().await {
            Ok(0) => {
                return if io.read_buf().is_empty() {
                    Ok(None)
                } else {
                    Err(Error::new_parse(Parse::Incomplete))
                };
            }
            Ok(_) => continue,
            Err(err) => return Err(Error::new_io(err)),
        }
    }
}

/// Chooses the body framing per RFC 7230 §3.3.3.
fn request_decoder(headers: &HeaderMap) -> crate::Result<Option<Decoder>> {
    let chunked = headers::transfer_encoding_is_chunked(headers)
        .map_err(|_| Error::new_parse(Parse::TransferEncodingUnsupported))?;
    let length = headers::content_length_parse_all(headers)
        .map_err(|_| Error::new_parse(Parse::ContentLength))?;
    if chunked {
        if length.is_some() {
            return Err(Error::new_parse(Parse::ContentLength)
                .with("both Content-Length and Transfer-Encoding: chunked"));
        }
        Ok(Some(Decoder::chunked()))
    } else {
        match length {
            Some(0) | None => Ok(None),
            Some(len) => Ok(Some(Decoder::length(len))),
        }
    }
}

fn request_from_head(head: RequestHead, body: Body) -> Request {
    let mut req = Request::new(body);
    *req.method_mut() = head.method;
    *req.uri_mut() = head.uri;
    *req.version_mut() = head.version;
    *req.headers_mut() = head.headers;
    req
}

/// Stamps `Date`, the connection token and the body-framing headers.
fn finalize_headers(mut res: Response, version: Version, state: ConnState) -> Response {
    headers::set_date_if_absent(res.headers_mut());
    match state {
        ConnState::Closing => {
            res.headers_mut()
                .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        }
        ConnState::Alive if version == Version::HTTP_10 => {
            res.headers_mut().insert(
                http::header::CONNECTION,
                HeaderValue::from_static("keep-alive"),
            );
        }
        _ => (),
    }
    res
}

/// Serializes the response. `Ok(true)` means the body went out intact;
/// `Ok(false)` means a streaming body failed mid-flight and the
/// connection must close.
async fn write_response(
    pipe: &SharedPipe,
    mut res: Response,
    version: Version,
    is_head: bool,
) -> crate::Result<bool> {
    let status = res.status();
    let can_have_body = !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED);
    let streaming = res.body().is_streaming();
    let known_size = res.body().known_size();

    if can_have_body {
        if streaming {
            res.headers_mut().remove(CONTENT_LENGTH);
            res.headers_mut()
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        } else {
            let mut len = itoa::Buffer::new();
            res.headers_mut().insert(
                CONTENT_LENGTH,
                HeaderValue::from_str(len.format(known_size.unwrap_or(0)))
                    .expect("content-length is a valid header value"),
            );
            res.headers_mut().remove(TRANSFER_ENCODING);
        }
    } else {
        res.headers_mut().remove(CONTENT_LENGTH);
        res.headers_mut().remove(TRANSFER_ENCODING);
    }

    {
        let mut guard = pipe.lock().await;
        encode::encode_head(guard.io.write_buf(), version, status, res.headers());
    }

    let mut intact = true;
    if can_have_body && !is_head {
        let mut body = std::mem::take(res.body_mut());
        loop {
            // The body is pulled without holding the pipe lock: an
            // endpoint may legally pass the request body back out as the
            // response body, and it locks the same pipe to read.
            match body.data().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let mut guard = pipe.lock().await;
                    if streaming {
                        encode::encode_chunk(guard.io.write_buf(), &chunk);
                        guard.io.flush().await.map_err(Error::new_io)?;
                    } else {
                        guard.io.write_body(&chunk).await.map_err(Error::new_io)?;
                    }
                }
                Some(Err(err)) => {
                    warn!("response body failed mid-stream: {}", err);
                    intact = false;
                    break;
                }
                None => {
                    if streaming {
                        let mut guard = pipe.lock().await;
                        encode::encode_chunked_end(guard.io.write_buf());
                    }
                    break;
                }
            }
        }
    }

    pipe.lock().await.io.flush().await.map_err(Error::new_io)?;
    Ok(intact)
}

/// Consumes any unread request body; `false` means keep-alive is lost.
async fn drain_request_body(pipe: &SharedPipe) -> bool {
    let mut guard = pipe.lock().await;
    if guard.reading.is_none() {
        return true;
    }
    let mut budget = DRAIN_BUDGET;
    loop {
        let pipe = &mut *guard;
        let step = match pipe.reading.as_mut() {
            Some(decoder) => decoder.decode(pipe.io.read_buf_mut()),
            None => return true,
        };
        match step {
            Ok(Decoded::Data(chunk)) => {
                if chunk.len() > budget {
                    debug!("unread request body too large to drain");
                    guard.reading = None;
                    return false;
                }
                budget -= chunk.len();
            }
            Ok(Decoded::Complete(_)) => {
                guard.reading = None;
                return true;
            }
            Ok(Decoded::NeedMore) => match guard.io.read_some().await {
                Ok(0) => {
                    guard.reading = None;
                    return false;
                }
                Ok(_) => (),
                Err(_) => {
                    guard.reading = None;
                    return false;
                }
            },
            Err(_) => {
                guard.reading = None;
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_rules() {
        use ConnState::*;
        let v11 = Version::HTTP_11;
        let v10 = Version::HTTP_10;
        let ok = StatusCode::OK;

        // (a) response close or 5xx
        assert_eq!(
            consider_connection_state(v11, false, false, false, true, ok),
            Closing
        );
        assert_eq!(
            consider_connection_state(
                v11,
                false,
                false,
                false,
                false,
                StatusCode::INTERNAL_SERVER_ERROR
            ),
            Closing
        );
        // (b) upgrade
        assert_eq!(
            consider_connection_state(v11, false, false, true, false, ok),
            Delegated
        );
        // (a) wins over (b)
        assert_eq!(
            consider_connection_state(v11, false, false, true, true, ok),
            Closing
        );
        // (c) http/1.1 with request close
        assert_eq!(
            consider_connection_state(v11, true, false, false, false, ok),
            Closing
        );
        // (d) http/1.1 default
        assert_eq!(
            consider_connection_state(v11, false, false, false, false, ok),
            Alive
        );
        // (e) http/1.0 default and opt-in
        assert_eq!(
            consider_connection_state(v10, false, false, false, false, ok),
            Closing
        );
        assert_eq!(
            consider_connection_state(v10, false, true, false, false, ok),
            Alive
        );
    }

    #[test]
    fn decoder_selection() {
        let mut headers = HeaderMap::new();
        assert!(request_decoder(&headers).unwrap().is_none());

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        assert!(matches!(request_decoder(&headers), Ok(Some(_))));

        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let err = request_decoder(&headers).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        headers.remove(CONTENT_LENGTH);
        assert!(matches!(request_decoder(&headers), Ok(Some(_))));

        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip"));
        let err = request_decoder(&headers).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
