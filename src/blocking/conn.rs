//! The blocking HTTP/1.1 connection loop: one OS thread per connection.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::UPGRADE;
use http::{Method, Version};
use tracing::{debug, trace, warn};

use crate::body::Body;
use crate::error::{Error, Parse};
use crate::headers;
use crate::proto::h1::conn::{consider_connection_state, ConnState};
use crate::proto::h1::decode::{Decoded, Decoder};
use crate::proto::h1::encode;
use crate::proto::h1::parse::{self, ParseConfig, RequestHead};
use crate::proto::h1::Http1Config;
use crate::{Request, Response};

use super::io::{BoxConn, BufferedIo};
use super::BlockingHttpService;

const DRAIN_BUDGET: usize = 64 * 1024;

/// Read side shared with the lazily-read request [`Body`]; accesses are
/// strictly sequential within the connection's thread.
pub(crate) struct ReadPipe {
    pub(crate) io: BufferedIo,
    pub(crate) reading: Option<Decoder>,
}

pub(crate) type SharedPipe = Arc<Mutex<ReadPipe>>;

/// Pulls the next body chunk for `Body::data_blocking`.
pub(crate) fn read_data(pipe: &SharedPipe) -> Option<crate::Result<Bytes>> {
    let mut guard = pipe.lock().unwrap();
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
            Ok(Decoded::NeedMore) => match guard.io.read_some() {
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

/// Runs the keep-alive loop until the connection closes.
pub(crate) fn serve(io: BoxConn, service: &BlockingHttpService, config: &Http1Config) {
    let parse_config = ParseConfig {
        max_headers_size: config.max_headers_size,
    };
    let pipe: SharedPipe = Arc::new(Mutex::new(ReadPipe {
        io: BufferedIo::new(io),
        reading: None,
    }));

    loop {
        let head = {
            let mut guard = pipe.lock().unwrap();
            match read_head(&mut guard.io, &parse_config) {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(err) => {
                    drop(guard);
                    if !err.is_broken_pipe() {
                        let res = service.render_error(&err);
                        let _ = write_response(&pipe, res, Version::HTTP_11, false);
                    }
                    return;
                }
            }
        };

        let req_version = head.version;
        let is_head = head.method == Method::HEAD;
        let req_close = headers::connection_has(&head.headers, "close");
        let req_keep_alive = headers::connection_has(&head.headers, "keep-alive");
        let has_req_upgrade = head.headers.contains_key(UPGRADE);

        let decoder = match request_decoder(&head.headers) {
            Ok(decoder) => decoder,
            Err(err) => {
                let res = service.render_error(&err);
                let _ = write_response(&pipe, res, req_version, is_head);
                return;
            }
        };

        let body = match decoder {
            Some(decoder) => {
                pipe.lock().unwrap().reading = Some(decoder);
                Body::h1_blocking(pipe.clone())
            }
            None => Body::empty(),
        };

        let req = request_from_head(head, body);
        let res = service.handle(req);

        let resp_status = res.status();
        let resp_close = headers::connection_has(res.headers(), "close");
        let has_upgrade = has_req_upgrade || res.headers().contains_key(UPGRADE);

        let mut state = consider_connection_state(
            req_version,
            req_close,
            req_keep_alive,
            has_upgrade,
            resp_close,
            resp_status,
        );
        if state == ConnState::Delegated {
            // There is no in-thread handler to hand a blocking socket to.
            warn!("upgrade requested on the blocking handler, closing instead");
            state = ConnState::Closing;
        }
        if !config.keep_alive && state == ConnState::Alive {
            state = ConnState::Closing;
        }

        let res = finalize(res, req_version, state);
        match write_response(&pipe, res, req_version, is_head) {
            Ok(true) => (),
            Ok(false) => state = ConnState::Closing,
            Err(err) => {
                if !err.is_broken_pipe() {
                    debug!("error writing response: {}", err);
                }
                return;
            }
        }

        if !drain_request_body(&pipe) {
            state = ConnState::Closing;
        }

        if state != ConnState::Alive {
            return;
        }
    }
}

fn read_head(io: &mut BufferedIo, config: &ParseConfig) -> crate::Result<Option<RequestHead>> {
    loop {
        if let Some(head) = parse::parse_request(io.read_buf_mut(), config)? {
            return Ok(Some(head));
        }
        match io.read_some() {
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

fn request_decoder(
    headers: &http::HeaderMap,
) -> crate::Result<Option<Decoder>> {
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

fn finalize(mut res: Response, version: Version, state: ConnState) -> Response {
    headers::set_date_if_absent(res.headers_mut());
    match state {
        ConnState::Closing => {
            res.headers_mut().insert(
                http::header::CONNECTION,
                http::HeaderValue::from_static("close"),
            );
        }
        ConnState::Alive if version == Version::HTTP_10 => {
            res.headers_mut().insert(
                http::header::CONNECTION,
                http::HeaderValue::from_static("keep-alive"),
            );
        }
        _ => (),
    }
    res
}

fn write_response(
    pipe: &SharedPipe,
    mut res: Response,
    version: Version,
    is_head: bool,
) -> crate::Result<bool> {
    use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
    use http::StatusCode;

    let status = res.status();
    let can_have_body = !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED);
    let streaming = res.body().is_streaming();
    let known_size = res.body().known_size();

    if can_have_body {
        if streaming {
            res.headers_mut().remove(CONTENT_LENGTH);
            res.headers_mut().insert(
                TRANSFER_ENCODING,
                http::HeaderValue::from_static("chunked"),
            );
        } else {
            let mut len = itoa::Buffer::new();
            res.headers_mut().insert(
                CONTENT_LENGTH,
                http::HeaderValue::from_str(len.format(known_size.unwrap_or(0)))
                    .expect("content-length is a valid header value"),
            );
            res.headers_mut().remove(TRANSFER_ENCODING);
        }
    } else {
        res.headers_mut().remove(CONTENT_LENGTH);
        res.headers_mut().remove(TRANSFER_ENCODING);
    }

    {
        let mut guard = pipe.lock().unwrap();
        encode::encode_head(guard.io.write_buf(), version, status, res.headers());
    }

    let mut intact = true;
    if can_have_body && !is_head {
        let mut body = std::mem::take(res.body_mut());
        loop {
            match body.data_blocking() {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let mut guard = pipe.lock().unwrap();
                    if streaming {
                        encode::encode_chunk(guard.io.write_buf(), &chunk);
                        guard.io.flush().map_err(Error::new_io)?;
                    } else {
                        guard.io.write_body(&chunk).map_err(Error::new_io)?;
                    }
                }
                Some(Err(err)) => {
                    warn!("response body failed mid-stream: {}", err);
                    intact = false;
                    break;
                }
                None => {
                    if streaming {
                        let mut guard = pipe.lock().unwrap();
                        encode::encode_chunked_end(guard.io.write_buf());
                    }
                    break;
                }
            }
        }
    }

    pipe.lock().unwrap().io.flush().map_err(Error::new_io)?;
    Ok(intact)
}

fn drain_request_body(pipe: &SharedPipe) -> bool {
    let mut guard = pipe.lock().unwrap();
    if guard.reading.is_none() {
        return true;
    }
    let mut budget = DRAIN_BUDGET;
    loop {
        let inner = &mut *guard;
        let step = match inner.reading.as_mut() {
            Some(decoder) => decoder.decode(inner.io.read_buf_mut()),
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
            Ok(Decoded::NeedMore) => match guard.io.read_some() {
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
