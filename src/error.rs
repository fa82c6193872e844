//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

use crate::proto::h2::Reason;

/// Result type often returned from methods that can have trellis `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP connections and requests.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// No route was registered for the request's method and path.
    RouteNotFound,
    /// The request media type is not consumable by the endpoint.
    UnsupportedMediaType,
    /// The request body exceeds the configured limit.
    PayloadTooLarge,
    /// An endpoint or interceptor failed.
    Endpoint,
    /// An error carrying an explicit response status.
    Status(StatusCode),
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// An HTTP/2 connection-level error.
    Http2Connection(Reason),
    /// An HTTP/2 stream-level error.
    Http2Stream(Reason),
    /// Error accepting a connection from the listener.
    Accept,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Uri,
    Version,
    Header,
    /// The headers section exceeded its configured maximum size.
    TooLarge,
    /// `Transfer-Encoding` other than `chunked`.
    TransferEncodingUnsupported,
    /// `Transfer-Encoding: chunked` combined with `Content-Length`, or
    /// a repeated `Content-Length` with disagreeing values.
    ContentLength,
    /// Malformed chunked body framing.
    Chunked,
    /// The connection closed before a complete message was received.
    Incomplete,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// The response status this error should surface as.
    ///
    /// Transport-level kinds that never render a response map to 500.
    pub fn status(&self) -> StatusCode {
        match self.inner.kind {
            Kind::Parse(Parse::TooLarge) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Kind::Parse(Parse::TransferEncodingUnsupported) => StatusCode::NOT_IMPLEMENTED,
            Kind::Parse(_) => StatusCode::BAD_REQUEST,
            Kind::RouteNotFound => StatusCode::NOT_FOUND,
            Kind::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Kind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Kind::Status(status) => status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true if this error came from request parsing.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the peer hung up and the error should be dropped
    /// without producing a response.
    pub fn is_broken_pipe(&self) -> bool {
        if !matches!(self.inner.kind, Kind::Io) {
            return false;
        }
        self.io_kind().map_or(false, |k| {
            matches!(
                k,
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            )
        })
    }

    /// Returns true if this is an HTTP/2 connection- or stream-level error.
    pub fn is_h2(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Http2Connection(_) | Kind::Http2Stream(_)
        )
    }

    pub(crate) fn h2_reason(&self) -> Option<Reason> {
        match self.inner.kind {
            Kind::Http2Connection(reason) | Kind::Http2Stream(reason) => Some(reason),
            _ => None,
        }
    }

    fn io_kind(&self) -> Option<std::io::ErrorKind> {
        self.inner
            .cause
            .as_deref()
            .and_then(|c| c.downcast_ref::<std::io::Error>())
            .map(|io| io.kind())
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid method",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Version) => "invalid HTTP version",
            Kind::Parse(Parse::Header) => "invalid header",
            Kind::Parse(Parse::TooLarge) => "headers section too large",
            Kind::Parse(Parse::TransferEncodingUnsupported) => {
                "unsupported transfer encoding"
            }
            Kind::Parse(Parse::ContentLength) => "conflicting message length",
            Kind::Parse(Parse::Chunked) => "invalid chunked encoding",
            Kind::Parse(Parse::Incomplete) => "connection closed mid-message",
            Kind::RouteNotFound => "no route matched the requested URL",
            Kind::UnsupportedMediaType => "unsupported media type",
            Kind::PayloadTooLarge => "payload too large",
            Kind::Endpoint => "endpoint failed",
            Kind::Status(_) => "request failed",
            Kind::Io => "connection error",
            Kind::Http2Connection(_) => "http2 connection error",
            Kind::Http2Stream(_) => "http2 stream error",
            Kind::Accept => "error accepting connection",
        }
    }

    /// The chain of messages, outermost first, used by the error renderer.
    pub fn message_stack(&self) -> Vec<String> {
        let mut stack = vec![self.to_string()];
        let mut source = self.source();
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }
        stack
    }

    // constructors

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_route_not_found() -> Error {
        Error::new(Kind::RouteNotFound)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_endpoint<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Endpoint).with(cause)
    }

    pub(crate) fn new_accept<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_h2_connection(reason: Reason, message: &'static str) -> Error {
        Error::new(Kind::Http2Connection(reason)).with(message)
    }

    pub(crate) fn new_h2_stream(reason: Reason, message: &'static str) -> Error {
        Error::new(Kind::Http2Stream(reason)).with(message)
    }

    /// An error carrying an explicit status code, rendered by the error
    /// handler with `message` on the stack.
    pub fn status_msg<C: Into<Cause>>(status: StatusCode, message: C) -> Error {
        Error::new(Kind::Status(status)).with(message)
    }

    /// A 415 for endpoints refusing the request's media type.
    pub fn unsupported_media_type() -> Error {
        Error::new(Kind::UnsupportedMediaType)
    }

    /// A 413 for endpoints refusing an oversized payload.
    pub fn payload_too_large() -> Error {
        Error::new(Kind::PayloadTooLarge)
    }

    /// A 500 wrapping an endpoint failure.
    pub fn endpoint_msg<C: Into<Cause>>(message: C) -> Error {
        Error::new_endpoint(message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("trellis::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_is_one_pointer() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn statuses() {
        assert_eq!(
            Error::new_parse(Parse::Method).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::new_parse(Parse::TooLarge).status(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
        assert_eq!(
            Error::new_parse(Parse::TransferEncodingUnsupported).status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            Error::new_route_not_found().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::new_endpoint("boom").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn broken_pipe_detection() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone");
        assert!(Error::new_io(io).is_broken_pipe());

        let io = std::io::Error::new(std::io::ErrorKind::WouldBlock, "not yet");
        assert!(!Error::new_io(io).is_broken_pipe());
    }

    #[test]
    fn message_stack_walks_causes() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "root cause");
        let err = Error::new_endpoint(inner);
        let stack = err.message_stack();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[0], "endpoint failed");
        assert_eq!(stack[1], "root cause");
    }
}
