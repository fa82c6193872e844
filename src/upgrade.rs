//! Protocol upgrades out of HTTP/1.1.

use http::header::{HeaderValue, CONNECTION, UPGRADE};
use http::{StatusCode, Version};

use crate::body::Body;
use crate::headers;
use crate::service::RequestInterceptor;
use crate::{Request, Response};

/// Answers `Upgrade: h2c` requests with `101 Switching Protocols`.
///
/// Register as a request interceptor; the connection loop sees the 101
/// response, reports the connection as delegated, and the version switch
/// hands the live stream to the HTTP/2 session with the request's
/// `HTTP2-Settings` seeded as the client's first SETTINGS frame.
#[derive(Debug, Default)]
pub struct H2cUpgrade;

impl RequestInterceptor for H2cUpgrade {
    fn intercept(&self, req: &mut Request) -> crate::Result<Option<Response>> {
        if req.version() != Version::HTTP_11 {
            return Ok(None);
        }
        if !headers::connection_has(req.headers(), "upgrade") {
            return Ok(None);
        }
        let wants_h2c = req
            .headers()
            .get(UPGRADE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(',')
                    .any(|proto| proto.trim().eq_ignore_ascii_case("h2c"))
            })
            .unwrap_or(false);
        if !wants_h2c {
            return Ok(None);
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        res.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        res.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("h2c"));
        Ok(Some(res))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request() -> Request {
        let mut req = Request::new(Body::empty());
        req.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("Upgrade, HTTP2-Settings"));
        req.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("h2c"));
        req.headers_mut()
            .insert("http2-settings", HeaderValue::from_static("AAMAAABk"));
        req
    }

    #[test]
    fn h2c_request_gets_101() {
        let mut req = upgrade_request();
        let res = H2cUpgrade.intercept(&mut req).unwrap().unwrap();
        assert_eq!(res.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(res.headers()[UPGRADE], "h2c");
    }

    #[test]
    fn other_upgrades_pass_through() {
        let mut req = upgrade_request();
        req.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(H2cUpgrade.intercept(&mut req).unwrap().is_none());
    }

    #[test]
    fn plain_requests_pass_through() {
        let mut req = Request::new(Body::empty());
        assert!(H2cUpgrade.intercept(&mut req).unwrap().is_none());
    }

    #[test]
    fn http10_is_not_upgraded() {
        let mut req = upgrade_request();
        *req.version_mut() = Version::HTTP_10;
        assert!(H2cUpgrade.intercept(&mut req).unwrap().is_none());
    }
}
