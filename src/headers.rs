use bytes::BytesMut;
use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};

/// Value of the `Server` header stamped onto responses.
pub(crate) const SERVER_NAME: &str = concat!("trellis/", env!("CARGO_PKG_VERSION"));

/// Parses every `Content-Length` value, requiring agreement.
///
/// Multiple `Content-Length` headers (or one with a comma-separated list)
/// are tolerated only when every value is the same; disagreement or
/// garbage is a hard parse failure.
pub(crate) fn content_length_parse_all(headers: &HeaderMap) -> Result<Option<u64>, ()> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value.to_str().map_err(|_| ())?;
        for part in text.split(',') {
            let parsed: u64 = part.trim().parse().map_err(|_| ())?;
            match length {
                None => length = Some(parsed),
                Some(prev) if prev == parsed => (),
                Some(_) => return Err(()),
            }
        }
    }
    Ok(length)
}

/// Whether `chunked` is the final transfer coding.
///
/// `Ok(false)` means no `Transfer-Encoding` at all; any coding chain that
/// does not end in `chunked` is an error (501 surface for requests).
pub(crate) fn transfer_encoding_is_chunked(headers: &HeaderMap) -> Result<bool, ()> {
    let mut last = None;
    for value in headers.get_all(TRANSFER_ENCODING) {
        let text = value.to_str().map_err(|_| ())?;
        for coding in text.split(',') {
            let coding = coding.trim();
            if !coding.is_empty() {
                last = Some(coding.to_ascii_lowercase());
            }
        }
    }
    match last.as_deref() {
        None => Ok(false),
        Some("chunked") => Ok(true),
        Some(_) => Err(()),
    }
}

/// Scans the comma-separated `Connection` header for a token.
pub(crate) fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    for value in headers.get_all(CONNECTION) {
        if let Ok(text) = value.to_str() {
            for opt in text.split(',') {
                if opt.trim().eq_ignore_ascii_case(token) {
                    return true;
                }
            }
        }
    }
    false
}

pub(crate) fn set_server_if_absent(headers: &mut HeaderMap) {
    headers
        .entry(http::header::SERVER)
        .or_insert_with(|| HeaderValue::from_static(SERVER_NAME));
}

pub(crate) fn set_date_if_absent(headers: &mut HeaderMap) {
    headers.entry(http::header::DATE).or_insert_with(|| {
        let mut buf = BytesMut::with_capacity(29);
        buf.extend_from_slice(httpdate::fmt_http_date(std::time::SystemTime::now()).as_bytes());
        HeaderValue::from_maybe_shared(buf.freeze()).expect("date is valid header value")
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn content_length_repeated_same_ok() {
        let map = headers(&[("content-length", "5"), ("content-length", "5")]);
        assert_eq!(content_length_parse_all(&map), Ok(Some(5)));
    }

    #[test]
    fn content_length_disagreement_rejected() {
        let map = headers(&[("content-length", "10"), ("content-length", "11")]);
        assert!(content_length_parse_all(&map).is_err());
    }

    #[test]
    fn content_length_garbage_rejected() {
        let map = headers(&[("content-length", "ten")]);
        assert!(content_length_parse_all(&map).is_err());
    }

    #[test]
    fn transfer_encoding_chunked_final() {
        let map = headers(&[("transfer-encoding", "gzip, chunked")]);
        assert_eq!(transfer_encoding_is_chunked(&map), Ok(true));
    }

    #[test]
    fn transfer_encoding_not_final_rejected() {
        let map = headers(&[("transfer-encoding", "gzip")]);
        assert!(transfer_encoding_is_chunked(&map).is_err());
    }

    #[test]
    fn connection_token_scan() {
        let map = headers(&[("connection", "Upgrade, Keep-Alive")]);
        assert!(connection_has(&map, "upgrade"));
        assert!(connection_has(&map, "keep-alive"));
        assert!(!connection_has(&map, "close"));
    }
}
