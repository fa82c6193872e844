use bytes::{Bytes, BytesMut};

use crate::error::Error;
use crate::proto::h2::Reason;

use super::{strip_padding, Head, Kind, END_HEADERS, END_STREAM, PADDED, PRIORITY};

/// A HEADERS frame (RFC 7540 §6.2) carrying a header-block fragment.
#[derive(Debug)]
pub(crate) struct Headers {
    pub(crate) stream_id: u32,
    pub(crate) fragment: Bytes,
    pub(crate) end_stream: bool,
    pub(crate) end_headers: bool,
    /// Weight from the optional priority fields, already `+1` adjusted.
    pub(crate) weight: Option<u16>,
}

impl Headers {
    pub(crate) fn parse(head: Head, mut payload: Bytes) -> crate::Result<Headers> {
        if head.stream_id == 0 {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "HEADERS frame on stream 0",
            ));
        }
        if head.is_flag(PADDED) {
            strip_padding(&mut payload)?;
        }
        let weight = if head.is_flag(PRIORITY) {
            if payload.len() < 5 {
                return Err(Error::new_h2_connection(
                    Reason::FRAME_SIZE_ERROR,
                    "HEADERS priority fields truncated",
                ));
            }
            let dependency = u32::from_be_bytes([
                payload[0] & 0x7f,
                payload[1],
                payload[2],
                payload[3],
            ]);
            if dependency == head.stream_id {
                return Err(Error::new_h2_connection(
                    Reason::PROTOCOL_ERROR,
                    "stream depends on itself",
                ));
            }
            let weight = payload[4] as u16 + 1;
            let _ = payload.split_to(5);
            Some(weight)
        } else {
            None
        };
        Ok(Headers {
            stream_id: head.stream_id,
            fragment: payload,
            end_stream: head.is_flag(END_STREAM),
            end_headers: head.is_flag(END_HEADERS),
            weight,
        })
    }

    /// Encodes one HEADERS frame; `fragment` must already fit the peer's
    /// max frame size (the writer splits into CONTINUATION frames).
    pub(crate) fn encode_block(
        stream_id: u32,
        fragment: &[u8],
        end_stream: bool,
        end_headers: bool,
        dst: &mut BytesMut,
    ) {
        let mut flag = 0;
        if end_stream {
            flag |= END_STREAM;
        }
        if end_headers {
            flag |= END_HEADERS;
        }
        Head::new(Kind::Headers, flag, stream_id).encode(fragment.len(), dst);
        dst.extend_from_slice(fragment);
    }
}

/// A CONTINUATION frame (RFC 7540 §6.10).
#[derive(Debug)]
pub(crate) struct Continuation {
    pub(crate) stream_id: u32,
    pub(crate) fragment: Bytes,
    pub(crate) end_headers: bool,
}

impl Continuation {
    pub(crate) fn parse(head: Head, payload: Bytes) -> crate::Result<Continuation> {
        if head.stream_id == 0 {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "CONTINUATION frame on stream 0",
            ));
        }
        Ok(Continuation {
            stream_id: head.stream_id,
            fragment: payload,
            end_headers: head.is_flag(END_HEADERS),
        })
    }

    pub(crate) fn encode_block(
        stream_id: u32,
        fragment: &[u8],
        end_headers: bool,
        dst: &mut BytesMut,
    ) {
        let flag = if end_headers { END_HEADERS } else { 0 };
        Head::new(Kind::Continuation, flag, stream_id).encode(fragment.len(), dst);
        dst.extend_from_slice(fragment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flags() {
        let head = Head::new(Kind::Headers, END_HEADERS | END_STREAM, 1);
        let headers = Headers::parse(head, Bytes::from_static(b"\x82")).unwrap();
        assert!(headers.end_headers);
        assert!(headers.end_stream);
        assert_eq!(headers.weight, None);
        assert_eq!(headers.fragment, &b"\x82"[..]);
    }

    #[test]
    fn parse_priority_fields() {
        // exclusive bit + dependency 3, weight octet 15 -> weight 16
        let head = Head::new(Kind::Headers, END_HEADERS | PRIORITY, 5);
        let payload = Bytes::from_static(&[0x80, 0, 0, 3, 15, 0x82]);
        let headers = Headers::parse(head, payload).unwrap();
        assert_eq!(headers.weight, Some(16));
        assert_eq!(headers.fragment, &b"\x82"[..]);
    }

    #[test]
    fn parse_self_dependency_rejected() {
        let head = Head::new(Kind::Headers, PRIORITY, 5);
        let payload = Bytes::from_static(&[0, 0, 0, 5, 15]);
        let err = Headers::parse(head, payload).unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::PROTOCOL_ERROR));
    }
}
