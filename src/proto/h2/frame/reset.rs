use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::proto::h2::Reason;

use super::{Head, Kind};

/// A RST_STREAM frame (RFC 7540 §6.4).
#[derive(Debug)]
pub(crate) struct Reset {
    pub(crate) stream_id: u32,
    pub(crate) error_code: Reason,
}

impl Reset {
    pub(crate) fn new(stream_id: u32, error_code: Reason) -> Reset {
        Reset {
            stream_id,
            error_code,
        }
    }

    pub(crate) fn parse(head: Head, payload: Bytes) -> crate::Result<Reset> {
        if head.stream_id == 0 {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "RST_STREAM frame on stream 0",
            ));
        }
        if payload.len() != 4 {
            return Err(Error::new_h2_connection(
                Reason::FRAME_SIZE_ERROR,
                "RST_STREAM frame must be 4 bytes",
            ));
        }
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(Reset {
            stream_id: head.stream_id,
            error_code: Reason::from(code),
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        Head::new(Kind::Reset, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.error_code.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut buf = BytesMut::new();
        Reset::new(9, Reason::REFUSED_STREAM).encode(&mut buf);
        let head = Head::parse(&buf);
        let payload = Bytes::copy_from_slice(&buf[super::super::HEADER_LEN..]);
        let reset = Reset::parse(head, payload).unwrap();
        assert_eq!(reset.stream_id, 9);
        assert_eq!(reset.error_code, Reason::REFUSED_STREAM);
    }
}
