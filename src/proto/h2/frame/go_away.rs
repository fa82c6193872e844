use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::proto::h2::Reason;

use super::{Head, Kind};

/// A GOAWAY frame (RFC 7540 §6.8).
#[derive(Debug)]
pub(crate) struct GoAway {
    pub(crate) last_stream_id: u32,
    pub(crate) error_code: Reason,
    pub(crate) debug_data: Bytes,
}

impl GoAway {
    pub(crate) fn new(last_stream_id: u32, error_code: Reason) -> GoAway {
        GoAway {
            last_stream_id,
            error_code,
            debug_data: Bytes::new(),
        }
    }

    pub(crate) fn parse(head: Head, mut payload: Bytes) -> crate::Result<GoAway> {
        if head.stream_id != 0 {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "GOAWAY frame on a stream",
            ));
        }
        if payload.len() < 8 {
            return Err(Error::new_h2_connection(
                Reason::FRAME_SIZE_ERROR,
                "GOAWAY frame shorter than 8 bytes",
            ));
        }
        let last_stream_id = u32::from_be_bytes([
            payload[0] & 0x7f,
            payload[1],
            payload[2],
            payload[3],
        ]);
        let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let _ = payload.split_to(8);
        Ok(GoAway {
            last_stream_id,
            error_code: Reason::from(code),
            debug_data: payload,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        Head::new(Kind::GoAway, 0, 0).encode(8 + self.debug_data.len(), dst);
        dst.put_u32(self.last_stream_id & 0x7fff_ffff);
        dst.put_u32(self.error_code.into());
        dst.extend_from_slice(&self.debug_data);
    }
}
