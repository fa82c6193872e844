use bytes::Bytes;

use crate::error::Error;
use crate::proto::h2::Reason;

use super::Head;

/// A PRIORITY frame (RFC 7540 §6.3).
#[derive(Debug)]
pub(crate) struct Priority {
    pub(crate) stream_id: u32,
    pub(crate) dependency: u32,
    pub(crate) exclusive: bool,
    /// On-wire octet plus one, so the range is 1..=256.
    pub(crate) weight: u16,
}

impl Priority {
    pub(crate) fn parse(head: Head, payload: Bytes) -> crate::Result<Priority> {
        if head.stream_id == 0 {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "PRIORITY frame on stream 0",
            ));
        }
        if payload.len() != 5 {
            return Err(Error::new_h2_connection(
                Reason::FRAME_SIZE_ERROR,
                "PRIORITY frame must be 5 bytes",
            ));
        }
        let dependency =
            u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);
        if dependency == head.stream_id {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "stream depends on itself",
            ));
        }
        Ok(Priority {
            stream_id: head.stream_id,
            dependency,
            exclusive: payload[0] & 0x80 != 0,
            weight: payload[4] as u16 + 1,
        })
    }
}
