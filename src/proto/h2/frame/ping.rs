use bytes::{Bytes, BytesMut};

use crate::error::Error;
use crate::proto::h2::Reason;

use super::{Head, Kind, ACK};

/// A PING frame (RFC 7540 §6.7).
#[derive(Debug)]
pub(crate) struct Ping {
    pub(crate) ack: bool,
    pub(crate) payload: [u8; 8],
}

impl Ping {
    pub(crate) fn pong(payload: [u8; 8]) -> Ping {
        Ping { ack: true, payload }
    }

    pub(crate) fn parse(head: Head, payload: Bytes) -> crate::Result<Ping> {
        if head.stream_id != 0 {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "PING frame on a stream",
            ));
        }
        if payload.len() != 8 {
            return Err(Error::new_h2_connection(
                Reason::FRAME_SIZE_ERROR,
                "PING frame must be 8 bytes",
            ));
        }
        let mut opaque = [0u8; 8];
        opaque.copy_from_slice(&payload);
        Ok(Ping {
            ack: head.is_flag(ACK),
            payload: opaque,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let flag = if self.ack { ACK } else { 0 };
        Head::new(Kind::Ping, flag, 0).encode(8, dst);
        dst.extend_from_slice(&self.payload);
    }
}
