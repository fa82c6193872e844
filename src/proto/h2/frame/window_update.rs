use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::proto::h2::Reason;

use super::{Head, Kind};

/// A WINDOW_UPDATE frame (RFC 7540 §6.9).
///
/// `stream_id == 0` addresses the connection window.
#[derive(Debug)]
pub(crate) struct WindowUpdate {
    pub(crate) stream_id: u32,
    pub(crate) increment: u32,
}

impl WindowUpdate {
    pub(crate) fn new(stream_id: u32, increment: u32) -> WindowUpdate {
        WindowUpdate {
            stream_id,
            increment,
        }
    }

    pub(crate) fn parse(head: Head, payload: Bytes) -> crate::Result<WindowUpdate> {
        if payload.len() != 4 {
            return Err(Error::new_h2_connection(
                Reason::FRAME_SIZE_ERROR,
                "WINDOW_UPDATE frame must be 4 bytes",
            ));
        }
        let increment = u32::from_be_bytes([
            payload[0] & 0x7f,
            payload[1],
            payload[2],
            payload[3],
        ]);
        Ok(WindowUpdate {
            stream_id: head.stream_id,
            increment,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        Head::new(Kind::WindowUpdate, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.increment & 0x7fff_ffff);
    }
}
