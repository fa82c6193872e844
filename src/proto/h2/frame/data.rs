use bytes::{Bytes, BytesMut};

use crate::error::Error;
use crate::proto::h2::Reason;

use super::{strip_padding, Head, Kind, END_STREAM, PADDED};

/// A DATA frame (RFC 7540 §6.1).
#[derive(Debug)]
pub(crate) struct Data {
    pub(crate) stream_id: u32,
    pub(crate) data: Bytes,
    pub(crate) end_stream: bool,
    /// The on-wire payload length including any padding; this is what
    /// flow control accounts for.
    pub(crate) flow_len: u32,
}

impl Data {
    pub(crate) fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Data {
        let flow_len = data.len() as u32;
        Data {
            stream_id,
            data,
            end_stream,
            flow_len,
        }
    }

    pub(crate) fn parse(head: Head, mut payload: Bytes) -> crate::Result<Data> {
        if head.stream_id == 0 {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "DATA frame on stream 0",
            ));
        }
        let flow_len = payload.len() as u32;
        if head.is_flag(PADDED) {
            strip_padding(&mut payload)?;
        }
        Ok(Data {
            stream_id: head.stream_id,
            data: payload,
            end_stream: head.is_flag(END_STREAM),
            flow_len,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let flag = if self.end_stream { END_STREAM } else { 0 };
        Head::new(Kind::Data, flag, self.stream_id).encode(self.data.len(), dst);
        dst.extend_from_slice(&self.data);
    }
}
