use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::proto::h2::Reason;

use super::{Head, Kind, ACK};

/// The six SETTINGS parameters of RFC 7540 §6.5.2.
const HEADER_TABLE_SIZE: u16 = 1;
const ENABLE_PUSH: u16 = 2;
const MAX_CONCURRENT_STREAMS: u16 = 3;
const INITIAL_WINDOW_SIZE: u16 = 4;
const MAX_FRAME_SIZE: u16 = 5;
const MAX_HEADER_LIST_SIZE: u16 = 6;

/// A SETTINGS frame: the parameters present on the wire.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Settings {
    pub(crate) ack: bool,
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<u32>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Settings {
    pub(crate) fn ack() -> Settings {
        Settings {
            ack: true,
            ..Settings::default()
        }
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.ack
    }

    pub(crate) fn parse(head: Head, payload: Bytes) -> crate::Result<Settings> {
        if head.stream_id != 0 {
            return Err(Error::new_h2_connection(
                Reason::PROTOCOL_ERROR,
                "SETTINGS frame on a stream",
            ));
        }
        if head.is_flag(ACK) {
            if !payload.is_empty() {
                return Err(Error::new_h2_connection(
                    Reason::FRAME_SIZE_ERROR,
                    "SETTINGS ack with payload",
                ));
            }
            return Ok(Settings::ack());
        }
        if payload.len() % 6 != 0 {
            return Err(Error::new_h2_connection(
                Reason::FRAME_SIZE_ERROR,
                "SETTINGS payload not a multiple of 6",
            ));
        }
        Settings::parse_payload(&payload)
    }

    /// Parses a bare settings payload, as also carried by the
    /// `HTTP2-Settings` header during an h2c upgrade.
    pub(crate) fn parse_payload(payload: &[u8]) -> crate::Result<Settings> {
        let mut settings = Settings::default();
        for entry in payload.chunks_exact(6) {
            let ident = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match ident {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(Error::new_h2_connection(
                            Reason::PROTOCOL_ERROR,
                            "SETTINGS_ENABLE_PUSH out of range",
                        ));
                    }
                    settings.enable_push = Some(value);
                }
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > 0x7fff_ffff {
                        return Err(Error::new_h2_connection(
                            Reason::FLOW_CONTROL_ERROR,
                            "SETTINGS_INITIAL_WINDOW_SIZE out of range",
                        ));
                    }
                    settings.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err(Error::new_h2_connection(
                            Reason::PROTOCOL_ERROR,
                            "SETTINGS_MAX_FRAME_SIZE out of range",
                        ));
                    }
                    settings.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                // Unknown parameters must be ignored.
                _ => (),
            }
        }
        Ok(settings)
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let flag = if self.ack { ACK } else { 0 };
        let entries = [
            (HEADER_TABLE_SIZE, self.header_table_size),
            (ENABLE_PUSH, self.enable_push),
            (MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (INITIAL_WINDOW_SIZE, self.initial_window_size),
            (MAX_FRAME_SIZE, self.max_frame_size),
            (MAX_HEADER_LIST_SIZE, self.max_header_list_size),
        ];
        let len = entries.iter().filter(|(_, v)| v.is_some()).count() * 6;
        Head::new(Kind::Settings, flag, 0).encode(len, dst);
        for (ident, value) in entries {
            if let Some(value) = value {
                dst.put_u16(ident);
                dst.put_u32(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let settings = Settings {
            ack: false,
            header_table_size: Some(4096),
            enable_push: Some(0),
            max_concurrent_streams: Some(128),
            initial_window_size: Some(65_535),
            max_frame_size: Some(16_384),
            max_header_list_size: None,
        };
        let mut buf = BytesMut::new();
        settings.encode(&mut buf);

        let head = Head::parse(&buf);
        assert_eq!(head.length as usize, 5 * 6);
        let payload = Bytes::copy_from_slice(&buf[super::super::HEADER_LEN..]);
        let parsed = Settings::parse(head, payload).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn ack_with_payload_rejected() {
        let head = Head::new(Kind::Settings, ACK, 0);
        let err = Settings::parse(head, Bytes::from_static(&[0; 6])).unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::FRAME_SIZE_ERROR));
    }

    #[test]
    fn non_zero_stream_rejected() {
        let head = Head::new(Kind::Settings, 0, 3);
        let err = Settings::parse(head, Bytes::new()).unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::PROTOCOL_ERROR));
    }

    #[test]
    fn ragged_payload_rejected() {
        let head = Head::new(Kind::Settings, 0, 0);
        let err = Settings::parse(head, Bytes::from_static(&[0; 5])).unwrap_err();
        assert_eq!(err.h2_reason(), Some(Reason::FRAME_SIZE_ERROR));
    }

    #[test]
    fn clamp_violations() {
        // ENABLE_PUSH must be 0 or 1
        let raw = [0, 2, 0, 0, 0, 2];
        assert!(Settings::parse_payload(&raw).is_err());
        // INITIAL_WINDOW_SIZE must fit in 31 bits
        let raw = [0, 4, 0x80, 0, 0, 0];
        assert!(Settings::parse_payload(&raw).is_err());
        // MAX_FRAME_SIZE must be >= 16384
        let raw = [0, 5, 0, 0, 0x3f, 0xff];
        assert!(Settings::parse_payload(&raw).is_err());
    }

    #[test]
    fn unknown_parameters_ignored() {
        let raw = [0, 9, 0, 0, 0, 1];
        let settings = Settings::parse_payload(&raw).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
