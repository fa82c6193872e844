//! HTTP/2 frame codec: the 9-byte header and each typed frame.

mod data;
mod go_away;
mod head;
mod headers;
mod ping;
mod priority;
mod reset;
mod settings;
mod window_update;

pub(crate) use self::data::Data;
pub(crate) use self::go_away::GoAway;
pub(crate) use self::head::{Head, Kind};
pub(crate) use self::headers::{Continuation, Headers};
pub(crate) use self::ping::Ping;
pub(crate) use self::priority::Priority;
pub(crate) use self::reset::Reset;
pub(crate) use self::settings::Settings;
pub(crate) use self::window_update::WindowUpdate;

/// The fixed frame-header length.
pub(crate) const HEADER_LEN: usize = 9;

// Frame flags.
pub(crate) const ACK: u8 = 0x1;
pub(crate) const END_STREAM: u8 = 0x1;
pub(crate) const END_HEADERS: u8 = 0x4;
pub(crate) const PADDED: u8 = 0x8;
pub(crate) const PRIORITY: u8 = 0x20;

/// The connection preface every HTTP/2 client starts with.
pub(crate) const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default SETTINGS_MAX_FRAME_SIZE.
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Default SETTINGS_INITIAL_WINDOW_SIZE.
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Default SETTINGS_HEADER_TABLE_SIZE.
pub(crate) const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;

/// Strips the padding declared by a PADDED frame.
///
/// The pad length octet and trailing padding both count against flow
/// control, but the content handed up excludes them.
pub(crate) fn strip_padding(payload: &mut bytes::Bytes) -> Result<(), crate::Error> {
    use crate::error::Error;
    use crate::proto::h2::Reason;

    if payload.is_empty() {
        return Err(Error::new_h2_connection(
            Reason::PROTOCOL_ERROR,
            "padded frame missing pad length",
        ));
    }
    let pad_len = payload[0] as usize;
    let _ = payload.split_to(1);
    if pad_len > payload.len() {
        return Err(Error::new_h2_connection(
            Reason::PROTOCOL_ERROR,
            "frame padding exceeds payload",
        ));
    }
    let keep = payload.len() - pad_len;
    payload.truncate(keep);
    Ok(())
}
