//! Per-connection protocol handlers and the version switch.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace, warn};

use crate::common::exec::{Exec, Executor};
use crate::common::rewind::Rewind;
use crate::common::{BoxIo, Io};
use crate::error::Error;
use crate::proto::h1::conn::{self as h1, Deed};
use crate::proto::h1::Http1Config;
use crate::proto::h2::frame::PREFACE;
use crate::proto::h2::{session, Http2Config};
use crate::service::HttpService;

/// A protocol handler for a delegated (`Upgrade`d) connection.
///
/// Receives the live byte stream along with any bytes already read past
/// the upgrade response.
pub trait UpgradeHandler: Send + Sync {
    fn handle(&self, io: BoxIo, read_buf: Bytes) -> BoxFuture<'static, crate::Result<()>>;
}

/// Serves single connections: HTTP/1.1, HTTP/2, or sniffed.
///
/// The version switch peeks at most 24 bytes: when they spell the HTTP/2
/// connection preface the stream goes to the HTTP/2 session, otherwise
/// to the HTTP/1.1 loop; either way the handler observes the stream from
/// its first byte.
#[derive(Clone)]
pub struct Http {
    h1: Http1Config,
    h2: Http2Config,
    exec: Exec,
    upgrades: HashMap<String, Arc<dyn UpgradeHandler>>,
}

impl Http {
    pub fn new() -> Http {
        Http {
            h1: Http1Config::default(),
            h2: Http2Config::default(),
            exec: Exec::Default,
            upgrades: HashMap::new(),
        }
    }

    /// Cap on the HTTP/1.1 request head; overflow is answered with 431.
    pub fn http1_max_headers_size(&mut self, max: usize) -> &mut Self {
        self.h1.max_headers_size = max;
        self
    }

    /// Enables or disables HTTP/1.1 connection reuse.
    pub fn http1_keep_alive(&mut self, enabled: bool) -> &mut Self {
        self.h1.keep_alive = enabled;
        self
    }

    pub fn http2_max_concurrent_streams(&mut self, max: u32) -> &mut Self {
        self.h2.max_concurrent_streams = max;
        self
    }

    pub fn http2_initial_window_size(&mut self, size: u32) -> &mut Self {
        self.h2.initial_window_size = size;
        self
    }

    pub fn http2_max_frame_size(&mut self, size: u32) -> &mut Self {
        self.h2.max_frame_size = size;
        self
    }

    pub fn http2_max_header_list_size(&mut self, size: u32) -> &mut Self {
        self.h2.max_header_list_size = size;
        self
    }

    /// Supplies an executor for handler tasks instead of `tokio::spawn`.
    pub fn with_executor<E>(&mut self, exec: E) -> &mut Self
    where
        E: Executor<crate::common::exec::BoxSendFuture> + Send + Sync + 'static,
    {
        self.exec = Exec::Executor(Arc::new(exec));
        self
    }

    /// Registers a handler for `Upgrade: <protocol>` delegations; `h2c`
    /// is built in.
    pub fn upgrade_handler<H>(&mut self, protocol: &str, handler: H) -> &mut Self
    where
        H: UpgradeHandler + 'static,
    {
        self.upgrades
            .insert(protocol.to_ascii_lowercase(), Arc::new(handler));
        self
    }

    pub(crate) fn exec(&self) -> Exec {
        self.exec.clone()
    }

    /// Serves a connection, sniffing the protocol from its first bytes.
    pub async fn serve_connection<T>(
        &self,
        io: T,
        service: Arc<HttpService>,
    ) -> crate::Result<()>
    where
        T: Io + 'static,
    {
        let mut io = io;
        let mut peeked = BytesMut::with_capacity(PREFACE.len());

        // First probe: 12 bytes decide whether this can be a preface at
        // all; every HTTP/1.1 request has at least that much head.
        while peeked.len() < 12 {
            match io.read_buf(&mut peeked).await {
                Ok(0) => break,
                Ok(_) => (),
                Err(err) => return Err(Error::new_io(err)),
            }
        }

        if peeked.len() >= 12 && peeked[..12] == PREFACE[..12] {
            while peeked.len() < PREFACE.len() {
                match io.read_buf(&mut peeked).await {
                    Ok(0) => break,
                    Ok(_) => (),
                    Err(err) => return Err(Error::new_io(err)),
                }
            }
            if peeked.len() >= PREFACE.len() && peeked[..PREFACE.len()] == PREFACE[..] {
                trace!("connection preface matched, switching to http2");
                // The session re-reads the preface itself, so the probe
                // is rewound rather than consumed.
                let io = rewound(io, peeked.freeze());
                return session::serve(io, service, &self.h2, self.exec.clone(), None)
                    .await;
            }
        }

        if peeked.is_empty() {
            return Ok(());
        }
        let io = rewound(io, peeked.freeze());
        self.serve_http1_io(io, service).await
    }

    /// Serves a connection as HTTP/1.1 without sniffing.
    pub async fn serve_http1<T>(&self, io: T, service: Arc<HttpService>) -> crate::Result<()>
    where
        T: Io + 'static,
    {
        self.serve_http1_io(Box::new(io), service).await
    }

    /// Serves a connection as HTTP/2 without sniffing; the client must
    /// still send the connection preface.
    pub async fn serve_http2<T>(&self, io: T, service: Arc<HttpService>) -> crate::Result<()>
    where
        T: Io + 'static,
    {
        session::serve(Box::new(io), service, &self.h2, self.exec.clone(), None).await
    }

    async fn serve_http1_io(&self, io: BoxIo, service: Arc<HttpService>) -> crate::Result<()> {
        match h1::serve(io, service.clone(), &self.h1).await? {
            Deed::Closed => Ok(()),
            Deed::Delegated(delegation) => {
                let protocol = delegation.protocol.to_ascii_lowercase();
                debug!("connection delegated to {:?}", protocol);
                if protocol == "h2c" {
                    let seeded = delegation.h2_settings.as_ref().and_then(decode_h2_settings);
                    let io = rewound_box(delegation.io, delegation.read_buf);
                    return session::serve(io, service, &self.h2, self.exec.clone(), seeded)
                        .await;
                }
                match self.upgrades.get(&protocol) {
                    Some(handler) => {
                        handler.handle(delegation.io, delegation.read_buf).await
                    }
                    None => {
                        debug!("no upgrade handler for {:?}, closing", protocol);
                        Ok(())
                    }
                }
            }
        }
    }
}

impl Default for Http {
    fn default() -> Http {
        Http::new()
    }
}

fn rewound<T: Io + 'static>(io: T, buf: Bytes) -> BoxIo {
    rewound_box(Box::new(io), buf)
}

fn rewound_box(io: BoxIo, buf: Bytes) -> BoxIo {
    if buf.is_empty() {
        io
    } else {
        Box::new(Rewind::new_buffered(io, buf))
    }
}

/// Decodes the base64url `HTTP2-Settings` header payload.
fn decode_h2_settings(raw: &Bytes) -> Option<Bytes> {
    match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(raw.as_ref()) {
        Ok(payload) => Some(Bytes::from(payload)),
        Err(err) => {
            warn!("discarding malformed HTTP2-Settings header: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_header_is_base64url() {
        // SETTINGS_MAX_CONCURRENT_STREAMS = 0x64
        let raw = Bytes::from_static(b"AAMAAABk");
        let decoded = decode_h2_settings(&raw).unwrap();
        assert_eq!(&decoded[..], &[0x00, 0x03, 0x00, 0x00, 0x00, 0x64]);
        assert!(decode_h2_settings(&Bytes::from_static(b"!!!")).is_none());
    }
}
