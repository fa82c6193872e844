//! The TCP connection provider.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use super::accept::Accept;
use crate::error::Error;

/// A stream of inbound TCP connections.
pub struct TcpIncoming {
    listener: TcpListener,
    nodelay: bool,
}

impl TcpIncoming {
    /// Binds a listening socket.
    pub async fn bind(addr: SocketAddr) -> crate::Result<TcpIncoming> {
        let listener = TcpListener::bind(addr).await.map_err(Error::new_accept)?;
        Ok(TcpIncoming::from_listener(listener))
    }

    pub fn from_listener(listener: TcpListener) -> TcpIncoming {
        TcpIncoming {
            listener,
            nodelay: true,
        }
    }

    /// Whether `TCP_NODELAY` is applied to accepted connections.
    pub fn set_nodelay(&mut self, enabled: bool) -> &mut Self {
        self.nodelay = enabled;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Accept for TcpIncoming {
    type Conn = TcpStream;

    fn poll_accept(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Self::Conn>>> {
        let this = self.get_mut();
        match this.listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, remote))) => {
                trace!("accepted connection from {}", remote);
                if this.nodelay {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed: {}", err);
                    }
                }
                Poll::Ready(Some(Ok(stream)))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}
