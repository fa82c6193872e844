//! The server: accept loop plus per-connection dispatch.

pub mod accept;
pub mod conn;
pub mod tcp;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::poll_fn;
use tracing::{debug, warn};

use self::accept::Accept;
use self::conn::Http;
use self::tcp::TcpIncoming;
use crate::service::HttpService;

/// A listening server: an [`Accept`] source feeding the protocol
/// handlers of [`conn::Http`].
///
/// ```no_run
/// # async fn run() -> trellis::Result<()> {
/// use std::sync::Arc;
/// use http::Method;
/// use trellis::{Body, HttpService, Request, Response, Server};
///
/// let service = HttpService::builder()
///     .endpoint(Method::GET, "/", |_req: Request| async {
///         Ok::<_, trellis::Error>(Response::new(Body::from("hi")))
///     })
///     .build();
///
/// Server::bind("127.0.0.1:8000".parse().unwrap())
///     .await?
///     .serve(Arc::new(service))
///     .await
/// # }
/// ```
pub struct Server;

impl Server {
    /// Binds a TCP listener and returns a [`Builder`].
    pub async fn bind(addr: SocketAddr) -> crate::Result<Builder<TcpIncoming>> {
        Ok(Server::builder(TcpIncoming::bind(addr).await?))
    }

    /// Builds a server over any connection provider.
    pub fn builder<A: Accept>(incoming: A) -> Builder<A> {
        Builder {
            incoming,
            http: Http::new(),
        }
    }
}

/// Configures and runs the accept loop.
pub struct Builder<A> {
    incoming: A,
    http: Http,
}

impl<A> Builder<A>
where
    A: Accept + Unpin,
    A::Conn: 'static,
{
    /// Access to the per-connection protocol configuration.
    pub fn http(&mut self) -> &mut Http {
        &mut self.http
    }

    pub fn local_addr(&self) -> Option<SocketAddr>
    where
        A: LocalAddr,
    {
        self.incoming.local_addr()
    }

    /// Accepts connections until the provider stops, spawning one task
    /// per connection.
    pub async fn serve(self, service: Arc<HttpService>) -> crate::Result<()> {
        let Builder { mut incoming, http } = self;
        loop {
            let conn =
                poll_fn(|cx| Pin::new(&mut incoming).poll_accept(cx)).await;
            match conn {
                None => {
                    debug!("connection provider stopped");
                    return Ok(());
                }
                Some(Err(err)) => {
                    warn!("accept error: {}", err);
                }
                Some(Ok(io)) => {
                    let http = http.clone();
                    let service = service.clone();
                    let exec = http.exec();
                    exec.execute(async move {
                        if let Err(err) = http.serve_connection(io, service).await {
                            debug!("connection error: {}", err);
                        }
                    });
                }
            }
        }
    }
}

/// Providers that know their bound address.
pub trait LocalAddr {
    fn local_addr(&self) -> Option<SocketAddr>;
}

impl LocalAddr for TcpIncoming {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpIncoming::local_addr(self).ok()
    }
}
