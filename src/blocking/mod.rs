//! The blocking HTTP/1.1 server: one OS thread per connection.
//!
//! The same parsing, routing, interceptor and serialization core as the
//! async handler, driven by blocking reads and writes. Endpoints are
//! plain synchronous functions.

pub(crate) mod conn;
pub(crate) mod io;

pub use self::io::Conn;

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;

use http::Method;
use tracing::{debug, warn};

use crate::error::Error;
use crate::headers;
use crate::proto::h1::Http1Config;
use crate::router::Router;
use crate::service::{
    DefaultErrorHandler, ErrorHandler, RequestInterceptor, ResponseInterceptor,
};
use crate::{Request, Response};

/// A synchronous application endpoint.
pub trait BlockingEndpoint: Send + Sync + 'static {
    fn call(&self, req: Request) -> crate::Result<Response>;
}

impl<F> BlockingEndpoint for F
where
    F: Fn(Request) -> crate::Result<Response> + Send + Sync + 'static,
{
    fn call(&self, req: Request) -> crate::Result<Response> {
        (self)(req)
    }
}

/// The synchronous request pipeline; mirrors
/// [`HttpService`](crate::HttpService) with blocking endpoints.
pub struct BlockingHttpService {
    router: Router<dyn BlockingEndpoint>,
    request_interceptors: Vec<Box<dyn RequestInterceptor>>,
    response_interceptors: Vec<Box<dyn ResponseInterceptor>>,
    error_handler: Box<dyn ErrorHandler>,
}

impl BlockingHttpService {
    pub fn builder() -> BlockingBuilder {
        BlockingBuilder {
            router: Router::new(),
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
            error_handler: None,
        }
    }

    pub fn handle(&self, req: Request) -> Response {
        match self.dispatch(req) {
            Ok(res) => res,
            Err(err) => self.render_error(&err),
        }
    }

    pub(crate) fn render_error(&self, error: &Error) -> Response {
        let mut res = self.error_handler.handle(error);
        headers::set_server_if_absent(res.headers_mut());
        res
    }

    fn dispatch(&self, mut req: Request) -> crate::Result<Response> {
        for interceptor in &self.request_interceptors {
            if let Some(res) = interceptor.intercept(&mut req)? {
                return self.outbound(res);
            }
        }
        let (endpoint, params) = self
            .router
            .lookup(req.method(), req.uri().path())
            .ok_or_else(Error::new_route_not_found)?;
        req.extensions_mut().insert(params);
        let res = endpoint.call(req)?;
        self.outbound(res)
    }

    fn outbound(&self, mut res: Response) -> crate::Result<Response> {
        for interceptor in &self.response_interceptors {
            res = interceptor.intercept(res)?;
        }
        headers::set_server_if_absent(res.headers_mut());
        Ok(res)
    }
}

/// Builds a [`BlockingHttpService`].
pub struct BlockingBuilder {
    router: Router<dyn BlockingEndpoint>,
    request_interceptors: Vec<Box<dyn RequestInterceptor>>,
    response_interceptors: Vec<Box<dyn ResponseInterceptor>>,
    error_handler: Option<Box<dyn ErrorHandler>>,
}

impl BlockingBuilder {
    pub fn endpoint<E: BlockingEndpoint>(
        mut self,
        method: Method,
        pattern: &str,
        endpoint: E,
    ) -> BlockingBuilder {
        self.router.route(method, pattern, Arc::new(endpoint));
        self
    }

    pub fn request_interceptor<I: RequestInterceptor + 'static>(mut self, i: I) -> BlockingBuilder {
        self.request_interceptors.push(Box::new(i));
        self
    }

    pub fn response_interceptor<I: ResponseInterceptor + 'static>(
        mut self,
        i: I,
    ) -> BlockingBuilder {
        self.response_interceptors.push(Box::new(i));
        self
    }

    pub fn error_handler<H: ErrorHandler + 'static>(mut self, handler: H) -> BlockingBuilder {
        self.error_handler = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> BlockingHttpService {
        BlockingHttpService {
            router: self.router,
            request_interceptors: self.request_interceptors,
            response_interceptors: self.response_interceptors,
            error_handler: self
                .error_handler
                .unwrap_or_else(|| Box::new(DefaultErrorHandler)),
        }
    }
}

/// The thread-per-connection server.
pub struct Server {
    addr: Vec<SocketAddr>,
    config: Http1Config,
    pin_threads: bool,
}

impl Server {
    /// Prepares a server for the given address.
    ///
    /// # Panics
    ///
    /// Panics when the address fails to resolve.
    pub fn bind(addr: impl ToSocketAddrs) -> Server {
        Server {
            addr: addr
                .to_socket_addrs()
                .expect("failed to resolve bind address")
                .collect(),
            config: Http1Config::default(),
            pin_threads: false,
        }
    }

    pub fn max_headers_size(mut self, max: usize) -> Server {
        self.config.max_headers_size = max;
        self
    }

    pub fn keep_alive(mut self, enabled: bool) -> Server {
        self.config.keep_alive = enabled;
        self
    }

    /// Pins connection threads round-robin onto the available cores.
    pub fn pin_threads(mut self, enabled: bool) -> Server {
        self.pin_threads = enabled;
        self
    }

    /// Accepts connections forever, one thread per connection.
    pub fn serve(self, service: BlockingHttpService) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr.as_slice())?;
        self.serve_on(listener, service)
    }

    /// Like [`serve`](Server::serve) over an existing listener.
    pub fn serve_on(
        self,
        listener: TcpListener,
        service: BlockingHttpService,
    ) -> std::io::Result<()> {
        let service = Arc::new(service);
        let cores = num_cpus::get();
        let mut accepted: usize = 0;

        for conn in listener.incoming() {
            let stream = match conn {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept error: {}", err);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let service = service.clone();
            let config = self.config.clone();
            let core = if self.pin_threads {
                Some(accepted % cores)
            } else {
                None
            };
            accepted += 1;

            let spawned = std::thread::Builder::new()
                .name(format!("trellis-conn-{}", accepted))
                .spawn(move || {
                    if let Some(core) = core {
                        pin_to_core(core);
                    }
                    conn::serve(Box::new(stream), &service, &config);
                });
            if let Err(err) = spawned {
                debug!("failed to spawn connection thread: {}", err);
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            debug!("sched_setaffinity({}) failed", core);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use http::StatusCode;

    #[test]
    fn blocking_service_routes() {
        let service = BlockingHttpService::builder()
            .endpoint(Method::GET, "/ping", |_req: Request| {
                Ok(Response::new(Body::from("pong")))
            })
            .build();
        let mut req = Request::new(Body::empty());
        *req.uri_mut() = "/ping".parse().unwrap();
        let mut res = service.handle(req);
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body_mut().bytes_blocking().unwrap(), "pong");
    }

    #[test]
    fn blocking_service_renders_404() {
        let service = BlockingHttpService::builder().build();
        let res = service.handle(Request::new(Body::empty()));
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
