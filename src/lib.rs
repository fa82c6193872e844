//! # trellis
//!
//! A fast HTTP/1.1 and HTTP/2 application server framework core.
//!
//! The crate covers the connection-handling path of an application
//! server: accepting byte streams, parsing HTTP/1.1 exchanges or running
//! an HTTP/2 session (frames, HPACK, flow control, priority-scheduled
//! output), routing requests through a path-pattern [`Router`] and an
//! interceptor pipeline, and serializing responses back out.
//!
//! ## Handlers
//!
//! Three connection handlers share one request pipeline
//! ([`HttpService`]):
//!
//! - the async HTTP/1.1 loop and the HTTP/2 session, reached through
//!   [`server::conn::Http`] (or the [`Server`] accept loop), with a
//!   version switch that sniffs the HTTP/2 connection preface without
//!   consuming it;
//! - the [`blocking`] server, one OS thread per connection, for
//!   synchronous endpoints.
//!
//! An `Upgrade: h2c` request is answered with `101 Switching Protocols`
//! by the [`upgrade::H2cUpgrade`] interceptor and the live connection
//! moves to the HTTP/2 session.
//!
//! ## Hello
//!
//! ```no_run
//! # async fn run() -> trellis::Result<()> {
//! use std::sync::Arc;
//! use http::Method;
//! use trellis::{Body, HttpService, Request, Response, Server};
//!
//! let service = HttpService::builder()
//!     .endpoint(Method::GET, "/hello/{name}", |req: Request| async move {
//!         let name = req
//!             .extensions()
//!             .get::<trellis::Params>()
//!             .and_then(|p| p.get("name"))
//!             .unwrap_or("world")
//!             .to_owned();
//!     Ok::<_, trellis::Error>(Response::new(Body::from(format!("hello, {}!", name))))
//!     })
//!     .build();
//!
//! Server::bind("127.0.0.1:8000".parse().unwrap())
//!     .await?
//!     .serve(Arc::new(service))
//!     .await
//! # }
//! ```

pub mod blocking;
pub mod body;
mod common;
mod error;
mod headers;
mod proto;
pub mod router;
pub mod server;
pub mod service;
pub mod upgrade;

pub use crate::body::{Body, ChunkedBuffer, Sender, Trailers};
pub use crate::common::exec::{BoxSendFuture, Executor};
pub use crate::common::{BoxIo, Io};
pub use crate::error::{Error, Result};
pub use crate::proto::h1::Http1Config;
pub use crate::proto::h2::{Http2Config, Reason};
pub use crate::router::{Params, Router};
pub use crate::server::Server;
pub use crate::service::{
    DefaultErrorHandler, Endpoint, ErrorHandler, HttpService, RequestInterceptor,
    ResponseInterceptor,
};

/// An inbound request carrying a [`Body`].
pub type Request = http::Request<Body>;

/// An outbound response carrying a [`Body`].
pub type Response = http::Response<Body>;
