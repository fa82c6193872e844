//! The per-request pipeline: routing, interceptors, error rendering.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use http::Method;
use tracing::debug;

use crate::body::Body;
use crate::error::Error;
use crate::headers;
use crate::router::Router;
use crate::{Request, Response};

/// An application endpoint.
///
/// Implemented for free by any `Fn(Request) -> impl Future<Output =
/// Result<Response>>`, so plain `async fn`s register directly.
pub trait Endpoint: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture<'static, crate::Result<Response>>;
}

impl<F, Fut> Endpoint for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<Response>> + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, crate::Result<Response>> {
        Box::pin((self)(req))
    }
}

/// Runs before routing; returning a response short-circuits the endpoint.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, req: &mut Request) -> crate::Result<Option<Response>>;
}

/// Runs after the endpoint, in registration order, mapping the response.
pub trait ResponseInterceptor: Send + Sync {
    fn intercept(&self, res: Response) -> crate::Result<Response>;
}

/// Renders errors into responses.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: &Error) -> Response;
}

/// Renders `server=`, `code=`, `description=` and the error message stack
/// as a `text/plain` body; status comes from the error, defaulting to 500.
#[derive(Debug, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle(&self, error: &Error) -> Response {
        let status = error.status();
        let mut text = String::with_capacity(128);
        text.push_str("server=");
        text.push_str(headers::SERVER_NAME);
        text.push('\n');
        text.push_str("code=");
        text.push_str(itoa::Buffer::new().format(status.as_u16()));
        text.push('\n');
        text.push_str("description=");
        text.push_str(status.canonical_reason().unwrap_or("unknown"));
        text.push('\n');
        text.push_str("stacktrace:\n");
        for message in error.message_stack() {
            text.push_str("  - ");
            text.push_str(&message);
            text.push('\n');
        }

        let mut res = Response::new(Body::from(text));
        *res.status_mut() = status;
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        res.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        res
    }
}

/// The request pipeline shared by every connection handler.
///
/// Holds the route table, both interceptor chains and the error handler;
/// [`HttpService::handle`] runs one request through all of them and always
/// produces a response.
pub struct HttpService {
    router: Router<dyn Endpoint>,
    request_interceptors: Vec<Box<dyn RequestInterceptor>>,
    response_interceptors: Vec<Box<dyn ResponseInterceptor>>,
    error_handler: Box<dyn ErrorHandler>,
}

impl HttpService {
    pub fn builder() -> Builder {
        Builder {
            router: Router::new(),
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
            error_handler: None,
        }
    }

    /// Routes and handles one request. Errors come back as rendered
    /// error responses; this never fails.
    pub async fn handle(&self, req: Request) -> Response {
        match self.dispatch(req).await {
            Ok(res) => res,
            Err(err) => self.render_error(&err),
        }
    }

    pub(crate) fn render_error(&self, error: &Error) -> Response {
        debug!("rendering error response: {}", error);
        let mut res = self.error_handler.handle(error);
        headers::set_server_if_absent(res.headers_mut());
        res
    }

    async fn dispatch(&self, mut req: Request) -> crate::Result<Response> {
        for interceptor in &self.request_interceptors {
            if let Some(res) = interceptor.intercept(&mut req)? {
                debug!("request interceptor short-circuited");
                return self.outbound(res);
            }
        }

        let (endpoint, params) = self
            .router
            .lookup(req.method(), req.uri().path())
            .ok_or_else(Error::new_route_not_found)?;
        req.extensions_mut().insert(params);

        let res = endpoint.call(req).await?;
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

impl std::fmt::Debug for HttpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpService")
            .field("router", &self.router)
            .finish()
    }
}

/// Builds an [`HttpService`].
pub struct Builder {
    router: Router<dyn Endpoint>,
    request_interceptors: Vec<Box<dyn RequestInterceptor>>,
    response_interceptors: Vec<Box<dyn ResponseInterceptor>>,
    error_handler: Option<Box<dyn ErrorHandler>>,
}

impl Builder {
    /// Registers an endpoint for `(method, pattern)`.
    pub fn endpoint<E: Endpoint>(mut self, method: Method, pattern: &str, endpoint: E) -> Builder {
        self.router.route(method, pattern, Arc::new(endpoint));
        self
    }

    /// Registers an already-shared endpoint.
    pub fn route(mut self, method: Method, pattern: &str, endpoint: Arc<dyn Endpoint>) -> Builder {
        self.router.route(method, pattern, endpoint);
        self
    }

    pub fn request_interceptor<I: RequestInterceptor + 'static>(mut self, i: I) -> Builder {
        self.request_interceptors.push(Box::new(i));
        self
    }

    pub fn response_interceptor<I: ResponseInterceptor + 'static>(mut self, i: I) -> Builder {
        self.response_interceptors.push(Box::new(i));
        self
    }

    pub fn error_handler<H: ErrorHandler + 'static>(mut self, handler: H) -> Builder {
        self.error_handler = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> HttpService {
        HttpService {
            router: self.router,
            request_interceptors: self.request_interceptors,
            response_interceptors: self.response_interceptors,
            error_handler: self
                .error_handler
                .unwrap_or_else(|| Box::new(DefaultErrorHandler)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn ok_endpoint() -> impl Endpoint {
        |_req: Request| async { Ok::<_, Error>(Response::new(Body::from("ok"))) }
    }

    #[tokio::test]
    async fn routes_to_endpoint() {
        let service = HttpService::builder()
            .endpoint(Method::GET, "/", ok_endpoint())
            .build();
        let req = Request::new(Body::empty());
        let mut res = service.handle(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body_mut().bytes().await.unwrap(), "ok");
        assert_eq!(res.headers()["server"], headers::SERVER_NAME);
    }

    #[tokio::test]
    async fn missing_route_renders_404() {
        let service = HttpService::builder().build();
        let res = service.handle(Request::new(Body::empty())).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()["connection"], "close");
    }

    #[tokio::test]
    async fn path_params_reach_endpoint() {
        let service = HttpService::builder()
            .endpoint(Method::GET, "/users/{id}", |req: Request| async move {
                let id = req
                    .extensions()
                    .get::<crate::router::Params>()
                    .and_then(|p| p.get("id").map(str::to_owned))
                    .unwrap_or_default();
                Ok::<_, Error>(Response::new(Body::from(id)))
            })
            .build();

        let mut req = Request::new(Body::empty());
        *req.uri_mut() = "/users/31".parse().unwrap();
        let mut res = service.handle(req).await;
        assert_eq!(res.body_mut().bytes().await.unwrap(), "31");
    }

    struct DenyAll;
    impl RequestInterceptor for DenyAll {
        fn intercept(&self, _req: &mut Request) -> crate::Result<Option<Response>> {
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::FORBIDDEN;
            Ok(Some(res))
        }
    }

    #[tokio::test]
    async fn request_interceptor_short_circuits() {
        let service = HttpService::builder()
            .endpoint(Method::GET, "/", ok_endpoint())
            .request_interceptor(DenyAll)
            .build();
        let res = service.handle(Request::new(Body::empty())).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    struct Stamp;
    impl ResponseInterceptor for Stamp {
        fn intercept(&self, mut res: Response) -> crate::Result<Response> {
            res.headers_mut()
                .insert("x-stamp", HeaderValue::from_static("1"));
            Ok(res)
        }
    }

    #[tokio::test]
    async fn response_interceptors_run_in_order() {
        let service = HttpService::builder()
            .endpoint(Method::GET, "/", ok_endpoint())
            .response_interceptor(Stamp)
            .build();
        let res = service.handle(Request::new(Body::empty())).await;
        assert_eq!(res.headers()["x-stamp"], "1");
    }

    struct DropResponse;
    impl ResponseInterceptor for DropResponse {
        fn intercept(&self, _res: Response) -> crate::Result<Response> {
            Err(Error::endpoint_msg("interceptor dropped the response"))
        }
    }

    #[tokio::test]
    async fn failing_response_interceptor_renders_500() {
        let service = HttpService::builder()
            .endpoint(Method::GET, "/", ok_endpoint())
            .response_interceptor(DropResponse)
            .build();
        let res = service.handle(Request::new(Body::empty())).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn error_body_carries_stacktrace() {
        let service = HttpService::builder()
            .endpoint(Method::GET, "/", |_req: Request| async {
                Err::<Response, Error>(Error::endpoint_msg("database exploded"))
            })
            .build();
        let mut res = service.handle(Request::new(Body::empty())).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = res.body_mut().bytes().await.unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("code=500"));
        assert!(text.contains("stacktrace:"));
        assert!(text.contains("database exploded"));
    }
}
