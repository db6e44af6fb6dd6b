//! # HTTP Server Module
//!
//! `core/v1/HTTPServer` is a runner: it binds a listener, wraps a pattern
//! multiplexer over its handlers with server-level middlewares and serves until
//! the shutdown token is cancelled, then drains in-flight requests for at most
//! the configured grace period.
//!
//! ## Pattern matching
//!
//! - Exact patterns, including `:param` segments, go through a `matchit` router
//! - Patterns ending in `/` match their whole subtree; the longest one wins
//! - A handler declaring no patterns is the catch-all
//!
//! Unmatched paths get a 404 and methods the matched handler does not accept get
//! a 405, both rendered by the error handler.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, info, warn};

use crate::core::error::{ErrorKind, GatewayError, GatewayResult, HttpError};
use crate::gateway::entrypoint::Runner;
use crate::manifest::{validate_reference, Manifest, Reference, Violations};
use crate::middleware::error_handling::{DefaultErrorHandler, ErrorHandler};
use crate::middleware::handler::{clean_path, compose, Handler, Middleware};
use crate::registry::resolver::{resolve_or, resolve_typed_many};
use crate::registry::{ApiContext, Object, Resource};

/// Routes requests to handlers by their declared patterns
pub struct PatternMux {
    exact: matchit::Router<usize>,
    subtrees: Vec<(String, usize)>,
    catch_all: Option<usize>,
    handlers: Vec<Arc<dyn Handler>>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl PatternMux {
    pub fn new(handlers: Vec<Arc<dyn Handler>>, error_handler: Arc<dyn ErrorHandler>) -> GatewayResult<Self> {
        let mut exact = matchit::Router::new();
        let mut subtrees: Vec<(String, usize)> = Vec::new();
        let mut catch_all = None;

        for (index, handler) in handlers.iter().enumerate() {
            let patterns = handler.patterns();
            if patterns.is_empty() {
                if catch_all.replace(index).is_some() {
                    return Err(GatewayError::duplicate_key("server", "more than one catch-all handler"));
                }
                continue;
            }

            for pattern in patterns {
                let pattern = clean_path(&pattern);
                if pattern.ends_with('/') {
                    if subtrees.iter().any(|(p, _)| *p == pattern) {
                        return Err(GatewayError::duplicate_key("server", pattern));
                    }
                    subtrees.push((pattern, index));
                } else {
                    exact
                        .insert(pattern.clone(), index)
                        .map_err(|e| GatewayError::pattern("server", format!("`{}`: {}", pattern, e)))?;
                }
            }
        }
        subtrees.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Ok(Self {
            exact,
            subtrees,
            catch_all,
            handlers,
            error_handler,
        })
    }

    /// Handler for a request path
    pub fn route(&self, path: &str) -> Option<&Arc<dyn Handler>> {
        let path = clean_path(path);
        let index = match self.exact.at(&path) {
            Ok(matched) => Some(*matched.value),
            Err(_) => self
                .subtrees
                .iter()
                .find(|(prefix, _)| path.starts_with(prefix.as_str()))
                .map(|(_, index)| *index)
                .or(self.catch_all),
        };
        index.map(|i| &self.handlers[i])
    }
}

fn allows(methods: &[Method], method: &Method) -> bool {
    methods.is_empty() || methods.contains(method) || (*method == Method::HEAD && methods.contains(&Method::GET))
}

#[async_trait]
impl Handler for PatternMux {
    async fn serve(&self, request: Request<Body>) -> Response<Body> {
        let path = request.uri().path().to_string();
        let Some(handler) = self.route(&path) else {
            let error = GatewayError::new(ErrorKind::NoApi, "server", format!("no handler for {}", path));
            return self.error_handler.serve_error(request.headers(), HttpError::not_found(error));
        };

        let methods = handler.methods();
        if !allows(&methods, request.method()) {
            let error = GatewayError::new(
                ErrorKind::NoMethod,
                "server",
                format!("{} is not allowed on {}", request.method(), path),
            );
            let mut response = self
                .error_handler
                .serve_error(request.headers(), HttpError::method_not_allowed(error));
            let allow = methods.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                response.headers_mut().insert(header::ALLOW, value);
            }
            return response;
        }

        handler.serve(request).await
    }
}

/// A listener serving a composed handler
pub struct HttpServer {
    addr: String,
    handler: Arc<dyn Handler>,
    shutdown_timeout: Duration,
}

impl HttpServer {
    pub fn new(addr: impl Into<String>, handler: Arc<dyn Handler>, shutdown_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            handler,
            shutdown_timeout,
        }
    }

    /// Handler chain behind the listener
    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }

    /// Serve on an already bound listener until `shutdown` is cancelled
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> GatewayResult<()> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::io("server", "listener has no local address").wrap(e))?;

        let handler = self.handler.clone();
        let app = axum::Router::new()
            .fallback(move |request: Request<Body>| {
                let handler = handler.clone();
                async move { handler.serve(request).await }
            })
            // a panicking handler answers 500 instead of dropping the connection
            .layer(ServiceBuilder::new().layer(CatchPanicLayer::new()));

        info!("HTTP server listening on {}", local_addr);
        let signal = shutdown.clone();
        let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => {
                return result.map_err(|e| GatewayError::io("server", format!("server on {} failed", local_addr)).wrap(e));
            }
            _ = shutdown.cancelled() => {
                debug!("draining connections on {}", local_addr);
            }
        }

        match tokio::time::timeout(self.shutdown_timeout, server).await {
            Ok(result) => {
                info!("HTTP server on {} stopped", local_addr);
                result.map_err(|e| GatewayError::io("server", format!("server on {} failed", local_addr)).wrap(e))
            }
            Err(_) => {
                warn!(
                    "HTTP server on {} did not drain within {:?}, dropping connections",
                    local_addr, self.shutdown_timeout
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Runner for HttpServer {
    async fn run(&self, shutdown: CancellationToken) -> GatewayResult<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| GatewayError::io("server", format!("Failed to bind server to {}", self.addr)).wrap(e))?;
        self.serve(listener, shutdown).await
    }
}

impl Object for HttpServer {
    fn as_runner(self: Arc<Self>) -> Option<Arc<dyn Runner>> {
        Some(self)
    }
}

/// Spec of `core/v1/HTTPServer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpServerSpec {
    pub addr: String,
    pub handlers: Vec<Reference>,
    /// Applied around the multiplexer, first element outermost
    pub middleware: Vec<Reference>,
    pub error_handler: Option<Reference>,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for HttpServerSpec {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            handlers: Vec::new(),
            middleware: Vec::new(),
            error_handler: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Descriptor of `core/v1/HTTPServer`
#[derive(Debug, Default)]
pub struct HttpServerKind;

#[async_trait]
impl Resource for HttpServerKind {
    type Spec = HttpServerSpec;

    const API_VERSION: &'static str = "core/v1";
    const KIND: &'static str = "HTTPServer";

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        let spec = &manifest.spec;
        let port_ok = spec
            .addr
            .rsplit_once(':')
            .map_or(false, |(_, port)| port.parse::<u16>().is_ok());
        violations.check(port_ok, "spec.addr", format!("`{}` is not a host:port address", spec.addr));
        violations.check(!spec.handlers.is_empty(), "spec.handlers", "at least one handler is required");
        violations.check(!spec.shutdown_timeout.is_zero(), "spec.shutdownTimeout", "must be greater than zero");

        for (i, handler) in spec.handlers.iter().enumerate() {
            validate_reference(&format!("spec.handlers[{}]", i), handler, violations);
        }
        for (i, middleware) in spec.middleware.iter().enumerate() {
            validate_reference(&format!("spec.middleware[{}]", i), middleware, violations);
        }
        if let Some(error_handler) = &spec.error_handler {
            validate_reference("spec.errorHandler", error_handler, violations);
        }
    }

    async fn create(&self, ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        let spec = &manifest.spec;
        let handlers: Vec<Arc<dyn Handler>> = resolve_typed_many(ctx, &spec.handlers).await?;
        let middlewares: Vec<Arc<dyn Middleware>> = resolve_typed_many(ctx, &spec.middleware).await?;
        let error_handler: Arc<dyn ErrorHandler> =
            resolve_or(ctx, spec.error_handler.as_ref(), DefaultErrorHandler::shared).await?;

        let mux: Arc<dyn Handler> = Arc::new(PatternMux::new(handlers, error_handler)?);
        Ok(Arc::new(HttpServer::new(
            spec.addr.clone(),
            compose(&middlewares, mux),
            spec.shutdown_timeout,
        )))
    }
}
