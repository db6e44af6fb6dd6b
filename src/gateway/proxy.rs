//! Reverse proxy leaf handler.
//!
//! `core/v1/ReverseProxyHandler` rewrites the request onto an upstream base URL
//! and sends it through a round tripper, usually an `HTTPClient` with tripperware.
//! Headers placed in the [`ProxyHeaders`] carrier by middlewares are copied onto
//! the upstream request. Transport failures become 502 through the error handler.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, Uri};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::core::error::{ErrorKind, GatewayError, GatewayResult, HttpError};
use crate::manifest::{validate_reference, Manifest, Reference, Violations};
use crate::middleware::error_handling::{DefaultErrorHandler, ErrorHandler};
use crate::middleware::handler::{normalize_methods, Handler};
use crate::middleware::tripperware::{HttpTransport, RoundTripper};
use crate::middleware::ProxyHeaders;
use crate::registry::resolver::resolve_or;
use crate::registry::{ApiContext, Object, Resource};

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

pub struct ReverseProxy {
    upstream: Url,
    strip_prefix: String,
    patterns: Vec<String>,
    methods: Vec<Method>,
    client: Arc<dyn RoundTripper>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl ReverseProxy {
    pub fn new(
        upstream: Url,
        client: Arc<dyn RoundTripper>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            upstream,
            strip_prefix: String::new(),
            patterns: Vec::new(),
            methods: Vec::new(),
            client,
            error_handler,
        }
    }

    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = prefix.into();
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = normalize_methods(methods);
        self
    }

    /// Upstream URI for an inbound one
    pub fn target(&self, uri: &Uri) -> GatewayResult<Uri> {
        let path = uri.path();
        let path = match path.strip_prefix(self.strip_prefix.as_str()) {
            Some(rest) if !self.strip_prefix.is_empty() => rest,
            _ => path,
        };

        let base = self.upstream.as_str().trim_end_matches('/');
        let mut target = format!("{}/{}", base, path.trim_start_matches('/'));
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query);
        }
        target.parse().map_err(|e| {
            GatewayError::new(ErrorKind::Upstream, "proxy", format!("invalid upstream uri `{}`", target)).wrap(e)
        })
    }

    fn forward_headers(request: &mut Request<Body>) {
        let carried = request.extensions().get::<ProxyHeaders>().cloned();
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string());
        let host = request.headers().get(header::HOST).cloned();

        let headers = request.headers_mut();
        strip_hop_by_hop(headers);
        headers.remove(header::HOST);

        if let Some(client) = client {
            let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{}, {}", existing, client),
                None => client,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }
        if let Some(host) = host {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host);
        }
        if let Some(ProxyHeaders(carried)) = carried {
            for (name, value) in carried.iter() {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
}

#[async_trait]
impl Handler for ReverseProxy {
    async fn serve(&self, mut request: Request<Body>) -> Response<Body> {
        let headers = request.headers().clone();
        let target = match self.target(request.uri()) {
            Ok(target) => target,
            Err(e) => return self.error_handler.serve_error(&headers, HttpError::internal(e)),
        };

        debug!(from = %request.uri(), to = %target, "proxying request");
        *request.uri_mut() = target;
        Self::forward_headers(&mut request);

        match self.client.round_trip(request).await {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                response
            }
            Err(e) => self.error_handler.serve_error(&headers, HttpError::bad_gateway(e)),
        }
    }

    fn patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    fn methods(&self) -> Vec<Method> {
        self.methods.clone()
    }
}

impl Object for ReverseProxy {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

/// Spec of `core/v1/ReverseProxyHandler`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReverseProxySpec {
    /// Base URL, e.g. `http://backend:8080/api`
    pub upstream: String,
    pub patterns: Vec<String>,
    pub methods: Vec<String>,
    pub strip_prefix: String,
    pub client: Option<Reference>,
    pub error_handler: Option<Reference>,
}

/// Descriptor of `core/v1/ReverseProxyHandler`
#[derive(Debug, Default)]
pub struct ReverseProxyKind;

#[async_trait]
impl Resource for ReverseProxyKind {
    type Spec = ReverseProxySpec;

    const API_VERSION: &'static str = "core/v1";
    const KIND: &'static str = "ReverseProxyHandler";

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        let spec = &manifest.spec;
        match Url::parse(&spec.upstream) {
            // the base transport has no TLS connector
            Ok(url) => violations.check(url.scheme() == "http", "spec.upstream", "only http upstreams are supported"),
            Err(e) => violations.push("spec.upstream", format!("`{}` is not a url: {}", spec.upstream, e)),
        }
        for (i, method) in spec.methods.iter().enumerate() {
            violations.check(
                Method::from_bytes(method.as_bytes()).is_ok(),
                &format!("spec.methods[{}]", i),
                format!("`{}` is not an HTTP method", method),
            );
        }
        if let Some(client) = &spec.client {
            validate_reference("spec.client", client, violations);
        }
        if let Some(error_handler) = &spec.error_handler {
            validate_reference("spec.errorHandler", error_handler, violations);
        }
    }

    async fn create(&self, ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        let spec = &manifest.spec;
        let upstream = Url::parse(&spec.upstream).map_err(|e| {
            GatewayError::new(ErrorKind::Unmarshal, "proxy", format!("invalid upstream `{}`", spec.upstream)).wrap(e)
        })?;
        let client: Arc<dyn RoundTripper> =
            resolve_or(ctx, spec.client.as_ref(), || Arc::new(HttpTransport::default()) as Arc<dyn RoundTripper>).await?;
        let error_handler: Arc<dyn ErrorHandler> =
            resolve_or(ctx, spec.error_handler.as_ref(), DefaultErrorHandler::shared).await?;
        let methods = spec
            .methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
            .collect();

        Ok(Arc::new(
            ReverseProxy::new(upstream, client, error_handler)
                .with_strip_prefix(spec.strip_prefix.clone())
                .with_patterns(spec.patterns.clone())
                .with_methods(methods),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use parking_lot::Mutex;

    struct Capture(Arc<Mutex<Option<Request<()>>>>);

    #[async_trait]
    impl RoundTripper for Capture {
        async fn round_trip(&self, request: Request<Body>) -> GatewayResult<Response<Body>> {
            let (parts, _) = request.into_parts();
            *self.0.lock() = Some(Request::from_parts(parts, ()));
            Ok(Response::new(Body::empty()))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl RoundTripper for Unreachable {
        async fn round_trip(&self, _request: Request<Body>) -> GatewayResult<Response<Body>> {
            Err(GatewayError::new(ErrorKind::Upstream, "test", "connection refused"))
        }
    }

    fn proxy(client: Arc<dyn RoundTripper>) -> ReverseProxy {
        ReverseProxy::new(
            Url::parse("http://backend:8080/base/").unwrap(),
            client,
            DefaultErrorHandler::shared(),
        )
        .with_strip_prefix("/api")
    }

    #[test]
    fn test_target_rewrite() {
        let proxy = proxy(Arc::new(Unreachable));
        let target = proxy.target(&"/api/users/1?full=true".parse().unwrap()).unwrap();
        assert_eq!(target, "http://backend:8080/base/users/1?full=true");

        let untouched = proxy.target(&"/other".parse().unwrap()).unwrap();
        assert_eq!(untouched, "http://backend:8080/base/other");
    }

    #[tokio::test]
    async fn test_forwards_carried_headers() {
        let captured = Arc::new(Mutex::new(None));
        let proxy = proxy(Arc::new(Capture(captured.clone())));

        let mut carried = HeaderMap::new();
        carried.insert("x-csrf-verified", HeaderValue::from_static("1"));
        let mut request = Request::builder()
            .uri("/api/items")
            .header(header::HOST, "gateway.local")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ProxyHeaders(carried));
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4000))));

        proxy.serve(request).await;

        let sent = captured.lock().take().unwrap();
        assert_eq!(sent.uri(), "http://backend:8080/base/items");
        assert_eq!(sent.headers()["x-csrf-verified"], "1");
        assert_eq!(sent.headers()["x-forwarded-for"], "10.0.0.7");
        assert_eq!(sent.headers()["x-forwarded-host"], "gateway.local");
        assert!(!sent.headers().contains_key(header::CONNECTION));
    }

    #[tokio::test]
    async fn test_transport_failure_is_bad_gateway() {
        let response = proxy(Arc::new(Unreachable)).serve(Request::new(Body::empty())).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_rejects_https_upstream() {
        let mut manifest = ReverseProxyKind.default_manifest();
        manifest.spec.upstream = "https://backend".to_string();
        let mut violations = Violations::new();
        ReverseProxyKind.validate(&manifest, &mut violations);
        assert_eq!(violations.len(), 1);
    }
}
