//! # CSRF Protection
//!
//! `app/v1/CSRFMiddleware` materializes one object that is both a middleware and
//! a handler:
//!
//! - as a middleware it verifies protected requests with the configured strategy,
//!   strips the proxy header from every inbound request and re-adds it to the
//!   [`ProxyHeaders`] carrier only after a successful verification;
//! - as a handler it serves the token issue endpoint.
//!
//! Rejections go to the configured error handler. They are logged at `debug`.

pub mod extractor;
pub mod spec;
pub mod strategy;
pub mod token;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::error::{ErrorKind, GatewayError, GatewayResult, HttpError};
use crate::manifest::{Manifest, Violations};
use crate::middleware::error_handling::{DefaultErrorHandler, ErrorHandler};
use crate::middleware::handler::{Handler, Middleware};
use crate::middleware::session::SessionHandle;
use crate::middleware::ProxyHeaders;
use crate::registry::resolver::resolve_or;
use crate::registry::{ApiContext, Object, Resource};

pub use spec::{CsrfSpec, StrategySpec};
pub use strategy::Strategy;
pub use token::{HashAlg, TokenIssuer};

/// CSRF middleware and token issue endpoint
pub struct CsrfProtection {
    issuer: TokenIssuer,
    strategy: Strategy,
    protected_methods: Vec<Method>,
    protected_patterns: Vec<Regex>,
    patterns: Vec<String>,
    proxy_header: Option<HeaderName>,
    issue_new: bool,
    error_handler: Arc<dyn ErrorHandler>,
}

impl CsrfProtection {
    /// Build from a defaulted spec and an explicit secret
    pub fn new(spec: &CsrfSpec, secret: Vec<u8>, error_handler: Arc<dyn ErrorHandler>) -> GatewayResult<Self> {
        let strategy = Strategy::new(&spec.strategy.clone().unwrap_or_else(StrategySpec::fallback))?;

        let protected_methods = spec
            .protected_methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.as_bytes()).map_err(|e| {
                    GatewayError::new(ErrorKind::Unsupported, "csrf", format!("invalid method `{}`", m)).wrap(e)
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let protected_patterns = spec
            .protected_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| GatewayError::pattern("csrf", format!("protectedPatterns `{}`", p)).wrap(e))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let proxy_header = if spec.proxy_header_name.is_empty() {
            None
        } else {
            Some(HeaderName::from_bytes(spec.proxy_header_name.as_bytes()).map_err(|e| {
                GatewayError::new(ErrorKind::Unsupported, "csrf", "invalid proxyHeaderName").wrap(e)
            })?)
        };

        Ok(Self {
            issuer: TokenIssuer::new(secret, spec.seed_size, spec.hash_alg),
            strategy,
            protected_methods,
            protected_patterns,
            patterns: spec.patterns.clone(),
            proxy_header,
            issue_new: spec.issue_new,
            error_handler,
        })
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    fn is_protected(&self, request: &Request<Body>) -> bool {
        if !self.protected_methods.contains(request.method()) {
            return false;
        }
        let path = request.uri().path();
        self.protected_patterns.is_empty() || self.protected_patterns.iter().any(|p| p.is_match(path))
    }

    fn strip_proxy_header(&self, request: &mut Request<Body>) {
        if let Some(name) = &self.proxy_header {
            request.headers_mut().remove(name);
            if let Some(carrier) = request.extensions_mut().get_mut::<ProxyHeaders>() {
                carrier.0.remove(name);
            }
        }
    }

    fn install_proxy_header(&self, request: &mut Request<Body>, token: &str) {
        let Some(name) = &self.proxy_header else {
            return;
        };
        let Ok(value) = HeaderValue::from_str(token) else {
            debug!(header = %name, "verified token is not a valid header value");
            return;
        };
        match request.extensions_mut().get_mut::<ProxyHeaders>() {
            Some(carrier) => {
                carrier.0.insert(name.clone(), value);
            }
            None => {
                let mut headers = HeaderMap::new();
                headers.insert(name.clone(), value);
                request.extensions_mut().insert(ProxyHeaders(headers));
            }
        }
    }
}

#[async_trait]
impl Middleware for CsrfProtection {
    async fn handle(&self, mut request: Request<Body>, next: &dyn Handler) -> Response<Body> {
        self.strip_proxy_header(&mut request);
        if !self.is_protected(&request) {
            return next.serve(request).await;
        }

        match self.strategy.get(&mut request, &self.issuer).await {
            Ok(token) => {
                self.install_proxy_header(&mut request, &token);
                next.serve(request).await
            }
            Err(error) => {
                debug!(
                    method = %request.method(),
                    path = %request.uri().path(),
                    error = %error,
                    "csrf verification failed"
                );
                self.error_handler.serve_error(request.headers(), error)
            }
        }
    }
}

enum Representation {
    Text,
    Json,
    Xml,
}

fn negotiate(headers: &HeaderMap) -> Representation {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    for range in accept.split(',') {
        let mime = range.split(';').next().unwrap_or_default().trim();
        match mime.to_ascii_lowercase().as_str() {
            "text/plain" => return Representation::Text,
            "application/json" | "text/json" => return Representation::Json,
            "application/xml" | "text/xml" => return Representation::Xml,
            _ => {}
        }
    }
    Representation::Text
}

#[async_trait]
impl Handler for CsrfProtection {
    async fn serve(&self, request: Request<Body>) -> Response<Body> {
        // Body is not Sync, keep only the parts across awaits
        let (parts, _) = request.into_parts();
        let session = parts.extensions.get::<SessionHandle>().map(|handle| handle.0.clone());
        let headers = &parts.headers;

        let current = if self.issue_new {
            None
        } else {
            self.strategy.current(headers, session.clone(), &self.issuer).await
        };
        let token = match current {
            Some(token) => token,
            None => match self.issuer.mint() {
                Ok(token) => token,
                Err(e) => return self.error_handler.serve_error(headers, HttpError::internal(e)),
            },
        };

        let mut cookies = HeaderMap::new();
        if let Err(error) = self.strategy.set(session, &mut cookies, &token).await {
            return self.error_handler.serve_error(headers, error);
        }

        let (content_type, body) = match negotiate(headers) {
            Representation::Text => ("text/plain; charset=utf-8", token),
            Representation::Json => ("application/json", serde_json::json!({ "token": token }).to_string()),
            Representation::Xml => ("application/xml", format!("<token>{}</token>", token)),
        };

        let mut response = Response::new(Body::from(body));
        response.headers_mut().extend(cookies);
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
            .headers_mut()
            .insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }

    fn patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    fn methods(&self) -> Vec<Method> {
        vec![Method::GET]
    }
}

impl Object for CsrfProtection {
    fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
        Some(self)
    }

    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

/// Descriptor of `app/v1/CSRFMiddleware`
#[derive(Debug, Default)]
pub struct CsrfKind;

#[async_trait]
impl Resource for CsrfKind {
    type Spec = CsrfSpec;

    const API_VERSION: &'static str = "app/v1";
    const KIND: &'static str = "CSRFMiddleware";

    fn mutate(&self, mut manifest: Manifest<Self::Spec>) -> Manifest<Self::Spec> {
        manifest.spec.fill_defaults();
        manifest
    }

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        manifest.spec.validate(violations);
    }

    async fn create(&self, ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        let secret = if manifest.spec.secret.is_empty() {
            warn!(
                id = %manifest.id(),
                "no CSRF secret configured, using a secret derived from the host name"
            );
            token::host_secret()
        } else {
            BASE64.decode(&manifest.spec.secret).map_err(|e| {
                GatewayError::new(ErrorKind::Unsupported, "csrf", "secret is not base64").wrap(e)
            })?
        };
        let error_handler: Arc<dyn ErrorHandler> =
            resolve_or(ctx, manifest.spec.error_handler.as_ref(), DefaultErrorHandler::shared).await?;
        Ok(Arc::new(CsrfProtection::new(&manifest.spec, secret, error_handler)?))
    }
}
