//! Access logging.
//!
//! `app/v1/AccessLogMiddleware` logs one line per request with method, path,
//! status and duration. Headers can be logged too, with sensitive ones redacted.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Level};

use crate::core::error::GatewayResult;
use crate::manifest::{Manifest, Violations};
use crate::middleware::handler::{Handler, Middleware};
use crate::registry::{ApiContext, Object, Resource};

pub struct AccessLogMiddleware {
    level: Level,
    log_headers: bool,
    excluded_headers: Vec<String>,
}

impl AccessLogMiddleware {
    pub fn new(level: Level, log_headers: bool, excluded_headers: Vec<String>) -> Self {
        Self {
            level,
            log_headers,
            excluded_headers: excluded_headers.into_iter().map(|h| h.to_ascii_lowercase()).collect(),
        }
    }

    /// Render headers, redacting excluded ones
    pub fn render_headers(&self, headers: &HeaderMap) -> String {
        headers
            .iter()
            .map(|(name, value)| {
                let value = if self.excluded_headers.iter().any(|h| h == name.as_str()) {
                    "[REDACTED]"
                } else {
                    value.to_str().unwrap_or("<binary>")
                };
                format!("{}: {}", name, value)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn log_request(&self, method: &str, path: &str, status: u16, start_time: Instant, headers: &str) {
        let duration_ms = start_time.elapsed().as_millis() as u64;
        // more verbose levels compare greater
        if self.level <= Level::WARN {
            warn!(method, path, status, duration_ms, headers, "Request processed");
        } else if self.level == Level::INFO {
            info!(method, path, status, duration_ms, headers, "Request processed");
        } else {
            debug!(method, path, status, duration_ms, headers, "Request processed");
        }
    }
}

#[async_trait]
impl Middleware for AccessLogMiddleware {
    async fn handle(&self, request: Request<Body>, next: &dyn Handler) -> Response<Body> {
        let start_time = Instant::now();
        let method = request.method().to_string();
        let path = request.uri().path().to_string();
        let headers = if self.log_headers {
            self.render_headers(request.headers())
        } else {
            String::new()
        };

        let response = next.serve(request).await;
        self.log_request(&method, &path, response.status().as_u16(), start_time, &headers);
        response
    }
}

impl Object for AccessLogMiddleware {
    fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
        Some(self)
    }
}

/// Spec of `app/v1/AccessLogMiddleware`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccessLogSpec {
    pub level: String,
    pub log_headers: bool,
    pub excluded_headers: Vec<String>,
}

impl Default for AccessLogSpec {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_headers: false,
            excluded_headers: vec![
                "authorization".to_string(),
                "cookie".to_string(),
                "set-cookie".to_string(),
                "x-api-key".to_string(),
            ],
        }
    }
}

/// Descriptor of `app/v1/AccessLogMiddleware`
#[derive(Debug, Default)]
pub struct AccessLogKind;

#[async_trait]
impl Resource for AccessLogKind {
    type Spec = AccessLogSpec;

    const API_VERSION: &'static str = "app/v1";
    const KIND: &'static str = "AccessLogMiddleware";

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        violations.check(
            manifest.spec.level.parse::<Level>().is_ok(),
            "spec.level",
            format!("`{}` is not a log level", manifest.spec.level),
        );
    }

    async fn create(&self, _ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        let level = manifest.spec.level.parse::<Level>().unwrap_or(Level::INFO);
        Ok(Arc::new(AccessLogMiddleware::new(
            level,
            manifest.spec.log_headers,
            manifest.spec.excluded_headers.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler::handler_fn;
    use axum::http::{HeaderValue, StatusCode};

    #[test]
    fn test_sensitive_headers_are_redacted() {
        let middleware = AccessLogMiddleware::new(Level::INFO, true, vec!["Authorization".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let rendered = middleware.render_headers(&headers);
        assert!(rendered.contains("authorization: [REDACTED]"));
        assert!(rendered.contains("accept: */*"));
        assert!(!rendered.contains("secret"));
    }

    #[tokio::test]
    async fn test_passes_response_through() {
        let middleware = AccessLogMiddleware::new(Level::DEBUG, false, Vec::new());
        let leaf = handler_fn(|_req: Request<Body>| async {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::CREATED;
            response
        });
        let response = middleware.handle(Request::new(Body::empty()), &leaf).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_level_validation() {
        let mut manifest = AccessLogKind.default_manifest();
        manifest.spec.level = "loud".to_string();
        let mut violations = Violations::new();
        AccessLogKind.validate(&manifest, &mut violations);
        assert_eq!(violations.len(), 1);
    }
}
