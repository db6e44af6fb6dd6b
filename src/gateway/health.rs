//! Liveness endpoint.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::core::error::GatewayResult;
use crate::manifest::{Manifest, Violations};
use crate::middleware::handler::Handler;
use crate::registry::{ApiContext, Object, Resource};

/// Always answers 200 while the process is alive
pub struct HealthCheckHandler {
    patterns: Vec<String>,
}

impl HealthCheckHandler {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

#[async_trait]
impl Handler for HealthCheckHandler {
    async fn serve(&self, _request: Request<Body>) -> Response<Body> {
        let mut response = Response::new(Body::from(json!({ "status": "ok" }).to_string()));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }

    fn patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    fn methods(&self) -> Vec<Method> {
        vec![Method::GET, Method::HEAD]
    }
}

impl Object for HealthCheckHandler {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

/// Spec of `core/v1/HealthCheckHandler`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckSpec {
    pub patterns: Vec<String>,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            patterns: vec!["/healthz".to_string()],
        }
    }
}

/// Descriptor of `core/v1/HealthCheckHandler`
#[derive(Debug, Default)]
pub struct HealthCheckKind;

#[async_trait]
impl Resource for HealthCheckKind {
    type Spec = HealthCheckSpec;

    const API_VERSION: &'static str = "core/v1";
    const KIND: &'static str = "HealthCheckHandler";

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        violations.check(!manifest.spec.patterns.is_empty(), "spec.patterns", "at least one pattern is required");
    }

    async fn create(&self, _ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        Ok(Arc::new(HealthCheckHandler::new(manifest.spec.patterns.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_reports_ok() {
        let handler = HealthCheckHandler::new(HealthCheckSpec::default().patterns);
        let response = handler.serve(Request::new(Body::empty())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(handler.patterns(), vec!["/healthz"]);
    }
}
