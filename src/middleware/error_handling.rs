//! # Error Handling
//!
//! Middlewares never write error bodies themselves. They hand an [`HttpError`] to
//! an [`ErrorHandler`] resolved during `create`, which renders the response.
//! [`DefaultErrorHandler`] renders JSON for clients that accept it and plain text
//! otherwise; the `core/v1/ErrorHandler` kind exposes it as a resource.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::error::{ErrorKind, GatewayResult, HttpError};
use crate::manifest::Manifest;
use crate::registry::{ApiContext, Object, Resource};

/// Renders HTTP errors raised by middlewares and handlers
pub trait ErrorHandler: Send + Sync {
    fn serve_error(&self, headers: &HeaderMap, error: HttpError) -> Response<Body>;
}

/// JSON or plain text error renderer
#[derive(Debug, Clone, Default)]
pub struct DefaultErrorHandler {
    show_detail: bool,
}

impl DefaultErrorHandler {
    pub fn new(show_detail: bool) -> Self {
        Self { show_detail }
    }

    /// Shared instance used when no error handler is configured
    pub fn shared() -> Arc<dyn ErrorHandler> {
        Arc::new(Self::default())
    }
}

fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/json") || accept.contains("text/json"))
        .unwrap_or(false)
}

impl ErrorHandler for DefaultErrorHandler {
    fn serve_error(&self, headers: &HeaderMap, error: HttpError) -> Response<Body> {
        let status = error.status;
        let inner = &error.error;

        // adversarial traffic ends up here, keep it out of error logs
        if inner.kind == ErrorKind::InvalidToken || status.is_client_error() {
            debug!(status = status.as_u16(), error = %inner, "request rejected");
        } else {
            warn!(status = status.as_u16(), error = %inner, "request failed");
        }

        let reason = status.canonical_reason().unwrap_or("Error");
        let (content_type, body) = if accepts_json(headers) {
            let mut payload = json!({
                "status": status.as_u16(),
                "error": reason,
                "type": inner.error_type(),
            });
            if self.show_detail {
                payload["description"] = json!(inner.description);
                if !inner.detail.is_empty() {
                    payload["detail"] = json!(inner.detail);
                }
            }
            ("application/json", payload.to_string())
        } else if self.show_detail {
            ("text/plain; charset=utf-8", format!("{} {}: {}\n", status.as_u16(), reason, inner))
        } else {
            ("text/plain; charset=utf-8", format!("{} {}\n", status.as_u16(), reason))
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
            .headers_mut()
            .insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        response
    }
}

impl Object for DefaultErrorHandler {
    fn as_error_handler(self: Arc<Self>) -> Option<Arc<dyn ErrorHandler>> {
        Some(self)
    }
}

/// Spec of `core/v1/ErrorHandler`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorHandlerSpec {
    /// Include error descriptions and details in responses
    pub show_detail: bool,
}

/// Descriptor of `core/v1/ErrorHandler`
#[derive(Debug, Default)]
pub struct ErrorHandlerKind;

#[async_trait]
impl Resource for ErrorHandlerKind {
    type Spec = ErrorHandlerSpec;

    const API_VERSION: &'static str = "core/v1";
    const KIND: &'static str = "ErrorHandler";

    async fn create(&self, _ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        Ok(Arc::new(DefaultErrorHandler::new(manifest.spec.show_detail)))
    }
}
