//! # Outbound Request Composition
//!
//! A [`RoundTripper`] performs an outbound HTTP exchange. [`Tripperware`]
//! intercepts it: it may rewrite the request, call the next round tripper and then
//! observe the response or error. Lists compose outer-first, like middlewares.
//!
//! The `core/v1/HTTPClient` kind wraps the hyper-util base transport with
//! referenced tripperware.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{ErrorKind, GatewayError, GatewayResult};
use crate::manifest::{validate_reference, Manifest, Reference, Violations};
use crate::registry::resolver::resolve_typed_many;
use crate::registry::{ApiContext, Object, Resource};

/// Performs an outbound HTTP exchange
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, request: Request<Body>) -> GatewayResult<Response<Body>>;
}

/// Intercepts an outbound exchange
#[async_trait]
pub trait Tripperware: Send + Sync {
    async fn intercept(&self, request: Request<Body>, next: &dyn RoundTripper) -> GatewayResult<Response<Body>>;
}

struct Layered {
    tripperware: Arc<dyn Tripperware>,
    next: Arc<dyn RoundTripper>,
}

#[async_trait]
impl RoundTripper for Layered {
    async fn round_trip(&self, request: Request<Body>) -> GatewayResult<Response<Body>> {
        self.tripperware.intercept(request, self.next.as_ref()).await
    }
}

/// Wrap `base` with `tripperware`, the first element outermost
pub fn compose_round_tripper(
    tripperware: &[Arc<dyn Tripperware>],
    base: Arc<dyn RoundTripper>,
) -> Arc<dyn RoundTripper> {
    tripperware.iter().rev().fold(base, |next, tripperware| {
        Arc::new(Layered {
            tripperware: tripperware.clone(),
            next,
        })
    })
}

/// Base transport over the hyper-util pooled client
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Body>,
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(spec: &HttpClientSpec) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(spec.connect_timeout);
        connector.set_keepalive(spec.keep_alive);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(spec.idle_timeout)
            .build(connector);

        Self {
            client,
            timeout: spec.timeout,
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(&HttpClientSpec::default())
    }
}

#[async_trait]
impl RoundTripper for HttpTransport {
    async fn round_trip(&self, request: Request<Body>) -> GatewayResult<Response<Body>> {
        let uri = request.uri().to_string();
        let exchange = self.client.request(request);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| {
                GatewayError::new(
                    ErrorKind::Upstream,
                    "tripperware",
                    format!("request to {} timed out after {:?}", uri, limit),
                )
            })?,
            None => exchange.await,
        };
        let response = result.map_err(|e| {
            GatewayError::new(ErrorKind::Upstream, "tripperware", format!("request to {} failed", uri)).wrap(e)
        })?;
        Ok(response.map(Body::new))
    }
}

impl Object for HttpTransport {
    fn as_round_tripper(self: Arc<Self>) -> Option<Arc<dyn RoundTripper>> {
        Some(self)
    }
}

/// A base transport wrapped by tripperware
pub struct HttpClient {
    chain: Arc<dyn RoundTripper>,
}

impl HttpClient {
    pub fn new(base: Arc<dyn RoundTripper>, tripperware: &[Arc<dyn Tripperware>]) -> Self {
        Self {
            chain: compose_round_tripper(tripperware, base),
        }
    }
}

#[async_trait]
impl RoundTripper for HttpClient {
    async fn round_trip(&self, request: Request<Body>) -> GatewayResult<Response<Body>> {
        self.chain.round_trip(request).await
    }
}

impl Object for HttpClient {
    fn as_round_tripper(self: Arc<Self>) -> Option<Arc<dyn RoundTripper>> {
        Some(self)
    }
}

/// Spec of `core/v1/HTTPClient`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpClientSpec {
    pub tripperware: Vec<Reference>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Limit on a whole exchange, headers included
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// Descriptor of `core/v1/HTTPClient`
#[derive(Debug, Default)]
pub struct HttpClientKind;

#[async_trait]
impl Resource for HttpClientKind {
    type Spec = HttpClientSpec;

    const API_VERSION: &'static str = "core/v1";
    const KIND: &'static str = "HTTPClient";

    fn mutate(&self, mut manifest: Manifest<Self::Spec>) -> Manifest<Self::Spec> {
        manifest.spec.connect_timeout.get_or_insert(Duration::from_secs(10));
        manifest.spec.keep_alive.get_or_insert(Duration::from_secs(90));
        manifest.spec.idle_timeout.get_or_insert(Duration::from_secs(60));
        manifest
    }

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        for (i, reference) in manifest.spec.tripperware.iter().enumerate() {
            validate_reference(&format!("spec.tripperware[{}]", i), reference, violations);
        }
        violations.check(
            manifest.spec.timeout.map_or(true, |t| !t.is_zero()),
            "spec.timeout",
            "must be greater than zero when set",
        );
    }

    async fn create(&self, ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        let tripperware: Vec<Arc<dyn Tripperware>> = resolve_typed_many(ctx, &manifest.spec.tripperware).await?;
        let base: Arc<dyn RoundTripper> = Arc::new(HttpTransport::new(&manifest.spec));
        Ok(Arc::new(HttpClient::new(base, &tripperware)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};

    struct Stamp(&'static str);

    #[async_trait]
    impl Tripperware for Stamp {
        async fn intercept(&self, mut request: Request<Body>, next: &dyn RoundTripper) -> GatewayResult<Response<Body>> {
            request
                .headers_mut()
                .append("x-trail", HeaderValue::from_static(self.0));
            let mut response = next.round_trip(request).await?;
            response
                .headers_mut()
                .append("x-trail", HeaderValue::from_static(self.0));
            Ok(response)
        }
    }

    struct Echo;

    #[async_trait]
    impl RoundTripper for Echo {
        async fn round_trip(&self, request: Request<Body>) -> GatewayResult<Response<Body>> {
            let trail: Vec<String> = request
                .headers()
                .get_all("x-trail")
                .iter()
                .filter_map(|v| v.to_str().ok().map(str::to_string))
                .collect();
            let mut response = Response::new(Body::from(trail.join(",")));
            *response.status_mut() = StatusCode::OK;
            Ok(response)
        }
    }

    #[tokio::test]
    async fn test_tripperware_outer_first() {
        let tripperware = [
            Arc::new(Stamp("a")) as Arc<dyn Tripperware>,
            Arc::new(Stamp("b")) as Arc<dyn Tripperware>,
        ];
        let chain = compose_round_tripper(&tripperware, Arc::new(Echo));
        let response = chain.round_trip(Request::new(Body::empty())).await.unwrap();

        let on_response: Vec<&str> = response
            .headers()
            .get_all("x-trail")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(on_response, vec!["b", "a"]);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"a,b");
    }

    #[test]
    fn test_client_defaults() {
        let manifest = HttpClientKind.mutate(HttpClientKind.default_manifest());
        assert_eq!(manifest.spec.connect_timeout, Some(Duration::from_secs(10)));
        assert!(manifest.spec.timeout.is_none());
    }
}
