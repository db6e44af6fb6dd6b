//! # Distributed Tracing
//!
//! `app/v1/TracingMiddleware` materializes an interceptor that is both a
//! middleware (inbound) and a tripperware (outbound). Each direction keeps its own
//! depth counter in the request extensions; a span is named `"{depth}:middleware"`
//! or `"{depth}:tripperware"`.
//!
//! The parent span comes from the request extensions when an earlier interceptor
//! opened one, otherwise from W3C `traceparent` headers, otherwise the span is a
//! root. Only the outermost span of a direction (depth 0) injects its context back
//! into the headers and records the request tags and the response status.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response};
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self as sdktrace, Sampler, TracerProvider};
use opentelemetry_sdk::Resource as OtelResource;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::error::GatewayResult;
use crate::manifest::{Manifest, Violations};
use crate::middleware::handler::{Handler, Middleware};
use crate::middleware::tripperware::{RoundTripper, Tripperware};
use crate::registry::object::Concrete;
use crate::registry::{ApiContext, Capability, Object, Resource};

/// Inbound interceptor depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundDepth(pub u32);

/// Outbound interceptor depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboundDepth(pub u32);

/// Span context opened by the innermost interceptor so far
#[derive(Debug, Clone)]
pub struct SpanParent(pub Context);

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            self.0.insert(name, value);
        }
    }
}

/// Ends the span when dropped, on every exit path
struct SpanGuard(Context);

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.0.span().end();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn label(&self) -> &'static str {
        match self {
            Self::Inbound => "middleware",
            Self::Outbound => "tripperware",
        }
    }

    fn depth(&self, request: &Request<Body>) -> u32 {
        match self {
            Self::Inbound => request.extensions().get::<InboundDepth>().map_or(0, |d| d.0),
            Self::Outbound => request.extensions().get::<OutboundDepth>().map_or(0, |d| d.0),
        }
    }

    fn bump(&self, request: &mut Request<Body>, depth: u32) {
        match self {
            Self::Inbound => {
                request.extensions_mut().insert(InboundDepth(depth + 1));
            }
            Self::Outbound => {
                request.extensions_mut().insert(OutboundDepth(depth + 1));
            }
        }
    }
}

/// Tracing middleware and tripperware
pub struct TracingInterceptor {
    provider: TracerProvider,
    tracer: sdktrace::Tracer,
    propagator: TraceContextPropagator,
    header_tags: Vec<HeaderName>,
}

impl TracingInterceptor {
    pub fn new(spec: &TracingSpec) -> Self {
        let sampler = if spec.sampling_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if spec.sampling_ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(spec.sampling_ratio)
        };
        let config = sdktrace::config().with_sampler(sampler).with_resource(OtelResource::new(vec![
            KeyValue::new("service.name", spec.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]));

        let builder = TracerProvider::builder().with_config(config);
        let provider = match spec.exporter {
            ExporterKind::Stdout => builder
                .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
                .build(),
            ExporterKind::None => builder.build(),
        };
        let tracer = provider.tracer("resource-gateway");

        Self {
            provider,
            tracer,
            propagator: TraceContextPropagator::new(),
            header_tags: spec
                .header_tags
                .iter()
                .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
                .collect(),
        }
    }

    /// Flush finished spans to the exporter
    pub fn flush(&self) {
        for result in self.provider.force_flush() {
            if let Err(e) = result {
                debug!(error = %e, "span flush failed");
            }
        }
    }

    fn open(&self, request: &mut Request<Body>, direction: Direction) -> (Context, u32) {
        let depth = direction.depth(request);
        let parent = match request.extensions().get::<SpanParent>() {
            Some(parent) => parent.0.clone(),
            None => self.propagator.extract(&HeaderExtractor(request.headers())),
        };
        let kind = match direction {
            Direction::Inbound => SpanKind::Server,
            Direction::Outbound => SpanKind::Client,
        };
        let span = self
            .tracer
            .span_builder(format!("{}:{}", depth, direction.label()))
            .with_kind(kind)
            .start_with_context(&self.tracer, &parent);
        let cx = parent.with_span(span);

        direction.bump(request, depth);
        request.extensions_mut().insert(SpanParent(cx.clone()));

        if depth == 0 {
            self.propagator
                .inject_context(&cx, &mut HeaderInjector(request.headers_mut()));
            cx.span().set_attributes(self.request_tags(request));
        }
        (cx, depth)
    }

    fn request_tags(&self, request: &Request<Body>) -> Vec<KeyValue> {
        let headers = request.headers();
        let uri = request.uri();
        let header_str = |name: &HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

        let request_id = header_str(&HeaderName::from_static("x-request-id"))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let host = header_str(&header::HOST)
            .or_else(|| uri.host())
            .unwrap_or_default()
            .to_string();
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string())
            .unwrap_or_default();

        let mut tags = vec![
            KeyValue::new("http.request_id", request_id),
            KeyValue::new("http.scheme", uri.scheme_str().unwrap_or("http").to_string()),
            KeyValue::new("http.method", request.method().to_string()),
            KeyValue::new("http.path", uri.path().to_string()),
            KeyValue::new("http.query", uri.query().unwrap_or_default().to_string()),
            KeyValue::new("net.peer.addr", remote),
            KeyValue::new("http.host", host),
        ];
        for name in &self.header_tags {
            if let Some(value) = header_str(name) {
                tags.push(KeyValue::new(format!("http.header.{}", name.as_str()), value.to_string()));
            }
        }
        tags
    }
}

#[async_trait]
impl Middleware for TracingInterceptor {
    async fn handle(&self, mut request: Request<Body>, next: &dyn Handler) -> Response<Body> {
        let (cx, depth) = self.open(&mut request, Direction::Inbound);
        let _guard = SpanGuard(cx.clone());

        let response = next.serve(request).await;
        if depth == 0 {
            cx.span()
                .set_attribute(KeyValue::new("http.status_code", response.status().as_u16() as i64));
        }
        response
    }
}

#[async_trait]
impl Tripperware for TracingInterceptor {
    async fn intercept(&self, mut request: Request<Body>, next: &dyn RoundTripper) -> GatewayResult<Response<Body>> {
        let (cx, depth) = self.open(&mut request, Direction::Outbound);
        let _guard = SpanGuard(cx.clone());

        let result = next.round_trip(request).await;
        if depth == 0 {
            let status = result.as_ref().map_or(0, |r| r.status().as_u16() as i64);
            cx.span().set_attribute(KeyValue::new("http.status_code", status));
        }
        result
    }
}

impl Object for TracingInterceptor {
    fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
        Some(self)
    }

    fn as_tripperware(self: Arc<Self>) -> Option<Arc<dyn Tripperware>> {
        Some(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExporterKind {
    /// Spans are created and propagated but not exported
    #[default]
    None,
    Stdout,
}

/// Spec of `app/v1/TracingMiddleware`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TracingSpec {
    pub service_name: String,
    pub exporter: ExporterKind,
    pub sampling_ratio: f64,
    /// Request headers recorded as span tags
    pub header_tags: Vec<String>,
}

impl Default for TracingSpec {
    fn default() -> Self {
        Self {
            service_name: "resource-gateway".to_string(),
            exporter: ExporterKind::None,
            sampling_ratio: 1.0,
            header_tags: Vec::new(),
        }
    }
}

/// Descriptor of `app/v1/TracingMiddleware`
#[derive(Debug, Default)]
pub struct TracingKind;

#[async_trait]
impl Resource for TracingKind {
    type Spec = TracingSpec;

    const API_VERSION: &'static str = "app/v1";
    const KIND: &'static str = "TracingMiddleware";

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        let spec = &manifest.spec;
        violations.check(
            (0.0..=1.0).contains(&spec.sampling_ratio),
            "spec.samplingRatio",
            "must be between 0 and 1",
        );
        violations.check(!spec.service_name.is_empty(), "spec.serviceName", "must not be empty");
        for (i, name) in spec.header_tags.iter().enumerate() {
            violations.check(
                HeaderName::from_bytes(name.as_bytes()).is_ok(),
                &format!("spec.headerTags[{}]", i),
                format!("`{}` is not a header name", name),
            );
        }
    }

    async fn create(&self, _ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        info!(
            service = %manifest.spec.service_name,
            exporter = ?manifest.spec.exporter,
            sampling_ratio = manifest.spec.sampling_ratio,
            "tracing interceptor created"
        );
        Ok(Arc::new(TracingInterceptor::new(&manifest.spec)))
    }

    async fn delete(
        &self,
        _ctx: &ApiContext,
        _manifest: &Manifest<Self::Spec>,
        object: Option<Arc<dyn Object>>,
    ) -> GatewayResult<()> {
        if let Some(Concrete(interceptor)) = object.and_then(Concrete::<TracingInterceptor>::from_object) {
            interceptor.flush();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler::handler_fn;
    use parking_lot::Mutex;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn interceptor() -> TracingInterceptor {
        TracingInterceptor::new(&TracingSpec::default())
    }

    #[tokio::test]
    async fn test_root_span_continues_incoming_trace() {
        let seen = Arc::new(Mutex::new(None::<String>));
        let sink = seen.clone();
        let leaf = handler_fn(move |request: Request<Body>| {
            let sink = sink.clone();
            async move {
                *sink.lock() = request
                    .headers()
                    .get("traceparent")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Response::new(Body::empty())
            }
        });

        let request = Request::builder()
            .header("traceparent", TRACEPARENT)
            .body(Body::empty())
            .unwrap();
        interceptor().handle(request, &leaf).await;

        let traceparent = seen.lock().clone().unwrap();
        assert!(traceparent.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
        assert!(!traceparent.contains("00f067aa0ba902b7"));
    }

    #[tokio::test]
    async fn test_nested_interceptors_bump_depth() {
        let outer = Arc::new(interceptor());
        let inner: Arc<dyn Middleware> = Arc::new(interceptor());
        let depth = Arc::new(Mutex::new(0u32));
        let sink = depth.clone();
        let leaf: Arc<dyn Handler> = Arc::new(handler_fn(move |request: Request<Body>| {
            let sink = sink.clone();
            async move {
                *sink.lock() = request.extensions().get::<InboundDepth>().map_or(0, |d| d.0);
                Response::new(Body::empty())
            }
        }));

        let chain = crate::middleware::handler::compose(&[outer as Arc<dyn Middleware>, inner], leaf);
        chain.serve(Request::new(Body::empty())).await;
        assert_eq!(*depth.lock(), 2);
    }

    #[tokio::test]
    async fn test_outbound_depth_is_independent() {
        struct Capture(Arc<Mutex<(u32, u32, bool)>>);

        #[async_trait]
        impl RoundTripper for Capture {
            async fn round_trip(&self, request: Request<Body>) -> GatewayResult<Response<Body>> {
                let inbound = request.extensions().get::<InboundDepth>().map_or(0, |d| d.0);
                let outbound = request.extensions().get::<OutboundDepth>().map_or(0, |d| d.0);
                let traced = request.headers().contains_key("traceparent");
                *self.0.lock() = (inbound, outbound, traced);
                Ok(Response::new(Body::empty()))
            }
        }

        let captured = Arc::new(Mutex::new((0, 0, false)));
        let mut request = Request::new(Body::empty());
        request.extensions_mut().insert(InboundDepth(1));
        interceptor()
            .intercept(request, &Capture(captured.clone()))
            .await
            .unwrap();

        assert_eq!(*captured.lock(), (1, 1, true));
    }

    #[test]
    fn test_spec_fields() {
        let value = serde_json::to_value(TracingSpec::default()).unwrap();
        let mut fields: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        fields.sort_unstable();
        assert_eq!(fields, vec!["exporter", "headerTags", "samplingRatio", "serviceName"]);
    }
}
