//! # Middleware Pipeline Integration Tests
//!
//! Composition of handlers declared as manifests: middleware ordering, path
//! prefixes, error handlers and access logging wired through references.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;

use resource_gateway::middleware::{compose, handler_fn};
use resource_gateway::{
    default_registry, ApiContext, ErrorKind, GatewayResult, Handler, Manifest, Middleware, Object, Registry, Resource,
};

type Log = Arc<Mutex<Vec<String>>>;

struct Tag {
    name: String,
    log: Log,
}

#[async_trait]
impl Middleware for Tag {
    async fn handle(&self, request: Request<Body>, next: &dyn Handler) -> Response<Body> {
        self.log.lock().push(format!("enter {}", self.name));
        let response = next.serve(request).await;
        self.log.lock().push(format!("exit {}", self.name));
        response
    }
}

impl Object for Tag {
    fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
        Some(self)
    }
}

struct Leaf {
    log: Log,
}

#[async_trait]
impl Handler for Leaf {
    async fn serve(&self, request: Request<Body>) -> Response<Body> {
        self.log.lock().push(format!("leaf {}", request.uri().path()));
        Response::new(Body::from("leaf"))
    }

    fn patterns(&self) -> Vec<String> {
        vec!["/items".to_string(), "assets/".to_string()]
    }

    fn methods(&self) -> Vec<Method> {
        vec![Method::POST, Method::GET, Method::GET]
    }
}

impl Object for Leaf {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

/// Test kind producing `Tag` middlewares named after the manifest
struct TagKind(Log);

#[async_trait]
impl Resource for TagKind {
    type Spec = serde_json::Value;

    const API_VERSION: &'static str = "test/v1";
    const KIND: &'static str = "Tag";

    async fn create(&self, _ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        Ok(Arc::new(Tag {
            name: manifest.metadata.name.clone(),
            log: self.0.clone(),
        }))
    }
}

struct LeafKind(Log);

#[async_trait]
impl Resource for LeafKind {
    type Spec = serde_json::Value;

    const API_VERSION: &'static str = "test/v1";
    const KIND: &'static str = "Leaf";

    async fn create(&self, _ctx: &ApiContext, _manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        Ok(Arc::new(Leaf { log: self.0.clone() }))
    }
}

fn registry(log: &Log) -> Registry {
    let registry = default_registry(0).unwrap();
    registry.register_resource(TagKind(log.clone())).unwrap();
    registry.register_resource(LeafKind(log.clone())).unwrap();
    registry
}

const DOCUMENTS: &str = "
apiVersion: test/v1
kind: Tag
metadata:
  name: a
---
apiVersion: test/v1
kind: Tag
metadata:
  name: b
---
apiVersion: test/v1
kind: Tag
metadata:
  name: c
---
apiVersion: test/v1
kind: Leaf
---
apiVersion: app/v1
kind: AccessLogMiddleware
metadata:
  name: access
spec:
  level: debug
  logHeaders: true
---
apiVersion: core/v1
kind: HTTPHandler
metadata:
  name: items
spec:
  pathPrefix: v1
  handler: {apiVersion: test/v1, kind: Leaf}
  middleware:
    - {apiVersion: app/v1, kind: AccessLogMiddleware, name: access}
    - {apiVersion: test/v1, kind: Tag, name: a}
    - {apiVersion: test/v1, kind: Tag, name: b}
    - {apiVersion: test/v1, kind: Tag, name: c}
";

#[tokio::test]
async fn test_declared_middlewares_run_outer_first() {
    let log = Log::default();
    let registry = registry(&log);
    let loaded = registry
        .load_documents(resource_gateway::Format::Yaml, DOCUMENTS.as_bytes())
        .await
        .unwrap();
    assert_eq!(loaded.len(), 6);

    let handler: Arc<dyn Handler> = registry.get_as("core/v1/HTTPHandler/default/items").await.unwrap();
    assert_eq!(handler.patterns(), vec!["/v1/items", "/v1/assets/"]);
    assert_eq!(handler.methods(), vec![Method::GET, Method::POST]);

    let response = handler
        .serve(Request::builder().uri("/v1/items").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        *log.lock(),
        vec!["enter a", "enter b", "enter c", "leaf /v1/items", "exit c", "exit b", "exit a"]
    );
}

#[tokio::test]
async fn test_handler_without_leaf_is_rejected() {
    let registry = default_registry(0).unwrap();
    let err = registry
        .load_documents(
            resource_gateway::Format::Yaml,
            b"apiVersion: core/v1\nkind: HTTPHandler\nmetadata:\n  name: empty\n",
        )
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::ProtoValidate));
}

#[tokio::test]
async fn test_wrong_capability_is_assertion() {
    let log = Log::default();
    let registry = registry(&log);
    let documents = "
apiVersion: test/v1
kind: Tag
metadata:
  name: a
---
apiVersion: core/v1
kind: HTTPHandler
metadata:
  name: broken
spec:
  handler: {apiVersion: test/v1, kind: Tag, name: a}
";
    registry
        .load_documents(resource_gateway::Format::Yaml, documents.as_bytes())
        .await
        .unwrap();

    let err = registry.get("core/v1/HTTPHandler/default/broken").await.err().unwrap();
    assert!(err.is(ErrorKind::Assertion));
    assert!(err.description.contains("Handler"));
}

#[tokio::test]
async fn test_configured_error_handler_renders_json() {
    let registry = default_registry(0).unwrap();
    let documents = "
apiVersion: core/v1
kind: ErrorHandler
metadata:
  name: verbose
spec:
  showDetail: true
---
apiVersion: app/v1
kind: CSRFMiddleware
metadata:
  name: strict
spec:
  secret: c2VjcmV0
  errorHandler: {apiVersion: core/v1, kind: ErrorHandler, name: verbose}
";
    registry
        .load_documents(resource_gateway::Format::Yaml, documents.as_bytes())
        .await
        .unwrap();
    let csrf: Arc<dyn Middleware> = registry.get_as("app/v1/CSRFMiddleware/default/strict").await.unwrap();

    let leaf: Arc<dyn Handler> = Arc::new(handler_fn(|_req: Request<Body>| async { Response::new(Body::empty()) }));
    let chain = compose(&[csrf], leaf);
    let response = chain
        .serve(
            Request::builder()
                .method(Method::DELETE)
                .uri("/items/1")
                .header(header::ACCEPT, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["type"], "invalid-token");
    assert!(value["description"].as_str().unwrap().contains("missing"));
}
