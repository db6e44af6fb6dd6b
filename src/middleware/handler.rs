//! # Handler Composition
//!
//! Leaf handlers serve requests and declare the URL patterns and methods they
//! accept. Middlewares wrap a `next` handler; a list `[A, B, C]` composes as
//! `A(B(C(leaf)))`, so requests enter outer-first and responses leave inner-first.
//!
//! The `core/v1/HTTPHandler` kind composes a referenced leaf with referenced
//! middlewares and an optional path prefix.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use crate::core::error::GatewayResult;
use crate::manifest::{validate_reference, Manifest, Reference, Violations};
use crate::registry::resolver::{resolve_typed, resolve_typed_many};
use crate::registry::{ApiContext, Object, Resource};

/// A request handler
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, request: Request<Body>) -> Response<Body>;

    /// URL patterns this handler accepts; empty accepts every path
    fn patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Methods this handler accepts; empty accepts every method
    fn methods(&self) -> Vec<Method> {
        Vec::new()
    }
}

/// A request-path interceptor
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: Request<Body>, next: &dyn Handler) -> Response<Body>;
}

struct Layered {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Layered {
    async fn serve(&self, request: Request<Body>) -> Response<Body> {
        self.middleware.handle(request, self.next.as_ref()).await
    }

    fn patterns(&self) -> Vec<String> {
        self.next.patterns()
    }

    fn methods(&self) -> Vec<Method> {
        self.next.methods()
    }
}

/// Wrap `leaf` with `middlewares`, the first element outermost
pub fn compose(middlewares: &[Arc<dyn Middleware>], leaf: Arc<dyn Handler>) -> Arc<dyn Handler> {
    middlewares.iter().rev().fold(leaf, |next, middleware| {
        Arc::new(Layered {
            middleware: middleware.clone(),
            next,
        })
    })
}

/// Lexically clean a URL path, keeping a trailing slash
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut cleaned = format!("/{}", segments.join("/"));
    if path.ends_with('/') && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

/// Prefix every pattern with `/prefix`; an empty prefix leaves patterns as they are
pub fn join_patterns(prefix: &str, patterns: &[String]) -> Vec<String> {
    if prefix.is_empty() {
        return patterns.to_vec();
    }
    patterns
        .iter()
        .map(|pattern| clean_path(&format!("/{}/{}", prefix, pattern)))
        .collect()
}

/// Sort methods by name and drop duplicates
pub fn normalize_methods(methods: Vec<Method>) -> Vec<Method> {
    let mut methods = methods;
    methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    methods.dedup();
    methods
}

/// Handler built from an async closure
pub struct FnHandler<F> {
    f: F,
    patterns: Vec<String>,
    methods: Vec<Method>,
}

/// Wrap a closure as a handler accepting every path and method
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Body>> + Send,
{
    FnHandler {
        f,
        patterns: Vec::new(),
        methods: Vec::new(),
    }
}

impl<F> FnHandler<F> {
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Body>> + Send,
{
    async fn serve(&self, request: Request<Body>) -> Response<Body> {
        (self.f)(request).await
    }

    fn patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    fn methods(&self) -> Vec<Method> {
        self.methods.clone()
    }
}

impl<F, Fut> Object for FnHandler<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

/// A leaf handler wrapped by middlewares under an optional prefix
pub struct ComposedHandler {
    chain: Arc<dyn Handler>,
    patterns: Vec<String>,
    methods: Vec<Method>,
}

impl ComposedHandler {
    pub fn new(leaf: Arc<dyn Handler>, middlewares: &[Arc<dyn Middleware>], path_prefix: &str) -> Self {
        let patterns = join_patterns(path_prefix, &leaf.patterns());
        let methods = normalize_methods(leaf.methods());
        Self {
            chain: compose(middlewares, leaf),
            patterns,
            methods,
        }
    }
}

#[async_trait]
impl Handler for ComposedHandler {
    async fn serve(&self, request: Request<Body>) -> Response<Body> {
        self.chain.serve(request).await
    }

    fn patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    fn methods(&self) -> Vec<Method> {
        self.methods.clone()
    }
}

impl Object for ComposedHandler {
    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        Some(self)
    }
}

/// Spec of `core/v1/HTTPHandler`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpHandlerSpec {
    pub handler: Option<Reference>,
    pub middleware: Vec<Reference>,
    pub path_prefix: String,
}

/// Descriptor of `core/v1/HTTPHandler`
#[derive(Debug, Default)]
pub struct HttpHandlerKind;

#[async_trait]
impl Resource for HttpHandlerKind {
    type Spec = HttpHandlerSpec;

    const API_VERSION: &'static str = "core/v1";
    const KIND: &'static str = "HTTPHandler";

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        match &manifest.spec.handler {
            Some(handler) => validate_reference("spec.handler", handler, violations),
            None => violations.push("spec.handler", "a leaf handler is required"),
        }
        for (i, middleware) in manifest.spec.middleware.iter().enumerate() {
            validate_reference(&format!("spec.middleware[{}]", i), middleware, violations);
        }
    }

    async fn create(&self, ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        let leaf: Arc<dyn Handler> = resolve_typed(ctx, manifest.spec.handler.as_ref()).await?;
        let middlewares: Vec<Arc<dyn Middleware>> = resolve_typed_many(ctx, &manifest.spec.middleware).await?;
        Ok(Arc::new(ComposedHandler::new(leaf, &middlewares, &manifest.spec.path_prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, request: Request<Body>, next: &dyn Handler) -> Response<Body> {
            self.log.lock().push(format!("enter {}", self.name));
            let response = next.serve(request).await;
            self.log.lock().push(format!("exit {}", self.name));
            response
        }
    }

    #[tokio::test]
    async fn test_middlewares_run_outer_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let leaf_log = log.clone();
        let leaf = Arc::new(handler_fn(move |_req: Request<Body>| {
            let log = leaf_log.clone();
            async move {
                log.lock().push("leaf".to_string());
                Response::new(Body::empty())
            }
        }));
        let middlewares: Vec<Arc<dyn Middleware>> = ["A", "B", "C"]
            .into_iter()
            .map(|name| Arc::new(Recorder { name, log: log.clone() }) as Arc<dyn Middleware>)
            .collect();

        let chain = compose(&middlewares, leaf);
        chain.serve(Request::new(Body::empty())).await;

        assert_eq!(
            *log.lock(),
            vec!["enter A", "enter B", "enter C", "leaf", "exit C", "exit B", "exit A"]
        );
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("//api/./v1/../users"), "/api/users");
        assert_eq!(clean_path("/api/users/"), "/api/users/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("//"), "/");
    }

    #[test]
    fn test_join_patterns_with_prefix() {
        let patterns = vec!["/users".to_string(), "static/".to_string()];
        assert_eq!(join_patterns("api", &patterns), vec!["/api/users", "/api/static/"]);
        assert_eq!(join_patterns("", &patterns), patterns);
    }

    #[tokio::test]
    async fn test_composed_handler_inherits_leaf_methods() {
        let leaf = Arc::new(
            handler_fn(|_req: Request<Body>| async { Response::new(Body::empty()) })
                .with_patterns(["/items"])
                .with_methods(vec![Method::POST, Method::GET, Method::POST]),
        );
        let composed = ComposedHandler::new(leaf, &[], "v1");
        assert_eq!(composed.methods(), vec![Method::GET, Method::POST]);
        assert_eq!(composed.patterns(), vec!["/v1/items"]);
    }
}
