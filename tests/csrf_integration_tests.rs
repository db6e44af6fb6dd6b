//! # CSRF Integration Tests
//!
//! CSRF middlewares declared as manifests, materialized through the registry and
//! exercised with real request chains.

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, Response, StatusCode};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use resource_gateway::middleware::session::SessionMiddleware;
use resource_gateway::middleware::{compose, handler_fn, ProxyHeaders, Session};
use resource_gateway::registry::Concrete;
use resource_gateway::{default_registry, Content, Format, Handler, Middleware, Registry};

type Seen = Arc<Mutex<Vec<(HeaderMap, Option<ProxyHeaders>)>>>;

fn recording_leaf(seen: Seen) -> Arc<dyn Handler> {
    Arc::new(handler_fn(move |request: Request<Body>| {
        let seen = seen.clone();
        async move {
            seen.lock().push((
                request.headers().clone(),
                request.extensions().get::<ProxyHeaders>().cloned(),
            ));
            Response::new(Body::from("upstream"))
        }
    }))
}

async fn load(registry: &Registry, yaml: &str) {
    registry
        .post(Format::Yaml, Content::Yaml(Bytes::copy_from_slice(yaml.as_bytes())))
        .await
        .unwrap();
}

async fn send(handler: &Arc<dyn Handler>, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let response = handler.serve(request).await;
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .unwrap()
}

const DEFAULT_CSRF: &str = "
apiVersion: app/v1
kind: CSRFMiddleware
metadata:
  name: plain
spec:
  secret: c2VjcmV0LXNlY3JldA==
";

const DOUBLE_SUBMIT: &str = "
apiVersion: app/v1
kind: CSRFMiddleware
metadata:
  name: double
spec:
  secret: c2VjcmV0LXNlY3JldA==
  proxyHeaderName: X-Csrf-Token
  patterns: [/csrf]
  strategy:
    doubleSubmitCookies:
      cookieName: __csrfToken
      source:
        tokenSource: Header
        sourceKey: __csrfToken
";

const SYNCHRONIZER: &str = "
apiVersion: app/v1
kind: CSRFMiddleware
metadata:
  name: sync
spec:
  secret: c2VjcmV0LXNlY3JldA==
  proxyHeaderName: X-Csrf-Token
  strategy:
    synchronizerToken:
      source:
        tokenSource: Header
        sourceKey: X-Token
";

const SESSION: &str = "
apiVersion: app/v1
kind: SessionMiddleware
metadata:
  name: sessions
";

#[tokio::test]
async fn test_default_strategy_requires_requested_with() {
    let registry = default_registry(0).unwrap();
    load(&registry, DEFAULT_CSRF).await;
    let csrf: Arc<dyn Middleware> = registry.get_as("app/v1/CSRFMiddleware/default/plain").await.unwrap();

    let seen = Seen::default();
    let chain = compose(&[csrf], recording_leaf(seen.clone()));

    let bare = Request::builder().method(Method::POST).uri("/orders").body(Body::empty()).unwrap();
    assert_eq!(send(&chain, bare).await.0, StatusCode::FORBIDDEN);

    let ajax = Request::builder()
        .method(Method::POST)
        .uri("/orders")
        .header("X-Requested-With", "XMLHttpRequest")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&chain, ajax).await.0, StatusCode::OK);
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_double_submit_mismatch_is_forbidden() {
    let registry = default_registry(0).unwrap();
    load(&registry, DOUBLE_SUBMIT).await;
    let csrf: Arc<dyn Middleware> = registry.get_as("app/v1/CSRFMiddleware/default/double").await.unwrap();

    let seen = Seen::default();
    let chain = compose(&[csrf], recording_leaf(seen.clone()));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/orders")
        .header(header::COOKIE, "__csrfToken=A")
        .header("__csrfToken", "B")
        .header("X-Csrf-Token", "forged")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&chain, request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_double_submit_round_trip() {
    let registry = default_registry(0).unwrap();
    load(&registry, DOUBLE_SUBMIT).await;
    let key = "app/v1/CSRFMiddleware/default/double";
    let issue: Arc<dyn Handler> = registry.get_as(key).await.unwrap();
    let csrf: Arc<dyn Middleware> = registry.get_as(key).await.unwrap();
    assert_eq!(issue.patterns(), vec!["/csrf"]);

    let (status, headers, token) = send(&issue, Request::new(Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cookie_value(&headers, "__csrfToken"), token);

    let seen = Seen::default();
    let chain = compose(&[csrf], recording_leaf(seen.clone()));
    let request = Request::builder()
        .method(Method::PUT)
        .uri("/orders/1")
        .header(header::COOKIE, format!("__csrfToken={}", token))
        .header("__csrfToken", token.as_str())
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&chain, request).await.0, StatusCode::OK);

    let seen = seen.lock();
    let carried = seen[0].1.as_ref().unwrap();
    assert_eq!(carried.0["x-csrf-token"], token.as_str());
}

#[tokio::test]
async fn test_proxy_header_stripped_from_unverified_requests() {
    let registry = default_registry(0).unwrap();
    load(&registry, DOUBLE_SUBMIT).await;
    let csrf: Arc<dyn Middleware> = registry.get_as("app/v1/CSRFMiddleware/default/double").await.unwrap();

    let seen = Seen::default();
    let chain = compose(&[csrf], recording_leaf(seen.clone()));

    let mut request = Request::builder()
        .uri("/orders")
        .header("X-Csrf-Token", "forged")
        .body(Body::empty())
        .unwrap();
    let mut carried = HeaderMap::new();
    carried.insert("x-csrf-token", "forged-too".parse().unwrap());
    request.extensions_mut().insert(ProxyHeaders(carried));

    assert_eq!(send(&chain, request).await.0, StatusCode::OK);

    let seen = seen.lock();
    let (headers, carried) = &seen[0];
    assert!(!headers.contains_key("x-csrf-token"));
    assert!(!carried.as_ref().unwrap().0.contains_key("x-csrf-token"));
}

#[tokio::test]
async fn test_synchronizer_token_success() {
    let registry = default_registry(0).unwrap();
    load(&registry, SESSION).await;
    load(&registry, SYNCHRONIZER).await;

    let session_key = "app/v1/SessionMiddleware/default/sessions";
    let csrf_key = "app/v1/CSRFMiddleware/default/sync";
    let sessions: Arc<dyn Middleware> = registry.get_as(session_key).await.unwrap();
    let Concrete(store) = registry.get_as::<Concrete<SessionMiddleware>>(session_key).await.unwrap();
    let csrf: Arc<dyn Middleware> = registry.get_as(csrf_key).await.unwrap();
    let issue: Arc<dyn Handler> = registry.get_as(csrf_key).await.unwrap();

    let issue_chain = compose(&[sessions.clone()], issue);
    let (status, headers, token) = send(&issue_chain, Request::new(Body::empty())).await;
    assert_eq!(status, StatusCode::OK);

    let session_id = cookie_value(&headers, "__session");
    let session = store.session(&session_id).unwrap();
    assert_eq!(session.get("__csrfToken").await, Some(token.clone()));

    let seen = Seen::default();
    let chain = compose(&[sessions, csrf], recording_leaf(seen.clone()));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/transfer")
        .header(header::COOKIE, format!("__session={}", session_id))
        .header("X-Token", token.as_str())
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&chain, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "upstream");
    let seen = seen.lock();
    assert_eq!(seen[0].1.as_ref().unwrap().0["x-csrf-token"], token.as_str());
}

#[tokio::test]
async fn test_issue_endpoint_json_negotiation() {
    let registry = default_registry(0).unwrap();
    load(&registry, DEFAULT_CSRF).await;
    let issue: Arc<dyn Handler> = registry.get_as("app/v1/CSRFMiddleware/default/plain").await.unwrap();

    let request = Request::builder()
        .header(header::ACCEPT, "application/json")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&issue, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(headers[header::CACHE_CONTROL], "no-store");
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");

    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    let token = value["token"].as_str().unwrap();
    assert_eq!(token.len(), 2 * (20 + 32));
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

const MOUNTED_ISSUER: &str = "
apiVersion: core/v1
kind: HTTPHandler
metadata:
  name: issue
spec:
  pathPrefix: /auth
  handler: {apiVersion: app/v1, kind: CSRFMiddleware, name: sync}
  middleware:
    - {apiVersion: app/v1, kind: SessionMiddleware, name: sessions}
";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_issue_endpoint_mounted_on_worker_threads() {
    let registry = default_registry(0).unwrap();
    load(&registry, SESSION).await;
    load(&registry, SYNCHRONIZER).await;
    load(&registry, MOUNTED_ISSUER).await;
    let issue: Arc<dyn Handler> = registry.get_as("core/v1/HTTPHandler/default/issue").await.unwrap();
    let Concrete(store) = registry
        .get_as::<Concrete<SessionMiddleware>>("app/v1/SessionMiddleware/default/sessions")
        .await
        .unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let issue = issue.clone();
            tokio::spawn(async move { send(&issue, Request::new(Body::empty())).await })
        })
        .collect();

    for task in tasks {
        let (status, headers, token) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let session = store.session(&cookie_value(&headers, "__session")).unwrap();
        assert_eq!(session.get("__csrfToken").await, Some(token));
    }
}
