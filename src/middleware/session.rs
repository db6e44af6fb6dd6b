//! # Sessions
//!
//! Server-side session state handed to downstream handlers through request
//! extensions. The synchronizer-token CSRF strategy reads its secret from here.
//!
//! `app/v1/SessionMiddleware` keeps sessions in memory, keyed by a random id
//! carried in a cookie. A session is only stored, and its cookie only set, once a
//! handler writes to it. Sessions idle for longer than `idleTimeout` are dropped
//! on lookup and by a periodic sweep.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::GatewayResult;
use crate::manifest::{Manifest, Violations};
use crate::middleware::handler::{Handler, Middleware};
use crate::registry::{ApiContext, Object, Resource};

/// Key/value session storage
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: String) -> GatewayResult<()>;

    async fn delete(&self, key: &str) -> GatewayResult<()>;
}

/// Request extension carrying the current session
#[derive(Clone)]
pub struct SessionHandle(pub Arc<dyn Session>);

impl SessionHandle {
    pub fn from_request(request: &Request<Body>) -> Option<Arc<dyn Session>> {
        request.extensions().get::<SessionHandle>().map(|s| s.0.clone())
    }
}

/// Session held in process memory
#[derive(Debug)]
pub struct MemorySession {
    id: String,
    values: DashMap<String, String>,
    last_seen: Mutex<Instant>,
}

impl MemorySession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: DashMap::new(),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn expired(&self, idle_timeout: Duration) -> bool {
        self.last_seen.lock().elapsed() >= idle_timeout
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: String) -> GatewayResult<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// Read a cookie value from the `Cookie` headers
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
}

/// Attributes of an emitted cookie
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CookieAttributes {
    pub path: String,
    pub domain: String,
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    pub secure: bool,
    pub http_only: bool,
    /// `Strict`, `Lax`, `None` or empty to omit
    pub same_site: String,
}

impl Default for CookieAttributes {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: String::new(),
            max_age: None,
            secure: false,
            http_only: true,
            same_site: "Lax".to_string(),
        }
    }
}

impl CookieAttributes {
    pub fn validate(&self, field: &str, violations: &mut Violations) {
        violations.check(
            matches!(self.same_site.as_str(), "" | "Strict" | "Lax" | "None"),
            &format!("{}.sameSite", field),
            format!("`{}` is not one of Strict, Lax, None", self.same_site),
        );
    }

    /// Render a `Set-Cookie` header value
    pub fn render(&self, name: &str, value: &str) -> Option<HeaderValue> {
        let mut cookie = format!("{}={}", name, value);
        if !self.path.is_empty() {
            cookie.push_str(&format!("; Path={}", self.path));
        }
        if !self.domain.is_empty() {
            cookie.push_str(&format!("; Domain={}", self.domain));
        }
        if let Some(max_age) = self.max_age {
            cookie.push_str(&format!("; Max-Age={}", max_age.as_secs()));
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if !self.same_site.is_empty() {
            cookie.push_str(&format!("; SameSite={}", self.same_site));
        }
        HeaderValue::from_str(&cookie).ok()
    }
}

/// Attaches an in-memory session to every request
pub struct SessionMiddleware {
    cookie_name: String,
    cookie: CookieAttributes,
    idle_timeout: Duration,
    sessions: DashMap<String, Arc<MemorySession>>,
    last_sweep: Mutex<Instant>,
}

impl SessionMiddleware {
    pub fn new(spec: &SessionSpec) -> Self {
        Self {
            cookie_name: spec.cookie_name.clone(),
            cookie: spec.cookie.clone(),
            idle_timeout: spec.idle_timeout,
            sessions: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Look up a live session by id, refreshing its idle timer
    pub fn session(&self, id: &str) -> Option<Arc<MemorySession>> {
        let session = self.sessions.get(id).map(|s| s.clone())?;
        if session.expired(self.idle_timeout) {
            self.sessions.remove(id);
            debug!(session = %id, "session expired");
            return None;
        }
        session.touch();
        Some(session)
    }

    /// Number of stored sessions, expired ones included until swept
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every expired session, at most once per idle timeout
    fn sweep(&self) {
        {
            let mut last_sweep = self.last_sweep.lock();
            if last_sweep.elapsed() < self.idle_timeout {
                return;
            }
            *last_sweep = Instant::now();
        }
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.expired(self.idle_timeout));
        let dropped = before.saturating_sub(self.sessions.len());
        if dropped > 0 {
            debug!(dropped, remaining = self.sessions.len(), "expired sessions swept");
        }
    }
}

#[async_trait]
impl Middleware for SessionMiddleware {
    async fn handle(&self, mut request: Request<Body>, next: &dyn Handler) -> Response<Body> {
        self.sweep();
        let existing = read_cookie(request.headers(), &self.cookie_name).and_then(|id| self.session(&id));
        let (session, created) = match existing {
            Some(session) => (session, false),
            // stored only once something is written to it
            None => (Arc::new(MemorySession::new(Uuid::new_v4().simple().to_string())), true),
        };

        request.extensions_mut().insert(SessionHandle(session.clone()));
        let mut response = next.serve(request).await;

        if created && !session.is_empty() {
            let id = session.id().to_string();
            match self.cookie.render(&self.cookie_name, &id) {
                Some(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                    debug!(session = %id, "session created");
                    self.sessions.insert(id, session);
                }
                None => warn!(cookie = %self.cookie_name, "session cookie is not a valid header value"),
            }
        }
        response
    }
}

impl Object for SessionMiddleware {
    fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
        Some(self)
    }
}

/// Spec of `app/v1/SessionMiddleware`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSpec {
    pub cookie_name: String,
    pub cookie: CookieAttributes,
    /// Sessions unused for this long are dropped
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            cookie_name: "__session".to_string(),
            cookie: CookieAttributes::default(),
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

/// Descriptor of `app/v1/SessionMiddleware`
#[derive(Debug, Default)]
pub struct SessionKind;

#[async_trait]
impl Resource for SessionKind {
    type Spec = SessionSpec;

    const API_VERSION: &'static str = "app/v1";
    const KIND: &'static str = "SessionMiddleware";

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        violations.check(
            !manifest.spec.cookie_name.is_empty(),
            "spec.cookieName",
            "must not be empty",
        );
        violations.check(
            !manifest.spec.idle_timeout.is_zero(),
            "spec.idleTimeout",
            "must be greater than zero",
        );
        manifest.spec.cookie.validate("spec.cookie", violations);
    }

    async fn create(&self, _ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        Ok(Arc::new(SessionMiddleware::new(&manifest.spec)))
    }
}
