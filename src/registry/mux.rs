//! Registry multiplexer.
//!
//! The [`Registry`] routes requests to per-kind handlers by longest matching key
//! prefix. Keys have the form `apiVersion/kind/namespace/name`; every kind registers
//! the prefix `apiVersion/kind/`.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::context::ApiContext;
use super::inflight::InFlight;
use super::object::{Capability, Object};
use super::resource::{Resource, ResourceApi};
use crate::core::error::{ErrorKind, GatewayError, GatewayResult};
use crate::manifest::decoder::split_documents;
use crate::manifest::{Content, Format, Manifest, ResourceId};

/// Registry request method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

impl FromStr for ApiMethod {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(GatewayError::new(
                ErrorKind::NoMethod,
                "registry",
                format!("unknown method `{}`", other),
            )),
        }
    }
}

/// Representation requested by a GET
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accept {
    /// Return the live object
    #[default]
    Materialize,
    Json,
    Yaml,
    /// Return the manifest as a structured value
    Message,
}

/// A request to the registry
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub key: String,
    pub format: Format,
    pub content: Content,
    pub accept: Accept,
}

impl ApiRequest {
    pub fn new(method: ApiMethod, key: impl Into<String>) -> Self {
        Self {
            method,
            key: key.into(),
            format: Format::Message,
            content: Content::Empty,
            accept: Accept::Materialize,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(ApiMethod::Get, key)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(ApiMethod::Delete, key)
    }

    /// A POST whose key is derived from the content's `apiVersion/kind`
    pub fn post(format: Format, content: Content) -> GatewayResult<Self> {
        let key = format!("{}/", content.type_meta()?.key());
        Ok(Self::new(ApiMethod::Post, key).with_content(format, content))
    }

    pub fn with_content(mut self, format: Format, content: Content) -> Self {
        self.format = format;
        self.content = content;
        self
    }

    pub fn with_accept(mut self, accept: Accept) -> Self {
        self.accept = accept;
        self
    }
}

/// A registry response
#[derive(Clone)]
pub enum ApiResponse {
    Empty,
    Bytes(Bytes),
    Message(Value),
    Object(Arc<dyn Object>),
}

impl ApiResponse {
    fn shape(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Bytes(_) => "bytes",
            Self::Message(_) => "message",
            Self::Object(_) => "object",
        }
    }

    pub fn into_object(self) -> GatewayResult<Arc<dyn Object>> {
        match self {
            Self::Object(object) => Ok(object),
            other => Err(GatewayError::assertion("registry", "object", other.shape())),
        }
    }

    pub fn into_bytes(self) -> GatewayResult<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            other => Err(GatewayError::assertion("registry", "bytes", other.shape())),
        }
    }

    pub fn into_message(self) -> GatewayResult<Value> {
        match self {
            Self::Message(value) => Ok(value),
            other => Err(GatewayError::assertion("registry", "message", other.shape())),
        }
    }
}

impl fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(object) => write!(f, "Object({})", object.type_name()),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Message(value) => write!(f, "Message({})", value),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

/// Anything that can serve registry requests
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn serve(&self, ctx: &ApiContext, request: ApiRequest) -> GatewayResult<ApiResponse>;

    /// Delete every stored resource
    async fn teardown(&self, _ctx: &ApiContext) -> GatewayResult<()> {
        Ok(())
    }
}

struct RegistryInner {
    // sorted lexicographically descending, so the first match is the longest
    routes: RwLock<Vec<(String, Arc<dyn ApiHandler>)>>,
    inflight: Arc<InFlight>,
    debug_level: u8,
}

/// Longest-prefix multiplexer over resource handlers
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("prefixes", &self.prefixes())
            .field("debug_level", &self.inner.debug_level)
            .finish()
    }
}

impl Registry {
    pub fn new(debug_level: u8) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                routes: RwLock::new(Vec::new()),
                inflight: Arc::new(InFlight::new()),
                debug_level,
            }),
        }
    }

    pub fn debug_level(&self) -> u8 {
        self.inner.debug_level
    }

    /// Register a handler under a key prefix
    pub fn register(&self, prefix: impl Into<String>, handler: Arc<dyn ApiHandler>) -> GatewayResult<()> {
        let prefix = prefix.into();
        let mut routes = self.inner.routes.write();
        if routes.iter().any(|(existing, _)| *existing == prefix) {
            return Err(GatewayError::duplicate_key("registry", prefix));
        }
        routes.push((prefix, handler));
        routes.sort_by(|(a, _), (b, _)| b.cmp(a));
        Ok(())
    }

    /// Register a resource descriptor under `apiVersion/kind/`
    pub fn register_resource<R: Resource>(&self, resource: R) -> GatewayResult<()> {
        let api = ResourceApi::new(resource, self.inner.debug_level);
        self.register(ResourceApi::<R>::prefix(), Arc::new(api))
    }

    /// Registered prefixes, longest match first
    pub fn prefixes(&self) -> Vec<String> {
        self.inner.routes.read().iter().map(|(prefix, _)| prefix.clone()).collect()
    }

    fn lookup(&self, key: &str) -> GatewayResult<Arc<dyn ApiHandler>> {
        self.inner
            .routes
            .read()
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| GatewayError::no_api(key))
    }

    /// POST a manifest given as raw content
    pub async fn post(&self, format: Format, content: Content) -> GatewayResult<()> {
        let request = ApiRequest::post(format, content)?;
        self.serve(&ApiContext::new(), request).await.map(|_| ())
    }

    /// POST a typed manifest
    pub async fn post_manifest<S: Serialize>(&self, manifest: &Manifest<S>) -> GatewayResult<()> {
        self.post(Format::Message, Content::manifest(manifest)?).await
    }

    /// Materialize the object behind an identity key
    pub async fn get(&self, key: &str) -> GatewayResult<Arc<dyn Object>> {
        self.serve(&ApiContext::new(), ApiRequest::get(key))
            .await?
            .into_object()
    }

    /// Materialize and assert a capability
    pub async fn get_as<C: Capability>(&self, key: &str) -> GatewayResult<C> {
        let object = self.get(key).await?;
        let observed = object.type_name();
        C::from_object(object).ok_or_else(|| GatewayError::assertion("registry", C::name(), observed))
    }

    /// Render a stored manifest, or a kind's template for `…/template/template`
    pub async fn get_rendered(&self, key: &str, accept: Accept) -> GatewayResult<ApiResponse> {
        self.serve(&ApiContext::new(), ApiRequest::get(key).with_accept(accept))
            .await
    }

    pub async fn delete(&self, key: &str) -> GatewayResult<()> {
        self.serve(&ApiContext::new(), ApiRequest::delete(key))
            .await
            .map(|_| ())
    }

    /// POST every document of a manifest file, returning their identities
    pub async fn load_documents(&self, format: Format, input: &[u8]) -> GatewayResult<Vec<ResourceId>> {
        let mut loaded = Vec::new();
        for document in split_documents(format, input)? {
            let id = Manifest::<Value>::from_value(document.clone())?.id();
            let request = ApiRequest::post(Format::Message, Content::Message(document))?;
            self.serve(&ApiContext::new(), request).await?;
            loaded.push(id);
        }
        Ok(loaded)
    }

    /// Load a manifest file, choosing the format by extension
    pub async fn load_file(&self, path: &Path) -> GatewayResult<Vec<ResourceId>> {
        let format = Format::from_path(path)?;
        let input = tokio::fs::read(path)
            .await
            .map_err(|e| GatewayError::io("registry", format!("failed to read {}", path.display())).wrap(e))?;
        let loaded = self.load_documents(format, &input).await?;
        debug!(path = %path.display(), resources = loaded.len(), "manifest file loaded");
        Ok(loaded)
    }

    /// Delete every resource of every kind, returning the first failure
    pub async fn teardown(&self) -> GatewayResult<()> {
        let handlers: Vec<Arc<dyn ApiHandler>> = self
            .inner
            .routes
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        let ctx = ApiContext::new().with_route(Arc::new(self.clone()));
        let mut first_error = None;
        for handler in handlers {
            if let Err(e) = handler.teardown(&ctx).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ApiHandler for Registry {
    async fn serve(&self, ctx: &ApiContext, request: ApiRequest) -> GatewayResult<ApiResponse> {
        if self.inner.debug_level >= 2 {
            debug!(method = %request.method, key = %request.key, "registry request");
        }
        let handler = self.lookup(&request.key)?;
        let ctx = ctx
            .with_route(Arc::new(self.clone()))
            .with_inflight(&self.inner.inflight);
        handler.serve(&ctx, request).await
    }

    async fn teardown(&self, _ctx: &ApiContext) -> GatewayResult<()> {
        Registry::teardown(self).await
    }
}
