//! Resource descriptors and their per-kind stores.
//!
//! A [`Resource`] describes one `apiVersion/kind`: its default manifest, how a
//! decoded manifest is normalized and validated, and how a live object is created
//! from it. [`ResourceApi`] wraps a descriptor with the manifest and object stores
//! and serves registry requests for that kind.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use super::context::ApiContext;
use super::inflight::{Claim, InFlight};
use super::mux::{Accept, ApiHandler, ApiMethod, ApiRequest, ApiResponse};
use super::object::Object;
use crate::core::error::{ErrorKind, GatewayError, GatewayResult};
use crate::manifest::decoder::Decoded;
use crate::manifest::validate::render_with_line_numbers;
use crate::manifest::{decode, validate_identity, Manifest, ResourceId, Violations};

/// Descriptor for one resource kind
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    type Spec: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static;

    const API_VERSION: &'static str;
    const KIND: &'static str;

    /// Fresh default manifest that decoded documents are merged onto
    fn default_manifest(&self) -> Manifest<Self::Spec> {
        Manifest::new(Self::API_VERSION, Self::KIND)
    }

    /// Normalize a decoded manifest, filling defaults
    fn mutate(&self, manifest: Manifest<Self::Spec>) -> Manifest<Self::Spec> {
        manifest
    }

    /// Record kind-specific violations; identity fields are checked by the store
    fn validate(&self, _manifest: &Manifest<Self::Spec>, _violations: &mut Violations) {}

    /// Materialize a live object
    async fn create(
        &self,
        ctx: &ApiContext,
        manifest: &Manifest<Self::Spec>,
    ) -> GatewayResult<Arc<dyn Object>>;

    /// Release whatever `create` acquired
    async fn delete(
        &self,
        _ctx: &ApiContext,
        _manifest: &Manifest<Self::Spec>,
        _object: Option<Arc<dyn Object>>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}

/// Registry handler owning the manifests and objects of one kind
pub struct ResourceApi<R: Resource> {
    resource: R,
    manifests: DashMap<ResourceId, Manifest<R::Spec>>,
    objects: DashMap<ResourceId, Arc<dyn Object>>,
    // used when the caller's context carries no registry table
    inflight: Arc<InFlight>,
    debug_level: u8,
}

impl<R: Resource> ResourceApi<R> {
    pub fn new(resource: R, debug_level: u8) -> Self {
        Self {
            resource,
            manifests: DashMap::new(),
            objects: DashMap::new(),
            inflight: Arc::new(InFlight::new()),
            debug_level,
        }
    }

    /// Routing prefix under which this kind is registered
    pub fn prefix() -> String {
        format!("{}/{}/", R::API_VERSION, R::KIND)
    }

    fn check(&self, manifest: &Manifest<R::Spec>) -> GatewayResult<()> {
        let mut violations = Violations::new();
        validate_identity(
            &manifest.api_version,
            &manifest.kind,
            &manifest.metadata,
            &mut violations,
        );
        if manifest.api_version != R::API_VERSION || manifest.kind != R::KIND {
            violations.push(
                "kind",
                format!(
                    "`{}/{}` posted to `{}/{}`",
                    manifest.api_version,
                    manifest.kind,
                    R::API_VERSION,
                    R::KIND
                ),
            );
        }
        self.resource.validate(manifest, &mut violations);
        violations.finish(manifest)
    }

    fn target(&self, request: &ApiRequest) -> GatewayResult<ResourceId> {
        match &request.content {
            crate::manifest::Content::Empty => ResourceId::parse(&request.key),
            _ => {
                let default = self.resource.default_manifest();
                Ok(decode(request.format, request.content.clone(), &default)?.id())
            }
        }
    }

    fn post(&self, request: ApiRequest) -> GatewayResult<ApiResponse> {
        let default = self.resource.default_manifest();
        let manifest = match decode(request.format, request.content, &default)? {
            Decoded::Manifest(manifest) => manifest,
            Decoded::Reference(reference) => {
                return Err(GatewayError::new(
                    ErrorKind::Assertion,
                    "registry",
                    format!("cannot create `{}` from a reference", reference),
                ))
            }
        };
        let manifest = self.resource.mutate(manifest);
        self.check(&manifest)?;

        let id = manifest.id();
        match self.manifests.entry(id.clone()) {
            Entry::Occupied(_) => Err(GatewayError::duplicate_key("registry", id.to_string())),
            Entry::Vacant(slot) => {
                debug!(id = %id, "manifest stored");
                slot.insert(manifest);
                Ok(ApiResponse::Empty)
            }
        }
    }

    async fn get(&self, ctx: &ApiContext, request: ApiRequest) -> GatewayResult<ApiResponse> {
        let id = self.target(&request)?;
        match request.accept {
            Accept::Materialize => Ok(ApiResponse::Object(self.materialize(ctx, &id).await?)),
            accept => {
                let value = if id.is_template() {
                    self.resource.mutate(self.resource.default_manifest()).to_value()?
                } else {
                    self.manifests
                        .get(&id)
                        .ok_or_else(|| GatewayError::no_manifest(id.to_string()))?
                        .to_value()?
                };
                render(accept, value)
            }
        }
    }

    async fn materialize(&self, ctx: &ApiContext, id: &ResourceId) -> GatewayResult<Arc<dyn Object>> {
        if let Some(object) = self.objects.get(id) {
            return Ok(object.clone());
        }
        let manifest = self
            .manifests
            .get(id)
            .map(|m| m.clone())
            .ok_or_else(|| GatewayError::no_manifest(id.to_string()))?;

        let inflight = ctx.inflight().unwrap_or(&self.inflight).clone();
        let nested = ctx.with_materializing(id)?;
        loop {
            let claim = inflight.claim(id, ctx.materializing(), ctx.task())?;
            if let Some(object) = self.objects.get(id) {
                return Ok(object.clone());
            }
            match claim {
                Claim::Owner(owner) => {
                    if self.debug_level >= 1 {
                        debug!(id = %id, "materializing object\n{}", render_with_line_numbers(&manifest));
                    }
                    let nested = nested.with_inflight(&inflight).with_task(owner.task());
                    let object = self.resource.create(&nested, &manifest).await?;
                    self.objects.insert(id.clone(), object.clone());
                    return Ok(object);
                }
                // the owner may have failed; look again
                Claim::Wait(mut waiting) => waiting.finished().await,
            }
        }
    }

    async fn delete(&self, ctx: &ApiContext, request: ApiRequest) -> GatewayResult<ApiResponse> {
        let id = self.target(&request)?;
        self.remove(ctx, &id).await?;
        Ok(ApiResponse::Empty)
    }

    async fn remove(&self, ctx: &ApiContext, id: &ResourceId) -> GatewayResult<()> {
        let manifest = self
            .manifests
            .get(id)
            .map(|m| m.clone())
            .ok_or_else(|| GatewayError::no_manifest(id.to_string()))?;
        let object = self.objects.get(id).map(|object| object.clone());

        self.resource.delete(ctx, &manifest, object).await?;

        self.manifests.remove(id);
        self.objects.remove(id);
        Ok(())
    }
}

fn render(accept: Accept, value: serde_json::Value) -> GatewayResult<ApiResponse> {
    let marshal = |e: &dyn std::fmt::Display| {
        GatewayError::new(ErrorKind::Marshal, "registry", e.to_string())
    };
    match accept {
        Accept::Json => serde_json::to_vec_pretty(&value)
            .map(|bytes| ApiResponse::Bytes(Bytes::from(bytes)))
            .map_err(|e| marshal(&e)),
        Accept::Yaml => serde_yaml::to_string(&value)
            .map(|text| ApiResponse::Bytes(Bytes::from(text)))
            .map_err(|e| marshal(&e)),
        Accept::Message | Accept::Materialize => Ok(ApiResponse::Message(value)),
    }
}

#[async_trait]
impl<R: Resource> ApiHandler for ResourceApi<R> {
    async fn serve(&self, ctx: &ApiContext, request: ApiRequest) -> GatewayResult<ApiResponse> {
        match request.method {
            ApiMethod::Post => self.post(request),
            ApiMethod::Get => self.get(ctx, request).await,
            ApiMethod::Delete => self.delete(ctx, request).await,
            other => Err(GatewayError::new(
                ErrorKind::NoMethod,
                "registry",
                format!("{} is not supported on `{}`", other, request.key),
            )),
        }
    }

    async fn teardown(&self, ctx: &ApiContext) -> GatewayResult<()> {
        let mut ids: Vec<ResourceId> = self.manifests.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        let mut first_error = None;
        for id in ids.iter().rev() {
            if let Err(e) = self.remove(ctx, id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
