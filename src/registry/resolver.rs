//! Reference resolution.
//!
//! Resolving a [`Reference`] sends a GET for its identity to the root registry on
//! the context chain and asserts the capability the caller needs.

use std::sync::Arc;

use super::context::ApiContext;
use super::mux::ApiRequest;
use super::object::{Capability, Object};
use crate::core::error::{GatewayError, GatewayResult};
use crate::manifest::Reference;

/// Materialize the object behind `reference`
pub async fn resolve(ctx: &ApiContext, reference: Option<&Reference>) -> GatewayResult<Arc<dyn Object>> {
    let reference = reference.ok_or_else(|| GatewayError::nil("resolver", "reference is not set"))?;
    let root = ctx
        .root()
        .ok_or_else(|| GatewayError::no_api(format!("{} (no registry on context)", reference)))?;
    root.serve(ctx, ApiRequest::get(reference.id().to_string()))
        .await?
        .into_object()
}

/// Materialize and assert a capability
pub async fn resolve_typed<C: Capability>(ctx: &ApiContext, reference: Option<&Reference>) -> GatewayResult<C> {
    let object = resolve(ctx, reference).await?;
    let observed = object.type_name();
    C::from_object(object).ok_or_else(|| GatewayError::assertion("resolver", C::name(), observed))
}

/// Resolve each reference in order; any failure fails the whole call
pub async fn resolve_typed_many<C: Capability>(
    ctx: &ApiContext,
    references: &[Reference],
) -> GatewayResult<Vec<C>> {
    let mut resolved = Vec::with_capacity(references.len());
    for reference in references {
        resolved.push(resolve_typed::<C>(ctx, Some(reference)).await?);
    }
    Ok(resolved)
}

/// Resolve an optional reference, using `fallback` when it is not set
pub async fn resolve_or<C, F>(ctx: &ApiContext, reference: Option<&Reference>, fallback: F) -> GatewayResult<C>
where
    C: Capability,
    F: FnOnce() -> C,
{
    match reference {
        Some(reference) => resolve_typed(ctx, Some(reference)).await,
        None => Ok(fallback()),
    }
}
