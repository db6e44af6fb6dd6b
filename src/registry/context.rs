//! Request context for registry calls.
//!
//! Every request served by a [`Registry`](super::Registry) pushes the registry onto
//! an immutable route chain carried by [`ApiContext`]. Descriptors called during
//! materialization reach the *root* registry through [`ApiContext::root`] instead
//! of a process-wide singleton.
//!
//! The context also records which identities are currently being materialized, so a
//! resource that (transitively) references itself is reported instead of waiting on
//! its own initialization forever. Loops that span tasks are caught by the
//! registry's [`InFlight`] table, which the context carries along.

use std::fmt;
use std::sync::Arc;

use super::inflight::{InFlight, TaskId};
use super::mux::ApiHandler;
use crate::core::error::{ErrorKind, GatewayError, GatewayResult};
use crate::manifest::ResourceId;

/// Error for a materialization that would wait on itself; `path` ends with `id`
pub(crate) fn circular_reference(id: &ResourceId, path: &[ResourceId]) -> GatewayError {
    let chain = path.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> ");
    GatewayError::new(
        ErrorKind::CircularReference,
        "registry",
        format!("`{}` references itself", id),
    )
    .with_detail(chain)
}

#[derive(Clone, Default)]
pub struct ApiContext {
    routes: Arc<[Arc<dyn ApiHandler>]>,
    materializing: Arc<[ResourceId]>,
    inflight: Option<Arc<InFlight>>,
    task: Option<TaskId>,
}

impl ApiContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new context with `api` appended to the route chain
    pub fn with_route(&self, api: Arc<dyn ApiHandler>) -> Self {
        let routes: Vec<Arc<dyn ApiHandler>> =
            self.routes.iter().cloned().chain(std::iter::once(api)).collect();
        Self {
            routes: routes.into(),
            ..self.clone()
        }
    }

    /// The first registry that served this request
    pub fn root(&self) -> Option<Arc<dyn ApiHandler>> {
        self.routes.first().cloned()
    }

    /// Number of registry hops on the route chain
    pub fn depth(&self) -> usize {
        self.routes.len()
    }

    /// Identities currently being materialized, outermost first
    pub fn materializing(&self) -> &[ResourceId] {
        &self.materializing
    }

    /// Return a new context recording that `id` is being materialized
    ///
    /// Fails with `circular-reference` when `id` is already on the chain.
    pub fn with_materializing(&self, id: &ResourceId) -> GatewayResult<Self> {
        let materializing: Vec<ResourceId> = self
            .materializing
            .iter()
            .cloned()
            .chain(std::iter::once(id.clone()))
            .collect();
        if self.materializing.contains(id) {
            return Err(circular_reference(id, &materializing));
        }
        Ok(Self {
            materializing: materializing.into(),
            ..self.clone()
        })
    }

    /// Table of pending materializations shared by every task of a registry
    pub fn inflight(&self) -> Option<&Arc<InFlight>> {
        self.inflight.as_ref()
    }

    /// Attach `inflight` unless the context already carries one
    pub fn with_inflight(&self, inflight: &Arc<InFlight>) -> Self {
        Self {
            inflight: Some(self.inflight.clone().unwrap_or_else(|| inflight.clone())),
            ..self.clone()
        }
    }

    /// Materialization task this context belongs to, once it owns an identity
    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn with_task(&self, task: TaskId) -> Self {
        Self {
            task: Some(task),
            ..self.clone()
        }
    }
}

impl fmt::Debug for ApiContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiContext")
            .field("routes", &self.routes.len())
            .field("materializing", &self.materializing)
            .field("task", &self.task)
            .finish()
    }
}
