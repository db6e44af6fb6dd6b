//! # Resource Registry
//!
//! Resources are declared as manifests and materialized on first GET. The
//! [`Registry`] multiplexes requests by key prefix onto one [`ResourceApi`] per
//! kind; references between resources are resolved back through the registry
//! found on the [`ApiContext`] route chain.

pub mod builtin;
pub mod context;
pub mod inflight;
pub mod mux;
pub mod object;
pub mod resolver;
pub mod resource;

pub use builtin::{default_registry, register_builtin};
pub use context::ApiContext;
pub use mux::{Accept, ApiHandler, ApiMethod, ApiRequest, ApiResponse, Registry};
pub use object::{Capability, Concrete, Object};
pub use resolver::{resolve, resolve_or, resolve_typed, resolve_typed_many};
pub use resource::{Resource, ResourceApi};
