//! # Resource Gateway - Core Library Crate
//!
//! A manifest-driven API gateway. Every part of the running system, from HTTP
//! servers and handlers to middlewares, clients and CSRF protection, is declared
//! as a resource manifest (`apiVersion`, `kind`, `metadata`, `spec`), posted to a
//! [`Registry`] and materialized on first use.
//!
//! ## Layers
//!
//! - `manifest` decodes and validates documents
//! - `registry` stores manifests per kind, materializes objects once and resolves
//!   references between them
//! - `middleware` composes handlers, middlewares and outbound tripperware, and
//!   carries the built-in middleware kinds
//! - `observability` installs logging and provides the tracing interceptor
//! - `gateway` holds the runners (entrypoint, HTTP server) and leaf handlers

/// Error types and process configuration
pub mod core;

/// Manifest data model and decoder
pub mod manifest;

/// Resource registry, materialization and reference resolution
pub mod registry;

/// Handler composition, tripperware and built-in middlewares
pub mod middleware;

/// Structured logging and distributed tracing
pub mod observability;

/// Runners and leaf handlers
pub mod gateway;

/// Main error type used throughout the gateway
pub use core::error::{ErrorKind, GatewayError, GatewayResult, HttpError};

/// Process configuration
pub use core::config::{LogFormat, RuntimeConfig};

pub use manifest::{Content, Format, Manifest, Metadata, Reference, ResourceId};
pub use registry::{default_registry, register_builtin, ApiContext, Object, Registry, Resource};

pub use gateway::Runner;
pub use middleware::{Handler, Middleware, RoundTripper, Tripperware};
