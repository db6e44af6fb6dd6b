//! Registration of the built-in kinds.

use tracing::debug;

use super::mux::Registry;
use crate::core::error::GatewayResult;
use crate::gateway::{EntrypointKind, HealthCheckKind, HttpServerKind, ReverseProxyKind};
use crate::middleware::{
    AccessLogKind, CsrfKind, ErrorHandlerKind, HttpClientKind, HttpHandlerKind, SessionKind,
};
use crate::observability::TracingKind;

/// Register every built-in kind
pub fn register_builtin(registry: &Registry) -> GatewayResult<()> {
    registry.register_resource(EntrypointKind)?;
    registry.register_resource(HttpServerKind)?;
    registry.register_resource(HttpHandlerKind)?;
    registry.register_resource(HttpClientKind)?;
    registry.register_resource(ErrorHandlerKind)?;
    registry.register_resource(ReverseProxyKind)?;
    registry.register_resource(HealthCheckKind)?;

    registry.register_resource(CsrfKind)?;
    registry.register_resource(SessionKind)?;
    registry.register_resource(TracingKind)?;
    registry.register_resource(AccessLogKind)?;

    debug!("Registered {} built-in kinds", registry.prefixes().len());
    Ok(())
}

/// A registry with the built-in kinds
pub fn default_registry(debug_level: u8) -> GatewayResult<Registry> {
    let registry = Registry::new(debug_level);
    register_builtin(&registry)?;
    Ok(registry)
}
