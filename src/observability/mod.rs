// Structured logging
pub mod logging;

// Distributed tracing
pub mod tracing;

pub use logging::init_logging;
pub use tracing::{InboundDepth, OutboundDepth, SpanParent, TracingInterceptor, TracingKind};
