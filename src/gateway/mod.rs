pub mod entrypoint;
pub mod health;
pub mod proxy;
pub mod server;

pub use entrypoint::{Entrypoint, EntrypointKind, Runner};
pub use health::{HealthCheckHandler, HealthCheckKind};
pub use proxy::{ReverseProxy, ReverseProxyKind};
pub use server::{HttpServer, HttpServerKind, PatternMux};
