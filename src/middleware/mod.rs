pub mod csrf;
pub mod error_handling;
pub mod handler;
pub mod request_logging;
pub mod session;
pub mod tripperware;

use axum::http::HeaderMap;

pub use csrf::{CsrfKind, CsrfProtection};
pub use error_handling::{DefaultErrorHandler, ErrorHandler, ErrorHandlerKind};
pub use handler::{clean_path, compose, handler_fn, join_patterns, Handler, HttpHandlerKind, Middleware};
pub use request_logging::{AccessLogKind, AccessLogMiddleware};
pub use session::{Session, SessionHandle, SessionKind, SessionMiddleware};
pub use tripperware::{compose_round_tripper, HttpClientKind, HttpTransport, RoundTripper, Tripperware};

/// Request extension holding headers that proxies add to upstream requests
///
/// Only middlewares write here, so clients cannot forge entries.
#[derive(Debug, Clone, Default)]
pub struct ProxyHeaders(pub HeaderMap);
