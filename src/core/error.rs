//! # Error Handling Module
//!
//! Every failure inside the resource runtime is a [`GatewayError`]: a tagged error that
//! carries the package that raised it, a machine-readable [`ErrorKind`], a human
//! description, an optional detail blob (for example a rendered manifest), and an
//! optional wrapped cause.
//!
//! HTTP-side failures are wrapped in [`HttpError`], which pins the status code the
//! client should see. Middlewares never write error bodies themselves; they hand an
//! [`HttpError`] to a pluggable error handler.
//!
//! ## Rust Concepts Used
//!
//! - `thiserror` derives `Display` and `std::error::Error`, including `source()` chaining
//! - `Arc<dyn Error + Send + Sync>` keeps the wrapped cause cloneable and thread-safe
//! - `From` conversions let `?` lift library errors into gateway errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Shared, cloneable error cause
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error kinds raised by the resource runtime
///
/// The kebab-case name returned by [`ErrorKind::as_str`] is the stable `type`
/// field exposed to operators and error handlers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required input was absent
    #[error("required value is missing")]
    Nil,

    /// Typed conversion failed
    #[error("type assertion failed")]
    Assertion,

    /// Unknown content format tag
    #[error("content format is not supported")]
    FormatUnsupported,

    /// No descriptor or prefix matches the request key
    #[error("no api found")]
    NoApi,

    /// Identity or prefix collision
    #[error("duplicate key")]
    DuplicateKey,

    /// GET or DELETE without a prior POST
    #[error("manifest not found")]
    NoManifest,

    /// Unsupported registry verb
    #[error("method not allowed")]
    NoMethod,

    /// Typed schema validation failed
    #[error("manifest validation failed")]
    ProtoValidate,

    /// Regex or route pattern failed to compile
    #[error("invalid pattern")]
    Pattern,

    /// Variant selector set to an unrecognized value
    #[error("unsupported value")]
    Unsupported,

    /// Document could not be parsed
    #[error("failed to unmarshal")]
    Unmarshal,

    /// Document could not be rendered
    #[error("failed to marshal")]
    Marshal,

    /// A resource transitively references itself
    #[error("circular reference")]
    CircularReference,

    /// CSRF token missing or not verifiable
    #[error("invalid csrf token")]
    InvalidToken,

    /// No session was attached to the request
    #[error("session not found")]
    SessionNotFound,

    /// Random source failed while minting a token
    #[error("failed to mint token")]
    TokenMint,

    /// I/O failure (listeners, body reads)
    #[error("i/o error")]
    Io,

    /// Outbound round trip failed
    #[error("upstream error")]
    Upstream,

    /// A long-running resource stopped with an error
    #[error("runtime error")]
    Runtime,
}

impl ErrorKind {
    /// Stable kebab-case name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Assertion => "assertion",
            Self::FormatUnsupported => "format-unsupported",
            Self::NoApi => "no-api",
            Self::DuplicateKey => "duplicate-key",
            Self::NoManifest => "no-manifest",
            Self::NoMethod => "no-method",
            Self::ProtoValidate => "proto-validate",
            Self::Pattern => "pattern",
            Self::Unsupported => "unsupported",
            Self::Unmarshal => "unmarshal",
            Self::Marshal => "marshal",
            Self::CircularReference => "circular-reference",
            Self::InvalidToken => "invalid-token",
            Self::SessionNotFound => "session-not-found",
            Self::TokenMint => "token-mint",
            Self::Io => "io",
            Self::Upstream => "upstream",
            Self::Runtime => "runtime",
        }
    }

    /// HTTP status used when the kind surfaces directly through axum
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoApi | Self::NoManifest => StatusCode::NOT_FOUND,
            Self::NoMethod => StatusCode::METHOD_NOT_ALLOWED,
            Self::DuplicateKey => StatusCode::CONFLICT,
            Self::Unmarshal
            | Self::ProtoValidate
            | Self::FormatUnsupported
            | Self::Unsupported
            | Self::Pattern => StatusCode::BAD_REQUEST,
            Self::InvalidToken => StatusCode::FORBIDDEN,
            Self::Upstream => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Uniform tagged error
///
/// `package` names the module that raised the error, `kind` is the error type,
/// `description` says what happened and `detail` carries supplementary text such
/// as a rendered manifest with line numbers.
#[derive(Debug, Error, Clone)]
#[error("{package}: {kind}: {description}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub package: &'static str,
    pub description: String,
    pub detail: String,
    #[source]
    pub cause: Option<Cause>,
}

impl GatewayError {
    /// Create an error of the given kind
    pub fn new<S: Into<String>>(kind: ErrorKind, package: &'static str, description: S) -> Self {
        Self {
            kind,
            package,
            description: description.into(),
            detail: String::new(),
            cause: None,
        }
    }

    /// Attach a detail blob
    pub fn with_detail<S: Into<String>>(mut self, detail: S) -> Self {
        self.detail = detail.into();
        self
    }

    /// Wrap an underlying cause
    pub fn wrap<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn nil<S: Into<String>>(package: &'static str, description: S) -> Self {
        Self::new(ErrorKind::Nil, package, description)
    }

    /// Create an assertion error naming the expected and observed types
    pub fn assertion(package: &'static str, expected: &str, observed: &str) -> Self {
        Self::new(
            ErrorKind::Assertion,
            package,
            format!("expected {} but got {}", expected, observed),
        )
    }

    pub fn no_api<S: Into<String>>(key: S) -> Self {
        Self::new(ErrorKind::NoApi, "registry", format!("no api for key `{}`", key.into()))
    }

    pub fn duplicate_key<S: Into<String>>(package: &'static str, key: S) -> Self {
        Self::new(ErrorKind::DuplicateKey, package, format!("`{}` already exists", key.into()))
    }

    pub fn no_manifest<S: Into<String>>(id: S) -> Self {
        Self::new(ErrorKind::NoManifest, "registry", format!("manifest `{}` not found", id.into()))
    }

    pub fn pattern<S: Into<String>>(package: &'static str, description: S) -> Self {
        Self::new(ErrorKind::Pattern, package, description)
    }

    pub fn unsupported<S: Into<String>>(package: &'static str, description: S) -> Self {
        Self::new(ErrorKind::Unsupported, package, description)
    }

    pub fn io<S: Into<String>>(package: &'static str, description: S) -> Self {
        Self::new(ErrorKind::Io, package, description)
    }

    /// Shorthand used by the configuration loader
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Unsupported, "config", message)
    }

    /// Error type name exposed in API responses
    pub fn error_type(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }

    /// True when this error or any wrapped `GatewayError` has the given kind
    pub fn is(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        let mut source = self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static));
        while let Some(err) = source {
            if let Some(gateway) = err.downcast_ref::<GatewayError>() {
                if gateway.kind == kind {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io", err.to_string()).wrap(err)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Unmarshal, "json", err.to_string()).wrap(err)
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::new(ErrorKind::Unmarshal, "yaml", err.to_string()).wrap(err)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "code": status.as_u16(),
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// HTTP-side error: a gateway error pinned to the status returned to the client
#[derive(Debug, Error, Clone)]
#[error("{error} ({})", .status.as_u16())]
pub struct HttpError {
    pub status: StatusCode,
    #[source]
    pub error: GatewayError,
}

impl HttpError {
    pub fn new(status: StatusCode, error: GatewayError) -> Self {
        Self { status, error }
    }

    pub fn forbidden(error: GatewayError) -> Self {
        Self::new(StatusCode::FORBIDDEN, error)
    }

    pub fn internal(error: GatewayError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }

    pub fn not_found(error: GatewayError) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    pub fn method_not_allowed(error: GatewayError) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, error)
    }

    pub fn bad_gateway(error: GatewayError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, error)
    }
}
