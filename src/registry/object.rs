//! Materialized objects and capability assertions.
//!
//! `create` returns an [`Object`]: a capability bag that says which runtime roles the
//! instance can play (handler, middleware, round tripper, tripperware, runner, error
//! handler). Resolving a reference asserts one of those roles through the
//! [`Capability`] trait, reporting an `assertion` error naming the expected
//! capability and the observed object type when the role is missing.

use std::any::Any;
use std::sync::Arc;

use crate::gateway::entrypoint::Runner;
use crate::middleware::error_handling::ErrorHandler;
use crate::middleware::handler::{Handler, Middleware};
use crate::middleware::tripperware::{RoundTripper, Tripperware};

/// Conversion to `Any` for concrete downcasts
pub trait AsAny: Any + Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A live object produced by a resource descriptor
pub trait Object: AsAny {
    /// Type name reported in assertion errors
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn as_handler(self: Arc<Self>) -> Option<Arc<dyn Handler>> {
        None
    }

    fn as_middleware(self: Arc<Self>) -> Option<Arc<dyn Middleware>> {
        None
    }

    fn as_round_tripper(self: Arc<Self>) -> Option<Arc<dyn RoundTripper>> {
        None
    }

    fn as_tripperware(self: Arc<Self>) -> Option<Arc<dyn Tripperware>> {
        None
    }

    fn as_runner(self: Arc<Self>) -> Option<Arc<dyn Runner>> {
        None
    }

    fn as_error_handler(self: Arc<Self>) -> Option<Arc<dyn ErrorHandler>> {
        None
    }
}

/// A role that can be asserted on a materialized object
pub trait Capability: Sized + Send + Sync + 'static {
    /// Name reported when the assertion fails
    fn name() -> &'static str;

    fn from_object(object: Arc<dyn Object>) -> Option<Self>;
}

impl Capability for Arc<dyn Object> {
    fn name() -> &'static str {
        "Object"
    }

    fn from_object(object: Arc<dyn Object>) -> Option<Self> {
        Some(object)
    }
}

impl Capability for Arc<dyn Handler> {
    fn name() -> &'static str {
        "Handler"
    }

    fn from_object(object: Arc<dyn Object>) -> Option<Self> {
        object.as_handler()
    }
}

impl Capability for Arc<dyn Middleware> {
    fn name() -> &'static str {
        "Middleware"
    }

    fn from_object(object: Arc<dyn Object>) -> Option<Self> {
        object.as_middleware()
    }
}

impl Capability for Arc<dyn RoundTripper> {
    fn name() -> &'static str {
        "RoundTripper"
    }

    fn from_object(object: Arc<dyn Object>) -> Option<Self> {
        object.as_round_tripper()
    }
}

impl Capability for Arc<dyn Tripperware> {
    fn name() -> &'static str {
        "Tripperware"
    }

    fn from_object(object: Arc<dyn Object>) -> Option<Self> {
        object.as_tripperware()
    }
}

impl Capability for Arc<dyn Runner> {
    fn name() -> &'static str {
        "Runner"
    }

    fn from_object(object: Arc<dyn Object>) -> Option<Self> {
        object.as_runner()
    }
}

impl Capability for Arc<dyn ErrorHandler> {
    fn name() -> &'static str {
        "ErrorHandler"
    }

    fn from_object(object: Arc<dyn Object>) -> Option<Self> {
        object.as_error_handler()
    }
}

/// Assert the object is exactly `T`
pub struct Concrete<T>(pub Arc<T>);

impl<T: Object> Capability for Concrete<T> {
    fn name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn from_object(object: Arc<dyn Object>) -> Option<Self> {
        object.into_any().downcast::<T>().ok().map(Concrete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::HttpError;
    use axum::body::Body;
    use axum::http::{HeaderMap, Response};

    struct Plain;
    impl Object for Plain {}

    struct Fallback;
    impl Object for Fallback {
        fn as_error_handler(self: Arc<Self>) -> Option<Arc<dyn ErrorHandler>> {
            Some(self)
        }
    }
    impl ErrorHandler for Fallback {
        fn serve_error(&self, _headers: &HeaderMap, error: HttpError) -> Response<Body> {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = error.status;
            response
        }
    }

    #[test]
    fn test_capability_assertion() {
        let plain: Arc<dyn Object> = Arc::new(Plain);
        assert!(<Arc<dyn Handler>>::from_object(plain.clone()).is_none());
        assert!(<Arc<dyn ErrorHandler>>::from_object(plain.clone()).is_none());
        assert!(plain.type_name().ends_with("Plain"));

        let fallback: Arc<dyn Object> = Arc::new(Fallback);
        assert!(<Arc<dyn ErrorHandler>>::from_object(fallback).is_some());
    }

    #[test]
    fn test_concrete_downcast() {
        let plain: Arc<dyn Object> = Arc::new(Plain);
        assert!(Concrete::<Plain>::from_object(plain.clone()).is_some());
        assert!(Concrete::<Fallback>::from_object(plain).is_none());
    }
}
