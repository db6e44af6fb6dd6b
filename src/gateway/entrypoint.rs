//! Entrypoint runner.
//!
//! `core/v1/Entrypoint` fans out to its runners on a shared child token. A runner
//! returns when the token is cancelled or when it stops on its own; the first
//! error cancels the siblings, and the entrypoint returns once all have stopped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::error::{ErrorKind, GatewayError, GatewayResult};
use crate::manifest::{validate_reference, Manifest, Reference, Violations};
use crate::registry::resolver::resolve_typed_many;
use crate::registry::{ApiContext, Object, Resource};

/// A long-running resource
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, shutdown: CancellationToken) -> GatewayResult<()>;
}

pub struct Entrypoint {
    runners: Vec<Arc<dyn Runner>>,
}

impl Entrypoint {
    pub fn new(runners: Vec<Arc<dyn Runner>>) -> Self {
        Self { runners }
    }
}

#[async_trait]
impl Runner for Entrypoint {
    async fn run(&self, shutdown: CancellationToken) -> GatewayResult<()> {
        let token = shutdown.child_token();
        let mut tasks = JoinSet::new();
        for runner in self.runners.iter().cloned() {
            let token = token.clone();
            tasks.spawn(async move { runner.run(token).await });
        }
        info!(runners = self.runners.len(), "entrypoint started");

        let mut first_error: Option<GatewayError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| GatewayError::new(ErrorKind::Runtime, "entrypoint", "runner task aborted").wrap(e))
                .and_then(|result| result);
            if let Err(e) = result {
                error!(error = %e, "runner stopped with an error");
                token.cancel();
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Object for Entrypoint {
    fn as_runner(self: Arc<Self>) -> Option<Arc<dyn Runner>> {
        Some(self)
    }
}

/// Spec of `core/v1/Entrypoint`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntrypointSpec {
    pub runners: Vec<Reference>,
}

/// Descriptor of `core/v1/Entrypoint`
#[derive(Debug, Default)]
pub struct EntrypointKind;

#[async_trait]
impl Resource for EntrypointKind {
    type Spec = EntrypointSpec;

    const API_VERSION: &'static str = "core/v1";
    const KIND: &'static str = "Entrypoint";

    fn validate(&self, manifest: &Manifest<Self::Spec>, violations: &mut Violations) {
        violations.check(!manifest.spec.runners.is_empty(), "spec.runners", "at least one runner is required");
        for (i, runner) in manifest.spec.runners.iter().enumerate() {
            validate_reference(&format!("spec.runners[{}]", i), runner, violations);
        }
    }

    async fn create(&self, ctx: &ApiContext, manifest: &Manifest<Self::Spec>) -> GatewayResult<Arc<dyn Object>> {
        let runners: Vec<Arc<dyn Runner>> = resolve_typed_many(ctx, &manifest.spec.runners).await?;
        Ok(Arc::new(Entrypoint::new(runners)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct UntilCancelled(Arc<AtomicBool>);

    #[async_trait]
    impl Runner for UntilCancelled {
        async fn run(&self, shutdown: CancellationToken) -> GatewayResult<()> {
            shutdown.cancelled().await;
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Runner for Failing {
        async fn run(&self, _shutdown: CancellationToken) -> GatewayResult<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(GatewayError::new(ErrorKind::Runtime, "test", "boom"))
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_every_runner() {
        let flags: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let entrypoint = Entrypoint::new(
            flags
                .iter()
                .map(|f| Arc::new(UntilCancelled(f.clone())) as Arc<dyn Runner>)
                .collect(),
        );

        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move { entrypoint.run(token).await })
        };
        token.cancel();

        handle.await.unwrap().unwrap();
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn test_first_error_cancels_siblings() {
        let sibling = Arc::new(AtomicBool::new(false));
        let entrypoint = Entrypoint::new(vec![
            Arc::new(UntilCancelled(sibling.clone())) as Arc<dyn Runner>,
            Arc::new(Failing),
        ]);

        let outer = CancellationToken::new();
        let err = entrypoint.run(outer.clone()).await.unwrap_err();

        assert!(err.is(ErrorKind::Runtime));
        assert!(sibling.load(Ordering::SeqCst));
        assert!(!outer.is_cancelled());
    }

    #[test]
    fn test_runners_required() {
        let manifest = EntrypointKind.default_manifest();
        let mut violations = Violations::new();
        EntrypointKind.validate(&manifest, &mut violations);
        assert_eq!(violations.len(), 1);
    }
}
