use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{EngineResult, MediaEngine};
use crate::error::{Error, Result};

/// Shared access to the media engine with bounded calls
///
/// Negotiation calls give up after the configured timeout or as soon as the
/// SFU starts shutting down. Release calls ignore shutdown so teardown can
/// still reach the engine.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn MediaEngine>,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl EngineHandle {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            engine,
            timeout,
            shutdown,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &dyn MediaEngine {
        self.engine.as_ref()
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Await an engine call that creates or negotiates a resource
    pub async fn negotiate<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = EngineResult<T>> + Send,
    {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(Error::ShuttingDown),
            result = tokio::time::timeout(self.timeout, call) => match result {
                Ok(result) => result.map_err(Error::from),
                Err(_) => {
                    warn!(operation, timeout_secs = self.timeout.as_secs(), "Media engine call timed out");
                    Err(Error::NegotiationTimeout(operation.to_string()))
                }
            },
        }
    }

    /// Await an engine close call, logging instead of failing
    pub async fn release<F>(&self, operation: &'static str, resource: impl Display, call: F)
    where
        F: Future<Output = EngineResult<()>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(operation, resource = %resource, error = %e, "Media engine close failed"),
            Err(_) => warn!(operation, resource = %resource, "Media engine close timed out"),
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
