//! The stage contract and the per-run context handed to every stage.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, ServiceError};
use crate::pipeline::conduit::{Inbound, Outbound};

/// One phase of the pipeline.
///
/// A stage consumes `Input` items until its inbound conduit is closed and
/// drained, and produces `Output` items. It must not return before every
/// worker it spawned has finished; the runner closes the outbound conduit
/// as soon as `run` returns.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Stage name used in logs and errors.
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        ctx: StageContext,
        input: Inbound<Self::Input>,
        output: Outbound<Self::Output>,
    ) -> Result<(), PipelineError>;
}

/// Per-run state shared by every stage: cancellation and call limits.
#[derive(Debug, Clone)]
pub struct StageContext {
    cancel: CancellationToken,
    call_timeout: Option<Duration>,
}

impl StageContext {
    pub fn new(cancel: CancellationToken, call_timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            call_timeout,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one external call under the run's cancellation and timeout.
    ///
    /// A service failure (including an expired timeout) is mapped through
    /// `on_error`; cancellation always yields `PipelineError::Cancelled`.
    pub async fn call<T, F>(
        &self,
        call: &'static str,
        fut: F,
        on_error: impl FnOnce(ServiceError) -> PipelineError,
    ) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        let bounded = async {
            match self.call_timeout {
                Some(timeout) => tokio::time::timeout(timeout, fut)
                    .await
                    .unwrap_or(Err(ServiceError::Timeout { call, timeout })),
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            result = bounded => result.map_err(on_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_fetch_error(source: ServiceError) -> PipelineError {
        PipelineError::Fetch {
            batch_size: 1,
            source,
        }
    }

    #[tokio::test]
    async fn call_passes_through_success() {
        let ctx = StageContext::new(CancellationToken::new(), None);
        let value = ctx
            .call("test", async { Ok::<_, ServiceError>(7) }, as_fetch_error)
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn call_maps_service_error() {
        let ctx = StageContext::new(CancellationToken::new(), None);
        let err = ctx
            .call(
                "test",
                async { Err::<u32, _>(ServiceError::Unavailable("down".into())) },
                as_fetch_error,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Fetch { .. }));
    }

    #[tokio::test]
    async fn call_times_out() {
        let ctx = StageContext::new(CancellationToken::new(), Some(Duration::from_millis(10)));
        let err = ctx
            .call(
                "fetch_messages",
                std::future::pending::<Result<u32, ServiceError>>(),
                as_fetch_error,
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::Fetch {
                source: ServiceError::Timeout { call, .. },
                ..
            } => assert_eq!(call, "fetch_messages"),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn call_unwinds_on_cancel() {
        let cancel = CancellationToken::new();
        let ctx = StageContext::new(cancel.clone(), None);
        cancel.cancel();
        let err = ctx
            .call(
                "test",
                std::future::pending::<Result<u32, ServiceError>>(),
                as_fetch_error,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
