use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{StrategyContext, TransferOutcome, UploadJob, UploadStrategy};
use crate::retry::RetryError;
use crate::{Result, StrategyKind, UploadError};

/// Single-shot transfer for small payloads
pub struct DirectStrategy {
    ctx: StrategyContext,
}

impl DirectStrategy {
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, job), fields(key = %job.key, size = job.size()))]
    async fn transfer(&self, job: UploadJob) -> Result<TransferOutcome> {
        let size = job.size();
        let limit = self.ctx.config.small_threshold;
        if size > limit {
            return Err(UploadError::validation(format!(
                "direct transfer of {} bytes exceeds the {} byte threshold",
                size, limit
            )));
        }

        job.reporter.transfer_started();

        let key = job.key.as_str();
        if job.cancel.is_cancelled() {
            return Err(UploadError::aborted(key, "cancelled before the object was stored"));
        }

        // A put in flight may already have stored the object, so it is not raced against the caller
        let storing = CancellationToken::new();
        let store = &self.ctx.store;
        let namespace = self.ctx.config.namespace.as_str();
        let content_type = job.content_type.as_deref();
        let payload = &job.payload;
        let stored = self
            .ctx
            .retry
            .run("put", &storing, move |_| {
                store.put(namespace, key, payload.clone(), content_type)
            })
            .await
            .map_err(|e| match e {
                RetryError::Cancelled { .. } => UploadError::aborted(key, "cancelled while storing"),
                RetryError::Exhausted { error, attempts } => error.with_attempts(attempts),
                RetryError::Fatal { error, .. } => error,
            })?;

        job.reporter.advance(size, "object stored");
        debug!(url = %stored.url, "direct transfer finished");

        Ok(TransferOutcome {
            stored,
            parts: 1,
            strategy: StrategyKind::Direct,
        })
    }
}

#[async_trait]
impl UploadStrategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    async fn execute(&self, job: UploadJob) -> Result<TransferOutcome> {
        self.transfer(job).await
    }
}
