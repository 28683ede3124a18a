//! Transfer strategies and the selector that picks one per request
//!
//! Each strategy is an independent type behind [`UploadStrategy`]. Shared
//! mechanics (retrying a part upload under a timeout, committing, aborting)
//! live in [`StrategyContext`], which every strategy holds.

mod chunked;
mod direct;
mod memory_safe;

pub use chunked::ChunkedStreamStrategy;
pub use direct::DirectStrategy;
pub use memory_safe::MemorySafeStrategy;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::progress::ProgressReporter;
use crate::retry::{RetryError, RetryPolicy};
use crate::session::MultipartSession;
use crate::store::{ObjectStore, StoredObject};
use crate::{CallerTier, ChunkInfo, PartToken, Result, StrategyConfig, StrategyKind, UploadError};

/// Everything a strategy needs to move one payload
pub struct UploadJob {
    pub key: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub reporter: Arc<ProgressReporter>,
    pub cancel: CancellationToken,
}

impl UploadJob {
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// What a finished transfer produced
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub stored: StoredObject,
    pub parts: u32,
    pub strategy: StrategyKind,
}

/// One payload-transfer algorithm
#[async_trait]
pub trait UploadStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn execute(&self, job: UploadJob) -> Result<TransferOutcome>;
}

/// Pure mapping from (size, tier, thresholds) to a strategy
pub struct StrategySelector;

impl StrategySelector {
    pub fn select(size: u64, tier: CallerTier, config: &StrategyConfig) -> StrategyKind {
        if config.is_pinned_direct(tier) || size <= config.small_threshold {
            StrategyKind::Direct
        } else if size <= config.medium_threshold {
            StrategyKind::ChunkedStream
        } else {
            StrategyKind::MemorySafe
        }
    }
}

/// Shared helper held by every strategy
#[derive(Clone)]
pub struct StrategyContext {
    pub store: Arc<dyn ObjectStore>,
    pub config: Arc<StrategyConfig>,
    pub retry: RetryPolicy,
}

impl StrategyContext {
    pub fn new(store: Arc<dyn ObjectStore>, config: Arc<StrategyConfig>) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self { store, config, retry }
    }

    /// Open a multipart session, retrying transient failures
    pub(crate) async fn initiate(&self, job: &UploadJob) -> Result<MultipartSession> {
        let store = &self.store;
        let namespace = self.config.namespace.as_str();
        let key = job.key.as_str();
        let content_type = job.content_type.as_deref();
        let id = self
            .retry
            .run("initiate_multipart", &job.cancel, move |_| {
                store.initiate_multipart(namespace, key, content_type)
            })
            .await
            .map_err(|e| match e {
                RetryError::Cancelled { .. } => UploadError::aborted(key, "cancelled before the session opened"),
                RetryError::Exhausted { error, attempts } => error.with_attempts(attempts),
                RetryError::Fatal { error, .. } => error,
            })?;

        info!(session_id = %id, key = %job.key, "multipart session opened");
        Ok(MultipartSession::new(id, job.key.clone(), namespace))
    }

    /// Upload one chunk with the shared retry policy; each attempt is bounded by the chunk timeout
    pub(crate) async fn upload_part(
        &self,
        session: &MultipartSession,
        chunk: &ChunkInfo,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> std::result::Result<PartToken, RetryError> {
        let store = &self.store;
        let id = session.id();
        let timeout = self.config.chunk_timeout();
        let part_number = chunk.part_number();
        let index = chunk.index;

        self.retry
            .run("upload_part", cancel, move |attempt| {
                let body = body.clone();
                async move {
                    match tokio::time::timeout(timeout, store.upload_part(id, part_number, body)).await {
                        Ok(result) => result,
                        Err(_) => Err(UploadError::chunk_failed(
                            index,
                            format!("attempt {} timed out after {}ms", attempt, timeout.as_millis()),
                        )),
                    }
                }
            })
            .await
    }

    /// Commit the session's parts in order; aborts the session if that fails
    ///
    /// Cancellation is honoured up to the moment the commit is sent, not after.
    pub(crate) async fn commit(
        &self,
        session: &MultipartSession,
        total_chunks: usize,
        cancel: &CancellationToken,
    ) -> Result<StoredObject> {
        let result: Result<StoredObject> = async {
            let parts = session.ordered_parts(total_chunks)?;
            let id = session.id();
            if cancel.is_cancelled() {
                return Err(UploadError::aborted(id.as_str(), "cancelled before commit"));
            }

            // Once the commit is sent the backend may already hold the object; see it through
            let committing = CancellationToken::new();
            let store = &self.store;
            self.retry
                .run("complete_multipart", &committing, move |_| store.complete_multipart(id, parts.clone()))
                .await
                .map_err(|e| match e {
                    RetryError::Cancelled { .. } => UploadError::aborted(id.as_str(), "cancelled during commit"),
                    RetryError::Exhausted { error, attempts } => error.with_attempts(attempts),
                    RetryError::Fatal { error, .. } => error,
                })
        }
        .await;

        match result {
            Ok(stored) => {
                session.mark_committed();
                Ok(stored)
            }
            Err(error) => {
                self.abort(session, &error).await;
                Err(error)
            }
        }
    }

    /// Best-effort abort; a failing abort is logged and the primary error kept
    pub(crate) async fn abort(&self, session: &MultipartSession, primary: &UploadError) {
        // Cleanup must run even when the caller's token already fired
        let never = CancellationToken::new();
        let store = &self.store;
        let id = session.id();
        let outcome = self
            .retry
            .run("abort_multipart", &never, move |_| store.abort_multipart(id))
            .await;

        match outcome {
            Ok(()) => {
                session.mark_aborted();
                warn!(session_id = %session.id(), key = session.key(), reason = %primary, "multipart session aborted");
            }
            Err(e) => {
                let reason = match e {
                    RetryError::Exhausted { error, .. } | RetryError::Fatal { error, .. } => error.to_string(),
                    RetryError::Cancelled { .. } => "cancelled".to_string(),
                };
                let abort_error = UploadError::SessionAbort {
                    session_id: session.id().to_string(),
                    reason,
                };
                error!(error = %abort_error, primary = %primary, "multipart session left open");
            }
        }
    }

    /// Terminal error for a chunk whose retries ended
    pub(crate) fn chunk_error(
        &self,
        error: RetryError,
        session: &MultipartSession,
        chunk_index: usize,
        total_chunks: usize,
    ) -> UploadError {
        match error {
            RetryError::Cancelled { .. } => UploadError::aborted(session.id().as_str(), "cancelled by caller"),
            RetryError::Exhausted { error, attempts } => error.exhausted(chunk_index, total_chunks, attempts),
            RetryError::Fatal { error, .. } => error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn thresholds_pick_strategies() {
        let config = StrategyConfig::default();
        assert_eq!(StrategySelector::select(3 * MIB, CallerTier::User, &config), StrategyKind::Direct);
        assert_eq!(StrategySelector::select(10 * MIB, CallerTier::User, &config), StrategyKind::Direct);
        assert_eq!(
            StrategySelector::select(10 * MIB + 1, CallerTier::User, &config),
            StrategyKind::ChunkedStream
        );
        assert_eq!(
            StrategySelector::select(100 * MIB, CallerTier::Vip, &config),
            StrategyKind::ChunkedStream
        );
        assert_eq!(
            StrategySelector::select(300 * MIB, CallerTier::Admin, &config),
            StrategyKind::MemorySafe
        );
    }

    #[test]
    fn pinned_tier_always_direct() {
        let config = StrategyConfig::default();
        assert_eq!(
            StrategySelector::select(300 * MIB, CallerTier::Guest, &config),
            StrategyKind::Direct
        );
    }
}
