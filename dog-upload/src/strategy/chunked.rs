use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use super::{StrategyContext, TransferOutcome, UploadJob, UploadStrategy};
use crate::retry::RetryError;
use crate::session::MultipartSession;
use crate::{ChunkInfo, Result, StrategyKind, UploadError};

/// Concurrent multipart transfer for payloads held fully in memory
///
/// Every chunk is a zero-copy slice of the request payload. At most
/// `max_concurrent_chunks` part uploads run at once; the first chunk to
/// exhaust its retries cancels the rest and the session is aborted.
pub struct ChunkedStreamStrategy {
    ctx: StrategyContext,
}

type ChunkOutcome = (usize, std::result::Result<(), RetryError>);

impl ChunkedStreamStrategy {
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, job), fields(key = %job.key, size = job.size()))]
    async fn transfer(&self, job: UploadJob) -> Result<TransferOutcome> {
        let started = Instant::now();
        let chunks = ChunkInfo::plan(job.size(), self.ctx.config.chunk_size);
        let total_chunks = chunks.len();

        let session = Arc::new(self.ctx.initiate(&job).await?);
        job.reporter.transfer_started();

        if let Err(error) = self.upload_chunks(&job, &session, chunks).await {
            error!(session_id = %session.id(), error = %error, "chunked transfer failed");
            self.ctx.abort(&session, &error).await;
            return Err(error);
        }

        job.reporter.committing(&format!("committing {} parts", total_chunks));
        let stored = self.ctx.commit(&session, total_chunks, &job.cancel).await?;

        info!(
            session_id = %session.id(),
            bytes = stored.size_bytes,
            parts = total_chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chunked transfer committed"
        );

        Ok(TransferOutcome {
            stored,
            parts: total_chunks as u32,
            strategy: StrategyKind::ChunkedStream,
        })
    }

    async fn upload_chunks(&self, job: &UploadJob, session: &Arc<MultipartSession>, chunks: Vec<ChunkInfo>) -> Result<()> {
        let total_chunks = chunks.len();
        let semaphore = Arc::new(Semaphore::new(self.ctx.config.max_concurrent_chunks));
        // Child token: our own failures cancel siblings without touching the caller's token
        let token = job.cancel.child_token();
        let mut tasks: JoinSet<ChunkOutcome> = JoinSet::new();

        for mut chunk in chunks {
            let ctx = self.ctx.clone();
            let session = session.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();
            let reporter = job.reporter.clone();
            let body = job.payload.slice(chunk.range());

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return (chunk.index, Err(RetryError::Cancelled { attempts: 0 })),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (chunk.index, Err(RetryError::Cancelled { attempts: 0 })),
                    },
                };

                let result = ctx.upload_part(&session, &chunk, body, &token).await;
                let result = result.map(|part_token| {
                    chunk.mark_uploaded(part_token);
                    let committed = session.commit_chunk(&chunk);
                    debug!(chunk = chunk.index, committed, total_chunks, "chunk uploaded");
                    reporter.advance(chunk.size, &format!("chunk {}/{} uploaded", committed, total_chunks));
                });
                (chunk.index, result)
            });
        }

        let mut failure: Option<UploadError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    failure.get_or_insert_with(|| UploadError::Unknown(format!("chunk task failed: {}", e)));
                    token.cancel();
                    tasks.abort_all();
                    continue;
                }
            };

            if let Err(e) = result {
                // Our own cancellation shows up as Cancelled after the first real failure is recorded
                let error = self.ctx.chunk_error(e, session, index, total_chunks);
                failure.get_or_insert(error);
                token.cancel();
                tasks.abort_all();
            }
        }

        if failure.is_none() && job.cancel.is_cancelled() {
            failure = Some(UploadError::aborted(session.id().as_str(), "cancelled by caller"));
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UploadStrategy for ChunkedStreamStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ChunkedStream
    }

    async fn execute(&self, job: UploadJob) -> Result<TransferOutcome> {
        self.transfer(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressReporter, RecordingSink};
    use crate::store::MemoryObjectStore;
    use crate::StrategyConfig;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const MIB: usize = 1024 * 1024;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn strategy(store: Arc<MemoryObjectStore>) -> ChunkedStreamStrategy {
        let config = StrategyConfig::default()
            .with_chunk_size(MIB as u64)
            .with_max_concurrent_chunks(3)
            .with_retries(3, Duration::from_millis(1));
        ChunkedStreamStrategy::new(StrategyContext::new(store, Arc::new(config)))
    }

    fn job(payload: Bytes, cancel: CancellationToken) -> (UploadJob, RecordingSink) {
        let sink = RecordingSink::new();
        let job = UploadJob {
            key: "vip/2026/01/f/video.mp4".to_string(),
            reporter: Arc::new(ProgressReporter::new(payload.len() as u64, Arc::new(sink.clone()))),
            payload,
            content_type: Some("video/mp4".to_string()),
            cancel,
        };
        (job, sink)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parts_reassemble_to_the_payload() {
        // Arrange
        let store = Arc::new(MemoryObjectStore::default().with_part_delay(Duration::from_millis(5)));
        let data = payload(5 * MIB + 123);
        let (job, sink) = job(data.clone(), CancellationToken::new());

        // Act
        let outcome = strategy(store.clone()).execute(job).await.unwrap();

        // Assert
        assert_eq!(outcome.parts, 6);
        assert_eq!(store.last_committed_parts(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(store.object("uploads", "vip/2026/01/f/video.mp4").unwrap(), data);
        assert!(store.peak_concurrent_parts() <= 3);
        let percents = sink.percents();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn exhausted_chunk_aborts_session() {
        let store = Arc::new(MemoryObjectStore::default());
        store.fail_part(2, 100);
        let (job, _) = job(payload(4 * MIB), CancellationToken::new());

        let err = strategy(store.clone()).execute(job).await.unwrap_err();

        match err {
            UploadError::StorageBackend {
                chunk_index,
                total_chunks,
                attempts,
                ..
            } => {
                assert_eq!(chunk_index, Some(1));
                assert_eq!(total_chunks, Some(4));
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.abort_calls(), 1);
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_aborts() {
        let store = Arc::new(MemoryObjectStore::default());
        let cancel = CancellationToken::new();
        let (job, _) = job(payload(2 * MIB), cancel.clone());
        let strategy = strategy(store.clone());

        // Caller gives up before anything is sent
        cancel.cancel();
        let err = strategy.execute(job).await.unwrap_err();

        assert!(matches!(err, UploadError::SessionAborted { .. }));
        assert_eq!(store.object_count(), 0);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn failed_abort_is_logged_and_primary_error_returned() {
        let store = Arc::new(MemoryObjectStore::default());
        store.fail_part(1, 100);
        store.fail_aborts();
        let (job, _) = job(payload(2 * MIB), CancellationToken::new());

        let err = strategy(store.clone()).execute(job).await.unwrap_err();

        assert!(matches!(err, UploadError::StorageBackend { chunk_index: Some(0), .. }));
        assert_eq!(store.abort_calls(), 4);
        assert_eq!(store.open_sessions(), 1);
        assert!(logs_contain("multipart session left open"));
    }
}
