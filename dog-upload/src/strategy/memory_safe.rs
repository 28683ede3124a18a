use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use super::{StrategyContext, TransferOutcome, UploadJob, UploadStrategy};
use crate::memory::{MemoryGuard, MemoryMonitor};
use crate::session::MultipartSession;
use crate::{ChunkPlan, Result, StrategyKind, UploadError};

/// Serial multipart transfer under memory monitoring
///
/// One chunk at a time. Boundaries come from a lazy [`ChunkPlan`] and each
/// chunk's bytes are handed to the backend right before the call and dropped
/// right after it. Memory is sampled before the first chunk and after every
/// chunk; the reading after chunk `n` is the reading before chunk `n + 1`.
pub struct MemorySafeStrategy {
    ctx: StrategyContext,
    monitor: Arc<dyn MemoryMonitor>,
}

impl MemorySafeStrategy {
    pub fn new(ctx: StrategyContext, monitor: Arc<dyn MemoryMonitor>) -> Self {
        Self { ctx, monitor }
    }

    #[instrument(skip(self, job), fields(key = %job.key, size = job.size()))]
    async fn transfer(&self, job: UploadJob) -> Result<TransferOutcome> {
        let started = Instant::now();
        let config = &self.ctx.config;
        let plan = ChunkPlan::new(job.size(), config.chunk_size);
        let total_chunks = plan.chunk_count();
        let guard = MemoryGuard::new(
            self.monitor.as_ref(),
            config.memory_warning_threshold,
            config.memory_critical_threshold,
        );

        // No session yet, so nothing to abort if memory is already critical
        guard.check(0).await?;

        let session = self.ctx.initiate(&job).await?;
        job.reporter.transfer_started();

        if let Err(error) = self.upload_serially(&job, &session, plan, total_chunks, &guard).await {
            error!(session_id = %session.id(), error = %error, "memory-safe transfer failed");
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
            "memory-safe transfer committed"
        );

        Ok(TransferOutcome {
            stored,
            parts: total_chunks as u32,
            strategy: StrategyKind::MemorySafe,
        })
    }

    async fn upload_serially(
        &self,
        job: &UploadJob,
        session: &MultipartSession,
        plan: ChunkPlan,
        total_chunks: usize,
        guard: &MemoryGuard<'_>,
    ) -> Result<()> {
        let reclaim_every = self.ctx.config.reclaim_every_chunks.max(1);

        for mut chunk in plan {
            if job.cancel.is_cancelled() {
                return Err(UploadError::aborted(session.id().as_str(), "cancelled by caller"));
            }

            let body = job.payload.slice(chunk.range());
            let part_token = self
                .ctx
                .upload_part(session, &chunk, body, &job.cancel)
                .await
                .map_err(|e| self.ctx.chunk_error(e, session, chunk.index, total_chunks))?;

            chunk.mark_uploaded(part_token);
            let committed = session.commit_chunk(&chunk);
            job.reporter
                .advance(chunk.size, &format!("chunk {}/{} uploaded", committed, total_chunks));

            if committed % reclaim_every == 0 {
                debug!(chunk = chunk.index, "periodic memory reclamation");
                guard.reclaim();
            }
            if committed < total_chunks {
                guard.check(chunk.index + 1).await?;
            } else {
                guard.check(chunk.index).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UploadStrategy for MemorySafeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MemorySafe
    }

    async fn execute(&self, job: UploadJob) -> Result<TransferOutcome> {
        self.transfer(job).await
    }
}
