use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::keys::{DefaultKeyStrategy, KeyInput, StorageKeyStrategy};
use crate::memory::{MemoryMonitor, SystemMemoryMonitor};
use crate::progress::{NoopSink, ProgressReporter, ProgressSink};
use crate::store::ObjectStore;
use crate::strategy::{
    ChunkedStreamStrategy, DirectStrategy, MemorySafeStrategy, StrategyContext, StrategySelector, UploadJob,
    UploadStrategy,
};
use crate::{
    FileId, FilenameConfig, FilenameProcessor, RequestValidator, Result, StrategyConfig, StrategyKind, TierLimits,
    TimingStats, UploadError, UploadRequest, UploadResult, ValidationRules,
};

/// The upload entry point services embed
///
/// Validates the request, picks a strategy, derives the storage key from the
/// normalized filename and runs the transfer, reporting progress throughout.
pub struct UploadAdapter {
    config: Arc<StrategyConfig>,
    ctx: StrategyContext,
    rules: ValidationRules,
    tier_limits: TierLimits,
    validator: RequestValidator,
    filenames: FilenameProcessor,
    keys: Arc<dyn StorageKeyStrategy>,
    direct: DirectStrategy,
    chunked: ChunkedStreamStrategy,
    memory_safe: MemorySafeStrategy,
}

impl UploadAdapter {
    /// Create an adapter; fails if the config is invalid or the store cannot take its chunk size
    pub fn new(store: Arc<dyn ObjectStore>, config: StrategyConfig) -> Result<Self> {
        config.validate()?;
        check_store_fits(store.as_ref(), &config)?;

        let config = Arc::new(config);
        let ctx = StrategyContext::new(store, config.clone());
        let rules = ValidationRules::default();
        let tier_limits = TierLimits::default();
        let monitor: Arc<dyn MemoryMonitor> = Arc::new(SystemMemoryMonitor::new());

        Ok(Self {
            validator: RequestValidator::new(rules.clone(), tier_limits.clone(), config.clone()),
            filenames: FilenameProcessor::default(),
            keys: Arc::new(DefaultKeyStrategy),
            direct: DirectStrategy::new(ctx.clone()),
            chunked: ChunkedStreamStrategy::new(ctx.clone()),
            memory_safe: MemorySafeStrategy::new(ctx.clone(), monitor),
            config,
            ctx,
            rules,
            tier_limits,
        })
    }

    pub fn with_tier_limits(mut self, tier_limits: TierLimits) -> Self {
        self.tier_limits = tier_limits;
        self.rebuild_validator();
        self
    }

    pub fn with_validation_rules(mut self, rules: ValidationRules) -> Self {
        self.rules = rules;
        self.rebuild_validator();
        self
    }

    pub fn with_filename_config(mut self, config: FilenameConfig) -> Result<Self> {
        config.validate()?;
        self.filenames = FilenameProcessor::new(config);
        Ok(self)
    }

    pub fn with_memory_monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.memory_safe = MemorySafeStrategy::new(self.ctx.clone(), monitor);
        self
    }

    pub fn with_key_strategy<K: StorageKeyStrategy + 'static>(mut self, keys: K) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn filenames(&self) -> &FilenameProcessor {
        &self.filenames
    }

    /// Strategy a request of this size and tier would use
    pub fn select_strategy(&self, request: &UploadRequest) -> StrategyKind {
        StrategySelector::select(request.size(), request.caller_tier, &self.config)
    }

    /// Upload without progress reporting
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadResult> {
        self.upload_with_progress(request, Arc::new(NoopSink)).await
    }

    pub async fn upload_with_progress(
        &self,
        request: UploadRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<UploadResult> {
        self.upload_with_cancel(request, sink, CancellationToken::new()).await
    }

    /// Upload that stops, aborts any open session and returns `SessionAborted` once `cancel` fires
    pub async fn upload_with_cancel(
        &self,
        request: UploadRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<UploadResult> {
        self.process(request, FileId::new(), sink, cancel).await
    }

    /// Like [`UploadAdapter::upload_with_progress`], but failures come back as a result with `success = false`
    pub async fn upload_settled(&self, request: UploadRequest, sink: Arc<dyn ProgressSink>) -> UploadResult {
        let file_id = FileId::new();
        let filename = request.filename.clone();
        let size = request.size();
        match self.process(request, file_id.clone(), sink, CancellationToken::new()).await {
            Ok(result) => result,
            Err(error) => UploadResult::new(file_id, filename, size).failed(&error),
        }
    }

    async fn process(
        &self,
        request: UploadRequest,
        file_id: FileId,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<UploadResult> {
        let reporter = Arc::new(ProgressReporter::new(request.size(), sink));
        match self.pipeline(request, file_id, reporter.clone(), cancel).await {
            Ok(result) => {
                reporter.complete("upload complete");
                Ok(result)
            }
            Err(error) => {
                reporter.error(&error.to_string());
                Err(error)
            }
        }
    }

    #[instrument(
        skip(self, request, reporter, cancel),
        fields(file_id = %file_id, caller_id = %request.caller_id, tier = %request.caller_tier, size = request.size())
    )]
    async fn pipeline(
        &self,
        request: UploadRequest,
        file_id: FileId,
        reporter: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<UploadResult> {
        let started = Instant::now();
        let size = request.size();

        reporter.validation(0.0, "validating request");
        let validated = self.validator.validate(&request).inspect_err(|e| {
            warn!(error = %e, code = e.code(), filename = %request.filename, "upload rejected");
        })?;
        reporter.validation(1.0, "request validated");
        let validation_ms = started.elapsed().as_millis() as u64;

        let processed = self.filenames.process_safely(&request.filename);
        if processed.has_changes {
            debug!(original = %request.filename, processed = %processed.processed_name, "filename normalized");
        }

        let kind = StrategySelector::select(size, request.caller_tier, &self.config);
        let key = self.keys.object_key(&KeyInput {
            caller_id: &request.caller_id,
            file_id: &file_id,
            processed_name: &processed.processed_name,
            target_context_id: request.target_context_id.as_deref(),
            uploaded_at: Utc::now(),
        });
        info!(strategy = %kind, key = %key, media_kind = %validated.media_kind, "strategy selected");

        let transfer_started = Instant::now();
        let job = UploadJob {
            key,
            payload: request.payload.clone(),
            content_type: Some(validated.mime_type.clone()),
            reporter: reporter.clone(),
            cancel,
        };
        let outcome = self.strategy(kind).execute(job).await?;
        let transfer_ms = transfer_started.elapsed().as_millis() as u64;

        reporter.processing("inspecting payload");
        let dimensions = if validated.media_kind.is_visual() {
            read_dimensions(&request.payload)
        } else {
            None
        };
        let content_hash = if request.flags.dedup {
            Some(content_hash(request.payload.clone()).await?)
        } else {
            None
        };

        let processing = request.flags.applicable_to(validated.media_kind);
        if processing.thumbnail || processing.transcode {
            debug!(thumbnail = processing.thumbnail, transcode = processing.transcode, "processing requested");
        }

        reporter.finalizing("building result");
        let timing = TimingStats::new(validation_ms, transfer_ms, started.elapsed().as_millis() as u64, size);
        info!(
            bytes = size,
            parts = outcome.parts,
            strategy = %outcome.strategy,
            elapsed_ms = timing.total_ms,
            "upload complete"
        );

        Ok(UploadResult::new(file_id, request.filename.clone(), size)
            .with_processed_filename(processed.processed_name, processed.warnings)
            .with_media_kind(validated.media_kind)
            .with_dimensions(dimensions)
            .with_content_hash(content_hash)
            .with_processing(processing)
            .with_strategy(outcome.strategy)
            .with_timing(timing)
            .stored(outcome.stored.key, outcome.stored.url, outcome.parts, outcome.stored.etag))
    }

    fn strategy(&self, kind: StrategyKind) -> &dyn UploadStrategy {
        match kind {
            StrategyKind::Direct => &self.direct,
            StrategyKind::ChunkedStream => &self.chunked,
            StrategyKind::MemorySafe => &self.memory_safe,
        }
    }

    fn rebuild_validator(&mut self) {
        self.validator = RequestValidator::new(self.rules.clone(), self.tier_limits.clone(), self.config.clone());
    }
}

fn check_store_fits(store: &dyn ObjectStore, config: &StrategyConfig) -> Result<()> {
    let caps = store.capabilities();
    if let Some(min) = caps.min_part_size {
        if config.chunk_size < min {
            return Err(UploadError::config(format!(
                "chunk_size ({}) is below the backend minimum part size ({})",
                config.chunk_size, min
            )));
        }
    }
    if let Some(max) = caps.max_part_size {
        if config.chunk_size > max {
            return Err(UploadError::config(format!(
                "chunk_size ({}) is above the backend maximum part size ({})",
                config.chunk_size, max
            )));
        }
    }
    if let Some(max_parts) = caps.max_parts {
        let needed = config.large_threshold.div_ceil(config.chunk_size);
        if needed > max_parts as u64 {
            return Err(UploadError::config(format!(
                "large_threshold needs {} parts, backend allows {}",
                needed, max_parts
            )));
        }
    }
    Ok(())
}

/// Width and height from the image header; `None` when it cannot be read
fn read_dimensions(payload: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(payload))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

async fn content_hash(payload: bytes::Bytes) -> Result<String> {
    tokio::task::spawn_blocking(move || hex::encode(Sha256::digest(&payload)))
        .await
        .map_err(|e| UploadError::Unknown(format!("content hash task failed: {}", e)))
}
