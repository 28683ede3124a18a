use serde::{Deserialize, Serialize};

use crate::filename::FilenameWarning;
use crate::{FileId, MediaKind, ProcessingFlags, StrategyKind, UploadError};

/// Result returned for every upload attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub file_id: FileId,
    pub original_filename: String,
    pub processed_filename: String,
    pub storage_key: Option<String>,
    pub url: Option<String>,
    /// Every public URL for the object (derived assets are appended by processing services)
    pub urls: Vec<String>,
    pub media_kind: Option<MediaKind>,
    /// Width and height, for images whose header could be read
    pub dimensions: Option<(u32, u32)>,
    pub duration_secs: Option<f64>,
    pub size_bytes: u64,
    pub strategy: Option<StrategyKind>,
    /// Parts committed; 1 for direct uploads
    pub parts: u32,
    /// Hex SHA-256 of the payload, when dedup was requested
    pub content_hash: Option<String>,
    /// Processing still owed to the object by downstream services
    pub processing: ProcessingFlags,
    pub etag: Option<String>,
    pub timing: TimingStats,
    pub filename_warnings: Vec<FilenameWarning>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

/// Wall-clock time spent in each phase, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub validation_ms: u64,
    pub transfer_ms: u64,
    pub total_ms: u64,
    /// Payload bytes per second over the transfer phase
    pub throughput_bps: Option<f64>,
}

impl TimingStats {
    pub fn new(validation_ms: u64, transfer_ms: u64, total_ms: u64, bytes: u64) -> Self {
        let throughput_bps = (transfer_ms > 0).then(|| bytes as f64 * 1000.0 / transfer_ms as f64);
        Self {
            validation_ms,
            transfer_ms,
            total_ms,
            throughput_bps,
        }
    }
}

impl UploadResult {
    pub fn new(file_id: FileId, original_filename: impl Into<String>, size_bytes: u64) -> Self {
        let original_filename = original_filename.into();
        Self {
            success: false,
            file_id,
            processed_filename: original_filename.clone(),
            original_filename,
            storage_key: None,
            url: None,
            urls: Vec::new(),
            media_kind: None,
            dimensions: None,
            duration_secs: None,
            size_bytes,
            strategy: None,
            parts: 0,
            content_hash: None,
            processing: ProcessingFlags::default(),
            etag: None,
            timing: TimingStats::default(),
            filename_warnings: Vec::new(),
            error: None,
            error_code: None,
        }
    }

    pub fn with_processed_filename(mut self, name: impl Into<String>, warnings: Vec<FilenameWarning>) -> Self {
        self.processed_filename = name.into();
        self.filename_warnings = warnings;
        self
    }

    pub fn with_media_kind(mut self, kind: MediaKind) -> Self {
        self.media_kind = Some(kind);
        self
    }

    pub fn with_dimensions(mut self, dimensions: Option<(u32, u32)>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_content_hash(mut self, hash: Option<String>) -> Self {
        self.content_hash = hash;
        self
    }

    pub fn with_processing(mut self, processing: ProcessingFlags) -> Self {
        self.processing = processing;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_timing(mut self, timing: TimingStats) -> Self {
        self.timing = timing;
        self
    }

    /// Mark the upload as stored at `url` under `key`
    pub fn stored(mut self, key: impl Into<String>, url: impl Into<String>, parts: u32, etag: Option<String>) -> Self {
        let url = url.into();
        self.success = true;
        self.storage_key = Some(key.into());
        self.urls = vec![url.clone()];
        self.url = Some(url);
        self.parts = parts;
        self.etag = etag;
        self
    }

    /// Mark the upload as failed; nothing is stored
    pub fn failed(mut self, error: &UploadError) -> Self {
        self.success = false;
        self.storage_key = None;
        self.url = None;
        self.urls.clear();
        self.processing = ProcessingFlags::default();
        self.error = Some(error.to_string());
        self.error_code = Some(error.code().to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}
