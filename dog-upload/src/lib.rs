//! # dog-upload: Adaptive multi-strategy file uploads
//!
//! `dog-upload` takes an in-memory file, checks it against the caller's tier
//! limits, picks a transfer strategy by size and moves it into object storage,
//! reporting progress the whole way.
//!
//! ## Key Features
//!
//! - **Three strategies**: a single `put` for small files, concurrent multipart
//!   chunks for medium files, and a serial memory-monitored transfer for very
//!   large ones
//! - **Never half-written**: a multipart upload is either committed in full or
//!   aborted; retries never duplicate parts
//! - **Safe filenames**: names are normalized for Windows, macOS, Linux and the
//!   web, and batches can be made collision-free
//! - **Storage agnostic**: any backend implementing [`ObjectStore`]; an
//!   in-memory store ships for tests and an S3-compatible one behind the `s3`
//!   feature
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_upload::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let store = Arc::new(MemoryObjectStore::default());
//! let adapter = UploadAdapter::new(store, StrategyConfig::default())?;
//!
//! let request = UploadRequest::new("holiday photo.png", vec![0u8; 1024], "user-123", CallerTier::User)
//!     .with_mime_type("image/png");
//!
//! let result = adapter.upload(request).await?;
//! assert_eq!(result.strategy, Some(StrategyKind::Direct));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   Your Service   │  ← Business logic only
//! ├──────────────────┤
//! │  UploadAdapter   │  ← validate → select → transfer → result
//! ├──────────────────┤
//! │  UploadStrategy  │  ← direct / chunked-stream / memory-safe
//! ├──────────────────┤
//! │   ObjectStore    │  ← put, initiate/part/complete/abort
//! └──────────────────┘
//! ```

pub mod adapter;
mod config;
mod error;
pub mod filename;
mod keys;
pub mod memory;
mod progress;
mod receipt;
pub mod retry;
#[cfg(feature = "s3")]
mod s3_store;
pub mod session;
pub mod store;
pub mod strategy;
mod types;
mod validator;

// Re-export main types for clean API
pub use adapter::UploadAdapter;
pub use config::{
    FilenameConfig, KindLimits, StrategyConfig, TierLimits, ValidationRules, ENV_PREFIX, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};
pub use error::{ForbiddenReason, Result, UploadError};
pub use filename::{CollisionPolicy, FilenameProcessor, FilenameWarning, PlatformCompatibility, ProcessedFilename};
pub use keys::{DefaultKeyStrategy, KeyInput, StorageKeyStrategy};
pub use memory::{MemoryMonitor, MemorySample, ScriptedMemoryMonitor, SystemMemoryMonitor};
pub use progress::{
    ChannelSink, FnSink, NoopSink, ProgressReporter, ProgressSink, RecordingSink, UploadProgress, UploadStage,
};
pub use receipt::{TimingStats, UploadResult};
pub use retry::RetryPolicy;
#[cfg(feature = "s3")]
pub use s3_store::{S3Config, S3ObjectStore};
pub use session::MultipartSession;
pub use store::{CompletedPart, MemoryObjectStore, ObjectStore, StoreCapabilities, StoredObject};
pub use strategy::{StrategySelector, UploadStrategy};
pub use types::{
    CallerTier, ChunkInfo, ChunkPlan, FileId, MediaKind, PartToken, ProcessingFlags, SessionId, StrategyKind,
    UploadRequest,
};
pub use validator::{RequestValidator, ValidatedRequest};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CallerTier, MemoryObjectStore, ObjectStore, ProgressSink, Result, StrategyConfig, StrategyKind,
        UploadAdapter, UploadError, UploadProgress, UploadRequest, UploadResult,
    };
}
