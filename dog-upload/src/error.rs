use thiserror::Error;

use crate::{CallerTier, MediaKind};

/// Result type for upload operations
pub type Result<T, E = UploadError> = std::result::Result<T, E>;

/// Why a filename was refused outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    /// Final extension is an executable, script or system file type
    ForbiddenExtension,
    /// A forbidden extension hides behind or in front of another one (`photo.jpg.exe`)
    DoubleExtension,
    /// Stem is a platform device name (`CON`, `LPT1`, ...)
    ReservedDeviceName,
}

impl std::fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::ForbiddenExtension => "forbidden extension",
            Self::DoubleExtension => "double extension",
            Self::ReservedDeviceName => "reserved device name",
        };
        f.write_str(text)
    }
}

/// Errors that can occur while validating or transferring an upload
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    #[error("Invalid upload request: {message}")]
    Validation { message: String },

    #[error("File size {size} bytes exceeds the {kind} limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64, kind: MediaKind },

    #[error("{tier} callers may not upload {kind} files")]
    KindNotPermitted { tier: CallerTier, kind: MediaKind },

    #[error("Unsupported mime type: {mime}")]
    UnsupportedMimeType { mime: String },

    #[error("Forbidden file pattern in '{filename}': {reason}")]
    ForbiddenFilePattern {
        filename: String,
        reason: ForbiddenReason,
    },

    #[error("Memory usage {ratio:.2} above critical threshold {critical:.2} before chunk {chunk_index}")]
    MemoryLimitExceeded {
        ratio: f64,
        critical: f64,
        chunk_index: usize,
    },

    #[error("Chunk {chunk_index} failed to upload: {reason}")]
    ChunkUploadFailed { chunk_index: usize, reason: String },

    #[error("Upload session {session_id} aborted: {reason}")]
    SessionAborted { session_id: String, reason: String },

    #[error("Failed to abort upload session {session_id}: {reason}")]
    SessionAbort { session_id: String, reason: String },

    #[error("Storage backend error: {message}{}", describe_chunk(.chunk_index, .total_chunks, .attempts))]
    StorageBackend {
        message: String,
        chunk_index: Option<usize>,
        total_chunks: Option<usize>,
        attempts: u32,
    },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Unknown upload error: {0}")]
    Unknown(String),
}

fn describe_chunk(chunk_index: &Option<usize>, total_chunks: &Option<usize>, attempts: &u32) -> String {
    match (chunk_index, total_chunks) {
        (Some(index), Some(total)) => {
            format!(" (chunk {} of {}, {} attempts)", index, total, attempts)
        }
        _ if *attempts > 1 => format!(" ({} attempts)", attempts),
        _ => String::new(),
    }
}

impl UploadError {
    /// Create a backend error from anything printable
    pub fn backend<E: std::fmt::Display>(error: E) -> Self {
        Self::StorageBackend {
            message: error.to_string(),
            chunk_index: None,
            total_chunks: None,
            attempts: 1,
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a chunk failure
    pub fn chunk_failed<S: Into<String>>(chunk_index: usize, reason: S) -> Self {
        Self::ChunkUploadFailed {
            chunk_index,
            reason: reason.into(),
        }
    }

    /// Create a cancellation outcome
    pub fn aborted<S: Into<String>, R: Into<String>>(session_id: S, reason: R) -> Self {
        Self::SessionAborted {
            session_id: session_id.into(),
            reason: reason.into(),
        }
    }

    /// Transient faults that the shared retry policy may repeat
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChunkUploadFailed { .. } | Self::StorageBackend { .. })
    }

    /// Errors raised before any backend state exists
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::SizeLimitExceeded { .. }
                | Self::KindNotPermitted { .. }
                | Self::UnsupportedMimeType { .. }
                | Self::ForbiddenFilePattern { .. }
        )
    }

    /// Stable taxonomy name, used in logs and settled results
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Self::KindNotPermitted { .. } => "kind_not_permitted",
            Self::UnsupportedMimeType { .. } => "unsupported_mime_type",
            Self::ForbiddenFilePattern { .. } => "forbidden_file_pattern",
            Self::MemoryLimitExceeded { .. } => "memory_limit_exceeded",
            Self::ChunkUploadFailed { .. } => "chunk_upload_failed",
            Self::SessionAborted { .. } => "session_aborted",
            Self::SessionAbort { .. } => "session_abort_error",
            Self::StorageBackend { .. } => "storage_backend_error",
            Self::Config { .. } => "config_error",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Record how many attempts were spent before giving up
    pub(crate) fn with_attempts(self, attempts: u32) -> Self {
        match self {
            Self::StorageBackend {
                message,
                chunk_index,
                total_chunks,
                ..
            } => Self::StorageBackend {
                message,
                chunk_index,
                total_chunks,
                attempts,
            },
            other => other,
        }
    }

    /// Turn a retry-exhausted fault into the terminal backend error for a chunk
    pub(crate) fn exhausted(self, chunk_index: usize, total_chunks: usize, attempts: u32) -> Self {
        let message = match self {
            Self::StorageBackend { message, .. } => message,
            Self::ChunkUploadFailed { reason, .. } => reason,
            other => return other,
        };
        Self::StorageBackend {
            message,
            chunk_index: Some(chunk_index),
            total_chunks: Some(total_chunks),
            attempts,
        }
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(UploadError::backend("reset by peer").is_retryable());
        assert!(UploadError::chunk_failed(2, "timeout").is_retryable());
        assert!(!UploadError::validation("empty filename").is_retryable());
        let memory = UploadError::MemoryLimitExceeded {
            ratio: 0.95,
            critical: 0.9,
            chunk_index: 4,
        };
        assert!(!memory.is_retryable());
        assert_eq!(memory.code(), "memory_limit_exceeded");
    }

    #[test]
    fn exhausted_carries_chunk_context() {
        let err = UploadError::chunk_failed(3, "connection reset").exhausted(3, 8, 4);
        match &err {
            UploadError::StorageBackend {
                chunk_index,
                total_chunks,
                attempts,
                ..
            } => {
                assert_eq!(*chunk_index, Some(3));
                assert_eq!(*total_chunks, Some(8));
                assert_eq!(*attempts, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "Storage backend error: connection reset (chunk 3 of 8, 4 attempts)"
        );
    }
}
