use std::sync::Arc;

use crate::error::ForbiddenReason;
use crate::filename::is_reserved;
use crate::{MediaKind, Result, StrategyConfig, TierLimits, UploadError, UploadRequest, ValidationRules};

const OCTET_STREAM: &str = "application/octet-stream";

/// What validation learned about an accepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    /// Lowercased mime type without parameters, inferred from the name when needed
    pub mime_type: String,
    pub media_kind: MediaKind,
    /// Tier limit the payload was checked against
    pub limit: u64,
}

/// Checks filename, mime type and tier quota before any transfer begins
///
/// Pure: no backend calls and no partial state. Every failure is terminal.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    rules: ValidationRules,
    tier_limits: TierLimits,
    config: Arc<StrategyConfig>,
}

impl RequestValidator {
    pub fn new(rules: ValidationRules, tier_limits: TierLimits, config: Arc<StrategyConfig>) -> Self {
        Self {
            rules,
            tier_limits,
            config,
        }
    }

    pub fn tier_limits(&self) -> &TierLimits {
        &self.tier_limits
    }

    pub fn validate(&self, request: &UploadRequest) -> Result<ValidatedRequest> {
        self.check_filename(&request.filename)?;

        let mime_type = self.resolve_mime(&request.filename, &request.mime_type)?;
        let media_kind = MediaKind::from_mime(&mime_type)
            .ok_or_else(|| UploadError::UnsupportedMimeType { mime: mime_type.clone() })?;

        let limit = self.check_size(request, media_kind)?;

        Ok(ValidatedRequest {
            mime_type,
            media_kind,
            limit,
        })
    }

    fn check_filename(&self, filename: &str) -> Result<()> {
        let name = filename.trim();
        if name.is_empty() {
            return Err(UploadError::validation("filename is empty"));
        }
        let length = name.chars().count();
        if length > self.rules.max_filename_length {
            return Err(UploadError::validation(format!(
                "filename is {} characters, limit is {}",
                length, self.rules.max_filename_length
            )));
        }

        // Windows drops trailing dots and spaces, so `evil.exe.` is still an exe
        let name = name.trim_end_matches(|c: char| c == '.' || c.is_whitespace());
        let mut segments = name.split('.');
        let stem = segments.next().unwrap_or_default();
        let extensions: Vec<String> = segments.map(|s| s.trim().to_ascii_lowercase()).collect();

        if let Some((last, inner)) = extensions.split_last() {
            let reason = if contains(&self.rules.forbidden_extensions, last) {
                Some(if inner.is_empty() {
                    ForbiddenReason::ForbiddenExtension
                } else {
                    ForbiddenReason::DoubleExtension
                })
            } else if inner.iter().any(|ext| contains(&self.rules.executable_extensions, ext)) {
                Some(ForbiddenReason::DoubleExtension)
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(UploadError::ForbiddenFilePattern {
                    filename: filename.to_string(),
                    reason,
                });
            }
        }

        if is_reserved(stem) {
            return Err(UploadError::ForbiddenFilePattern {
                filename: filename.to_string(),
                reason: ForbiddenReason::ReservedDeviceName,
            });
        }
        Ok(())
    }

    fn resolve_mime(&self, filename: &str, declared: &str) -> Result<String> {
        let mut mime = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if mime.is_empty() || mime == OCTET_STREAM {
            if let Some(guess) = mime_guess::from_path(filename).first() {
                mime = guess.essence_str().to_ascii_lowercase();
            }
        }
        if mime.is_empty() {
            mime = OCTET_STREAM.to_string();
        }

        if self.rules.allowed_mime_types.iter().any(|allowed| allowed.eq_ignore_ascii_case(&mime)) {
            Ok(mime)
        } else {
            Err(UploadError::UnsupportedMimeType { mime })
        }
    }

    fn check_size(&self, request: &UploadRequest, kind: MediaKind) -> Result<u64> {
        let size = request.size();
        if size == 0 {
            return Err(UploadError::validation("payload is empty"));
        }

        let limit = self.tier_limits.for_tier(request.caller_tier).limit_for(kind);
        if limit == 0 {
            return Err(UploadError::KindNotPermitted {
                tier: request.caller_tier,
                kind,
            });
        }
        if size > limit {
            return Err(UploadError::SizeLimitExceeded { size, limit, kind });
        }

        if size > self.config.large_threshold {
            return Err(UploadError::SizeLimitExceeded {
                size,
                limit: self.config.large_threshold,
                kind,
            });
        }
        // Pinned tiers only ever get a single-shot transfer
        if self.config.is_pinned_direct(request.caller_tier) && size > self.config.small_threshold {
            return Err(UploadError::SizeLimitExceeded {
                size,
                limit: self.config.small_threshold,
                kind,
            });
        }
        Ok(limit)
    }
}

fn contains(list: &[String], extension: &str) -> bool {
    list.iter().any(|entry| entry.eq_ignore_ascii_case(extension))
}
