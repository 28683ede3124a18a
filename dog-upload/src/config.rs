use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CallerTier, MediaKind, Result, UploadError};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Smallest and largest chunk sizes a multipart transfer may use
pub const MIN_CHUNK_SIZE: u64 = MIB;
pub const MAX_CHUNK_SIZE: u64 = 100 * MIB;

/// Prefix for environment overrides (`DOG_UPLOAD__CHUNK_SIZE=...`)
pub const ENV_PREFIX: &str = "DOG_UPLOAD__";

/// Process-wide transfer settings, loaded once and read-only afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Payloads up to this size go through a single `put`
    pub small_threshold: u64,

    /// Payloads up to this size use concurrent chunks; above it, memory-safe
    pub medium_threshold: u64,

    /// Absolute ceiling for any upload regardless of tier
    pub large_threshold: u64,

    pub max_concurrent_chunks: usize,
    pub chunk_size: u64,

    /// Memory usage ratio that triggers a reclamation hint
    pub memory_warning_threshold: f64,

    /// Memory usage ratio that aborts a memory-safe transfer
    pub memory_critical_threshold: f64,

    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub chunk_timeout_ms: u64,

    /// Memory-safe transfers issue a reclamation hint every N chunks
    pub reclaim_every_chunks: usize,

    /// Bucket/namespace objects are written to
    pub namespace: String,

    /// Tiers that always use the direct strategy
    pub pinned_direct_tiers: Vec<CallerTier>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            small_threshold: 10 * MIB,
            medium_threshold: 100 * MIB,
            large_threshold: 5 * GIB,
            max_concurrent_chunks: 3,
            chunk_size: 5 * MIB,
            memory_warning_threshold: 0.75,
            memory_critical_threshold: 0.90,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            chunk_timeout_ms: 60_000,
            reclaim_every_chunks: 10,
            namespace: "uploads".to_string(),
            pinned_direct_tiers: vec![CallerTier::Guest],
        }
    }
}

impl StrategyConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `DOG_UPLOAD__*` environment variables, validated
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`StrategyConfig::from_env`] over an explicit variable list
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(field) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            config.apply(&field.to_ascii_lowercase(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, field: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| UploadError::config(format!("{} has invalid value '{}'", field, value)))
        }

        match field {
            "small_threshold" => self.small_threshold = parse(field, value)?,
            "medium_threshold" => self.medium_threshold = parse(field, value)?,
            "large_threshold" => self.large_threshold = parse(field, value)?,
            "max_concurrent_chunks" => self.max_concurrent_chunks = parse(field, value)?,
            "chunk_size" => self.chunk_size = parse(field, value)?,
            "memory_warning_threshold" => self.memory_warning_threshold = parse(field, value)?,
            "memory_critical_threshold" => self.memory_critical_threshold = parse(field, value)?,
            "max_retries" => self.max_retries = parse(field, value)?,
            "retry_base_delay_ms" => self.retry_base_delay_ms = parse(field, value)?,
            "retry_max_delay_ms" => self.retry_max_delay_ms = parse(field, value)?,
            "chunk_timeout_ms" => self.chunk_timeout_ms = parse(field, value)?,
            "reclaim_every_chunks" => self.reclaim_every_chunks = parse(field, value)?,
            "namespace" => self.namespace = value.trim().to_string(),
            "pinned_direct_tiers" => {
                self.pinned_direct_tiers = value
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(str::parse)
                    .collect::<Result<Vec<_>>>()?;
            }
            // Unknown keys under the prefix belong to other layers (tier limits, filenames)
            _ => {}
        }
        Ok(())
    }

    /// Check the ordering and range rules every setting must satisfy
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.small_threshold >= self.medium_threshold {
            problems.push(format!(
                "small_threshold ({}) must be below medium_threshold ({})",
                self.small_threshold, self.medium_threshold
            ));
        }
        if self.medium_threshold > self.large_threshold {
            problems.push(format!(
                "medium_threshold ({}) must not exceed large_threshold ({})",
                self.medium_threshold, self.large_threshold
            ));
        }
        let warning = self.memory_warning_threshold;
        let critical = self.memory_critical_threshold;
        if !(0.0 < warning && warning < critical && critical < 1.0) {
            problems.push(format!(
                "memory thresholds must satisfy 0 < warning ({}) < critical ({}) < 1",
                warning, critical
            ));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            problems.push(format!(
                "chunk_size ({}) must be between {} and {} bytes",
                self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            ));
        }
        if self.max_concurrent_chunks < 1 {
            problems.push("max_concurrent_chunks must be at least 1".to_string());
        }
        if self.reclaim_every_chunks < 1 {
            problems.push("reclaim_every_chunks must be at least 1".to_string());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            problems.push(format!(
                "retry_base_delay_ms ({}) must not exceed retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(UploadError::config(problems.join("; ")))
        }
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn is_pinned_direct(&self, tier: CallerTier) -> bool {
        self.pinned_direct_tiers.contains(&tier)
    }

    pub fn with_thresholds(mut self, small: u64, medium: u64) -> Self {
        self.small_threshold = small;
        self.medium_threshold = medium;
        self
    }

    pub fn with_large_threshold(mut self, bytes: u64) -> Self {
        self.large_threshold = bytes;
        self
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_max_concurrent_chunks(mut self, max: usize) -> Self {
        self.max_concurrent_chunks = max;
        self
    }

    pub fn with_memory_thresholds(mut self, warning: f64, critical: f64) -> Self {
        self.memory_warning_threshold = warning;
        self.memory_critical_threshold = critical;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay_ms = base_delay.as_millis() as u64;
        self.retry_max_delay_ms = self.retry_max_delay_ms.max(self.retry_base_delay_ms);
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reclaim_every(mut self, chunks: usize) -> Self {
        self.reclaim_every_chunks = chunks;
        self
    }

    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_pinned_direct_tiers(mut self, tiers: Vec<CallerTier>) -> Self {
        self.pinned_direct_tiers = tiers;
        self
    }
}

/// Per-kind byte limits for one tier; zero means the kind is not permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindLimits {
    pub image: u64,
    pub video: u64,
    pub document: u64,
    pub archive: u64,
}

impl KindLimits {
    pub const fn new(image: u64, video: u64, document: u64, archive: u64) -> Self {
        Self {
            image,
            video,
            document,
            archive,
        }
    }

    pub fn limit_for(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Image | MediaKind::Gif => self.image,
            MediaKind::Video => self.video,
            MediaKind::Document => self.document,
            MediaKind::Archive => self.archive,
        }
    }
}

/// Read-only map from caller tier to per-kind size limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierLimits {
    limits: BTreeMap<CallerTier, KindLimits>,
}

impl Default for TierLimits {
    fn default() -> Self {
        let limits = BTreeMap::from([
            (CallerTier::Guest, KindLimits::new(5 * MIB, 0, 2 * MIB, 0)),
            (CallerTier::User, KindLimits::new(20 * MIB, 100 * MIB, 20 * MIB, 50 * MIB)),
            (CallerTier::Vip, KindLimits::new(50 * MIB, 500 * MIB, 50 * MIB, 200 * MIB)),
            (CallerTier::Creator, KindLimits::new(100 * MIB, 2 * GIB, 100 * MIB, 500 * MIB)),
            (CallerTier::Admin, KindLimits::new(500 * MIB, 5 * GIB, 500 * MIB, 5 * GIB)),
        ]);
        Self { limits }
    }
}

impl TierLimits {
    pub fn new(limits: BTreeMap<CallerTier, KindLimits>) -> Self {
        Self { limits }
    }

    /// Parse a JSON object keyed by tier name (`{"GUEST": {"image": ...}}`)
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Limits for a tier; a tier missing from the map may upload nothing
    pub fn for_tier(&self, tier: CallerTier) -> KindLimits {
        self.limits
            .get(&tier)
            .copied()
            .unwrap_or(KindLimits::new(0, 0, 0, 0))
    }

    pub fn with_tier(mut self, tier: CallerTier, limits: KindLimits) -> Self {
        self.limits.insert(tier, limits);
        self
    }
}

/// Request-level validation rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    pub max_filename_length: usize,
    pub allowed_mime_types: Vec<String>,
    /// Refused as the final extension
    pub forbidden_extensions: Vec<String>,
    /// Refused anywhere in the name (`shell.php.jpg`); things a web server or OS will execute
    pub executable_extensions: Vec<String>,
}

impl ValidationRules {
    pub const DEFAULT_ALLOWED_MIME_TYPES: &'static [&'static str] = &[
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "image/avif",
        "image/heic",
        "image/bmp",
        "video/mp4",
        "video/webm",
        "video/quicktime",
        "video/x-matroska",
        "video/x-msvideo",
        "application/pdf",
        "text/plain",
        "text/markdown",
        "text/csv",
        "application/msword",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/zip",
        "application/x-7z-compressed",
        "application/x-tar",
        "application/gzip",
        "application/vnd.rar",
    ];

    pub const DEFAULT_FORBIDDEN_EXTENSIONS: &'static [&'static str] = &[
        // executables and installers
        "exe", "com", "scr", "pif", "msi", "msp", "dll", "sys", "cpl", "bin", "app", "apk", "deb", "rpm",
        // shell and desktop scripts
        "bat", "cmd", "sh", "bash", "zsh", "ps1", "psm1", "vbs", "vbe", "js", "jse", "wsf", "wsh", "hta",
        "jar", "lnk", "reg", "inf",
        // server-side scripts
        "php", "php3", "php4", "php5", "php7", "phtml", "phar", "asp", "aspx", "jsp", "jspx", "cgi", "pl",
        "py", "rb",
        // system and configuration files
        "htaccess", "htpasswd", "ini", "cfg", "conf", "config",
    ];

    pub const DEFAULT_EXECUTABLE_EXTENSIONS: &'static [&'static str] = &[
        "exe", "scr", "pif", "msi", "dll", "bat", "cmd", "ps1", "vbs", "hta", "jar", "php", "php3", "php4",
        "php5", "php7", "phtml", "phar", "asp", "aspx", "jsp", "jspx", "cgi", "shtml",
    ];

    pub fn with_max_filename_length(mut self, max: usize) -> Self {
        self.max_filename_length = max;
        self
    }

    pub fn allow_mime_type<S: Into<String>>(mut self, mime: S) -> Self {
        self.allowed_mime_types.push(mime.into().to_ascii_lowercase());
        self
    }
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_filename_length: 255,
            allowed_mime_types: Self::DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            forbidden_extensions: Self::DEFAULT_FORBIDDEN_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            executable_extensions: Self::DEFAULT_EXECUTABLE_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Settings for filename normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilenameConfig {
    /// Maximum length of the whole name in UTF-8 bytes
    pub max_length: usize,

    /// Longer extensions are cut to this many bytes
    pub max_extension_length: usize,

    /// When false, non-ASCII characters are folded to ASCII
    pub unicode_support: bool,

    /// Replace emoji and pictographs with `_`
    pub replace_emoji: bool,

    pub reserved_suffix: String,
    pub placeholder_prefix: String,
}

impl Default for FilenameConfig {
    fn default() -> Self {
        Self {
            max_length: 255,
            max_extension_length: 16,
            unicode_support: true,
            replace_emoji: true,
            reserved_suffix: "_file".to_string(),
            placeholder_prefix: "unnamed".to_string(),
        }
    }
}

impl FilenameConfig {
    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = max;
        self
    }

    pub fn ascii_only(mut self) -> Self {
        self.unicode_support = false;
        self
    }

    pub fn keep_emoji(mut self) -> Self {
        self.replace_emoji = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        // Room for a placeholder stem, the dot and the longest extension
        if self.max_length < self.max_extension_length + 32 {
            return Err(UploadError::config(format!(
                "filename max_length ({}) must leave room for a {}-byte extension",
                self.max_length, self.max_extension_length
            )));
        }
        if self.max_extension_length == 0 {
            return Err(UploadError::config("max_extension_length must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        StrategyConfig::default().validate().unwrap();
        FilenameConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_thresholds_and_bad_ratios() {
        let err = StrategyConfig::default()
            .with_thresholds(200 * MIB, 100 * MIB)
            .with_memory_thresholds(0.9, 0.8)
            .validate()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("small_threshold"));
        assert!(message.contains("memory thresholds"));
    }

    #[test]
    fn rejects_chunk_size_out_of_range() {
        assert!(StrategyConfig::default().with_chunk_size(512 * KIB).validate().is_err());
        assert!(StrategyConfig::default().with_chunk_size(101 * MIB).validate().is_err());
        assert!(StrategyConfig::default().with_chunk_size(MIB).validate().is_ok());
        assert!(StrategyConfig::default().with_max_concurrent_chunks(0).validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let config = StrategyConfig::from_vars([
            ("DOG_UPLOAD__CHUNK_SIZE", "10485760"),
            ("DOG_UPLOAD__MAX_CONCURRENT_CHUNKS", "5"),
            ("DOG_UPLOAD__PINNED_DIRECT_TIERS", "guest,user"),
            ("UNRELATED", "x"),
        ])
        .unwrap();
        assert_eq!(config.chunk_size, 10 * MIB);
        assert_eq!(config.max_concurrent_chunks, 5);
        assert_eq!(config.pinned_direct_tiers, vec![CallerTier::Guest, CallerTier::User]);

        let err = StrategyConfig::from_vars([("DOG_UPLOAD__CHUNK_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, UploadError::Config { .. }));
    }

    #[test]
    fn backend_url_settings_are_left_to_the_backend() {
        let config = StrategyConfig::from_vars([
            ("DOG_UPLOAD__PUBLIC_BASE_URL", "https://cdn.example.com"),
            ("DOG_UPLOAD__S3_PUBLIC_BASE_URL", "https://cdn.example.com"),
        ])
        .unwrap();
        assert_eq!(config, StrategyConfig::default());

        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("public_base_url").is_none());
    }

    #[test]
    fn tier_limits_from_json() {
        let limits = TierLimits::from_json(
            r#"{"GUEST": {"image": 1024, "video": 0, "document": 0, "archive": 0}}"#,
        )
        .unwrap();
        assert_eq!(limits.for_tier(CallerTier::Guest).limit_for(MediaKind::Gif), 1024);
        assert_eq!(limits.for_tier(CallerTier::Admin).limit_for(MediaKind::Image), 0);
        assert_eq!(
            TierLimits::default().for_tier(CallerTier::Guest).limit_for(MediaKind::Video),
            0
        );
    }
}
