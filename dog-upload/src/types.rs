use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub String);

impl FileId {
    /// Generate a new random file ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-issued identifier for a multipart session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID (used by in-process backends)
    pub fn new() -> Self {
        Self(format!("mpu_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-issued token for one uploaded part (ETag equivalent)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartToken(pub String);

impl PartToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Ordered permission/quota level of the uploading caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallerTier {
    Guest,
    User,
    Vip,
    Creator,
    Admin,
}

impl CallerTier {
    pub const ALL: [CallerTier; 5] = [
        CallerTier::Guest,
        CallerTier::User,
        CallerTier::Vip,
        CallerTier::Creator,
        CallerTier::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallerTier::Guest => "GUEST",
            CallerTier::User => "USER",
            CallerTier::Vip => "VIP",
            CallerTier::Creator => "CREATOR",
            CallerTier::Admin => "ADMIN",
        }
    }
}

impl std::fmt::Display for CallerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallerTier {
    type Err = crate::UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GUEST" => Ok(CallerTier::Guest),
            "USER" => Ok(CallerTier::User),
            "VIP" => Ok(CallerTier::Vip),
            "CREATOR" => Ok(CallerTier::Creator),
            "ADMIN" => Ok(CallerTier::Admin),
            other => Err(crate::UploadError::config(format!("unknown caller tier: {}", other))),
        }
    }
}

/// Kind of media inferred from the mime type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaKind {
    Image,
    Gif,
    Video,
    Document,
    Archive,
}

impl MediaKind {
    /// Infer the kind from a normalized mime type
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        if mime == "image/gif" {
            return Some(MediaKind::Gif);
        }
        if mime.starts_with("image/") {
            return Some(MediaKind::Image);
        }
        if mime.starts_with("video/") {
            return Some(MediaKind::Video);
        }
        match mime.as_str() {
            "application/zip"
            | "application/x-zip-compressed"
            | "application/x-7z-compressed"
            | "application/x-tar"
            | "application/gzip"
            | "application/x-gzip"
            | "application/vnd.rar"
            | "application/x-rar-compressed" => Some(MediaKind::Archive),
            "application/pdf"
            | "application/msword"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            | "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "text/plain"
            | "text/markdown"
            | "text/csv" => Some(MediaKind::Document),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "IMAGE",
            MediaKind::Gif => "GIF",
            MediaKind::Video => "VIDEO",
            MediaKind::Document => "DOCUMENT",
            MediaKind::Archive => "ARCHIVE",
        }
    }

    /// Whether dimensions can be read from the payload header
    pub fn is_visual(&self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::Gif)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-upload processing requested by the caller
///
/// `dedup` is served here (content hash on the result). Thumbnails and
/// transcodes are produced by downstream processors; the result carries the
/// requests that apply to the uploaded kind so those processors know what to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFlags {
    pub dedup: bool,
    pub thumbnail: bool,
    pub transcode: bool,
}

impl ProcessingFlags {
    /// Drop requests that make no sense for `kind`: thumbnails need an image or
    /// video, transcoding needs a video
    pub fn applicable_to(self, kind: MediaKind) -> Self {
        Self {
            dedup: self.dedup,
            thumbnail: self.thumbnail && (kind.is_visual() || kind == MediaKind::Video),
            transcode: self.transcode && kind == MediaKind::Video,
        }
    }

    pub fn any(&self) -> bool {
        self.dedup || self.thumbnail || self.transcode
    }
}

/// Request to upload an in-memory file
///
/// Built once and never mutated; the payload is shared by reference count, so
/// chunk views are slices of the same buffer rather than copies.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub payload: Bytes,
    pub mime_type: String,
    pub caller_id: String,
    pub caller_tier: CallerTier,
    pub target_context_id: Option<String>,
    pub flags: ProcessingFlags,
}

impl UploadRequest {
    pub fn new<F, C>(filename: F, payload: impl Into<Bytes>, caller_id: C, caller_tier: CallerTier) -> Self
    where
        F: Into<String>,
        C: Into<String>,
    {
        Self {
            filename: filename.into(),
            payload: payload.into(),
            mime_type: String::new(),
            caller_id: caller_id.into(),
            caller_tier,
            target_context_id: None,
            flags: ProcessingFlags::default(),
        }
    }

    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_target_context<S: Into<String>>(mut self, context_id: S) -> Self {
        self.target_context_id = Some(context_id.into());
        self
    }

    pub fn with_flags(mut self, flags: ProcessingFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_dedup(mut self) -> Self {
        self.flags.dedup = true;
        self
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Transfer algorithm chosen for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Direct,
    ChunkedStream,
    MemorySafe,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::ChunkedStream => "chunked-stream",
            StrategyKind::MemorySafe => "memory-safe",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One contiguous byte range of the payload, uploaded as one part
///
/// Holds offsets only; the bytes are sliced out of the request payload when the
/// part is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
    pub uploaded: bool,
    pub part_token: Option<PartToken>,
}

impl ChunkInfo {
    /// 1-based part number used by the backend
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..self.end() as usize
    }

    /// Record the backend's token for this part
    pub fn mark_uploaded(&mut self, token: PartToken) {
        self.uploaded = true;
        self.part_token = Some(token);
    }

    /// Split `total` bytes into `ceil(total / chunk_size)` chunks
    pub fn plan(total: u64, chunk_size: u64) -> Vec<ChunkInfo> {
        ChunkPlan::new(total, chunk_size).collect()
    }
}

/// Lazily computed chunk boundaries
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total: u64,
    chunk_size: u64,
    next_offset: u64,
    next_index: usize,
}

impl ChunkPlan {
    pub fn new(total: u64, chunk_size: u64) -> Self {
        Self {
            total,
            chunk_size: chunk_size.max(1),
            next_offset: 0,
            next_index: 0,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.total.div_ceil(self.chunk_size) as usize
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_offset >= self.total {
            return None;
        }
        let size = self.chunk_size.min(self.total - self.next_offset);
        let chunk = ChunkInfo {
            index: self.next_index,
            offset: self.next_offset,
            size,
            uploaded: false,
            part_token: None,
        };
        self.next_offset += size;
        self.next_index += 1;
        Some(chunk)
    }
}
