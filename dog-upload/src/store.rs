use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::{PartToken, Result, SessionId, UploadError};

/// Object-storage operations every backend must implement
///
/// Backends are shared by concurrent chunk tasks and must tolerate concurrent
/// calls on the same session.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a whole object in one request
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<StoredObject>;

    /// Open a multipart session for `key`
    async fn initiate_multipart(
        &self,
        namespace: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<SessionId>;

    /// Upload one part; part numbers start at 1
    async fn upload_part(&self, session: &SessionId, part_number: u32, body: Bytes) -> Result<PartToken>;

    /// Assemble the listed parts, in order, into the final object
    async fn complete_multipart(&self, session: &SessionId, parts: Vec<CompletedPart>) -> Result<StoredObject>;

    /// Discard the session and every part uploaded to it
    async fn abort_multipart(&self, session: &SessionId) -> Result<()>;

    /// Get store capabilities
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::default()
    }
}

/// Where a stored object ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
    pub size_bytes: u64,
    pub etag: Option<String>,
}

/// Completed part for multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub token: PartToken,
}

/// Store capabilities
#[derive(Debug, Clone, Default)]
pub struct StoreCapabilities {
    pub min_part_size: Option<u64>,
    pub max_part_size: Option<u64>,
    pub max_parts: Option<u32>,
}

impl StoreCapabilities {
    pub fn with_part_limits(mut self, min_size: Option<u64>, max_size: Option<u64>, max_parts: Option<u32>) -> Self {
        self.min_part_size = min_size;
        self.max_part_size = max_size;
        self.max_parts = max_parts;
        self
    }
}

struct PendingUpload {
    namespace: String,
    key: String,
    content_type: Option<String>,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct FaultPlan {
    /// part number -> failures left
    part_failures: HashMap<u32, u32>,
    /// part number -> (stalls left, stall length)
    part_stalls: HashMap<u32, (u32, Duration)>,
    put_failures: u32,
    complete_failures: u32,
    fail_abort: bool,
    part_delay: Option<Duration>,
    /// Stored but not yet acknowledged: `put` and `complete` answer this much later
    ack_delay: Option<Duration>,
}

#[derive(Default)]
struct CallCounters {
    put: AtomicUsize,
    initiate: AtomicUsize,
    part: AtomicUsize,
    complete: AtomicUsize,
    abort: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Decrements the in-flight gauge even when the part future is dropped mid-call
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory object store for testing and development
///
/// Keeps every object and open session in memory, counts calls, tracks how
/// many part uploads overlap, and can be scripted to fail.
pub struct MemoryObjectStore {
    base_url: String,
    objects: Mutex<HashMap<String, StoredBlob>>,
    sessions: Mutex<HashMap<SessionId, PendingUpload>>,
    aborted: Mutex<Vec<SessionId>>,
    part_attempts: Mutex<HashMap<u32, u32>>,
    committed: Mutex<Vec<u32>>,
    faults: Mutex<FaultPlan>,
    calls: CallCounters,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    content_type: Option<String>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("memory://objects")
    }
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            aborted: Mutex::new(Vec::new()),
            part_attempts: Mutex::new(HashMap::new()),
            committed: Mutex::new(Vec::new()),
            faults: Mutex::new(FaultPlan::default()),
            calls: CallCounters::default(),
        }
    }

    /// Fail the next `times` uploads of `part_number`
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.faults.lock().part_failures.insert(part_number, times);
    }

    /// Hold the next `times` uploads of `part_number` for `duration` before answering
    pub fn stall_part(&self, part_number: u32, times: u32, duration: Duration) {
        self.faults.lock().part_stalls.insert(part_number, (times, duration));
    }

    pub fn fail_puts(&self, times: u32) {
        self.faults.lock().put_failures = times;
    }

    pub fn fail_completes(&self, times: u32) {
        self.faults.lock().complete_failures = times;
    }

    pub fn fail_aborts(&self) {
        self.faults.lock().fail_abort = true;
    }

    /// Every part upload takes at least this long
    pub fn with_part_delay(self, delay: Duration) -> Self {
        self.faults.lock().part_delay = Some(delay);
        self
    }

    /// `put` and `complete_multipart` write the object, then wait this long before answering
    pub fn with_ack_delay(self, delay: Duration) -> Self {
        self.faults.lock().ack_delay = Some(delay);
        self
    }

    pub fn object(&self, namespace: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&Self::object_path(namespace, key))
            .map(|blob| blob.data.clone())
    }

    pub fn content_type(&self, namespace: &str, key: &str) -> Option<String> {
        self.objects
            .lock()
            .get(&Self::object_path(namespace, key))
            .and_then(|blob| blob.content_type.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Sessions neither completed nor aborted
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn aborted_sessions(&self) -> Vec<SessionId> {
        self.aborted.lock().clone()
    }

    /// Part numbers of the most recent completed multipart upload, in commit order
    pub fn last_committed_parts(&self) -> Vec<u32> {
        self.committed.lock().clone()
    }

    /// How many times `part_number` was sent, across all sessions
    pub fn part_attempts(&self, part_number: u32) -> u32 {
        self.part_attempts.lock().get(&part_number).copied().unwrap_or(0)
    }

    pub fn put_calls(&self) -> usize {
        self.calls.put.load(Ordering::SeqCst)
    }

    pub fn initiate_calls(&self) -> usize {
        self.calls.initiate.load(Ordering::SeqCst)
    }

    pub fn part_calls(&self) -> usize {
        self.calls.part.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.calls.complete.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.calls.abort.load(Ordering::SeqCst)
    }

    /// Most part uploads that were ever running at the same time
    pub fn peak_concurrent_parts(&self) -> usize {
        self.calls.peak_in_flight.load(Ordering::SeqCst)
    }

    fn object_path(namespace: &str, key: &str) -> String {
        format!("{}/{}", namespace, key)
    }

    fn url_for(&self, namespace: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, namespace, key)
    }

    fn etag(data: &[u8]) -> String {
        let digest = Sha256::digest(data);
        hex::encode(&digest[..16])
    }

    async fn acknowledge(&self) {
        let delay = self.faults.lock().ack_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<StoredObject> {
        self.calls.put.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&mut self.faults.lock().put_failures) {
            return Err(UploadError::backend("simulated put failure"));
        }

        let etag = Self::etag(&body);
        let size_bytes = body.len() as u64;
        self.objects.lock().insert(
            Self::object_path(namespace, key),
            StoredBlob {
                data: body,
                content_type: content_type.map(str::to_string),
            },
        );
        self.acknowledge().await;

        Ok(StoredObject {
            key: key.to_string(),
            url: self.url_for(namespace, key),
            size_bytes,
            etag: Some(etag),
        })
    }

    async fn initiate_multipart(
        &self,
        namespace: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<SessionId> {
        self.calls.initiate.fetch_add(1, Ordering::SeqCst);
        let id = SessionId::new();
        self.sessions.lock().insert(
            id.clone(),
            PendingUpload {
                namespace: namespace.to_string(),
                key: key.to_string(),
                content_type: content_type.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(&self, session: &SessionId, part_number: u32, body: Bytes) -> Result<PartToken> {
        self.calls.part.fetch_add(1, Ordering::SeqCst);
        let current = self.calls.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.calls.in_flight);
        self.calls.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        *self.part_attempts.lock().entry(part_number).or_insert(0) += 1;

        let (delay, stall, fail) = {
            let mut faults = self.faults.lock();
            let stall = match faults.part_stalls.get_mut(&part_number) {
                Some((left, duration)) if *left > 0 => {
                    *left -= 1;
                    Some(*duration)
                }
                _ => None,
            };
            let fail = faults
                .part_failures
                .get_mut(&part_number)
                .map(Self::take_fault)
                .unwrap_or(false);
            (faults.part_delay, stall, fail)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        if fail {
            return Err(UploadError::backend(format!("simulated failure for part {}", part_number)));
        }

        let token = PartToken::new(Self::etag(&body));
        let mut sessions = self.sessions.lock();
        let upload = sessions
            .get_mut(session)
            .ok_or_else(|| UploadError::backend(format!("no such upload session: {}", session)))?;
        upload.parts.insert(part_number, body);
        Ok(token)
    }

    async fn complete_multipart(&self, session: &SessionId, parts: Vec<CompletedPart>) -> Result<StoredObject> {
        self.calls.complete.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&mut self.faults.lock().complete_failures) {
            return Err(UploadError::backend("simulated complete failure"));
        }

        let upload = self
            .sessions
            .lock()
            .remove(session)
            .ok_or_else(|| UploadError::backend(format!("no such upload session: {}", session)))?;

        let mut assembled = BytesMut::new();
        for part in &parts {
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                UploadError::backend(format!("part {} was never uploaded", part.part_number))
            })?;
            if Self::etag(data) != part.token.as_str() {
                return Err(UploadError::backend(format!("part {} token mismatch", part.part_number)));
            }
            assembled.extend_from_slice(data);
        }

        *self.committed.lock() = parts.iter().map(|p| p.part_number).collect();
        let data = assembled.freeze();
        let size_bytes = data.len() as u64;
        let etag = format!("{}-{}", Self::etag(&data), parts.len());
        self.objects.lock().insert(
            Self::object_path(&upload.namespace, &upload.key),
            StoredBlob {
                data,
                content_type: upload.content_type,
            },
        );
        self.acknowledge().await;

        Ok(StoredObject {
            url: self.url_for(&upload.namespace, &upload.key),
            key: upload.key,
            size_bytes,
            etag: Some(etag),
        })
    }

    async fn abort_multipart(&self, session: &SessionId) -> Result<()> {
        self.calls.abort.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().fail_abort {
            return Err(UploadError::backend("simulated abort failure"));
        }
        self.sessions.lock().remove(session);
        self.aborted.lock().push(session.clone());
        Ok(())
    }
}
