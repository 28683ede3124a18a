use std::collections::HashMap;
use std::env;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::store::{CompletedPart, ObjectStore, StoreCapabilities, StoredObject};
use crate::{PartToken, Result, SessionId, UploadError};

const MIB: u64 = 1024 * 1024;

/// S3 configuration from environment variables
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for S3-compatible services (MinIO, RustFS, R2)
    pub endpoint_url: Option<String>,
    /// Base for public object URLs; defaults to the endpoint
    pub public_base_url: Option<String>,
    pub force_path_style: bool,
}

impl S3Config {
    /// Reads `DOG_UPLOAD__S3_REGION`, `DOG_UPLOAD__S3_ACCESS_KEY_ID`,
    /// `DOG_UPLOAD__S3_SECRET_ACCESS_KEY` and the optional
    /// `DOG_UPLOAD__S3_ENDPOINT_URL` / `DOG_UPLOAD__S3_PUBLIC_BASE_URL`
    pub fn from_env() -> Result<Self> {
        fn get_env(key: &str) -> Result<String> {
            env::var(key).map_err(|_| UploadError::config(format!("{} environment variable required", key)))
        }

        let endpoint_url = env::var("DOG_UPLOAD__S3_ENDPOINT_URL").ok();
        Ok(Self {
            region: get_env("DOG_UPLOAD__S3_REGION")?,
            access_key_id: get_env("DOG_UPLOAD__S3_ACCESS_KEY_ID")?,
            secret_access_key: get_env("DOG_UPLOAD__S3_SECRET_ACCESS_KEY")?,
            force_path_style: endpoint_url.is_some(),
            endpoint_url,
            public_base_url: env::var("DOG_UPLOAD__S3_PUBLIC_BASE_URL").ok(),
        })
    }
}

/// Object store over any S3-compatible service
///
/// The namespace passed to each call is the bucket. Multipart session ids are
/// the service's upload ids; the bucket and key they belong to are remembered
/// here until the session is completed or aborted.
pub struct S3ObjectStore {
    client: Client,
    public_base_url: String,
    sessions: Mutex<HashMap<SessionId, OpenUpload>>,
}

/// Where a multipart upload lands and how large its parts were
#[derive(Debug, Clone)]
struct OpenUpload {
    bucket: String,
    key: String,
    part_sizes: HashMap<u32, u64>,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "dog-upload",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.force_path_style)
                .build(),
        );

        let public_base_url = config
            .public_base_url
            .or(config.endpoint_url)
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));

        Self {
            client,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn from_env() -> Result<Self> {
        Ok(Self::new(S3Config::from_env()?).await)
    }

    fn url_for(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, bucket, key)
    }

    fn session(&self, id: &SessionId) -> Result<(String, String)> {
        self.sessions
            .lock()
            .get(id)
            .map(|open| (open.bucket.clone(), open.key.clone()))
            .ok_or_else(|| UploadError::backend(format!("unknown upload session: {}", id)))
    }
}

/// Size of a committed object: the service's answer when it gave one, else the
/// bytes sent for the committed parts
fn committed_size(reported: Option<i64>, part_sizes: &HashMap<u32, u64>, parts: &[u32]) -> u64 {
    match reported {
        Some(length) if length >= 0 => length as u64,
        _ => parts.iter().filter_map(|n| part_sizes.get(n)).sum(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<StoredObject> {
        let size_bytes = body.len() as u64;
        let output = self
            .client
            .put_object()
            .bucket(namespace)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(UploadError::backend)?;

        Ok(StoredObject {
            key: key.to_string(),
            url: self.url_for(namespace, key),
            size_bytes,
            etag: output.e_tag().map(str::to_string),
        })
    }

    async fn initiate_multipart(
        &self,
        namespace: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<SessionId> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(namespace)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(UploadError::backend)?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| UploadError::backend("no upload id returned"))?;
        let id = SessionId::from_string(upload_id.to_string());
        self.sessions.lock().insert(
            id.clone(),
            OpenUpload {
                bucket: namespace.to_string(),
                key: key.to_string(),
                part_sizes: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(&self, session: &SessionId, part_number: u32, body: Bytes) -> Result<PartToken> {
        let (bucket, key) = self.session(session)?;
        let size = body.len() as u64;
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(session.as_str())
            .part_number(part_number as i32)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(UploadError::backend)?;

        let etag = output
            .e_tag()
            .ok_or_else(|| UploadError::backend(format!("no ETag returned for part {}", part_number)))?;
        if let Some(open) = self.sessions.lock().get_mut(session) {
            open.part_sizes.insert(part_number, size);
        }
        Ok(PartToken::new(etag))
    }

    async fn complete_multipart(&self, session: &SessionId, parts: Vec<CompletedPart>) -> Result<StoredObject> {
        let (bucket, key) = self.session(session)?;
        let numbers: Vec<u32> = parts.iter().map(|part| part.part_number).collect();
        let parts = parts
            .into_iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(part.token.0)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&bucket)
            .key(&key)
            .upload_id(session.as_str())
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(UploadError::backend)?;

        let part_sizes = self
            .sessions
            .lock()
            .remove(session)
            .map(|open| open.part_sizes)
            .unwrap_or_default();
        debug!(bucket = %bucket, key = %key, "multipart upload completed");

        // The object exists now; a failed lookup only costs us the reported size
        let reported = match self.client.head_object().bucket(&bucket).key(&key).send().await {
            Ok(head) => head.content_length(),
            Err(e) => {
                warn!(bucket = %bucket, key = %key, error = %e, "size lookup after commit failed");
                None
            }
        };

        Ok(StoredObject {
            url: self.url_for(&bucket, &key),
            size_bytes: committed_size(reported, &part_sizes, &numbers),
            etag: output.e_tag().map(str::to_string),
            key,
        })
    }

    async fn abort_multipart(&self, session: &SessionId) -> Result<()> {
        let (bucket, key) = self.session(session)?;
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(session.as_str())
            .send()
            .await
            .map_err(UploadError::backend)?;
        self.sessions.lock().remove(session);
        Ok(())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::default().with_part_limits(Some(5 * MIB), Some(5 * 1024 * MIB), Some(10_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> HashMap<u32, u64> {
        HashMap::from([(1, 5 * MIB), (2, 5 * MIB), (3, 17)])
    }

    #[test]
    fn reported_length_wins() {
        assert_eq!(committed_size(Some(42), &sizes(), &[1, 2, 3]), 42);
    }

    #[test]
    fn missing_length_falls_back_to_sent_parts() {
        assert_eq!(committed_size(None, &sizes(), &[1, 2, 3]), 10 * MIB + 17);
        assert_eq!(committed_size(Some(-1), &sizes(), &[1, 3]), 5 * MIB + 17);
        assert_eq!(committed_size(None, &HashMap::new(), &[1]), 0);
    }
}
