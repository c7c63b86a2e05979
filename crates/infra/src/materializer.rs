//! Copies a provider's transient result into our own storage.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tracing::{debug, instrument};

use genforge_generation::GenerationJob;

use crate::storage::{ObjectStorage, StorageError};

#[derive(Debug, Error)]
pub enum MaterializationError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("asset host returned status {0}")]
    Status(u16),

    #[error("asset body was empty")]
    EmptyBody,

    #[error("asset exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("download timed out")]
    Timeout,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Storage key for a job's asset: `generations/{owner}/{job}.{ext}`.
pub fn object_key(job: &GenerationJob, content_type: Option<&str>) -> String {
    let ext = content_type
        .and_then(extension_for)
        .unwrap_or_else(|| job.kind.default_extension());
    format!("generations/{}/{}.{}", job.owner_id, job.id, ext)
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        _ => None,
    }
}

/// 512 MiB; generous for video, small enough to keep in memory.
pub const DEFAULT_MAX_ASSET_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct ResultMaterializer {
    client: reqwest::Client,
    storage: Arc<dyn ObjectStorage>,
    timeout: Duration,
    max_bytes: u64,
}

impl std::fmt::Debug for ResultMaterializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultMaterializer")
            .field("timeout", &self.timeout)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl ResultMaterializer {
    pub fn new(client: reqwest::Client, storage: Arc<dyn ObjectStorage>, timeout: Duration) -> Self {
        Self {
            client,
            storage,
            timeout,
            max_bytes: DEFAULT_MAX_ASSET_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Fetch `asset_url` and store it under the job's key.
    ///
    /// A non-2xx response, an empty body or a body over `max_bytes` is an
    /// error, never a partial success.
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn materialize(
        &self,
        job: &GenerationJob,
        asset_url: &str,
    ) -> Result<String, MaterializationError> {
        let mut response = self
            .client
            .get(asset_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(download_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(MaterializationError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let too_large = MaterializationError::TooLarge {
            limit: self.max_bytes,
        };
        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(too_large);
        }

        // the declared length can be absent or wrong, so count as we read
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(download_error)? {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large);
            }
            body.extend_from_slice(&chunk);
        }
        let bytes = body.freeze();
        if bytes.is_empty() {
            return Err(MaterializationError::EmptyBody);
        }

        let key = object_key(job, content_type.as_deref());
        let content_type = content_type
            .filter(|ct| extension_for(ct).is_some())
            .unwrap_or_else(|| job.kind.default_content_type().to_string());
        let size = bytes.len();
        let url = self.storage.put(&key, bytes, &content_type).await?;

        debug!(key = %key, size, "asset materialized");
        Ok(url)
    }
}

fn download_error(e: reqwest::Error) -> MaterializationError {
    if e.is_timeout() {
        MaterializationError::Timeout
    } else {
        MaterializationError::Download(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStorage;
    use genforge_core::{JobId, UserId};
    use genforge_generation::{GenerationParams, MediaKind, ProviderId};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job(kind: MediaKind) -> GenerationJob {
        GenerationJob::new(
            JobId::new(),
            UserId::new(),
            ProviderId::Fal,
            kind,
            GenerationParams::with_prompt("p"),
            3,
        )
    }

    fn materializer(storage: Arc<InMemoryObjectStorage>) -> ResultMaterializer {
        ResultMaterializer::new(reqwest::Client::new(), storage, Duration::from_secs(5))
    }

    #[test]
    fn key_uses_content_type_or_kind_default() {
        let j = job(MediaKind::Video);
        assert!(object_key(&j, Some("image/jpeg; charset=binary")).ends_with(".jpg"));
        assert!(object_key(&j, Some("application/octet-stream")).ends_with(".mp4"));
        assert_eq!(
            object_key(&j, None),
            format!("generations/{}/{}.mp4", j.owner_id, j.id)
        );
    }

    #[tokio::test]
    async fn stores_downloaded_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/out.webp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/webp")
                    .set_body_bytes(b"RIFF....WEBP".to_vec()),
            )
            .mount(&server)
            .await;

        let storage = Arc::new(InMemoryObjectStorage::new());
        let j = job(MediaKind::Image);
        let url = materializer(storage.clone())
            .materialize(&j, &format!("{}/out.webp", server.uri()))
            .await
            .unwrap();

        let key = format!("generations/{}/{}.webp", j.owner_id, j.id);
        assert_eq!(url, format!("memory://{key}"));
        let stored = storage.get(&key).unwrap();
        assert_eq!(stored.content_type, "image/webp");
        assert_eq!(&stored.bytes[..], b"RIFF....WEBP");
    }

    #[tokio::test]
    async fn not_found_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let storage = Arc::new(InMemoryObjectStorage::new());
        let err = materializer(storage.clone())
            .materialize(&job(MediaKind::Image), &format!("{}/gone.png", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, MaterializationError::Status(404)));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn oversized_asset_is_rejected_before_storing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64]))
            .mount(&server)
            .await;
        let url = format!("{}/huge.png", server.uri());

        let storage = Arc::new(InMemoryObjectStorage::new());
        let err = materializer(storage.clone())
            .with_max_bytes(63)
            .materialize(&job(MediaKind::Image), &url)
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializationError::TooLarge { limit: 63 }));
        assert!(storage.is_empty());

        materializer(storage.clone())
            .with_max_bytes(64)
            .materialize(&job(MediaKind::Image), &url)
            .await
            .unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn empty_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = materializer(Arc::new(InMemoryObjectStorage::new()))
            .materialize(&job(MediaKind::Image), &format!("{}/empty.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializationError::EmptyBody));
    }
}
