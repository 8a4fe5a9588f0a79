//! Crawl artifacts and their collection into object storage.
//!
//! Artifacts are serialized one JSON object per line into an in-memory
//! buffer; once the buffer passes a byte threshold it is PUT as a single
//! object. A failed PUT keeps the buffer for the next flush.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;

/// Flush the buffer once it holds this many bytes.
const MAX_BUFFERED_BYTES: usize = 100_000;

/// The minimal record kept per crawled page.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Artifact {
    pub host: String,
    pub url: String,
    pub status: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    pub server: String,
    pub elapsed: f64,
}

/// Consumer of crawl artifacts.
#[async_trait]
pub trait ArtifactGatherer: Send {
    async fn collect(&mut self, artifact: Artifact) -> anyhow::Result<()>;

    /// Flush whatever is still buffered.
    async fn finish(&mut self) -> anyhow::Result<()>;
}

/// Blob PUT contract the gatherer needs from object storage.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()>;
}

pub struct BlobArtifactGatherer {
    storage: Box<dyn BlobStorage>,
    key_prefix: String,
    buffer: Vec<u8>,
    max_buffered: usize,
}

impl BlobArtifactGatherer {
    pub fn new(storage: Box<dyn BlobStorage>, key_prefix: String) -> Self {
        Self {
            storage,
            key_prefix,
            buffer: Vec::new(),
            max_buffered: MAX_BUFFERED_BYTES,
        }
    }

    fn build_new_key(&self) -> String {
        format!(
            "{}/{}/{}.log",
            self.key_prefix,
            Utc::now().format("%Y-%m-%d-%H-%M"),
            Uuid::new_v4()
        )
    }

    /// PUT the buffer. On failure the buffer is retained so the artifacts
    /// ride along with the next flush.
    async fn upload(&mut self) -> anyhow::Result<()> {
        let key = self.build_new_key();
        match self.storage.put(&key, &self.buffer).await {
            Ok(()) => {
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                warn!("failed to upload artifacts, keeping buffer: {:#}", e);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ArtifactGatherer for BlobArtifactGatherer {
    async fn collect(&mut self, artifact: Artifact) -> anyhow::Result<()> {
        let line = match serde_json::to_vec(&artifact) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to marshal artifact: {}", e);
                return Ok(());
            }
        };

        self.buffer.extend_from_slice(&line);
        self.buffer.push(b'\n');

        if self.buffer.len() < self.max_buffered {
            return Ok(());
        }

        self.upload().await
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.upload().await
    }
}

/// S3 (or S3-compatible) object storage.
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(config: &Config) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            config.aws.access_key_id.clone(),
            config.aws.secret_access_key.clone(),
            None,
            None,
            "configuration-file",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.aws.region.clone()))
            .credentials_provider(credentials);

        // Path-style addressing keeps MinIO-like endpoints working.
        if let Some(endpoint) = &config.aws.s3_endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: config.artifact.bucket.clone(),
        }
    }
}

#[async_trait]
impl BlobStorage for S3Storage {
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .acl(aws_sdk_s3::types::ObjectCannedAcl::Private)
            .body(aws_sdk_s3::primitives::ByteStream::from(data.to_vec()))
            .send()
            .await
            .context("failed to put artifact object")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct MemoryStorage {
        objects: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        fail_next: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl BlobStorage for MemoryStorage {
        async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                anyhow::bail!("storage unavailable");
            }
            self.objects.lock().push((key.to_string(), data.to_vec()));
            Ok(())
        }
    }

    fn artifact(url: &str) -> Artifact {
        Artifact {
            host: "example.com".to_string(),
            url: url.to_string(),
            status: 200,
            title: "t".to_string(),
            server: "nginx".to_string(),
            elapsed: 0.25,
        }
    }

    #[tokio::test]
    async fn buffers_until_threshold() {
        let storage = MemoryStorage::default();
        let mut gatherer =
            BlobArtifactGatherer::new(Box::new(storage.clone()), "prefix".to_string());
        gatherer.max_buffered = 200;

        gatherer.collect(artifact("http://example.com/1")).await.unwrap();
        assert!(storage.objects.lock().is_empty());

        gatherer.collect(artifact("http://example.com/2")).await.unwrap();
        gatherer.collect(artifact("http://example.com/3")).await.unwrap();

        let objects = storage.objects.lock();
        assert_eq!(objects.len(), 1);

        let body = String::from_utf8(objects[0].1.clone()).unwrap();
        assert_eq!(body.lines().count(), 3);
        assert!(body.lines().all(|l| l.starts_with('{') && l.ends_with('}')));
    }

    #[tokio::test]
    async fn finish_flushes_remainder() {
        let storage = MemoryStorage::default();
        let mut gatherer =
            BlobArtifactGatherer::new(Box::new(storage.clone()), "prefix".to_string());

        gatherer.collect(artifact("http://example.com/1")).await.unwrap();
        gatherer.finish().await.unwrap();

        let objects = storage.objects.lock();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].0.starts_with("prefix/"));
        assert!(objects[0].0.ends_with(".log"));
    }

    #[tokio::test]
    async fn finish_with_empty_buffer_is_a_no_op() {
        let storage = MemoryStorage::default();
        let mut gatherer =
            BlobArtifactGatherer::new(Box::new(storage.clone()), "prefix".to_string());
        gatherer.finish().await.unwrap();
        assert!(storage.objects.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_put_retains_buffer() {
        let storage = MemoryStorage::default();
        let mut gatherer =
            BlobArtifactGatherer::new(Box::new(storage.clone()), "prefix".to_string());
        gatherer.max_buffered = 1;

        *storage.fail_next.lock() = true;
        gatherer.collect(artifact("http://example.com/1")).await.unwrap();
        assert!(storage.objects.lock().is_empty());
        assert!(!gatherer.buffer.is_empty());

        gatherer.collect(artifact("http://example.com/2")).await.unwrap();
        let objects = storage.objects.lock();
        assert_eq!(objects.len(), 1);
        let body = String::from_utf8(objects[0].1.clone()).unwrap();
        assert_eq!(body.lines().count(), 2);
    }

    #[test]
    fn empty_title_is_omitted_from_json() {
        let mut a = artifact("http://example.com/");
        a.title = String::new();
        let json = serde_json::to_string(&a).unwrap();
        assert!(!json.contains("title"));
        assert!(json.contains("\"status\":200"));
    }
}
