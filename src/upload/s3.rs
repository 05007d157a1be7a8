use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::{info, warn};

use super::{file_name, DateStamp, Transport, UploadReport, UploadedFile};
use crate::archive::ArchiveArtifact;
use crate::config::S3Config;

/// Largest object a single PutObject accepts
const SINGLE_PUT_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

/// Object storage write path
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        storage_class: &str,
    ) -> Result<()>;
}

/// AWS SDK client, credentials from the default provider chain
pub struct AwsObjectStore {
    client: Client,
}

impl AwsObjectStore {
    pub async fn from_config(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
        })
    }
}

#[async_trait]
impl ObjectStore for AwsObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        storage_class: &str,
    ) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .storage_class(StorageClass::from(storage_class))
            .send()
            .await
            .map_err(|e| anyhow!("PutObject s3://{}/{} failed: {}", bucket, key, DisplayErrorContext(&e)))?;

        Ok(())
    }
}

/// One PutObject per archive file under `<prefix>/<D-M-YYYY>/<file name>`
pub struct S3Transport {
    store: Box<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    storage_class: String,
}

impl S3Transport {
    pub fn new(
        store: Box<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        storage_class: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            storage_class: storage_class.into(),
        }
    }

    pub async fn from_config(config: &S3Config) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .filter(|bucket| !bucket.is_empty())
            .context("upload.s3.bucket (or S3_BUCKET) is not set")?;
        let store = AwsObjectStore::from_config(config).await?;

        Ok(Self::new(
            Box::new(store),
            bucket,
            config.prefix.clone(),
            config.storage_class.clone(),
        ))
    }

    pub fn object_key(&self, date: &DateStamp, file_name: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", date, file_name)
        } else {
            format!("{}/{}/{}", prefix, date, file_name)
        }
    }
}

#[async_trait]
impl Transport for S3Transport {
    async fn upload(&self, artifact: &ArchiveArtifact, date: &DateStamp) -> Result<UploadReport> {
        let mut files = Vec::new();

        for local in artifact.files() {
            let key = self.object_key(date, file_name(local)?);
            let bytes = tokio::fs::metadata(local)
                .await
                .with_context(|| format!("Failed to stat {}", local.display()))?
                .len();
            if bytes > SINGLE_PUT_LIMIT {
                warn!(
                    "{} is {} bytes, above the 5GiB single PutObject limit; set archive.split_size",
                    local.display(),
                    bytes
                );
            }

            info!(
                "Uploading {} to s3://{}/{} ({})",
                local.display(),
                self.bucket,
                key,
                self.storage_class
            );
            self.store
                .put_object(&self.bucket, &key, local, &self.storage_class)
                .await?;

            files.push(UploadedFile {
                local: local.clone(),
                remote: format!("s3://{}/{}", self.bucket, key),
                bytes,
            });
        }

        Ok(UploadReport {
            backend: self.backend_name(),
            files,
        })
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;
    use mockall::Sequence;
    use tempfile::TempDir;

    fn parts(temp: &TempDir, names: &[&str]) -> ArchiveArtifact {
        for name in names {
            std::fs::write(temp.path().join(name), b"part").unwrap();
        }
        ArchiveArtifact::discover(temp.path(), "repos.tar.gz").unwrap()
    }

    #[test]
    fn test_object_key_prefix() {
        let date = DateStamp::from_ymd(2024, 3, 7).unwrap();
        let with_prefix = S3Transport::new(
            Box::new(MockObjectStore::new()),
            "bucket",
            "Backup",
            "DEEP_ARCHIVE",
        );
        let without_prefix =
            S3Transport::new(Box::new(MockObjectStore::new()), "bucket", "", "DEEP_ARCHIVE");

        assert_eq!(
            with_prefix.object_key(&date, "repos.tar.gz.aa"),
            "Backup/7-3-2024/repos.tar.gz.aa"
        );
        assert_eq!(
            without_prefix.object_key(&date, "repos.tar.gz.aa"),
            "7-3-2024/repos.tar.gz.aa"
        );
    }

    #[tokio::test]
    async fn test_one_put_per_part() {
        let temp = TempDir::new().unwrap();
        let artifact = parts(&temp, &["repos.tar.gz.aa", "repos.tar.gz.ab", "repos.tar.gz.ac"]);

        let mut store = MockObjectStore::new();
        let mut seq = Sequence::new();
        for suffix in ["aa", "ab", "ac"] {
            let key = format!("Backup/7-3-2024/repos.tar.gz.{}", suffix);
            store
                .expect_put_object()
                .withf(move |bucket, k, path, class| {
                    bucket == "cold"
                        && k == key
                        && path.ends_with(format!("repos.tar.gz.{}", suffix))
                        && class == "DEEP_ARCHIVE"
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _, _| Ok(()));
        }

        let transport = S3Transport::new(Box::new(store), "cold", "Backup", "DEEP_ARCHIVE");
        let report = transport
            .upload(&artifact, &DateStamp::from_ymd(2024, 3, 7).unwrap())
            .await
            .unwrap();

        assert_eq!(report.files.len(), 3);
        assert_eq!(report.files[0].remote, "s3://cold/Backup/7-3-2024/repos.tar.gz.aa");
        assert_eq!(report.total_bytes(), 12);
    }

    #[tokio::test]
    async fn test_failed_put_stops_upload() {
        let temp = TempDir::new().unwrap();
        let artifact = parts(&temp, &["repos.tar.gz.aa", "repos.tar.gz.ab"]);

        let mut store = MockObjectStore::new();
        store
            .expect_put_object()
            .with(always(), eq("Backup/7-3-2024/repos.tar.gz.aa"), always(), always())
            .times(1)
            .returning(|_, _, _, _| Err(anyhow!("AccessDenied")));

        let transport = S3Transport::new(Box::new(store), "cold", "Backup", "DEEP_ARCHIVE");
        let err = transport
            .upload(&artifact, &DateStamp::from_ymd(2024, 3, 7).unwrap())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("AccessDenied"));
    }
}
