//! Offsite upload backends
//!
//! Every backend implements [`Transport`]: it receives the archive files of
//! one run and places each of them under a date-stamped remote location.

pub mod drive;
pub mod dropbox;
mod http;
pub mod s3;
pub mod session;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::archive::ArchiveArtifact;
use crate::config::{BackendKind, Config};

pub use drive::DriveTransport;
pub use dropbox::{DropboxApi, DropboxTransport};
pub use s3::{AwsObjectStore, ObjectStore, S3Transport};
pub use session::{ChunkedUploader, CommitInfo, SessionError, UploadSession, UploadSessionApi};

/// UTC calendar date used as the remote folder name, rendered `D-M-YYYY`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateStamp(NaiveDate);

impl DateStamp {
    pub fn today() -> Self {
        Self(Utc::now().date_naive())
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }
}

impl fmt::Display for DateStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.0.day(), self.0.month(), self.0.year())
    }
}

/// One archive file placed on the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub local: PathBuf,
    pub remote: String,
    pub bytes: u64,
}

/// Everything a backend uploaded for one artifact
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub backend: &'static str,
    pub files: Vec<UploadedFile>,
}

impl UploadReport {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}

/// An upload backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upload every file of `artifact`, in order. The first failure aborts.
    async fn upload(&self, artifact: &ArchiveArtifact, date: &DateStamp) -> Result<UploadReport>;

    fn backend_name(&self) -> &'static str;
}

/// Build the configured backend, `None` when uploads are disabled
pub async fn build_transport(config: &Config) -> Result<Option<Box<dyn Transport>>> {
    let transport: Box<dyn Transport> = match config.upload.backend {
        BackendKind::Dropbox => Box::new(DropboxTransport::from_config(config)?),
        BackendKind::S3 => Box::new(S3Transport::from_config(&config.upload.s3).await?),
        BackendKind::Drive => Box::new(DriveTransport::from_config(&config.upload.drive)?),
        BackendKind::None => {
            info!("Upload backend is none, uploads disabled");
            return Ok(None);
        }
    };
    Ok(Some(transport))
}

/// Read a secret from the environment
pub(crate) fn required_env(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("{} is not set", key))
}

pub(crate) fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("Archive path has no UTF-8 file name: {}", path.display()))
}
