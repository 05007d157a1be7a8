use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncSeekExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::http::{is_retryable, retry_after, send_with_retry};
use super::{file_name, required_env, DateStamp, Transport, UploadReport, UploadedFile};
use crate::archive::ArchiveArtifact;
use crate::config::DriveConfig;

const DEFAULT_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const MAX_PUT_ATTEMPTS: u32 = 3;

#[derive(Serialize)]
struct FileMetadata<'a> {
    name: &'a str,
    parents: [&'a str; 1],
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

/// What Drive holds for a resumable session
#[derive(Debug, PartialEq, Eq)]
enum SessionState {
    /// Bytes committed so far
    Incomplete(u64),
    /// The file was created
    Complete(String),
}

/// Google Drive uploads: one resumable session per file, resumed from the
/// committed offset when a PUT is cut short
pub struct DriveTransport {
    http: reqwest::Client,
    token: String,
    folder_id: String,
    upload_url: String,
}

impl DriveTransport {
    pub fn new(
        token: impl Into<String>,
        folder_id: impl Into<String>,
        upload_url: Option<&str>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            folder_id: folder_id.into(),
            upload_url: upload_url.unwrap_or(DEFAULT_UPLOAD_URL).to_string(),
        }
    }

    /// Access token from `GOOGLE_DRIVE_ACCESS_TOKEN`
    pub fn from_config(config: &DriveConfig) -> Result<Self> {
        let folder_id = config
            .folder_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .context("upload.drive.folder_id (or DRIVE_FOLDER_ID) is not set")?;
        let token = required_env("GOOGLE_DRIVE_ACCESS_TOKEN")?;
        Ok(Self::new(token, folder_id, config.api_url.as_deref()))
    }

    /// Open a resumable upload and return its session URI
    async fn initiate(&self, name: &str, size: u64) -> Result<String> {
        let metadata = FileMetadata {
            name,
            parents: [self.folder_id.as_str()],
        };
        let url = format!("{}?uploadType=resumable", self.upload_url);

        let response = send_with_retry("drive resumable initiation", || {
            Ok(self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .header("X-Upload-Content-Type", "application/octet-stream")
                .header("X-Upload-Content-Length", size)
                .json(&metadata))
        })
        .await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .context("Drive did not return a resumable session URI")?;
        Ok(location.to_string())
    }

    /// Send the file body. After an interrupted or throttled PUT the session
    /// is asked how much it committed and the rest is sent from there.
    async fn put_file(&self, session_uri: &str, local: &Path, size: u64) -> Result<String> {
        let mut offset = 0;

        for attempt in 1..=MAX_PUT_ATTEMPTS {
            let request = self.put_request(session_uri, local, offset, size).await?;
            let delay = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return created_file_id(response).await;
                }
                Ok(response)
                    if is_retryable(response.status())
                        || response.status() == StatusCode::PERMANENT_REDIRECT =>
                {
                    warn!(
                        "Drive upload returned {} after byte {} (attempt {}/{})",
                        response.status(),
                        offset,
                        attempt,
                        MAX_PUT_ATTEMPTS
                    );
                    retry_after(response.headers()).unwrap_or(Duration::from_secs(1))
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    bail!("drive upload returned {}: {}", status, body.trim());
                }
                Err(e) => {
                    warn!(
                        "Drive upload interrupted after byte {}: {} (attempt {}/{})",
                        offset, e, attempt, MAX_PUT_ATTEMPTS
                    );
                    Duration::from_secs(1)
                }
            };

            if attempt == MAX_PUT_ATTEMPTS {
                break;
            }
            tokio::time::sleep(delay).await;

            match self.session_state(session_uri, size).await? {
                SessionState::Complete(id) => return Ok(id),
                SessionState::Incomplete(committed) if committed >= size && size > 0 => {
                    bail!("Drive committed all {} bytes but did not create the file", size);
                }
                SessionState::Incomplete(committed) => {
                    debug!("Drive committed {} of {} bytes, resuming", committed, size);
                    offset = committed;
                }
            }
        }
        bail!("drive upload failed after {} attempts", MAX_PUT_ATTEMPTS)
    }

    /// PUT of bytes `offset..size`, streamed from disk
    async fn put_request(
        &self,
        session_uri: &str,
        local: &Path,
        offset: u64,
        size: u64,
    ) -> Result<RequestBuilder> {
        let mut file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("Failed to open {}", local.display()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("Failed to seek {} to {}", local.display(), offset))?;

        let mut request = self
            .http
            .put(session_uri)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size - offset)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if offset > 0 {
            request = request.header(
                CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, size - 1, size),
            );
        }
        Ok(request)
    }

    /// Empty PUT with `Content-Range: bytes */<size>`
    async fn session_state(&self, session_uri: &str, size: u64) -> Result<SessionState> {
        let response = self
            .http
            .put(session_uri)
            .header(CONTENT_RANGE, format!("bytes */{}", size))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .context("drive upload status request failed")?;

        match response.status() {
            status if status.is_success() => {
                Ok(SessionState::Complete(created_file_id(response).await?))
            }
            StatusCode::PERMANENT_REDIRECT => {
                Ok(SessionState::Incomplete(committed_bytes(response.headers())))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("drive upload status returned {}: {}", status, body.trim());
            }
        }
    }
}

/// `Range: bytes=0-<last>` of an incomplete session; no header means nothing
/// was committed
fn committed_bytes(headers: &HeaderMap) -> u64 {
    headers
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("bytes=0-"))
        .and_then(|last| last.parse::<u64>().ok())
        .map_or(0, |last| last + 1)
}

async fn created_file_id(response: Response) -> Result<String> {
    let created: CreatedFile = response
        .json()
        .await
        .context("Invalid Drive upload response")?;
    Ok(created.id)
}

#[async_trait]
impl Transport for DriveTransport {
    async fn upload(&self, artifact: &ArchiveArtifact, _date: &DateStamp) -> Result<UploadReport> {
        let mut files = Vec::new();

        for local in artifact.files() {
            let name = file_name(local)?;
            let size = tokio::fs::metadata(local)
                .await
                .with_context(|| format!("Failed to stat {}", local.display()))?
                .len();

            info!("Uploading {} ({} bytes) to Drive folder {}", name, size, self.folder_id);
            let session_uri = self
                .initiate(name, size)
                .await
                .with_context(|| format!("Drive upload of {} failed", local.display()))?;
            let file_id = self
                .put_file(&session_uri, local, size)
                .await
                .with_context(|| format!("Drive upload of {} failed", local.display()))?;
            info!("Created Drive file {} ({})", name, file_id);

            files.push(UploadedFile {
                local: local.clone(),
                remote: format!("{}/{}", self.folder_id, name),
                bytes: size,
            });
        }

        Ok(UploadReport {
            backend: self.backend_name(),
            files,
        })
    }

    fn backend_name(&self) -> &'static str {
        "drive"
    }
}
