use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::http::send_with_retry;
use super::session::{ChunkedUploader, CommitInfo, UploadSessionApi};
use super::{file_name, required_env, DateStamp, Transport, UploadReport, UploadedFile};
use crate::archive::ArchiveArtifact;
use crate::config::Config;

const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";

#[derive(Serialize)]
struct Cursor<'a> {
    session_id: &'a str,
    offset: u64,
}

#[derive(Serialize)]
struct StartArg {
    close: bool,
}

#[derive(Serialize)]
struct AppendArg<'a> {
    cursor: Cursor<'a>,
    close: bool,
}

#[derive(Serialize)]
struct FinishArg<'a> {
    cursor: Cursor<'a>,
    commit: &'a CommitInfo,
}

#[derive(Deserialize)]
struct StartResult {
    session_id: String,
}

/// `Dropbox-API-Arg` value: JSON with every non-ASCII character escaped
fn api_arg<T: Serialize>(arg: &T) -> Result<String> {
    let json = serde_json::to_string(arg).context("Failed to encode Dropbox-API-Arg")?;
    let mut escaped = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(escaped)
}

/// Dropbox upload session endpoints
pub struct DropboxApi {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl DropboxApi {
    pub fn new(token: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_CONTENT_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    async fn call(&self, endpoint: &str, arg: String, body: &[u8]) -> Result<reqwest::Response> {
        let url = format!("{}/2/files/{}", self.base_url, endpoint);
        send_with_retry(endpoint, || {
            Ok(self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .header("Dropbox-API-Arg", arg.as_str())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body.to_vec()))
        })
        .await
    }
}

#[async_trait]
impl UploadSessionApi for DropboxApi {
    async fn start(&self) -> Result<String> {
        let arg = api_arg(&StartArg { close: false })?;
        let response = self.call("upload_session/start", arg, &[]).await?;
        let result: StartResult = response
            .json()
            .await
            .context("Invalid upload_session/start response")?;
        Ok(result.session_id)
    }

    async fn append(&self, session_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        let arg = api_arg(&AppendArg {
            cursor: Cursor { session_id, offset },
            close: false,
        })?;
        self.call("upload_session/append_v2", arg, data).await?;
        Ok(())
    }

    async fn finish(&self, session_id: &str, offset: u64, commit: &CommitInfo) -> Result<()> {
        let arg = api_arg(&FinishArg {
            cursor: Cursor { session_id, offset },
            commit,
        })?;
        self.call("upload_session/finish", arg, &[]).await?;
        Ok(())
    }
}

/// Session uploads into `<root>/<D-M-YYYY>/<file name>`
pub struct DropboxTransport {
    uploader: ChunkedUploader,
    root: String,
    autorename: bool,
}

impl DropboxTransport {
    pub fn new(uploader: ChunkedUploader, root: impl Into<String>, autorename: bool) -> Self {
        Self {
            uploader,
            root: root.into(),
            autorename,
        }
    }

    /// Dropbox API client authenticated by `DROPBOX_ACCESS_TOKEN`
    pub fn from_config(config: &Config) -> Result<Self> {
        let dropbox = &config.upload.dropbox;
        let token = required_env("DROPBOX_ACCESS_TOKEN")?;
        let api = DropboxApi::new(token, dropbox.api_url.as_deref());
        let uploader =
            ChunkedUploader::new(Arc::new(api), config.chunk_size_bytes()?, dropbox.strategy);
        Ok(Self::new(uploader, dropbox.root.clone(), dropbox.autorename))
    }

    pub fn commit_path(&self, date: &DateStamp, file_name: &str) -> String {
        format!("{}/{}/{}", self.root.trim_end_matches('/'), date, file_name)
    }
}

#[async_trait]
impl Transport for DropboxTransport {
    async fn upload(&self, artifact: &ArchiveArtifact, date: &DateStamp) -> Result<UploadReport> {
        let mut files = Vec::new();

        for local in artifact.files() {
            let remote = self.commit_path(date, file_name(local)?);
            let commit = CommitInfo::add(remote.clone(), self.autorename);
            let bytes = self
                .uploader
                .upload_file(local, &commit)
                .await
                .with_context(|| format!("Dropbox upload of {} failed", local.display()))?;

            files.push(UploadedFile {
                local: local.clone(),
                remote,
                bytes,
            });
        }

        info!("Uploaded {} file(s) to Dropbox", files.len());
        Ok(UploadReport {
            backend: self.backend_name(),
            files,
        })
    }

    fn backend_name(&self) -> &'static str {
        "dropbox"
    }
}
