//! Chunked upload sessions
//!
//! A session is opened, fed chunks at strictly increasing, gapless offsets
//! and finished with a commit. [`UploadSession`] enforces the offset cursor
//! locally so a violated invariant never reaches the backend.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::ChunkStrategy;

/// Commit parameters for a finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub path: String,
    pub mode: String,
    pub autorename: bool,
    pub mute: bool,
}

impl CommitInfo {
    /// Commit in `add` mode, never muted
    pub fn add(path: impl Into<String>, autorename: bool) -> Self {
        Self {
            path: path.into(),
            mode: "add".to_string(),
            autorename,
            mute: false,
        }
    }
}

/// Backend calls behind a session
#[async_trait]
pub trait UploadSessionApi: Send + Sync {
    /// Open a session and return its id
    async fn start(&self) -> Result<String>;

    async fn append(&self, session_id: &str, offset: u64, data: &[u8]) -> Result<()>;

    async fn finish(&self, session_id: &str, offset: u64, commit: &CommitInfo) -> Result<()>;
}

/// Protocol violations caught before contacting the backend
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("upload session has not been started")]
    NotStarted,

    #[error("upload session was already started")]
    AlreadyStarted,

    #[error("offset {declared} declared but {accepted} bytes were accepted")]
    OffsetMismatch { declared: u64, accepted: u64 },

    #[error("upload session is already finished")]
    Finished,

    #[error("upload session failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Open { session_id: String, offset: u64 },
    Finished,
    Failed(String),
}

/// One upload session and its byte cursor
pub struct UploadSession<'a> {
    api: &'a dyn UploadSessionApi,
    state: SessionState,
}

impl<'a> UploadSession<'a> {
    pub fn new(api: &'a dyn UploadSessionApi) -> Self {
        Self {
            api,
            state: SessionState::NotStarted,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Bytes accepted so far
    pub fn offset(&self) -> u64 {
        match &self.state {
            SessionState::Open { offset, .. } => *offset,
            _ => 0,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        match &self.state {
            SessionState::NotStarted => {}
            SessionState::Failed(reason) => return Err(SessionError::Failed(reason.clone()).into()),
            SessionState::Finished => return Err(SessionError::Finished.into()),
            SessionState::Open { .. } => return Err(SessionError::AlreadyStarted.into()),
        }

        match self.api.start().await {
            Ok(session_id) => {
                debug!("Upload session {} opened", session_id);
                self.state = SessionState::Open {
                    session_id,
                    offset: 0,
                };
                Ok(())
            }
            Err(e) => Err(self.fail(e.context("Failed to start upload session"))),
        }
    }

    pub async fn append(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let session_id = self.checked_cursor(offset)?;

        match self.api.append(&session_id, offset, data).await {
            Ok(()) => {
                if let SessionState::Open { offset: cursor, .. } = &mut self.state {
                    *cursor += data.len() as u64;
                }
                Ok(())
            }
            Err(e) => Err(self.fail(
                e.context(format!("Failed to append {} bytes at offset {}", data.len(), offset)),
            )),
        }
    }

    pub async fn finish(&mut self, offset: u64, commit: &CommitInfo) -> Result<()> {
        let session_id = self.checked_cursor(offset)?;

        match self.api.finish(&session_id, offset, commit).await {
            Ok(()) => {
                self.state = SessionState::Finished;
                Ok(())
            }
            Err(e) => Err(self.fail(e.context(format!("Failed to finish upload to {}", commit.path)))),
        }
    }

    /// Session id when open and `declared` matches the cursor
    fn checked_cursor(&mut self, declared: u64) -> Result<String> {
        let (session_id, accepted) = match &self.state {
            SessionState::Open { session_id, offset } => (session_id.clone(), *offset),
            SessionState::NotStarted => return Err(SessionError::NotStarted.into()),
            SessionState::Finished => return Err(SessionError::Finished.into()),
            SessionState::Failed(reason) => return Err(SessionError::Failed(reason.clone()).into()),
        };

        if declared != accepted {
            let err = SessionError::OffsetMismatch { declared, accepted };
            self.state = SessionState::Failed(err.to_string());
            return Err(err.into());
        }
        Ok(session_id)
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        self.state = SessionState::Failed(format!("{:#}", err));
        err
    }
}

/// Uploads whole files through a session API, one chunk at a time
#[derive(Clone)]
pub struct ChunkedUploader {
    api: Arc<dyn UploadSessionApi>,
    chunk_size: u64,
    strategy: ChunkStrategy,
}

impl ChunkedUploader {
    pub fn new(api: Arc<dyn UploadSessionApi>, chunk_size: u64, strategy: ChunkStrategy) -> Self {
        Self {
            api,
            chunk_size: chunk_size.max(1),
            strategy,
        }
    }

    /// Upload `path` and commit it; returns the number of bytes sent
    pub async fn upload_file(&self, path: &Path, commit: &CommitInfo) -> Result<u64> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();

        info!(
            "Uploading {} ({} bytes) to {} in {} byte chunks",
            path.display(),
            size,
            commit.path,
            self.chunk_size
        );

        let mut session = UploadSession::new(self.api.as_ref());
        session.start().await?;

        let sent = match self.strategy {
            ChunkStrategy::Offset => self.append_by_offset(&mut session, path, size).await?,
            ChunkStrategy::Stream => self.append_from_stream(&mut session, path, size).await?,
        };

        session.finish(sent, commit).await?;
        info!("Committed {}", commit.path);
        Ok(sent)
    }

    /// `ceil(size / chunk)` full-buffer reads at offsets `i * chunk`
    async fn append_by_offset(
        &self,
        session: &mut UploadSession<'_>,
        path: &Path,
        size: u64,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let chunks = size.div_ceil(self.chunk_size);

        for index in 0..chunks {
            let offset = index * self.chunk_size;
            let len = self.chunk_size.min(size - offset);
            let mut buffer = vec![0u8; len as usize];

            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buffer)
                .await
                .with_context(|| format!("Failed to read {} at offset {}", path.display(), offset))?;

            debug!("Appending chunk {}/{} at offset {}", index + 1, chunks, offset);
            session.append(offset, &buffer).await?;
        }

        Ok(size)
    }

    /// Chunks coalesced from a read stream, each append awaited in turn
    async fn append_from_stream(
        &self,
        session: &mut UploadSession<'_>,
        path: &Path,
        size: u64,
    ) -> Result<u64> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut stream = ReaderStream::new(file);
        let chunk = self.chunk_size as usize;
        let mut pending: Vec<u8> = Vec::with_capacity(chunk.min(size as usize));

        while let Some(read) = stream.next().await {
            let read = read.with_context(|| format!("Failed to read {}", path.display()))?;
            pending.extend_from_slice(&read);

            while pending.len() >= chunk {
                let rest = pending.split_off(chunk);
                let offset = session.offset();
                session.append(offset, &pending).await?;
                pending = rest;
            }
        }

        if !pending.is_empty() {
            let offset = session.offset();
            session.append(offset, &pending).await?;
        }

        let sent = session.offset();
        if sent != size {
            bail!(
                "{} changed during upload: expected {} bytes, read {}",
                path.display(),
                size,
                sent
            );
        }
        Ok(sent)
    }
}
