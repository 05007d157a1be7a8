//! Backup pipeline - enumerate, fetch, archive, upload
//!
//! Stages run strictly one after another. Enumeration, archive and upload
//! failures abort the run; fetch failures are per repository and only show
//! up in the [`FetchSummary`].

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveArtifact, Archiver};
use crate::config::{Config, FetchMode};
use crate::discovery::{discover_all, Discovery, OwnerScope, RepositoryRef};
use crate::git::{FetchResult, GitClient};
use crate::github::GitHubClient;
use crate::upload::{build_transport, DateStamp, Transport, UploadReport};

/// Results from the fetch stage
#[derive(Debug, Clone)]
pub struct FetchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
    /// One entry per repository, in enumeration order
    pub results: Vec<FetchResult>,
}

impl FetchSummary {
    fn new(results: Vec<FetchResult>, duration: Duration) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            duration,
            results,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &FetchResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Outcome of a full run
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub date: DateStamp,
    pub fetch: FetchSummary,
    pub artifact: ArchiveArtifact,
    /// `None` when uploading was skipped
    pub upload: Option<UploadReport>,
    pub duration: Duration,
}

/// Runs the backup stages against injected collaborators
pub struct BackupPipeline {
    discovery: Box<dyn Discovery>,
    scopes: Vec<OwnerScope>,
    git: GitClient,
    archiver: Archiver,
    transport: Option<Box<dyn Transport>>,
    max_parallel: usize,
}

impl BackupPipeline {
    pub fn new(
        config: &Config,
        discovery: Box<dyn Discovery>,
        scopes: Vec<OwnerScope>,
        git: GitClient,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<Self> {
        Ok(Self {
            discovery,
            scopes,
            git,
            archiver: Archiver::new(config)?,
            transport,
            max_parallel: config.fetch.max_parallel.max(1),
        })
    }

    /// Wire up GitHub, git and the configured upload backend
    pub async fn from_config(config: &Config, with_upload: bool) -> Result<Self> {
        let github = GitHubClient::new(config)
            .await
            .context("Failed to initialize GitHub client")?;
        let scopes = config.owner_scopes(github.username());
        let git = GitClient::new(config, Some(github.git_credentials()));

        let transport = if with_upload {
            build_transport(config)
                .await
                .context("Failed to initialize upload backend")?
        } else {
            None
        };

        Self::new(config, Box::new(github), scopes, git, transport)
    }

    /// Enumerate every configured owner scope
    pub async fn discover(&self) -> Result<Vec<RepositoryRef>> {
        debug!("Enumerating {} owner scope(s)", self.scopes.len());
        discover_all(self.discovery.as_ref(), &self.scopes).await
    }

    /// Fetch every repository, at most `fetch.max_parallel` at a time.
    /// All fetches have completed when this returns.
    pub async fn fetch(&self, repositories: Vec<RepositoryRef>) -> FetchSummary {
        let start_time = Instant::now();
        info!(
            "Fetching {} repositories ({} mode, {} at a time)",
            repositories.len(),
            match self.git.mode() {
                FetchMode::Mirror => "mirror",
                FetchMode::WorkingCopy => "working copy",
            },
            self.max_parallel
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut futures = FuturesUnordered::new();

        for (index, repo) in repositories.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let git = self.git.clone();

            futures.push(async move {
                // never closed
                let _permit = semaphore.acquire().await.ok();
                (index, git.fetch_repository(&repo).await)
            });
        }

        let mut results = Vec::with_capacity(futures.len());
        while let Some((index, result)) = futures.next().await {
            debug!("Fetch completed: {:?}", result);
            results.push((index, result));
        }
        results.sort_by_key(|(index, _)| *index);

        let summary = FetchSummary::new(
            results.into_iter().map(|(_, result)| result).collect(),
            start_time.elapsed(),
        );
        info!(
            "Fetch completed in {:.2}s: {} succeeded, {} failed",
            summary.duration.as_secs_f64(),
            summary.succeeded,
            summary.failed
        );
        summary
    }

    pub async fn archive(&self) -> Result<ArchiveArtifact> {
        self.archiver.create().await.context("Failed to create archive")
    }

    /// Upload the artifact; `None` when no backend is configured
    pub async fn upload(
        &self,
        artifact: &ArchiveArtifact,
        date: &DateStamp,
    ) -> Result<Option<UploadReport>> {
        let Some(transport) = &self.transport else {
            info!("Skipping upload");
            return Ok(None);
        };

        info!(
            "Uploading {} file(s) via {}",
            artifact.files().len(),
            transport.backend_name()
        );
        let report = transport
            .upload(artifact, date)
            .await
            .context("Upload failed")?;
        Ok(Some(report))
    }

    /// Run every stage in order
    pub async fn run(&self, date: &DateStamp) -> Result<BackupReport> {
        let start_time = Instant::now();
        info!("Starting backup for {}", date);

        let repositories = self
            .discover()
            .await
            .context("Failed to discover repositories")?;
        info!("Discovered {} repositories", repositories.len());

        let fetch = self.fetch(repositories).await;
        if fetch.failed > 0 {
            warn!("{} repositories failed to fetch", fetch.failed);
        }

        let artifact = self.archive().await?;
        let upload = self.upload(&artifact, date).await?;

        let report = BackupReport {
            date: *date,
            fetch,
            artifact,
            upload,
            duration: start_time.elapsed(),
        };
        info!("Backup completed in {:.2}s", report.duration.as_secs_f64());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use anyhow::bail;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedDiscovery(Vec<RepositoryRef>);

    #[async_trait]
    impl Discovery for FixedDiscovery {
        async fn discover(&self, _scope: &OwnerScope) -> Result<Vec<RepositoryRef>> {
            Ok(self.0.clone())
        }

        fn provider_name(&self) -> &'static str {
            "fixed"
        }
    }

    struct FailingDiscovery;

    #[async_trait]
    impl Discovery for FailingDiscovery {
        async fn discover(&self, _scope: &OwnerScope) -> Result<Vec<RepositoryRef>> {
            bail!("Bad credentials")
        }

        fn provider_name(&self) -> &'static str {
            "failing"
        }
    }

    fn config_in(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.base_directory = temp.path().join("repos").to_string_lossy().into_owned();
        config.archive.output_dir = temp.path().join("out").to_string_lossy().into_owned();
        config.archive.compressor = "gzip".to_string();
        config.upload.backend = BackendKind::None;
        config
    }

    fn pipeline(config: &Config, discovery: Box<dyn Discovery>) -> BackupPipeline {
        BackupPipeline::new(
            config,
            discovery,
            vec![OwnerScope::User("alice".into())],
            GitClient::new(config, None),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_discovery_failure_aborts_before_fetch() {
        let temp = TempDir::new().unwrap();
        let config = config_in(&temp);
        let pipeline = pipeline(&config, Box::new(FailingDiscovery));

        let err = pipeline
            .run(&DateStamp::from_ymd(2024, 3, 7).unwrap())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Bad credentials"));
        assert!(!temp.path().join("repos").exists());
        assert!(!temp.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_fetch_failures_do_not_abort_and_keep_order() {
        let temp = TempDir::new().unwrap();
        let mut config = config_in(&temp);
        config.fetch.max_parallel = 3;
        std::fs::create_dir_all(temp.path().join("repos")).unwrap();

        let missing = |name: &str| {
            RepositoryRef::new(format!(
                "file://{}/remotes/ghost/{}",
                temp.path().display(),
                name
            ))
        };
        let repos = vec![missing("one"), missing("two"), missing("three")];
        let pipeline = pipeline(&config, Box::new(FixedDiscovery(repos.clone())));

        let summary = pipeline.fetch(repos.clone()).await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.failures().count(), 3);
        let order: Vec<_> = summary.results.iter().map(|r| r.repo().to_string()).collect();
        assert_eq!(order, repos.iter().map(|r| r.url.clone()).collect::<Vec<_>>());

        // the run still archives
        let report = pipeline
            .run(&DateStamp::from_ymd(2024, 3, 7).unwrap())
            .await
            .unwrap();
        assert_eq!(report.fetch.failed, 3);
        assert!(report.upload.is_none());
        assert_eq!(report.artifact.files().len(), 1);
    }

    #[tokio::test]
    async fn test_archive_failure_is_fatal() {
        let temp = TempDir::new().unwrap();
        let mut config = config_in(&temp);
        config.archive.compressor = "false".to_string();
        std::fs::create_dir_all(temp.path().join("repos")).unwrap();

        let pipeline = pipeline(&config, Box::new(FixedDiscovery(Vec::new())));
        let err = pipeline
            .run(&DateStamp::from_ymd(2024, 3, 7).unwrap())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to create archive"));
    }
}
