use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FetchConfig, FetchMode, MirrorExisting};
use crate::discovery::RepositoryRef;

/// Username and access token handed to git out of band.
///
/// The token never becomes part of a URL or argument list; it is passed to
/// the git process as an `http.<origin>/.extraHeader` setting through the
/// `GIT_CONFIG_*` environment, scoped to the repository's host.
#[derive(Clone)]
pub struct GitCredentials {
    username: String,
    token: String,
}

impl GitCredentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn authorization_header(&self) -> String {
        let pair = format!("{}:{}", self.username, self.token);
        format!("Authorization: Basic {}", STANDARD.encode(pair))
    }

    /// Config key the header is scoped to, `None` for host-less URLs
    fn config_key(repo: &RepositoryRef) -> Option<String> {
        let host = repo.host();
        if host.is_empty() {
            return None;
        }
        Some(format!("http.{}://{}/.extraHeader", repo.scheme(), host))
    }

    fn apply(&self, command: &mut AsyncCommand, repo: &RepositoryRef) {
        if let Some(key) = Self::config_key(repo) {
            command
                .env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", key)
                .env("GIT_CONFIG_VALUE_0", self.authorization_header());
        }
    }
}

impl fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCredentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// What the fetcher will do for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAction {
    /// `git clone --mirror` into the owner directory
    MirrorClone,
    /// Directory is missing: create it and clone
    CloneFresh,
    /// Directory exists without git metadata: clone into it
    CloneIntoExisting,
    /// Existing working copy: pull
    Pull,
}

/// Result of fetching one repository
#[derive(Debug, Clone)]
pub enum FetchResult {
    /// Mirror clone created
    Mirrored { repo: String, path: PathBuf },
    /// Working copy cloned
    Cloned { repo: String, path: PathBuf },
    /// Working copy updated
    Pulled { repo: String, path: PathBuf },
    /// git failed; the run continues with the next repository
    Failed {
        repo: String,
        path: PathBuf,
        error: String,
    },
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, FetchResult::Failed { .. })
    }

    pub fn repo(&self) -> &str {
        match self {
            FetchResult::Mirrored { repo, .. }
            | FetchResult::Cloned { repo, .. }
            | FetchResult::Pulled { repo, .. }
            | FetchResult::Failed { repo, .. } => repo,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            FetchResult::Mirrored { path, .. }
            | FetchResult::Cloned { path, .. }
            | FetchResult::Pulled { path, .. }
            | FetchResult::Failed { path, .. } => path,
        }
    }
}

/// Git operations handler for mirror and working-copy fetches
#[derive(Clone)]
pub struct GitClient {
    base_dir: PathBuf,
    fetch: FetchConfig,
    credentials: Option<GitCredentials>,
}

impl GitClient {
    /// Create a new Git client with the given configuration
    pub fn new(config: &Config, credentials: Option<GitCredentials>) -> Self {
        Self {
            base_dir: config.base_path(),
            fetch: config.fetch.clone(),
            credentials,
        }
    }

    pub fn mode(&self) -> FetchMode {
        self.fetch.mode
    }

    /// Local directory git runs in for a repository.
    ///
    /// Mirror mode keys by owner only (git creates `<name>.git` inside it);
    /// working-copy mode keys by owner and repository name.
    pub fn local_path(&self, repo: &RepositoryRef) -> Result<PathBuf> {
        let owner_dir = self.base_dir.join(repo.owner()?);
        match self.fetch.mode {
            FetchMode::Mirror => Ok(owner_dir),
            FetchMode::WorkingCopy => Ok(owner_dir.join(repo.name()?)),
        }
    }

    /// Decide the action for a repository from the state of its local path
    pub fn plan(mode: FetchMode, path: &Path) -> FetchAction {
        match mode {
            FetchMode::Mirror => FetchAction::MirrorClone,
            FetchMode::WorkingCopy if !path.exists() => FetchAction::CloneFresh,
            FetchMode::WorkingCopy if !path.join(".git").exists() => FetchAction::CloneIntoExisting,
            FetchMode::WorkingCopy => FetchAction::Pull,
        }
    }

    /// Fetch a single repository. Failures are logged and returned as
    /// [`FetchResult::Failed`] rather than propagated.
    pub async fn fetch_repository(&self, repo: &RepositoryRef) -> FetchResult {
        let path = match self.local_path(repo) {
            Ok(path) => path,
            Err(e) => {
                error!("Skipping {}: {}", repo, e);
                return FetchResult::Failed {
                    repo: repo.url.clone(),
                    path: self.base_dir.clone(),
                    error: e.to_string(),
                };
            }
        };

        let action = Self::plan(self.fetch.mode, &path);
        debug!("{} -> {:?} at {}", repo.full_name(), action, path.display());

        match self.execute(repo, action, &path).await {
            Ok(result) => result,
            Err(e) => {
                error!("Fetch failed for {}: {:#}", repo.full_name(), e);
                FetchResult::Failed {
                    repo: repo.url.clone(),
                    path,
                    error: format!("{:#}", e),
                }
            }
        }
    }

    async fn execute(
        &self,
        repo: &RepositoryRef,
        action: FetchAction,
        path: &Path,
    ) -> Result<FetchResult> {
        let url = repo.url.as_str();

        match action {
            FetchAction::MirrorClone => {
                tokio::fs::create_dir_all(path)
                    .await
                    .with_context(|| format!("Failed to create {}", path.display()))?;

                let mirror_dir = path.join(format!("{}.git", repo.name()?));
                if self.fetch.mirror_existing == MirrorExisting::Replace && mirror_dir.exists() {
                    info!("Removing previous mirror {}", mirror_dir.display());
                    tokio::fs::remove_dir_all(&mirror_dir)
                        .await
                        .with_context(|| format!("Failed to remove {}", mirror_dir.display()))?;
                }

                info!("Mirroring {} -> {}", repo.full_name(), path.display());
                self.run_git(repo, &["clone", "--mirror", url], path).await?;
                Ok(FetchResult::Mirrored {
                    repo: repo.url.clone(),
                    path: mirror_dir,
                })
            }
            FetchAction::CloneFresh => {
                tokio::fs::create_dir_all(path)
                    .await
                    .with_context(|| format!("Failed to create {}", path.display()))?;

                info!("Cloning {} -> {}", repo.full_name(), path.display());
                self.run_git(repo, &["clone", url, "."], path).await?;
                Ok(FetchResult::Cloned {
                    repo: repo.url.clone(),
                    path: path.to_path_buf(),
                })
            }
            FetchAction::CloneIntoExisting => {
                info!(
                    "Cloning {} into existing directory {}",
                    repo.full_name(),
                    path.display()
                );
                if let Err(e) = self.clone_into_existing(repo, path).await {
                    // the next run must retry the clone rather than pull
                    let _ = tokio::fs::remove_dir_all(path.join(".git")).await;
                    return Err(e);
                }
                Ok(FetchResult::Cloned {
                    repo: repo.url.clone(),
                    path: path.to_path_buf(),
                })
            }
            FetchAction::Pull => {
                let mut args = vec!["pull"];
                if self.fetch.fast_forward_only {
                    args.push("--ff-only");
                }

                info!("Pulling {} at {}", repo.full_name(), path.display());
                self.run_git(repo, &args, path).await?;
                Ok(FetchResult::Pulled {
                    repo: repo.url.clone(),
                    path: path.to_path_buf(),
                })
            }
        }
    }

    /// `git clone` refuses a non-empty destination, so the repository is
    /// initialized in place and the remote's default branch checked out over
    /// it. Files the remote does not track stay untouched.
    async fn clone_into_existing(&self, repo: &RepositoryRef, path: &Path) -> Result<()> {
        self.run_git(repo, &["init", "--quiet"], path).await?;
        self.run_git(repo, &["remote", "add", "origin", repo.url.as_str()], path)
            .await?;
        self.run_git(repo, &["fetch", "origin"], path).await?;

        let heads = self
            .run_git(repo, &["ls-remote", "--symref", "origin", "HEAD"], path)
            .await?;
        let heads = String::from_utf8_lossy(&heads.stdout);
        let Some(branch) = default_branch(&heads) else {
            debug!("{} has no default branch, nothing to check out", repo.full_name());
            return Ok(());
        };

        let upstream = format!("origin/{}", branch);
        self.run_git(
            repo,
            &["checkout", "-f", "-B", branch, "--track", upstream.as_str()],
            path,
        )
        .await?;
        Ok(())
    }

    /// Run git in `cwd`, logging its output. A non-zero exit is an error.
    async fn run_git(&self, repo: &RepositoryRef, args: &[&str], cwd: &Path) -> Result<Output> {
        let mut command = AsyncCommand::new("git");
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(credentials) = &self.credentials {
            credentials.apply(&mut command, repo);
        }

        let output = if self.fetch.timeout > 0 {
            let limit = Duration::from_secs(self.fetch.timeout);
            timeout(limit, command.output())
                .await
                .map_err(|_| anyhow!("git {} timed out after {}s", args[0], limit.as_secs()))?
        } else {
            command.output().await
        }
        .with_context(|| format!("Failed to execute git {}", args[0]))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!("git {} stdout: {}", args[0], stdout.trim());
        }

        if !output.status.success() {
            warn!("git {} stderr: {}", args[0], stderr.trim());
            return Err(anyhow!(
                "git {} exited with {}: {}",
                args[0],
                output.status,
                stderr.trim()
            ));
        }

        if !stderr.trim().is_empty() {
            debug!("git {} stderr: {}", args[0], stderr.trim());
        }

        Ok(output)
    }
}

/// Branch named by the `ref: refs/heads/<branch>\tHEAD` line of
/// `git ls-remote --symref <remote> HEAD`
fn default_branch(ls_remote: &str) -> Option<&str> {
    ls_remote.lines().find_map(|line| {
        let (target, name) = line.split_once('\t')?;
        if name.trim() != "HEAD" {
            return None;
        }
        target.strip_prefix("ref: refs/heads/")
    })
}
