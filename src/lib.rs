//! repovault - Scheduled GitHub repository backups
//!
//! repovault enumerates every repository owned by a set of GitHub users and
//! organizations, mirrors them to local disk, packs the tree into a
//! compressed (optionally split) archive and uploads it offsite.
//!
//! ## Core Features
//!
//! - **GitHub Integration**: Cursor-paginated GraphQL enumeration per owner
//! - **Mirror Fetching**: `git clone --mirror` or working copies kept up to date
//! - **Archiving**: `tar` with `pigz`, optionally piped into `split`
//! - **Offsite Upload**: Dropbox upload sessions, S3 cold storage, Google Drive
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`discovery`] and [`github`]: Repository enumeration
//! - [`git`]: Mirror and working-copy fetches
//! - [`archive`]: Archive creation
//! - [`upload`]: Upload backends
//! - [`backup`]: The pipeline tying the stages together
//! - [`health`]: Preflight diagnostics

pub mod archive;
pub mod backup;
pub mod config;
pub mod discovery;
pub mod git;
pub mod github;
pub mod health;
pub mod upload;

pub use archive::{ArchiveArtifact, Archiver};
pub use backup::{BackupPipeline, BackupReport, FetchSummary};
pub use config::Config;
pub use discovery::{Discovery, OwnerScope, RepositoryRef};
pub use git::{FetchResult, GitClient, GitCredentials};
pub use github::GitHubClient;
pub use health::HealthCheck;
pub use upload::{DateStamp, Transport, UploadReport};
