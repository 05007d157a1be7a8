//! Preflight checks for `repovault doctor`
//!
//! A backup run shells out to git, tar, the compressor and (when splitting)
//! split, authenticates against GitHub and needs credentials for its upload
//! backend. Each of those is checked independently so one report lists
//! every problem at once.

use crate::config::BackendKind;
use crate::{Config, GitHubClient};
use std::path::Path;

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// Usable, but worth a look
    Warn,
    Fail,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub message: String,
    pub details: Option<String>,
}

impl CheckResult {
    fn new(status: CheckStatus, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details,
        }
    }

    fn pass(message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Pass, message, None)
    }

    fn pass_with(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(CheckStatus::Pass, message, Some(details.into()))
    }

    fn warn(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(CheckStatus::Warn, message, Some(details.into()))
    }

    fn fail(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::new(CheckStatus::Fail, message, Some(hint.into()))
    }

    pub fn is_failure(&self) -> bool {
        self.status == CheckStatus::Fail
    }
}

/// Every preflight check of a backup run
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub git: CheckResult,
    pub tar: CheckResult,
    pub compressor: CheckResult,
    /// Only required when `archive.split_size` is set
    pub split: CheckResult,
    pub github_auth: CheckResult,
    pub base_dir: CheckResult,
    pub upload: CheckResult,
}

impl HealthCheck {
    pub async fn run(config: &Config) -> Self {
        let split = if config.archive.split_size.is_some() {
            Self::check_tool("split", "Install GNU coreutils")
        } else {
            CheckResult::pass("Not needed (archive.split_size unset)")
        };

        Self {
            git: Self::check_tool("git", "Install git: https://git-scm.com/downloads"),
            tar: Self::check_tool("tar", "Install GNU tar"),
            compressor: Self::check_tool(
                &config.archive.compressor,
                "Install it or set archive.compressor to gzip",
            ),
            split,
            github_auth: Self::check_github(config).await,
            base_dir: Self::check_base_dir(config),
            upload: Self::check_upload(config),
        }
    }

    /// Labelled checks in report order
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 7] {
        [
            ("Git Installation", &self.git),
            ("tar Installation", &self.tar),
            ("Compressor", &self.compressor),
            ("split Installation", &self.split),
            ("GitHub Authentication", &self.github_auth),
            ("Base Directory", &self.base_dir),
            ("Upload Backend", &self.upload),
        ]
    }

    /// No check failed; warnings are allowed
    pub fn all_passed(&self) -> bool {
        self.errors().is_empty()
    }

    pub fn errors(&self) -> Vec<&CheckResult> {
        self.with_status(CheckStatus::Fail)
    }

    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.with_status(CheckStatus::Warn)
    }

    fn with_status(&self, status: CheckStatus) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|result| result.status == status)
            .collect()
    }

    /// `program --version` must start; its first output line is reported
    fn check_tool(program: &str, hint: &str) -> CheckResult {
        let output = match std::process::Command::new(program).arg("--version").output() {
            Ok(output) => output,
            Err(_) => return CheckResult::fail(format!("{} not found in PATH", program), hint),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let version = stdout
            .lines()
            .chain(stderr.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or(program)
            .to_string();

        CheckResult::pass_with(format!("{} installed", program), version)
    }

    async fn check_github(config: &Config) -> CheckResult {
        match GitHubClient::new(config).await {
            Ok(client) => CheckResult::pass_with(
                "Authenticated with GitHub",
                format!("Login: {}", client.username()),
            ),
            Err(e) => CheckResult::fail(
                "GitHub authentication failed",
                format!("{:#}\nRun: gh auth login, or set GITHUB_TOKEN", e),
            ),
        }
    }

    fn check_base_dir(config: &Config) -> CheckResult {
        let expanded = match shellexpand::full(&config.base_directory) {
            Ok(expanded) => expanded,
            Err(e) => return CheckResult::fail("Invalid base_directory", e.to_string()),
        };

        if Path::new(expanded.as_ref()).is_dir() {
            CheckResult::pass_with("Base directory present", expanded.to_string())
        } else {
            CheckResult::fail(
                format!("Base directory {} is missing", expanded),
                format!("Run: repovault init --base-dir {}", expanded),
            )
        }
    }

    /// Configuration and secrets of the selected backend
    fn check_upload(config: &Config) -> CheckResult {
        if let Err(e) = config.validate() {
            return CheckResult::fail("Invalid upload configuration", format!("{:#}", e));
        }

        match config.upload.backend {
            BackendKind::Dropbox => Self::check_env_secret("Dropbox", "DROPBOX_ACCESS_TOKEN"),
            BackendKind::Drive => Self::check_env_secret("Google Drive", "GOOGLE_DRIVE_ACCESS_TOKEN"),
            BackendKind::S3 => Self::check_aws_credentials(config),
            BackendKind::None => CheckResult::pass("Uploads disabled"),
        }
    }

    fn check_aws_credentials(config: &Config) -> CheckResult {
        let in_env = ["AWS_ACCESS_KEY_ID", "AWS_PROFILE", "AWS_WEB_IDENTITY_TOKEN_FILE"]
            .iter()
            .any(|key| std::env::var_os(key).is_some());
        let in_file = dirs::home_dir()
            .map(|home| home.join(".aws").join("credentials").exists())
            .unwrap_or(false);

        if in_env || in_file {
            CheckResult::pass_with(
                "AWS credentials found",
                format!("Bucket: {}", config.upload.s3.bucket.as_deref().unwrap_or_default()),
            )
        } else {
            CheckResult::warn(
                "No AWS credentials in the environment or ~/.aws",
                "Uploads rely on an instance or container role",
            )
        }
    }

    fn check_env_secret(backend: &str, key: &str) -> CheckResult {
        match std::env::var(key) {
            Ok(value) if !value.trim().is_empty() => {
                CheckResult::pass(format!("{} access token set", backend))
            }
            _ => CheckResult::fail(
                format!("{} access token missing", backend),
                format!("Set {} in the environment or .env", key),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn healthy() -> HealthCheck {
        let ok = || CheckResult::pass("ok");
        HealthCheck {
            git: ok(),
            tar: ok(),
            compressor: ok(),
            split: ok(),
            github_auth: ok(),
            base_dir: ok(),
            upload: ok(),
        }
    }

    fn config_with_base(base: &Path) -> Config {
        let mut config = Config::default();
        config.base_directory = base.to_string_lossy().into_owned();
        config.upload.backend = BackendKind::None;
        config
    }

    #[test]
    fn test_tool_checks() {
        let git = HealthCheck::check_tool("git", "hint");
        assert_eq!(git.status, CheckStatus::Pass);
        assert!(git.details.unwrap().contains("git version"));

        let missing = HealthCheck::check_tool("repovault-no-such-tool", "install it");
        assert!(missing.is_failure());
        assert_eq!(missing.details.as_deref(), Some("install it"));
    }

    #[test]
    fn test_base_dir_present_and_missing() {
        let temp = TempDir::new().unwrap();

        let present = HealthCheck::check_base_dir(&config_with_base(temp.path()));
        assert_eq!(present.status, CheckStatus::Pass);

        let missing = HealthCheck::check_base_dir(&config_with_base(&temp.path().join("nope")));
        assert!(missing.is_failure());
        assert!(missing.details.unwrap().contains("repovault init --base-dir"));
    }

    #[test]
    #[serial]
    fn test_dropbox_needs_token() {
        let config = Config::default();

        std::env::remove_var("DROPBOX_ACCESS_TOKEN");
        assert!(HealthCheck::check_upload(&config).is_failure());

        std::env::set_var("DROPBOX_ACCESS_TOKEN", "sl.token");
        assert_eq!(HealthCheck::check_upload(&config).status, CheckStatus::Pass);
        std::env::remove_var("DROPBOX_ACCESS_TOKEN");
    }

    #[test]
    fn test_invalid_backend_config_fails() {
        let mut config = Config::default();
        config.upload.backend = BackendKind::S3;

        let result = HealthCheck::check_upload(&config);
        assert!(result.is_failure());
        assert!(result.details.unwrap().contains("bucket"));
    }

    #[test]
    fn test_disabled_uploads_pass() {
        let temp = TempDir::new().unwrap();
        let result = HealthCheck::check_upload(&config_with_base(temp.path()));
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[test]
    fn test_warnings_do_not_fail_the_report() {
        let mut health = healthy();
        health.upload = CheckResult::warn("No AWS credentials", "role");

        assert!(health.all_passed());
        assert_eq!(health.warnings().len(), 1);
        assert!(health.errors().is_empty());

        health.tar = CheckResult::fail("tar missing", "install");
        health.base_dir = CheckResult::fail("base dir missing", "init");
        assert!(!health.all_passed());
        assert_eq!(health.errors().len(), 2);
    }

    #[test]
    fn test_report_order() {
        let health = healthy();
        let names: Vec<_> = health.all_checks().iter().map(|(name, _)| *name).collect();

        assert_eq!(
            names,
            vec![
                "Git Installation",
                "tar Installation",
                "Compressor",
                "split Installation",
                "GitHub Authentication",
                "Base Directory",
                "Upload Backend",
            ]
        );
    }
}
