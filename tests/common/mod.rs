//! Common test utilities and helpers for repovault tests
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tempfile::TempDir;

use repovault::discovery::{Discovery, OwnerScope, RepositoryRef};
use repovault::upload::{CommitInfo, UploadSessionApi};

/// Scratch directory with the standard repovault layout
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self { temp_dir }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn base_dir(&self) -> PathBuf {
        self.path().join("repos")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path().join("out")
    }

    pub fn remotes_dir(&self) -> PathBuf {
        self.path().join("remotes")
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.path().join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Config archiving the base dir with gzip and uploads disabled
    pub fn create_minimal_config(&self) -> PathBuf {
        let config_content = format!(
            r#"
base_directory: "{}"
github:
  auth_method: "token"
archive:
  output_dir: "{}"
  compressor: gzip
upload:
  backend: none
logging:
  color: false
"#,
            self.base_dir().display(),
            self.output_dir().display()
        );
        self.create_test_config(&config_content)
    }

    /// Non-bare git repository at `remotes/<owner>/<name>` with one commit
    pub fn create_remote<C: AsRef<[u8]>>(
        &self,
        owner: &str,
        name: &str,
        files: &[(&str, C)],
    ) -> RepositoryRef {
        let dir = self.remotes_dir().join(owner).join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create remote dir");
        git(&dir, &["init", "--quiet"]);
        commit_files(&dir, files, "initial");
        RepositoryRef::new(format!("file://{}", dir.display()))
    }

    pub fn remote_path(&self, owner: &str, name: &str) -> PathBuf {
        self.remotes_dir().join(owner).join(name)
    }
}

pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=repovault", "-c", "user.email=repovault@example.com"])
        .args(["-c", "init.defaultBranch=main"])
        .args(args)
        .current_dir(dir)
        .status()
        .expect("Failed to run git");
    assert!(status.success(), "git {:?} failed in {}", args, dir.display());
}

pub fn commit_files<C: AsRef<[u8]>>(dir: &Path, files: &[(&str, C)], message: &str) {
    for (name, content) in files {
        std::fs::write(dir.join(name), content).expect("Failed to write file");
    }
    git(dir, &["add", "--all"]);
    git(dir, &["commit", "--quiet", "--allow-empty", "-m", message]);
}

/// Deterministic bytes that do not compress
pub fn noise(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Discovery returning a fixed list for every scope
pub struct FixedDiscovery(pub Vec<RepositoryRef>);

#[async_trait]
impl Discovery for FixedDiscovery {
    async fn discover(&self, _scope: &OwnerScope) -> Result<Vec<RepositoryRef>> {
        Ok(self.0.clone())
    }

    fn provider_name(&self) -> &'static str {
        "fixed"
    }
}

/// Session calls as the backend saw them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Start,
    Append { offset: u64, len: u64 },
    Finish { offset: u64, path: String },
}

/// In-memory upload session backend
#[derive(Default)]
pub struct RecordingSessionApi {
    calls: Mutex<Vec<SessionCall>>,
}

impl RecordingSessionApi {
    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadSessionApi for RecordingSessionApi {
    async fn start(&self) -> Result<String> {
        self.calls.lock().unwrap().push(SessionCall::Start);
        Ok("recording".to_string())
    }

    async fn append(&self, _session_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.calls.lock().unwrap().push(SessionCall::Append {
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    async fn finish(&self, _session_id: &str, offset: u64, commit: &CommitInfo) -> Result<()> {
        self.calls.lock().unwrap().push(SessionCall::Finish {
            offset,
            path: commit.path.clone(),
        });
        Ok(())
    }
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
