//! Archive creation
//!
//! The base directory is packed with `tar`, compressed by an external
//! program (`pigz` by default) and written either as a single file or, when
//! a split size is configured, piped straight into `split` to produce
//! fixed-size parts. Nothing is buffered in-process.

use anyhow::{anyhow, bail, Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Archive files produced by one run, in upload order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    files: Vec<PathBuf>,
    split: bool,
}

impl ArchiveArtifact {
    /// A single, unsplit archive file
    pub fn single(file: PathBuf) -> Self {
        Self {
            files: vec![file],
            split: false,
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_split(&self) -> bool {
        self.split
    }

    /// Combined size of all files on disk
    pub fn total_bytes(&self) -> Result<u64> {
        self.files.iter().try_fold(0u64, |total, file| {
            let len = std::fs::metadata(file)
                .with_context(|| format!("Failed to stat archive file {}", file.display()))?
                .len();
            Ok(total + len)
        })
    }

    /// Find the archive left by a previous `archive` run: either the file
    /// `<name>` itself or the parts `split` wrote for it. Other files
    /// sharing the prefix (`<name>.bak`, ...) are ignored.
    pub fn discover(output_dir: &Path, name: &str) -> Result<Self> {
        let single = output_dir.join(name);
        let parts = split_parts(output_dir, name);

        match (single.is_file(), parts.is_empty()) {
            (true, true) => Ok(Self::single(single)),
            (false, false) => Ok(Self {
                files: parts,
                split: true,
            }),
            (true, false) => bail!(
                "Both {} and its split parts exist in {}, remove one of them",
                name,
                output_dir.display()
            ),
            (false, true) => bail!(
                "No archive named {} (or split parts) in {}",
                name,
                output_dir.display()
            ),
        }
    }
}

/// Suffix `split` gives the part after `suffix`.
///
/// Without `-a`, split starts at two letters and widens the suffix once the
/// leading letter would reach `z`: `aa`..`yz`, `zaaa`..`zyzz`, `zzaaaa`, ...
fn next_split_suffix(suffix: &str) -> String {
    let width = suffix.bytes().take_while(|&b| b == b'z').count();
    let mut body = suffix.as_bytes()[width..].to_vec();

    for i in (0..body.len()).rev() {
        let last = if i == 0 { b'y' } else { b'z' };
        if body[i] < last {
            body[i] += 1;
            let body: String = body.iter().map(|&b| char::from(b)).collect();
            return format!("{}{}", "z".repeat(width), body);
        }
        body[i] = b'a';
    }
    format!("{}{}", "z".repeat(width + 1), "a".repeat(width + 3))
}

/// `true` for any suffix `split` can generate
fn is_split_suffix(suffix: &str) -> bool {
    let width = suffix.bytes().take_while(|&b| b == b'z').count();
    suffix.len() == 2 + 2 * width && suffix.bytes().all(|b| b.is_ascii_lowercase())
}

fn part_path(output_dir: &Path, name: &str, suffix: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", name, suffix))
}

/// Consecutive parts `<name>.aa`, `<name>.ab`, ... present on disk, in the
/// order split wrote them
fn split_parts(output_dir: &Path, name: &str) -> Vec<PathBuf> {
    std::iter::successors(Some("aa".to_string()), |suffix| Some(next_split_suffix(suffix)))
        .map(|suffix| part_path(output_dir, name, &suffix))
        .take_while(|part| part.is_file())
        .collect()
}

/// Files a new run replaces: `<name>` and every `<name>.<split suffix>`
fn replaced_files(output_dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    if !output_dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(output_dir)
        .with_context(|| format!("Failed to read {}", output_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let replaced = file_name == name
            || file_name
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('.'))
                .map_or(false, is_split_suffix);
        if replaced {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Runs tar (and split) to produce an [`ArchiveArtifact`]
#[derive(Debug, Clone)]
pub struct Archiver {
    base_dir: PathBuf,
    output_dir: PathBuf,
    name: String,
    compressor: String,
    split_size: Option<u64>,
}

impl Archiver {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            base_dir: config.base_path(),
            output_dir: PathBuf::from(&config.archive.output_dir),
            name: config.archive.name.clone(),
            compressor: config.archive.compressor.clone(),
            split_size: config.split_size_bytes()?,
        })
    }

    /// Path of the single archive, or the prefix split appends suffixes to
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.name)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Archive the base directory. Any tar or split failure is an error.
    pub async fn create(&self) -> Result<ArchiveArtifact> {
        if !self.base_dir.is_dir() {
            bail!("Base directory {} does not exist", self.base_dir.display());
        }
        if self.output_dir.starts_with(&self.base_dir) {
            warn!(
                "Archive output {} is inside the archived directory",
                self.output_dir.display()
            );
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;
        self.remove_stale().await?;

        let artifact = match self.split_size {
            None => {
                self.create_single().await?;
                ArchiveArtifact::single(self.output_path())
            }
            Some(bytes) => {
                self.create_split(bytes).await?;
                let parts = split_parts(&self.output_dir, &self.name);
                if parts.is_empty() {
                    bail!("split wrote no parts for {}", self.name);
                }
                ArchiveArtifact {
                    files: parts,
                    split: true,
                }
            }
        };
        info!(
            "Archive written: {} file(s), {} bytes",
            artifact.files().len(),
            artifact.total_bytes()?
        );
        Ok(artifact)
    }

    async fn remove_stale(&self) -> Result<()> {
        for stale in replaced_files(&self.output_dir, &self.name)? {
            debug!("Removing stale archive file {}", stale.display());
            tokio::fs::remove_file(&stale)
                .await
                .with_context(|| format!("Failed to remove {}", stale.display()))?;
        }
        Ok(())
    }

    /// `tar --use-compress-program=<c> -cf <target> -C <parent> <basename>`
    fn tar_command(&self, target: &OsStr) -> Result<AsyncCommand> {
        let basename = self
            .base_dir
            .file_name()
            .ok_or_else(|| anyhow!("Cannot archive {}", self.base_dir.display()))?;
        let parent = self
            .base_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut command = AsyncCommand::new("tar");
        command
            .arg(format!("--use-compress-program={}", self.compressor))
            .arg("-cf")
            .arg(target)
            .arg("-C")
            .arg(parent)
            .arg(basename)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(command)
    }

    async fn create_single(&self) -> Result<()> {
        let output_path = self.output_path();
        info!(
            "Archiving {} -> {}",
            self.base_dir.display(),
            output_path.display()
        );

        let output = self
            .tar_command(output_path.as_os_str())?
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to spawn tar")?;

        check_status("tar", &output)
    }

    async fn create_split(&self, part_bytes: u64) -> Result<()> {
        let mut prefix = self.output_path().into_os_string();
        prefix.push(".");
        info!(
            "Archiving {} -> {}* in {} byte parts",
            self.base_dir.display(),
            Path::new(&prefix).display(),
            part_bytes
        );

        let mut tar = self
            .tar_command(OsStr::new("-"))?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn tar")?;

        let tar_stdout: Stdio = tar
            .stdout
            .take()
            .context("tar stdout was not captured")?
            .try_into()
            .context("Failed to hand tar output to split")?;

        let split = AsyncCommand::new("split")
            .arg(format!("--bytes={}", part_bytes))
            .arg("-")
            .arg(&prefix)
            .stdin(tar_stdout)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let (tar_output, split_output) = tokio::join!(tar.wait_with_output(), split);
        let tar_output = tar_output.context("Failed to wait for tar")?;
        let split_output = split_output.context("Failed to spawn split")?;

        check_status("tar", &tar_output)?;
        check_status("split", &split_output)
    }
}

fn check_status(program: &str, output: &Output) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        bail!("{} exited with {}: {}", program, output.status, stderr.trim());
    }
    if !stderr.trim().is_empty() {
        debug!("{} stderr: {}", program, stderr.trim());
    }
    Ok(())
}
