use anyhow::{anyhow, bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::discovery::OwnerScope;

/// Largest chunk Dropbox accepts in a single upload session call
pub const DROPBOX_MAX_CHUNK_BYTES: u64 = 150 * 1024 * 1024;

/// Main configuration structure for repovault
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory the repositories are mirrored into
    pub base_directory: String,

    /// Users and organizations whose repositories are backed up
    #[serde(default)]
    pub owners: OwnersConfig,

    /// GitHub authentication and enumeration settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Mirror fetch behavior
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Archive creation
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Remote upload backend
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Owner scopes to enumerate
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OwnersConfig {
    /// User logins; the authenticated user is used when empty
    #[serde(default)]
    pub users: Vec<String>,

    /// Organization logins
    #[serde(default)]
    pub organizations: Vec<String>,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// Login embedded in clone credentials (auto-detected if null)
    pub username: Option<String>,

    /// API base URI override (GitHub Enterprise)
    #[serde(default)]
    pub api_url: Option<String>,

    /// Repositories requested per GraphQL page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Cap on pages per owner; unlimited when null
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// How repositories are brought to local disk
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// `git clone --mirror` under `<base>/<owner>` on every run
    Mirror,
    /// Clone once into `<base>/<owner>/<name>`, pull afterwards
    #[default]
    WorkingCopy,
}

/// What mirror mode does with a mirror left by a previous run
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MirrorExisting {
    /// Leave it in place; git reports the clone as failed
    #[default]
    Keep,
    /// Remove it so the clone starts from scratch
    Replace,
}

/// Fetch configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FetchConfig {
    #[serde(default)]
    pub mode: FetchMode,

    #[serde(default)]
    pub mirror_existing: MirrorExisting,

    /// Fast-forward only pulls in working-copy mode
    #[serde(default = "default_true")]
    pub fast_forward_only: bool,

    /// Maximum concurrent git processes
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for a single git process in seconds (0 disables)
    #[serde(default)]
    pub timeout: u64,
}

/// Archive configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ArchiveConfig {
    /// Archive file name
    #[serde(default = "default_archive_name")]
    pub name: String,

    /// Directory the archive (or its parts) is written to
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Program tar uses for compression
    #[serde(default = "default_compressor")]
    pub compressor: String,

    /// Split the archive into parts of this size ("4GiB"); single file when null
    #[serde(default)]
    pub split_size: Option<String>,
}

/// Supported upload backends
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Dropbox,
    S3,
    Drive,
    None,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dropbox" => Ok(Self::Dropbox),
            "s3" => Ok(Self::S3),
            "drive" => Ok(Self::Drive),
            "none" => Ok(Self::None),
            other => Err(anyhow!("Unknown upload backend: {}", other)),
        }
    }
}

/// Upload configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct UploadConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub dropbox: DropboxConfig,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub drive: DriveConfig,
}

/// How chunks are read for a session upload
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Fixed-size buffers read at precomputed offsets
    #[default]
    Offset,
    /// Chunks appended as the file read stream yields them
    Stream,
}

/// Dropbox session upload settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DropboxConfig {
    /// Remote folder the dated backup folders are created in
    #[serde(default = "default_dropbox_root")]
    pub root: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: String,

    #[serde(default)]
    pub strategy: ChunkStrategy,

    /// Let Dropbox rename on path conflict
    #[serde(default)]
    pub autorename: bool,

    /// API base URL override
    #[serde(default)]
    pub api_url: Option<String>,
}

/// S3-compatible object storage settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct S3Config {
    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Key prefix in front of the date folder
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,

    #[serde(default = "default_storage_class")]
    pub storage_class: String,

    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub endpoint_url: Option<String>,

    #[serde(default)]
    pub force_path_style: bool,
}

/// Google Drive settings
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DriveConfig {
    /// Parent folder id the archives are created in
    #[serde(default)]
    pub folder_id: Option<String>,

    /// Upload endpoint override
    #[serde(default)]
    pub api_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_true() -> bool {
    true
}
fn default_page_size() -> u32 {
    100
}
fn default_max_parallel() -> usize {
    1
}
fn default_archive_name() -> String {
    "repos.tar.gz".to_string()
}
fn default_output_dir() -> String {
    ".".to_string()
}
fn default_compressor() -> String {
    "pigz".to_string()
}
fn default_dropbox_root() -> String {
    "/Backup".to_string()
}
fn default_chunk_size() -> String {
    "100MiB".to_string()
}
fn default_s3_prefix() -> String {
    "Backup".to_string()
}
fn default_storage_class() -> String {
    "DEEP_ARCHIVE".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            username: None,
            api_url: None,
            page_size: default_page_size(),
            max_pages: None,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            mode: FetchMode::default(),
            mirror_existing: MirrorExisting::default(),
            fast_forward_only: default_true(),
            max_parallel: default_max_parallel(),
            timeout: 0,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            name: default_archive_name(),
            output_dir: default_output_dir(),
            compressor: default_compressor(),
            split_size: None,
        }
    }
}

impl Default for DropboxConfig {
    fn default() -> Self {
        Self {
            root: default_dropbox_root(),
            chunk_size: default_chunk_size(),
            strategy: ChunkStrategy::default(),
            autorename: false,
            api_url: None,
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            prefix: default_s3_prefix(),
            storage_class: default_storage_class(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            config.apply_env_overrides()?;
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.apply_env_overrides()?;
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repovault").join("config.yml"))
    }

    /// Override file settings with the deployment environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(base_dir) = non_empty_env("BASE_DIR") {
            self.base_directory = base_dir;
        }
        if let Some(output_dir) = non_empty_env("ARCHIVE_OUTPUT_DIR") {
            self.archive.output_dir = output_dir;
        }
        if let Some(backend) = non_empty_env("UPLOAD_BACKEND") {
            self.upload.backend = backend.parse()?;
        }
        if let Some(bucket) = non_empty_env("S3_BUCKET") {
            self.upload.s3.bucket = Some(bucket);
        }
        if let Some(region) = non_empty_env("AWS_REGION") {
            self.upload.s3.region = Some(region);
        }
        if let Some(folder_id) = non_empty_env("DRIVE_FOLDER_ID") {
            self.upload.drive.folder_id = Some(folder_id);
        }
        Ok(())
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.base_directory = shellexpand::full(&self.base_directory)
            .context("Failed to expand base_directory path")?
            .into_owned();

        self.archive.output_dir = shellexpand::full(&self.archive.output_dir)
            .context("Failed to expand archive output_dir path")?
            .into_owned();

        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.base_directory.trim().is_empty() {
            bail!("base_directory must not be empty");
        }
        if self.archive.name.is_empty() || self.archive.name.contains('/') {
            bail!("archive.name must be a plain file name, got {:?}", self.archive.name);
        }
        self.split_size_bytes()?;

        match self.upload.backend {
            BackendKind::Dropbox => {
                let chunk = self.chunk_size_bytes()?;
                if chunk > DROPBOX_MAX_CHUNK_BYTES {
                    bail!(
                        "upload.dropbox.chunk_size {} exceeds the 150MiB session append limit",
                        self.upload.dropbox.chunk_size
                    );
                }
            }
            BackendKind::S3 => {
                if self.upload.s3.bucket.as_deref().map_or(true, str::is_empty) {
                    bail!("upload.s3.bucket (or S3_BUCKET) is required for the s3 backend");
                }
            }
            BackendKind::Drive => {
                if self.upload.drive.folder_id.as_deref().map_or(true, str::is_empty) {
                    bail!("upload.drive.folder_id (or DRIVE_FOLDER_ID) is required for the drive backend");
                }
            }
            BackendKind::None => {}
        }

        Ok(())
    }

    /// Base directory as a path
    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(&self.base_directory)
    }

    /// Part size for split archives
    pub fn split_size_bytes(&self) -> Result<Option<u64>> {
        self.archive
            .split_size
            .as_deref()
            .map(parse_size)
            .transpose()
            .context("Invalid archive.split_size")
    }

    /// Session upload chunk size
    pub fn chunk_size_bytes(&self) -> Result<u64> {
        parse_size(&self.upload.dropbox.chunk_size).context("Invalid upload.dropbox.chunk_size")
    }

    /// Owner scopes in enumeration order: users first, then organizations
    pub fn owner_scopes(&self, authenticated_login: &str) -> Vec<OwnerScope> {
        let mut scopes: Vec<OwnerScope> = if self.owners.users.is_empty() {
            vec![OwnerScope::User(authenticated_login.to_string())]
        } else {
            self.owners
                .users
                .iter()
                .map(|login| OwnerScope::User(login.clone()))
                .collect()
        };

        scopes.extend(
            self.owners
                .organizations
                .iter()
                .map(|login| OwnerScope::Organization(login.clone())),
        );

        scopes
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_directory: "${HOME}/repos".to_string(),
            owners: OwnersConfig::default(),
            github: GitHubConfig::default(),
            fetch: FetchConfig::default(),
            archive: ArchiveConfig::default(),
            upload: UploadConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse a byte size such as "4GiB", "100MB", "512k" or "1048576".
///
/// Decimal and binary suffixes are both treated as powers of 1024, matching
/// what `split --bytes` does with its single-letter suffixes.
pub fn parse_size(size_str: &str) -> Result<u64> {
    let normalized = size_str.trim().to_lowercase();
    let digits_end = normalized
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(normalized.len());
    let (number, unit) = normalized.split_at(digits_end);

    let value: u64 = number
        .parse()
        .with_context(|| format!("Invalid size value: {:?}", size_str))?;

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" | "tib" => 1024 * 1024 * 1024 * 1024,
        other => bail!("Unknown size unit {:?} in {:?}", other, size_str),
    };

    let bytes = value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("Size overflows: {:?}", size_str))?;

    if bytes == 0 {
        bail!("Size must be greater than zero: {:?}", size_str);
    }

    Ok(bytes)
}
