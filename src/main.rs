use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repovault::config::{BackendKind, LoggingConfig};
use repovault::discovery::Discovery;
use repovault::health::{CheckResult, CheckStatus};
use repovault::upload::build_transport;
use repovault::{
    ArchiveArtifact, Archiver, BackupPipeline, Config, DateStamp, FetchResult, FetchSummary,
    GitHubClient, HealthCheck, UploadReport,
};

#[derive(Parser)]
#[command(name = "repovault")]
#[command(about = "Scheduled GitHub repository backups: mirror, archive, upload")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full backup: enumerate, fetch, archive, upload (default)
    Run {
        /// Stop after archiving
        #[arg(long)]
        skip_upload: bool,
    },

    /// List the repositories that would be backed up
    List {
        /// Show repository URLs
        #[arg(long)]
        urls: bool,
    },

    /// Enumerate and fetch repositories without archiving
    Fetch,

    /// Archive the base directory
    Archive,

    /// Upload the archive left by a previous `archive` run
    Upload,

    /// Write a configuration file and create the base directory
    Init {
        /// Base directory for repositories
        #[arg(short, long, default_value = "~/repos")]
        base_dir: String,
    },

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    // a missing .env is not an error
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let initializing = matches!(cli.command, Some(Commands::Init { .. }));
    let config = match load_config(cli.config.as_deref(), initializing) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging, cli.verbose);
    info!("Starting repovault v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command.unwrap_or(Commands::Run { skip_upload: false }) {
        Commands::Run { skip_upload } => cmd_run(skip_upload, &config).await,
        Commands::List { urls } => cmd_list(urls, &config).await,
        Commands::Fetch => cmd_fetch(&config).await,
        Commands::Archive => cmd_archive(&config).await,
        Commands::Upload => cmd_upload(&config).await,
        Commands::Init { base_dir } => cmd_init(base_dir, cli.config.as_deref(), &config),
        Commands::Doctor => cmd_doctor(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging; `RUST_LOG` wins over configuration and `--verbose`
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(logging.color);
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "full" {
        registry.with(layer).init();
    } else {
        registry.with(layer.compact()).init();
    }
}

/// Load configuration from specified path or default location.
/// `init` may name a file that does not exist yet.
fn load_config(config_path: Option<&Path>, allow_missing: bool) -> Result<Config> {
    match config_path {
        Some(path) if allow_missing && !path.exists() => Ok(Config::default()),
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Validate, ignoring the upload backend when it will not be used
fn validate(config: &Config, with_upload: bool) -> Result<()> {
    if with_upload {
        return config.validate();
    }
    let mut config = config.clone();
    config.upload.backend = BackendKind::None;
    config.validate()
}

/// Run the full backup pipeline
async fn cmd_run(skip_upload: bool, config: &Config) -> Result<()> {
    validate(config, !skip_upload)?;

    let pipeline = BackupPipeline::from_config(config, !skip_upload).await?;
    let report = pipeline.run(&DateStamp::today()).await?;

    print_fetch_summary(&report.fetch);
    print_artifact(&report.artifact)?;
    match &report.upload {
        Some(upload) => print_upload(upload),
        None => println!("⏭️  Upload skipped"),
    }

    println!("\n🎉 Backup complete in {:.2}s", report.duration.as_secs_f64());
    Ok(())
}

/// List repositories per owner scope
async fn cmd_list(urls: bool, config: &Config) -> Result<()> {
    let client = GitHubClient::new(config).await?;
    let scopes = config.owner_scopes(client.username());

    let mut total = 0;
    for scope in &scopes {
        let repos = client
            .discover(scope)
            .await
            .with_context(|| format!("Failed to enumerate repositories for {}", scope))?;

        println!("{} ({}):", scope, repos.len());
        for repo in &repos {
            if urls {
                println!("  📁 {}  {}", repo.full_name(), repo.url);
            } else {
                println!("  📁 {}", repo.full_name());
            }
        }
        total += repos.len();
    }

    println!("\nRepositories: {}", total);
    Ok(())
}

/// Enumerate and fetch only
async fn cmd_fetch(config: &Config) -> Result<()> {
    let pipeline = BackupPipeline::from_config(config, false).await?;

    println!("🔍 Discovering repositories...");
    let repos = pipeline.discover().await?;
    println!("   Found {} repositories", repos.len());

    let summary = pipeline.fetch(repos).await;
    print_fetch_summary(&summary);
    Ok(())
}

/// Archive the base directory
async fn cmd_archive(config: &Config) -> Result<()> {
    validate(config, false)?;

    let artifact = Archiver::new(config)?.create().await?;
    print_artifact(&artifact)
}

/// Upload an existing archive
async fn cmd_upload(config: &Config) -> Result<()> {
    validate(config, true)?;

    let archiver = Archiver::new(config)?;
    let artifact = ArchiveArtifact::discover(archiver.output_dir(), archiver.name())?;

    let Some(transport) = build_transport(config).await? else {
        println!("⏭️  Upload backend is none, nothing to do");
        return Ok(());
    };

    let report = transport.upload(&artifact, &DateStamp::today()).await?;
    print_upload(&report);
    Ok(())
}

/// Initialize repovault configuration
fn cmd_init(base_dir: String, config_path: Option<&Path>, config: &Config) -> Result<()> {
    info!("Initializing repovault...");

    let expanded_base_dir = shellexpand::full(&base_dir)?;
    std::fs::create_dir_all(expanded_base_dir.as_ref())
        .with_context(|| format!("Failed to create {}", expanded_base_dir))?;

    let mut new_config = config.clone();
    new_config.base_directory = base_dir.clone();

    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    new_config.save(&config_path)?;

    info!("Configuration saved to: {:?}", config_path);

    println!("✅ repovault initialized successfully!");
    println!("   Config: {:?}", config_path);
    println!("   Base directory: {}", expanded_base_dir);
    println!("   Next: add owners to the config, then run 'repovault doctor'");

    Ok(())
}

/// System health check and diagnostics
async fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);

    let errors = health.errors().len();
    if errors > 0 {
        bail!("{} required check(s) failed", errors);
    }
    Ok(())
}

fn print_fetch_summary(summary: &FetchSummary) {
    println!("\n📥 Fetch");
    println!("   📊 Total repositories: {}", summary.total);
    println!("   ✅ Succeeded: {}", summary.succeeded);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.failed > 0 {
        println!("\n🔍 Failed Fetches:");
        for result in summary.failures() {
            if let FetchResult::Failed { repo, error, .. } = result {
                println!("   ❌ {}: {}", repo, error);
            }
        }
    }
}

fn print_artifact(artifact: &ArchiveArtifact) -> Result<()> {
    println!("\n📦 Archive ({} bytes)", artifact.total_bytes()?);
    for file in artifact.files() {
        println!("   {}", file.display());
    }
    Ok(())
}

fn print_upload(report: &UploadReport) {
    println!(
        "\n☁️  Uploaded {} file(s), {} bytes via {}",
        report.files.len(),
        report.total_bytes(),
        report.backend
    );
    for file in &report.files {
        println!("   {} -> {}", file.local.display(), file.remote);
    }
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = match result.status {
            CheckStatus::Pass => "✅",
            CheckStatus::Warn => "⚠️ ",
            CheckStatus::Fail => "❌",
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 repovault System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
