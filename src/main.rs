// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

use pulp_tool::api::{PulpClient, RepositoryManager, TaskHref};
use pulp_tool::config::Config;
use pulp_tool::download::{DownloadOrchestrator, Manifest, ManifestFilter, OutputLayout};
use pulp_tool::errors::PulpError;
use pulp_tool::report::Report;
use pulp_tool::tasks::TaskPoller;
use pulp_tool::types::ContentType;
use pulp_tool::upload::{scan_rpm_directory, ResultsDestination, UploadContext, UploadItem, UploadOrchestrator};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
/// These provide meaningful exit status to calling processes and scripts
mod exit_codes {
    /// Success - every item succeeded
    pub const SUCCESS: i32 = 0;
    /// General error - the batch finished with failed items
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Data error - malformed manifest
    pub const DATA_ERR: i32 = 65;
    /// Temporary failure - server unreachable or task timed out
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// Spinner helpers for consistent progress indicators
mod spinner {
    use colored::Colorize;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    /// Create a spinner with consistent styling (drawn on stderr)
    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ")
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }

    /// Finish spinner with success message
    pub fn finish_success(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        eprintln!("{} {}", "[OK]".green(), message);
    }

    /// Finish spinner with warning message
    pub fn finish_warning(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        eprintln!("{} {}", "[!]".yellow(), message);
    }

    /// Finish spinner with error message
    pub fn finish_error(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        eprintln!("{} {}", "[X]".red(), message);
    }
}

/// pulp-tool - upload, track and download build artifacts.
#[derive(Parser)]
#[command(name = "pulp-tool")]
#[command(version = VERSION)]
#[command(about = "Upload, track and download build artifacts in a content-management server.")]
#[command(long_about = "pulp-tool - content-management client\n\n\
    Upload a build:      pulp-tool --build-id B --namespace N upload-files --parent-package P --rpm-dir out/\n\
    Download artifacts:  pulp-tool transfer --artifact-location pulp_results.json --output-dir dl/\n\
    Wait on a task:      pulp-tool wait-task /pulp/api/v3/tasks/<id>/\n\n\
    Reports are printed as JSON on stdout; progress goes to stderr.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path, or the config JSON encoded as base64
    #[arg(long, global = true, value_name = "PATH|BASE64")]
    config: Option<String>,

    /// Build identifier recorded in content labels
    #[arg(long, global = true)]
    build_id: Option<String>,

    /// Namespace recorded in labels and distribution paths
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Debug logging (includes request details)
    #[arg(long, global = true)]
    debug: bool,

    /// Verbose mode: log each item and poll
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Concurrent downloads (overrides config)
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Seconds to wait for each server task (overrides config)
    #[arg(long, global = true, value_name = "SECS")]
    task_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload RPMs, logs, SBOMs and other files for one build
    ///
    /// Examples:
    ///   pulp-tool --build-id 42 --namespace team upload-files --parent-package foo --rpm-dir out/
    ///   pulp-tool --build-id 42 --namespace team upload-files --parent-package foo \
    ///       --rpm foo-1.0-1.x86_64.rpm --log build.log --arch x86_64
    UploadFiles {
        /// Package the repositories are named after
        #[arg(long)]
        parent_package: String,
        /// RPM file (repeatable)
        #[arg(long)]
        rpm: Vec<PathBuf>,
        /// Directory of RPMs, with optional <arch>/ subdirectories holding RPMs and logs
        #[arg(long)]
        rpm_dir: Option<PathBuf>,
        /// Build log (repeatable)
        #[arg(long)]
        log: Vec<PathBuf>,
        /// SBOM document (repeatable)
        #[arg(long)]
        sbom: Vec<PathBuf>,
        /// Any other file (repeatable)
        #[arg(long)]
        file: Vec<PathBuf>,
        /// Architecture for --rpm/--log files, skipping detection
        #[arg(long)]
        arch: Option<String>,
        /// Write the results URL and digest to "url_path,digest_path"
        #[arg(long, value_name = "URL_PATH,DIGEST_PATH")]
        artifact_results: Option<String>,
        /// Write "<sbom url>@sha256:<digest>" to this file
        #[arg(long, value_name = "PATH")]
        sbom_results: Option<PathBuf>,
        /// Overall deadline in seconds; each task wait is capped by what is left
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Download artifacts listed in a manifest or results document
    Transfer {
        /// Local path or http(s) URL of the manifest
        #[arg(long)]
        artifact_location: String,
        /// Output root
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Only these content types (rpm, log, sbom, file)
        #[arg(long, value_delimiter = ',')]
        content_types: Vec<ContentType>,
        /// Only these architectures
        #[arg(long, value_delimiter = ',')]
        archs: Vec<String>,
        /// Overall deadline in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Wait for a server task and print its final state
    WaitTask {
        /// Task href, e.g. /pulp/api/v3/tasks/<id>/
        href: String,
        /// Seconds to wait (defaults to the task timeout)
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(cli.debug)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(workers) = cli.max_workers {
        config.max_workers = workers.max(1);
    }
    if let Some(secs) = cli.task_timeout {
        config.task_timeout_secs = secs;
    }
    tracing::debug!(
        "Using {} (domain: {})",
        config.base_url,
        config.domain.as_deref().unwrap_or("-")
    );
    Ok(config)
}

fn print_report(report: &Report) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    println!("{}", json);
    Ok(())
}

fn report_exit_code(report: &Report) -> i32 {
    if report.success {
        eprintln!("{} {}", "[OK]".green(), report.summary());
        SUCCESS
    } else {
        let failed = report.failures().count();
        eprintln!("{} {} ({} failed)", "[X]".red(), report.summary(), failed);
        for item in report.failures() {
            eprintln!(
                "    {} {}: {}",
                item.error_kind.as_deref().unwrap_or("error").yellow(),
                item.id,
                item.error.as_deref().unwrap_or("")
            );
        }
        ERROR
    }
}

/// Fail with a usage error unless `value` is set.
fn require<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str, i32> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => {
            eprintln!("{} {} is required for this command", "[X]".red(), flag);
            Err(USAGE)
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn cmd_upload_files(
    cli: &Cli,
    parent_package: &str,
    rpms: &[PathBuf],
    rpm_dir: Option<&PathBuf>,
    logs: &[PathBuf],
    sboms: &[PathBuf],
    files: &[PathBuf],
    arch: Option<&str>,
    artifact_results: Option<&str>,
    sbom_results: Option<&PathBuf>,
    timeout: Option<u64>,
) -> Result<i32> {
    let build_id = match require(&cli.build_id, "--build-id") {
        Ok(v) => v,
        Err(code) => return Ok(code),
    };
    let namespace = match require(&cli.namespace, "--namespace") {
        Ok(v) => v,
        Err(code) => return Ok(code),
    };

    let mut destination = ResultsDestination {
        sbom_results: sbom_results.cloned(),
        ..ResultsDestination::default()
    };
    if let Some(value) = artifact_results {
        let (url_path, digest_path) = ResultsDestination::parse_artifact_results(value)?;
        destination.url_path = Some(url_path);
        destination.digest_path = Some(digest_path);
    }

    let mut items = Vec::new();
    if let Some(dir) = rpm_dir {
        items.extend(scan_rpm_directory(dir)?);
    }
    let explicit = |paths: &[PathBuf], content_type: ContentType, arch: Option<&str>| {
        paths
            .iter()
            .map(move |p| UploadItem::new(p.clone(), content_type).with_arch(arch))
            .collect::<Vec<_>>()
    };
    items.extend(explicit(rpms, ContentType::Rpm, arch));
    items.extend(explicit(logs, ContentType::Log, arch));
    items.extend(explicit(sboms, ContentType::Sbom, None));
    items.extend(explicit(files, ContentType::File, None));

    if items.is_empty() {
        eprintln!(
            "{} Nothing to upload: pass --rpm, --rpm-dir, --log, --sbom or --file",
            "[X]".red()
        );
        return Ok(USAGE);
    }

    let config = load_config(cli)?;
    let client = PulpClient::new(&config)?;

    let sp = spinner::create(&format!("Preparing repositories for {}...", parent_package));
    let repositories = match RepositoryManager::new(&client, config.task_timeout())
        .ensure(parent_package, namespace)
        .await
    {
        Ok(refs) => {
            spinner::finish_success(&sp, &format!("Repositories ready for {}", parent_package));
            refs
        }
        Err(e) => {
            spinner::finish_error(&sp, "Could not prepare repositories");
            return Err(e.into());
        }
    };

    let ctx = UploadContext {
        build_id: build_id.to_string(),
        namespace: namespace.to_string(),
        parent_package: parent_package.to_string(),
        date: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        repositories,
        task_timeout: config.task_timeout(),
    };

    let orchestrator = UploadOrchestrator::new(&client).with_deadline(timeout.map(Duration::from_secs));
    let sp = spinner::create(&format!("Uploading {} file(s)...", items.len()));
    let mut report = orchestrator.upload_batch(&items, &ctx).await;
    sp.finish_and_clear();

    let sp = spinner::create("Publishing results...");
    orchestrator.publish_results(&mut report, &ctx, &destination).await;
    match (&report.results_url, report.warnings.is_empty()) {
        (Some(url), true) => spinner::finish_success(&sp, &format!("Results: {}", url)),
        _ => spinner::finish_warning(&sp, &format!("Results published with {} warning(s)", report.warnings.len())),
    }

    print_report(&report)?;
    Ok(report_exit_code(&report))
}

async fn cmd_transfer(
    cli: &Cli,
    artifact_location: &str,
    output_dir: &Path,
    content_types: &[ContentType],
    archs: &[String],
    timeout: Option<u64>,
) -> Result<i32> {
    let config = load_config(cli)?;
    let client = Arc::new(PulpClient::new(&config)?);

    let filter = ManifestFilter {
        content_types: content_types.to_vec(),
        archs: archs.to_vec(),
    };
    let manifest = Manifest::load(artifact_location, client.as_ref())
        .await?
        .filtered(&filter);
    if manifest.is_empty() {
        eprintln!("{} No artifacts match the requested filters", "[!]".yellow());
    }

    let sp = spinner::create(&format!(
        "Downloading {} artifact(s) to {}...",
        manifest.len(),
        output_dir.display()
    ));
    let report = DownloadOrchestrator::new(client)
        .with_max_workers(config.max_workers)
        .with_deadline(timeout.map(Duration::from_secs))
        .download_batch(&manifest, &OutputLayout::new(output_dir))
        .await;
    sp.finish_and_clear();

    print_report(&report)?;
    Ok(report_exit_code(&report))
}

async fn cmd_wait_task(cli: &Cli, href: &str, timeout: Option<u64>) -> Result<i32> {
    let config = load_config(cli)?;
    let client = PulpClient::new(&config)?;
    let timeout = timeout.map(Duration::from_secs).unwrap_or_else(|| config.task_timeout());
    let href = TaskHref::new(href);

    let sp = spinner::create(&format!("Waiting for {}...", href));
    match TaskPoller::new(&client).await_completion(&href, timeout).await {
        Ok(done) => {
            spinner::finish_success(&sp, &format!("Task completed after {} poll(s)", done.polls));
            let json = serde_json::to_string_pretty(&done.task).context("Failed to serialize task")?;
            println!("{}", json);
            Ok(SUCCESS)
        }
        Err(e) => {
            spinner::finish_error(&sp, &format!("Task did not complete: {}", e.kind()));
            Err(e.into())
        }
    }
}

async fn run(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::UploadFiles {
            parent_package,
            rpm,
            rpm_dir,
            log,
            sbom,
            file,
            arch,
            artifact_results,
            sbom_results,
            timeout,
        } => {
            cmd_upload_files(
                cli,
                parent_package,
                rpm,
                rpm_dir.as_ref(),
                log,
                sbom,
                file,
                arch.as_deref(),
                artifact_results.as_deref(),
                sbom_results.as_ref(),
                *timeout,
            )
            .await
        }
        Commands::Transfer {
            artifact_location,
            output_dir,
            content_types,
            archs,
            timeout,
        } => cmd_transfer(cli, artifact_location, output_dir, content_types, archs, *timeout).await,
        Commands::WaitTask { href, timeout } => cmd_wait_task(cli, href, *timeout).await,
    }
}

/// Map a failure to an exit code and print it with hints.
fn handle_error(err: anyhow::Error) -> i32 {
    match err.downcast_ref::<PulpError>() {
        Some(pulp) => {
            eprintln!("{}", pulp_tool::error::describe(pulp));
            match pulp {
                PulpError::Config(_) => CONFIG,
                PulpError::Manifest(_) => DATA_ERR,
                PulpError::TransientRequest { .. } | PulpError::TaskTimeout { .. } => TEMP_FAIL,
                _ => ERROR,
            }
        }
        None => {
            eprintln!("{} {:#}", "[X]".red(), err);
            ERROR
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(err) => handle_error(err),
    };
    std::process::exit(code);
}
