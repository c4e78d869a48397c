// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Upload orchestration.
//!
//! Items are uploaded one after another. Each yields exactly one
//! [`ItemResult`]; a failure is recorded and the batch moves on. After the
//! batch, [`UploadOrchestrator::publish_results`] uploads a results document
//! and writes its URL and digest for downstream tooling.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tokio::time::{timeout_at, Instant};

use crate::api::{FileSource, RepositoryRefs, UploadGateway};
use crate::errors::{PulpError, PulpResult};
use crate::report::{resilient_lock, ItemResult, Report, ResultAggregator};
use crate::tasks::TaskPoller;
use crate::types::{ContentType, Labels, SUPPORTED_ARCHITECTURES};
use crate::utils::sha256_file;

pub mod arch;

/// File name of the uploaded results document.
pub const RESULTS_FILE_NAME: &str = "pulp_results.json";

/// Architecture label for content with no architecture of its own.
const NOARCH: &str = "noarch";

// =============================================================================
// INPUTS
// =============================================================================

/// One local file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub path: PathBuf,
    pub content_type: ContentType,
    /// Overrides architecture detection when set
    pub arch: Option<String>,
}

impl UploadItem {
    pub fn new(path: impl Into<PathBuf>, content_type: ContentType) -> Self {
        Self {
            path: path.into(),
            content_type,
            arch: None,
        }
    }

    pub fn with_arch(mut self, arch: Option<impl Into<String>>) -> Self {
        self.arch = arch.map(Into::into);
        self
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Build-wide values shared by every item in a batch.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub build_id: String,
    pub namespace: String,
    pub parent_package: String,
    /// Value of the `date` label
    pub date: String,
    pub repositories: RepositoryRefs,
    pub task_timeout: Duration,
}

impl UploadContext {
    pub fn labels(&self, arch: &str) -> Labels {
        Labels::new(&self.build_id, arch, &self.namespace, &self.parent_package, &self.date)
    }
}

/// Where to write the results URL and digest.
#[derive(Debug, Clone, Default)]
pub struct ResultsDestination {
    pub url_path: Option<PathBuf>,
    pub digest_path: Option<PathBuf>,
    /// Receives `<sbom url>@sha256:<digest>`
    pub sbom_results: Option<PathBuf>,
}

impl ResultsDestination {
    /// Parse `"url_path,digest_path"`.
    pub fn parse_artifact_results(value: &str) -> PulpResult<(PathBuf, PathBuf)> {
        match value.split_once(',') {
            Some((url, digest)) if !url.trim().is_empty() && !digest.trim().is_empty() => {
                Ok((PathBuf::from(url.trim()), PathBuf::from(digest.trim())))
            }
            _ => Err(PulpError::Config(format!(
                "artifact results must be 'url_path,digest_path' (got '{}')",
                value
            ))),
        }
    }
}

/// One uploaded file, as listed in the results document.
#[derive(Debug, Clone)]
struct UploadedArtifact {
    /// Key in the results document (the relative path)
    name: String,
    content_type: ContentType,
    arch: String,
    checksum: String,
    href: String,
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Uploads batches of files through an [`UploadGateway`].
pub struct UploadOrchestrator<'a, G: UploadGateway + ?Sized> {
    gateway: &'a G,
    uploaded: Mutex<Vec<UploadedArtifact>>,
    deadline: Option<Duration>,
}

impl<'a, G: UploadGateway + ?Sized> UploadOrchestrator<'a, G> {
    pub fn new(gateway: &'a G) -> Self {
        Self {
            gateway,
            uploaded: Mutex::new(Vec::new()),
            deadline: None,
        }
    }

    /// Bound on the whole batch. Each task wait is capped by what is left;
    /// items still unresolved when it passes are recorded as `DeadlineExceeded`.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Upload `items` in order. Never fails as a whole; see the report.
    pub async fn upload_batch(&self, items: &[UploadItem], ctx: &UploadContext) -> Report {
        let aggregator = ResultAggregator::new();
        let until = self.deadline.map(|d| Instant::now() + d);

        for (seq, item) in items.iter().enumerate() {
            let id = item.file_name();
            let category = item.content_type.category();
            let past_deadline = || PulpError::DeadlineExceeded {
                operation: format!("upload {}", id),
            };

            let outcome = match until {
                Some(until) if Instant::now() >= until => Err(past_deadline()),
                Some(until) => {
                    tracing::info!("Uploading {} {} ({}/{})", item.content_type, id, seq + 1, items.len());
                    timeout_at(until, self.upload_one(item, ctx, Some(until)))
                        .await
                        .unwrap_or_else(|_| Err(past_deadline()))
                }
                None => {
                    tracing::info!("Uploading {} {} ({}/{})", item.content_type, id, seq + 1, items.len());
                    self.upload_one(item, ctx, None).await
                }
            };

            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!("Upload of {} failed: {}", id, err);
                    let mut failed = ItemResult::failed(id, category, &err);
                    failed.arch = item.arch.clone();
                    failed
                }
            };
            aggregator.record(seq, result);
        }

        aggregator.finalize()
    }

    async fn upload_one(
        &self,
        item: &UploadItem,
        ctx: &UploadContext,
        until: Option<Instant>,
    ) -> PulpResult<ItemResult> {
        let name = item.file_name();
        let explicit = item.arch.as_deref();

        let (arch, relative_path) = match item.content_type {
            ContentType::Rpm => (arch::resolve_rpm_arch(&item.path, explicit).await?, name.clone()),
            ContentType::Log => {
                let arch = arch::resolve_path_arch(&item.path, explicit)?;
                let relative = format!("{}/{}", arch, name);
                (arch, relative)
            }
            ContentType::Sbom | ContentType::File => {
                let arch = arch::resolve_path_arch(&item.path, explicit)
                    .unwrap_or_else(|_| NOARCH.to_string());
                (arch, name.clone())
            }
        };

        let checksum = sha256_file(&item.path).await?;
        let labels = ctx.labels(&arch);
        let poller = TaskPoller::new(self.gateway);
        let target = ctx.repositories.for_content(item.content_type);

        let href = match item.content_type {
            ContentType::Rpm => {
                let response = self.gateway.upload_rpm(&item.path, &relative_path, &labels).await?;
                let created = poller
                    .created_hrefs(response, poll_budget(ctx.task_timeout, until))
                    .await?;
                let package = content_href(&created, &name)?;
                let modify = self
                    .gateway
                    .add_content(&target.repository_href, std::slice::from_ref(&package))
                    .await?;
                poller
                    .created_hrefs(modify, poll_budget(ctx.task_timeout, until))
                    .await?;
                package
            }
            ContentType::Log | ContentType::Sbom | ContentType::File => {
                let response = self
                    .gateway
                    .create_file_content(
                        Some(&target.content_target),
                        FileSource::Path(item.path.clone()),
                        &relative_path,
                        &labels,
                    )
                    .await?;
                let created = poller
                    .created_hrefs(response, poll_budget(ctx.task_timeout, until))
                    .await?;
                content_href(&created, &name)?
            }
        };

        tracing::info!("Uploaded {} as {}", relative_path, href);
        resilient_lock(&self.uploaded).push(UploadedArtifact {
            name: relative_path,
            content_type: item.content_type,
            arch: arch.clone(),
            checksum: checksum.clone(),
            href: href.clone(),
        });

        Ok(ItemResult::succeeded(name, item.content_type.category())
            .with_reference(href)
            .with_arch(arch)
            .with_checksum(checksum))
    }

    // =========================================================================
    // RESULTS PUBLICATION
    // =========================================================================

    /// Upload the results document and write its URL/digest. Not retried;
    /// every failure becomes a warning on `report`.
    pub async fn publish_results(&self, report: &mut Report, ctx: &UploadContext, dest: &ResultsDestination) {
        let uploaded = resilient_lock(&self.uploaded).clone();
        let refs = &ctx.repositories;

        let artifacts: serde_json::Map<String, serde_json::Value> = uploaded
            .iter()
            .map(|a| {
                let entry = json!({
                    "content_type": a.content_type,
                    "labels": ctx.labels(&a.arch).0,
                    "sha256": a.checksum,
                    "url": artifact_url(refs, a),
                });
                (a.name.clone(), entry)
            })
            .collect();

        let document = json!({
            "artifacts": artifacts,
            "distributions": refs.distribution_urls(),
            "report": &*report,
        });
        let bytes = match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => bytes,
            Err(e) => {
                report.add_warning(RESULTS_FILE_NAME, e.to_string());
                return;
            }
        };
        let digest = crate::utils::sha256_hex(&bytes);

        match self.upload_results_document(ctx, bytes).await {
            Ok(url) => {
                tracing::info!("Results available at {}", url);
                if let Some(path) = &dest.url_path {
                    write_result_file(report, path, &url).await;
                }
                if let Some(path) = &dest.digest_path {
                    write_result_file(report, path, &format!("sha256:{}", digest)).await;
                }
                report.results_url = Some(url);
            }
            Err(err) => report.add_warning(RESULTS_FILE_NAME, err.to_string()),
        }

        if let Some(path) = &dest.sbom_results {
            match uploaded.iter().find(|a| a.content_type == ContentType::Sbom) {
                Some(sbom) => {
                    let line = format!("{}@sha256:{}", artifact_url(refs, sbom), sbom.checksum);
                    write_result_file(report, path, &line).await;
                }
                None => report.add_warning(path.display().to_string(), "no SBOM was uploaded"),
            }
        }
    }

    async fn upload_results_document(&self, ctx: &UploadContext, bytes: Vec<u8>) -> PulpResult<String> {
        let relative_path = format!("{}/{}", ctx.build_id, RESULTS_FILE_NAME);
        let target = &ctx.repositories.artifacts;
        let response = self
            .gateway
            .create_file_content(
                Some(&target.content_target),
                FileSource::Bytes {
                    name: RESULTS_FILE_NAME.to_string(),
                    data: bytes,
                },
                &relative_path,
                &ctx.labels(NOARCH),
            )
            .await?;
        let created = TaskPoller::new(self.gateway)
            .created_hrefs(response, ctx.task_timeout)
            .await?;

        Ok(match &target.distribution_url {
            Some(base) => join_url(base, &relative_path),
            None => content_href(&created, RESULTS_FILE_NAME)?,
        })
    }
}

/// Time a single task wait may take: the per-task timeout, capped by
/// whatever is left before `until`.
fn poll_budget(task_timeout: Duration, until: Option<Instant>) -> Duration {
    match until {
        Some(until) => task_timeout.min(until.saturating_duration_since(Instant::now())),
        None => task_timeout,
    }
}

/// Pick the content unit out of a task's created resources (which may also
/// list a new repository version).
fn content_href(created: &[String], name: &str) -> PulpResult<String> {
    created
        .iter()
        .find(|href| href.contains("/content/"))
        .or_else(|| created.first())
        .cloned()
        .ok_or_else(|| PulpError::InvalidResponse {
            operation: format!("upload {}", name),
            message: "no content href returned".to_string(),
        })
}

fn join_url(base: &str, relative: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), relative.trim_start_matches('/'))
}

/// Public URL of an uploaded artifact, matching the download layout.
fn artifact_url(refs: &RepositoryRefs, artifact: &UploadedArtifact) -> String {
    let target = refs.for_content(artifact.content_type);
    match &target.distribution_url {
        Some(base) if artifact.content_type == ContentType::Rpm => {
            join_url(base, &format!("Packages/l/{}", artifact.name))
        }
        Some(base) => join_url(base, &artifact.name),
        None => artifact.href.clone(),
    }
}

async fn write_result_file(report: &mut Report, path: &Path, content: &str) {
    if let Err(e) = tokio::fs::write(path, content).await {
        report.add_warning(path.display().to_string(), e.to_string());
    }
}

// =============================================================================
// DIRECTORY SCAN
// =============================================================================

/// Collect uploads from a build output directory: `*.rpm` at the root, plus
/// `*.rpm` and `*.log` inside supported-architecture subdirectories.
pub fn scan_rpm_directory(dir: &Path) -> PulpResult<Vec<UploadItem>> {
    if !dir.is_dir() {
        return Err(PulpError::Config(format!("not a directory: {}", dir.display())));
    }

    let mut items: Vec<UploadItem> = files_with_extension(dir, "rpm")?
        .into_iter()
        .map(|p| UploadItem::new(p, ContentType::Rpm))
        .collect();

    for arch in SUPPORTED_ARCHITECTURES {
        let arch_dir = dir.join(arch);
        if !arch_dir.is_dir() {
            tracing::debug!("Skipping {} - path does not exist: {}", arch, arch_dir.display());
            continue;
        }
        for path in files_with_extension(&arch_dir, "rpm")? {
            items.push(UploadItem::new(path, ContentType::Rpm).with_arch(Some(*arch)));
        }
        for path in files_with_extension(&arch_dir, "log")? {
            items.push(UploadItem::new(path, ContentType::Log).with_arch(Some(*arch)));
        }
    }

    tracing::info!("Found {} file(s) under {}", items.len(), dir.display());
    Ok(items)
}

fn files_with_extension(dir: &Path, extension: &str) -> PulpResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == extension))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_poll_budget_shrinks_toward_deadline() {
        let task_timeout = Duration::from_secs(600);
        assert_eq!(poll_budget(task_timeout, None), task_timeout);

        let until = Instant::now() + Duration::from_secs(90);
        assert_eq!(poll_budget(task_timeout, Some(until)), Duration::from_secs(90));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(poll_budget(task_timeout, Some(until)), Duration::from_secs(30));
        assert_eq!(
            poll_budget(Duration::from_secs(10), Some(until)),
            Duration::from_secs(10)
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(poll_budget(task_timeout, Some(until)), Duration::ZERO);
    }

    #[test]
    fn test_parse_artifact_results() {
        let (url, digest) = ResultsDestination::parse_artifact_results("out/url, out/digest").unwrap();
        assert_eq!(url, PathBuf::from("out/url"));
        assert_eq!(digest, PathBuf::from("out/digest"));
        assert!(ResultsDestination::parse_artifact_results("only-one").is_err());
        assert!(ResultsDestination::parse_artifact_results(",x").is_err());
    }

    #[test]
    fn test_content_href_prefers_content_units() {
        let created = vec![
            "/pulp/api/v3/repositories/file/file/1/versions/2/".to_string(),
            "/pulp/api/v3/content/file/files/9/".to_string(),
        ];
        assert_eq!(content_href(&created, "x").unwrap(), "/pulp/api/v3/content/file/files/9/");
        assert!(content_href(&[], "x").is_err());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://h/rpms/", "Packages/l/a.rpm"), "https://h/rpms/Packages/l/a.rpm");
        assert_eq!(join_url("https://h/logs", "x86_64/b.log"), "https://h/logs/x86_64/b.log");
    }

    #[test]
    fn test_scan_rpm_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("x86_64")).unwrap();
        std::fs::create_dir_all(root.join("riscv64")).unwrap();
        std::fs::write(root.join("top.rpm"), b"x").unwrap();
        std::fs::write(root.join("notes.txt"), b"x").unwrap();
        std::fs::write(root.join("x86_64/pkg.x86_64.rpm"), b"x").unwrap();
        std::fs::write(root.join("x86_64/build.log"), b"x").unwrap();
        std::fs::write(root.join("riscv64/other.rpm"), b"x").unwrap();

        let items = scan_rpm_directory(root).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].content_type, ContentType::Rpm);
        assert_eq!(items[0].arch, None);
        assert_eq!(items[1].arch.as_deref(), Some("x86_64"));
        assert_eq!(items[2].content_type, ContentType::Log);
        assert_eq!(items[2].arch.as_deref(), Some("x86_64"));
    }

    #[test]
    fn test_scan_requires_directory() {
        assert!(scan_rpm_directory(Path::new("/nonexistent/rpms")).is_err());
    }
}
