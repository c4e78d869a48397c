// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestration.
//!
//! Fetches every manifest entry with at most `max_workers` in flight, places
//! it by content type and verifies its checksum. Each entry yields exactly
//! one result; a failed entry never affects its siblings.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────────────┐
//! │ Manifest │──▶│ JoinSet +     │──▶│ ArtifactFetcher  │
//! │ (filter) │   │ Semaphore(N)  │   │ (.part, sha256)  │
//! └──────────┘   └───────┬───────┘   └──────────────────┘
//!                        ▼
//!                ┌──────────────────┐
//!                │ ResultAggregator │
//!                └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulp_tool::api::PulpClient;
//! use pulp_tool::config::Config;
//! use pulp_tool::download::{DownloadOrchestrator, Manifest, OutputLayout};
//!
//! # async fn example() -> pulp_tool::errors::PulpResult<()> {
//! let client = Arc::new(PulpClient::new(&Config::load(None)?)?);
//! let manifest = Manifest::load("pulp_results.json", client.as_ref()).await?;
//! let report = DownloadOrchestrator::new(client)
//!     .with_max_workers(4)
//!     .download_batch(&manifest, &OutputLayout::new("out"))
//!     .await;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::api::ArtifactFetcher;
use crate::config::DEFAULT_MAX_WORKERS;
use crate::errors::{PulpError, PulpResult};
use crate::report::{ItemResult, Report, ResultAggregator};
use crate::utils::{normalize_checksum, sha256_file};

pub mod layout;
pub mod manifest;

pub use layout::OutputLayout;
pub use manifest::{Manifest, ManifestEntry, ManifestFilter};

/// Suffix of in-progress downloads.
const PART_SUFFIX: &str = ".part";

/// Runs downloads for a manifest.
pub struct DownloadOrchestrator<F: ArtifactFetcher + 'static> {
    fetcher: Arc<F>,
    max_workers: usize,
    deadline: Option<Duration>,
}

impl<F: ArtifactFetcher + 'static> DownloadOrchestrator<F> {
    pub fn new(fetcher: Arc<F>) -> Self {
        Self {
            fetcher,
            max_workers: DEFAULT_MAX_WORKERS,
            deadline: None,
        }
    }

    /// Concurrent fetch limit (at least 1).
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Overall time limit. Entries still in flight when it passes are
    /// recorded as `DeadlineExceeded`.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Download every entry of `manifest` below `layout`.
    pub async fn download_batch(&self, manifest: &Manifest, layout: &OutputLayout) -> Report {
        let aggregator = Arc::new(ResultAggregator::new());
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut workers = JoinSet::new();
        let mut destinations: Vec<Option<PathBuf>> = Vec::with_capacity(manifest.len());
        let mut claimed: HashSet<PathBuf> = HashSet::with_capacity(manifest.len());

        tracing::info!(
            "Downloading {} artifact(s) with {} worker(s)",
            manifest.len(),
            self.max_workers
        );

        for (seq, entry) in manifest.entries.iter().enumerate() {
            let dest = match layout.path_for(entry) {
                Ok(dest) => dest,
                Err(err) => {
                    aggregator.record(seq, failed_item(entry, &err));
                    destinations.push(None);
                    continue;
                }
            };
            // First entry keeps the path; later ones would race on its .part file.
            if !claimed.insert(dest.clone()) {
                let err = PulpError::DestinationConflict {
                    url: entry.url.clone(),
                    path: dest,
                };
                tracing::warn!("Skipping download: {}", err);
                aggregator.record(seq, failed_item(entry, &err));
                destinations.push(None);
                continue;
            }
            destinations.push(Some(dest.clone()));

            let entry = entry.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            let aggregator = Arc::clone(&aggregator);

            workers.spawn(async move {
                // The semaphore is never closed.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = match fetch_entry(fetcher.as_ref(), &entry, &dest).await {
                    Ok(checksum) => {
                        tracing::info!("Downloaded {} to {}", entry.url, dest.display());
                        ItemResult::succeeded(entry_id(&entry), entry.content_type.category())
                            .with_reference(dest.display().to_string())
                            .with_arch(entry.arch.clone())
                            .with_checksum(checksum)
                    }
                    Err(err) => {
                        tracing::warn!("Download of {} failed: {}", entry.url, err);
                        failed_item(&entry, &err)
                    }
                };
                aggregator.record(seq, result);
            });
        }

        let deadline_hit = match self.deadline {
            Some(limit) => {
                let drained = tokio::time::timeout(limit, drain(&mut workers)).await;
                if drained.is_err() {
                    tracing::error!("Download deadline of {}s passed; aborting in-flight fetches", limit.as_secs());
                    workers.abort_all();
                    drain(&mut workers).await;
                    true
                } else {
                    false
                }
            }
            None => {
                drain(&mut workers).await;
                false
            }
        };

        // Anything unrecorded was aborted or its worker panicked.
        for (seq, entry) in manifest.entries.iter().enumerate() {
            if aggregator.is_recorded(seq) {
                continue;
            }
            if let Some(Some(dest)) = destinations.get(seq) {
                let _ = tokio::fs::remove_file(part_path(dest)).await;
            }
            let err = if deadline_hit {
                PulpError::DeadlineExceeded {
                    operation: format!("download {}", entry.url),
                }
            } else {
                PulpError::Io(std::io::Error::other("download worker aborted"))
            };
            aggregator.record(seq, failed_item(entry, &err));
        }

        aggregator.finalize()
    }
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!("Download worker panicked: {}", e);
            }
        }
    }
}

/// Fetch one entry into place. Returns the hex SHA-256 of the written bytes.
async fn fetch_entry<F: ArtifactFetcher + ?Sized>(
    fetcher: &F,
    entry: &ManifestEntry,
    dest: &Path,
) -> PulpResult<String> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(dest);

    let result = async {
        let bytes = fetcher.fetch_to(&entry.url, &part).await?;
        let actual = sha256_file(&part).await?;
        if let Some(expected) = entry.checksum.as_deref() {
            let expected = normalize_checksum(expected);
            if expected != actual {
                return Err(PulpError::IntegrityMismatch {
                    name: entry_id(entry),
                    expected,
                    actual,
                });
            }
        }
        tokio::fs::rename(&part, dest).await?;
        tracing::debug!("Wrote {} bytes to {}", bytes, dest.display());
        Ok(actual)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn entry_id(entry: &ManifestEntry) -> String {
    entry
        .file_name()
        .map(str::to_string)
        .unwrap_or_else(|_| entry.url.clone())
}

fn failed_item(entry: &ManifestEntry, err: &PulpError) -> ItemResult {
    let mut item = ItemResult::failed(entry_id(entry), entry.content_type.category(), err);
    item.arch = Some(entry.arch.clone());
    item
}
