// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote API gateway.
//!
//! The gateway is split into small traits so each orchestrator only depends
//! on the calls it makes. [`PulpClient`] implements all of them over HTTP;
//! tests substitute in-memory fakes.

use std::path::Path;

use async_trait::async_trait;

use crate::errors::PulpResult;
use crate::types::Labels;

pub mod client;
pub mod models;
pub mod repositories;

pub use client::PulpClient;
pub use models::{
    CreateResponse, Distribution, FileSource, Repository, RepositoryKind, Task, TaskHref,
    TaskState,
};
pub use repositories::{RepositoryManager, RepositoryRefs, RepositoryTarget};

/// Task status queries.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Fetch the current state of a task. One request, no retries.
    async fn get_task(&self, href: &TaskHref) -> PulpResult<Task>;
}

/// Content creation.
#[async_trait]
pub trait ContentApi: Send + Sync {
    /// Upload an RPM package. The server extracts the package metadata.
    async fn upload_rpm(
        &self,
        path: &Path,
        relative_path: &str,
        labels: &Labels,
    ) -> PulpResult<CreateResponse>;

    /// Create file content, optionally adding it to `repository` in the same call.
    async fn create_file_content(
        &self,
        repository: Option<&str>,
        source: FileSource,
        relative_path: &str,
        labels: &Labels,
    ) -> PulpResult<CreateResponse>;
}

/// Repository lookup, creation and modification.
#[async_trait]
pub trait RepositoryApi: Send + Sync {
    async fn find_repository(&self, kind: RepositoryKind, name: &str)
        -> PulpResult<Option<Repository>>;

    async fn create_repository(&self, kind: RepositoryKind, name: &str)
        -> PulpResult<CreateResponse>;

    /// Add content units to a repository, producing a new version.
    async fn add_content(
        &self,
        repository_href: &str,
        content_hrefs: &[String],
    ) -> PulpResult<CreateResponse>;

    /// Fetch a resource by href (used to read back created repositories).
    async fn get_repository(&self, href: &str) -> PulpResult<Repository>;
}

/// Distribution lookup and creation.
#[async_trait]
pub trait DistributionApi: Send + Sync {
    async fn find_distribution(
        &self,
        kind: RepositoryKind,
        name: &str,
    ) -> PulpResult<Option<Distribution>>;

    async fn create_distribution(
        &self,
        kind: RepositoryKind,
        name: &str,
        base_path: &str,
        repository_href: &str,
    ) -> PulpResult<CreateResponse>;
}

/// Plain artifact retrieval for downloads.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Stream `url` into `dest`, returning the number of bytes written.
    async fn fetch_to(&self, url: &str, dest: &Path) -> PulpResult<u64>;

    /// Fetch a small document (manifests) into memory.
    async fn fetch_bytes(&self, url: &str) -> PulpResult<Vec<u8>>;
}

/// Everything the upload path needs from the server.
pub trait UploadGateway: TaskApi + ContentApi + RepositoryApi + DistributionApi {}

impl<T> UploadGateway for T where T: TaskApi + ContentApi + RepositoryApi + DistributionApi {}
