// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! pulp-tool - content-management client library
//!
//! Upload build artifacts, wait on server tasks, pull artifacts back down.
//!
//! **Upload** -> **Task Poller** -> **Report** <- **Download**
//!
//! # Core Modules
//!
//! - [`api`] - Gateway traits and the HTTP client implementing them
//! - [`tasks`] - Polling asynchronous server tasks to completion
//! - [`upload`] - Batch uploads, architecture detection, results publication
//! - [`download`] - Manifest parsing and bounded concurrent downloads
//! - [`report`] - Per-item results and the aggregated batch report
//! - [`config`] - JSON configuration with base64 and environment support
//! - [`errors`] - Typed error taxonomy
//! - [`error`] - Consistent error formatting utilities

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod errors;
pub mod report;
pub mod tasks;
pub mod types;
pub mod upload;
pub mod utils;

// Re-export commonly used types
pub use types::{Category, ContentType, Labels, SUPPORTED_ARCHITECTURES};

// Re-export the gateway
pub use api::{
    ArtifactFetcher, ContentApi, CreateResponse, DistributionApi, PulpClient, RepositoryApi,
    RepositoryManager, RepositoryRefs, Task, TaskApi, TaskHref, TaskState, UploadGateway,
};

// Re-export orchestration
pub use download::{DownloadOrchestrator, Manifest, ManifestEntry, ManifestFilter, OutputLayout};
pub use report::{ItemResult, Report, ResultAggregator, ResultWriteWarning};
pub use tasks::{BackoffPolicy, TaskPoller, TerminalTask};
pub use upload::{scan_rpm_directory, ResultsDestination, UploadContext, UploadItem, UploadOrchestrator};

pub use config::Config;
pub use utils::mask_sensitive;

// Re-export error utilities
pub use error::{describe, Diagnosis};
pub use errors::{PulpError, PulpResult};
